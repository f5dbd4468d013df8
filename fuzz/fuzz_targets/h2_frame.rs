#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    hreq_exchange::fuzz::h2_decode(data);
});
