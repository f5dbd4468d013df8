use crate::AsyncWrite;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Write out `to_write` and then flush if `to_write_flush_after` is set.
///
/// Written bytes are drained from the front of the buffer, so a `Pending`
/// leaves exactly the unwritten remainder behind.
#[instrument(skip(cx, io, to_write, to_write_flush_after))]
pub(crate) fn try_write<S: AsyncWrite + Unpin>(
    cx: &mut Context,
    io: &mut S,
    to_write: &mut Vec<u8>,
    to_write_flush_after: &mut bool,
) -> Poll<io::Result<()>> {
    while !to_write.is_empty() {
        trace!("try_write left: {}", to_write.len());

        match Pin::new(&mut *io).poll_write(cx, to_write) {
            // the transport is full, adapters can still make progress meanwhile.
            Poll::Pending => return Poll::Pending,

            Poll::Ready(Ok(0)) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "Write returned 0")).into();
            }

            Poll::Ready(Ok(amount)) => {
                trace!("try_write did write: {}", amount);
                to_write.drain(..amount);
            }

            Poll::Ready(Err(e)) => {
                trace!("try_write error: {:?}", e);
                return Err(e).into();
            }
        }
    }

    if *to_write_flush_after {
        trace!("try_write attempt flush");
        match Pin::new(&mut *io).poll_flush(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(())) => {
                trace!("try_write flushed");
                *to_write_flush_after = false;
            }
            Poll::Ready(Err(e)) => {
                trace!("try_write error: {:?}", e);
                return Err(e).into();
            }
        }
    }

    Ok(()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::task::noop_waker;

    /// Accepts at most `step` bytes per write and every other call is pending.
    struct Trickle {
        written: Vec<u8>,
        step: usize,
        ready: bool,
        flushed: bool,
    }

    impl AsyncWrite for Trickle {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.ready = !self.ready;
            if !self.ready {
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            let n = buf.len().min(self.step);
            self.written.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }
        fn poll_flush(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.flushed = true;
            Poll::Ready(Ok(()))
        }
        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn pending_keeps_the_remainder() {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut io = Trickle {
            written: vec![],
            step: 3,
            ready: false,
            flushed: false,
        };
        let mut buf = b"hello world".to_vec();
        let mut flush = true;

        let mut rounds = 0;
        while try_write(&mut cx, &mut io, &mut buf, &mut flush).is_pending() {
            rounds += 1;
            assert!(!io.flushed);
        }

        assert!(rounds > 0);
        assert!(buf.is_empty());
        assert!(!flush);
        assert!(io.flushed);
        assert_eq!(io.written, b"hello world");
    }
}
