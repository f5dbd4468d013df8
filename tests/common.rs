#![allow(dead_code)]

use async_std::net::{TcpListener, TcpStream};
use futures_util::{AsyncReadExt, AsyncWriteExt};
use hreq_exchange::{server, Error, Service};
use std::sync::Once;

/// A server accepting connections on a random local port until the test ends.
pub struct TestServer {
    addr: String,
}

pub async fn serve(service: Service) -> Result<TestServer, Error> {
    setup_logger();

    let l = TcpListener::bind("127.0.0.1:0").await?;
    let addr = l.local_addr()?.to_string();

    async_std::task::spawn(async move {
        while let Ok((tcp, _)) = l.accept().await {
            let service = service.clone();
            async_std::task::spawn(async move {
                if let Err(e) = server::handshake(tcp, service).await {
                    log::debug!("Test connection ended: {}", e);
                }
            });
        }
    });

    Ok(TestServer { addr })
}

impl TestServer {
    pub async fn connect(&self) -> Result<Client, Error> {
        let tcp = TcpStream::connect(&self.addr).await?;
        Ok(Client { tcp, buf: vec![] })
    }
}

/// Raw client side of a connection, reading exactly one response at a time.
pub struct Client {
    tcp: TcpStream,
    buf: Vec<u8>,
}

pub struct TestResponse {
    pub head: String,
    pub body: Vec<u8>,
}

impl TestResponse {
    pub fn status(&self) -> u16 {
        self.head
            .split(' ')
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    /// Header value by case insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        header_of(&self.head, name)
    }

    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap()
    }
}

fn header_of<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.split("\r\n").skip(1).find_map(|line| {
        let mut parts = line.splitn(2, ':');
        let n = parts.next()?;
        let v = parts.next()?;
        if n.eq_ignore_ascii_case(name) {
            Some(v.trim())
        } else {
            None
        }
    })
}

impl Client {
    pub async fn send(&mut self, raw: &[u8]) -> Result<(), Error> {
        self.tcp.write_all(raw).await?;
        Ok(())
    }

    /// Fill the buffer until it holds `n` bytes. `false` if the server closed first.
    async fn fill(&mut self, n: usize) -> Result<bool, Error> {
        let mut tmp = [0_u8; 8192];
        while self.buf.len() < n {
            let amount = self.tcp.read(&mut tmp).await?;
            if amount == 0 {
                return Ok(false);
            }
            self.buf.extend_from_slice(&tmp[..amount]);
        }
        Ok(true)
    }

    async fn take_until(&mut self, pat: &[u8]) -> Result<Vec<u8>, Error> {
        loop {
            if let Some(pos) = self.buf.windows(pat.len()).position(|w| w == pat) {
                let rest = self.buf.split_off(pos + pat.len());
                return Ok(std::mem::replace(&mut self.buf, rest));
            }
            let want = self.buf.len() + 1;
            if !self.fill(want).await? {
                panic!("Connection closed while waiting for {:?}", pat);
            }
        }
    }

    pub async fn take(&mut self, n: usize) -> Result<Vec<u8>, Error> {
        assert!(self.fill(n).await?, "Connection closed mid body");
        let rest = self.buf.split_off(n);
        Ok(std::mem::replace(&mut self.buf, rest))
    }

    /// Read one response to a request that was not HEAD.
    pub async fn read_response(&mut self) -> Result<TestResponse, Error> {
        self.read_response_to(false).await
    }

    pub async fn read_response_to(&mut self, head_request: bool) -> Result<TestResponse, Error> {
        let head = self.take_until(b"\r\n\r\n").await?;
        let head = String::from_utf8(head).unwrap();
        let head = head.trim_end().to_string();

        let status = head.split(' ').nth(1).unwrap_or("");
        let no_body = head_request || status == "204" || status == "304";

        let chunked = header_of(&head, "transfer-encoding")
            .map(|v| v.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false);
        let clen: Option<usize> = header_of(&head, "content-length").and_then(|v| v.parse().ok());

        let body = if no_body {
            vec![]
        } else if chunked {
            self.read_chunked().await?
        } else if let Some(n) = clen {
            self.take(n).await?
        } else {
            self.read_to_end().await?
        };

        Ok(TestResponse { head, body })
    }

    async fn read_chunked(&mut self) -> Result<Vec<u8>, Error> {
        let mut body = vec![];
        loop {
            let line = self.take_until(b"\r\n").await?;
            let line = String::from_utf8(line).unwrap();
            let size = usize::from_str_radix(line.trim(), 16).unwrap();
            if size == 0 {
                // trailers
                loop {
                    let t = self.take_until(b"\r\n").await?;
                    if t == b"\r\n" {
                        return Ok(body);
                    }
                }
            }
            body.extend(self.take(size).await?);
            let crlf = self.take(2).await?;
            assert_eq!(crlf, b"\r\n");
        }
    }

    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, Error> {
        let mut rest = std::mem::take(&mut self.buf);
        self.tcp.read_to_end(&mut rest).await?;
        Ok(rest)
    }

    /// Whether the server closed the connection with nothing more to read.
    pub async fn is_closed(&mut self) -> Result<bool, Error> {
        Ok(self.read_to_end().await?.is_empty())
    }
}

pub fn setup_logger() {
    static START: Once = Once::new();
    START.call_once(|| {
        let test_log = std::env::var("TEST_LOG")
            .map(|x| x != "0" && x.to_lowercase() != "false")
            .unwrap_or(false);
        let level = if test_log {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Info
        };
        pretty_env_logger::formatted_builder()
            .filter_level(log::LevelFilter::Warn)
            .filter_module("hreq_exchange", level)
            .target(env_logger::Target::Stdout)
            .init();
    });
}
