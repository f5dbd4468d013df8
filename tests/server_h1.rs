use hreq_exchange::{Error, Exchange, HttpError, ServerConfig, Service};
use std::time::Duration;

mod common;

fn echo_path(ex: &mut Exchange) -> Result<(), HttpError> {
    let path = ex.request().path().to_string();
    ex.response_mut().body().string(path)?;
    Ok(())
}

#[async_std::test]
async fn server_request_200_ok() -> Result<(), Error> {
    let server = common::serve(Service::new(echo_path)).await?;
    let mut client = server.connect().await?;

    client.send(b"GET /path HTTP/1.1\r\n\r\n").await?;

    let res = client.read_response().await?;
    assert_eq!(res.head, "HTTP/1.1 200 OK\r\ncontent-length: 5");
    assert_eq!(res.body_str(), "/path");

    Ok(())
}

#[async_std::test]
async fn server_pipelined_responses_keep_request_order() -> Result<(), Error> {
    let service = Service::new(|ex: &mut Exchange| -> Result<(), HttpError> {
        if ex.request().path() == "/slow" {
            let mut tx = ex.response_mut().body().stream()?;
            async_std::task::spawn(async move {
                async_std::task::sleep(Duration::from_millis(100)).await;
                tx.send("slow").await.ok();
            });
        } else {
            ex.response_mut().body().string("fast")?;
        }
        Ok(())
    });

    let server = common::serve(service).await?;
    let mut client = server.connect().await?;

    client
        .send(b"GET /slow HTTP/1.1\r\n\r\nGET /fast HTTP/1.1\r\n\r\n")
        .await?;

    let first = client.read_response().await?;
    let second = client.read_response().await?;

    assert_eq!(first.body_str(), "slow");
    assert_eq!(second.body_str(), "fast");

    Ok(())
}

#[async_std::test]
async fn server_http10_closes_after_response() -> Result<(), Error> {
    let server = common::serve(Service::new(echo_path)).await?;
    let mut client = server.connect().await?;

    client.send(b"GET /old HTTP/1.0\r\n\r\n").await?;

    let res = client.read_response().await?;
    assert!(res.head.starts_with("HTTP/1.0 200 OK\r\n"));
    assert_eq!(res.body_str(), "/old");
    assert!(client.is_closed().await?);

    Ok(())
}

#[async_std::test]
async fn server_connection_close_is_honored() -> Result<(), Error> {
    let server = common::serve(Service::new(echo_path)).await?;
    let mut client = server.connect().await?;

    client
        .send(b"GET /a HTTP/1.1\r\nconnection: close\r\n\r\nGET /b HTTP/1.1\r\n\r\n")
        .await?;

    let res = client.read_response().await?;
    assert_eq!(res.body_str(), "/a");
    assert_eq!(res.header("connection"), Some("close"));
    assert!(client.is_closed().await?);

    Ok(())
}

#[async_std::test]
async fn server_streamed_response_is_chunked() -> Result<(), Error> {
    let service = Service::new(|ex: &mut Exchange| -> Result<(), HttpError> {
        let mut tx = ex.response_mut().body().stream()?;
        async_std::task::spawn(async move {
            for part in &["one ", "two ", "three"] {
                if tx.send(*part).await.is_err() {
                    return;
                }
            }
        });
        Ok(())
    });

    let server = common::serve(service).await?;
    let mut client = server.connect().await?;

    client.send(b"GET / HTTP/1.1\r\n\r\n").await?;

    let res = client.read_response().await?;
    assert_eq!(res.body_str(), "one two three");

    // a single part would have been sent with content-length.
    if res.header("content-length").is_none() {
        assert_eq!(res.header("transfer-encoding"), Some("chunked"));
    }

    Ok(())
}

#[async_std::test]
async fn server_chunked_request_body_reaches_handler() -> Result<(), Error> {
    let service = Service::new(|ex: &mut Exchange| -> Result<(), HttpError> {
        let body = ex
            .request_mut()
            .take_body()
            .ok_or_else(|| HttpError::BadRequest("no body".into()))?;
        let mut tx = ex.response_mut().body().stream()?;
        async_std::task::spawn(async move {
            match body.collect().await {
                Ok(data) => {
                    tx.send(data).await.ok();
                }
                Err(e) => tx.abort(e),
            }
        });
        Ok(())
    });

    let server = common::serve(service).await?;
    let mut client = server.connect().await?;

    client
        .send(b"POST /echo HTTP/1.1\r\ntransfer-encoding: chunked\r\n\r\n3\r\nabc\r\n4\r\ndefg\r\n0\r\n\r\n")
        .await?;

    let res = client.read_response().await?;
    assert_eq!(res.status(), 200);
    assert_eq!(res.body_str(), "abcdefg");

    Ok(())
}

#[async_std::test]
async fn server_content_length_request_body() -> Result<(), Error> {
    let service = Service::new(|ex: &mut Exchange| -> Result<(), HttpError> {
        let body = ex
            .request_mut()
            .take_body()
            .ok_or_else(|| HttpError::BadRequest("no body".into()))?;
        let mut tx = ex.response_mut().body().stream()?;
        async_std::task::spawn(async move {
            if let Ok(data) = body.collect().await {
                tx.send(format!("{}", data.len())).await.ok();
            }
        });
        Ok(())
    });

    let server = common::serve(service).await?;
    let mut client = server.connect().await?;

    let big = vec![b'x'; 100_000];
    let mut req = format!("POST / HTTP/1.1\r\ncontent-length: {}\r\n\r\n", big.len()).into_bytes();
    req.extend_from_slice(&big);
    client.send(&req).await?;

    let res = client.read_response().await?;
    assert_eq!(res.body_str(), "100000");

    Ok(())
}

#[async_std::test]
async fn server_head_request_has_no_body() -> Result<(), Error> {
    let server = common::serve(Service::new(echo_path)).await?;
    let mut client = server.connect().await?;

    client
        .send(b"HEAD /x HTTP/1.1\r\n\r\nGET /y HTTP/1.1\r\n\r\n")
        .await?;

    let head = client.read_response_to(true).await?;
    assert_eq!(head.header("content-length"), Some("2"));
    assert!(head.body.is_empty());

    let get = client.read_response().await?;
    assert_eq!(get.body_str(), "/y");

    Ok(())
}

#[async_std::test]
async fn server_line_too_long_is_414() -> Result<(), Error> {
    let config = ServerConfig {
        max_initial_line_length: 64,
        ..ServerConfig::default()
    };
    let service = Service::new(echo_path).with_config(config)?;

    let server = common::serve(service).await?;
    let mut client = server.connect().await?;

    let long = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(200));
    client.send(long.as_bytes()).await?;

    let res = client.read_response().await?;
    assert_eq!(res.status(), 414);
    assert_eq!(res.header("connection"), Some("close"));
    assert!(client.is_closed().await?);

    Ok(())
}

#[async_std::test]
async fn server_handler_error_uses_error_handler() -> Result<(), Error> {
    let service = Service::new(|_: &mut Exchange| -> Result<(), HttpError> {
        Err(HttpError::BadRequest("nope".into()))
    });

    let server = common::serve(service).await?;
    let mut client = server.connect().await?;

    client.send(b"GET / HTTP/1.1\r\n\r\n").await?;

    let res = client.read_response().await?;
    assert_eq!(res.status(), 400);
    assert!(res.body_str().contains("nope"));

    Ok(())
}
