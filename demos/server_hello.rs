use async_std::net::TcpListener;
use hreq_exchange::routing::Router;
use hreq_exchange::{server, Error, Exchange, HttpError, ServerConfig, SseEvent, Service};
use http::Method;
use std::time::Duration;

#[async_std::main]
async fn main() -> Result<(), Error> {
    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };

    let router = Router::new();

    router
        .route()
        .path("/hello/{name}", false)
        .method(Method::GET)
        .produces("text/plain")
        .handler(|ex: &mut Exchange| -> Result<(), HttpError> {
            let name = ex.request().path_param("name").unwrap_or("world").to_string();
            ex.response_mut().body().string(format!("Hello {}!\n", name))?;
            Ok(())
        })?
        .route()
        .path("/ticks", false)
        .method(Method::GET)
        .handler(|ex: &mut Exchange| -> Result<(), HttpError> {
            let mut sse = ex.response_mut().body().sse()?;
            async_std::task::spawn(async move {
                for i in 0..5 {
                    let event = SseEvent::new().id(i.to_string()).data("tick");
                    if sse.send(event).await.is_err() {
                        return;
                    }
                    async_std::task::sleep(Duration::from_secs(1)).await;
                }
            });
            Ok(())
        })?;

    let service = Service::new(router).with_config(config)?;

    let l = TcpListener::bind("127.0.0.1:3000").await?;
    println!("Listening to {:?}", l.local_addr()?);

    loop {
        let (tcp, _) = l.accept().await?;
        let service = service.clone();

        async_std::task::spawn(async move {
            if let Err(e) = server::handshake(tcp, service).await {
                println!("Connection failed: {}", e);
            }
        });
    }
}
