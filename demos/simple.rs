use futures::stream::StreamExt;
use hyper::service::service_fn;
use hyper_gateway_core::{Gateway, GatewayConfig, RouteParams, UpstreamBody, UpstreamConfig};
use hyper_util::{
    client::legacy::{
        connect::{dns::GaiResolver, HttpConnector},
        Client,
    },
    rt::{TokioExecutor, TokioIo},
};
use std::{convert::Infallible, net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;

type ProxyClient = Client<HttpConnector<GaiResolver>, UpstreamBody>;

// Requests to /gw/{upstream}/{path..} are forwarded.
fn route(path: &str) -> Option<(String, Vec<String>)> {
    let rest = path.strip_prefix("/gw/")?;
    let mut segments = rest.split('/');
    let key = segments.next().filter(|key| !key.is_empty())?.to_owned();

    Some((key, segments.map(str::to_owned).collect()))
}

#[tokio::main]
async fn main() {
    let config = GatewayConfig::new()
        .with_allowed_methods(["GET", "POST", "PUT", "PATCH"])
        .with_max_body_bytes(1 << 20)
        .with_client_app("warehouse-console")
        .with_upstream(
            "httpbin",
            UpstreamConfig::new("http://httpbin.org", ["/get", "/post", "/status", "/cookies"])
                .with_forward_cookies(true)
                .with_timeout_ms(5_000),
        );

    if let Err(err) = config.validate() {
        eprintln!("Refusing to start: {err}");
        return;
    }

    let client: ProxyClient = Client::builder(TokioExecutor::new()).build_http();
    let gateway = Arc::new(Gateway::new(config, client));

    let addr = SocketAddr::from(([127, 0, 0, 1], 8000));
    let server = TcpListenerStream::new(
        TcpListener::bind(addr)
            .await
            .expect("Could not bind ip:port."),
    )
    .for_each(move |stream| {
        let gateway = gateway.clone();
        async move {
            let stream = stream.unwrap();
            let client_ip = stream.peer_addr().unwrap().ip();
            let io = TokioIo::new(stream);
            tokio::task::spawn(async move {
                let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                    let gateway = gateway.clone();
                    async move {
                        let (key, path) = route(req.uri().path()).unwrap_or_default();
                        let params =
                            RouteParams::new(key, path).with_forwarded_for(client_ip.to_string());

                        Ok::<_, Infallible>(gateway.handle(req, params).await)
                    }
                });

                if let Err(err) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await
                {
                    println!("Error serving connection: {:?}", err);
                }
            });
        }
    });

    println!("Running gateway on {:?}", addr);

    server.await;
}
