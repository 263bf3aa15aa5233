use async_trait::async_trait;
use futures::stream::StreamExt;
use http_body_util::{BodyExt, Full};
use hyper::{
    body::Bytes, ext::ReasonPhrase, header, service::service_fn, Request, Response, StatusCode,
};
use hyper_gateway_core::{
    BoxError, Gateway, GatewayBody, GatewayConfig, RouteParams, UpstreamBody, UpstreamClient,
};
use hyper_util::{
    client::legacy::{
        connect::{dns::GaiResolver, HttpConnector},
        Client,
    },
    rt::{TokioExecutor, TokioIo},
};
use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::oneshot::Sender, task::JoinHandle};
use tokio_stream::wrappers::TcpListenerStream;
use tokiotest_httpserver::take_port;

lazy_static::lazy_static! {
    static ref UPSTREAM_CLIENT: Client<HttpConnector<GaiResolver>, UpstreamBody> = {
        Client::builder(TokioExecutor::new()).build_http()
    };
}

/// Public host name every test upstream is configured with.
pub const UPSTREAM_BASE_URL: &str = "http://orders.example.com";

/// Sends every upstream request to the local mock upstream, keeping the
/// configured host in the `host` header.
pub struct PinnedClient {
    port: u16,
}

#[async_trait]
impl UpstreamClient for PinnedClient {
    async fn send(&self, mut request: Request<UpstreamBody>) -> Result<Response<GatewayBody>, BoxError> {
        let path_and_query = request
            .uri()
            .path_and_query()
            .map(|value| value.as_str().to_owned())
            .unwrap_or_else(|| "/".to_owned());

        *request.uri_mut() = format!("http://127.0.0.1:{}{}", self.port, path_and_query).parse()?;

        UPSTREAM_CLIENT.send(request).await
    }
}

fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(Full::new(body.into()))
        .unwrap()
}

async fn upstream(req: Request<hyper::body::Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/api/echo" | "/apikey/echo" => {
            let header = |name: &str| {
                req.headers()
                    .get(name)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_owned)
            };
            let echo = serde_json::json!({
                "method": req.method().as_str(),
                "path": req.uri().path(),
                "query": req.uri().query(),
                "host": header("host"),
                "requestId": header("x-request-id"),
                "authorization": header("authorization"),
                "cookie": header("cookie"),
                "userAgent": header("user-agent"),
                "clientApp": header("x-client-app"),
                "forwardedFor": header("x-forwarded-for"),
                "secret": header("x-internal-secret"),
            });
            let mut response = respond(StatusCode::OK, "application/json", echo.to_string());
            response
                .headers_mut()
                .insert("x-upstream", "orders".parse().unwrap());
            response
        }
        "/api/upload" => {
            let body = req.into_body().collect().await.unwrap().to_bytes();
            respond(StatusCode::CREATED, "text/plain", body.len().to_string())
        }
        "/api/cookies" => {
            let mut response = respond(StatusCode::OK, "text/plain", "cookies");
            response
                .headers_mut()
                .append(header::SET_COOKIE, "a=1".parse().unwrap());
            response
                .headers_mut()
                .append(header::SET_COOKIE, "b=2".parse().unwrap());
            response
        }
        "/api/slow" => {
            tokio::time::sleep(Duration::from_millis(200)).await;
            respond(StatusCode::OK, "text/plain", "slow")
        }
        "/api/problem" => {
            let mut response = respond(
                StatusCode::UNPROCESSABLE_ENTITY,
                "application/problem+json",
                r#"{"type":"https://errors.example.com/validation","title":"Validation failed","status":422,"detail":"sku is required","errors":{"sku":["is required"]}}"#,
            );
            response
                .headers_mut()
                .append(header::SET_COOKIE, "flash=1".parse().unwrap());
            response
        }
        "/api/broken-problem" => respond(
            StatusCode::BAD_REQUEST,
            "application/problem+json",
            "definitely not json",
        ),
        "/api/redirect" => {
            let mut response = respond(StatusCode::FOUND, "text/plain", "");
            response
                .headers_mut()
                .insert(header::LOCATION, "/api/echo".parse().unwrap());
            response
        }
        "/api/maintenance" => {
            let mut response = respond(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "back soon");
            response
                .extensions_mut()
                .insert(ReasonPhrase::from_static(b"Back Soon"));
            response
        }
        _ => {
            let mut response =
                respond(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "down for maintenance");
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, "120".parse().unwrap());
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, "Bearer realm=\"orders\"".parse().unwrap());
            response
                .headers_mut()
                .append(header::SET_COOKIE, "session=expired".parse().unwrap());
            response
        }
    };

    Ok(response)
}

pub struct SpawnServerReturn {
    pub shutdown_tx: Sender<()>,
    pub server_handle: JoinHandle<()>,
    pub port: u16,
}

pub async fn spawn_upstream() -> SpawnServerReturn {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let port = take_port();

    let server = TcpListenerStream::new(
        TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port)))
            .await
            .unwrap(),
    )
    .take_until(shutdown_rx)
    .for_each(move |stream| async move {
        let stream = stream.unwrap();
        let io = TokioIo::new(stream);
        tokio::task::spawn(async move {
            if let Err(err) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service_fn(upstream))
                .await
            {
                println!("Error serving connection: {:?}", err);
            }
        });
    });

    let server_handle = tokio::spawn(server);

    SpawnServerReturn {
        shutdown_tx,
        server_handle,
        port,
    }
}

pub fn gateway(config: GatewayConfig, upstream_port: u16) -> Gateway<PinnedClient> {
    Gateway::new(config, PinnedClient { port: upstream_port })
}

/// Serves `gateway` under `/gw/{upstream}/{path..}`.
pub async fn spawn_gateway(gateway: Gateway<PinnedClient>) -> SpawnServerReturn {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let port = take_port();
    let gateway = Arc::new(gateway);

    let server = TcpListenerStream::new(
        TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port)))
            .await
            .unwrap(),
    )
    .take_until(shutdown_rx)
    .for_each(move |stream| {
        let gateway = gateway.clone();
        async move {
            let stream = stream.unwrap();
            let client_ip = stream.peer_addr().unwrap().ip();
            let io = TokioIo::new(stream);
            tokio::task::spawn(async move {
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let gateway = gateway.clone();
                    async move {
                        let mut segments = req.uri().path().trim_start_matches('/').split('/');
                        let _prefix = segments.next();
                        let key = segments.next().unwrap_or_default().to_owned();
                        let path: Vec<String> = segments.map(str::to_owned).collect();

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

    let server_handle = tokio::spawn(server);

    SpawnServerReturn {
        shutdown_tx,
        server_handle,
        port,
    }
}

pub async fn read_body(response: Response<GatewayBody>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

pub async fn read_json(response: Response<GatewayBody>) -> serde_json::Value {
    serde_json::from_slice(&read_body(response).await).unwrap()
}
