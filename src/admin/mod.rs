//! Management HTTP endpoint
//!
//! Serves the Prometheus scrape endpoint plus a small JSON API over the
//! broker's live tables:
//!
//! - `GET /metrics`, `GET /health`
//! - `GET /api/v1/connections`
//! - `GET|DELETE /api/v1/connections/{client_id}`
//! - `GET /api/v1/sessions/{client_id}`
//! - `GET /api/v1/cluster`

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::broker::Broker;

/// HTTP server for metrics and administration
pub struct AdminServer {
    broker: Arc<Broker>,
    addr: SocketAddr,
}

impl AdminServer {
    pub fn new(broker: Arc<Broker>, addr: SocketAddr) -> Self {
        Self { broker, addr }
    }

    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("Admin server listening on http://{}", self.addr);
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(
        self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let broker = self.broker.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let broker = broker.clone();
                    async move {
                        Ok::<_, Infallible>(
                            handle_request(&broker, req.method(), req.uri().path()).await,
                        )
                    }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving admin connection: {:?}", err);
                }
            });
        }
    }
}

fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

fn respond_json(status: StatusCode, body: &impl serde::Serialize) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => respond(status, "application/json", bytes),
        Err(e) => {
            error!("Failed to encode response: {}", e);
            respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "encode failure")
        }
    }
}

fn not_found(what: &str) -> Response<Full<Bytes>> {
    respond_json(StatusCode::NOT_FOUND, &json!({ "msg": format!("{} not found", what) }))
}

/// Route one request
pub(crate) async fn handle_request(
    broker: &Arc<Broker>,
    method: &Method,
    path: &str,
) -> Response<Full<Bytes>> {
    debug!(%method, path, "admin request");

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match (method.as_str(), segments.as_slice()) {
        ("GET", ["metrics"]) => {
            broker.refresh_metrics();
            match broker.metrics().render() {
                Ok((content_type, body)) => respond(StatusCode::OK, &content_type, body),
                Err(e) => {
                    error!("Failed to encode metrics: {}", e);
                    respond(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "text/plain",
                        "Failed to encode metrics",
                    )
                }
            }
        }
        ("GET", ["health"]) | ("GET", ["healthz"]) => {
            respond(StatusCode::OK, "text/plain", "OK")
        }
        ("GET", ["api", "v1", "connections"]) => {
            let connections = broker.connections();
            respond_json(
                StatusCode::OK,
                &json!({ "count": connections.len(), "connections": connections }),
            )
        }
        ("GET", ["api", "v1", "connections", client_id]) => {
            match broker.connection(client_id) {
                Some(info) => respond_json(StatusCode::OK, &info),
                None => not_found("client"),
            }
        }
        ("DELETE", ["api", "v1", "connections", client_id]) => {
            if broker.close_client(client_id).await {
                respond_json(StatusCode::OK, &json!({ "code": 0 }))
            } else {
                not_found("client")
            }
        }
        ("GET", ["api", "v1", "sessions", client_id]) => match broker.session(client_id) {
            Some(session) => respond_json(StatusCode::OK, &session),
            None => not_found("session"),
        },
        ("GET", ["api", "v1", "cluster"]) => {
            let cluster = broker.cluster();
            let links: Vec<String> = cluster
                .links()
                .snapshot()
                .iter()
                .map(|conn| conn.client_id().to_string())
                .collect();
            let peers: serde_json::Map<String, serde_json::Value> =
                cluster.peer_info().into_iter().collect();
            respond_json(
                StatusCode::OK,
                &json!({
                    "enabled": cluster.is_enabled(),
                    "node": cluster.node_info(),
                    "links": links,
                    "routes": cluster.route_count(),
                    "peers": peers,
                }),
            )
        }
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    }
}
