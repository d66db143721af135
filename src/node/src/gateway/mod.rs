//! Browser-facing HTTP gateway.
//!
//! Routes:
//!
//! | Method | Path | Response |
//! |---|---|---|
//! | GET | `/pods` | map `"namespace/name"` → pod |
//! | GET | `/pods/{namespace}/{name}/files` | map payload path → base64 content |
//! | GET | `/ws` | WebSocket stream of scheduling events |
//! | GET | `/healthz` | `ok` |
//! | GET | `/metrics` | Prometheus text format |
//! | GET, HEAD | anything else | static assets |

mod assets;
mod ws;

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use browser_kube_core::{NodeError, PodKey, Result};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::provider::BrowserProvider;

/// HTTP + WebSocket front end of a [`BrowserProvider`].
pub struct Gateway {
    provider: Arc<BrowserProvider>,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Cancelling `shutdown` stops the server and closes open sockets.
    pub fn new(provider: Arc<BrowserProvider>, shutdown: CancellationToken) -> Self {
        Self { provider, shutdown }
    }

    /// Bind `addr` and serve until shutdown.
    pub async fn serve(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .map_err(|e| NodeError::Server(format!("Failed to bind {}: {}", addr, e)))?;
        self.serve_listener(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve_listener(self, listener: TcpListener) -> Result<()> {
        let builder = Server::from_tcp(listener)
            .map_err(|e| NodeError::Server(format!("Failed to use listener: {}", e)))?;

        let provider = self.provider.clone();
        let shutdown = self.shutdown.clone();
        let gateway = Arc::new(self);
        let make_service = make_service_fn(move |conn: &AddrStream| {
            let gateway = gateway.clone();
            let peer = conn.remote_addr();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let gateway = gateway.clone();
                    async move { Ok::<_, Infallible>(gateway.handle(req, peer).await) }
                }))
            }
        });

        let server = builder.serve(make_service);
        tracing::info!(addr = %server.local_addr(), "Gateway listening");

        provider.set_serving(true);
        let result = server
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        provider.set_serving(false);

        tracing::info!("Gateway stopped");
        result.map_err(|e| NodeError::Server(format!("Gateway failed: {}", e)))
    }

    async fn handle(&self, req: Request<Body>, peer: SocketAddr) -> Response<Body> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();

        let response = match (&method, segments.as_slice()) {
            (&Method::GET, ["healthz"]) => text_response(StatusCode::OK, "ok"),
            (&Method::GET, ["metrics"]) => self.metrics(),
            (&Method::GET, ["pods"]) => {
                json_response(StatusCode::OK, &self.provider.registry().snapshot())
            }
            (&Method::GET, ["pods", namespace, name, "files"]) => {
                self.pod_files(namespace, name).await
            }
            (&Method::GET, ["ws"]) => {
                ws::upgrade(self.provider.clone(), self.shutdown.clone(), req, peer)
            }
            (&Method::GET, _) => assets::serve(&self.provider.config().static_dir, &path, false).await,
            (&Method::HEAD, _) => assets::serve(&self.provider.config().static_dir, &path, true).await,
            _ => text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        };

        tracing::debug!(
            peer = %peer,
            method = %method,
            path = %path,
            status = response.status().as_u16(),
            "Handled request"
        );
        response
    }

    async fn pod_files(&self, namespace: &str, name: &str) -> Response<Body> {
        if name.is_empty() {
            return error_response(StatusCode::NOT_ACCEPTABLE, "No pod specified");
        }
        if namespace.is_empty() {
            return error_response(StatusCode::NOT_ACCEPTABLE, "No namespace specified");
        }
        let Some(pod) = self.provider.registry().get(&PodKey::new(namespace, name)) else {
            return error_response(StatusCode::NOT_FOUND, "Could not find pod");
        };

        // Abandoned requests cancel the in-progress resolve.
        let cancel = self.shutdown.child_token();
        let _abort = cancel.clone().drop_guard();

        match self.provider.resolve_pod_files(&pod, &cancel).await {
            Ok(files) => {
                let body: BTreeMap<String, String> = files
                    .into_iter()
                    .map(|(path, content)| (path, STANDARD.encode(content)))
                    .collect();
                json_response(StatusCode::OK, &body)
            }
            Err(e) => {
                tracing::warn!(pod = %pod.key(), error = %e, "Could not load pod files");
                // Browsers read the error from the body; status stays 200.
                error_response(StatusCode::OK, &e.to_string())
            }
        }
    }

    fn metrics(&self) -> Response<Body> {
        match self.provider.metrics().encode() {
            Ok(text) => with_content_type(
                StatusCode::OK,
                "text/plain; version=0.0.4",
                Body::from(text),
            ),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode metrics");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
            }
        }
    }
}

fn with_content_type(status: StatusCode, content_type: &'static str, body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn text_response(status: StatusCode, text: &'static str) -> Response<Body> {
    with_content_type(status, "text/plain; charset=utf-8", Body::from(text))
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(body) => with_content_type(status, "application/json", Body::from(body)),
        Err(e) => {
            tracing::error!(error = %e, "Could not marshal payload");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    json_response(status, &BTreeMap::from([("error", message)]))
}
