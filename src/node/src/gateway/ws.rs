//! WebSocket subscriber connections.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use hyper::header::{HeaderName, HeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE};
use hyper::{Body, Request, Response, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::hub::SubscriberHandle;
use crate::provider::BrowserProvider;

/// Answer a WebSocket handshake and run the subscriber once upgraded.
///
/// Requests that are not a valid handshake get 400.
pub(super) fn upgrade(
    provider: Arc<BrowserProvider>,
    shutdown: CancellationToken,
    mut req: Request<Body>,
    peer: SocketAddr,
) -> Response<Body> {
    let Some(accept) = handshake_accept(&req) else {
        tracing::info!(peer = %peer, "Error upgrading websocket connection");
        return super::text_response(StatusCode::BAD_REQUEST, "expected websocket upgrade");
    };
    let Ok(accept) = HeaderValue::from_str(&accept) else {
        return super::text_response(StatusCode::BAD_REQUEST, "invalid websocket key");
    };

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let socket = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
                run_subscriber(provider, socket, peer, shutdown).await;
            }
            Err(e) => tracing::warn!(peer = %peer, error = %e, "WebSocket upgrade failed"),
        }
    });

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
    response
}

/// `Sec-WebSocket-Accept` value for a valid version 13 handshake.
fn handshake_accept(req: &Request<Body>) -> Option<String> {
    let headers = req.headers();
    let header = |name: HeaderName| headers.get(name).and_then(|v| v.to_str().ok());

    let connection_upgrade = header(CONNECTION)?
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    let websocket = header(UPGRADE)?.eq_ignore_ascii_case("websocket");
    let version_13 = header(SEC_WEBSOCKET_VERSION)? == "13";
    if !(connection_upgrade && websocket && version_13) {
        return None;
    }

    let key = headers.get(SEC_WEBSOCKET_KEY)?;
    Some(derive_accept_key(key.as_bytes()))
}

/// Pump broadcast frames to one browser until either side goes away.
async fn run_subscriber<S>(
    provider: Arc<BrowserProvider>,
    socket: WebSocketStream<S>,
    peer: SocketAddr,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let SubscriberHandle { id, mut frames } = match provider.subscribe(peer.to_string()) {
        Ok(handle) => handle,
        Err(e) => {
            tracing::warn!(peer = %peer, error = %e, "Could not register subscriber");
            return;
        }
    };
    let (mut sink, mut stream) = socket.split();

    let writer = async {
        while let Some(frame) = frames.recv().await {
            sink.send(Message::Text(frame.to_string())).await?;
        }
        // Queue closed by the hub: the subscriber was dropped.
        sink.send(Message::Close(None)).await
    };
    let reader = async {
        while let Some(message) = stream.next().await {
            if let Message::Close(_) = message? {
                break;
            }
        }
        Ok::<_, tokio_tungstenite::tungstenite::Error>(())
    };

    let outcome = tokio::select! {
        result = writer => result.map(|_| "dropped by hub"),
        result = reader => result.map(|_| "closed by browser"),
        _ = shutdown.cancelled() => Ok("shutdown"),
    };
    provider.unsubscribe(&id);

    match outcome {
        Ok(reason) => tracing::debug!(subscriber = %id, peer = %peer, reason, "WebSocket closed"),
        Err(e) => tracing::debug!(subscriber = %id, peer = %peer, error = %e, "WebSocket error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Gateway;
    use crate::lifecycle::PodLifecycleHandler;
    use crate::testing::{test_config, FakeClient};
    use browser_kube_core::PodRecord;
    use std::net::TcpListener;
    use std::time::Duration;
    use tempfile::TempDir;

    fn handshake(key: Option<&str>, version: &str) -> Request<Body> {
        let mut builder = Request::get("/ws")
            .header(CONNECTION, "keep-alive, Upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_VERSION, version);
        if let Some(key) = key {
            builder = builder.header(SEC_WEBSOCKET_KEY, key);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_handshake_accept_key() {
        // Sample handshake from RFC 6455 section 1.3.
        let accept = handshake_accept(&handshake(Some("dGhlIHNhbXBsZSBub25jZQ=="), "13"));
        assert_eq!(accept.as_deref(), Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    }

    #[test]
    fn test_handshake_rejects_incomplete_requests() {
        assert!(handshake_accept(&handshake(None, "13")).is_none());
        assert!(handshake_accept(&handshake(Some("dGhlIHNhbXBsZSBub25jZQ=="), "8")).is_none());
        assert!(handshake_accept(&Request::get("/ws").body(Body::empty()).unwrap()).is_none());
    }

    async fn next_text<S>(stream: &mut S) -> serde_json::Value
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        let message = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        serde_json::from_str(message.to_text().unwrap()).unwrap()
    }

    async fn wait_for_subscribers(provider: &BrowserProvider, count: usize) {
        for _ in 0..100 {
            if provider.subscriber_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {} subscribers, have {}", count, provider.subscriber_count());
    }

    #[tokio::test]
    async fn test_browser_receives_snapshot_then_deltas() {
        let tmp = TempDir::new().unwrap();
        let provider =
            Arc::new(BrowserProvider::new(test_config(tmp.path()), Arc::new(FakeClient::default())).unwrap());
        provider
            .create_pod(PodRecord::new("default", "a", &["img"]))
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(Gateway::new(provider.clone(), shutdown.clone()).serve_listener(listener));

        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
            .await
            .unwrap();

        let snapshot = next_text(&mut socket).await;
        assert_eq!(snapshot["type"], "schedulePods");
        assert_eq!(snapshot["data"][0]["metadata"]["name"], "a");

        wait_for_subscribers(&provider, 1).await;
        provider
            .create_pod(PodRecord::new("default", "b", &["img"]))
            .await
            .unwrap();
        let delta = next_text(&mut socket).await;
        assert_eq!(delta["data"][0]["metadata"]["name"], "b");

        socket.close(None).await.unwrap();
        wait_for_subscribers(&provider, 0).await;

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_subscribers() {
        let tmp = TempDir::new().unwrap();
        let provider =
            Arc::new(BrowserProvider::new(test_config(tmp.path()), Arc::new(FakeClient::default())).unwrap());
        let shutdown = CancellationToken::new();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(Gateway::new(provider.clone(), shutdown.clone()).serve_listener(listener));

        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
            .await
            .unwrap();
        let empty = next_text(&mut socket).await;
        assert_eq!(empty["data"], serde_json::json!([]));
        wait_for_subscribers(&provider, 1).await;

        shutdown.cancel();
        wait_for_subscribers(&provider, 0).await;
        server.await.unwrap().unwrap();
    }
}
