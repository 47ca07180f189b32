use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::tow::{
    telemetry::SharedPrometheusHandle,
    tunnel::{protocol::SessionId, registry::Registry},
};

#[derive(Clone)]
pub struct AdminState {
    pub prom: Option<SharedPrometheusHandle>,
    pub registry: Arc<Registry>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/sessions", get(sessions))
        .route("/sessions/{id}/close", post(close_session))
        .with_state(Arc::new(state))
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(admin_addr = %addr, "admin: listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let body = st.prom.as_ref().map(|h| h.render()).unwrap_or_default();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

async fn sessions(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.registry.snapshot().await))
}

#[derive(Debug, Serialize)]
struct CloseResponse {
    id: SessionId,
    closed: bool,
}

async fn close_session(
    State(st): State<Arc<AdminState>>,
    Path(id): Path<SessionId>,
) -> impl IntoResponse {
    let closed = st.registry.remove_and_close(id).await;
    if closed {
        tracing::info!(sid = id, "admin: session closed");
    }
    let status = if closed {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    (status, Json(CloseResponse { id, closed }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::tow::tunnel::{session::SessionOptions, transport::BoxedStream};

    async fn start() -> (SocketAddr, Arc<Registry>, watch::Sender<bool>) {
        let registry = Arc::new(Registry::new(SessionOptions {
            keep_alive: Duration::from_secs(3600),
            ..SessionOptions::default()
        }));
        let state = AdminState {
            prom: None,
            registry: registry.clone(),
        };
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(async move {
            axum::serve(ln, router(state))
                .with_graceful_shutdown(async move {
                    let _ = rx.wait_for(|v| *v).await;
                })
                .await
        });
        (addr, registry, tx)
    }

    /// Minimal HTTP/1.0 exchange; returns (status, body).
    async fn call(addr: SocketAddr, method: &str, uri: &str) -> (u16, String) {
        let mut sock = tokio::net::TcpStream::connect(addr).await.unwrap();
        let head = format!("{method} {uri} HTTP/1.0\r\nHost: admin\r\nContent-Length: 0\r\n\r\n");
        sock.write_all(head.as_bytes()).await.unwrap();
        let mut raw = String::new();
        sock.read_to_string(&mut raw).await.unwrap();
        let (head, body) = raw.split_once("\r\n\r\n").unwrap();
        let status = head.split_whitespace().nth(1).unwrap().parse().unwrap();
        (status, body.to_string())
    }

    #[tokio::test]
    async fn health_and_empty_session_list() {
        let (addr, _registry, _tx) = start().await;

        let (status, body) = call(addr, "GET", "/health").await;
        assert_eq!(status, 200);
        assert_eq!(body, r#"{"ok":true}"#);

        let (status, body) = call(addr, "GET", "/sessions").await;
        assert_eq!(status, 200);
        assert_eq!(body, "[]");
    }

    #[tokio::test]
    async fn lists_and_closes_sessions() {
        let (addr, registry, _tx) = start().await;
        let (ours, _theirs) = tokio::io::duplex(1 << 16);
        let transport: BoxedStream = Box::new(ours);
        let sess = registry.create_or_attach(None, transport).await.unwrap();

        let (_, body) = call(addr, "GET", "/sessions").await;
        let list: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(list[0]["id"], sess.id());
        assert_eq!(list[0]["state"], "running");

        let uri = format!("/sessions/{}/close", sess.id());
        let (status, _) = call(addr, "POST", &uri).await;
        assert_eq!(status, 200);
        assert!(sess.is_closed());

        let (status, body) = call(addr, "POST", &uri).await;
        assert_eq!(status, 404);
        assert!(body.contains(r#""closed":false"#));
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_empty() {
        let (addr, _registry, _tx) = start().await;
        let (status, body) = call(addr, "GET", "/metrics").await;
        assert_eq!(status, 200);
        assert!(body.is_empty());
    }
}
