use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router,
    extract::{
        State,
        ws::{WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::{HeaderMap, StatusCode, header::SEC_WEBSOCKET_PROTOCOL},
    response::{IntoResponse, Response},
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::tow::{
    net,
    tunnel::{protocol::SessionId, registry::Registry, transport::WsStream},
};

/// Header a reconnecting client uses to name the session it wants back.
pub const SESSION_ID_HEADER: &str = "tow-session-id";

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_addr: String,
    pub protocol_version: String,
    pub registry: Arc<Registry>,
}

pub struct Server {
    opts: ServerOptions,
}

struct ServerState {
    protocol_version: String,
    registry: Arc<Registry>,
}

impl Server {
    pub fn new(opts: ServerOptions) -> anyhow::Result<Self> {
        if opts.protocol_version.trim().is_empty() {
            anyhow::bail!("server: empty protocol version");
        }
        Ok(Self { opts })
    }

    pub fn router(&self) -> Router {
        let state = Arc::new(ServerState {
            protocol_version: self.opts.protocol_version.trim().to_string(),
            registry: self.opts.registry.clone(),
        });
        Router::new()
            .fallback(handle_upgrade)
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    pub async fn listen_and_serve(
        &self,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let bind_addr = net::normalize_bind_addr(&self.opts.listen_addr);
        let ln = TcpListener::bind(bind_addr.as_ref())
            .await
            .with_context(|| format!("bind {}", self.opts.listen_addr))?;
        tracing::info!(
            addr = %self.opts.listen_addr,
            protocol = %self.opts.protocol_version,
            "server: listening"
        );
        self.serve(ln, shutdown).await
    }

    pub async fn serve(
        &self,
        ln: TcpListener,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        axum::serve(ln, self.router())
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
}

async fn handle_upgrade(
    State(st): State<Arc<ServerState>>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let offered = headers
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let protocol_ok = offered
        .split(',')
        .any(|p| p.trim() == st.protocol_version);

    let ws = match ws {
        Ok(ws) if protocol_ok => ws,
        _ => return (StatusCode::NOT_FOUND, "Not found").into_response(),
    };

    let requested: Option<SessionId> = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok());

    let registry = st.registry.clone();
    ws.protocols([st.protocol_version.clone()])
        .on_upgrade(move |socket| async move {
            let transport = WsStream::new(socket).boxed();
            match registry.create_or_attach(requested, transport).await {
                Ok(sess) => {
                    tracing::info!(sid = sess.id(), requested = ?requested, "server: client connected")
                }
                Err(err) => tracing::warn!(err = %err, "server: session setup failed"),
            }
        })
}
