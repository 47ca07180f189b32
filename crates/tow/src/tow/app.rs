use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::tow::{
    admin, config, logging, net, telemetry,
    tunnel::{
        registry::Registry,
        server::{Server, ServerOptions},
    },
};

#[derive(Debug, Default)]
pub struct RunOptions {
    pub config_path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<String>,
    pub verbose: bool,
}

pub async fn run(opts: RunOptions) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(opts.config_path)?;
    let created = config::ensure_config_file(&resolved.path)?;

    let mut cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;
    cfg.override_listen(opts.host.as_deref(), opts.port.as_deref());

    let _logrt = logging::init(&cfg.logging, opts.verbose)?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    tracing::info!(
        config = %resolved.path.display(),
        listen_addr = %cfg.listen_addr,
        admin_addr = %cfg.admin_addr,
        protocol = %cfg.protocol_version,
        keep_alive = %humantime::format_duration(cfg.session.keep_alive_interval),
        linger = %humantime::format_duration(cfg.session.linger),
        dial_timeout = %humantime::format_duration(cfg.conn.dial_timeout),
        "tow: starting"
    );

    let prom = telemetry::init_prometheus()?;
    let registry = Arc::new(Registry::new(cfg.session_options()));

    let server = Server::new(ServerOptions {
        listen_addr: cfg.listen_addr.clone(),
        protocol_version: cfg.protocol_version.clone(),
        registry: registry.clone(),
    })?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    {
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { server.listen_and_serve(shutdown).await });
    }

    if !cfg.admin_addr.is_empty() {
        let addr: SocketAddr = net::normalize_bind_addr(&cfg.admin_addr)
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;
        let state = admin::AdminState {
            prom: Some(prom.clone()),
            registry: registry.clone(),
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, state, shutdown).await });
    }

    {
        let registry = registry.clone();
        let linger = cfg.session.linger;
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { registry.run_reaper(linger, shutdown).await });
    }

    // Wait for a shutdown signal or for a task to fail. The reaper returns Ok immediately when
    // lingering is disabled, so clean exits keep waiting.
    let outcome = loop {
        tokio::select! {
            _ = shutdown_signal() => {
                tracing::info!("shutdown: signal");
                break Ok(());
            }
            res = tasks.join_next() => match res {
                Some(Ok(Ok(()))) => continue,
                Some(Ok(Err(err))) => break Err(err),
                Some(Err(join_err)) => break Err(join_err.into()),
                None => break Ok(()),
            },
        }
    };

    let _ = shutdown_tx.send(true);
    tracing::info!(sessions = registry.len().await, "shutdown: closing sessions");
    registry.close_all().await;

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!("shutdown: drain timed out; aborting tasks");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    outcome
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
