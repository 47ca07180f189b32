use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;

/// Installs the process-wide Prometheus recorder and describes the tunnel metrics.
///
/// Call once at startup; a second install fails.
pub fn init_prometheus() -> anyhow::Result<SharedPrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")?;
    describe();
    Ok(Arc::new(handle))
}

fn describe() {
    metrics::describe_counter!("tow_sessions_total", "Sessions created since start");
    metrics::describe_gauge!("tow_active_sessions", "Sessions currently registered");
    metrics::describe_counter!("tow_conns_total", "Outbound connections opened");
    metrics::describe_gauge!("tow_active_conns", "Outbound connections currently open");
    metrics::describe_counter!("tow_frames_in_total", "Frames decoded from clients, by type");
    metrics::describe_counter!("tow_frames_out_total", "Frames written to clients");
    metrics::describe_counter!("tow_frame_errors_total", "Frames that failed to decode");
    metrics::describe_counter!(
        "tow_bytes_ingress_total",
        "Bytes read from outbound connections"
    );
    metrics::describe_counter!(
        "tow_bytes_egress_total",
        "Bytes written to outbound connections"
    );
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
