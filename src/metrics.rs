use std::net::SocketAddr;

/// Installs the Prometheus exporter when PLAYLOG_METRICS_PORT is set.
/// Counters on the dispatch hot path are recorded regardless; without the
/// exporter they are simply dropped.
pub fn init_metrics() {
    let Some(port) = std::env::var("PLAYLOG_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
    else {
        return;
    };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr);
    match builder.install() {
        Ok(()) => {
            println!(
                "[metrics] Prometheus exporter installed and listening on http://{}/metrics",
                addr
            );
        }
        Err(e) => {
            println!("[metrics] Prometheus exporter install failed: {}", e);
        }
    }
}
