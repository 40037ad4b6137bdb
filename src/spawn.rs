//! Proxyd spawn utilities.
use crate::{
    cli::Args,
    config::ProxydConfig,
    metrics,
    server::{Proxy, http, ws},
};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::{net::SocketAddr, path::Path};
use tokio::net::TcpListener;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info, warn};

/// Context returned once the proxy is launched.
#[derive(Debug, Clone)]
pub struct ProxyHandle {
    /// The socket address the RPC listener is bound to.
    pub local_addr: SocketAddr,
    /// The socket address the websocket listener is bound to, if websockets are enabled.
    pub ws_addr: Option<SocketAddr>,
    /// The running proxy.
    pub proxy: Proxy,
    /// Metrics collector handle, if metrics are enabled.
    pub metrics: Option<PrometheusHandle>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl ProxyHandle {
    /// Returns the url to the http server
    pub fn http_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Returns the url to the websocket server, if websockets are enabled.
    pub fn ws_url(&self) -> Option<String> {
        self.ws_addr.map(|addr| format!("ws://{addr}"))
    }

    /// Stops the listeners and background work, and waits for in-flight requests to drain.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

/// Attempts to spawn the proxy using CLI arguments and a configuration file.
pub async fn try_spawn_with_args<P: AsRef<Path>>(
    args: Args,
    config_path: P,
) -> eyre::Result<ProxyHandle> {
    let config = if !config_path.as_ref().exists() {
        warn!(path = %config_path.as_ref().display(), "Config file not found, writing defaults");
        let config = args.merge_config(ProxydConfig::default());
        config.save_to_file(&config_path)?;
        config
    } else {
        // File exists: load and override with CLI values.
        args.merge_config(ProxydConfig::load_from_file(&config_path)?)
    };

    try_spawn(config).await
}

/// Spawns the proxy using the provided [`ProxydConfig`].
pub async fn try_spawn(config: ProxydConfig) -> eyre::Result<ProxyHandle> {
    let metrics = if config.metrics.enabled {
        Some(metrics::setup_exporter((config.metrics.host, config.metrics.port))?)
    } else {
        None
    };

    let cancel = CancellationToken::new();
    let proxy = Proxy::new(config, cancel.clone()).await?;
    proxy.start();

    let server = &proxy.config().server;
    let tasks = TaskTracker::new();

    let listener = TcpListener::bind((server.rpc_host, server.rpc_port)).await?;
    let local_addr = listener.local_addr()?;
    serve(&tasks, listener, http::router(proxy.clone()), cancel.clone());
    info!(addr = %local_addr, "Started proxy service");

    let ws_addr = match server.ws_port {
        Some(port) => {
            let listener = TcpListener::bind((server.ws_host, port)).await?;
            let addr = listener.local_addr()?;
            serve(&tasks, listener, ws::router(proxy.clone()), cancel.clone());
            info!(%addr, "Started websocket service");
            Some(addr)
        }
        None => None,
    };

    Ok(ProxyHandle { local_addr, ws_addr, proxy, metrics, cancel, tasks })
}

fn serve(tasks: &TaskTracker, listener: TcpListener, router: Router, cancel: CancellationToken) {
    tasks.spawn(async move {
        let service = router.into_make_service_with_connect_info::<SocketAddr>();
        if let Err(err) = axum::serve(listener, service)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
        {
            warn!(%err, "Listener stopped");
        }
    });
}
