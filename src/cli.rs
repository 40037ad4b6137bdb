//! # Proxyd CLI
use crate::{config::ProxydConfig, spawn::try_spawn_with_args};
use clap::Parser;
use std::{net::IpAddr, path::PathBuf};

/// A JSON-RPC proxy that routes calls across a pool of EVM backends.
#[derive(Debug, Parser)]
#[command(author, version, about = "Proxyd", long_about = None)]
pub struct Args {
    /// The configuration file.
    ///
    /// If missing, a default one will be used and stored in the working directory under
    /// `proxyd.yaml`.
    #[arg(long, value_name = "CONFIG", env = "PROXYD_CONFIG", default_value = "proxyd.yaml")]
    pub config: PathBuf,
    /// The address to serve the RPC on. Overrides the configuration file.
    #[arg(long = "http.addr", value_name = "ADDR")]
    pub address: Option<IpAddr>,
    /// The port to serve the RPC on. Overrides the configuration file.
    #[arg(long = "http.port", value_name = "PORT")]
    pub port: Option<u16>,
    /// The port to serve websockets on. Overrides the configuration file.
    #[arg(long = "ws.port", value_name = "PORT")]
    pub ws_port: Option<u16>,
    /// The port to serve the metrics on. Enables metrics.
    #[arg(long = "http.metrics-port", value_name = "PORT")]
    pub metrics_port: Option<u16>,
}

impl Args {
    /// Run the proxy until it is interrupted.
    pub async fn run(self) -> eyre::Result<()> {
        let config_path = self.config.clone();
        let handle = try_spawn_with_args(self, &config_path).await?;

        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutting down");
        handle.shutdown().await;

        Ok(())
    }

    /// Merges [`Args`] values into an existing [`ProxydConfig`] instance.
    pub fn merge_config(self, mut config: ProxydConfig) -> ProxydConfig {
        if let Some(address) = self.address {
            config = config.with_rpc_host(address);
        }
        if let Some(port) = self.port {
            config = config.with_rpc_port(port);
        }
        if self.ws_port.is_some() {
            config = config.with_ws_port(self.ws_port);
        }
        if let Some(port) = self.metrics_port {
            config = config.with_metrics_port(port);
        }
        config
    }
}
