//! Automation hub daemon
//!
//! Usage: `autohub [path/to/autohub.yaml]`

use anyhow::{Context as _, Result};
use hub_actions::Capabilities;
use hub_api::{build_registry, start_server, AppState};
use hub_automation::Automation;
use hub_config::{FileKvStore, HubConfig};
use hub_event_bus::EventBus;
use hub_rpc::{RpcRegistry, StaticTokenValidator};
use hub_variables::VariableStore;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const DEFAULT_CONFIG_PATH: &str = "autohub.yaml";

/// The running hub: engine plus the RPC surface over it
pub struct Hub {
    pub config: HubConfig,
    pub automation: Arc<Automation>,
    pub registry: Arc<RpcRegistry>,
}

impl Hub {
    /// Wire the components and initialize the engine from `config_dir`
    pub async fn build(config: HubConfig, caps: Capabilities) -> Result<Self> {
        let bus = Arc::new(EventBus::new());
        let kv = Arc::new(FileKvStore::new(config.variables_path()));
        let vars = VariableStore::new(bus, kv);

        let automation = Automation::new(vars, caps, config.config_dir.clone());
        if let Err(e) = automation.init().await {
            // Stays in ERROR; automation.reload or a restart can recover
            error!(error = %e, "Automation init failed");
        }

        let registry = build_registry(&automation);
        if config.api_tokens.is_empty() {
            warn!("No api_tokens configured, RPC endpoints are unauthenticated");
        } else {
            registry.set_validator(Some(Arc::new(StaticTokenValidator::new(
                config.api_tokens.iter().cloned(),
            ))));
        }

        Ok(Self {
            config,
            automation,
            registry,
        })
    }

    pub async fn start(&self) -> Result<()> {
        if self.config.auto_start {
            self.automation
                .start()
                .await
                .context("starting automation engine")?;
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.automation.shutdown().await;
    }
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = HubConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path))?;
    init_tracing(&config.log_level)?;

    info!(version = env!("CARGO_PKG_VERSION"), config = %config_path, "Starting automation hub");

    let caps = Capabilities::host_defaults(Some(config.data_dir.join("ssh")));
    let hub = Hub::build(config, caps).await?;
    if let Err(e) = hub.start().await {
        error!(error = %e, "Engine not started");
    }

    let server = if hub.config.http.enabled {
        let state = AppState::new(hub.registry.clone());
        let bind = hub.config.http.bind.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = start_server(state, &bind).await {
                error!(error = %e, "API server stopped");
            }
        }))
    } else {
        info!("HTTP API disabled");
        None
    };

    info!("Automation hub is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    if let Some(server) = server {
        server.abort();
    }
    hub.shutdown().await;

    Ok(())
}
