//! Gateway entry point
//!
//! Bootstrap order: crypto provider, CLI parsing, logger, config load,
//! module registry construction, then signal-driven shutdown. Modules
//! stop in reverse startup order.

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use gateway_r::bus::Bus;
use gateway_r::config::{self, ConfigStore, ConnTuning, GatewayConfig};
use gateway_r::core::template::VarRegistry;
use gateway_r::logger::{self, log};
use gateway_r::module::{ModuleContext, ModuleManager};

#[tokio::main]
async fn main() -> Result<()> {
    // Install ring as the default crypto provider for rustls.
    // This must be done before any TLS operations.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Parse CLI arguments
    let cli = config::CliArgs::parse_args();
    cli.validate()?;

    // Initialize logger
    logger::init_logger(&cli.log_mode);

    log::info!(config = %cli.config_file.display(), "Starting gateway");

    // Load configuration
    let config = GatewayConfig::load(&cli.config_file)?;
    let store = ConfigStore::new(config.clone());

    let shutdown = CancellationToken::new();
    let ctx = ModuleContext {
        config: Arc::new(config),
        store,
        tuning: ConnTuning::from_cli(&cli),
        vars: Arc::new(VarRegistry::builtin()),
        bus: Bus::new(),
        shutdown: shutdown.clone(),
    };

    // Build the static module registry and bring everything up
    let mut manager = ModuleManager::from_registry();
    manager.init_all(&ctx).await?;
    manager.start_all(&ctx).await?;

    // Wait for a shutdown signal
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to setup SIGINT");
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to setup SIGTERM");

        tokio::select! {
            _ = sigint.recv() => {
                log::info!("SIGINT received, shutting down...");
            }
            _ = sigterm.recv() => {
                log::info!("SIGTERM received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        log::info!("Shutdown signal received...");
    }

    shutdown.cancel();
    manager.stop_all().await;
    log::info!("Gateway stopped");

    Ok(())
}
