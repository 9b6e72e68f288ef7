#![deny(unsafe_code)]

use canbus_manager::{ClientMode, Frame, Manager};
use canbus_sim_driver::SimAdapter;
use std::sync::Arc;
use tracing::{info, warn};

mod config;

// Initializes the application: determines the configuration and sets
// up the logger. Returns `None` if the program should exit (a
// command-line option asked for a usage or config dump instead).

async fn init_app() -> Option<config::Config> {
    if let Some(cfg) = config::get().await {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(cfg.get_log_level())
            .with_target(false)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .expect("unable to set global default subscriber");
        Some(cfg)
    } else {
        None
    }
}

// Runs the daemon body: builds a `Manager` over a simulated adapter,
// registers a single always-on diagnostic listener, and waits for a
// shutdown signal.
//
// A real deployment would swap `SimAdapter` for a driver talking to
// actual hardware; nothing above the `Adapter` trait boundary would
// need to change.

async fn run() -> Result<(), String> {
    if let Some(cfg) = init_app().await {
        let adapter = Arc::new(SimAdapter::new());
        let manager = Manager::new(adapter, cfg.manager);

        info!("canbusd starting");

        let diag = manager
            .register(ClientMode::RxOnly)
            .map_err(|e| e.to_string())?;
        manager.activate(diag).await.map_err(|e| e.to_string())?;
        manager
            .set_rx_callback(
                diag,
                Some(Arc::new(|frame: &Frame| {
                    info!(id = frame.id, len = frame.data.len(), "frame received");
                })),
            )
            .map_err(|e| e.to_string())?;

        tokio::signal::ctrl_c()
            .await
            .map_err(|e| e.to_string())?;

        manager.unregister(diag).await.map_err(|e| e.to_string())?;
        warn!("canbusd shutting down");
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("ERROR: {e}")
    }
}
