mod bluetooth;
mod buffer;
mod classifier;
mod codec;
mod config;
mod error;
mod models;
mod pipeline;
mod utils;

use log::{error, info, warn};
use tokio::sync::{mpsc, watch};

use bluetooth::{BluerCentral, ConnectionManager};
use config::MonitorConfig;
use models::{ConnectionState, Snapshot};
use pipeline::Pipeline;
use utils::{format_datetime, format_summary};

// Link events buffered between the connection manager and the pipeline
const EVENT_QUEUE_DEPTH: usize = 64;

/// Stand-in presentation layer: log every published snapshot
async fn report_snapshots(mut snapshots: watch::Receiver<Snapshot>) {
    while snapshots.changed().await.is_ok() {
        let snapshot = snapshots.borrow_and_update().clone();
        if snapshot.connection.is_terminal() {
            warn!("{}", format_summary(&snapshot));
        } else {
            info!("{}", format_summary(&snapshot));
        }
    }
}

async fn run_session(config: MonitorConfig) -> (ConnectionState, Snapshot) {
    info!(
        "Starting telemetry session for '{}' (service {}, characteristic {})",
        config.device_name, config.service_uuid, config.characteristic_uuid
    );

    let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let central = BluerCentral::new(config.adapter_name.clone());
    let manager = ConnectionManager::new(central, config, tx);

    let pipeline = Pipeline::new();
    tokio::spawn(report_snapshots(pipeline.subscribe()));

    // One writer: the pipeline applies link events strictly in order
    tokio::join!(manager.run(), pipeline.run(rx))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match MonitorConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    // Handle Ctrl+C gracefully
    let (tx, mut rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = tx.send(());
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    // Run the session or wait for shutdown signal
    tokio::select! {
        (link_state, last) = run_session(config) => {
            if link_state.is_terminal() {
                error!("Session ended: {}", link_state.status_label());
            } else {
                warn!("Session ended in state: {}", link_state.status_label());
            }
            info!(
                "Session started {}: received {} notifications ({} dropped), final category: {}",
                format_datetime(&last.session_started),
                last.received_payloads,
                last.dropped_payloads,
                last.category_label
            );
        }
        _ = &mut rx => {
            info!("Program terminated by user. Exiting gracefully.");
        }
    }

    Ok(())
}
