//! # virtual-printer
//!
//! Runs simulated printers through the session runtime.
//!
//! ## Startup Sequence
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. init_tracing()          RUST_LOG, default info,printlink=debug      │
//! │  2. ClientSettings::load    path from argv[1] or the user config dir    │
//! │  3. open_store              memory or sqlite per settings               │
//! │  4. seed                    one virtual printer when the store is empty │
//! │  5. ClientApp::start        boot load, flush and watch tasks            │
//! │  6. wait for Ctrl+C / SIGTERM, then shutdown                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod simulator;

use printlink_core::PrinterConfig;
use printlink_sync::{
    open_store, AppEvent, AppEventEmitter, CameraPool, ClientApp, ClientSettings, PrinterHandler,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use simulator::{SimulatedPrinter, TestPattern};

/// Logs runtime events at info level.
struct LogEmitter;

impl AppEventEmitter for LogEmitter {
    fn emit(&self, event: &AppEvent) {
        match event {
            AppEvent::SetupCode { unique_id, short_id } => {
                info!(%unique_id, %short_id, "Enter this code on the dashboard to pair");
            }
            AppEvent::StoreFailure { unique_id, error } => {
                warn!(?unique_id, %error, "Store failure");
            }
            other => info!(event = ?other, "Runtime event"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let settings = ClientSettings::load(config_path)?;
    info!(client = %settings.client.name, "Starting virtual printer");

    let store = open_store(&settings).await?;
    if store.list().await?.is_empty() {
        let name = std::env::var("PRINTLINK_PRINTER_NAME").unwrap_or_else(|_| "virtual".into());
        info!(%name, "No printers stored, adding one");
        let record = printlink_core::StoredRecord::new(
            PrinterConfig::new().with_name(name),
            printlink_core::Rank::Active,
        );
        store.upsert(&record).await?;
    }

    let camera = CameraPool::spawn(4, TestPattern);

    let app = ClientApp::builder(settings)
        .with_store(store)
        .with_handler_factory(Arc::new(|config: &PrinterConfig| -> Box<dyn PrinterHandler> {
            Box::new(SimulatedPrinter::new(config))
        }))
        .with_emitter(Arc::new(LogEmitter))
        .with_camera(camera.handle())
        .start()
        .await?;

    for printer in app.snapshot().await {
        info!(printer = %printer.label, rank = %printer.rank, "Printer loaded");
    }

    shutdown_signal().await;

    app.shutdown().await;
    camera.shutdown().await;
    info!("Virtual printer stopped");
    Ok(())
}

/// Initializes the tracing subscriber.
///
/// `RUST_LOG` overrides the default filter.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,printlink=debug,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::TRACE)
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Could not listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
