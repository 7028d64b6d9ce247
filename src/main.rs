use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use tokio::sync::mpsc;

use modbus_supervisor::core::modbus::transports::SerialTransport;
use modbus_supervisor::core::store::{FileStore, MemoryStore, Store};
use modbus_supervisor::core::{serve_writes, Supervisor, SupervisorConfig, SupervisorError};

const WRITE_QUEUE_DEPTH: usize = 32;

/// Modbus-RTU supervisory controller.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides the store path from the configuration.
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// Enables frame hex dumps and persists the choice.
    #[arg(long)]
    trace: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), SupervisorError> {
    let mut config = match &args.config {
        Some(path) => SupervisorConfig::load(path)?,
        None => SupervisorConfig::default(),
    };

    if let Some(store) = args.store {
        config.store.path = store;
    }

    let serial = config.serial_settings();
    let transport = SerialTransport::open(serial.clone()).map_err(|source| {
        SupervisorError::SerialPort {
            port: serial.port.clone(),
            source,
        }
    })?;

    // Only the bus is required; an unreadable store leaves the registry
    // empty and every save reporting its failure.
    let store: Box<dyn Store> = match FileStore::open(&config.store.path) {
        Ok(store) => Box::new(store),
        Err(err) => {
            error!(
                "Failed to open store {}: {err}, configuration will not persist",
                config.store.path.display()
            );
            let mut store = MemoryStore::new();
            store.set_read_only(true);
            Box::new(store)
        }
    };

    let supervisor = Arc::new(Supervisor::new(
        Some(Box::new(transport)),
        config.engine_config(),
        config.polling_config(),
        store,
    ));

    if args.trace {
        if let Err(err) = supervisor.set_trace(true) {
            error!("Failed to enable frame tracing: {err}");
        }
    }

    // The sending half belongs to a gateway client; none is bundled.
    let (_write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
    let writes = tokio::spawn(serve_writes(supervisor.clone(), write_rx));

    if config.polling.autostart {
        supervisor.start_polling().await;
    }

    info!("Running, press Ctrl-C to stop");
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to wait for Ctrl-C: {err}");
    }

    info!("Shutting down");
    supervisor.stop_polling().await;
    writes.abort();

    Ok(())
}
