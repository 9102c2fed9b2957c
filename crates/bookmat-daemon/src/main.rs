//! bookmat-daemon - book-vending cabinet control daemon.
//!
//! Boots the system context, runs the startup checks, homes the gantry,
//! and keeps the card-reader poll loops and the health monitor running
//! until a shutdown signal arrives. The HTTP/WebSocket façade attaches
//! to the context from its own process-internal module tree and is not
//! part of this crate.

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bookmat_core::rfid::{MockTagPort, TagPort};
use bookmat_daemon::config::Config;
use bookmat_daemon::context::SystemContext;
use bookmat_daemon::health::HealthMonitor;
use bookmat_irbis::LibraryClient as _;

/// Cabinet control daemon.
#[derive(Parser, Debug)]
#[command(name = "bookmat-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Force mock hardware and mock library backend.
    #[arg(long)]
    mock: bool,

    /// Database path (overrides DATABASE_PATH).
    #[arg(long)]
    db: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Skip the homing run at startup.
    #[arg(long)]
    no_home: bool,
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn startup_checks(context: &SystemContext) -> Result<()> {
    let cells = context.store.get_all_cells()?;
    anyhow::ensure!(
        cells.len() == bookmat_core::cabinet::TOTAL_CELLS,
        "cell grid incomplete: {} rows",
        cells.len()
    );
    let stats = context.store.statistics()?;
    info!(
        occupied = stats.occupied_cells,
        available = stats.total_cells,
        pending_extraction = stats.needs_extraction,
        "catalogue ready"
    );
    context.sensors.snapshot()?;
    info!(mock = context.config.mock_mode, "hardware ready");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::from_env();
    if args.mock {
        config.mock_mode = true;
    }
    if let Some(db) = args.db {
        config.database_path = db;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    init_tracing(&config);

    info!(version = env!("CARGO_PKG_VERSION"), "bookmat starting");
    let context = SystemContext::build(config).context("failed to build system context")?;
    startup_checks(&context).context("startup checks failed")?;

    if let Err(err) = context.library.connect().await {
        warn!(%err, "library server unreachable at startup; workflows will retry");
    }

    if let Some(mock) = &context.mock_gpio {
        // Mock hardware parks the carriage at the origin with the tray
        // retracted, so the startup homing run completes immediately.
        let pins = bookmat_core::gpio::PinMap::default();
        for pin in [pins.sensor_x_begin, pins.sensor_y_begin, pins.sensor_tray_begin] {
            mock.set_input_level(pin, bookmat_core::gpio::Level::High);
        }
    }

    if args.no_home {
        info!("skipping homing run");
    } else if let Err(err) = context.algorithms.init_home().await {
        // Status and maintenance surfaces stay up; the operator re-runs
        // INIT from the console once the blockage is cleared.
        error!(%err, "homing failed at startup");
    }

    // Card readers: mock ports poll an empty field on host builds; the
    // hardware feature opens the two serial lines instead.
    #[cfg(feature = "hardware")]
    let (nfc, uhf): (Option<Box<dyn TagPort>>, Option<Box<dyn TagPort>>) =
        if context.config.mock_mode {
            let (nfc_port, _) = MockTagPort::new();
            let (uhf_port, _) = MockTagPort::new();
            (Some(Box::new(nfc_port)), Some(Box::new(uhf_port)))
        } else {
            use bookmat_core::rfid::reader::SerialTagPort;
            // The NFC reader rides PC/SC and attaches through its own
            // bridge; only the UHF card line is a plain serial port.
            let uhf = match SerialTagPort::open("/dev/rfid_uhf_card", 57_600) {
                Ok(port) => Some(Box::new(port) as Box<dyn TagPort>),
                Err(err) => {
                    warn!(%err, "UHF card reader unavailable");
                    None
                }
            };
            (None, uhf)
        };
    #[cfg(not(feature = "hardware"))]
    let (nfc, uhf): (Option<Box<dyn TagPort>>, Option<Box<dyn TagPort>>) = {
        let (nfc_port, _nfc_feed) = MockTagPort::new();
        let (uhf_port, _uhf_feed) = MockTagPort::new();
        (Some(Box::new(nfc_port)), Some(Box::new(uhf_port)))
    };
    let reader = context.card_reader.clone();
    let reader_task = tokio::spawn(async move { reader.run(nfc, uhf).await });

    let monitor = HealthMonitor::new(context.clone());
    let health_task = tokio::spawn(monitor.run());

    info!("bookmat running; ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("shutting down");
    context.shutdown();
    if let Err(err) = context.library.disconnect().await {
        warn!(%err, "library unregister failed during shutdown");
    }
    health_task.abort();
    let _ = reader_task.await;

    let _ = context
        .store
        .log_system(bookmat_daemon::store::models::LogLevel::Info, "main", "system stopped");
    Ok(())
}
