//! vsp-emu: a virtual sensor protocol emulator.
//!
//! Emulates the device side of the sensor request/response protocol so the
//! controlling peer can be tested without hardware attached:
//! - INIT handshake with an API/DB version gate
//! - UPDATE sensor readings with optional synthetic jitter
//! - CONFIG / RESET per-sensor configuration
//! - CONNECT / DISCONNECT pin bookkeeping
//!
//! Serves a physical serial port or a single-peer TCP listener.

mod config;
mod handler;
mod protocol;
mod registry;
mod session;
mod synth;
mod transport;

use config::{Config, TransportKind};
use handler::Versions;
use registry::Registry;
use session::SessionLoop;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use synth::{JitterSource, Passthrough, ReadingSource};
use tracing::info;
use tracing_subscriber::EnvFilter;
use transport::{SerialTransport, TcpTransport, Transport};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let registry = Registry::with_default_catalog();

    info!(
        api_version = %config.api_version,
        db_version = %config.db_version,
        transport = ?config.transport,
        sensors = ?registry.sensor_ids(),
        "Starting vsp-emu"
    );

    let mut transport: Box<dyn Transport> = match config.transport {
        TransportKind::Serial => Box::new(SerialTransport::new(&config.device, config.baud)),
        TransportKind::Tcp => Box::new(TcpTransport::new(&config.listen)),
    };
    // The only fatal I/O error: a transport that never opened.
    transport.open()?;

    let source: Box<dyn ReadingSource> = if config.jitter {
        Box::new(JitterSource)
    } else {
        Box::new(Passthrough)
    };

    let versions = Versions {
        api: config.api_version.clone(),
        db: config.db_version.clone(),
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))?;

    let mut session = SessionLoop::new(
        transport,
        registry,
        source,
        versions,
        config.lenient_framing,
    );

    let flag = Arc::clone(&shutdown);
    let worker = thread::spawn(move || {
        session.run(&flag);
        session
    });

    info!("Emulator ready, waiting for requests");
    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }

    info!("Shutting down");
    let mut session = worker
        .join()
        .map_err(|_| "session thread panicked")?;
    session.close();
    Ok(())
}
