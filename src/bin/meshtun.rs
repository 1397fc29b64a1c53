//! meshtun daemon binary
//!
//! Loads configuration, binds the outside socket and runs the tunnel
//! engine until interrupted.

use clap::Parser;
use meshtun::{
    packet_channel, ChannelDevice, Config, Control, DeviceHandle, Interface, InterfaceParts, UdpTransport,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Outside packets buffered between the socket and the engine.
const PACKET_BUFFER: usize = 1024;

/// Inside packets buffered on the channel device.
const DEVICE_BUFFER: usize = 256;

/// meshtun encrypted overlay daemon
#[derive(Parser, Debug)]
#[command(name = "meshtun", version, about)]
struct Args {
    /// Path to configuration file (overrides default search paths)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(short, long)]
    test: bool,
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let args = Args::parse();

    info!("meshtun starting");

    let (config, loaded_paths) = if let Some(config_path) = &args.config {
        match Config::load_file(config_path) {
            Ok(config) => (config, vec![config_path.clone()]),
            Err(e) => {
                error!("Failed to load configuration from {}: {}", config_path.display(), e);
                std::process::exit(1);
            }
        }
    } else {
        match Config::load() {
            Ok(result) => result,
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                std::process::exit(1);
            }
        }
    };

    if loaded_paths.is_empty() {
        warn!("No config files found, using defaults");
    } else {
        for path in &loaded_paths {
            info!(path = %path.display(), "Loaded config file");
        }
    }

    let certs = match config.cert_provider() {
        Ok(certs) => Arc::new(certs),
        Err(e) => {
            error!("Invalid key material: {}", e);
            std::process::exit(1);
        }
    };

    if args.test {
        info!(networks = ?config.networks(), "Configuration is valid");
        return;
    }

    let (packet_tx, packet_rx) = packet_channel(PACKET_BUFFER);
    let transport = Arc::new(UdpTransport::new(config.listen.clone(), packet_tx));
    match transport.start_async().await {
        Ok(addr) => info!(local_addr = %addr, "Listening"),
        Err(e) => {
            error!("Failed to bind outside socket: {}", e);
            std::process::exit(1);
        }
    }

    let (device, handle) = ChannelDevice::new("meshtun0", DEVICE_BUFFER);
    let iface = match Interface::new(&config, InterfaceParts::new(certs, transport.clone(), device)) {
        Ok(iface) => iface,
        Err(e) => {
            error!("Failed to create interface: {}", e);
            std::process::exit(1);
        }
    };

    // Without an OS tunnel device, decrypted packets are only logged.
    let DeviceHandle { inject, mut delivered } = handle;
    tokio::spawn(async move {
        while let Some(packet) = delivered.recv().await {
            debug!(len = packet.len(), "Packet delivered to device");
        }
    });

    let control = Control::new(iface);
    if let Err(e) = control.start(packet_rx) {
        error!("Failed to start engine: {}", e);
        std::process::exit(1);
    }

    info!(
        name = %control.name(),
        vpn_addr = ?control.vpn_addr(),
        am_lighthouse = control.am_lighthouse(),
        "meshtun running, press Ctrl+C to exit"
    );

    if let Err(e) = control.shutdown_block().await {
        warn!("Error during shutdown: {}", e);
    }
    drop(inject);

    if let Err(e) = transport.stop_async().await {
        warn!("Error stopping transport: {}", e);
    }

    info!("meshtun shutdown complete");
}
