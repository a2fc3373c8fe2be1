//! Command-line front end for the link engine
//!
//! Opens a serial port (or a simulated modem with `--sim`), runs the
//! full bring-up, then prints link events until interrupted.
//!
//! Usage:
//!
//! ```text
//! modem-cli [--config modem.json] [--sim]
//! ```

use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use modem_link::{bringup, spawn_link, BringupConfig, LinkEvent, StreamChannel};
use modem_sim::{SimConfig, SimModem};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_serial::SerialPortBuilderExt;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// On-disk configuration, JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CliConfig {
    /// Serial device the modem is attached to
    port: String,
    /// Speed to open the port at (bring-up probes its own candidates)
    baud: u32,
    #[serde(default)]
    bringup: BringupConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud: modem_link::DEFAULT_BAUD,
            bringup: BringupConfig::default(),
        }
    }
}

fn load_config(path: Option<&str>) -> Result<CliConfig> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path))?;
            serde_json::from_str(&text).with_context(|| format!("parsing config {}", path))
        }
        None => Ok(CliConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config_path: Option<String> = None;
    let mut simulate = false;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config_path = args.next(),
            "--sim" => simulate = true,
            other => anyhow::bail!("unknown argument: {}", other),
        }
    }

    let config = load_config(config_path.as_deref())?;
    let (event_tx, mut event_rx) = mpsc::channel(256);

    let (handle, at) = if simulate {
        info!("running against a simulated modem");
        let (host, modem) = tokio::io::duplex(4096);
        let chan = StreamChannel::new(host);
        let speed = chan.speed_handle();
        speed.store(config.baud, Ordering::SeqCst);
        SimModem::spawn(modem, SimConfig::default(), speed);
        spawn_link(chan, event_tx.clone())
    } else {
        info!(port = %config.port, baud = config.baud, "opening serial port");
        let port = tokio_serial::new(&config.port, config.baud)
            .timeout(Duration::from_millis(100))
            .open_native_async()
            .with_context(|| format!("opening {}", config.port))?;
        spawn_link(StreamChannel::new(port), event_tx.clone())
    };

    let channels = bringup::run(&handle, &at, &config.bringup, &event_tx)
        .await
        .context("modem bring-up failed")?;
    info!(baud = channels.baud, "link established");

    // Watch the link until interrupted
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                handle.shutdown().await;
                return Ok(());
            }
            event = event_rx.recv() => {
                let Some(event) = event else {
                    warn!("event stream closed");
                    return Ok(());
                };
                match event {
                    LinkEvent::ModemReady => info!("modem ready"),
                    LinkEvent::Urc { kind, line } => info!(?kind, "{}", line),
                    LinkEvent::FotaProgress(line) => info!("FOTA: {}", line),
                    LinkEvent::SignalQuality { rssi } => info!(rssi, "signal quality"),
                    LinkEvent::FlowControl { allowed } => info!(allowed, "flow control"),
                    LinkEvent::ChannelOpened { kind } => info!(?kind, "channel opened"),
                    LinkEvent::ChannelClosed { kind } => info!(?kind, "channel closed"),
                    LinkEvent::BringupState(state) => info!(?state, "bring-up"),
                    LinkEvent::Error { source, message } => warn!(%source, "{}", message),
                }
            }
        }
    }
}
