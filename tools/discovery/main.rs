//! Spectrometer Discovery Tool
//!
//! Lists spectrometers reachable from this host and exercises the simulated device.
//!
//! # Usage
//!
//! List USB (with `--features usb`) and watch-directory devices:
//! ```bash
//! discovery list --ticks 20
//! ```
//!
//! Scan for BLE spectrometers (with `--features ble`):
//! ```bash
//! discovery ble --timeout 10
//! ```
//!
//! Decode a compilation-options word:
//! ```bash
//! discovery decode 0x0c35
//! ```
//!
//! Talk to a simulated spectrometer whose profile lives in `./profiles/demo.json`:
//! ```bash
//! discovery simulate demo ./profiles
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spectrolink::config::LinkConfig;
use spectrolink::discovery::{AddressList, DeviceBus, DirectoryWatch};
use spectrolink::dispatch::{SimulatedSpectrometer, Spectrometer};
use spectrolink::tracing_init::{self, OutputFormat, TracingConfig};
use spectrolink::{decode_capability_word, DeviceId};

#[derive(Parser)]
#[command(name = "discovery")]
#[command(about = "Find and probe spectrometers", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = spectrolink::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "compact")]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll USB and watch directories, printing the merged device list
    List {
        /// Discovery ticks to run
        #[arg(long, default_value = "1")]
        ticks: u32,

        /// Delay between ticks in milliseconds
        #[arg(long, default_value = "500")]
        interval_ms: u64,
    },

    /// Scan for BLE spectrometers
    Ble {
        /// Scan budget in seconds; the configured value when omitted
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Decode a 16-bit compilation-options word (decimal or 0x-prefixed hex)
    Decode {
        word: String,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Open a simulated spectrometer and read its settings
    Simulate {
        /// Profile name (`<dir>/<name>.json` is loaded when present)
        name: String,

        /// Profile directory
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = LinkConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;

    let tracing_config =
        TracingConfig::from_link_config(&config)?.with_format(cli.log_format);
    tracing_init::init(tracing_config)?;

    match cli.command {
        Commands::List { ticks, interval_ms } => {
            list_devices(&config, ticks, Duration::from_millis(interval_ms)).await
        }
        Commands::Ble { timeout } => scan_ble(&config, timeout).await,
        Commands::Decode { word, json } => decode(&word, json),
        Commands::Simulate { name, dir } => simulate(&name, dir),
    }
}

fn parse_word(text: &str) -> Result<u16> {
    let text = text.trim();
    let word = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => text.parse(),
    };
    word.with_context(|| format!("'{text}' is not a 16-bit word"))
}

fn decode(text: &str, json: bool) -> Result<()> {
    let caps = decode_capability_word(parse_word(text)?);
    if json {
        println!("{}", serde_json::to_string_pretty(&caps)?);
    } else {
        println!("{caps}");
    }
    Ok(())
}

fn build_bus(config: &LinkConfig) -> DeviceBus {
    let mut bus = DeviceBus::new();
    if !config.virtual_dirs.is_empty() {
        bus.push(Box::new(DirectoryWatch::new(config.virtual_dirs.clone())));
    }
    if !config.tcp_devices.is_empty() {
        bus.push(Box::new(AddressList::new(config.tcp_devices.clone())));
    }

    #[cfg(feature = "usb")]
    {
        use spectrolink::discovery::monitor::NusbHotplug;
        use spectrolink::discovery::usb::NusbBus;
        use spectrolink::discovery::{monitor_for_platform, UsbDiscovery};
        use std::sync::Arc;

        let platform = config.platform();
        let usb = Arc::new(NusbBus);
        let monitor = match NusbHotplug::new(platform) {
            Ok(source) => monitor_for_platform(
                platform,
                usb.clone(),
                config.usb.allow_list.clone(),
                Box::new(source),
                config.usb.event_timeout(),
            ),
            Err(e) => {
                tracing::warn!(error = %e, "Hotplug unavailable, staying in polling");
                None
            }
        };
        bus.push(Box::new(
            UsbDiscovery::new(usb, config.usb.allow_list.clone())
                .warmup_polls(config.usb.warmup_polls)
                .continuous_monitoring(config.usb.continuous_monitoring)
                .monitor(monitor),
        ));
    }

    #[cfg(not(feature = "usb"))]
    tracing::info!("Built without the `usb` feature; USB devices are not listed");

    bus
}

async fn list_devices(config: &LinkConfig, ticks: u32, interval: Duration) -> Result<()> {
    let mut bus = build_bus(config);
    for tick in 0..ticks.max(1) {
        if tick > 0 {
            tokio::time::sleep(interval).await;
        }
        let ids = bus.update();
        println!("tick {tick}: {} device(s)", ids.len());
        for id in ids {
            println!("  {id}");
        }
    }
    Ok(())
}

#[cfg(feature = "ble")]
async fn scan_ble(config: &LinkConfig, timeout: Option<u64>) -> Result<()> {
    use spectrolink::discovery::ble::BtleplugScanner;
    use spectrolink::discovery::{BleDiscovery, DiscoveryEvent};
    use tokio::sync::mpsc;

    let budget = timeout.map_or_else(|| config.ble.timeout(), Duration::from_secs);
    let (tx, mut rx) = mpsc::channel(config.ble.channel_capacity);
    let discovery = BleDiscovery::builder()
        .timeout(budget)
        .service_uuid(config.ble.service_uuid)
        .name_prefix(config.ble.name_prefix.clone())
        .channel(tx)
        .build()?;

    let mut scanner = BtleplugScanner::first_adapter(config.ble.service_uuid).await?;
    tracing::info!(?budget, "Scanning for BLE spectrometers");

    let search = {
        let discovery = discovery.clone();
        tokio::spawn(async move { discovery.search(&mut scanner).await })
    };

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(DiscoveryEvent::Found(device)) => {
                    let rssi = device
                        .signal_strength
                        .map_or_else(|| "-".to_string(), |r| format!("{r} dBm"));
                    println!("{}  {}  {}", device.identity, device.display_name, rssi);
                }
                Some(DiscoveryEvent::Finished) | None => break,
            },
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                discovery.stop();
            }
        }
    }

    let found = search.await?;
    println!("{found} device(s) found");
    Ok(())
}

#[cfg(not(feature = "ble"))]
async fn scan_ble(_config: &LinkConfig, _timeout: Option<u64>) -> Result<()> {
    anyhow::bail!("BLE scanning requires the `ble` feature (cargo build --features ble)")
}

fn simulate(name: &str, dir: PathBuf) -> Result<()> {
    let identity = DeviceId::mock(name, dir)?;
    let device = SimulatedSpectrometer::open(&identity)?;
    let mut spec = Spectrometer::new(device);

    println!("{identity}");
    println!("  firmware:         {}", spec.firmware_revision()?);
    println!("  fpga:             {}", spec.fpga_revision()?);
    println!("  integration time: {} ms", spec.integration_time_ms()?);
    println!("  detector gain:    {}", spec.detector_gain()?);
    println!("  detector offset:  {}", spec.detector_offset()?);
    println!("  capabilities:     {}", spec.read_capabilities()?);
    Ok(())
}
