// blelink: BLE Central / Peripheral CLI
//
// Scan and inspect nearby peripherals through btleplug, advertise this host as
// a peripheral through BlueZ, or run both roles against a simulated radio.

mod central;
mod config;
#[cfg(target_os = "linux")]
mod peripheral;

use anyhow::{Context, Result};
use blelink_core::profile::short_uuid;
use blelink_core::sim::{Beacon, SimulatedAir};
use blelink_core::{
    Central, CentralEvent, FixedBatteryLevel, GattProfile, Peripheral, PeripheralEvent,
    RadioAdapter, ScanConfig,
};
use clap::{Parser, Subcommand};
use colored::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "blelink")]
#[command(about = "blelink: BLE Central and Peripheral toolkit", long_about = None)]
#[command(version)]
struct Cli {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Bluetooth adapter to use (e.g. hci0)
    #[arg(short, long, global = true)]
    adapter: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for nearby peripherals
    Scan {
        /// Stop after this many seconds (default: config, else until Ctrl-C)
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// Connect to a peripheral, list its services and disconnect
    Inspect {
        address: String,
        /// Seconds to scan for the device before connecting
        #[arg(short, long, default_value = "5")]
        scan: u64,
    },
    /// Advertise this host as a peripheral (Linux / BlueZ)
    Advertise,
    /// Run both roles against a simulated radio
    Demo,
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Scan { duration } => cmd_scan(cli.adapter, duration).await,
        Commands::Inspect { address, scan } => cmd_inspect(cli.adapter, address, scan).await,
        Commands::Advertise => cmd_advertise(cli.adapter).await,
        Commands::Demo => cmd_demo().await,
        Commands::Config { action } => cmd_config(action).await,
    }
}

// ============================================================================
// CENTRAL
// ============================================================================

async fn open_central(
    adapter_override: Option<String>,
    config: &config::Config,
) -> Result<(Central, UnboundedReceiver<CentralEvent>)> {
    let name = adapter_override.or_else(|| config.adapter.clone());
    let host = central::open_adapter(name.as_deref()).await?;
    let radio = central::BtleplugRadio::new(host)?;
    let adapter = RadioAdapter::new(Arc::new(radio)).context("Bluetooth LE unavailable")?;

    let (tx, rx) = mpsc::unbounded_channel();
    let central = Central::new(&adapter, Arc::new(tx))?;
    Ok((central, rx))
}

/// Resolves after `duration`, or on Ctrl-C.
async fn stop_signal(duration: Option<Duration>) {
    match duration {
        Some(duration) => {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

async fn cmd_scan(adapter: Option<String>, duration: Option<u64>) -> Result<()> {
    let config = config::Config::load()?;
    let scan = ScanConfig {
        duration_secs: duration.or(config.scan.duration_secs),
    };
    scan.validate()?;

    let (central, mut rx) = open_central(adapter, &config).await?;
    central.start_scan()?;

    match scan.duration() {
        Some(d) => println!("{} for {}s...", "Scanning".bold(), d.as_secs()),
        None => println!("{} (Ctrl-C to stop)...", "Scanning".bold()),
    }
    println!();

    let stop = stop_signal(scan.duration());
    tokio::pin!(stop);
    let mut stopping = false;
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                let done = matches!(event, CentralEvent::ScanStopped);
                print_central(&event);
                if done {
                    break;
                }
            }
            _ = &mut stop, if !stopping => {
                stopping = true;
                central.stop_scan();
            }
        }
    }

    println!();
    println!("{} ({} found)", "Scan complete".bold(), central.discovered().len());
    Ok(())
}

async fn cmd_inspect(adapter: Option<String>, address: String, scan_secs: u64) -> Result<()> {
    let config = config::Config::load()?;
    let (central, mut rx) = open_central(adapter, &config).await?;

    // The host stack only connects to devices it has seen advertising.
    central.start_scan()?;
    let seen = tokio::time::timeout(Duration::from_secs(scan_secs), async {
        while let Some(event) = rx.recv().await {
            if let CentralEvent::PeripheralDiscovered(p) = &event {
                if p.address.eq_ignore_ascii_case(&address) {
                    return true;
                }
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    if !seen {
        println!("  {} {} not surfaced by scan, trying anyway", "!".yellow(), address);
    }

    central.connect(&address)?;
    while let Some(event) = rx.recv().await {
        let done = matches!(event, CentralEvent::Disconnected { .. });
        if !matches!(event, CentralEvent::PeripheralDiscovered(_)) {
            print_central(&event);
        }
        if done {
            break;
        }
    }

    println!();
    match central.connection().profile() {
        Some(profile) => print_profile(&address, &profile),
        None => anyhow::bail!("No services discovered on {}", address),
    }
    Ok(())
}

// ============================================================================
// PERIPHERAL
// ============================================================================

#[cfg(target_os = "linux")]
async fn cmd_advertise(adapter: Option<String>) -> Result<()> {
    use blelink_core::BatterySource;

    let config = config::Config::load()?;
    let name = adapter.or_else(|| config.adapter.clone());
    let host = peripheral::open_adapter(name.as_deref()).await?;
    let radio = peripheral::BluerRadio::new(host).await?;
    let adapter = RadioAdapter::new(Arc::new(radio)).context("Bluetooth LE unavailable")?;

    let battery: Arc<dyn BatterySource> = match peripheral::SysfsBattery::detect() {
        Some(battery) => Arc::new(battery),
        None => Arc::new(FixedBatteryLevel(100)),
    };
    let (tx, mut rx) = mpsc::unbounded_channel();
    let peripheral = Peripheral::start(&adapter, config.peripheral.clone(), battery, Arc::new(tx))?;
    peripheral.start_advertising()?;

    println!(
        "{} as {} (Ctrl-C to stop)",
        "Advertising".bold(),
        config.peripheral.advertisement.device_name.bright_cyan()
    );
    println!();

    let stop = tokio::signal::ctrl_c();
    tokio::pin!(stop);
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => print_peripheral(&event),
                None => break,
            },
            _ = &mut stop => break,
        }
    }

    peripheral.shutdown();
    println!();
    println!("{} Peripheral stopped", "✓".green());
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn cmd_advertise(_adapter: Option<String>) -> Result<()> {
    anyhow::bail!("advertise needs BlueZ and is only available on Linux")
}

// ============================================================================
// DEMO
// ============================================================================

async fn cmd_demo() -> Result<()> {
    let config = config::Config::load()?;
    println!("{}", "Simulated radio demo".bold());
    println!();

    let air = SimulatedAir::new();
    air.add_beacon(Beacon::new("11:11:11:11:11:11", Some("Lamp"), -42));
    air.add_beacon(Beacon::new("22:22:22:22:22:22", Some("Lamp"), -58));
    air.add_beacon(Beacon::new("33:33:33:33:33:33", Some("Fan"), -71));

    let peripheral_radio = air.radio("P0:00:00:00:00:01", -45);
    let peripheral_adapter = RadioAdapter::new(Arc::new(peripheral_radio.clone()))?;
    let (ptx, mut prx) = mpsc::unbounded_channel();
    let peripheral = Peripheral::start(
        &peripheral_adapter,
        config.peripheral.clone(),
        Arc::new(FixedBatteryLevel(76)),
        Arc::new(ptx),
    )?;
    peripheral.start_advertising()?;
    print_peripheral(&next(&mut prx).await?);

    let central_adapter = RadioAdapter::new(Arc::new(air.radio("C0:00:00:00:00:01", -50)))?;
    let (ctx, mut crx) = mpsc::unbounded_channel();
    let central = Central::new(&central_adapter, Arc::new(ctx))?;
    central.start_scan()?;

    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(event) = crx.try_recv() {
        print_central(&event);
    }

    let target = peripheral_radio.address().to_string();
    central.connect(&target)?;
    loop {
        let event = next(&mut crx).await?;
        print_central(&event);
        if matches!(event, CentralEvent::Disconnected { .. }) {
            break;
        }
    }

    // The peripheral side of the visit, ending when advertising resumes.
    loop {
        let event = next(&mut prx).await?;
        print_peripheral(&event);
        if event == PeripheralEvent::AdvertisingStarted {
            break;
        }
    }

    println!();
    if let Some(profile) = central.connection().profile() {
        print_profile(&target, &profile);
        println!();
    }

    println!("{}", "Power-cycling the peripheral radio".bold());
    peripheral_radio.set_powered(false);
    peripheral_radio.set_powered(true);
    loop {
        let event = next(&mut prx).await?;
        print_peripheral(&event);
        if event == PeripheralEvent::AdvertisingStarted {
            break;
        }
    }

    if let Some(level) = peripheral.battery_level() {
        println!();
        println!("Battery level served: {}%", level);
    }
    peripheral.shutdown();
    println!();
    println!("{}", "Demo complete".green().bold());
    Ok(())
}

async fn next<E>(rx: &mut UnboundedReceiver<E>) -> Result<E> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .context("Timed out waiting for the simulated radio")?
        .context("Event channel closed")
}

// ============================================================================
// CONFIG
// ============================================================================

async fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{} = {}", key.bright_cyan(), value),
            None if config.list().iter().any(|(k, _)| *k == key) => {
                println!("{} = {}", key.bright_cyan(), "(unset)".dimmed())
            }
            None => anyhow::bail!("Unknown config key: {}", key),
        },

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<20} {}", key.bright_cyan(), value);
            }

            println!();
            println!("  {}", config::Config::config_file()?.display().to_string().dimmed());
        }
    }

    Ok(())
}

// ============================================================================
// OUTPUT
// ============================================================================

fn uuid_label(uuid: &Uuid) -> String {
    match short_uuid(uuid) {
        Some(short) => format!("0x{:04x}", short),
        None => uuid.to_string(),
    }
}

fn print_central(event: &CentralEvent) {
    match event {
        CentralEvent::PeripheralDiscovered(p) => println!(
            "  {} {} {} {}",
            "•".bright_green(),
            p.name.as_deref().unwrap_or("(unnamed)").bright_cyan(),
            p.address.dimmed(),
            format!("{} dBm", p.rssi).dimmed()
        ),
        CentralEvent::ScanFailed { .. } => println!("  {} {}", "✗".red(), event),
        CentralEvent::ServiceDiscoveryStopped {
            succeeded: false, ..
        } => println!("  {} {}", "✗".red(), event),
        _ => println!("  {} {}", "central".cyan(), event),
    }
}

fn print_peripheral(event: &PeripheralEvent) {
    match event {
        PeripheralEvent::AdvertisingFailed { .. } => println!("  {} {}", "✗".red(), event),
        _ => println!("  {} {}", "peripheral".magenta(), event),
    }
}

fn print_profile(address: &str, profile: &GattProfile) {
    println!(
        "{} {} ({} services, {} characteristics)",
        "Profile".bold(),
        address.bright_cyan(),
        profile.services().len(),
        profile.characteristic_count()
    );
    for (s, service) in profile.services().iter().enumerate() {
        println!(
            "  S{} {} {}",
            s,
            uuid_label(&service.uuid).bright_yellow(),
            format!("({:?})", service.kind).to_lowercase().dimmed()
        );
        for (c, characteristic) in service.characteristics.iter().enumerate() {
            println!(
                "    S{}.C{} {} {}",
                s,
                c,
                uuid_label(&characteristic.uuid),
                characteristic.capabilities.to_string().dimmed()
            );
        }
    }
}
