//! Watch a power station and print its state whenever it changes noticeably.

use anyhow::{anyhow, Result};
use clap::Parser;
use powerstation_ble::{
    format_minutes, load_config, BleTransport, DeviceSnapshot, Error, LinkStatus, PowerStationClient,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "powerstation-ble")]
#[command(about = "Monitor a portable power station over Bluetooth Low Energy")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "powerstation.toml")]
    config: PathBuf,

    /// Advertised name or address of the station, overrides the configuration
    #[arg(short, long)]
    target: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("powerstation-ble v{}", env!("CARGO_PKG_VERSION"));

    let mut config = load_config(&args.config)?;
    if let Some(target) = args.target {
        config.device.target = Some(target);
    }
    let target = config
        .device
        .target
        .clone()
        .ok_or(anyhow!("No device given, pass --target or set [device] target"))?;

    let transport = BleTransport::new()
        .await?
        .with_scan_timeout(Duration::from_secs(config.device.scan_timeout_secs));
    let mut client = PowerStationClient::new(transport, config.client_options());

    match client.connect(&target).await {
        Ok(()) => {}
        Err(err @ Error::GaveUp { .. }) => return Err(err.into()),
        Err(err) => warn!(error = %err, "Initial connection failed, will keep retrying"),
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down");
                if let Err(err) = client.disconnect().await {
                    warn!(error = %err, "Disconnect failed");
                }
                return Ok(());
            }
            _ = ticker.tick() => {
                client.tick().await;

                if let LinkStatus::GaveUp { failures } = client.status() {
                    return Err(Error::GaveUp { failures }.into());
                }

                if client.has_significant_change() {
                    print_snapshot(client.snapshot());
                    client.mark_published();
                }
            }
        }
    }
}

fn print_snapshot(snapshot: &DeviceSnapshot) {
    let on_off = |on: bool| if on { "on" } else { "off" };
    println!(
        "{:5.1}% {:5.2}V | in {}W (ac {}W, dc {}W) | out {}W (total {}W) | usb {} dc {} ac {} | full in {} | empty in {}",
        snapshot.battery_percent,
        snapshot.battery_voltage,
        snapshot.input_watts,
        snapshot.ac_input_watts,
        snapshot.dc_input_watts,
        snapshot.output_watts,
        snapshot.total_power_watts,
        on_off(snapshot.outputs.usb),
        on_off(snapshot.outputs.dc),
        on_off(snapshot.outputs.ac),
        format_minutes(snapshot.minutes_to_full),
        format_minutes(snapshot.minutes_to_empty),
    );
    if snapshot.settings.received {
        let settings = &snapshot.settings;
        println!(
            "  charge limits {}%..{}% | light {:?} | buzzer {} | silent charging {}",
            settings.discharge_limit_pct,
            settings.charge_limit_pct,
            settings.light_mode,
            on_off(settings.buzzer_enabled),
            on_off(settings.silent_charging),
        );
    }
}
