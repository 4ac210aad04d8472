use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use log::info;

mod adapter;
mod config;
mod cycle;
mod error;
mod mqtt;
mod queue;
mod readings;
mod tracker;

#[derive(Parser, Debug)]
#[command(about = "Bluetooth presence gateway")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the configured scan interval, in seconds
    #[arg(long)]
    scan_interval: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let args = Args::parse();

    let config_contents = std::fs::read_to_string(&args.config)
        .with_context(|| format!("unable to read {}", args.config.display()))?;
    let app_config: config::AppConfig =
        toml::de::from_str(&config_contents).context("unable to parse configuration file")?;
    app_config.validate().context("invalid configuration")?;

    let interval = match args.scan_interval.filter(|s| *s > 0) {
        Some(seconds) => std::time::Duration::from_secs(seconds),
        None => app_config.scan_interval(),
    };
    info!(
        "tracking {} device(s), scan interval {interval:?}",
        app_config.devices.len()
    );

    let (channel, eventloop) = mqtt::MqttChannel::new(&app_config.mqtt);
    tokio::spawn(mqtt::run_event_loop(eventloop));

    let session = bluer::Session::new()
        .await
        .context("unable to connect to the system bus")?;
    let bt_adapter = session
        .default_adapter()
        .await
        .context("no Bluetooth adapter found")?;

    let tracker = tracker::PresenceTracker::new();
    let bt = adapter::BluerAdapter::new(bt_adapter, Arc::new(tracker.clone()));
    let aggregator = tracker::PresenceAggregator::new(&app_config.devices);

    let controller = cycle::ScanCycleController::new(
        bt,
        channel,
        tracker,
        aggregator,
        app_config.remove_matched_devices(),
    );
    controller.run(interval).await;

    Ok(())
}
