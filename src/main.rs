pub mod config;
pub mod controller;
pub mod mqtt;
pub mod network;
pub mod runtime;
pub mod supervisor;

#[cfg(test)]
mod testing;

use crate::config::Config;
use crate::controller::actuator::open_actuator;
use crate::controller::device_controller::DeviceSettings;
use crate::mqtt::session::RumqttSession;
use crate::network::link_monitor::LinkMonitor;
use crate::runtime::SwitchService;
use color_eyre::{eyre::eyre, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Buffer between the collaborator tasks and the service loop
const EVENT_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = Config::default_path();
    let config = Config::load_or_create(&config_path).await?;
    setup_logging_env(config.logging.level()?);
    info!("Loaded configuration from {}", config_path.display());

    let shutdown = CancellationToken::new();
    let (event_tx, event_rx) = mpsc::channel(EVENT_CAPACITY);

    // Output first, so the line is off before anything can reach the broker
    let actuator =
        open_actuator(&config.actuator).map_err(|e| eyre!("Failed to open output: {}", e))?;
    let settings = DeviceSettings::from_config(&config.mqtt)?;
    let session = RumqttSession::new(
        config.mqtt.to_mqtt_options(),
        event_tx.clone(),
        shutdown.child_token(),
    );

    let service = SwitchService::create(
        settings,
        config.mqtt.retry_interval(),
        Box::new(session),
        actuator,
        event_rx,
    )?;

    info!(
        "Broker {}:{} as '{}'",
        config.mqtt.broker_host, config.mqtt.broker_port, config.mqtt.client_id
    );
    let link_monitor = LinkMonitor::new(&config.network).spawn(event_tx, shutdown.child_token());

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => signal_token.cancel(),
            Err(e) => error!("Failed to listen for shutdown signals: {}", e),
        }
    });

    let stopped = service.start().run_until_shutdown(shutdown.clone()).await;
    shutdown.cancel();

    if let Err(e) = link_monitor.await {
        warn!("Link monitor ended abnormally: {}", e);
    }
    info!("remoteswitch stopped, output left {}", stopped.actuator_state());
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    Ok(())
}

fn setup_logging_env(level: Level) {
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

async fn wait_for_signal() -> std::io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received Ctrl-C");
        }
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
    Ok(())
}
