pub mod channels; // broadcast channels between tasks
pub mod config; // YAML configuration
pub mod coordinator; // refresh cycle: push/poll arbitration, decoding, identity
pub mod error; // error helpers
pub mod mqtt; // optional MQTT publisher
pub mod options; // command line options
pub mod prelude;
pub mod register; // register tables and read plans
pub mod scheduler; // periodic refresh loop
pub mod telemetry; // register -> telemetry decoding
pub mod v5; // logger protocol: codec, push server, polling client

// Get the package version from Cargo.toml
const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::prelude::*;

use crate::config::Mode;
use crate::mqtt::Mqtt;
use crate::scheduler::Scheduler;
use crate::v5::server::IngestionServer;

pub fn init_logging(level: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never)
        .try_init();
}

/// Main application entry point. Runs until `cancel` fires, then lets the
/// components wind down and logs their statistics.
pub async fn app(cancel: CancellationToken) -> Result<()> {
    let options = Options::new();

    let config = ConfigWrapper::new(options.config_file.clone())?;

    let loglevel = options.loglevel.clone().unwrap_or_else(|| config.loglevel());
    init_logging(&loglevel);
    info!(
        "solarman-bridge {} starting with config file: {}",
        CARGO_PKG_VERSION, options.config_file
    );
    config.log_summary();

    let channels = Channels::new();

    info!("Initializing components...");

    let coordinator = Coordinator::new(config.clone(), channels.clone());

    // bind before spawning anything so a busy port fails the start-up
    let server = match config.mode() {
        Mode::Push => {
            let server = IngestionServer::bind(&config, coordinator.push_slot()).await?;
            let stats = server.stats();
            let handle = tokio::spawn(server.run(cancel.clone()));
            Some((handle, stats))
        }
        Mode::Poll => None,
    };

    let mqtt = Mqtt::new(config.clone(), channels.clone());
    let mqtt_clone = mqtt.clone();
    let mqtt_cancel = cancel.clone();
    let mqtt_handle = tokio::spawn(async move {
        if let Err(e) = mqtt_clone.start(mqtt_cancel).await {
            error!("MQTT task failed: {}", e);
        }
    });

    let scheduler = Scheduler::new(config.clone(), coordinator.clone());
    let scheduler_cancel = cancel.clone();
    let scheduler_handle = tokio::spawn(async move {
        if let Err(e) = scheduler.start(scheduler_cancel).await {
            error!("Scheduler task failed: {}", e);
        }
    });

    info!("Waiting for shutdown signal...");
    cancel.cancelled().await;
    info!("Shutdown signal received, stopping components...");

    if let Err(e) = scheduler_handle.await {
        error!("Error waiting for scheduler task: {}", e);
    }
    if let Err(e) = mqtt_handle.await {
        error!("Error waiting for mqtt task: {}", e);
    }

    if let Ok(stats) = coordinator.stats.lock() {
        stats.print_summary();
    }
    if let Ok(stats) = mqtt.stats.lock() {
        stats.print_summary();
    }

    if let Some((handle, stats)) = server {
        match handle.await {
            Ok(Err(e)) => error!("Push server failed: {}", e),
            Err(e) => error!("Error waiting for push server task: {}", e),
            Ok(Ok(())) => {}
        }
        if let Ok(stats) = stats.lock() {
            stats.print_summary();
        }
    }

    info!("Application shutdown complete");
    Ok(())
}
