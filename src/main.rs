//! tick-push: a time notification service
//!
//! Clients connect over TCP and send a single line:
//! - `START` switches the connection into a push stream of JSON
//!   notifications carrying the current time, one per interval
//! - anything else is answered with a farewell and the connection is closed
//!
//! Features:
//! - One independent task per connection
//! - Graceful shutdown on Ctrl-C
//! - Configuration via CLI arguments or TOML file

mod config;
mod notify;
mod server;

use config::Config;
use server::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

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

    info!(
        listen = %config.listen,
        workers = ?config.workers,
        interval_ms = config.interval.as_millis() as u64,
        max_request_line = config.max_request_line,
        "Starting tick-push server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(serve(config))
}

/// Bind, then run until Ctrl-C or a fatal accept error.
async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::bind(&config).await?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received");
                shutdown.trigger();
            }
            Err(e) => error!(error = %e, "Failed to listen for interrupt"),
        }
    });

    server.run().await?;
    info!("Server stopped");
    Ok(())
}
