//! hello provider
//!
//! Registers itself, keeps the registration alive, serves `GET /hello`, and
//! deregisters on shutdown.

use axum::{routing::get, Router};
use clap::Parser;
use tracing::{error, info, warn};

use registry_agent::{
    agent::{bind_and_register, shutdown_signal},
    deregister, logging, Config, RegistryContext, StopReason, DEREGISTER_GRACE,
};

#[derive(Parser)]
#[command(name = "provider")]
#[command(about = "Hello provider registered with the service registry")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "REGISTRY_AGENT_CONFIG", default_value = "./conf/microservice.yaml")]
    config: String,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let config = Config::load(&cli.config)?;
    info!(config = %cli.config, service = %config.service, "Starting provider");

    let ctx = RegistryContext::new(config)?;
    let instance = ctx.config.instance()?.clone();

    let (listener, heartbeat) =
        bind_and_register(ctx.heartbeat_scheduler(), &ctx.config.service, &instance).await?;
    let registration = heartbeat.registration().clone();

    let app = Router::new().route("/hello", get(hello));
    info!(address = %instance.listen_address, "Provider listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    if let Err(e) = &served {
        error!(error = %e, "Server stopped unexpectedly");
    }

    heartbeat.stop();
    match heartbeat.join().await {
        Some(StopReason::HeartbeatFailed(reason)) => {
            warn!(reason = %reason, "Heartbeats had already stopped")
        }
        Some(StopReason::Cancelled) => {}
        None => warn!("Heartbeat task panicked"),
    }

    info!(service_id = %registration.service_id, "Closing instance");
    if let Err(e) = deregister(ctx.client.as_ref(), &registration, DEREGISTER_GRACE).await {
        error!(error = %e, "Deregistration failed");
    }
    info!("Exiting");
    served.map_err(Into::into)
}

async fn hello() -> &'static str {
    "hello world"
}
