//! hello consumer
//!
//! Registers its own service, discovers the provider, and serves
//! `GET /sayhello` by forwarding to whichever provider instance is up.

use axum::{extract::State, http::StatusCode, routing::get, Router};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use registry_agent::{
    agent::shutdown_signal, discover_and_cache, logging, Config, EndpointSelector, RegistryApi,
    RegistryContext, ServiceIdentity,
};

/// Listen address used when the config has no instance section
const DEFAULT_LISTEN: &str = "127.0.0.1:8090";

#[derive(Parser)]
#[command(name = "consumer")]
#[command(about = "Hello consumer discovering its provider through the service registry")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "REGISTRY_AGENT_CONFIG", default_value = "./conf/consumer.yaml")]
    config: String,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Clone)]
struct AppState {
    selector: EndpointSelector,
    provider: ServiceIdentity,
    http: reqwest::Client,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let config = Config::load(&cli.config)?;
    info!(config = %cli.config, service = %config.service, "Starting consumer");

    let ctx = RegistryContext::new(config)?;
    let provider = ctx.config.provider()?.clone();

    let service_id = ctx.client.ensure_service(&ctx.config.service).await?;
    discover_and_cache(ctx.client.as_ref(), &ctx.cache, &service_id, &provider).await?;

    let state = Arc::new(AppState {
        selector: ctx.selector(),
        provider: provider.clone(),
        http: reqwest::Client::new(),
    });
    match say_hello(&state).await {
        Ok(reply) => info!(reply = %reply, "Reply from provider"),
        Err((status, message)) => {
            warn!(status = status.as_u16(), message = %message, "Provider call failed")
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let subscriber = ctx.watch_subscriber(provider);
    let watch_task = tokio::spawn(async move {
        if let Err(e) = subscriber.run(&service_id, shutdown_rx).await {
            warn!(error = %e, "Provider watch stopped");
        }
    });

    let listen = ctx
        .config
        .instance
        .as_ref()
        .map(|i| i.listen_address.clone())
        .unwrap_or_else(|| DEFAULT_LISTEN.to_string());

    let app = Router::new()
        .route("/sayhello", get(say_hello_handler))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!(address = %listen, "Consumer listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = watch_task.await;
    info!("Exiting");
    Ok(())
}

async fn say_hello_handler(State(state): State<Arc<AppState>>) -> (StatusCode, String) {
    match say_hello(&state).await {
        Ok(reply) => (StatusCode::OK, reply),
        Err(failure) => failure,
    }
}

/// Call `GET {endpoint}/hello` on the selected provider instance
async fn say_hello(state: &AppState) -> Result<String, (StatusCode, String)> {
    let endpoint = state
        .selector
        .select(&state.provider)
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;

    let response = state
        .http
        .get(format!("{}/hello", endpoint.trim_end_matches('/')))
        .send()
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, format!("do request failed: {}", e)))?;

    response
        .text()
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, format!("read response body failed: {}", e)))
}
