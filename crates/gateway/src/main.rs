//! SSE gateway daemon.

use std::sync::Arc;

use clap::Parser;
use prometheus::Registry;
use tracing::{error, info};

use pulso_gateway::broadcast::BroadcastManager;
use pulso_gateway::config::GatewayConfig;
use pulso_gateway::http::{self, AppState};
use pulso_gateway::metrics::GatewayMetrics;
use pulso_gateway::state::RedisStateReader;
use pulso_gateway::stream::StreamSettings;

#[derive(clap::Parser, Debug)]
#[command(name = "pulso-gateway")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "SSE fanout gateway", long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging(args.debug);

    let config = GatewayConfig::from_env()?;
    info!(
        channel_prefix = %config.channel_prefix,
        state_prefixes = ?config.state_prefixes,
        "starting sse gateway"
    );

    let client = redis::Client::open(config.redis_url.as_str())?;
    let conn = client.get_connection_manager().await?;

    let metrics = GatewayMetrics::new();
    let mut registry = Registry::new();
    metrics.register(&mut registry);

    let manager = BroadcastManager::new(
        client,
        config.channel_prefix.clone(),
        config.queue_capacity,
        metrics.clone(),
    );
    let reader = Arc::new(RedisStateReader::new(conn, config.state_prefixes.clone()));

    let state = Arc::new(AppState {
        manager: manager.clone(),
        reader,
        metrics,
        registry,
        settings: StreamSettings::from(&config),
        min_job_id_len: config.min_job_id_len,
    });

    let app = http::router(state);
    let listener = tokio::net::TcpListener::bind(config.http_addr).await?;
    info!(addr = %config.http_addr, "http endpoints listening");

    tokio::select! {
        served = axum::serve(listener, app) => {
            if let Err(e) = served {
                error!(error = %e, "http server failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    manager.stop();
    Ok(())
}

fn setup_logging(debug: bool) {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};

    let level = if debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("failed to set tracing subscriber");
}
