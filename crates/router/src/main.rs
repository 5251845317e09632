//! Event router daemon.

use std::sync::Arc;

use clap::Parser;
use prometheus::Registry;
use tokio::sync::watch;
use tracing::{error, info};

use pulso_router::config::RouterConfig;
use pulso_router::consumer::ShardConsumer;
use pulso_router::http::{self, AppState};
use pulso_router::metrics::RouterMetrics;
use pulso_router::processor::Processor;
use pulso_router::reclaimer::Reclaimer;
use pulso_router::store::RedisEventStore;

#[derive(clap::Parser, Debug)]
#[command(name = "pulso-router")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Sharded event router", long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging(args.debug);

    let config = RouterConfig::from_env()?;
    info!(
        consumer = %config.consumer_name,
        group = %config.consumer_group,
        domains = config.domains.len(),
        "starting event router"
    );

    let store = Arc::new(
        RedisEventStore::connect(
            &config.redis_streams_url,
            &config.redis_pubsub_url,
            config.consumer_group.clone(),
            config.state_ttl,
            config.published_ttl,
        )
        .await?,
    );

    let metrics = RouterMetrics::new();
    let mut registry = Registry::new();
    metrics.register(&mut registry);

    let processor = Arc::new(Processor::new(
        store.clone(),
        metrics.clone(),
        config.channel_prefix.clone(),
        config.published_prefix.clone(),
    ));

    let mut stream_keys = Vec::new();
    for domain in &config.domains {
        for stream_key in domain.stream_keys() {
            store.ensure_group(&stream_key).await?;
            stream_keys.push(stream_key);
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = Vec::new();
    for domain in &config.domains {
        for stream_key in domain.stream_keys() {
            let consumer = ShardConsumer::new(
                store.clone(),
                processor.clone(),
                &config,
                stream_key.clone(),
                domain.state_prefix.clone(),
            );
            let shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = consumer.run(shutdown).await {
                    error!(stream = %stream_key, error = %e, "shard consumer exited");
                }
            }));
        }
    }

    let reclaimer = Reclaimer::new(store.clone(), processor.clone(), metrics.clone(), &config);
    let reclaimer_shutdown = shutdown_rx.clone();
    tasks.push(tokio::spawn(reclaimer.run(reclaimer_shutdown)));

    let state = Arc::new(AppState {
        store,
        registry,
        tasks,
        stream_keys,
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

    // Consumers observe the flip on their next select iteration.
    let _ = shutdown_tx.send(true);
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
