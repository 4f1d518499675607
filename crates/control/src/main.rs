use std::sync::Arc;

use control::broker::AmqpBroker;
use control::config::AppConfig;
use control::http::{self, AppState, HttpLimits};
use control::launcher::build_orchestrator;
use control::pools::PoolSet;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("control=info,tower_http=info")),
        )
        .with(fmt::layer().with_target(false))
        .init();

    let config = AppConfig::from_env()?;
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    rt.block_on(serve(config))
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let broker = AmqpBroker::connect(&config.broker_url).await?;
    let orchestrator = build_orchestrator(config.docker.clone())?;
    let pools = PoolSet::start(config.pool_configs(), Arc::new(broker), orchestrator).await?;
    let pools = Arc::new(pools);
    tracing::info!(languages = ?pools.languages(), "pools ready");

    let app = http::router(
        AppState {
            pools: Arc::clone(&pools),
            limits: config.limits,
            max_code_bytes: config.max_code_bytes,
        },
        HttpLimits {
            max_inflight: config.max_inflight,
            request_timeout: config.request_timeout(),
        },
    );

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "listening");
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    tracing::info!("shutting down worker pools");
    pools.shutdown().await;
    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
