//! API server entry point.

use api::config::Config;
use durable_log::{DurableLog, InMemoryDurableLog, PostgresDurableLog};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::ShippingBehaviour;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            tracing::error!(%error, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(error) => {
                tracing::error!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

async fn serve<L: DurableLog + Clone + 'static>(
    config: &Config,
    log: L,
    metrics_handle: PrometheusHandle,
) -> Result<(), BoxError> {
    let shipping = ShippingBehaviour::Succeed {
        heartbeats: 10,
        step_delay: config.shipping_step,
    };
    let state = api::create_default_state(log, shipping)?;

    if config.recover_on_startup {
        api::spawn_recovery(state.clone());
    }

    let app = api::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let config = Config::from_env();

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;
    api::routes::metrics::describe();

    // 3. Open the durable log and serve
    match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
            let log = PostgresDurableLog::new(pool);
            log.run_migrations().await?;
            tracing::info!("using PostgreSQL durable log");
            serve(&config, log, metrics_handle).await
        }
        None => {
            tracing::warn!("DATABASE_URL not set, saga state will not survive a restart");
            serve(&config, InMemoryDurableLog::new(), metrics_handle).await
        }
    }
}
