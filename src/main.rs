use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use redactor_store::config::Config;
use redactor_store::services::sweeper;
use redactor_store::{
    ApiKeyStore, Clock, FieldKey, PgGateway, SessionStore, StoreOptions, SystemClock,
    TracingObserver,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    tracing::info!("✅ Configuration loaded successfully");

    // Refuse to start with a key the document store would reject.
    FieldKey::new(&config.document_name_key).context("DOCUMENT_NAME_KEY rejected")?;

    let gateway = Arc::new(
        PgGateway::from_url(&config.database_url, config.pool_max_size)
            .context("Failed to create database pool")?,
    );
    gateway.migrate().await.context("Failed to apply schema")?;
    tracing::info!("✅ Database schema ready");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut options = StoreOptions::default().with_observer(Arc::new(TracingObserver));
    if let Some(timeout) = config.op_timeout {
        options = options.with_timeout(timeout);
    }

    let sessions = SessionStore::new(gateway.clone(), clock.clone()).with_options(options.clone());
    let api_keys = ApiKeyStore::new(gateway, clock).with_options(options);

    tracing::info!(
        "✅ Sweeper started (runs every {}s)",
        config.sweep_interval.as_secs()
    );

    let mut ticker = tokio::time::interval(config.sweep_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown requested");
                break;
            }
        }

        tracing::info!("🧹 Running scheduled sweep of expired credentials...");
        match sweeper::sweep_expired(&sessions, &api_keys).await {
            Ok(report) => {
                tracing::info!(
                    "✅ Sweep completed: {} session(s), {} API key(s) removed",
                    report.sessions,
                    report.api_keys
                );
            }
            Err(e) => {
                tracing::error!("❌ Sweep failed: {}", e);
            }
        }
    }

    Ok(())
}
