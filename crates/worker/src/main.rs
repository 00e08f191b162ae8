//! PDP outbox worker.
//!
//! Polls `pdp_jobs` and propagates schema and application changes to the
//! policy decision point until interrupted.

use std::sync::Arc;

use anyhow::Context;

use portal_infra::db;
use portal_infra::external::alert::{AlertNotifier, LogAlertNotifier, WebhookAlertNotifier};
use portal_infra::external::pdp::{HttpPdpClient, PdpClient};
use portal_infra::jobs::{JobDispatcher, PostgresJobStore};
use portal_infra::WorkerConfig;
use portal_observability::LogFormat;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_format_setting = std::env::var("LOG_FORMAT").ok();
    let (log_format, log_format_error) = LogFormat::from_setting(log_format_setting.as_deref());
    portal_observability::init_with(None, log_format);
    if let Some(error) = log_format_error {
        tracing::warn!(%error, "ignoring LOG_FORMAT; using json");
    }

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;

    let pool = db::connect(&config.database)
        .await
        .context("failed to connect to database")?;
    db::apply_schema(&pool)
        .await
        .context("failed to apply database schema")?;

    let pdp = HttpPdpClient::new(config.pdp.clone()).context("failed to build PDP client")?;
    if let Err(e) = pdp.health_check().await {
        tracing::warn!(error = %e, base_url = %config.pdp.base_url, "PDP health check failed; jobs will retry");
    }
    let pdp: Arc<dyn PdpClient> = Arc::new(pdp);

    let alerts: Arc<dyn AlertNotifier> = match &config.alert_webhook_url {
        Some(url) => Arc::new(WebhookAlertNotifier::new(url.clone()).context("failed to build alert notifier")?),
        None => {
            tracing::warn!("ALERT_WEBHOOK_URL not set; alerts are only logged");
            Arc::new(LogAlertNotifier)
        }
    };

    let handle = JobDispatcher::new(PostgresJobStore::new(pool.clone()), pdp)
        .with_config(config.dispatcher.clone())
        .with_alerts(alerts)
        .spawn();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    handle.shutdown().await;
    pool.close().await;
    Ok(())
}
