//! Component wiring and the long-running `run` command.

use anyhow::Context as _;
use courier_core::{Config, Paths};
use courier_database::{queries, AsyncDatabase, StatusCounts};
use courier_outbox::{
    AdapterSet, DeliveryProcessor, DeliveryWorker, HttpWebhookSender, OutboxStore, UrlPolicy,
};
use dead_letter_auto_replay::{AutoReplayScheduler, ReplayWorker};
use idempotency_ledger::{IdempotencyLedger, LedgerSweeper};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

const USER_AGENT: &str = concat!("courier/", env!("CARGO_PKG_VERSION"));

/// Everything a command needs, built once from the loaded config.
pub struct Context {
    pub config: Config,
    pub db: AsyncDatabase,
    pub store: OutboxStore,
    pub processor: DeliveryProcessor,
    pub scheduler: AutoReplayScheduler,
    pub ledger: IdempotencyLedger,
}

impl Context {
    pub async fn open(config: Config, paths: &Paths) -> anyhow::Result<Self> {
        paths.ensure_dirs()?;
        let db_path = config.database_file(paths);
        let db = AsyncDatabase::open(&db_path)
            .await
            .with_context(|| format!("opening database at {}", db_path.display()))?;

        let policy = Arc::new(UrlPolicy::new(&config.url_policy));
        let webhook = Arc::new(HttpWebhookSender::new(USER_AGENT)?);
        // No mail transport ships with courier; email events stay pending as skipped.
        let adapters = AdapterSet::new(
            policy.clone(),
            Duration::from_millis(config.outbox.adapter_timeout_ms),
        )
        .with_webhook(webhook);

        let claim_ttl = chrono::Duration::seconds(config.outbox.claim_ttl_seconds as i64);
        Ok(Self {
            store: OutboxStore::new(policy),
            processor: DeliveryProcessor::new(db.clone(), adapters.clone(), config.outbox.clone()),
            scheduler: AutoReplayScheduler::new(
                db.clone(),
                adapters,
                config.auto_replay.clone(),
                claim_ttl,
            ),
            ledger: IdempotencyLedger::new(db.clone(), config.idempotency.clone()),
            db,
            config,
        })
    }
}

/// Start all background loops and wait for Ctrl-C.
pub async fn run(ctx: Context) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let delivery = DeliveryWorker::new(
        ctx.processor.clone(),
        Duration::from_millis(ctx.config.outbox.sweep_interval_ms.max(1)),
    )
    .start(shutdown_rx.clone());
    let replay = ReplayWorker::new(ctx.db.clone(), ctx.scheduler.clone()).start(shutdown_rx.clone());
    let sweeper = LedgerSweeper::new(ctx.ledger.clone()).start(shutdown_rx);

    info!("Courier started");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    // Receivers also stop if the sender is dropped, so a failed send is harmless.
    let _ = shutdown_tx.send(true);
    for (name, handle) in [("delivery", delivery), ("replay", replay), ("sweeper", sweeper)] {
        if let Err(e) = handle.await {
            warn!(worker = name, error = %e, "Worker task ended abnormally");
        }
    }

    ctx.db.close().await?;
    info!("Courier stopped");
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub org_id: Option<String>,
    pub outbox: StatusCounts,
    pub exports: StatusCounts,
}

pub async fn status(ctx: &Context, org_id: Option<String>) -> anyhow::Result<StatusReport> {
    let org = org_id.clone();
    let (outbox, exports) = ctx
        .db
        .call(move |conn| {
            let outbox = queries::count_outbox_by_status(conn, org.as_deref())?;
            let exports = queries::count_exports_by_status(conn, org.as_deref())?;
            Ok((outbox, exports))
        })
        .await?;
    Ok(StatusReport {
        org_id,
        outbox,
        exports,
    })
}

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn context(dir: &TempDir) -> Context {
        let paths = Paths::with_base_dir(dir.path().to_path_buf());
        Context::open(Config::default(), &paths).await.unwrap()
    }

    #[tokio::test]
    async fn test_open_creates_database_under_base_dir() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;
        assert!(dir.path().join("courier.sqlite").exists());
        ctx.db.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn test_status_on_empty_database() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;
        let report = status(&ctx, Some("org-a".into())).await.unwrap();
        assert_eq!(report.outbox, StatusCounts::default());
        assert_eq!(report.exports, StatusCounts::default());
        assert_eq!(report.org_id.as_deref(), Some("org-a"));
    }

    #[tokio::test]
    async fn test_one_shot_commands_on_empty_database() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;
        assert!(ctx.processor.process_all().await.unwrap().is_empty());
        let replay = ctx.scheduler.run_auto_replay("org-a").await.unwrap();
        assert_eq!(replay.processed, 0);
        let sweep = ctx.ledger.run_maintenance(chrono::Utc::now()).await.unwrap();
        assert_eq!((sweep.expired_claims, sweep.purged_records), (0, 0));
    }
}
