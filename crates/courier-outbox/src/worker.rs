//! Background delivery loop.

use crate::error::OutboxError;
use crate::processor::DeliveryProcessor;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

/// Runs outbox and export sweeps every `sweep_interval` until shut down.
pub struct DeliveryWorker {
    processor: DeliveryProcessor,
    sweep_interval: Duration,
}

impl DeliveryWorker {
    pub fn new(processor: DeliveryProcessor, sweep_interval: Duration) -> Self {
        Self {
            processor,
            sweep_interval,
        }
    }

    /// Spawn the loop. It exits after the current sweep once `shutdown` flips to `true`
    /// or its sender is dropped.
    pub fn start(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = self.sweep_interval.as_millis() as u64, "Delivery worker started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.processor.process_all().await {
                            Ok(_) => {}
                            // another process holds the write lock; the next tick retries
                            Err(OutboxError::Database(e)) if e.is_busy() => {
                                warn!(error = %e, "Delivery sweep skipped, database busy");
                            }
                            Err(e) => error!(error = %e, "Delivery sweep failed"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Delivery worker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::AdapterSet;
    use crate::url_policy::UrlPolicy;
    use courier_core::{OutboxConfig, UrlPolicyConfig};
    use courier_database::AsyncDatabase;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_worker_stops_on_shutdown() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let adapters = AdapterSet::new(
            Arc::new(UrlPolicy::new(&UrlPolicyConfig::default())),
            Duration::from_millis(100),
        );
        let processor = DeliveryProcessor::new(db, adapters, OutboxConfig::default());
        let (tx, rx) = watch::channel(false);

        let handle = DeliveryWorker::new(processor, Duration::from_millis(10)).start(rx);
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("worker should stop")
            .unwrap();
    }
}
