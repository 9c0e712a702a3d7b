//! Periodic ledger maintenance.

use crate::ledger::IdempotencyLedger;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

/// Sweeps expired claims and purges old responses every `sweep_interval_secs`.
pub struct LedgerSweeper {
    ledger: IdempotencyLedger,
}

impl LedgerSweeper {
    pub fn new(ledger: IdempotencyLedger) -> Self {
        Self { ledger }
    }

    pub fn start(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let every = Duration::from_secs(self.ledger.config().sweep_interval_secs.max(1));
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = every.as_secs(), "Ledger sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.ledger.run_maintenance(Utc::now()).await {
                            error!(error = %e, "Ledger sweep failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Ledger sweeper stopped");
        })
    }
}
