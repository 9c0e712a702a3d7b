//! Periodic auto-replay across orgs.

use crate::scheduler::AutoReplayScheduler;
use crate::ReplayResult;
use courier_database::{queries, AsyncDatabase};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

pub struct ReplayWorker {
    db: AsyncDatabase,
    scheduler: AutoReplayScheduler,
    replay_interval: Duration,
}

impl ReplayWorker {
    pub fn new(db: AsyncDatabase, scheduler: AutoReplayScheduler) -> Self {
        let replay_interval = Duration::from_secs(scheduler.config().replay_interval_secs.max(1));
        Self {
            db,
            scheduler,
            replay_interval,
        }
    }

    /// One pass over every org with dead rows, one org at a time.
    /// Returns the number of orgs whose run completed.
    pub async fn tick(&self) -> ReplayResult<usize> {
        let orgs = self.db.call(|conn| queries::list_orgs_with_dead_events(conn)).await?;
        let mut completed = 0;
        for org_id in orgs {
            match self.scheduler.run_auto_replay(&org_id).await {
                Ok(_) => completed += 1,
                Err(e) => warn!(org_id = %org_id, error = %e, "Auto-replay run failed"),
            }
        }
        Ok(completed)
    }

    pub fn start(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !self.scheduler.config().auto_replay_enabled {
                info!("Auto-replay disabled, replay worker not running");
                return;
            }

            let mut ticker = interval(self.replay_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = self.replay_interval.as_secs(), "Replay worker started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick().await {
                            error!(error = %e, "Replay tick failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Replay worker stopped");
        })
    }
}
