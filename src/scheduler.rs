//! Periodic worker driver.
//!
//! Each worker is an explicit object with injected dependencies. Spawning it
//! starts a `tokio::time::interval` loop; the returned handle stops it. A
//! failing tick is logged and the loop carries on with the next one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::logging::OperationTimer;
use crate::metrics;

/// A unit of periodic work
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// Name used in logs and metrics
    fn name(&self) -> &'static str;

    /// Run one bounded pass
    async fn tick(&self) -> anyhow::Result<()>;
}

/// Handle to a running worker loop
pub struct WorkerHandle {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Signal the loop and wait for the in-flight tick to finish
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(worker = self.name, error = %e, "worker task ended abnormally");
        }
        info!(worker = self.name, "worker stopped");
    }
}

/// Start `worker` on a fixed period; the first tick runs immediately
pub fn spawn_worker<W: Worker>(worker: Arc<W>, period: Duration) -> WorkerHandle {
    let (shutdown, mut stop) = watch::channel(false);
    let name = worker.name();

    let task = tokio::spawn(async move {
        info!(worker = name, period_secs = period.as_secs(), "worker started");
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stop.changed() => break,
            }

            run_tick(worker.as_ref()).await;

            if *stop.borrow() {
                break;
            }
        }
    });

    WorkerHandle { name, shutdown, task }
}

/// Run one tick with timing, logging and metrics
pub async fn run_tick<W: Worker + ?Sized>(worker: &W) -> bool {
    let timer = OperationTimer::new(worker.name());
    let result = worker.tick().await;
    let elapsed = timer.finish();
    let ok = result.is_ok();
    if let Err(e) = result {
        error!(worker = worker.name(), error = %e, "worker tick failed");
    }
    metrics::record_worker_tick(worker.name(), elapsed, ok);
    ok
}
