use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{error, info, warn};

use crate::admission::Admission;
use crate::config::Config;
use crate::events::{Event, EventBus, EventKind};
use crate::store::Store;
use crate::worker::{JobHandler, Worker};

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub pool_size: usize,
    pub lease_ttl: Duration,
    pub poll_interval: Duration,
    pub reaper_interval: Duration,
    pub shutdown_grace: Duration,
}

impl From<&Config> for PoolSettings {
    fn from(config: &Config) -> Self {
        Self {
            pool_size: config.worker_pool_size,
            lease_ttl: config.worker_lease_ttl,
            poll_interval: config.worker_poll_interval,
            reaper_interval: config.reaper_interval(),
            shutdown_grace: config.worker_shutdown_grace,
        }
    }
}

/// Supervises N workers and the lease reaper, and propagates one shutdown
/// signal to all of them.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    reaper: JoinHandle<()>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_grace: Duration,
}

impl WorkerPool {
    pub fn start(
        settings: PoolSettings,
        store: Store,
        admission: Arc<Admission>,
        events: EventBus,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let pid = std::process::id();

        let workers = (0..settings.pool_size)
            .map(|n| {
                let worker = Worker::new(
                    format!("worker-{pid}-{}", n + 1),
                    store.clone(),
                    admission.clone(),
                    events.clone(),
                    handler.clone(),
                    settings.lease_ttl,
                    settings.poll_interval,
                    shutdown_tx.subscribe(),
                );
                tokio::spawn(worker.run())
            })
            .collect();

        let reaper = tokio::spawn(run_reaper(
            settings.reaper_interval,
            store,
            admission,
            events,
            shutdown_tx.subscribe(),
        ));

        info!(pool_size = settings.pool_size, "worker pool started");

        Self {
            workers,
            reaper,
            shutdown_tx,
            shutdown_grace: settings.shutdown_grace,
        }
    }

    /// Signal every worker, then wait for each to drain its current job,
    /// bounded by the shutdown grace period.
    pub async fn shutdown(self) {
        info!("worker pool stopping");
        let _ = self.shutdown_tx.send(());

        for handle in self.workers {
            if timeout(self.shutdown_grace, handle).await.is_err() {
                warn!("worker did not drain within the grace period; aborting");
            }
        }
        let _ = self.reaper.await;

        info!("worker pool stopped");
    }
}

/// Periodically return expired leases to pending so crashed workers do not
/// strand jobs. Failures are logged and the loop keeps going.
async fn run_reaper(
    period: Duration,
    store: Store,
    admission: Arc<Admission>,
    events: EventBus,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = interval(period);
    // The first tick fires immediately; skip it so a fresh pool does not
    // reap before the workers have even started.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.reclaim_expired_leases().await {
                    Ok(reclaimed) => {
                        for job in reclaimed {
                            warn!(
                                job_id = %job.id,
                                tenant_id = %job.tenant_id,
                                trace_id = %job.trace_id,
                                "expired lease reclaimed; job re-queued"
                            );
                            admission.release(&job.tenant_id);
                            events.publish(
                                Event::for_job(EventKind::JobRetry, &job)
                                    .with_payload(json!({"reclaimed": true})),
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "lease reap failed"),
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}
