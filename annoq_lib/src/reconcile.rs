//! Periodic driver advancing the job queue: polls running jobs and starts
//! waiting ones while annotation workers are free.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, instrument};

use annoq_data::Status;

use crate::error::Result;
use crate::job::JobManager;

#[derive(Clone)]
pub struct Reconciler {
    manager: Arc<JobManager>,
}

impl Reconciler {
    pub fn new(manager: Arc<JobManager>) -> Self {
        Self { manager }
    }

    /// One reconciliation pass.
    ///
    /// Per-job failures are logged rather than propagated: the failing job's
    /// record has already been moved to `error` by the operation itself, and
    /// one bad job must not stall the rest of the queue. The worker cap is
    /// advisory capacity control; the actual processes run on the remote
    /// host.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<()> {
        let manager = &self.manager;
        manager.unqueue_inactive()?;

        let (running, waiting) = manager.running_waiting()?;
        debug!(
            running = running.len(),
            waiting = waiting.len(),
            "reconciling queue"
        );

        let mut active = 0usize;
        for mut job in running {
            match manager.poll(&mut job).await {
                Ok(true) => active += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(corpus_id = %job.corpus_id, error = %e, "failed to poll running job")
                }
            }
        }

        let workers = manager.settings().workers;
        for mut job in waiting {
            if active >= workers {
                break;
            }
            let result = match job.status {
                Status::Waiting => manager.start_annotation(&mut job, Utc::now()).await,
                Status::WaitingInstall => manager.start_install(&mut job, Utc::now()).await,
                _ => continue,
            };
            match result {
                Ok(()) => {
                    info!(corpus_id = %job.corpus_id, "started remote process");
                    active += 1;
                }
                Err(e) => {
                    error!(corpus_id = %job.corpus_id, error = %e, "failed to start waiting job")
                }
            }
        }
        Ok(())
    }

    /// Drive [`tick`](Self::tick) on a fixed interval, for deployments
    /// without an external scheduler hitting the advance-queue route.
    pub async fn run(self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if let Err(e) = self.tick().await {
                error!(error = %e, "queue reconciliation failed");
            }
        }
    }
}
