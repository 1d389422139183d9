//! Backstop sweeps
//!
//! The API process drives grace periods, auto-reassignment and inactivity with
//! in-process timers. Timers die with their process, so these sweeps find the
//! sessions whose deadline passed and apply the same idempotent transitions.
//! Running them while the API's timers are alive is safe.

use deskchat_engine::ChatEngine;
use std::time::Duration;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};

use crate::config::WorkerConfig;

/// Sessions moved by one pass of every sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub grace_expired: usize,
    pub requeued_reassigned: usize,
    pub abandoned: usize,
}

#[derive(Clone)]
pub struct Sweeper {
    engine: ChatEngine,
}

impl Sweeper {
    pub fn new(engine: ChatEngine) -> Self {
        Self { engine }
    }

    /// Requeue sessions whose staff grace period ran out
    pub async fn sweep_grace(&self, now: OffsetDateTime) -> usize {
        match self.engine.supervisor.sweep_expired_grace(now).await {
            Ok(count) => {
                if count > 0 {
                    tracing::info!(count, "Grace sweep requeued sessions");
                }
                count
            }
            Err(e) => {
                tracing::error!(error = %e, "Grace sweep failed");
                0
            }
        }
    }

    /// Retry assignment for sessions stuck in the queue after a requeue
    pub async fn sweep_requeued(&self, now: OffsetDateTime) -> usize {
        match self.engine.supervisor.sweep_stale_requeued(now).await {
            Ok(count) => {
                if count > 0 {
                    tracing::info!(count, "Auto-reassign sweep assigned sessions");
                }
                count
            }
            Err(e) => {
                tracing::error!(error = %e, "Auto-reassign sweep failed");
                0
            }
        }
    }

    /// Abandon sessions whose guest went silent
    pub async fn sweep_inactive(&self, now: OffsetDateTime) -> usize {
        match self.engine.supervisor.sweep_inactive(now).await {
            Ok(count) => {
                if count > 0 {
                    tracing::info!(count, "Inactivity sweep abandoned sessions");
                }
                count
            }
            Err(e) => {
                tracing::error!(error = %e, "Inactivity sweep failed");
                0
            }
        }
    }

    pub async fn refresh_settings(&self) {
        if let Err(e) = self.engine.settings().refresh().await {
            tracing::error!(error = %e, "Recovery settings refresh failed");
        }
    }

    /// One pass of every sweep, in deadline order
    pub async fn run_all(&self, now: OffsetDateTime) -> SweepReport {
        SweepReport {
            grace_expired: self.sweep_grace(now).await,
            requeued_reassigned: self.sweep_requeued(now).await,
            abandoned: self.sweep_inactive(now).await,
        }
    }

    /// Register every sweep as a repeated job
    pub async fn schedule(
        &self,
        scheduler: &JobScheduler,
        config: &WorkerConfig,
    ) -> Result<(), JobSchedulerError> {
        let sweeper = self.clone();
        scheduler
            .add(repeated(config.grace_sweep_interval, move || {
                let sweeper = sweeper.clone();
                async move {
                    sweeper.sweep_grace(OffsetDateTime::now_utc()).await;
                }
            })?)
            .await?;

        let sweeper = self.clone();
        scheduler
            .add(repeated(config.requeue_sweep_interval, move || {
                let sweeper = sweeper.clone();
                async move {
                    sweeper.sweep_requeued(OffsetDateTime::now_utc()).await;
                }
            })?)
            .await?;

        let sweeper = self.clone();
        scheduler
            .add(repeated(config.inactivity_sweep_interval, move || {
                let sweeper = sweeper.clone();
                async move {
                    sweeper.sweep_inactive(OffsetDateTime::now_utc()).await;
                }
            })?)
            .await?;

        let sweeper = self.clone();
        scheduler
            .add(repeated(config.settings_refresh_interval, move || {
                let sweeper = sweeper.clone();
                async move {
                    sweeper.refresh_settings().await;
                }
            })?)
            .await?;

        tracing::info!(
            grace_secs = config.grace_sweep_interval.as_secs(),
            requeue_secs = config.requeue_sweep_interval.as_secs(),
            inactivity_secs = config.inactivity_sweep_interval.as_secs(),
            settings_secs = config.settings_refresh_interval.as_secs(),
            "Sweep jobs scheduled"
        );
        Ok(())
    }
}

fn repeated<F, Fut>(every: Duration, mut run: F) -> Result<Job, JobSchedulerError>
where
    F: FnMut() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Job::new_repeated_async(every, move |_id, _scheduler| Box::pin(run()))
}
