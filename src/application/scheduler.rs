use super::engine::{EscrowEngine, Task, WorkItem};
use crate::config::ScheduleSettings;
use crate::domain::payment::PaymentId;
use crate::error::{EngineError, Result};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};

/// The periodic jobs that drive payments through their lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Job {
    DepositDetection,
    EscrowFunding,
    ReleaseSweep,
    PayoutSweep,
}

impl Job {
    pub const ALL: [Job; 4] = [
        Job::DepositDetection,
        Job::EscrowFunding,
        Job::ReleaseSweep,
        Job::PayoutSweep,
    ];
}

/// Tally of one job run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub payments: usize,
    pub advanced: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl JobReport {
    fn merge(&mut self, other: JobReport) {
        self.payments += other.payments;
        self.advanced += other.advanced;
        self.unchanged += other.unchanged;
        self.failed += other.failed;
    }
}

pub struct Scheduler {
    engine: Arc<EscrowEngine>,
    schedule: ScheduleSettings,
}

impl Scheduler {
    pub fn new(engine: Arc<EscrowEngine>, schedule: ScheduleSettings) -> Self {
        Self { engine, schedule }
    }

    fn period(&self, job: Job) -> Duration {
        match job {
            Job::DepositDetection => self.schedule.deposit_interval,
            Job::EscrowFunding => self.schedule.funding_interval,
            Job::ReleaseSweep => self.schedule.release_interval,
            Job::PayoutSweep => self.schedule.payout_interval,
        }
    }

    /// Runs `job` once over its current candidates.
    ///
    /// Distinct payments run concurrently up to the configured parallelism;
    /// the tasks of one payment always run in order on a single worker.
    pub async fn run_once(&self, job: Job) -> Result<JobReport> {
        let items = self.engine.work_items(job).await?;
        let mut groups: Vec<(PaymentId, Vec<Task>)> = Vec::new();
        for WorkItem { payment_id, task } in items {
            match groups.iter_mut().find(|(id, _)| *id == payment_id) {
                Some((_, tasks)) => tasks.push(task),
                None => groups.push((payment_id, vec![task])),
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.engine.settings().parallelism));
        let mut workers = JoinSet::new();
        for (payment_id, tasks) in groups {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| EngineError::internal(format!("worker pool closed: {e}")))?;
            let engine = self.engine.clone();
            workers.spawn(async move {
                let _permit = permit;
                let mut report = JobReport {
                    payments: 1,
                    ..JobReport::default()
                };
                for task in tasks {
                    match engine.execute(WorkItem { payment_id, task }).await {
                        Ok(true) => report.advanced += 1,
                        Ok(false) => report.unchanged += 1,
                        Err(err) => {
                            report.failed += 1;
                            if let Err(e) = engine.handle_failure(payment_id, task, &err).await {
                                tracing::error!(
                                    %payment_id,
                                    error = %e,
                                    "failed to record failure"
                                );
                            }
                        }
                    }
                }
                report
            });
        }

        let mut report = JobReport::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(worker) => report.merge(worker),
                Err(e) => {
                    tracing::error!(error = %e, ?job, "worker panicked");
                    report.failed += 1;
                }
            }
        }
        if report.payments > 0 {
            tracing::info!(
                ?job,
                payments = report.payments,
                advanced = report.advanced,
                unchanged = report.unchanged,
                failed = report.failed,
                "job finished"
            );
        }
        Ok(report)
    }

    /// Runs every job on its interval until `shutdown` resolves.
    ///
    /// Runs in progress finish before this returns.
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut loops = JoinSet::new();
        for job in Job::ALL {
            let scheduler = self.clone();
            let mut stop = stop_rx.clone();
            loops.spawn(async move {
                let mut ticker = interval(scheduler.period(job));
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = scheduler.run_once(job).await {
                                tracing::error!(?job, error = %e, "job run failed");
                            }
                        }
                        _ = stop.changed() => break,
                    }
                }
            });
        }
        tracing::info!("scheduler started");

        shutdown.await;
        tracing::info!("shutdown requested, waiting for running jobs");
        let _ = stop_tx.send(true);
        while loops.join_next().await.is_some() {}
        tracing::info!("scheduler stopped");
    }
}
