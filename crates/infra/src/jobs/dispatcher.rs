//! Worker dispatcher: the outbox consumer.
//!
//! Each tick, in order:
//! 1. sweep jobs stuck in `processing` back to `pending`
//! 2. claim a batch of ready jobs (skip-locked, oldest first)
//! 3. execute the claimed jobs concurrently
//! 4. write each job's outcome independently
//!
//! Any number of dispatchers may run against the same store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use portal_core::{Clock, SystemClock};

use super::handlers;
use super::retry::RetryPolicy;
use super::store::{JobStore, JobStoreError};
use super::types::{AttemptOutcome, Job, JobStatus, JobUpdate};
use crate::external::alert::{AlertNotifier, AlertSeverity};
use crate::external::pdp::PdpClient;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Name for logging
    pub name: String,
    pub poll_interval: Duration,
    /// Maximum jobs claimed per tick
    pub batch_size: usize,
    /// Maximum jobs executing at once within a tick
    pub max_concurrency: usize,
    /// A `processing` job not updated for this long is presumed abandoned
    pub stale_after: Duration,
    pub retry_policy: RetryPolicy,
    /// Attempts at writing one job's outcome before giving up and alerting
    pub record_attempts: u32,
    /// Pause before the second write attempt; doubles after each failure
    pub record_retry_delay: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "pdp-dispatcher".to_string(),
            poll_interval: Duration::from_secs(10),
            batch_size: 10,
            max_concurrency: 4,
            stale_after: Duration::from_secs(5 * 60),
            retry_policy: RetryPolicy::default(),
            record_attempts: 3,
            record_retry_delay: Duration::from_millis(100),
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_record_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.record_attempts = attempts;
        self.record_retry_delay = delay;
        self
    }
}

/// What a single tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub recovered: u64,
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    /// Outcomes that could not be written back; those jobs stay `processing`
    /// until the stuck-job sweep returns them.
    pub unrecorded: usize,
    pub claim_failed: bool,
}

/// Running totals across ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatcherStats {
    pub ticks: u64,
    pub claimed: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub recovered: u64,
}

impl DispatcherStats {
    fn absorb(&mut self, report: &TickReport) {
        self.ticks += 1;
        self.claimed += report.claimed as u64;
        self.completed += report.completed as u64;
        self.retried += report.retried as u64;
        self.failed += report.failed as u64;
        self.recovered += report.recovered;
    }
}

/// Handle to control a spawned dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: Arc<Notify>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl DispatcherHandle {
    /// Stop polling and wait for the in-progress tick to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.notify_one();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "job dispatcher task ended abnormally");
            }
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        *self.stats.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Polls a [`JobStore`] and drives claimed jobs through the PDP.
pub struct JobDispatcher<S: JobStore> {
    store: S,
    pdp: Arc<dyn PdpClient>,
    alerts: Option<Arc<dyn AlertNotifier>>,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl<S: JobStore> JobDispatcher<S> {
    pub fn new(store: S, pdp: Arc<dyn PdpClient>) -> Self {
        Self {
            store,
            pdp,
            alerts: None,
            clock: Arc::new(SystemClock),
            config: DispatcherConfig::default(),
            stats: Arc::new(Mutex::new(DispatcherStats::default())),
        }
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertNotifier>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn stats(&self) -> DispatcherStats {
        *self.stats.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Run one sweep / claim / execute / record cycle.
    pub async fn tick(&self) -> TickReport {
        let report = self.tick_inner().await;
        self.stats
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .absorb(&report);
        report
    }

    async fn tick_inner(&self) -> TickReport {
        let name = &self.config.name;
        let mut report = TickReport::default();
        let now = self.clock.now();

        // A threshold too large to represent means nothing is ever stale.
        let stale_before = chrono::Duration::from_std(self.config.stale_after)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        match self.store.recover_stuck(stale_before, now).await {
            Ok(0) => {}
            Ok(n) => {
                warn!(dispatcher = %name, recovered = n, "reset stuck jobs to pending");
                report.recovered = n;
            }
            Err(e) => warn!(dispatcher = %name, error = %e, "stuck-job sweep failed"),
        }

        let jobs = match self.store.claim_batch(now, self.config.batch_size).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(dispatcher = %name, error = %e, "failed to claim jobs");
                report.claim_failed = true;
                return report;
            }
        };

        report.claimed = jobs.len();
        if jobs.is_empty() {
            return report;
        }
        debug!(dispatcher = %name, claimed = jobs.len(), "claimed jobs");

        let outcomes: Vec<Option<JobStatus>> = stream::iter(jobs)
            .map(|job| self.process(job))
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Some(JobStatus::Completed) => report.completed += 1,
                Some(JobStatus::Pending) => report.retried += 1,
                Some(JobStatus::Failed) => report.failed += 1,
                Some(_) => {}
                None => report.unrecorded += 1,
            }
        }

        debug!(
            dispatcher = %name,
            completed = report.completed,
            retried = report.retried,
            failed = report.failed,
            "tick finished"
        );
        report
    }

    /// Execute one claimed job and record the outcome. Returns the new status,
    /// or `None` if it could not be written.
    async fn process(&self, job: Job) -> Option<JobStatus> {
        let result = handlers::execute(&job, self.pdp.as_ref()).await;
        let outcome = AttemptOutcome::from(&result);
        let update = job.outcome(&outcome, &self.config.retry_policy, self.clock.now());

        if let Err(e) = self.record(&job, &update).await {
            error!(
                job_id = %job.id,
                job_type = %job.job_type,
                intended_status = %update.status,
                error = %e,
                "failed to record job outcome after retries"
            );
            self.alert_unrecorded(&job, update.status, &e).await;
            return None;
        }

        match update.status {
            JobStatus::Completed => info!(
                job_id = %job.id,
                job_type = %job.job_type,
                retry_count = update.retry_count,
                "job completed"
            ),
            JobStatus::Pending => warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                retry_count = update.retry_count,
                next_retry_at = ?update.next_retry_at,
                error = update.error.as_deref().unwrap_or_default(),
                "job failed, retry scheduled"
            ),
            JobStatus::Failed => {
                error!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    retry_count = update.retry_count,
                    error = update.error.as_deref().unwrap_or_default(),
                    "job failed permanently"
                );
                self.alert_failed(&job, update.retry_count, update.error.as_deref())
                    .await;
            }
            JobStatus::Processing | JobStatus::Compensated => {}
        }

        Some(update.status)
    }

    /// Write `update`, retrying with doubling pauses up to `record_attempts`.
    async fn record(&self, job: &Job, update: &JobUpdate) -> Result<(), JobStoreError> {
        let attempts = self.config.record_attempts.max(1);
        let mut delay = self.config.record_retry_delay;
        let mut attempt = 1;
        loop {
            match self.store.update(job.id, update).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    warn!(
                        job_id = %job.id,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "retrying job outcome write"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
            }
        }
    }

    async fn alert_unrecorded(&self, job: &Job, intended: JobStatus, err: &JobStoreError) {
        let Some(alerts) = &self.alerts else {
            return;
        };

        let details = json!({
            "jobId": job.id,
            "jobType": job.job_type,
            "intendedStatus": intended,
            "error": err.to_string(),
        });
        if let Err(e) = alerts
            .send_alert(AlertSeverity::Critical, "Failed to update PDP job status", details)
            .await
        {
            error!(job_id = %job.id, error = %e, "failed to send alert");
        }
    }

    async fn alert_failed(&self, job: &Job, retry_count: u32, error: Option<&str>) {
        let Some(alerts) = &self.alerts else {
            return;
        };

        let details = json!({
            "jobId": job.id,
            "jobType": job.job_type,
            "retryCount": retry_count,
            "maxRetries": job.max_retries,
            "error": error,
            "schemaId": job.schema_id,
            "applicationId": job.application_id,
        });
        let message = format!("PDP job {} failed permanently", job.id);

        if let Err(e) = alerts
            .send_alert(AlertSeverity::Critical, &message, details)
            .await
        {
            error!(job_id = %job.id, error = %e, "failed to send alert");
        }
    }
}

impl<S: JobStore + 'static> JobDispatcher<S> {
    /// Poll on `poll_interval` until `shutdown` is notified.
    ///
    /// A tick in progress always finishes; jobs it leaves `processing` are
    /// picked up by a later sweep.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        info!(
            dispatcher = %self.config.name,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "job dispatcher started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.notified() => break,
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }

        info!(dispatcher = %self.config.name, "job dispatcher stopped");
    }

    /// Run on a background task.
    pub fn spawn(self) -> DispatcherHandle {
        let shutdown = Arc::new(Notify::new());
        let stats = self.stats.clone();

        let signal = shutdown.clone();
        let join = tokio::spawn(async move {
            self.run(signal).await;
        });

        DispatcherHandle {
            shutdown,
            join: Some(join),
            stats,
        }
    }
}
