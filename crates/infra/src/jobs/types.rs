//! Outbox job record and its state machine.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use portal_core::{ApplicationId, JobId, SchemaId};

use super::retry::RetryPolicy;
use crate::external::pdp::{GrantDuration, SelectedFieldRecord};

/// Which PDP operation a job performs. Fixes the mandatory payload fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Needs `schema_id` and `sdl`.
    CreatePolicyMetadata,
    /// Needs `application_id` and `selected_fields`; `grant_duration` is optional.
    UpdateAllowList,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::CreatePolicyMetadata => "create_policy_metadata",
            JobType::UpdateAllowList => "update_allow_list",
        }
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create_policy_metadata" => Ok(JobType::CreatePolicyMetadata),
            "update_allow_list" => Ok(JobType::UpdateAllowList),
            other => Err(format!("unknown job type: {other}")),
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle state.
///
/// `pending -> processing -> {completed | pending | failed}`. `compensated`
/// is only written by the synchronous saga path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Compensated,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Compensated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Compensated => "compensated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Compensated
        )
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "compensated" => Ok(JobStatus::Compensated),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outbox row: the durable intent to perform one PDP side effect.
///
/// Payload columns are nullable on purpose; which ones must be present is
/// decided by `job_type` at execution time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub schema_id: Option<SchemaId>,
    pub sdl: Option<String>,
    pub application_id: Option<ApplicationId>,
    /// JSON-encoded `Vec<SelectedFieldRecord>`.
    pub selected_fields: Option<String>,
    pub grant_duration: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    fn blank(job_type: JobType, max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            job_type,
            status: JobStatus::Pending,
            schema_id: None,
            sdl: None,
            application_id: None,
            selected_fields: None,
            grant_duration: None,
            retry_count: 0,
            max_retries,
            next_retry_at: None,
            error: None,
            processed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Pending job registering policy metadata for a new schema.
    pub fn create_policy_metadata(
        schema_id: SchemaId,
        sdl: impl Into<String>,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let mut job = Self::blank(JobType::CreatePolicyMetadata, max_retries, now);
        job.schema_id = Some(schema_id);
        job.sdl = Some(sdl.into());
        job
    }

    /// Pending job granting a new application its selected fields.
    pub fn update_allow_list(
        application_id: ApplicationId,
        selected_fields: &[SelectedFieldRecord],
        grant_duration: GrantDuration,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        let mut job = Self::blank(JobType::UpdateAllowList, max_retries, now);
        job.application_id = Some(application_id);
        job.selected_fields = Some(serde_json::to_string(selected_fields)?);
        job.grant_duration = Some(grant_duration.as_str().to_string());
        Ok(job)
    }

    /// Stamp a job as already settled by one synchronous attempt.
    pub fn settled(mut self, status: JobStatus, error: Option<String>, now: DateTime<Utc>) -> Self {
        self.status = status;
        self.retry_count = 1;
        self.error = error;
        self.processed_at = Some(now);
        self.updated_at = now;
        self
    }

    /// Eligible for claiming at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Next state after one execution attempt.
    ///
    /// `retry_count` is bumped for every attempt. A retryable failure moves the
    /// job back to `pending` with `next_retry_at = now + backoff(prior count)`
    /// while the new count stays within `max_retries`; past that, and for any
    /// fatal failure, the job is `failed` for good.
    pub fn outcome(&self, outcome: &AttemptOutcome, policy: &RetryPolicy, now: DateTime<Utc>) -> JobUpdate {
        let retry_count = self.retry_count.saturating_add(1);

        let (status, next_retry_at, error) = match outcome {
            AttemptOutcome::Succeeded => (JobStatus::Completed, None, None),
            AttemptOutcome::Fatal(msg) => (JobStatus::Failed, None, Some(msg.clone())),
            AttemptOutcome::Retryable(msg) if retry_count > self.max_retries => {
                (JobStatus::Failed, None, Some(msg.clone()))
            }
            AttemptOutcome::Retryable(msg) => {
                let delay = policy.chrono_delay_for(self.retry_count);
                (
                    JobStatus::Pending,
                    Some(now.checked_add_signed(delay).unwrap_or(now)),
                    Some(msg.clone()),
                )
            }
        };

        JobUpdate {
            status,
            retry_count,
            next_retry_at,
            error,
            processed_at: Some(now),
            updated_at: now,
        }
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, update: &JobUpdate) {
        self.status = update.status;
        self.retry_count = update.retry_count;
        self.next_retry_at = update.next_retry_at;
        self.error = update.error.clone();
        self.processed_at = update.processed_at;
        self.updated_at = update.updated_at;
    }
}

/// Result of one handler invocation, as seen by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    /// Transient failure; counts toward the retry ceiling.
    Retryable(String),
    /// Retrying cannot help (e.g. a required payload field is missing).
    Fatal(String),
}

/// The bookkeeping columns the dispatcher is allowed to write.
///
/// Status and retry bookkeeping always travel together so a job's status
/// is never changed without its `retry_count`, `next_retry_at` and `error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobUpdate {
    pub status: JobStatus,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job(max_retries: u32) -> Job {
        Job::create_policy_metadata(SchemaId::new(), "type Query", max_retries, Utc::now())
    }

    #[test]
    fn new_jobs_are_pending_and_ready() {
        let now = Utc::now();
        let job = Job::create_policy_metadata(SchemaId::new(), "type Query", 5, now);

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert!(job.is_ready(now));
    }

    #[test]
    fn success_clears_error_and_schedule() {
        let now = Utc::now();
        let mut job = job(5);
        job.retry_count = 2;
        job.error = Some("boom".into());
        job.next_retry_at = Some(now);

        let update = job.outcome(&AttemptOutcome::Succeeded, &RetryPolicy::default(), now);

        assert_eq!(update.status, JobStatus::Completed);
        assert_eq!(update.retry_count, 3);
        assert_eq!(update.error, None);
        assert_eq!(update.next_retry_at, None);
        assert_eq!(update.processed_at, Some(now));
    }

    #[test]
    fn retryable_failure_schedules_backoff_from_prior_count() {
        let now = Utc::now();
        let policy = RetryPolicy::default();
        let mut job = job(5);

        let first = job.outcome(&AttemptOutcome::Retryable("down".into()), &policy, now);
        assert_eq!(first.status, JobStatus::Pending);
        assert_eq!(first.retry_count, 1);
        assert_eq!(first.next_retry_at, Some(now + Duration::minutes(1)));
        assert_eq!(first.error.as_deref(), Some("down"));

        job.apply(&first);
        let second = job.outcome(&AttemptOutcome::Retryable("down".into()), &policy, now);
        assert_eq!(second.next_retry_at, Some(now + Duration::minutes(2)));
    }

    #[test]
    fn failure_past_ceiling_is_terminal() {
        let now = Utc::now();
        let mut job = job(5);
        job.retry_count = 5;

        let update = job.outcome(&AttemptOutcome::Retryable("down".into()), &RetryPolicy::default(), now);

        assert_eq!(update.status, JobStatus::Failed);
        assert_eq!(update.retry_count, 6);
        assert_eq!(update.next_retry_at, None);
    }

    #[test]
    fn fatal_failure_skips_retries() {
        let now = Utc::now();
        let job = job(5);

        let update = job.outcome(&AttemptOutcome::Fatal("missing sdl".into()), &RetryPolicy::default(), now);

        assert_eq!(update.status, JobStatus::Failed);
        assert_eq!(update.retry_count, 1);
        assert_eq!(update.next_retry_at, None);
    }

    #[test]
    fn is_ready_respects_next_retry_at() {
        let now = Utc::now();
        let mut job = job(5);
        job.next_retry_at = Some(now + Duration::seconds(30));

        assert!(!job.is_ready(now));
        assert!(job.is_ready(now + Duration::seconds(30)));

        job.status = JobStatus::Processing;
        assert!(!job.is_ready(now + Duration::hours(1)));
    }

    #[test]
    fn allow_list_job_serializes_selected_fields() {
        let schema_id = SchemaId::new();
        let fields = vec![
            SelectedFieldRecord::new("person.fullName", schema_id),
            SelectedFieldRecord::new("person.nic", schema_id),
        ];

        let job = Job::update_allow_list(ApplicationId::new(), &fields, GrantDuration::OneYear, 5, Utc::now())
            .unwrap();

        let decoded: Vec<SelectedFieldRecord> =
            serde_json::from_str(job.selected_fields.as_deref().unwrap()).unwrap();
        assert_eq!(decoded, fields);
        assert_eq!(job.grant_duration.as_deref(), Some("365d"));
        assert_eq!(job.job_type, JobType::UpdateAllowList);
    }

    #[test]
    fn status_and_type_parse_their_column_values() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert_eq!("update_allow_list".parse::<JobType>().unwrap(), JobType::UpdateAllowList);
        assert!("rebuild".parse::<JobType>().is_err());
    }

    #[test]
    fn settled_records_a_single_attempt() {
        let now = Utc::now();
        let job = job(5).settled(JobStatus::Compensated, Some("pdp down".into()), now);

        assert_eq!(job.status, JobStatus::Compensated);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.processed_at, Some(now));
    }
}
