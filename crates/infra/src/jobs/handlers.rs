//! Per-job-type execution.
//!
//! A [`Job`] is first decoded into a [`PdpCommand`]. The match on
//! [`JobType`] is exhaustive, so a new job type does not compile until it
//! has a handler. Missing or undecodable payload fields are reported as
//! [`JobError::MalformedPayload`] and never retried.

use portal_core::SchemaId;

use super::types::{AttemptOutcome, Job, JobType};
use crate::external::pdp::{AllowListUpdateRequest, GrantDuration, PdpClient, PdpError, SelectedFieldRecord};

/// Handler failure.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("malformed {job_type} job payload: {reason}")]
    MalformedPayload { job_type: JobType, reason: String },
    #[error(transparent)]
    Pdp(#[from] PdpError),
}

impl JobError {
    fn malformed(job_type: JobType, reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            job_type,
            reason: reason.into(),
        }
    }

    /// PDP failures are transient; payload errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Pdp(_))
    }
}

impl From<&Result<(), JobError>> for AttemptOutcome {
    fn from(result: &Result<(), JobError>) -> Self {
        match result {
            Ok(()) => AttemptOutcome::Succeeded,
            Err(e) if e.is_retryable() => AttemptOutcome::Retryable(e.to_string()),
            Err(e) => AttemptOutcome::Fatal(e.to_string()),
        }
    }
}

/// The PDP call a job stands for, with its payload validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PdpCommand {
    CreatePolicyMetadata { schema_id: SchemaId, sdl: String },
    UpdateAllowList(AllowListUpdateRequest),
}

impl PdpCommand {
    pub fn from_job(job: &Job) -> Result<Self, JobError> {
        match job.job_type {
            JobType::CreatePolicyMetadata => {
                let (Some(schema_id), Some(sdl)) = (job.schema_id, job.sdl.as_ref()) else {
                    return Err(JobError::malformed(job.job_type, "schema_id and sdl are required"));
                };
                Ok(PdpCommand::CreatePolicyMetadata {
                    schema_id,
                    sdl: sdl.clone(),
                })
            }
            JobType::UpdateAllowList => {
                let (Some(application_id), Some(raw_fields)) =
                    (job.application_id, job.selected_fields.as_deref())
                else {
                    return Err(JobError::malformed(
                        job.job_type,
                        "application_id and selected_fields are required",
                    ));
                };

                let records: Vec<SelectedFieldRecord> = serde_json::from_str(raw_fields).map_err(|e| {
                    JobError::malformed(job.job_type, format!("selected_fields is not valid JSON: {e}"))
                })?;

                let grant_duration = match job.grant_duration.as_deref() {
                    None => GrantDuration::default(),
                    Some(tag) => tag
                        .parse::<GrantDuration>()
                        .map_err(|e| JobError::malformed(job.job_type, e))?,
                };

                Ok(PdpCommand::UpdateAllowList(AllowListUpdateRequest {
                    application_id,
                    records,
                    grant_duration,
                }))
            }
        }
    }

    /// Perform the call. Both PDP operations are update-style, so repeating a
    /// command that already succeeded is harmless.
    pub async fn execute(&self, pdp: &dyn PdpClient) -> Result<(), PdpError> {
        match self {
            PdpCommand::CreatePolicyMetadata { schema_id, sdl } => {
                pdp.create_policy_metadata(*schema_id, sdl).await?;
            }
            PdpCommand::UpdateAllowList(request) => {
                pdp.update_allow_list(request).await?;
            }
        }
        Ok(())
    }
}

/// Decode and run one job.
pub async fn execute(job: &Job, pdp: &dyn PdpClient) -> Result<(), JobError> {
    let command = PdpCommand::from_job(job)?;
    command.execute(pdp).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::testing::ScriptedPdpClient;
    use portal_core::ApplicationId;

    #[test]
    fn missing_sdl_is_malformed() {
        let mut job = Job::create_policy_metadata(SchemaId::new(), "type Query", 5, Utc::now());
        job.sdl = None;

        let err = PdpCommand::from_job(&job).unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("create_policy_metadata"));
    }

    #[test]
    fn allow_list_defaults_grant_duration_when_absent() {
        let schema_id = SchemaId::new();
        let fields = vec![SelectedFieldRecord::new("person.fullName", schema_id)];
        let mut job = Job::update_allow_list(
            ApplicationId::new(),
            &fields,
            GrantDuration::OneYear,
            5,
            Utc::now(),
        )
        .unwrap();
        job.grant_duration = None;

        match PdpCommand::from_job(&job).unwrap() {
            PdpCommand::UpdateAllowList(req) => {
                assert_eq!(req.grant_duration, GrantDuration::OneMonth);
                assert_eq!(req.records, fields);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn unknown_grant_duration_or_bad_json_is_malformed() {
        let mut job =
            Job::update_allow_list(ApplicationId::new(), &[], GrantDuration::default(), 5, Utc::now())
                .unwrap();
        job.grant_duration = Some("7d".into());
        assert!(matches!(
            PdpCommand::from_job(&job),
            Err(JobError::MalformedPayload { .. })
        ));

        job.grant_duration = None;
        job.selected_fields = Some("{not json".into());
        assert!(matches!(
            PdpCommand::from_job(&job),
            Err(JobError::MalformedPayload { .. })
        ));
    }

    #[tokio::test]
    async fn pdp_failure_is_retryable() {
        let pdp = ScriptedPdpClient::new();
        pdp.fail_next(1);
        let job = Job::create_policy_metadata(SchemaId::new(), "type Query", 5, Utc::now());

        let err = execute(&job, &pdp).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(
            AttemptOutcome::from(&Err(err)),
            AttemptOutcome::Retryable(_)
        ));
        assert_eq!(pdp.calls_for_schema(job.schema_id.unwrap()), 1);
    }

    #[tokio::test]
    async fn malformed_job_never_reaches_the_pdp() {
        let pdp = ScriptedPdpClient::new();
        let mut job = Job::create_policy_metadata(SchemaId::new(), "type Query", 5, Utc::now());
        job.schema_id = None;

        let result = execute(&job, &pdp).await;
        assert!(matches!(AttemptOutcome::from(&result), AttemptOutcome::Fatal(_)));
        assert_eq!(pdp.total_calls(), 0);
    }
}
