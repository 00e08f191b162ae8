//! Synchronous saga settlement.
//!
//! After the entity row is written and the PDP has been called, [`settle`]
//! compensates on failure and leaves an audit job in its final state.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{error, info, warn};

use super::ServiceError;
use crate::entities::EntityStoreError;
use crate::external::alert::{AlertNotifier, AlertSeverity};
use crate::external::pdp::PdpError;
use crate::jobs::{Job, JobStatus, JobStore};

pub(crate) struct Settlement<'a> {
    pub jobs: &'a dyn JobStore,
    pub alerts: Option<&'a Arc<dyn AlertNotifier>>,
    pub now: DateTime<Utc>,
}

impl Settlement<'_> {
    /// Resolve one saga attempt.
    ///
    /// - PDP ok: audit job `completed`
    /// - PDP failed, compensation ok: audit job `compensated`, warning alert,
    ///   [`ServiceError::Pdp`]
    /// - both failed: audit job `failed` carrying both errors, critical alert,
    ///   [`ServiceError::CompensationFailed`]
    pub async fn settle<C>(
        &self,
        job: Job,
        pdp_result: Result<(), PdpError>,
        compensate: C,
    ) -> Result<(), ServiceError>
    where
        C: Future<Output = Result<(), EntityStoreError>>,
    {
        let pdp_err = match pdp_result {
            Ok(()) => {
                self.record(job.settled(JobStatus::Completed, None, self.now))
                    .await;
                return Ok(());
            }
            Err(e) => e,
        };

        warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            error = %pdp_err,
            "PDP call failed, compensating"
        );

        match compensate.await {
            Ok(()) => {
                info!(job_id = %job.id, job_type = %job.job_type, "compensation succeeded");
                let details = details(&job, &pdp_err, None);
                let message = format!("PDP call failed for job {}, entity removed", job.id);
                self.record(job.settled(JobStatus::Compensated, Some(pdp_err.to_string()), self.now))
                    .await;
                self.alert(AlertSeverity::Warning, &message, details).await;
                Err(ServiceError::Pdp(pdp_err))
            }
            Err(compensation) => {
                error!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    pdp_error = %pdp_err,
                    compensation_error = %compensation,
                    "PDP call and compensation both failed"
                );
                let details = details(&job, &pdp_err, Some(&compensation));
                let message = format!("PDP job compensation failed for job {}", job.id);
                let combined = format!("PDP call failed: {pdp_err}; compensation failed: {compensation}");
                self.record(job.settled(JobStatus::Failed, Some(combined), self.now))
                    .await;
                self.alert(AlertSeverity::Critical, &message, details).await;
                Err(ServiceError::CompensationFailed {
                    pdp: pdp_err,
                    compensation,
                })
            }
        }
    }

    async fn record(&self, job: Job) {
        if let Err(e) = self.jobs.insert(&job).await {
            error!(job_id = %job.id, status = %job.status, error = %e, "failed to record saga job");
        }
    }

    async fn alert(&self, severity: AlertSeverity, message: &str, details: serde_json::Value) {
        let Some(alerts) = self.alerts else {
            return;
        };
        if let Err(e) = alerts.send_alert(severity, message, details).await {
            error!(error = %e, "failed to send alert");
        }
    }
}

fn details(job: &Job, pdp_err: &PdpError, compensation: Option<&EntityStoreError>) -> serde_json::Value {
    json!({
        "jobId": job.id,
        "jobType": job.job_type,
        "pdpError": pdp_err.to_string(),
        "compensationError": compensation.map(|e| e.to_string()),
        "schemaId": job.schema_id,
        "applicationId": job.application_id,
    })
}
