//! Application creation and allow-list propagation.

use std::sync::Arc;

use tracing::{info, instrument};

use portal_core::{ApplicationId, Clock, SystemClock};

use super::saga::Settlement;
use super::{ConsistencyStrategy, ProducerConfig, ServiceError};
use crate::entities::{Application, EntityStore, NewApplication};
use crate::external::alert::AlertNotifier;
use crate::external::pdp::{AllowListUpdateRequest, PdpClient};
use crate::jobs::{Job, JobStore};

enum Mode {
    Outbox,
    Saga(Arc<dyn PdpClient>),
}

/// Creates applications and grants them their selected fields in the PDP.
pub struct ApplicationService {
    entities: Arc<dyn EntityStore>,
    jobs: Arc<dyn JobStore>,
    mode: Mode,
    alerts: Option<Arc<dyn AlertNotifier>>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
}

impl ApplicationService {
    pub fn outbox(entities: Arc<dyn EntityStore>, jobs: Arc<dyn JobStore>) -> Self {
        Self {
            entities,
            jobs,
            mode: Mode::Outbox,
            alerts: None,
            clock: Arc::new(SystemClock),
            max_retries: ProducerConfig::default().max_retries,
        }
    }

    pub fn saga(entities: Arc<dyn EntityStore>, jobs: Arc<dyn JobStore>, pdp: Arc<dyn PdpClient>) -> Self {
        Self {
            mode: Mode::Saga(pdp),
            ..Self::outbox(entities, jobs)
        }
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertNotifier>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_producer_config(self, config: ProducerConfig) -> Self {
        self.with_max_retries(config.max_retries)
    }

    pub fn strategy(&self) -> ConsistencyStrategy {
        match self.mode {
            Mode::Outbox => ConsistencyStrategy::Outbox,
            Mode::Saga(_) => ConsistencyStrategy::Saga,
        }
    }

    #[instrument(
        skip(self, request),
        fields(
            member_id = %request.member_id,
            selected_fields = request.selected_fields.len(),
            strategy = ?self.strategy()
        ),
        err
    )]
    pub async fn create_application(&self, request: NewApplication) -> Result<Application, ServiceError> {
        request.validate()?;
        let now = self.clock.now();
        let application = request.into_application(now);
        let job = Job::update_allow_list(
            application.id,
            &application.selected_fields,
            application.grant_duration,
            self.max_retries,
            now,
        )
        .map_err(|e| ServiceError::Payload(e.to_string()))?;

        match &self.mode {
            Mode::Outbox => {
                self.entities
                    .insert_application_with_job(&application, &job)
                    .await?;
                info!(
                    application_id = %application.id,
                    job_id = %job.id,
                    "application created, allow list job queued"
                );
            }
            Mode::Saga(pdp) => {
                self.entities.insert_application(&application).await?;
                let request = AllowListUpdateRequest {
                    application_id: application.id,
                    records: application.selected_fields.clone(),
                    grant_duration: application.grant_duration,
                };
                let pdp_result = pdp.update_allow_list(&request).await.map(|_| ());

                Settlement {
                    jobs: self.jobs.as_ref(),
                    alerts: self.alerts.as_ref(),
                    now: self.clock.now(),
                }
                .settle(job, pdp_result, self.entities.delete_application(application.id))
                .await?;

                info!(application_id = %application.id, "application created, allow list updated");
            }
        }

        Ok(application)
    }

    pub async fn get_application(&self, id: ApplicationId) -> Result<Option<Application>, ServiceError> {
        Ok(self.entities.get_application(id).await?)
    }

    /// Jobs created on behalf of an application, oldest first.
    pub async fn jobs_for(&self, id: ApplicationId) -> Result<Vec<Job>, ServiceError> {
        Ok(self.jobs.find_by_application(id).await?)
    }
}

#[cfg(test)]
mod tests {
    use portal_core::{MemberId, SchemaId};

    use super::*;
    use crate::external::pdp::{GrantDuration, SelectedFieldRecord};
    use crate::in_memory::InMemoryPortalStore;
    use crate::jobs::JobStatus;

    #[tokio::test]
    async fn outbox_job_carries_fields_and_grant_duration() {
        let store = Arc::new(InMemoryPortalStore::new());
        let service = ApplicationService::outbox(store.clone(), store.clone()).with_max_retries(2);
        let schema_id = SchemaId::new();

        let app = service
            .create_application(NewApplication {
                member_id: MemberId::new(),
                name: "Tax lookup".into(),
                description: None,
                selected_fields: vec![
                    SelectedFieldRecord::new("person.fullName", schema_id),
                    SelectedFieldRecord::new("person.address", schema_id),
                ],
                grant_duration: GrantDuration::OneYear,
            })
            .await
            .unwrap();

        let jobs = service.jobs_for(app.id).await.unwrap();
        assert_eq!(jobs.len(), 1);
        let job = &jobs[0];
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.max_retries, 2);
        assert_eq!(job.grant_duration.as_deref(), Some("365d"));

        let fields: Vec<SelectedFieldRecord> =
            serde_json::from_str(job.selected_fields.as_deref().unwrap()).unwrap();
        assert_eq!(fields, app.selected_fields);
        assert_eq!(service.get_application(app.id).await.unwrap(), Some(app));
    }

    #[tokio::test]
    async fn blank_name_is_rejected_before_writing() {
        let store = Arc::new(InMemoryPortalStore::new());
        let service = ApplicationService::outbox(store.clone(), store.clone());

        let result = service
            .create_application(NewApplication {
                member_id: MemberId::new(),
                name: " ".into(),
                description: None,
                selected_fields: vec![],
                grant_duration: GrantDuration::default(),
            })
            .await;

        assert!(matches!(result, Err(ServiceError::Validation(_))));
        assert_eq!(store.application_count(), 0);
        assert_eq!(store.job_count(), 0);
    }
}
