//! Schema registration.

use std::sync::Arc;

use tracing::{info, instrument};

use portal_core::{Clock, SchemaId, SystemClock};

use super::saga::Settlement;
use super::{ConsistencyStrategy, ProducerConfig, ServiceError};
use crate::entities::{EntityStore, NewSchema, Schema};
use crate::external::alert::AlertNotifier;
use crate::external::pdp::PdpClient;
use crate::jobs::{Job, JobStore};

enum Mode {
    Outbox,
    Saga(Arc<dyn PdpClient>),
}

/// Creates schemas and makes sure the PDP learns about each one.
pub struct SchemaService {
    entities: Arc<dyn EntityStore>,
    jobs: Arc<dyn JobStore>,
    mode: Mode,
    alerts: Option<Arc<dyn AlertNotifier>>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
}

impl SchemaService {
    /// Schema row and `create_policy_metadata` job commit together; the
    /// dispatcher calls the PDP later.
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

    /// The PDP is called before `create_schema` returns; on failure the
    /// schema is deleted again.
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

    /// Ceiling stamped on new jobs.
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

    #[instrument(skip(self, request), fields(member_id = %request.member_id, strategy = ?self.strategy()), err)]
    pub async fn create_schema(&self, request: NewSchema) -> Result<Schema, ServiceError> {
        request.validate()?;
        let now = self.clock.now();
        let schema = request.into_schema(now);
        let job = Job::create_policy_metadata(schema.id, schema.sdl.clone(), self.max_retries, now);

        match &self.mode {
            Mode::Outbox => {
                self.entities.insert_schema_with_job(&schema, &job).await?;
                info!(
                    schema_id = %schema.id,
                    job_id = %job.id,
                    "schema created, policy metadata job queued"
                );
            }
            Mode::Saga(pdp) => {
                self.entities.insert_schema(&schema).await?;
                let pdp_result = pdp
                    .create_policy_metadata(schema.id, &schema.sdl)
                    .await
                    .map(|_| ());

                Settlement {
                    jobs: self.jobs.as_ref(),
                    alerts: self.alerts.as_ref(),
                    now: self.clock.now(),
                }
                .settle(job, pdp_result, self.entities.delete_schema(schema.id))
                .await?;

                info!(schema_id = %schema.id, "schema created, policy metadata registered");
            }
        }

        Ok(schema)
    }

    pub async fn get_schema(&self, id: SchemaId) -> Result<Option<Schema>, ServiceError> {
        Ok(self.entities.get_schema(id).await?)
    }

    /// Jobs created on behalf of a schema, oldest first.
    pub async fn jobs_for(&self, id: SchemaId) -> Result<Vec<Job>, ServiceError> {
        Ok(self.jobs.find_by_schema(id).await?)
    }
}
