//! Test doubles shared by unit and scenario tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use portal_core::{ApplicationId, SchemaId};

use crate::external::pdp::{
    AllowListUpdateRequest, AllowListUpdateResponse, PdpClient, PdpError, PolicyMetadataCreateResponse,
};

/// A recorded PDP call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PdpCall {
    CreatePolicyMetadata { schema_id: SchemaId, sdl: String },
    UpdateAllowList(AllowListUpdateRequest),
}

impl PdpCall {
    fn key(&self) -> String {
        match self {
            PdpCall::CreatePolicyMetadata { schema_id, .. } => format!("schema:{schema_id}"),
            PdpCall::UpdateAllowList(req) => format!("application:{}", req.application_id),
        }
    }
}

#[derive(Debug, Default)]
struct Script {
    fail_remaining: u32,
    always_fail: bool,
    calls: Vec<PdpCall>,
    in_flight: HashMap<String, usize>,
    max_in_flight: usize,
}

/// PDP double: fails a scripted number of times, records every call, and
/// tracks how many calls for the same entity overlap.
#[derive(Debug, Default)]
pub struct ScriptedPdpClient {
    script: Mutex<Script>,
    latency: Option<Duration>,
}

impl ScriptedPdpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn always_failing() -> Self {
        let client = Self::new();
        client.script.lock().unwrap().always_fail = true;
        client
    }

    /// Sleep this long inside every call, so concurrent calls overlap.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next `n` calls.
    pub fn fail_next(&self, n: u32) {
        self.script.lock().unwrap().fail_remaining += n;
    }

    pub fn calls(&self) -> Vec<PdpCall> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn total_calls(&self) -> usize {
        self.script.lock().unwrap().calls.len()
    }

    pub fn calls_for_schema(&self, schema_id: SchemaId) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, PdpCall::CreatePolicyMetadata { schema_id: s, .. } if *s == schema_id))
            .count()
    }

    pub fn calls_for_application(&self, application_id: ApplicationId) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, PdpCall::UpdateAllowList(r) if r.application_id == application_id))
            .count()
    }

    /// Highest number of simultaneous calls seen for any single entity.
    pub fn max_in_flight_per_entity(&self) -> usize {
        self.script.lock().unwrap().max_in_flight
    }

    async fn call(&self, call: PdpCall) -> Result<(), PdpError> {
        let key = call.key();
        let fail = {
            let mut script = self.script.lock().unwrap();
            script.calls.push(call);
            let n = script.in_flight.entry(key.clone()).or_default();
            *n += 1;
            let n = *n;
            script.max_in_flight = script.max_in_flight.max(n);

            if script.always_fail {
                true
            } else if script.fail_remaining > 0 {
                script.fail_remaining -= 1;
                true
            } else {
                false
            }
        };

        match self.latency {
            Some(latency) => tokio::time::sleep(latency).await,
            None => tokio::task::yield_now().await,
        }

        if let Some(n) = self.script.lock().unwrap().in_flight.get_mut(&key) {
            *n -= 1;
        }

        if fail {
            Err(PdpError::Status {
                status: 503,
                body: "scripted failure".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PdpClient for ScriptedPdpClient {
    async fn create_policy_metadata(
        &self,
        schema_id: SchemaId,
        sdl: &str,
    ) -> Result<PolicyMetadataCreateResponse, PdpError> {
        self.call(PdpCall::CreatePolicyMetadata {
            schema_id,
            sdl: sdl.to_string(),
        })
        .await?;
        Ok(PolicyMetadataCreateResponse::default())
    }

    async fn update_allow_list(
        &self,
        request: &AllowListUpdateRequest,
    ) -> Result<AllowListUpdateResponse, PdpError> {
        self.call(PdpCall::UpdateAllowList(request.clone())).await?;
        Ok(AllowListUpdateResponse::default())
    }
}
