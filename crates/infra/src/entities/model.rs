//! Schema and application records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use portal_core::{ApplicationId, DomainError, MemberId, SchemaId};

use crate::external::pdp::{GrantDuration, SelectedFieldRecord};

/// A provider's GraphQL schema registered with the portal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub id: SchemaId,
    pub member_id: MemberId,
    pub name: String,
    pub description: Option<String>,
    pub sdl: String,
    pub endpoint: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A consumer application and the fields it was granted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub id: ApplicationId,
    pub member_id: MemberId,
    pub name: String,
    pub description: Option<String>,
    pub selected_fields: Vec<SelectedFieldRecord>,
    pub grant_duration: GrantDuration,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSchema {
    pub member_id: MemberId,
    pub name: String,
    pub description: Option<String>,
    pub sdl: String,
    pub endpoint: String,
}

impl NewSchema {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.trim().is_empty() {
            return Err(DomainError::empty_field("schema", "name"));
        }
        if self.sdl.trim().is_empty() {
            return Err(DomainError::empty_field("schema", "sdl"));
        }
        if self.endpoint.trim().is_empty() {
            return Err(DomainError::empty_field("schema", "endpoint"));
        }
        Ok(())
    }

    pub fn into_schema(self, now: DateTime<Utc>) -> Schema {
        Schema {
            id: SchemaId::new(),
            member_id: self.member_id,
            name: self.name,
            description: self.description,
            sdl: self.sdl,
            endpoint: self.endpoint,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewApplication {
    pub member_id: MemberId,
    pub name: String,
    pub description: Option<String>,
    pub selected_fields: Vec<SelectedFieldRecord>,
    pub grant_duration: GrantDuration,
}

impl NewApplication {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.trim().is_empty() {
            return Err(DomainError::empty_field("application", "name"));
        }
        if let Some(field) = self
            .selected_fields
            .iter()
            .find(|f| f.field_name.trim().is_empty())
        {
            return Err(DomainError::validation(format!(
                "selected field for schema {} has an empty name",
                field.schema_id
            )));
        }
        Ok(())
    }

    pub fn into_application(self, now: DateTime<Utc>) -> Application {
        Application {
            id: ApplicationId::new(),
            member_id: self.member_id,
            name: self.name,
            description: self.description,
            selected_fields: self.selected_fields,
            grant_duration: self.grant_duration,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_schema() -> NewSchema {
        NewSchema {
            member_id: MemberId::new(),
            name: "Person registry".into(),
            description: None,
            sdl: "type Query { person: Person }".into(),
            endpoint: "https://provider.example/graphql".into(),
        }
    }

    #[test]
    fn schema_requires_name_sdl_and_endpoint() {
        assert!(new_schema().validate().is_ok());

        let mut blank_sdl = new_schema();
        blank_sdl.sdl = "  ".into();
        assert!(matches!(blank_sdl.validate(), Err(DomainError::EmptyField { field: "sdl", .. })));

        let mut blank_endpoint = new_schema();
        blank_endpoint.endpoint.clear();
        assert!(blank_endpoint.validate().is_err());
    }

    #[test]
    fn application_rejects_blank_field_names() {
        let schema_id = SchemaId::new();
        let mut app = NewApplication {
            member_id: MemberId::new(),
            name: "Benefits checker".into(),
            description: None,
            selected_fields: vec![],
            grant_duration: GrantDuration::default(),
        };
        assert!(app.validate().is_ok());

        app.selected_fields.push(SelectedFieldRecord::new("", schema_id));
        assert!(app.validate().is_err());
    }
}
