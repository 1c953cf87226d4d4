//! Read-only view of the provisioning data aggregation depends on.

use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("entity metadata lookup failed: {0}")]
pub struct MetadataError(pub String);

/// Answers whether usage must also be attributed to end users.
pub trait EntityMetadata: Send + Sync {
    fn application_requires_end_user(
        &self,
        service_id: &str,
        application_id: &str,
    ) -> Result<bool, MetadataError>;

    fn service_has_end_user_plans(&self, service_id: &str) -> Result<bool, MetadataError>;
}

/// Fixed metadata, for tests and tools that know their entities upfront.
#[derive(Clone, Debug, Default)]
pub struct StaticMetadata {
    end_user_services: HashSet<String>,
    end_user_applications: HashSet<(String, String)>,
}

impl StaticMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the application as requiring end users, enabling end user
    /// plans on its service.
    pub fn with_end_user_application(mut self, service_id: &str, application_id: &str) -> Self {
        self.end_user_services.insert(service_id.to_string());
        self.end_user_applications
            .insert((service_id.to_string(), application_id.to_string()));
        self
    }
}

impl EntityMetadata for StaticMetadata {
    fn application_requires_end_user(
        &self,
        service_id: &str,
        application_id: &str,
    ) -> Result<bool, MetadataError> {
        Ok(self
            .end_user_applications
            .contains(&(service_id.to_string(), application_id.to_string())))
    }

    fn service_has_end_user_plans(&self, service_id: &str) -> Result<bool, MetadataError> {
        Ok(self.end_user_services.contains(service_id))
    }
}
