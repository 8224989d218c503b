//! Provider trait.
//!
//! Providers materialize resources against a cloud API. The orchestrator only
//! hands a provider resources whose value references are all literals.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::arn::Environment;
use crate::resource::{Resource, ResourceKind};
use crate::Result;

/// Well-known attribute names.
pub mod attributes {
    pub const ARN: &str = "Arn";
    pub const REPOSITORY_URI: &str = "RepositoryUri";
    pub const ROLE_ID: &str = "RoleId";
    pub const AGENT_RUNTIME_ARN: &str = "AgentRuntimeArn";
    pub const AGENT_RUNTIME_ID: &str = "AgentRuntimeId";
}

/// A resource as it exists in the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Materialized {
    pub logical_id: String,
    pub kind: ResourceKind,
    pub physical_id: String,
    pub attributes: BTreeMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

impl Materialized {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// Trait for resource providers.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Name of this provider.
    fn name(&self) -> &'static str;

    /// Create a resource, or update it in place when `current` is given.
    async fn apply(
        &self,
        env: &Environment,
        stack: &str,
        resource: &Resource,
        current: Option<&Materialized>,
    ) -> Result<Materialized>;

    /// Delete a materialized resource.
    async fn delete(
        &self,
        env: &Environment,
        stack: &str,
        resource: &Resource,
        materialized: &Materialized,
    ) -> Result<()>;
}
