use crate::error::{CfError, CfResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

mod cli;
mod platform;
mod target;

pub use cli::CfCli;
pub use platform::CfPlatform;
pub use target::CfTarget;

/// Control plane operations used to migrate an app.
///
/// Every call is expected to be idempotent where the platform allows it, deleting an
/// app that does not exist succeeds.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Export the manifest of an existing app to `dest`
    async fn create_descriptor(&self, app_name: &str, dest: &Path) -> CfResult<()>;

    /// Push `content` as `app_name` using the manifest at `descriptor`
    async fn deploy(
        &self,
        app_name: &str,
        descriptor: &Path,
        content: &Path,
        start: bool,
    ) -> CfResult<()>;

    async fn rename(&self, old_name: &str, new_name: &str) -> CfResult<()>;

    async fn restart(&self, app_name: &str) -> CfResult<()>;

    async fn restage(&self, app_name: &str) -> CfResult<()>;

    async fn delete(&self, app_name: &str) -> CfResult<()>;

    /// Look up an app by name in the bound space, [CfError::NotFound] if missing
    async fn resolve_identity(&self, app_name: &str) -> CfResult<AppIdentity>;

    /// Start copying the bits of one app into another
    async fn copy_artifact(&self, source_guid: &str, dest_guid: &str) -> CfResult<Job>;

    async fn fetch_job(&self, job_guid: &str) -> CfResult<Job>;

    /// Change the stack of a buildpack app
    async fn reassign_stack(&self, app_guid: &str, stack: &str) -> CfResult<()>;

    /// Number of apps called `app_name` in the space
    async fn count_matching(&self, app_name: &str, space_guid: &str) -> CfResult<u64>;

    /// Space this client is bound to
    fn space_guid(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppIdentity {
    pub name: String,
    pub guid: String,
}

/// Asynchronous job as reported by the v2 API
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Job {
    pub metadata: JobMetadata,
    pub entity: JobEntity,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobMetadata {
    pub guid: String,
    pub created_at: Option<DateTime<Utc>>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobEntity {
    pub guid: String,
    pub status: JobStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_details: Option<JobErrorDetails>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Finished,
    Failed,
    /// Anything else the platform reports, treated as still in progress
    #[serde(untagged)]
    Other(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct JobErrorDetails {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub error_code: String,
}

impl Job {
    pub fn id(&self) -> &str {
        &self.entity.guid
    }

    pub fn status(&self) -> &JobStatus {
        &self.entity.status
    }

    /// Error describing why this job failed
    pub fn failure(&self) -> CfError {
        let details = self.entity.error_details.clone().unwrap_or_default();
        let description = if details.description.is_empty() {
            self.entity
                .error
                .clone()
                .unwrap_or_else(|| "no error message".to_string())
        } else {
            details.description
        };
        CfError::Job {
            code: details.code,
            description,
            error_code: details.error_code,
        }
    }
}
