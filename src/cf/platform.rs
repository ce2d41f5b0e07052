use crate::cf::{AppIdentity, CfCli, Job, PlatformClient};
use crate::error::{CfError, CfResult};
use crate::json_api::JsonApi;
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::Path;

/// [PlatformClient] backed by the `cf` CLI for app lifecycle commands and the
/// Cloud Controller API for everything the CLI does not expose.
#[derive(Clone)]
pub struct CfPlatform {
    cli: CfCli,
    api: JsonApi,
    space_guid: String,
}

impl CfPlatform {
    pub fn new(cli: CfCli, api: JsonApi, space_guid: impl Into<String>) -> Self {
        Self {
            cli,
            api,
            space_guid: space_guid.into(),
        }
    }

    async fn list_apps(&self, app_name: &str, space_guid: &str) -> CfResult<(String, AppList)> {
        let path = format!(
            "/v2/apps?q=name:{}&q=space_guid:{}",
            urlencoding::encode(app_name),
            urlencoding::encode(space_guid)
        );
        let rsp: AppList = self.api.get(&path).await?;
        Ok((path, rsp))
    }
}

#[derive(Debug, Deserialize)]
struct AppList {
    total_results: Option<u64>,
    #[serde(default)]
    resources: Vec<AppResource>,
}

#[derive(Debug, Deserialize)]
struct AppResource {
    metadata: ResourceMetadata,
    entity: AppEntity,
}

#[derive(Debug, Deserialize)]
struct ResourceMetadata {
    guid: String,
}

#[derive(Debug, Deserialize)]
struct AppEntity {
    name: String,
}

#[derive(Debug, Serialize)]
struct CopyBitsRequest<'a> {
    source_app_guid: &'a str,
}

#[derive(Debug, Serialize, Deserialize)]
struct Lifecycle {
    #[serde(rename = "type")]
    kind: String,
    data: LifecycleData,
}

#[derive(Debug, Serialize, Deserialize)]
struct LifecycleData {
    stack: Option<String>,
}

#[derive(Debug, Serialize)]
struct UpdateLifecycle {
    lifecycle: Lifecycle,
}

#[derive(Debug, Deserialize)]
struct V3App {
    guid: String,
    lifecycle: Option<Lifecycle>,
}

#[async_trait]
impl PlatformClient for CfPlatform {
    async fn create_descriptor(&self, app_name: &str, dest: &Path) -> CfResult<()> {
        self.cli
            .run([
                OsStr::new("create-app-manifest"),
                OsStr::new(app_name),
                OsStr::new("-p"),
                dest.as_os_str(),
            ])
            .await?;
        Ok(())
    }

    async fn deploy(
        &self,
        app_name: &str,
        descriptor: &Path,
        content: &Path,
        start: bool,
    ) -> CfResult<()> {
        let mut args = vec![
            OsStr::new("push"),
            OsStr::new(app_name),
            OsStr::new("-f"),
            descriptor.as_os_str(),
            OsStr::new("-p"),
            content.as_os_str(),
        ];
        if !start {
            args.push(OsStr::new("--no-start"));
        }
        self.cli.run(args).await?;
        Ok(())
    }

    async fn rename(&self, old_name: &str, new_name: &str) -> CfResult<()> {
        self.cli.run(["rename", old_name, new_name]).await?;
        Ok(())
    }

    async fn restart(&self, app_name: &str) -> CfResult<()> {
        self.cli.run(["restart", app_name]).await?;
        Ok(())
    }

    async fn restage(&self, app_name: &str) -> CfResult<()> {
        self.cli.run(["restage", app_name]).await?;
        Ok(())
    }

    async fn delete(&self, app_name: &str) -> CfResult<()> {
        // `cf delete -f` exits 0 when the app is already gone
        self.cli.run(["delete", app_name, "-f"]).await?;
        Ok(())
    }

    async fn resolve_identity(&self, app_name: &str) -> CfResult<AppIdentity> {
        let (_, rsp) = self.list_apps(app_name, &self.space_guid).await?;
        rsp.resources
            .into_iter()
            .find(|r| r.entity.name == app_name)
            .map(|r| AppIdentity {
                name: r.entity.name,
                guid: r.metadata.guid,
            })
            .ok_or_else(|| CfError::NotFound(app_name.to_string()))
    }

    async fn copy_artifact(&self, source_guid: &str, dest_guid: &str) -> CfResult<Job> {
        let job: Job = self
            .api
            .post(
                &format!("/v2/apps/{}/copy_bits", dest_guid),
                CopyBitsRequest {
                    source_app_guid: source_guid,
                },
            )
            .await?;
        info!("Copy bits job {} is {:?}", job.id(), job.status());
        Ok(job)
    }

    async fn fetch_job(&self, job_guid: &str) -> CfResult<Job> {
        self.api.get(&format!("/v2/jobs/{}", job_guid)).await
    }

    async fn reassign_stack(&self, app_guid: &str, stack: &str) -> CfResult<()> {
        let app: V3App = self
            .api
            .patch(
                &format!("/v3/apps/{}", app_guid),
                UpdateLifecycle {
                    lifecycle: Lifecycle {
                        kind: "buildpack".to_string(),
                        data: LifecycleData {
                            stack: Some(stack.to_string()),
                        },
                    },
                },
            )
            .await?;
        debug!(
            "App {} lifecycle is now {:?}",
            app.guid,
            app.lifecycle.and_then(|l| l.data.stack)
        );
        Ok(())
    }

    async fn count_matching(&self, app_name: &str, space_guid: &str) -> CfResult<u64> {
        let (path, rsp) = self.list_apps(app_name, space_guid).await?;
        rsp.total_results.ok_or(CfError::MalformedResponse {
            path,
            reason: "missing total_results".to_string(),
        })
    }

    fn space_guid(&self) -> &str {
        &self.space_guid
    }
}
