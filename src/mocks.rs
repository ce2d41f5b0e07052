use crate::cf::{
    AppIdentity, Job, JobEntity, JobErrorDetails, JobMetadata, JobStatus, PlatformClient,
};
use crate::error::{CfError, CfResult};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, watch};

pub const MOCK_SPACE: &str = "space-1";
const DEFAULT_STACK: &str = "cflinuxfs3";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    CreateDescriptor,
    Deploy,
    Rename,
    Restart,
    Restage,
    Delete,
    ResolveIdentity,
    CopyArtifact,
    FetchJob,
    ReassignStack,
    CountMatching,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockApp {
    pub guid: String,
    pub stack: String,
    /// Identifies the deployed content, `None` until something was pushed
    pub bits: Option<String>,
    pub started: bool,
}

#[derive(Debug)]
struct MockJob {
    source_bits: Option<String>,
    dest_guid: String,
    statuses: VecDeque<JobStatus>,
}

/// In-memory application registry of a single space.
#[derive(Debug, Clone)]
pub struct MockPlatform {
    pub apps: Arc<Mutex<HashMap<String, MockApp>>>,
    calls: Arc<Mutex<Vec<(Op, String)>>>,
    failures: Arc<Mutex<HashMap<Op, VecDeque<CfError>>>>,
    jobs: Arc<Mutex<HashMap<String, MockJob>>>,
    job_script: Arc<Mutex<Vec<JobStatus>>>,
    job_error: Arc<Mutex<Option<JobErrorDetails>>>,
    deploy_reports_failure: Arc<AtomicBool>,
    interrupt: Arc<Mutex<Option<(Op, watch::Sender<bool>)>>>,
    next_id: Arc<AtomicU64>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self {
            apps: Default::default(),
            calls: Default::default(),
            failures: Default::default(),
            jobs: Default::default(),
            job_script: Arc::new(Mutex::new(vec![JobStatus::Finished])),
            job_error: Default::default(),
            deploy_reports_failure: Default::default(),
            interrupt: Default::default(),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl MockPlatform {
    fn next_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Add a running app with deployed bits
    pub async fn add_app(&self, name: &str, stack: &str, started: bool) -> MockApp {
        let app = MockApp {
            guid: self.next_id("guid"),
            stack: stack.to_string(),
            bits: Some(format!("{}-bits", name)),
            started,
        };
        self.apps
            .lock()
            .await
            .insert(name.to_string(), app.clone());
        app
    }

    pub async fn app(&self, name: &str) -> Option<MockApp> {
        self.apps.lock().await.get(name).cloned()
    }

    /// Registry contents ordered by name
    pub async fn snapshot(&self) -> BTreeMap<String, MockApp> {
        self.apps
            .lock()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Make the next call of `op` fail with `error`, queued errors are used in order
    pub async fn fail_next(&self, op: Op, error: CfError) {
        self.failures
            .lock()
            .await
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Statuses reported by successive fetches of every new job, the last one repeats
    pub async fn script_job(&self, statuses: &[JobStatus]) {
        *self.job_script.lock().await = statuses.to_vec();
    }

    pub async fn set_job_error(&self, code: i64, description: &str, error_code: &str) {
        *self.job_error.lock().await = Some(JobErrorDetails {
            code,
            description: description.to_string(),
            error_code: error_code.to_string(),
        });
    }

    /// Push creates the app but reports a failure, like a staging error would
    pub fn set_deploy_reports_failure(&self, value: bool) {
        self.deploy_reports_failure.store(value, Ordering::Relaxed);
    }

    /// Flip `cancel` to `true` once a call of `op` succeeds, like a Ctrl-C would
    pub async fn interrupt_after(&self, op: Op, cancel: watch::Sender<bool>) {
        *self.interrupt.lock().await = Some((op, cancel));
    }

    pub async fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .await
            .iter()
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub async fn count_calls(&self, op: Op) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|(o, _)| *o == op)
            .count()
    }

    async fn record(&self, op: Op, call: String) -> CfResult<()> {
        self.calls.lock().await.push((op, call));
        match self
            .failures
            .lock()
            .await
            .get_mut(&op)
            .and_then(|q| q.pop_front())
        {
            Some(e) => Err(e),
            None => {
                if let Some((o, tx)) = self.interrupt.lock().await.as_ref()
                    && *o == op
                {
                    let _ = tx.send(true);
                }
                Ok(())
            }
        }
    }

    async fn find_by_guid(&self, guid: &str) -> Option<(String, MockApp)> {
        self.apps
            .lock()
            .await
            .iter()
            .find(|(_, a)| a.guid == guid)
            .map(|(n, a)| (n.clone(), a.clone()))
    }

    fn not_found(method: &str, path: String) -> CfError {
        CfError::Remote {
            method: method.to_string(),
            path,
            status: 404,
            body: "{\"error_code\":\"CF-AppNotFound\"}".to_string(),
        }
    }
}

#[async_trait]
impl PlatformClient for MockPlatform {
    async fn create_descriptor(&self, app_name: &str, dest: &Path) -> CfResult<()> {
        self.record(
            Op::CreateDescriptor,
            format!("create-app-manifest {}", app_name),
        )
        .await?;
        let app = self
            .app(app_name)
            .await
            .ok_or_else(|| CfError::NotFound(app_name.to_string()))?;
        let manifest = format!(
            "applications:\n- name: {}\n  stack: {}\n",
            app_name, app.stack
        );
        tokio::fs::write(dest, manifest).await?;
        Ok(())
    }

    async fn deploy(
        &self,
        app_name: &str,
        descriptor: &Path,
        content: &Path,
        start: bool,
    ) -> CfResult<()> {
        self.record(
            Op::Deploy,
            format!(
                "push {}{}",
                app_name,
                if start { "" } else { " --no-start" }
            ),
        )
        .await?;
        let manifest = tokio::fs::read_to_string(descriptor).await?;
        let stack = manifest
            .lines()
            .find_map(|l| l.trim().strip_prefix("stack:"))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| DEFAULT_STACK.to_string());
        if !tokio::fs::try_exists(content).await? {
            return Err(CfError::Precondition(format!(
                "content {} does not exist",
                content.display()
            )));
        }

        let app = MockApp {
            guid: self.next_id("guid"),
            stack,
            bits: Some("placeholder".to_string()),
            started: start,
        };
        self.apps.lock().await.insert(app_name.to_string(), app);

        if self.deploy_reports_failure.load(Ordering::Relaxed) {
            return Err(CfError::Command {
                args: format!("push {}", app_name),
                status: "exit status: 1".to_string(),
                output: "FAILED\nStaging error".to_string(),
            });
        }
        Ok(())
    }

    async fn rename(&self, old_name: &str, new_name: &str) -> CfResult<()> {
        self.record(Op::Rename, format!("rename {} {}", old_name, new_name))
            .await?;
        let mut apps = self.apps.lock().await;
        if apps.contains_key(new_name) {
            return Err(CfError::Command {
                args: format!("rename {} {}", old_name, new_name),
                status: "exit status: 1".to_string(),
                output: format!("FAILED\nThe app name {} is taken", new_name),
            });
        }
        let app = apps
            .remove(old_name)
            .ok_or_else(|| CfError::NotFound(old_name.to_string()))?;
        apps.insert(new_name.to_string(), app);
        Ok(())
    }

    async fn restart(&self, app_name: &str) -> CfResult<()> {
        self.record(Op::Restart, format!("restart {}", app_name))
            .await?;
        let mut apps = self.apps.lock().await;
        let app = apps
            .get_mut(app_name)
            .ok_or_else(|| CfError::NotFound(app_name.to_string()))?;
        app.started = true;
        Ok(())
    }

    async fn restage(&self, app_name: &str) -> CfResult<()> {
        self.record(Op::Restage, format!("restage {}", app_name))
            .await?;
        let mut apps = self.apps.lock().await;
        let app = apps
            .get_mut(app_name)
            .ok_or_else(|| CfError::NotFound(app_name.to_string()))?;
        app.started = true;
        Ok(())
    }

    async fn delete(&self, app_name: &str) -> CfResult<()> {
        self.record(Op::Delete, format!("delete {}", app_name))
            .await?;
        self.apps.lock().await.remove(app_name);
        Ok(())
    }

    async fn resolve_identity(&self, app_name: &str) -> CfResult<AppIdentity> {
        self.record(Op::ResolveIdentity, format!("app {}", app_name))
            .await?;
        self.app(app_name)
            .await
            .map(|a| AppIdentity {
                name: app_name.to_string(),
                guid: a.guid,
            })
            .ok_or_else(|| CfError::NotFound(app_name.to_string()))
    }

    async fn copy_artifact(&self, source_guid: &str, dest_guid: &str) -> CfResult<Job> {
        self.record(
            Op::CopyArtifact,
            format!("copy_bits {} -> {}", source_guid, dest_guid),
        )
        .await?;
        let (_, source) = self
            .find_by_guid(source_guid)
            .await
            .ok_or_else(|| Self::not_found("POST", format!("/v2/apps/{}", source_guid)))?;
        if self.find_by_guid(dest_guid).await.is_none() {
            return Err(Self::not_found(
                "POST",
                format!("/v2/apps/{}/copy_bits", dest_guid),
            ));
        }

        let id = self.next_id("job");
        let statuses = self.job_script.lock().await.iter().cloned().collect();
        self.jobs.lock().await.insert(
            id.clone(),
            MockJob {
                source_bits: source.bits,
                dest_guid: dest_guid.to_string(),
                statuses,
            },
        );
        Ok(Job {
            metadata: JobMetadata {
                guid: id.clone(),
                created_at: Some(Utc::now()),
                url: Some(format!("/v2/jobs/{}", id)),
            },
            entity: JobEntity {
                guid: id,
                status: JobStatus::Queued,
                error: None,
                error_details: None,
            },
        })
    }

    async fn fetch_job(&self, job_guid: &str) -> CfResult<Job> {
        self.record(Op::FetchJob, format!("job {}", job_guid))
            .await?;
        let (status, copy) = {
            let mut jobs = self.jobs.lock().await;
            let job = jobs
                .get_mut(job_guid)
                .ok_or_else(|| Self::not_found("GET", format!("/v2/jobs/{}", job_guid)))?;
            let status = if job.statuses.len() > 1 {
                job.statuses.pop_front()
            } else {
                job.statuses.front().cloned()
            }
            .unwrap_or(JobStatus::Finished);
            (status, (job.source_bits.clone(), job.dest_guid.clone()))
        };

        if status == JobStatus::Finished {
            let (bits, dest) = copy;
            if let Some(app) = self
                .apps
                .lock()
                .await
                .values_mut()
                .find(|a| a.guid == dest)
            {
                app.bits = bits;
            }
        }

        let error_details = if status == JobStatus::Failed {
            Some(self.job_error.lock().await.clone().unwrap_or_default())
        } else {
            None
        };
        Ok(Job {
            metadata: JobMetadata {
                guid: job_guid.to_string(),
                created_at: None,
                url: Some(format!("/v2/jobs/{}", job_guid)),
            },
            entity: JobEntity {
                guid: job_guid.to_string(),
                status,
                error: None,
                error_details,
            },
        })
    }

    async fn reassign_stack(&self, app_guid: &str, stack: &str) -> CfResult<()> {
        self.record(
            Op::ReassignStack,
            format!("stack {} {}", app_guid, stack),
        )
        .await?;
        let mut apps = self.apps.lock().await;
        let app = apps
            .values_mut()
            .find(|a| a.guid == app_guid)
            .ok_or_else(|| Self::not_found("PATCH", format!("/v3/apps/{}", app_guid)))?;
        app.stack = stack.to_string();
        Ok(())
    }

    async fn count_matching(&self, app_name: &str, space_guid: &str) -> CfResult<u64> {
        self.record(Op::CountMatching, format!("count {}", app_name))
            .await?;
        if space_guid != MOCK_SPACE {
            return Ok(0);
        }
        Ok(self.apps.lock().await.contains_key(app_name) as u64)
    }

    fn space_guid(&self) -> &str {
        MOCK_SPACE
    }
}
