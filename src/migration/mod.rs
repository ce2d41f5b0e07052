//! Blue/green stack change of a single app.
//!
//! The running app is renamed out of the way, a provisional app is pushed under the
//! original name, the bits are copied across, and the copy is restarted and restaged on
//! the target stack before the old app is deleted. Everything from the rename up to the
//! restage is undone as one unit: the provisional app is deleted and the old one gets
//! its name back. A failed stack change is the exception, it leaves both apps in place.
//!
//! An interrupt is honoured while waiting for the bits copy and before each step that
//! can still be undone.

use crate::cf::PlatformClient;
use crate::error::{CfError, CfResult};
use crate::job::JobPoller;
use crate::scratch::{self, ScratchArea};
use log::{info, warn};
use rollback_procedure::{Pipeline, PipelineError};
use std::path::PathBuf;
use std::sync::Arc;


/// Appended to the app name while the old copy is kept around
pub const VENERABLE_SUFFIX: &str = "-venerable";

pub fn venerable_name(app_name: &str) -> String {
    format!("{}{}", app_name, VENERABLE_SUFFIX)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackChangeRequest {
    pub app_name: String,
    pub target_stack: String,
}

impl StackChangeRequest {
    pub fn new(app_name: impl Into<String>, target_stack: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            target_stack: target_stack.into(),
        }
    }
}

pub type MigrationError = PipelineError<CfError>;

const PREFLIGHT_STEP: &str = "preflight";
const ACQUIRE_SCRATCH_STEP: &str = "acquire_scratch";

/// Steps whose failure leaves the platform as it was, even with nothing rolled back
const NON_MUTATING_STEPS: &[&str] = &[
    ACQUIRE_SCRATCH_STEP,
    PREFLIGHT_STEP,
    "snapshot_manifest",
    "stage_placeholder",
    "alias_old_app",
];

/// State of the platform after a failed run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Failed before anything was changed
    Untouched,
    /// Every change was undone
    RolledBack,
    /// Nothing was undone and the failed step left changes behind
    LeftInPlace,
    /// Undoing the changes failed part way
    RollbackFailed,
}

impl FailureOutcome {
    pub fn of(err: &MigrationError) -> Self {
        if !err.is_rolled_back() {
            FailureOutcome::RollbackFailed
        } else if err.rollbacks() > 0 {
            FailureOutcome::RolledBack
        } else if NON_MUTATING_STEPS.contains(&err.step()) {
            FailureOutcome::Untouched
        } else {
            FailureOutcome::LeftInPlace
        }
    }

    /// True when the app is as it was before the run
    pub fn is_restored(&self) -> bool {
        matches!(self, FailureOutcome::Untouched | FailureOutcome::RolledBack)
    }
}

/// State shared by the migration steps
pub struct MigrationContext {
    client: Arc<dyn PlatformClient>,
    poller: JobPoller,
    request: StackChangeRequest,
    venerable: String,
    manifest: PathBuf,
    payload: PathBuf,
}

impl MigrationContext {
    fn app(&self) -> &str {
        &self.request.app_name
    }

    fn ensure_not_cancelled(&self, step: &str) -> CfResult<()> {
        if self.poller.is_cancelled() {
            warn!("Interrupted, not running {}", step);
            return Err(CfError::Cancelled(step.to_string()));
        }
        Ok(())
    }

    async fn snapshot_manifest(&mut self) -> CfResult<()> {
        self.ensure_not_cancelled("snapshot_manifest")?;
        self.client
            .create_descriptor(self.app(), &self.manifest)
            .await
    }

    async fn stage_placeholder(&mut self) -> CfResult<()> {
        scratch::stage_placeholder(&self.payload).await?;
        Ok(())
    }

    async fn alias_old_app(&mut self) -> CfResult<()> {
        self.ensure_not_cancelled("alias_old_app")?;
        self.client.rename(self.app(), &self.venerable).await
    }

    /// Push the placeholder under the app name, not started.
    ///
    /// A failed push is not fatal: the app usually exists anyway and the next step
    /// fails on its own if it does not.
    async fn provision_new_app(&mut self) -> CfResult<()> {
        if let Err(e) = self
            .client
            .deploy(self.app(), &self.manifest, &self.payload, false)
            .await
        {
            warn!("Push of provisional app {} failed: {}", self.app(), e);
        }
        Ok(())
    }

    async fn transfer_bits(&mut self) -> CfResult<()> {
        self.ensure_not_cancelled("transfer_bits")?;
        let old = self.client.resolve_identity(&self.venerable).await?;
        let new = self.client.resolve_identity(self.app()).await?;
        info!("Copying bits {} -> {}", old.guid, new.guid);
        let job = self.client.copy_artifact(&old.guid, &new.guid).await?;
        self.poller.await_completion(&job).await
    }

    async fn activate_new_app(&mut self) -> CfResult<()> {
        self.ensure_not_cancelled("activate_new_app")?;
        self.client.restart(self.app()).await
    }

    async fn apply_target_stack(&mut self) -> CfResult<()> {
        let app = self.client.resolve_identity(self.app()).await?;
        self.client
            .reassign_stack(&app.guid, &self.request.target_stack)
            .await
    }

    async fn restage_new_app(&mut self) -> CfResult<()> {
        self.ensure_not_cancelled("restage_new_app")?;
        self.client.restage(self.app()).await
    }

    async fn retire_old_app(&mut self) -> CfResult<()> {
        self.client.delete(&self.venerable).await
    }

    /// Remove whatever sits under the app name and give the old app its name back
    async fn restore_old_app(&mut self) -> CfResult<()> {
        self.client.delete(self.app()).await?;
        self.client.rename(&self.venerable, self.app()).await
    }
}

/// Builds and runs the stack change pipeline.
#[derive(Clone)]
pub struct StackMigration {
    client: Arc<dyn PlatformClient>,
    poller: JobPoller,
    rollback_failure_message: Option<String>,
}

impl StackMigration {
    pub fn new(client: Arc<dyn PlatformClient>, poller: JobPoller) -> Self {
        Self {
            client,
            poller,
            rollback_failure_message: None,
        }
    }

    pub fn with_rollback_failure_message(mut self, message: Option<String>) -> Self {
        self.rollback_failure_message = message;
        self
    }

    /// Refuse to start unless exactly one app with the name exists and no venerable copy
    pub async fn preflight(&self, req: &StackChangeRequest) -> CfResult<()> {
        let space = self.client.space_guid();
        let apps = self.client.count_matching(&req.app_name, space).await?;
        if apps != 1 {
            return Err(CfError::Precondition(format!(
                "expected exactly one app named '{}' in space {}, found {}",
                req.app_name, space, apps
            )));
        }
        let venerable = venerable_name(&req.app_name);
        let leftovers = self.client.count_matching(&venerable, space).await?;
        if leftovers != 0 {
            return Err(CfError::Precondition(format!(
                "app '{}' already exists, clean up the previous run first",
                venerable
            )));
        }
        Ok(())
    }

    pub fn pipeline(
        &self,
        req: &StackChangeRequest,
        scratch: &ScratchArea,
    ) -> Pipeline<MigrationContext, CfError> {
        let ctx = MigrationContext {
            client: self.client.clone(),
            poller: self.poller.clone(),
            request: req.clone(),
            venerable: venerable_name(&req.app_name),
            manifest: scratch.manifest_path(),
            payload: scratch.payload_dir(),
        };

        let pipeline: Pipeline<MigrationContext, CfError> = Pipeline::new(ctx);
        let pipeline = match &self.rollback_failure_message {
            Some(msg) => pipeline.with_rollback_failure_message(msg.clone()),
            None => pipeline,
        };
        pipeline
            .step("snapshot_manifest", |ctx| Box::pin(ctx.snapshot_manifest()))
            .step("stage_placeholder", |ctx| Box::pin(ctx.stage_placeholder()))
            .phase(
                "swap_apps",
                |ctx| Box::pin(ctx.restore_old_app()),
                |phase| {
                    phase
                        .step("alias_old_app", |ctx| Box::pin(ctx.alias_old_app()))
                        .step("provision_new_app", |ctx| {
                            Box::pin(ctx.provision_new_app())
                        })
                        .step("transfer_bits", |ctx| Box::pin(ctx.transfer_bits()))
                        .step("activate_new_app", |ctx| Box::pin(ctx.activate_new_app()))
                        .step_without_rollback("apply_target_stack", |ctx| {
                            Box::pin(ctx.apply_target_stack())
                        })
                        .step("restage_new_app", |ctx| Box::pin(ctx.restage_new_app()))
                },
            )
            .step("retire_old_app", |ctx| Box::pin(ctx.retire_old_app()))
    }

    /// Run the migration in a fresh scratch area.
    pub async fn run(&self, req: &StackChangeRequest) -> Result<(), MigrationError> {
        let scratch = ScratchArea::acquire().map_err(|error| PipelineError::Failed {
            step: ACQUIRE_SCRATCH_STEP.to_string(),
            error,
            rollbacks: 0,
        })?;
        self.run_with_scratch(req, scratch).await
    }

    /// Run the migration, releasing `scratch` once it ends whatever the outcome.
    pub async fn run_with_scratch(
        &self,
        req: &StackChangeRequest,
        scratch: ScratchArea,
    ) -> Result<(), MigrationError> {
        let res = self.run_in(req, &scratch).await;
        scratch.release();
        res
    }

    async fn run_in(
        &self,
        req: &StackChangeRequest,
        scratch: &ScratchArea,
    ) -> Result<(), MigrationError> {
        info!(
            "Changing stack of {} to {}",
            req.app_name, req.target_stack
        );
        self.preflight(req)
            .await
            .map_err(|error| PipelineError::Failed {
                step: PREFLIGHT_STEP.to_string(),
                error,
                rollbacks: 0,
            })?;
        self.pipeline(req, scratch).execute().await?;
        info!("{} is now on {}", req.app_name, req.target_stack);
        Ok(())
    }
}
