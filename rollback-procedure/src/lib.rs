//! Step-based rollback pipelines and backoff polling.
//!
//! This crate provides two main abstractions:
//!
//! - [`Pipeline`]: Execute a sequence of async steps with automatic rollback on failure.
//!   If step N fails, rollbacks for steps 0..N-1 are executed in reverse order, and the
//!   unwind stops at the first rollback that fails.
//!
//! - [`poll_until`] / [`BackoffPolicy`]: Repeatedly query a long running remote operation
//!   until it reports a terminal state, sleeping with exponential backoff in between,
//!   bounded by an optional maximum wait and a caller supplied cancellation signal.
//!
//! # Phases
//!
//! Some undo logic belongs to a group of steps rather than a single one: renaming a
//! resource out of the way and creating its replacement is undone by one action,
//! regardless of which later step failed. A [`Phase`] is a contiguous group of steps
//! that shares one rollback. The rollback is armed when the first step of the phase
//! completes, runs at most once, and is discarded once the last step of the phase
//! completes.
//!
//! ```ignore
//! use rollback_procedure::Pipeline;
//!
//! struct Ctx { resource_id: Option<u64> }
//!
//! let ctx = Pipeline::new(Ctx { resource_id: None })
//!     .step_with_rollback("create_resource",
//!         |ctx| Box::pin(async move {
//!             ctx.resource_id = Some(create().await?);
//!             Ok(())
//!         }),
//!         |ctx| Box::pin(async move {
//!             if let Some(id) = ctx.resource_id {
//!                 delete(id).await?;
//!             }
//!             Ok(())
//!         }),
//!     )
//!     .phase("swap",
//!         |ctx| Box::pin(async move { swap_back(ctx).await }),
//!         |phase| phase
//!             .step("move_old", |ctx| Box::pin(async move { move_old(ctx).await }))
//!             .step("create_new", |ctx| Box::pin(async move { create_new(ctx).await })),
//!     )
//!     .execute()
//!     .await?;
//! ```
//!
//! # Polling
//!
//! ```ignore
//! use rollback_procedure::{poll_until, BackoffPolicy, PollStatus};
//!
//! let job = poll_until(&BackoffPolicy::default(), std::future::pending(), |_attempt| async {
//!     let job = fetch_job(id).await?;
//!     Ok(if job.done { PollStatus::Ready(job) } else { PollStatus::Pending })
//! })
//! .await?;
//! ```

use log::{debug, error, info, warn};
use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{Instant, sleep};

/// Message attached to [`PipelineError::RollbackFailed`] unless the pipeline overrides it.
pub const DEFAULT_ROLLBACK_FAILURE_MESSAGE: &str =
    "Rollback did not complete, the system may be left partially changed and needs manual inspection.";

// ─── Backoff Policy ────────────────────────────────────────────────────────────

/// Configuration for the delay between polls, with exponential backoff.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay after the first pending result
    pub min_delay: Duration,
    /// Maximum delay between polls (caps exponential backoff)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (delay *= factor each attempt)
    pub factor: f64,
    /// Give up once this much time has passed, `None` waits forever
    pub max_wait: Option<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
            max_wait: Some(Duration::from_secs(15 * 60)),
        }
    }
}

impl BackoffPolicy {
    /// Poll back-to-back with no delay and no deadline.
    pub fn immediate() -> Self {
        Self {
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            factor: 1.0,
            max_wait: None,
        }
    }

    pub fn with_min_delay(mut self, delay: Duration) -> Self {
        self.min_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Calculate the delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.min_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        let clamped = delay.min(self.max_delay.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(clamped)
    }
}

// ─── Polling ───────────────────────────────────────────────────────────────────

/// Result of a single poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus<T> {
    /// The operation reached a terminal state
    Ready(T),
    /// Not finished yet, poll again
    Pending,
}

/// Why [`poll_until`] stopped without a result.
#[derive(Debug)]
pub enum PollError<E> {
    /// The poll function itself failed; never retried
    Failed(E),
    /// `max_wait` elapsed before the operation finished
    TimedOut { attempts: u32, waited: Duration },
    /// The cancellation signal fired
    Cancelled { attempts: u32 },
}

impl<E> PollError<E> {
    /// Map the inner error to a different type
    pub fn map<F, U>(self, f: F) -> PollError<U>
    where
        F: FnOnce(E) -> U,
    {
        match self {
            PollError::Failed(e) => PollError::Failed(f(e)),
            PollError::TimedOut { attempts, waited } => PollError::TimedOut { attempts, waited },
            PollError::Cancelled { attempts } => PollError::Cancelled { attempts },
        }
    }
}

impl<E: fmt::Display> fmt::Display for PollError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollError::Failed(e) => write!(f, "{}", e),
            PollError::TimedOut { attempts, waited } => {
                write!(f, "gave up after {} polls in {:?}", attempts, waited)
            }
            PollError::Cancelled { attempts } => write!(f, "cancelled after {} polls", attempts),
        }
    }
}

impl<E: fmt::Display + fmt::Debug> std::error::Error for PollError<E> {}

/// Call `f` until it returns [`PollStatus::Ready`].
///
/// `f` receives the 1-indexed attempt number. Errors from `f` are returned immediately
/// without retry. Between pending results the loop sleeps according to `policy`; the
/// `cancel` future is raced against every sleep, pass [`std::future::pending`] to
/// disable cancellation.
pub async fn poll_until<F, Fut, T, E, C>(
    policy: &BackoffPolicy,
    cancel: C,
    mut f: F,
) -> Result<T, PollError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<PollStatus<T>, E>>,
    C: Future<Output = ()>,
{
    let start = Instant::now();
    tokio::pin!(cancel);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if let PollStatus::Ready(v) = f(attempt).await.map_err(PollError::Failed)? {
            return Ok(v);
        }

        let delay = policy.delay_for_attempt(attempt - 1);
        if let Some(max_wait) = policy.max_wait
            && start.elapsed() + delay > max_wait
        {
            warn!(
                "Giving up after {} polls, next poll would exceed {:?}",
                attempt, max_wait
            );
            return Err(PollError::TimedOut {
                attempts: attempt,
                waited: start.elapsed(),
            });
        }

        tokio::select! {
            biased;
            _ = &mut cancel => {
                warn!("Polling cancelled after {} polls", attempt);
                return Err(PollError::Cancelled { attempts: attempt });
            }
            _ = sleep(delay) => {}
        }
    }
}

// ─── Step-based Pipeline ───────────────────────────────────────────────────────

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type-erased step function that operates on a mutable context
type StepFn<Ctx, E> = Box<dyn FnOnce(&mut Ctx) -> BoxFuture<'_, Result<(), E>> + Send>;

/// What has to happen to undo a step once it succeeded.
enum Undo<Ctx, E> {
    None,
    Step(StepFn<Ctx, E>),
    /// Index into the pipeline's phases
    Phase(usize),
    /// Member of a phase whose own failure leaves the phase rollback alone
    PhaseExempt(usize),
}

/// A step in the pipeline: an action and how to undo it.
struct PipelineStep<Ctx, E> {
    name: String,
    action: StepFn<Ctx, E>,
    undo: Undo<Ctx, E>,
}

struct PhaseRollback<Ctx, E> {
    name: String,
    rollback: Option<StepFn<Ctx, E>>,
    /// Index of the last step of this phase in the pipeline
    last_step: usize,
    armed: bool,
}

/// Entry on the unwind stack.
enum Completed<Ctx, E> {
    NoRollback(String),
    Step(String, StepFn<Ctx, E>),
    Phase(usize),
}

/// Steps grouped under one shared rollback, see [`Pipeline::phase`].
pub struct Phase<Ctx, E> {
    steps: Vec<(String, StepFn<Ctx, E>, bool)>,
}

impl<Ctx, E> Phase<Ctx, E> {
    /// Add a step to the phase. Its undo is the phase rollback.
    pub fn step(
        mut self,
        name: impl Into<String>,
        action: impl FnOnce(&mut Ctx) -> BoxFuture<'_, Result<(), E>> + Send + 'static,
    ) -> Self {
        self.steps.push((name.into(), Box::new(action), true));
        self
    }

    /// Add a step whose failure does not run the phase rollback.
    ///
    /// The phase stays armed while this step runs, so a failure in a later member
    /// still rolls the phase back.
    pub fn step_without_rollback(
        mut self,
        name: impl Into<String>,
        action: impl FnOnce(&mut Ctx) -> BoxFuture<'_, Result<(), E>> + Send + 'static,
    ) -> Self {
        self.steps.push((name.into(), Box::new(action), false));
        self
    }
}

/// Error returned by [`Pipeline::execute`].
#[derive(Debug)]
pub enum PipelineError<E> {
    /// A step failed and the unwind completed. `rollbacks` is the number of
    /// rollbacks that ran, zero when there was nothing to undo.
    Failed {
        step: String,
        error: E,
        rollbacks: usize,
    },
    /// A step failed and then a rollback failed while unwinding. Rollbacks of
    /// steps before the failing one were not attempted.
    RollbackFailed {
        step: String,
        error: E,
        rollback: String,
        rollback_error: E,
        message: String,
        /// Rollbacks that completed before the failing one
        rollbacks: usize,
    },
}

impl<E> PipelineError<E> {
    /// Name of the step whose action failed
    pub fn step(&self) -> &str {
        match self {
            PipelineError::Failed { step, .. } | PipelineError::RollbackFailed { step, .. } => step,
        }
    }

    /// The original failure
    pub fn error(&self) -> &E {
        match self {
            PipelineError::Failed { error, .. } | PipelineError::RollbackFailed { error, .. } => {
                error
            }
        }
    }

    /// The failure raised while rolling back, if any
    pub fn rollback_error(&self) -> Option<&E> {
        match self {
            PipelineError::Failed { .. } => None,
            PipelineError::RollbackFailed { rollback_error, .. } => Some(rollback_error),
        }
    }

    /// True when no rollback failed.
    ///
    /// This does not mean anything was undone: steps without a rollback, or a phase
    /// that already committed, leave their changes in place. See [`Self::rollbacks`].
    pub fn is_rolled_back(&self) -> bool {
        matches!(self, PipelineError::Failed { .. })
    }

    /// Number of rollbacks that completed before the unwind ended
    pub fn rollbacks(&self) -> usize {
        match self {
            PipelineError::Failed { rollbacks, .. } => *rollbacks,
            PipelineError::RollbackFailed { rollbacks, .. } => *rollbacks,
        }
    }

    /// Extract the original failure
    pub fn into_inner(self) -> E {
        match self {
            PipelineError::Failed { error, .. } | PipelineError::RollbackFailed { error, .. } => {
                error
            }
        }
    }
}

impl<E: fmt::Display> fmt::Display for PipelineError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Failed { step, error, .. } => write!(f, "{} failed: {}", step, error),
            PipelineError::RollbackFailed {
                step,
                error,
                rollback,
                rollback_error,
                message,
                ..
            } => write!(
                f,
                "{}\n{} failed: {}\nrollback of {} failed: {}",
                message, step, error, rollback, rollback_error
            ),
        }
    }
}

impl<E: fmt::Display + fmt::Debug> std::error::Error for PipelineError<E> {}

/// A pipeline of steps that execute in order with automatic rollback on failure.
///
/// Each step is an action with an optional rollback. If step N fails, rollbacks for
/// the completed steps 0..N-1 are executed in reverse order. Steps without a rollback
/// are skipped. If a rollback fails the unwind stops there and the error reports both
/// failures.
///
/// The pipeline operates on a shared mutable context `Ctx` that steps can
/// read from and write to, allowing later steps to access data produced
/// by earlier steps.
pub struct Pipeline<Ctx, E = Box<dyn std::error::Error + Send + Sync>> {
    ctx: Ctx,
    steps: Vec<PipelineStep<Ctx, E>>,
    phases: Vec<PhaseRollback<Ctx, E>>,
    rollback_failure_message: String,
}

impl<Ctx, E> Pipeline<Ctx, E>
where
    Ctx: Send + 'static,
    E: fmt::Display + fmt::Debug + Send + 'static,
{
    pub fn new(ctx: Ctx) -> Self {
        Self {
            ctx,
            steps: Vec::new(),
            phases: Vec::new(),
            rollback_failure_message: DEFAULT_ROLLBACK_FAILURE_MESSAGE.to_string(),
        }
    }

    /// Message reported when a rollback fails.
    pub fn with_rollback_failure_message(mut self, message: impl Into<String>) -> Self {
        self.rollback_failure_message = message.into();
        self
    }

    /// Add a step with only an action (no rollback).
    pub fn step(
        mut self,
        name: impl Into<String>,
        action: impl FnOnce(&mut Ctx) -> BoxFuture<'_, Result<(), E>> + Send + 'static,
    ) -> Self {
        self.steps.push(PipelineStep {
            name: name.into(),
            action: Box::new(action),
            undo: Undo::None,
        });
        self
    }

    /// Add a step with both an action and a rollback.
    ///
    /// The rollback runs only if this step succeeded and a later step fails.
    pub fn step_with_rollback(
        mut self,
        name: impl Into<String>,
        action: impl FnOnce(&mut Ctx) -> BoxFuture<'_, Result<(), E>> + Send + 'static,
        rollback: impl FnOnce(&mut Ctx) -> BoxFuture<'_, Result<(), E>> + Send + 'static,
    ) -> Self {
        self.steps.push(PipelineStep {
            name: name.into(),
            action: Box::new(action),
            undo: Undo::Step(Box::new(rollback)),
        });
        self
    }

    /// Add a group of steps that share one rollback.
    ///
    /// The rollback runs if any step of the phase fails after at least one step of the
    /// phase completed, unless the failing step was added with
    /// [`Phase::step_without_rollback`]. It never runs more than once, and failures after
    /// the last step of the phase completed do not trigger it.
    pub fn phase(
        mut self,
        name: impl Into<String>,
        rollback: impl FnOnce(&mut Ctx) -> BoxFuture<'_, Result<(), E>> + Send + 'static,
        build: impl FnOnce(Phase<Ctx, E>) -> Phase<Ctx, E>,
    ) -> Self {
        let name = name.into();
        let phase = build(Phase { steps: Vec::new() });
        if phase.steps.is_empty() {
            debug!("Phase '{}' has no steps, ignoring", name);
            return self;
        }

        let idx = self.phases.len();
        for (step_name, action, rolls_back) in phase.steps {
            self.steps.push(PipelineStep {
                name: step_name,
                action,
                undo: if rolls_back {
                    Undo::Phase(idx)
                } else {
                    Undo::PhaseExempt(idx)
                },
            });
        }
        self.phases.push(PhaseRollback {
            name,
            rollback: Some(Box::new(rollback)),
            last_step: self.steps.len() - 1,
            armed: false,
        });
        self
    }

    /// Execute all steps in order. On failure, rollback completed steps in reverse.
    ///
    /// Returns the context on success so the caller can extract results from it.
    pub async fn execute(mut self) -> Result<Ctx, PipelineError<E>> {
        let mut completed: Vec<Completed<Ctx, E>> = Vec::new();

        // Drain steps so we can take ownership of each one
        let steps: Vec<PipelineStep<Ctx, E>> = self.steps.drain(..).collect();
        let total = steps.len();

        for (idx, step) in steps.into_iter().enumerate() {
            info!("[{}/{}] {}", idx + 1, total, step.name);
            match (step.action)(&mut self.ctx).await {
                Ok(()) => match step.undo {
                    Undo::None => completed.push(Completed::NoRollback(step.name)),
                    Undo::Step(rollback) => completed.push(Completed::Step(step.name, rollback)),
                    Undo::Phase(p) | Undo::PhaseExempt(p) => {
                        let phase = &mut self.phases[p];
                        if !phase.armed {
                            phase.armed = true;
                            completed.push(Completed::Phase(p));
                        }
                        if phase.last_step == idx {
                            debug!("Phase '{}' complete, dropping its rollback", phase.name);
                            phase.rollback = None;
                            completed.retain(|c| !matches!(c, Completed::Phase(x) if *x == p));
                        }
                    }
                },
                Err(e) => {
                    if let Undo::PhaseExempt(p) = step.undo {
                        let phase = &mut self.phases[p];
                        if phase.rollback.take().is_some() && phase.armed {
                            warn!(
                                "Step '{}' does not roll back phase '{}', leaving it in place",
                                step.name, phase.name
                            );
                        }
                    }
                    warn!(
                        "Pipeline step '{}' failed: {}, rolling back {} steps",
                        step.name,
                        e,
                        completed.len()
                    );
                    return Err(unwind(
                        &mut self.ctx,
                        &mut self.phases,
                        completed,
                        step.name,
                        e,
                        &self.rollback_failure_message,
                    )
                    .await);
                }
            }
        }

        Ok(self.ctx)
    }
}

/// Run rollbacks in reverse order, stopping at the first one that fails.
async fn unwind<Ctx, E: fmt::Display>(
    ctx: &mut Ctx,
    phases: &mut [PhaseRollback<Ctx, E>],
    completed: Vec<Completed<Ctx, E>>,
    step: String,
    error: E,
    message: &str,
) -> PipelineError<E> {
    let mut rollbacks = 0;
    for entry in completed.into_iter().rev() {
        let (name, rollback) = match entry {
            Completed::NoRollback(name) => {
                debug!("Nothing to roll back for '{}'", name);
                continue;
            }
            Completed::Step(name, rollback) => (name, rollback),
            Completed::Phase(p) => match phases[p].rollback.take() {
                Some(rollback) => (phases[p].name.clone(), rollback),
                None => continue,
            },
        };

        info!("Rolling back '{}'", name);
        if let Err(rollback_error) = (rollback)(&mut *ctx).await {
            error!("Rollback of '{}' failed: {}", name, rollback_error);
            return PipelineError::RollbackFailed {
                step,
                error,
                rollback: name,
                rollback_error,
                message: message.to_string(),
                rollbacks,
            };
        }
        rollbacks += 1;
    }

    PipelineError::Failed {
        step,
        error,
        rollbacks,
    }
}

impl<Ctx, E> IntoFuture for Pipeline<Ctx, E>
where
    Ctx: Send + 'static,
    E: fmt::Display + fmt::Debug + Send + 'static,
{
    type Output = Result<Ctx, PipelineError<E>>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.execute())
    }
}
