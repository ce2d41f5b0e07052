use crate::cf::{Job, JobStatus, PlatformClient};
use crate::error::{CfError, CfResult};
use log::{debug, info};
use rollback_procedure::{BackoffPolicy, PollError, PollStatus, poll_until};
use std::sync::Arc;
use tokio::sync::watch;

/// Waits for asynchronous platform jobs to reach a terminal state.
#[derive(Clone)]
pub struct JobPoller {
    client: Arc<dyn PlatformClient>,
    policy: BackoffPolicy,
    cancel: Option<watch::Receiver<bool>>,
}

impl JobPoller {
    pub fn new(client: Arc<dyn PlatformClient>, policy: BackoffPolicy) -> Self {
        Self {
            client,
            policy,
            cancel: None,
        }
    }

    /// Stop waiting once the channel flips to `true`
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// True once the cancel channel flipped to `true`
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Poll `job` until it is `finished`.
    ///
    /// A `failed` job is returned as [CfError::Job] with the platform's error details.
    /// The status carried by `job` itself is not trusted, the job is always fetched at
    /// least once.
    pub async fn await_completion(&self, job: &Job) -> CfResult<()> {
        let id = job.id().to_string();
        info!("Waiting for job {}", id);

        let cancel = self.cancel.clone();
        let cancelled = async move {
            if let Some(mut rx) = cancel
                && rx.wait_for(|c| *c).await.is_ok()
            {
                return;
            }
            // sender gone or no channel at all, never cancel
            std::future::pending::<()>().await
        };

        let client = self.client.clone();
        let res = poll_until(&self.policy, cancelled, |attempt| {
            let client = client.clone();
            let id = id.clone();
            async move {
                let job = client.fetch_job(&id).await?;
                debug!("Job {} poll #{}: {:?}", id, attempt, job.status());
                match job.status() {
                    JobStatus::Finished => Ok(PollStatus::Ready(())),
                    JobStatus::Failed => Err(job.failure()),
                    _ => Ok(PollStatus::Pending),
                }
            }
        })
        .await;

        match res {
            Ok(()) => {
                info!("Job {} finished", id);
                Ok(())
            }
            Err(PollError::Failed(e)) => Err(e),
            Err(PollError::TimedOut { attempts, waited }) => Err(CfError::PollTimedOut {
                job: id,
                attempts,
                waited,
            }),
            Err(PollError::Cancelled { attempts }) => {
                Err(CfError::PollCancelled { job: id, attempts })
            }
        }
    }
}
