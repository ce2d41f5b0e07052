use std::time::Duration;
use thiserror::Error;

pub type CfResult<T> = Result<T, CfError>;

/// Failures raised while talking to the platform.
#[derive(Debug, Error)]
pub enum CfError {
    /// The request never produced a response
    #[error("request failed: {0}")]
    Transport(String),

    /// The request body could not be serialized
    #[error("failed to encode request body for {path}: {message}")]
    Encode { path: String, message: String },

    /// The response body was not the expected JSON
    #[error("failed to decode response from {path}: {message}")]
    Decode { path: String, message: String },

    /// The response decoded but a required field is missing or invalid
    #[error("malformed response from {path}: {reason}")]
    MalformedResponse { path: String, reason: String },

    /// The platform rejected an API call
    #[error("{method} {path}: {status}: {body}")]
    Remote {
        method: String,
        path: String,
        status: u16,
        body: String,
    },

    /// A `cf` CLI invocation exited unsuccessfully
    #[error("cf {args} failed ({status}): {output}")]
    Command {
        args: String,
        status: String,
        output: String,
    },

    /// An asynchronous job finished in the `failed` state
    #[error("Error {error_code}, {description} [code: {code}]")]
    Job {
        code: i64,
        description: String,
        error_code: String,
    },

    #[error("app '{0}' not found")]
    NotFound(String),

    #[error("job {job} still not finished after {attempts} polls ({waited:?})")]
    PollTimedOut {
        job: String,
        attempts: u32,
        waited: Duration,
    },

    #[error("cancelled while waiting for job {job} ({attempts} polls)")]
    PollCancelled { job: String, attempts: u32 },

    #[error("interrupted before {0}")]
    Cancelled(String),

    /// The platform is not in a state the migration can start from
    #[error("{0}")]
    Precondition(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CfError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CfError::NotFound(_))
    }
}
