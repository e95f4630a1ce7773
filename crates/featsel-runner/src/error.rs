use featsel_core::{MemoryError, SettingsError};
use std::path::PathBuf;
use thiserror::Error;

use crate::scheduler::JobId;

/// Everything the job layer and the selection loop can fail with.
///
/// `Config` and `Settings` come from bad input, `Lifecycle` from a caller
/// driving a job out of order, and the rest from the scheduler or the jobs
/// themselves.
#[derive(Debug, Error)]
pub enum Error {
    #[error("config_invalid: {0}")]
    Config(String),

    #[error("lifecycle_violation: {0}")]
    Lifecycle(String),

    #[error("scheduler_failed: {0}")]
    Scheduler(String),

    #[error("job_not_live: {name} ({id}) is not running")]
    NotLive { name: String, id: JobId },

    #[error("wait_timeout: {name} ({id}) still running after {waited_secs}s")]
    Timeout {
        name: String,
        id: JobId,
        waited_secs: u64,
    },

    #[error("wait_cancelled: {0}")]
    Cancelled(String),

    #[error("job_failed: {name} ({id}), see {}", log.display())]
    JobFailed { name: String, id: JobId, log: PathBuf },

    #[error("job_unfinished: {name} ({id}) left the scheduler without a completion marker")]
    Unfinished { name: String, id: JobId },

    #[error("no_log_file: {}", .0.display())]
    NoLogFile(PathBuf),

    #[error("{context}: {source:#}")]
    Callback {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("config_invalid: {0}")]
    Memory(#[from] MemoryError),

    #[error("io_error: {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Error {
        let path = path.into();
        move |source| Error::Io { path, source }
    }

    pub(crate) fn callback(context: impl Into<String>) -> impl FnOnce(anyhow::Error) -> Error {
        let context = context.into();
        move |source| Error::Callback { context, source }
    }

    /// True for errors that mean the caller drove a job out of order.
    pub fn is_lifecycle_violation(&self) -> bool {
        matches!(self, Error::Lifecycle(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
