//! Greedy forward feature selection where each candidate evaluation is a
//! batch job on a Grid Engine cluster.

pub mod config;
pub mod error;
pub mod exec;
pub mod job;
pub mod pool;
pub mod round;
pub mod scheduler;
pub mod selection;

#[cfg(test)]
mod testing;

pub use config::{job_name, run_selection, RunConfig};
pub use error::{Error, Result};
pub use exec::ExecutionSpec;
pub use job::{
    log_contains_any, FailureCheck, Job, JobContext, JobState, WaitOutcome, WaitPolicy,
    DEFAULT_GRACE,
};
pub use pool::JobPool;
pub use round::{score_file, JobRound};
pub use scheduler::{GridEngine, JobId, Scheduler, SchedulerCommands};
pub use selection::{
    Choice, ChooseNext, ForwardSelection, RoundReport, ScoreEach, Selection, SelectionAborted,
    SelectionParams, StopReason,
};
