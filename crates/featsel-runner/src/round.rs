//! A selection step where every candidate is one cluster job.
//!
//! All jobs of a round are submitted before any waiting starts. Each job is
//! then watched by its own scoped thread; the first job that times out, fails,
//! or vanishes without its completion marker cancels the other watchers and
//! fails the whole round. Scores are only read once every job is done.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::job::{Job, WaitOutcome, WaitPolicy};
use crate::selection::{Choice, ChooseNext};

pub const ROUND_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const ROUND_POLL_INTERVAL: Duration = Duration::from_secs(10);

pub fn round_wait_policy() -> WaitPolicy {
    WaitPolicy {
        timeout: ROUND_TIMEOUT,
        poll_interval: ROUND_POLL_INTERVAL,
        error_on_timeout: true,
    }
}

/// Reads a job's score from the first non-empty line of `<job home>/<relative>`.
pub fn score_file(relative: impl Into<PathBuf>) -> impl Fn(&Job) -> anyhow::Result<f64> + Send + Sync {
    let relative = relative.into();
    move |job: &Job| -> anyhow::Result<f64> {
        let path = job.home().join(&relative);
        let data = fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("cannot read score {}: {}", path.display(), e))?;
        let line = data
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| anyhow::anyhow!("score file {} is empty", path.display()))?;
        line.parse::<f64>()
            .map_err(|e| anyhow::anyhow!("bad score {:?} in {}: {}", line, path.display(), e))
    }
}

pub struct JobRound<B, E> {
    build: B,
    extract: E,
    wait: WaitPolicy,
}

impl<B, E> JobRound<B, E>
where
    B: FnMut(&[String]) -> anyhow::Result<Job>,
    E: Fn(&Job) -> anyhow::Result<f64>,
{
    /// `build` turns a trial feature list into an unsubmitted job; `extract`
    /// scores a finished one.
    pub fn new(build: B, extract: E) -> Self {
        Self {
            build,
            extract,
            wait: round_wait_policy(),
        }
    }

    pub fn with_wait(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }
}

impl<B, E> ChooseNext for JobRound<B, E>
where
    B: FnMut(&[String]) -> anyhow::Result<Job>,
    E: Fn(&Job) -> anyhow::Result<f64>,
{
    fn choose_next(&mut self, current: &[String], remaining: &[String]) -> Result<Choice> {
        let mut jobs = Vec::with_capacity(remaining.len());
        for feature in remaining {
            let mut trial = current.to_vec();
            trial.push(feature.clone());
            let mut job = (self.build)(&trial)
                .map_err(Error::callback(format!("building job for {}", feature)))?;
            if !job.is_prepared() {
                job.prepare()?;
            }
            job.submit()?;
            jobs.push(job);
        }

        info!(
            jobs = jobs.len(),
            timeout_secs = self.wait.timeout.as_secs(),
            "waiting for round jobs to complete"
        );
        wait_all(&mut jobs, &self.wait)?;
        info!(jobs = jobs.len(), "all round jobs finished");

        let mut best = Choice {
            feature: None,
            score: 0.0,
        };
        for (feature, job) in remaining.iter().zip(&jobs) {
            let score = (self.extract)(job)
                .map_err(Error::callback(format!("scoring job {}", job.name())))?;
            info!(feature = %feature, job = %job.name(), score, "candidate scored");
            if score > best.score {
                best = Choice {
                    feature: Some(feature.clone()),
                    score,
                };
            }
        }
        Ok(best)
    }
}

/// Waits for every job on its own thread. Returns the first failure after
/// telling the remaining watchers to stop.
fn wait_all(jobs: &mut [Job], policy: &WaitPolicy) -> Result<()> {
    let cancel = AtomicBool::new(false);
    let (tx, rx) = mpsc::channel::<(usize, Result<()>)>();
    thread::scope(|scope| {
        for (idx, job) in jobs.iter_mut().enumerate() {
            let tx = tx.clone();
            let cancel = &cancel;
            scope.spawn(move || {
                let outcome = settle(job, policy, cancel);
                let _ = tx.send((idx, outcome));
            });
        }
        drop(tx);

        let mut first_err = None;
        for (idx, outcome) in rx {
            if let Err(err) = outcome {
                if first_err.is_none() {
                    warn!(job_index = idx, error = %err, "round job failed, cancelling siblings");
                    cancel.store(true, Ordering::SeqCst);
                    first_err = Some(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    })
}

fn settle(job: &mut Job, policy: &WaitPolicy, cancel: &AtomicBool) -> Result<()> {
    let id = job.id().unwrap_or_default();
    if job.wait_or_cancel(policy, Some(cancel))? == WaitOutcome::TimedOut {
        return Err(Error::Timeout {
            name: job.name().to_string(),
            id,
            waited_secs: policy.timeout.as_secs(),
        });
    }
    if job.failed()? {
        return Err(Error::JobFailed {
            name: job.name().to_string(),
            id,
            log: job
                .newest_log()
                .unwrap_or_else(|_| job.log_dir().to_path_buf()),
        });
    }
    if !job.is_finished()? {
        return Err(Error::Unfinished {
            name: job.name().to_string(),
            id,
        });
    }
    Ok(())
}
