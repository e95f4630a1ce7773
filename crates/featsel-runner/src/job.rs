//! One externally scheduled unit of work and its on-disk record.
//!
//! A job lives in `<home>/<name>/`:
//!
//! ```text
//! exec.settings          -D options handed to the JVM
//! meta.settings          jar, main class, class path, submission record, markers
//! resources.settings     mem_free, h_rt, notification address
//! command_line_args.txt  one argument per line
//! job.sh                 the submission script, present once prepared
//! log/                   scheduler output; the newest file is "the" log
//! ```
//!
//! Lifecycle: NEW -> PREPARED -> SUBMITTED_GRACE -> RUNNING <-> PAUSED, then one of
//! FINISHED, FAILED or KILLED.
//!
//! For `grace` after submission (10 s by default) the job is reported as
//! running and not failed whatever the scheduler says, because the
//! scheduler's listing can lag a fresh submission. This only papers over the
//! lag. A scheduler that takes longer than the window to list a new job makes
//! that job look done on the first poll after the window; the round then
//! aborts (no log, or no completion marker) rather than scoring it.

use chrono::{DateTime, Utc};
use featsel_core::{ensure_dir, timestamp, SettingsStore};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::exec::{java_command, render_script, ExecutionSpec};
use crate::pool::JobPool;
use crate::scheduler::JobId;

pub const DEFAULT_GRACE: Duration = Duration::from_secs(10);

const EXEC_SETTINGS: &str = "exec.settings";
const META_SETTINGS: &str = "meta.settings";
const RESOURCE_SETTINGS: &str = "resources.settings";
const ARGS_FILE: &str = "command_line_args.txt";
const SCRIPT_FILE: &str = "job.sh";
const LOG_DIR: &str = "log";

const KEY_SUBMITTED: &str = "submitted";
const KEY_JID: &str = "jid";
const KEY_FINISHED: &str = "finished";
const KEY_PAUSED: &str = "paused";
const KEY_KILLED: &str = "killed";

/// Decides from a log file whether the job failed.
pub type FailureCheck = Arc<dyn Fn(&Path) -> anyhow::Result<bool> + Send + Sync>;

/// A failure check that scans the log line by line for any of `patterns`.
pub fn log_contains_any(patterns: Vec<String>) -> FailureCheck {
    Arc::new(move |log: &Path| -> anyhow::Result<bool> {
        let data = fs::read_to_string(log)?;
        Ok(data
            .lines()
            .any(|line| patterns.iter().any(|p| line.contains(p.as_str()))))
    })
}

/// Collaborators every job needs.
#[derive(Clone)]
pub struct JobContext {
    pub pool: Arc<JobPool>,
    pub failure_check: FailureCheck,
    pub grace: Duration,
}

impl JobContext {
    pub fn new(pool: Arc<JobPool>, failure_check: FailureCheck) -> Self {
        Self {
            pool,
            failure_check,
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    New,
    Prepared,
    SubmittedGrace,
    Running,
    Paused,
    Finished,
    Failed,
    Killed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Finished | JobState::Failed | JobState::Killed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::New => "new",
            JobState::Prepared => "prepared",
            JobState::SubmittedGrace => "submitted_grace",
            JobState::Running => "running",
            JobState::Paused => "paused",
            JobState::Finished => "finished",
            JobState::Failed => "failed",
            JobState::Killed => "killed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub error_on_timeout: bool,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(48 * 60 * 60),
            poll_interval: Duration::from_secs(30),
            error_on_timeout: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The job left the live set.
    Done,
    /// Gave up with the job still live; only returned when the policy does
    /// not raise on timeout.
    TimedOut,
}

pub struct Job {
    name: String,
    home: PathBuf,
    log_dir: PathBuf,
    exec_opts: SettingsStore,
    meta: SettingsStore,
    resources: SettingsStore,
    ctx: JobContext,
    prepared: bool,
    submitted_at: Option<DateTime<Utc>>,
    id: Option<JobId>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("home", &self.home)
            .field("prepared", &self.prepared)
            .field("submitted_at", &self.submitted_at)
            .field("id", &self.id)
            .finish()
    }
}

impl Job {
    /// Creates `<home_dir>/<name>` and fresh stores. The name must be unused.
    pub fn create(home_dir: &Path, name: &str, ctx: JobContext) -> Result<Self> {
        validate_name(name)?;
        let home = home_dir.join(name);
        if home.is_file() {
            return Err(Error::Config(format!(
                "{} is a file, not a job directory",
                home.display()
            )));
        }
        if home.exists() {
            return Err(Error::Config(format!(
                "job directory {} already exists; pick a unique name or delete the old job",
                home.display()
            )));
        }
        let log_dir = home.join(LOG_DIR);
        ensure_dir(&log_dir).map_err(Error::io(&log_dir))?;
        info!(job = %name, home = %home.display(), "created job");
        Ok(Self {
            name: name.to_string(),
            exec_opts: SettingsStore::create(&home.join(EXEC_SETTINGS))?,
            meta: SettingsStore::create(&home.join(META_SETTINGS))?,
            resources: SettingsStore::create(&home.join(RESOURCE_SETTINGS))?,
            home,
            log_dir,
            ctx,
            prepared: false,
            submitted_at: None,
            id: None,
        })
    }

    /// Re-attaches to an existing job directory without repeating any side
    /// effect. The job counts as prepared when its script exists.
    pub fn open(job_dir: &Path, ctx: JobContext) -> Result<Self> {
        if !job_dir.is_dir() {
            return Err(Error::Config(format!(
                "{} is not a job directory",
                job_dir.display()
            )));
        }
        let name = job_dir
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::Config(format!("bad job directory {}", job_dir.display())))?
            .to_string();
        let home = job_dir.to_path_buf();
        let log_dir = home.join(LOG_DIR);
        if !log_dir.is_dir() {
            return Err(Error::Config(format!(
                "{} has no log directory",
                home.display()
            )));
        }
        let meta = SettingsStore::open(&home.join(META_SETTINGS))?;
        let (submitted_at, id) = submission_record(&meta)?;
        Ok(Self {
            name,
            exec_opts: SettingsStore::open(&home.join(EXEC_SETTINGS))?,
            resources: SettingsStore::open(&home.join(RESOURCE_SETTINGS))?,
            meta,
            prepared: home.join(SCRIPT_FILE).is_file(),
            home,
            log_dir,
            ctx,
            submitted_at,
            id,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn script_path(&self) -> PathBuf {
        self.home.join(SCRIPT_FILE)
    }

    pub fn id(&self) -> Option<JobId> {
        self.id
    }

    pub fn submitted_at(&self) -> Option<DateTime<Utc>> {
        self.submitted_at
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub fn meta(&self) -> &SettingsStore {
        &self.meta
    }

    pub fn resources(&self) -> &SettingsStore {
        &self.resources
    }

    pub fn exec_options(&self) -> &SettingsStore {
        &self.exec_opts
    }

    /// Records the execution spec. Invalidates any earlier `prepare`.
    pub fn configure(&mut self, spec: &ExecutionSpec) -> Result<()> {
        self.ensure_mutable("configure")?;
        let mut args = String::new();
        for a in &spec.args {
            if a.contains('\n') {
                return Err(Error::Config(format!("argument {:?} contains a newline", a)));
            }
            args.push_str(a);
            args.push('\n');
        }
        spec.store_into(&mut self.meta, &mut self.resources, &mut self.exec_opts)?;
        let path = self.home.join(ARGS_FILE);
        fs::write(&path, args).map_err(Error::io(&path))?;
        self.prepared = false;
        Ok(())
    }

    pub fn set_exec_option(&mut self, key: &str, value: &str) -> Result<()> {
        self.ensure_mutable("set_exec_option")?;
        self.exec_opts.set(key, value)?;
        self.prepared = false;
        Ok(())
    }

    pub fn command_line_args(&self) -> Result<Vec<String>> {
        let path = self.home.join(ARGS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(&path).map_err(Error::io(&path))?;
        Ok(data
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Freezes the stored options into `job.sh`.
    pub fn prepare(&mut self) -> Result<PathBuf> {
        self.ensure_mutable("prepare")?;
        let args = self.command_line_args()?;
        let command = java_command(&mut self.meta, &self.exec_opts, &args)?;
        let script = render_script(&command, &self.resources, &self.log_dir, self.meta.path())?;
        let path = self.script_path();
        fs::write(&path, script).map_err(Error::io(&path))?;
        self.prepared = true;
        Ok(path)
    }

    /// Hands the job to the scheduler. All three stores, including the
    /// submission timestamp, are flushed before the scheduler is called. If the
    /// scheduler refuses, the timestamp is withdrawn and the job can be
    /// submitted again.
    pub fn submit(&mut self) -> Result<JobId> {
        if self.submitted_at.is_some() || self.id.is_some() {
            return Err(Error::Lifecycle(format!(
                "{} was already submitted",
                self.name
            )));
        }
        if !self.prepared {
            return Err(Error::Lifecycle(format!(
                "{} must be prepared before submission",
                self.name
            )));
        }
        let now = Utc::now();
        self.meta.set(KEY_SUBMITTED, now.to_rfc3339())?;
        self.meta.flush()?;
        self.exec_opts.flush()?;
        self.resources.flush()?;
        self.submitted_at = Some(now);

        let id = match self
            .ctx
            .pool
            .scheduler()
            .submit(&self.name, &self.script_path())
        {
            Ok(id) => id,
            Err(err) => {
                warn!(job = %self.name, error = %err, "submission refused, rolling back");
                self.meta.remove(KEY_SUBMITTED);
                self.meta.flush()?;
                self.submitted_at = None;
                return Err(err);
            }
        };
        self.record(KEY_JID, id)?;
        self.id = Some(id);
        self.ctx.pool.invalidate();
        info!(job = %self.name, job_id = id, "submitted job");
        Ok(id)
    }

    /// True within `grace` of submission.
    pub fn in_grace(&self) -> Result<bool> {
        let submitted = self.submitted_at.ok_or_else(|| {
            Error::Lifecycle(format!("{} has not been submitted", self.name))
        })?;
        let elapsed = Utc::now().signed_duration_since(submitted);
        Ok(elapsed.to_std().map(|e| e < self.ctx.grace).unwrap_or(true))
    }

    pub fn is_running(&self) -> Result<bool> {
        if self.in_grace()? {
            return Ok(true);
        }
        let id = self.require_id()?;
        self.ctx.pool.is_live(id)
    }

    /// True once the job left the scheduler and wrote its completion marker.
    pub fn is_finished(&mut self) -> Result<bool> {
        if self.in_grace()? || self.is_running()? {
            return Ok(false);
        }
        self.meta.reload()?;
        Ok(self.meta.contains(KEY_FINISHED))
    }

    /// Asks the failure check about the newest log. A job with no log yet is
    /// an error, not a pass.
    pub fn failed(&self) -> Result<bool> {
        if self.in_grace()? {
            return Ok(false);
        }
        let log = self.newest_log()?;
        (self.ctx.failure_check)(&log)
            .map_err(Error::callback(format!("failure check on {}", log.display())))
    }

    pub fn state(&mut self) -> Result<JobState> {
        if self.submitted_at.is_none() {
            return Ok(if self.prepared {
                JobState::Prepared
            } else {
                JobState::New
            });
        }
        if self.in_grace()? {
            return Ok(JobState::SubmittedGrace);
        }
        if self.is_running()? {
            return Ok(if self.meta.get(KEY_PAUSED) == Some("y") {
                JobState::Paused
            } else {
                JobState::Running
            });
        }
        self.meta.reload()?;
        if self.meta.contains(KEY_FINISHED) {
            Ok(JobState::Finished)
        } else if self.meta.contains(KEY_KILLED) {
            Ok(JobState::Killed)
        } else {
            Ok(JobState::Failed)
        }
    }

    pub fn wait(&self, policy: &WaitPolicy) -> Result<WaitOutcome> {
        self.wait_or_cancel(policy, None)
    }

    /// Polls until the job leaves the live set, the timeout passes, or
    /// `cancel` is raised.
    pub fn wait_or_cancel(
        &self,
        policy: &WaitPolicy,
        cancel: Option<&AtomicBool>,
    ) -> Result<WaitOutcome> {
        let id = self.require_id()?;
        let started = Instant::now();
        loop {
            if cancel.is_some_and(|c| c.load(Ordering::SeqCst)) {
                return Err(Error::Cancelled(self.name.clone()));
            }
            let waited = started.elapsed();
            if !self.is_running()? {
                info!(job = %self.name, job_id = id, waited_secs = waited.as_secs(), "job done");
                return Ok(WaitOutcome::Done);
            }
            if waited >= policy.timeout {
                if policy.error_on_timeout {
                    return Err(Error::Timeout {
                        name: self.name.clone(),
                        id,
                        waited_secs: waited.as_secs(),
                    });
                }
                warn!(job = %self.name, job_id = id, waited_secs = waited.as_secs(), "gave up waiting");
                return Ok(WaitOutcome::TimedOut);
            }
            let nap = policy.poll_interval.min(policy.timeout - waited);
            sleep_unless_cancelled(nap, cancel);
        }
    }

    pub fn kill(&mut self) -> Result<()> {
        let id = self.require_live()?;
        self.ctx.pool.scheduler().delete(id)?;
        self.record(KEY_KILLED, timestamp())?;
        self.ctx.pool.invalidate();
        info!(job = %self.name, job_id = id, "killed job");
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        let id = self.require_live()?;
        self.ctx.pool.scheduler().suspend(id)?;
        self.record(KEY_PAUSED, "y")?;
        info!(job = %self.name, job_id = id, "paused job");
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        let id = self.require_live()?;
        self.ctx.pool.scheduler().resume(id)?;
        self.record(KEY_PAUSED, "n")?;
        info!(job = %self.name, job_id = id, "resumed job");
        Ok(())
    }

    pub fn logs(&self) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.log_dir).map_err(Error::io(&self.log_dir))?;
        let mut logs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(Error::io(&self.log_dir))?;
            if entry.path().is_file() {
                logs.push(entry.path());
            }
        }
        logs.sort();
        Ok(logs)
    }

    /// The most recently modified log; ties go to the later name.
    pub fn newest_log(&self) -> Result<PathBuf> {
        let mut newest: Option<(SystemTime, PathBuf)> = None;
        for log in self.logs()? {
            let modified = fs::metadata(&log)
                .and_then(|m| m.modified())
                .map_err(Error::io(&log))?;
            let newer = match &newest {
                Some((t, _)) => modified >= *t,
                None => true,
            };
            if newer {
                newest = Some((modified, log));
            }
        }
        newest
            .map(|(_, log)| log)
            .ok_or_else(|| Error::NoLogFile(self.log_dir.clone()))
    }

    /// Path for job-specific output, `<home>/<folder>/<file>`. Creates the folder.
    pub fn resource_file(&self, folder: &str, file: &str, overwrite: bool) -> Result<PathBuf> {
        let dir = self.home.join(folder);
        ensure_dir(&dir).map_err(Error::io(&dir))?;
        let path = dir.join(file);
        if !overwrite && path.is_file() {
            return Err(Error::Config(format!("{} already exists", path.display())));
        }
        Ok(path)
    }

    pub fn resource_dir(&self, parent: &str, child: &str, overwrite: bool) -> Result<PathBuf> {
        let dir = self.home.join(parent).join(child);
        if dir.is_dir() {
            if !overwrite {
                return Err(Error::Config(format!("{} already exists", dir.display())));
            }
        } else {
            ensure_dir(&dir).map_err(Error::io(&dir))?;
        }
        Ok(dir)
    }

    fn ensure_mutable(&self, op: &str) -> Result<()> {
        if self.submitted_at.is_some() {
            return Err(Error::Lifecycle(format!(
                "cannot {} {}: already submitted",
                op, self.name
            )));
        }
        Ok(())
    }

    fn require_id(&self) -> Result<JobId> {
        self.id
            .ok_or_else(|| Error::Lifecycle(format!("{} has no scheduler id", self.name)))
    }

    fn require_live(&self) -> Result<JobId> {
        let id = self.require_id()?;
        if !self.is_running()? {
            return Err(Error::NotLive {
                name: self.name.clone(),
                id,
            });
        }
        Ok(id)
    }

    /// Writes one metadata record after submission. The record is appended,
    /// never rewritten, so a completion marker the running job appends at the
    /// same moment is kept.
    fn record(&mut self, key: &str, value: impl ToString) -> Result<()> {
        self.meta.reload()?;
        self.meta.append(key, value)?;
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.chars().any(char::is_whitespace)
    {
        return Err(Error::Config(format!("invalid job name {:?}", name)));
    }
    Ok(())
}

fn submission_record(meta: &SettingsStore) -> Result<(Option<DateTime<Utc>>, Option<JobId>)> {
    let submitted_at = meta
        .get(KEY_SUBMITTED)
        .map(|s| {
            DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| Error::Config(format!("bad submitted timestamp {:?}: {}", s, e)))
        })
        .transpose()?;
    let id = meta
        .get(KEY_JID)
        .map(|s| {
            s.parse::<JobId>()
                .map_err(|_| Error::Config(format!("bad job id {:?}", s)))
        })
        .transpose()?;
    Ok((submitted_at, id))
}

fn sleep_unless_cancelled(total: Duration, cancel: Option<&AtomicBool>) {
    let Some(cancel) = cancel else {
        thread::sleep(total);
        return;
    };
    let slice = Duration::from_millis(100);
    let deadline = Instant::now() + total;
    loop {
        if cancel.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep(slice.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{complete_job, context, prepared_job, runnable_spec, temp_dir, FakeScheduler};

    fn fast_wait() -> WaitPolicy {
        WaitPolicy {
            timeout: Duration::from_millis(300),
            poll_interval: Duration::from_millis(10),
            error_on_timeout: true,
        }
    }

    #[test]
    fn lifecycle_walks_from_new_to_finished() {
        let home = temp_dir("job_lifecycle");
        let fake = Arc::new(FakeScheduler::default());
        fake.on_submit(|script, _| complete_job(script, true, 0.5));
        let ctx = context(&fake);

        let mut job = Job::create(&home, "trial-a", ctx).expect("create");
        assert_eq!(job.state().expect("state"), JobState::New);
        job.configure(&runnable_spec()).expect("configure");
        assert_eq!(job.state().expect("state"), JobState::New);
        let script = job.prepare().expect("prepare");
        assert!(script.is_file());
        assert_eq!(job.state().expect("state"), JobState::Prepared);

        let id = job.submit().expect("submit");
        assert_eq!(job.id(), Some(id));
        assert!(job.submitted_at().is_some());
        assert_eq!(fake.submitted()[0].0, "trial-a");

        assert_eq!(job.wait(&fast_wait()).expect("wait"), WaitOutcome::Done);
        assert!(job.is_finished().expect("finished"));
        assert!(!job.failed().expect("failed"));
        assert_eq!(job.state().expect("state"), JobState::Finished);
        assert_eq!(job.meta().get("jid"), Some(id.to_string().as_str()));
        let _ = fs::remove_dir_all(home);
    }

    #[test]
    fn second_submit_is_a_lifecycle_violation() {
        let home = temp_dir("job_double_submit");
        let fake = Arc::new(FakeScheduler::default());
        let ctx = context(&fake);
        let mut job = prepared_job(&home, "twice", &ctx);
        job.submit().expect("first submit");
        let err = job.submit().expect_err("second submit");
        assert!(err.is_lifecycle_violation(), "{}", err);
        assert_eq!(fake.submitted().len(), 1);
        let _ = fs::remove_dir_all(home);
    }

    #[test]
    fn unprepared_job_cannot_be_submitted() {
        let home = temp_dir("job_unprepared");
        let fake = Arc::new(FakeScheduler::default());
        let mut job = Job::create(&home, "raw", context(&fake)).expect("create");
        job.configure(&runnable_spec()).expect("configure");
        let err = job.submit().expect_err("not prepared");
        assert!(err.is_lifecycle_violation(), "{}", err);
        assert!(fake.submitted().is_empty());
        let _ = fs::remove_dir_all(home);
    }

    #[test]
    fn submitted_job_rejects_reconfiguration() {
        let home = temp_dir("job_frozen");
        let fake = Arc::new(FakeScheduler::default());
        let mut job = prepared_job(&home, "frozen", &context(&fake));
        job.submit().expect("submit");
        assert!(job.configure(&runnable_spec()).unwrap_err().is_lifecycle_violation());
        assert!(job.set_exec_option("k", "v").unwrap_err().is_lifecycle_violation());
        assert!(job.prepare().unwrap_err().is_lifecycle_violation());
        let _ = fs::remove_dir_all(home);
    }

    #[test]
    fn settings_are_durable_before_the_scheduler_is_called() {
        let home = temp_dir("job_durable");
        let fake = Arc::new(FakeScheduler::default());
        fake.on_submit(|script, _| {
            let meta = fs::read_to_string(script.parent().unwrap().join(META_SETTINGS)).unwrap();
            assert!(meta.contains("submitted\t"), "{}", meta);
            assert!(meta.contains("main_class\tedu.example.Evaluate"), "{}", meta);
            let res = fs::read_to_string(script.parent().unwrap().join(RESOURCE_SETTINGS)).unwrap();
            assert!(res.contains("mem_free\t3072M"), "{}", res);
        });
        let mut job = prepared_job(&home, "durable", &context(&fake));
        job.submit().expect("submit");
        let _ = fs::remove_dir_all(home);
    }

    #[test]
    fn refused_submission_can_be_retried() {
        let home = temp_dir("job_refused");
        let fake = Arc::new(FakeScheduler::default());
        fake.refuse_submits(true);
        let ctx = context(&fake);
        let mut job = prepared_job(&home, "refused", &ctx);

        let err = job.submit().expect_err("scheduler refuses");
        assert!(matches!(err, Error::Scheduler(_)), "{}", err);
        assert_eq!(job.submitted_at(), None);
        assert_eq!(job.id(), None);
        assert_eq!(job.state().expect("state"), JobState::Prepared);

        let reopened = Job::open(job.home(), ctx.clone()).expect("open");
        assert_eq!(reopened.submitted_at(), None);
        assert_eq!(reopened.id(), None);
        assert!(reopened.meta().get("submitted").is_none());

        fake.refuse_submits(false);
        let id = job.submit().expect("retry");
        assert_eq!(job.id(), Some(id));
        assert!(job.submitted_at().is_some());
        let _ = fs::remove_dir_all(home);
    }

    #[test]
    fn control_records_keep_the_completion_marker() {
        let home = temp_dir("job_marker");
        let fake = Arc::new(FakeScheduler::default());
        fake.keep_live_on_submit();
        let mut job = prepared_job(&home, "marked", &context(&fake));
        let id = job.submit().expect("submit");

        // The job writes its marker while we are about to pause it.
        let meta_path = job.home().join(META_SETTINGS);
        let mut data = fs::read_to_string(&meta_path).expect("meta");
        data.push_str("finished\t2024-01-01 00:00:00\n");
        fs::write(&meta_path, data).expect("marker");

        job.pause().expect("pause");
        let on_disk = SettingsStore::open(&meta_path).expect("open");
        assert!(on_disk.contains("finished"));
        assert_eq!(on_disk.get("paused"), Some("y"));
        assert_eq!(on_disk.get("jid"), Some(id.to_string().as_str()));
        let _ = fs::remove_dir_all(home);
    }

    #[test]
    fn grace_period_overrides_scheduler_state() {
        let home = temp_dir("job_grace");
        let fake = Arc::new(FakeScheduler::default());
        fake.on_submit(|script, _| complete_job(script, false, 0.0));
        let ctx = context(&fake).with_grace(Duration::from_secs(3600));
        let mut job = prepared_job(&home, "fresh", &ctx);
        job.submit().expect("submit");

        // Not live, failing log already written, but inside the window.
        assert!(job.in_grace().expect("grace"));
        assert!(job.is_running().expect("running"));
        assert!(!job.failed().expect("failed"));
        assert!(!job.is_finished().expect("finished"));
        assert_eq!(job.state().expect("state"), JobState::SubmittedGrace);
        let _ = fs::remove_dir_all(home);
    }

    #[test]
    fn liveness_before_submission_is_a_lifecycle_violation() {
        let home = temp_dir("job_no_id");
        let fake = Arc::new(FakeScheduler::default());
        let job = prepared_job(&home, "idle", &context(&fake));
        assert!(job.is_running().unwrap_err().is_lifecycle_violation());
        assert!(job.wait(&fast_wait()).unwrap_err().is_lifecycle_violation());
        let _ = fs::remove_dir_all(home);
    }

    #[test]
    fn failed_job_is_reported_from_its_log() {
        let home = temp_dir("job_failed");
        let fake = Arc::new(FakeScheduler::default());
        fake.on_submit(|script, _| complete_job(script, false, 0.0));
        let mut job = prepared_job(&home, "broken", &context(&fake));
        job.submit().expect("submit");
        job.wait(&fast_wait()).expect("wait");
        assert!(job.failed().expect("failed"));
        assert!(!job.is_finished().expect("finished"));
        assert_eq!(job.state().expect("state"), JobState::Failed);
        let _ = fs::remove_dir_all(home);
    }

    #[test]
    fn missing_log_is_an_error() {
        let home = temp_dir("job_nolog");
        let fake = Arc::new(FakeScheduler::default());
        let mut job = prepared_job(&home, "silent", &context(&fake));
        job.submit().expect("submit");
        assert!(matches!(job.failed(), Err(Error::NoLogFile(_))));
        let _ = fs::remove_dir_all(home);
    }

    #[test]
    fn wait_times_out_while_job_stays_live() {
        let home = temp_dir("job_timeout");
        let fake = Arc::new(FakeScheduler::default());
        fake.keep_live_on_submit();
        let mut job = prepared_job(&home, "slow", &context(&fake));
        job.submit().expect("submit");

        let err = job.wait(&fast_wait()).expect_err("timeout");
        assert!(matches!(err, Error::Timeout { .. }), "{}", err);

        let lenient = WaitPolicy {
            error_on_timeout: false,
            ..fast_wait()
        };
        assert_eq!(job.wait(&lenient).expect("wait"), WaitOutcome::TimedOut);
        let _ = fs::remove_dir_all(home);
    }

    #[test]
    fn wait_observes_cancellation() {
        let home = temp_dir("job_cancel");
        let fake = Arc::new(FakeScheduler::default());
        fake.keep_live_on_submit();
        let mut job = prepared_job(&home, "cancelled", &context(&fake));
        job.submit().expect("submit");
        let cancel = AtomicBool::new(true);
        let err = job
            .wait_or_cancel(&fast_wait(), Some(&cancel))
            .expect_err("cancelled");
        assert!(matches!(err, Error::Cancelled(_)), "{}", err);
        let _ = fs::remove_dir_all(home);
    }

    #[test]
    fn pause_resume_and_kill_require_a_live_job() {
        let home = temp_dir("job_control");
        let fake = Arc::new(FakeScheduler::default());
        fake.keep_live_on_submit();
        let mut job = prepared_job(&home, "steered", &context(&fake));
        let id = job.submit().expect("submit");

        job.pause().expect("pause");
        assert_eq!(job.state().expect("state"), JobState::Paused);
        job.resume().expect("resume");
        assert_eq!(job.state().expect("state"), JobState::Running);
        job.kill().expect("kill");
        assert_eq!(fake.suspended(), vec![id]);
        assert_eq!(fake.resumed(), vec![id]);
        assert_eq!(fake.deleted(), vec![id]);
        assert_eq!(job.state().expect("state"), JobState::Killed);

        assert!(matches!(job.kill(), Err(Error::NotLive { .. })));
        assert!(matches!(job.pause(), Err(Error::NotLive { .. })));
        let _ = fs::remove_dir_all(home);
    }

    #[test]
    fn open_reattaches_without_side_effects() {
        let home = temp_dir("job_reopen");
        let fake = Arc::new(FakeScheduler::default());
        fake.on_submit(|script, _| complete_job(script, true, 0.25));
        let ctx = context(&fake);
        let mut job = prepared_job(&home, "persisted", &ctx);
        let id = job.submit().expect("submit");
        let dir = job.home().to_path_buf();
        drop(job);

        let mut reopened = Job::open(&dir, ctx).expect("open");
        assert_eq!(reopened.name(), "persisted");
        assert!(reopened.is_prepared());
        assert_eq!(reopened.id(), Some(id));
        assert_eq!(reopened.state().expect("state"), JobState::Finished);
        assert!(reopened.submit().unwrap_err().is_lifecycle_violation());
        assert_eq!(fake.submitted().len(), 1);
        assert_eq!(
            reopened.command_line_args().expect("args"),
            vec!["--quiet".to_string()]
        );
        let _ = fs::remove_dir_all(home);
    }

    #[test]
    fn create_refuses_existing_names() {
        let home = temp_dir("job_unique");
        let fake = Arc::new(FakeScheduler::default());
        let ctx = context(&fake);
        Job::create(&home, "taken", ctx.clone()).expect("first");
        assert!(matches!(
            Job::create(&home, "taken", ctx.clone()),
            Err(Error::Config(_))
        ));
        assert!(Job::create(&home, "bad/name", ctx).is_err());
        let _ = fs::remove_dir_all(home);
    }

    #[test]
    fn newest_log_prefers_latest_write() {
        let home = temp_dir("job_logs");
        let fake = Arc::new(FakeScheduler::default());
        let job = Job::create(&home, "logs", context(&fake)).expect("create");
        assert!(matches!(job.newest_log(), Err(Error::NoLogFile(_))));
        fs::write(job.log_dir().join("b.o1"), "old").expect("old");
        thread::sleep(Duration::from_millis(20));
        fs::write(job.log_dir().join("a.o2"), "new").expect("new");
        assert_eq!(job.logs().expect("logs").len(), 2);
        assert_eq!(
            job.newest_log().expect("newest"),
            job.log_dir().join("a.o2")
        );
        let _ = fs::remove_dir_all(home);
    }

    #[test]
    fn resource_paths_live_under_the_job() {
        let home = temp_dir("job_resources");
        let fake = Arc::new(FakeScheduler::default());
        let job = Job::create(&home, "res", context(&fake)).expect("create");
        let file = job
            .resource_file("diagnostics", "parameters.txt", false)
            .expect("file");
        assert_eq!(file, job.home().join("diagnostics").join("parameters.txt"));
        fs::write(&file, "x").expect("write");
        assert!(job.resource_file("diagnostics", "parameters.txt", false).is_err());
        let dir = job.resource_dir("models", "fold0", false).expect("dir");
        assert!(dir.is_dir());
        assert!(job.resource_dir("models", "fold0", false).is_err());
        let _ = fs::remove_dir_all(home);
    }

    #[test]
    fn log_pattern_check_scans_lines() {
        let home = temp_dir("job_patterns");
        let log = home.join("run.log");
        fs::write(&log, "ok\njava.lang.OutOfMemoryError: heap\n").expect("log");
        let check = log_contains_any(vec!["OutOfMemoryError".to_string()]);
        assert!(check(&log).expect("check"));
        let check = log_contains_any(vec!["Segfault".to_string()]);
        assert!(!check(&log).expect("check"));
        let _ = fs::remove_dir_all(home);
    }
}
