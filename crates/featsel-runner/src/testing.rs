//! In-memory scheduler and job helpers shared by the unit tests.

use chrono::Utc;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::exec::ExecutionSpec;
use crate::job::{FailureCheck, Job, JobContext};
use crate::pool::JobPool;
use crate::scheduler::{JobId, Scheduler};

type SubmitHook = Box<dyn Fn(&Path, JobId) + Send + Sync>;

#[derive(Default)]
struct FakeState {
    next_id: JobId,
    live: BTreeSet<JobId>,
    submitted: Vec<(String, PathBuf)>,
    deleted: Vec<JobId>,
    suspended: Vec<JobId>,
    resumed: Vec<JobId>,
    failing_deletes: BTreeSet<JobId>,
    list_calls: usize,
    keep_live_on_submit: bool,
    refuse_submits: bool,
}

/// Records every request. Submitted jobs are not live unless
/// `keep_live_on_submit` is set; the optional hook runs on each submission
/// with the script path so tests can play the part of the running job.
#[derive(Default)]
pub(crate) struct FakeScheduler {
    state: Mutex<FakeState>,
    on_submit: Mutex<Option<SubmitHook>>,
}

impl FakeScheduler {
    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake scheduler lock")
    }

    pub(crate) fn set_live(&self, ids: &[JobId]) {
        self.state().live = ids.iter().copied().collect();
    }

    pub(crate) fn keep_live_on_submit(&self) {
        self.state().keep_live_on_submit = true;
    }

    pub(crate) fn refuse_submits(&self, refuse: bool) {
        self.state().refuse_submits = refuse;
    }

    pub(crate) fn fail_deletes_of(&self, id: JobId) {
        self.state().failing_deletes.insert(id);
    }

    pub(crate) fn on_submit(&self, hook: impl Fn(&Path, JobId) + Send + Sync + 'static) {
        *self.on_submit.lock().expect("hook lock") = Some(Box::new(hook));
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.state().list_calls
    }

    pub(crate) fn submitted(&self) -> Vec<(String, PathBuf)> {
        self.state().submitted.clone()
    }

    pub(crate) fn deleted(&self) -> Vec<JobId> {
        self.state().deleted.clone()
    }

    pub(crate) fn suspended(&self) -> Vec<JobId> {
        self.state().suspended.clone()
    }

    pub(crate) fn resumed(&self) -> Vec<JobId> {
        self.state().resumed.clone()
    }
}

impl Scheduler for FakeScheduler {
    fn submit(&self, name: &str, script: &Path) -> Result<JobId> {
        let id = {
            let mut state = self.state();
            if state.refuse_submits {
                return Err(Error::Scheduler(format!("qsub {} refused", name)));
            }
            state.next_id += 1;
            let id = 1000 + state.next_id;
            state.submitted.push((name.to_string(), script.to_path_buf()));
            if state.keep_live_on_submit {
                state.live.insert(id);
            }
            id
        };
        if let Some(hook) = self.on_submit.lock().expect("hook lock").as_ref() {
            hook(script, id);
        }
        Ok(id)
    }

    fn live_ids(&self) -> Result<BTreeSet<JobId>> {
        let mut state = self.state();
        state.list_calls += 1;
        Ok(state.live.clone())
    }

    fn delete(&self, id: JobId) -> Result<()> {
        let mut state = self.state();
        if state.failing_deletes.contains(&id) {
            return Err(Error::Scheduler(format!("qdel {} refused", id)));
        }
        state.live.remove(&id);
        state.deleted.push(id);
        Ok(())
    }

    fn suspend(&self, id: JobId) -> Result<()> {
        self.state().suspended.push(id);
        Ok(())
    }

    fn resume(&self, id: JobId) -> Result<()> {
        self.state().resumed.push(id);
        Ok(())
    }
}

static TEMP_SEQ: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "featsel_{}_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros(),
        TEMP_SEQ.fetch_add(1, Ordering::SeqCst)
    ));
    fs::create_dir_all(&dir).expect("temp dir");
    dir
}

/// A log is failed when it contains the word FAILED.
pub(crate) fn failed_marker_check() -> FailureCheck {
    Arc::new(|log: &Path| -> anyhow::Result<bool> {
        Ok(fs::read_to_string(log)?.contains("FAILED"))
    })
}

/// Context with no grace window and no listing cache, so tests observe the
/// fake scheduler immediately.
pub(crate) fn context(fake: &Arc<FakeScheduler>) -> JobContext {
    let scheduler: Arc<dyn Scheduler> = fake.clone();
    JobContext::new(
        Arc::new(JobPool::with_max_age(scheduler, Duration::ZERO)),
        failed_marker_check(),
    )
    .with_grace(Duration::ZERO)
}

pub(crate) fn runnable_spec() -> ExecutionSpec {
    ExecutionSpec {
        main_class: "edu.example.Evaluate".to_string(),
        class_path: vec!["/opt/eval.jar".to_string()],
        args: vec!["--quiet".to_string()],
        ..ExecutionSpec::default()
    }
}

pub(crate) fn prepared_job(home: &Path, name: &str, ctx: &JobContext) -> Job {
    let mut job = Job::create(home, name, ctx.clone()).expect("create job");
    job.configure(&runnable_spec()).expect("configure");
    job.prepare().expect("prepare");
    job
}

/// Plays the running job: writes a log and, on success, the completion marker
/// and a score file next to the script.
pub(crate) fn complete_job(script: &Path, ok: bool, score: f64) {
    let home = script.parent().expect("job home");
    let log = home.join("log").join(format!("job.o{}", Utc::now().timestamp_micros()));
    if ok {
        fs::write(&log, "training...\ndone\n").expect("log");
        let meta = home.join("meta.settings");
        let mut data = fs::read_to_string(&meta).expect("meta");
        data.push_str("finished\t2024-01-01 00:00:00\n");
        fs::write(&meta, data).expect("marker");
        fs::write(home.join("score.txt"), format!("{}\n", score)).expect("score");
    } else {
        fs::write(&log, "Exception in thread main\nFAILED\n").expect("log");
    }
}
