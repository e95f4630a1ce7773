//! Run configuration for a job-backed selection, read from YAML or JSON.

use featsel_core::sha256_bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::{Error, Result};
use crate::exec::ExecutionSpec;
use crate::job::{log_contains_any, Job, JobContext, WaitPolicy, DEFAULT_GRACE};
use crate::pool::{JobPool, DEFAULT_LISTING_MAX_AGE};
use crate::round::{score_file, JobRound, ROUND_POLL_INTERVAL, ROUND_TIMEOUT};
use crate::scheduler::{GridEngine, Scheduler, SchedulerCommands};
use crate::selection::{
    ForwardSelection, Selection, SelectionAborted, SelectionParams, DEFAULT_MIN_IMPROVEMENT,
};

/// Replaced in `job.args` by the comma-separated trial features.
pub const FEATURES_PLACEHOLDER: &str = "{features}";
/// Java system property carrying the trial features.
pub const FEATURES_OPTION: &str = "features";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Parent of every trial job directory. Relative paths are resolved
    /// against the config file's directory.
    pub home_dir: PathBuf,
    pub name_prefix: String,
    pub features: Vec<String>,
    pub initial_features: Vec<String>,
    pub min_improvement: f64,
    pub max_rounds: Option<usize>,
    pub wait_timeout_secs: u64,
    pub poll_secs: u64,
    pub grace_secs: u64,
    pub listing_max_age_ms: u64,
    pub job: ExecutionSpec,
    /// A log line containing any of these marks the job as failed.
    pub failure_patterns: Vec<String>,
    /// Relative to each job's directory.
    pub score_file: PathBuf,
    pub scheduler: SchedulerCommands,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            home_dir: PathBuf::from("featsel-jobs"),
            name_prefix: "fs".to_string(),
            features: Vec::new(),
            initial_features: Vec::new(),
            min_improvement: DEFAULT_MIN_IMPROVEMENT,
            max_rounds: None,
            wait_timeout_secs: ROUND_TIMEOUT.as_secs(),
            poll_secs: ROUND_POLL_INTERVAL.as_secs(),
            grace_secs: DEFAULT_GRACE.as_secs(),
            listing_max_age_ms: DEFAULT_LISTING_MAX_AGE.as_millis() as u64,
            job: ExecutionSpec::default(),
            failure_patterns: vec![
                "Exception in thread".to_string(),
                "OutOfMemoryError".to_string(),
            ],
            score_file: PathBuf::from("score.txt"),
            scheduler: SchedulerCommands::default(),
        }
    }
}

impl RunConfig {
    /// Reads and validates a config file. YAML is a superset of JSON, so one
    /// parser covers both.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(Error::io(path))?;
        let yaml: serde_yaml::Value = serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let value: Value = serde_json::to_value(yaml)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let mut config: RunConfig = serde_json::from_value(value)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        if config.home_dir.is_relative() {
            let base = path.parent().unwrap_or(Path::new("."));
            config.home_dir = base.join(&config.home_dir);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.features.is_empty() {
            return Err(Error::Config("features must not be empty".to_string()));
        }
        let mut seen = BTreeSet::new();
        for f in &self.features {
            if f.is_empty() || f.contains([',', '\t', '\n']) {
                return Err(Error::Config(format!(
                    "feature {:?} must be non-empty and free of commas, tabs and newlines",
                    f
                )));
            }
            if !seen.insert(f.as_str()) {
                return Err(Error::Config(format!("duplicate feature {}", f)));
            }
        }
        for f in &self.initial_features {
            if !seen.contains(f.as_str()) {
                return Err(Error::Config(format!(
                    "initial feature {} is not in features",
                    f
                )));
            }
        }
        if !self.min_improvement.is_finite() || self.min_improvement < 0.0 {
            return Err(Error::Config(format!(
                "min_improvement must be a non-negative number, got {}",
                self.min_improvement
            )));
        }
        if self.wait_timeout_secs == 0 || self.poll_secs == 0 {
            return Err(Error::Config(
                "wait_timeout_secs and poll_secs must be positive".to_string(),
            ));
        }
        if self.name_prefix.is_empty()
            || !self
                .name_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::Config(format!(
                "name_prefix {:?} may only contain letters, digits, '-' and '_'",
                self.name_prefix
            )));
        }
        if self.job.main_class.trim().is_empty() {
            return Err(Error::Config("job.main_class is required".to_string()));
        }
        if self.score_file.as_os_str().is_empty() || self.score_file.is_absolute() {
            return Err(Error::Config(
                "score_file must be a path relative to the job directory".to_string(),
            ));
        }
        Ok(())
    }

    pub fn selection_params(&self) -> SelectionParams {
        SelectionParams {
            initial: self.initial_features.clone(),
            min_improvement: self.min_improvement,
            max_rounds: self.max_rounds,
        }
    }

    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            timeout: Duration::from_secs(self.wait_timeout_secs),
            poll_interval: Duration::from_secs(self.poll_secs),
            error_on_timeout: true,
        }
    }

    pub fn grid_engine(&self) -> Arc<dyn Scheduler> {
        Arc::new(GridEngine::new(self.scheduler.clone()))
    }

    pub fn job_context(&self, scheduler: Arc<dyn Scheduler>) -> JobContext {
        let pool = JobPool::with_max_age(
            scheduler,
            Duration::from_millis(self.listing_max_age_ms),
        );
        JobContext::new(
            Arc::new(pool),
            log_contains_any(self.failure_patterns.clone()),
        )
        .with_grace(Duration::from_secs(self.grace_secs))
    }

    /// Builds an unsubmitted job for a trial feature list: the template with
    /// the placeholder filled in and the features passed as a system property.
    pub fn job_builder(
        &self,
        ctx: JobContext,
    ) -> impl FnMut(&[String]) -> anyhow::Result<Job> {
        let home_dir = self.home_dir.clone();
        let prefix = self.name_prefix.clone();
        let template = self.job.clone();
        move |trial: &[String]| -> anyhow::Result<Job> {
            let joined = trial.join(",");
            let mut spec = template.clone();
            for arg in &mut spec.args {
                *arg = arg.replace(FEATURES_PLACEHOLDER, &joined);
            }
            spec.java_options
                .insert(FEATURES_OPTION.to_string(), joined);
            let mut job = Job::create(&home_dir, &job_name(&prefix, trial), ctx.clone())?;
            job.configure(&spec)?;
            Ok(job)
        }
    }
}

/// `<prefix>-<trial size>-<first 12 hex of sha256(features)>`.
pub fn job_name(prefix: &str, features: &[String]) -> String {
    let digest = sha256_bytes(features.join(",").as_bytes());
    format!("{}-{:02}-{}", prefix, features.len(), &digest[..12])
}

/// Runs a full job-backed forward selection as described by `config`.
pub fn run_selection(
    config: &RunConfig,
    scheduler: Arc<dyn Scheduler>,
) -> std::result::Result<Selection, SelectionAborted> {
    info!(
        home = %config.home_dir.display(),
        features = config.features.len(),
        initial = ?config.initial_features,
        "starting selection run"
    );
    let ctx = config.job_context(scheduler);
    let round = JobRound::new(config.job_builder(ctx), score_file(config.score_file.clone()))
        .with_wait(config.wait_policy());
    ForwardSelection::new(round, config.selection_params()).run(&config.features)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::StopReason;
    use crate::testing::{complete_job, temp_dir, FakeScheduler};
    use featsel_core::SettingsStore;

    const YAML: &str = r#"
home_dir: jobs
name_prefix: sel
features: [age, income, region]
initial_features: [age]
min_improvement: 0.05
job:
  main_class: edu.example.Evaluate
  class_path: [/opt/eval.jar]
  args: ["--features={features}", "--folds", "10"]
  xmx: 4G
"#;

    fn write_config(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).expect("write config");
        path
    }

    #[test]
    fn loads_yaml_with_defaults() {
        let dir = temp_dir("config_yaml");
        let config = RunConfig::load(&write_config(&dir, "run.yaml", YAML)).expect("load");
        assert_eq!(config.home_dir, dir.join("jobs"));
        assert_eq!(config.features, vec!["age", "income", "region"]);
        assert_eq!(config.min_improvement, 0.05);
        assert_eq!(config.job.xmx, "4G");
        assert_eq!(config.job.mem_free, "3G");
        assert_eq!(config.wait_timeout_secs, 600);
        assert_eq!(config.grace_secs, 10);
        assert_eq!(config.score_file, PathBuf::from("score.txt"));
        assert_eq!(config.scheduler, SchedulerCommands::default());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn loads_json_too() {
        let dir = temp_dir("config_json");
        let body = r#"{"features": ["a", "b"], "home_dir": "/tmp/fs", "job": {"main_class": "Main"}}"#;
        let config = RunConfig::load(&write_config(&dir, "run.json", body)).expect("load");
        assert_eq!(config.home_dir, PathBuf::from("/tmp/fs"));
        assert_eq!(config.min_improvement, DEFAULT_MIN_IMPROVEMENT);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn rejects_bad_configs() {
        let dir = temp_dir("config_bad");
        let cases = [
            ("features: []\njob: {main_class: M}\n", "features must not be empty"),
            ("features: [a, a]\njob: {main_class: M}\n", "duplicate feature a"),
            ("features: [a]\ninitial_features: [b]\njob: {main_class: M}\n", "not in features"),
            ("features: [\"a,b\"]\njob: {main_class: M}\n", "free of commas"),
            ("features: [a]\n", "main_class is required"),
            ("features: [a]\njob: {main_class: M}\nname_prefix: \"x y\"\n", "name_prefix"),
            ("features: [a]\njob: {main_class: M}\nbogus: 1\n", "unknown field"),
        ];
        for (idx, (body, needle)) in cases.iter().enumerate() {
            let path = write_config(&dir, &format!("bad{}.yaml", idx), body);
            let err = RunConfig::load(&path).expect_err(needle);
            assert!(err.to_string().contains(*needle), "{} -> {}", body, err);
        }
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn job_names_are_stable_and_distinct() {
        let ab = vec!["a".to_string(), "b".to_string()];
        let ba = vec!["b".to_string(), "a".to_string()];
        let name = job_name("sel", &ab);
        assert_eq!(name, job_name("sel", &ab));
        assert_ne!(name, job_name("sel", &ba));
        assert!(name.starts_with("sel-02-"));
        assert_eq!(name.len(), "sel-02-".len() + 12);
    }

    #[test]
    fn builder_fills_in_trial_features() {
        let dir = temp_dir("config_builder");
        let config = RunConfig::load(&write_config(&dir, "run.yaml", YAML)).expect("load");
        let fake = Arc::new(FakeScheduler::default());
        let mut build = config.job_builder(config.job_context(fake));

        let trial = vec!["age".to_string(), "region".to_string()];
        let job = build(&trial).expect("build");
        assert_eq!(job.name(), job_name("sel", &trial));
        assert_eq!(
            job.command_line_args().expect("args"),
            vec!["--features=age,region", "--folds", "10"]
        );
        assert_eq!(job.exec_options().get(FEATURES_OPTION), Some("age,region"));
        assert!(!job.is_prepared());
        assert!(build(&trial).is_err(), "same trial twice reuses a directory");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn run_selection_drives_jobs_end_to_end() {
        let dir = temp_dir("config_run");
        let config = RunConfig {
            home_dir: dir.join("jobs"),
            features: vec!["a".into(), "b".into(), "c".into()],
            poll_secs: 1,
            grace_secs: 0,
            listing_max_age_ms: 0,
            job: ExecutionSpec {
                main_class: "Main".to_string(),
                ..ExecutionSpec::default()
            },
            ..RunConfig::default()
        };
        config.validate().expect("valid");

        // Only "b" helps; round two's best adds nothing over it.
        let fake = Arc::new(FakeScheduler::default());
        fake.on_submit(|script, _| {
            let exec =
                SettingsStore::open(&script.parent().unwrap().join("exec.settings")).unwrap();
            let feats = exec.get(FEATURES_OPTION).unwrap_or("").to_string();
            let score = if feats.split(',').any(|f| f == "b") { 0.4 } else { 0.0 };
            complete_job(script, true, score);
        });

        let selection = run_selection(&config, fake.clone()).expect("selection");
        assert_eq!(selection.accepted, vec!["b"]);
        assert_eq!(selection.stop, StopReason::BelowThreshold);
        assert_eq!(fake.submitted().len(), 5);
        let _ = fs::remove_dir_all(dir);
    }
}
