//! The cluster scheduler as seen from this crate: five requests and nothing
//! else. [`GridEngine`] talks to an SGE-style CLI; tests use an in-memory fake.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

pub type JobId = u64;

pub trait Scheduler: Send + Sync {
    /// Queues `script` under `name` and returns the id the scheduler assigned.
    fn submit(&self, name: &str, script: &Path) -> Result<JobId>;

    /// Ids of every job the scheduler currently considers live (queued,
    /// running, or suspended).
    fn live_ids(&self) -> Result<BTreeSet<JobId>>;

    fn delete(&self, id: JobId) -> Result<()>;

    fn suspend(&self, id: JobId) -> Result<()>;

    fn resume(&self, id: JobId) -> Result<()>;
}

/// Command lines for each scheduler request. Each entry is a program followed
/// by its leading arguments; the job name, script or id is appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerCommands {
    pub submit: Vec<String>,
    pub list: Vec<String>,
    pub delete: Vec<String>,
    pub suspend: Vec<String>,
    pub resume: Vec<String>,
    /// Lines of listing output to skip before the first job row.
    pub list_header_lines: usize,
}

impl Default for SchedulerCommands {
    fn default() -> Self {
        Self {
            submit: vec!["qsub".to_string()],
            list: vec!["qstat".to_string()],
            delete: vec!["qdel".to_string()],
            suspend: vec!["qmod".to_string(), "-sj".to_string()],
            resume: vec!["qmod".to_string(), "-usj".to_string()],
            list_header_lines: 2,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GridEngine {
    commands: SchedulerCommands,
}

impl GridEngine {
    pub fn new(commands: SchedulerCommands) -> Self {
        Self { commands }
    }

    fn run(&self, base: &[String], extra: &[String]) -> Result<String> {
        let (program, leading) = base
            .split_first()
            .ok_or_else(|| Error::Config("scheduler command is empty".to_string()))?;
        let mut cmd = Command::new(program);
        cmd.args(leading).args(extra);
        debug!(program = %program, args = ?extra, "scheduler request");
        let output = cmd
            .output()
            .map_err(|e| Error::Scheduler(format!("cannot run {}: {}", program, e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Scheduler(format!(
                "{} exited with {}: {}",
                [base, extra].concat().join(" "),
                output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Scheduler for GridEngine {
    fn submit(&self, name: &str, script: &Path) -> Result<JobId> {
        let reply = self.run(
            &self.commands.submit,
            &[
                "-N".to_string(),
                name.to_string(),
                script.to_string_lossy().to_string(),
            ],
        )?;
        parse_submit_reply(&reply)
    }

    fn live_ids(&self) -> Result<BTreeSet<JobId>> {
        let listing = self.run(&self.commands.list, &[])?;
        parse_listing(&listing, self.commands.list_header_lines)
    }

    fn delete(&self, id: JobId) -> Result<()> {
        self.run(&self.commands.delete, &[id.to_string()]).map(|_| ())
    }

    fn suspend(&self, id: JobId) -> Result<()> {
        self.run(&self.commands.suspend, &[id.to_string()]).map(|_| ())
    }

    fn resume(&self, id: JobId) -> Result<()> {
        self.run(&self.commands.resume, &[id.to_string()]).map(|_| ())
    }
}

/// `Your job 4711 ("name") has been submitted` -> 4711
fn parse_submit_reply(reply: &str) -> Result<JobId> {
    reply
        .split_whitespace()
        .nth(2)
        .and_then(|tok| tok.parse().ok())
        .ok_or_else(|| Error::Scheduler(format!("unparsable submit reply: {}", reply.trim())))
}

fn parse_listing(listing: &str, header_lines: usize) -> Result<BTreeSet<JobId>> {
    let mut ids = BTreeSet::new();
    if listing.trim().is_empty() {
        return Ok(ids);
    }
    for line in listing.lines().skip(header_lines) {
        let Some(first) = line.split_whitespace().next() else {
            continue;
        };
        let id = first
            .parse()
            .map_err(|_| Error::Scheduler(format!("unparsable listing row: {}", line.trim())))?;
        ids.insert(id);
    }
    Ok(ids)
}
