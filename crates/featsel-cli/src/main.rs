use anyhow::Result;
use clap::{Parser, Subcommand};
use featsel_runner::{
    run_selection, GridEngine, Job, JobContext, RunConfig, Selection, SelectionAborted,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;

#[derive(Parser)]
#[command(name = "featsel", version = "0.3.0", about = "Forward feature selection on a Grid Engine cluster")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full selection, one cluster job per candidate per round.
    Select {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Status {
        #[arg(long)]
        job_dir: PathBuf,
        /// Scheduler commands and failure patterns come from this run config.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Kill {
        #[arg(long)]
        job_dir: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Pause {
        #[arg(long)]
        job_dir: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Resume {
        #[arg(long)]
        job_dir: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Delete every job the scheduler lists as live.
    KillAll {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let details = match err.downcast_ref::<SelectionAborted>() {
                    Some(aborted) => aborted_to_json(aborted),
                    None => json!({}),
                };
                emit_json(&json_error("command_failed", format!("{:#}", err), details));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

/// Logs go to stderr so `--json` output on stdout stays machine readable.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Select { config, json } => {
            let run = RunConfig::load(&config)?;
            info!(config = %config.display(), "loaded run config");
            let selection = match run_selection(&run, run.grid_engine()) {
                Ok(selection) => selection,
                Err(aborted) => {
                    error!(round = aborted.round, error = %aborted.source, "selection aborted");
                    if !json {
                        print_partial(&aborted);
                    }
                    return Err(aborted.into());
                }
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "select",
                    "home_dir": run.home_dir.display().to_string(),
                    "selection": selection_to_json(&selection),
                })));
            }
            print_selection(&selection);
        }
        Commands::Status {
            job_dir,
            config,
            json,
        } => {
            let mut job = open_job(&job_dir, config.as_deref())?;
            let state = job.state()?;
            let newest_log = job.newest_log().ok();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "job": job.name(),
                    "state": state,
                    "job_id": job.id(),
                    "submitted_at": job.submitted_at().map(|t| t.to_rfc3339()),
                    "newest_log": newest_log.map(|p| p.display().to_string()),
                })));
            }
            println!("job: {}", job.name());
            println!("state: {}", state);
            if let Some(id) = job.id() {
                println!("job_id: {}", id);
            }
            if let Some(at) = job.submitted_at() {
                println!("submitted_at: {}", at.to_rfc3339());
            }
            if let Some(log) = newest_log {
                println!("newest_log: {}", log.display());
            }
        }
        Commands::Kill {
            job_dir,
            config,
            json,
        } => {
            let mut job = open_job(&job_dir, config.as_deref())?;
            job.kill()?;
            return Ok(control_result("kill", &job, json));
        }
        Commands::Pause {
            job_dir,
            config,
            json,
        } => {
            let mut job = open_job(&job_dir, config.as_deref())?;
            job.pause()?;
            return Ok(control_result("pause", &job, json));
        }
        Commands::Resume {
            job_dir,
            config,
            json,
        } => {
            let mut job = open_job(&job_dir, config.as_deref())?;
            job.resume()?;
            return Ok(control_result("resume", &job, json));
        }
        Commands::KillAll { config, json } => {
            let ctx = job_context(config.as_deref())?;
            let requested = ctx.pool.kill_all()?;
            info!(requested, "requested deletion of all live jobs");
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "kill-all",
                    "deletions_requested": requested,
                })));
            }
            println!("deletions requested: {}", requested);
        }
    }
    Ok(None)
}

fn job_context(config: Option<&Path>) -> Result<JobContext> {
    match config {
        Some(path) => {
            let run = RunConfig::load(path)?;
            Ok(run.job_context(run.grid_engine()))
        }
        None => Ok(RunConfig::default().job_context(Arc::new(GridEngine::default()))),
    }
}

fn open_job(job_dir: &Path, config: Option<&Path>) -> Result<Job> {
    let job = Job::open(job_dir, job_context(config)?)?;
    info!(job = %job.name(), job_id = ?job.id(), "opened job");
    Ok(job)
}

fn control_result(command: &str, job: &Job, json: bool) -> Option<Value> {
    if json {
        return Some(json!({
            "ok": true,
            "command": command,
            "job": job.name(),
            "job_id": job.id(),
        }));
    }
    println!("{}: {}", command, job.name());
    None
}

fn print_selection(selection: &Selection) {
    for report in &selection.rounds {
        println!(
            "round {}: {} score={:.4} gain={:.4} {}",
            report.round,
            report.feature.as_deref().unwrap_or("-"),
            report.score,
            report.improvement,
            if report.accepted { "accepted" } else { "rejected" }
        );
    }
    println!("selected: {}", selection.accepted.join(","));
    println!("stop: {:?}", selection.stop);
}

fn print_partial(aborted: &SelectionAborted) {
    eprintln!("selection aborted in round {}", aborted.round);
    eprintln!("selected before abort: {}", aborted.accepted.join(","));
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Select { json, .. }
        | Commands::Status { json, .. }
        | Commands::Kill { json, .. }
        | Commands::Pause { json, .. }
        | Commands::Resume { json, .. }
        | Commands::KillAll { json, .. } => *json,
    }
}

fn selection_to_json(selection: &Selection) -> Value {
    serde_json::to_value(selection).unwrap_or_else(|_| json!({}))
}

fn aborted_to_json(aborted: &SelectionAborted) -> Value {
    json!({
        "round": aborted.round,
        "accepted": aborted.accepted,
        "improvements": aborted.improvements,
        "rounds": aborted.rounds,
    })
}
