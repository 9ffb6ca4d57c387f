use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tiller_core::{
    has_errors, load_config_or_default, save_config, BacklogStore, BranchTier, JsonFileBacklog,
    TaskId, TillerConfig, Validate, ValidationLevel,
};
use tillerd::{
    build_graph, critical_chain, format_path, hour_to_time, logging, schedule_for_prd,
    AgentView, Conductor, ConductorError, ReapOptions, SpawnOptions, SpawnOutcome,
};

const FOREGROUND_POLL: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(
    name = "tiller",
    version,
    about = "Dependency-aware scheduling and isolated agent execution for a git backlog"
)]
struct Cli {
    /// Repository to operate on.
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,
    /// Backlog JSON file, relative to the repository.
    #[arg(long, global = true, default_value = "backlog.json")]
    backlog: PathBuf,
    /// Configuration file, relative to the repository.
    #[arg(long, global = true, default_value = "tiller.toml")]
    config: PathBuf,
    /// Debug-level diagnostics on stderr.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Spawn an agent for a task and supervise it until it exits.
    Spawn {
        task: String,
        /// Run in the repository root instead of an isolated worktree.
        #[arg(long)]
        no_worktree: bool,
        /// Reattach a worktree left behind by an earlier attempt.
        #[arg(long)]
        resume: bool,
        /// Wall-clock limit in seconds.
        #[arg(long)]
        timeout: Option<u64>,
        /// Wait for capacity instead of failing when max_parallel is reached.
        #[arg(long)]
        queue: bool,
    },
    /// Show one agent.
    Status {
        task: String,
        #[arg(long)]
        json: bool,
    },
    /// Show every agent record.
    List {
        #[arg(long)]
        json: bool,
    },
    Kill {
        task: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Merge a completed agent's work up the branch cascade.
    Reap {
        task: String,
        /// Wait for the agent to finish first.
        #[arg(long)]
        wait: bool,
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Discard an agent's worktree and branch.
    Reject {
        task: String,
        #[arg(long, default_value = "rejected by operator")]
        reason: String,
    },
    /// Discard all agent state and return the task to not-started.
    Reset { task: String },
    /// Report orphaned worktrees, ghost agents and stale metadata.
    Prune {
        /// Reconcile what was found.
        #[arg(long)]
        apply: bool,
    },
    /// Print the tail of an agent's output log.
    Log {
        task: String,
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },
    /// Print the lifecycle events recorded for a task.
    Events { task: String },
    /// Tasks whose blockers are all resolved.
    Ready,
    /// Open tasks ranked by how much work they unblock.
    Impact,
    /// Longest blocking chain weighted by effort.
    CriticalPath,
    /// Dependency cycles in the backlog.
    Cycles,
    /// Schedule and Gantt metrics for one PRD.
    Gantt {
        #[arg(long)]
        prd: String,
        #[arg(long)]
        json: bool,
    },
    /// Merge an epic or PRD branch into its parent tier.
    Merge { tier: BranchTier, id: String },
    /// Spawn ready tasks up to capacity and reap them until none remain.
    Run {
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(long)]
        no_worktree: bool,
    },
    /// Print the effective configuration.
    Config {
        /// Write the effective configuration to the config path.
        #[arg(long)]
        write: bool,
    },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        if let Some(suggestion) = err
            .downcast_ref::<ConductorError>()
            .and_then(ConductorError::suggestion)
        {
            eprintln!("hint: {suggestion}");
        }
        if let Some(ConductorError::Process { output_tail, .. }) =
            err.downcast_ref::<ConductorError>()
        {
            for line in output_tail {
                eprintln!("  | {line}");
            }
        }
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config_path = cli.repo.join(&cli.config);
    let config = load_config_or_default(&config_path)
        .with_context(|| format!("load {}", config_path.display()))?;
    check_config(&config)?;
    let backlog = JsonFileBacklog::new(cli.repo.join(&cli.backlog));

    match cli.command {
        Command::Config { write } => cmd_config(&config_path, &config, write),
        Command::Ready => cmd_ready(&backlog),
        Command::Impact => cmd_impact(&backlog),
        Command::CriticalPath => cmd_critical_path(&backlog, &config),
        Command::Cycles => cmd_cycles(&backlog),
        Command::Gantt { prd, json } => cmd_gantt(&backlog, &config, &prd, json),
        command => {
            let conductor = Conductor::open(&cli.repo, config, Arc::new(backlog))?;
            run_lifecycle(&conductor, command)
        }
    }
}

fn check_config(config: &TillerConfig) -> Result<()> {
    let issues = config.validate();
    for issue in &issues {
        if issue.level == ValidationLevel::Warning {
            tracing::warn!(code = issue.code, "{}", issue.message);
        }
    }
    if has_errors(&issues) {
        let messages: Vec<String> = issues
            .iter()
            .filter(|issue| issue.level == ValidationLevel::Error)
            .map(|issue| format!("{}: {}", issue.code, issue.message))
            .collect();
        bail!("invalid configuration: {}", messages.join("; "));
    }
    Ok(())
}

fn run_lifecycle(conductor: &Conductor, command: Command) -> Result<()> {
    match command {
        Command::Spawn {
            task,
            no_worktree,
            resume,
            timeout,
            queue,
        } => {
            let options = SpawnOptions {
                timeout_secs: timeout,
                resume,
                worktree: !no_worktree,
                queue: queue.then_some(true),
            };
            cmd_spawn(conductor, &TaskId::new(task), &options)
        }
        Command::Status { task, json } => {
            let view = conductor.status(&TaskId::new(task))?;
            if json {
                print_json(&view)
            } else {
                print_view(&view);
                Ok(())
            }
        }
        Command::List { json } => {
            let views = conductor.list_agents()?;
            if json {
                return print_json(&views);
            }
            if views.is_empty() {
                println!("no agents");
            }
            for view in &views {
                print_view(view);
            }
            Ok(())
        }
        Command::Kill { task, reason } => {
            let record = conductor.kill(&TaskId::new(task), reason.as_deref())?;
            println!("{} {}", record.task_id, record.status);
            Ok(())
        }
        Command::Reap {
            task,
            wait,
            timeout,
        } => {
            let outcome = conductor.reap(
                &TaskId::new(task),
                &ReapOptions {
                    wait,
                    timeout_secs: timeout,
                },
            )?;
            if outcome.already_reaped {
                println!("{} was already reaped", outcome.task_id);
                return Ok(());
            }
            for merge in &outcome.merges {
                println!(
                    "merged {} into {} ({}) at {}",
                    merge.source,
                    merge.target,
                    merge.strategy.as_str(),
                    short_sha(&merge.head)
                );
            }
            if let Some(escalation) = &outcome.escalation {
                println!(
                    "needs attention: {} into {} conflicts in {}",
                    escalation.source,
                    escalation.target,
                    escalation.conflicts.join(", ")
                );
            }
            println!("{} reaped", outcome.task_id);
            Ok(())
        }
        Command::Reject { task, reason } => {
            let task_id = TaskId::new(task);
            conductor.reject(&task_id, &reason)?;
            println!("{task_id} rejected");
            Ok(())
        }
        Command::Reset { task } => {
            let task_id = TaskId::new(task);
            conductor.reset(&task_id)?;
            println!("{task_id} reset");
            Ok(())
        }
        Command::Prune { apply } => {
            let report = conductor.prune(apply)?;
            if report.is_clean() {
                println!("nothing to prune");
                return Ok(());
            }
            for orphan in &report.orphaned_worktrees {
                println!(
                    "orphaned worktree {} ({})",
                    orphan.path.display(),
                    orphan.branch.as_deref().unwrap_or("detached")
                );
                if !orphan.dirty_files.is_empty() {
                    println!("  uncommitted: {}", orphan.dirty_files.join(", "));
                }
                if orphan.unmerged_commits > 0 {
                    println!(
                        "  {} commit(s) not in {}",
                        orphan.unmerged_commits,
                        orphan.merge_target.as_deref().unwrap_or("its parent tier")
                    );
                }
            }
            for ghost in &report.ghost_agents {
                println!("ghost agent {ghost}");
            }
            for stale in &report.stale_metadata {
                println!("stale worktree metadata {}", stale.display());
            }
            if !report.applied {
                println!("run with --apply to reconcile");
            } else if report.retained().next().is_some() {
                println!("orphans holding work were kept; resume or reject them");
            }
            Ok(())
        }
        Command::Log { task, lines } => {
            let task_id = TaskId::new(task);
            let tail = conductor.log_tail(&task_id, lines)?;
            if tail.is_empty() {
                eprintln!("no output recorded in {}", conductor.log_path(&task_id).display());
            }
            for line in tail {
                println!("{line}");
            }
            Ok(())
        }
        Command::Events { task } => {
            for event in conductor.events(&TaskId::new(task))? {
                println!(
                    "{} {} {}",
                    event.at.to_rfc3339(),
                    event.kind.tag(),
                    serde_json::to_string(&event.kind)?
                );
            }
            Ok(())
        }
        Command::Merge { tier, id } => {
            let merge = conductor.merge_tier(tier, &id)?;
            println!(
                "merged {} into {} ({}) at {}",
                merge.source,
                merge.target,
                merge.strategy.as_str(),
                short_sha(&merge.head)
            );
            Ok(())
        }
        Command::Run {
            timeout,
            no_worktree,
        } => {
            let stop = shutdown_flag()?;
            let options = SpawnOptions {
                timeout_secs: timeout,
                worktree: !no_worktree,
                ..SpawnOptions::default()
            };
            let summary = conductor.run(&options, &|| stop.load(Ordering::Relaxed))?;
            println!(
                "spawned {}, reaped {}, failed {}",
                summary.spawned.len(),
                summary.reaped.len(),
                summary.failed.len()
            );
            for (task_id, reason) in &summary.skipped {
                println!("skipped {task_id}: {reason}");
            }
            if summary.interrupted {
                bail!("interrupted; live agents were killed");
            }
            Ok(())
        }
        // Backlog-only queries are answered before the conductor opens.
        Command::Config { .. }
        | Command::Ready
        | Command::Impact
        | Command::CriticalPath
        | Command::Cycles
        | Command::Gantt { .. } => Ok(()),
    }
}

/// Supervision lives in this process, so spawn stays in the foreground until
/// the agent exits. SIGINT/SIGTERM kill the agent.
fn cmd_spawn(conductor: &Conductor, task_id: &TaskId, options: &SpawnOptions) -> Result<()> {
    let stop = shutdown_flag()?;
    match conductor.spawn(task_id, options)? {
        SpawnOutcome::Started(record) => {
            println!(
                "{} running (pid {})",
                task_id,
                record.pid.map(|pid| pid.to_string()).unwrap_or_default()
            );
        }
        SpawnOutcome::Queued { position } => {
            println!("{task_id} queued at position {position}");
            wait_for_launch(conductor, task_id, &stop)?;
        }
    }

    loop {
        if stop.load(Ordering::Relaxed) {
            conductor.kill(task_id, Some("interrupted"))?;
            let grace = Duration::from_secs(conductor.config().agents.kill_grace_secs + 2);
            let view = conductor.wait(task_id, Some(grace))?;
            print_view(&view);
            bail!("interrupted; agent killed");
        }
        let view = conductor.wait(task_id, Some(FOREGROUND_POLL))?;
        if !view.record.status.is_live() {
            print_view(&view);
            return Ok(());
        }
    }
}

fn wait_for_launch(conductor: &Conductor, task_id: &TaskId, stop: &AtomicBool) -> Result<()> {
    while !stop.load(Ordering::Relaxed) {
        for (launched, result) in conductor.tick() {
            if &launched == task_id {
                result?;
                return Ok(());
            }
        }
        thread::sleep(FOREGROUND_POLL);
    }
    bail!("interrupted while queued")
}

fn shutdown_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&flag))
            .context("register signal handler")?;
    }
    Ok(flag)
}

fn cmd_config(path: &Path, config: &TillerConfig, write: bool) -> Result<()> {
    if write {
        save_config(path, config).with_context(|| format!("write {}", path.display()))?;
        println!("wrote {}", path.display());
        return Ok(());
    }
    print!("{}", toml::to_string_pretty(config).context("serialize config")?);
    Ok(())
}

fn cmd_ready(backlog: &JsonFileBacklog) -> Result<()> {
    let tasks = backlog.list_tasks()?;
    let graph = build_graph(&tasks)?;
    for task_id in graph.ready_tasks() {
        println!("{task_id}");
    }
    Ok(())
}

fn cmd_impact(backlog: &JsonFileBacklog) -> Result<()> {
    let tasks = backlog.list_tasks()?;
    let graph = build_graph(&tasks)?;
    for score in graph.impact_ranking() {
        println!(
            "{:<12} score={} dependents={} chain={}",
            score.task_id.0, score.score, score.direct_dependents, score.longest_chain
        );
    }
    Ok(())
}

fn cmd_critical_path(backlog: &JsonFileBacklog, config: &TillerConfig) -> Result<()> {
    let tasks = backlog.list_tasks()?;
    let (hours, path) = critical_chain(&tasks, &config.effort)?;
    if path.is_empty() {
        println!("no tasks");
        return Ok(());
    }
    println!("{} ({hours}h)", format_path(&path));
    Ok(())
}

fn cmd_cycles(backlog: &JsonFileBacklog) -> Result<()> {
    let tasks = backlog.list_tasks()?;
    let cycles = build_graph(&tasks)?.detect_cycles();
    if cycles.is_empty() {
        println!("no cycles");
    }
    for cycle in &cycles {
        println!("{}", format_path(cycle));
    }
    Ok(())
}

fn cmd_gantt(backlog: &JsonFileBacklog, config: &TillerConfig, prd: &str, json: bool) -> Result<()> {
    let tasks = backlog.list_tasks()?;
    let schedule = schedule_for_prd(&tasks, prd, &config.effort, &config.gantt, Utc::now())?;
    if json {
        return print_json(&schedule);
    }
    println!("prd {} from {}", schedule.prd_id, schedule.t0.to_rfc3339());
    for (task_id, slot) in &schedule.schedules {
        println!(
            "{:<12} {:>7.1}h -> {:>7.1}h  ({:.1}h, ends {})",
            task_id.0,
            slot.start_hour,
            slot.end_hour,
            slot.duration_hours,
            hour_to_time(schedule.t0, slot.end_hour).format("%Y-%m-%d %H:%M")
        );
    }
    let metrics = &schedule.metrics;
    println!(
        "span {:.1}h (display {:.1}h), critical {:.1}h via {}",
        metrics.real_span_hours,
        metrics.display_span_hours,
        metrics.critical_timespan_hours,
        format_path(&metrics.critical_path)
    );
    if metrics.overflow_hours > 0.0 {
        println!("overflow {:.1}h past the critical path", metrics.overflow_hours);
    }
    Ok(())
}

fn print_view(view: &AgentView) {
    let record = &view.record;
    let pid = record
        .pid
        .map(|pid| format!(" pid={pid}"))
        .unwrap_or_default();
    let branch = record
        .branch
        .as_deref()
        .map(|branch| format!(" branch={branch}"))
        .unwrap_or_default();
    let exit = record
        .exit_code
        .map(|code| format!(" exit={code}"))
        .unwrap_or_default();
    let reason = record
        .reason
        .as_deref()
        .map(|reason| format!(" reason=\"{reason}\""))
        .unwrap_or_default();
    println!(
        "{:<12} {:<9}{pid}{branch}{exit}{reason}",
        record.task_id.0,
        record.status.to_string()
    );
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serialize json")?);
    Ok(())
}

fn short_sha(sha: &str) -> &str {
    sha.get(..10).unwrap_or(sha)
}
