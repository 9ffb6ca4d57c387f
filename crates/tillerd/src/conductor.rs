//! Agent lifecycle conductor: spawn, supervise, kill, reap, reject, reset.
//!
//! Every operation on a task id runs under that id's lock. Agent records are
//! mutated only here, always through a read-modify-write in the store, so the
//! supervisor threads never need the task lock to finish a session.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tiller_agents::{
    build_prompt, command_in_path, kill_pid, pid_alive, render_command, terminate_pid,
    AgentError, AgentProcess, CommandContext, ExitInfo, KillEscalation, ProcessSpawner,
    SystemSpawner, Watchdog, WatchdogVerdict,
};
use tiller_core::{
    AgentStatus, BacklogError, BacklogStore, BranchTier, Event, EventKind, StatusFields, Task,
    TaskId, TaskStatus, TillerConfig, WatchdogKind,
};
use tiller_git::{
    branch_exists, commit_all, count_commits_between, create_branch, current_branch,
    delete_branch, discover_repo, list_branches, parse_tier_branch, same_path, task_branch,
    tracked_changes, worktree_status,
    CascadeStep, GitCli, GitError, MergeOutcome, Merger, RepoHandle, TierChain, WorktreeManager,
};

use crate::agent_log::AgentLog;
use crate::dependency_graph::build_graph;
use crate::error::{ConductorError, PreconditionFailure, ResourceConflict};
use crate::event_log::JsonlEventLog;
use crate::locks::KeyedLocks;
use crate::persistence::SqliteStore;
use crate::state_machine::transition_agent;
use crate::types::{
    AgentRecord, AgentView, OrphanedWorktree, PruneReport, ReapOptions, ReapOutcome,
    RunSummary, SpawnOptions, SpawnOutcome,
};

pub const STORE_FILE: &str = "tiller.db";
pub const EVENTS_DIR: &str = "events";
pub const LOGS_DIR: &str = "logs";

/// A `Spawned` record younger than this may belong to a launch still in flight
/// in another process.
const SPAWN_GRACE_SECS: i64 = 30;
const OUTPUT_TAIL_LINES: usize = 20;

#[derive(Clone)]
pub struct Conductor {
    inner: Arc<Inner>,
}

struct Inner {
    repo: RepoHandle,
    config: TillerConfig,
    main_branch: String,
    worktrees: WorktreeManager,
    store: Mutex<SqliteStore>,
    events: JsonlEventLog,
    logs: AgentLog,
    backlog: Arc<dyn BacklogStore>,
    spawner: Arc<dyn ProcessSpawner>,
    locks: KeyedLocks,
    /// Held from the `max_parallel` check until the new record is written.
    capacity: Mutex<()>,
    sessions: Mutex<HashMap<TaskId, Arc<SessionControl>>>,
    queue: Mutex<VecDeque<QueuedSpawn>>,
}

#[derive(Debug, Clone)]
struct QueuedSpawn {
    task_id: TaskId,
    options: SpawnOptions,
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    idle: Duration,
    wall: Duration,
    grace: Duration,
    poll: Duration,
}

/// Shared between the supervisor thread and callers that stop or wait on it.
#[derive(Debug, Default)]
struct SessionControl {
    state: Mutex<SessionState>,
    changed: Condvar,
}

#[derive(Debug, Default)]
struct SessionState {
    stop: Option<String>,
    finished: bool,
}

impl SessionControl {
    fn request_stop(&self, reason: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.stop.is_none() {
            state.stop = Some(reason.to_string());
        }
    }

    fn stop_requested(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stop
            .clone()
    }

    fn finish(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.finished = true;
        self.changed.notify_all();
    }

    /// True when the session finished within `timeout` (forever when `None`).
    fn wait_finished(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while !state.finished {
            match deadline {
                None => {
                    state = self
                        .changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    state = self
                        .changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        true
    }
}

impl Conductor {
    pub fn open(
        start: &Path,
        config: TillerConfig,
        backlog: Arc<dyn BacklogStore>,
    ) -> Result<Self, ConductorError> {
        Self::open_with_spawner(start, config, backlog, Arc::new(SystemSpawner::default()))
    }

    pub fn open_with_spawner(
        start: &Path,
        config: TillerConfig,
        backlog: Arc<dyn BacklogStore>,
        spawner: Arc<dyn ProcessSpawner>,
    ) -> Result<Self, ConductorError> {
        let mut git = GitCli::default();
        if let (Some(name), Some(email)) = (&config.merge.author_name, &config.merge.author_email)
        {
            git = git.with_identity(name, email);
        }
        let repo = discover_repo(start, &git)?;
        let haven = config.haven.resolve(&repo.root);
        fs::create_dir_all(&haven).map_err(|source| ConductorError::Io {
            path: haven.clone(),
            source,
        })?;

        let main_branch = match &config.merge.main_branch {
            Some(branch) => branch.clone(),
            None => current_branch(&repo, &git)?,
        };

        let store = SqliteStore::open(haven.join(STORE_FILE))?;
        store.migrate()?;
        let events = JsonlEventLog::new(haven.join(EVENTS_DIR));
        events.ensure_layout()?;
        let logs = AgentLog::new(haven.join(LOGS_DIR));
        let worktrees = WorktreeManager::new(git, &haven);

        tracing::debug!(repo = %repo.root.display(), haven = %haven.display(), main = %main_branch, "conductor ready");

        Ok(Self {
            inner: Arc::new(Inner {
                repo,
                config,
                main_branch,
                worktrees,
                store: Mutex::new(store),
                events,
                logs,
                backlog,
                spawner,
                locks: KeyedLocks::new(),
                capacity: Mutex::new(()),
                sessions: Mutex::new(HashMap::new()),
                queue: Mutex::new(VecDeque::new()),
            }),
        })
    }

    pub fn repo(&self) -> &RepoHandle {
        &self.inner.repo
    }

    pub fn config(&self) -> &TillerConfig {
        &self.inner.config
    }

    pub fn main_branch(&self) -> &str {
        &self.inner.main_branch
    }

    pub fn haven(&self) -> &Path {
        self.inner.worktrees.haven()
    }

    pub fn backlog(&self) -> &Arc<dyn BacklogStore> {
        &self.inner.backlog
    }

    fn git(&self) -> &GitCli {
        self.inner.worktrees.git()
    }

    fn store(&self) -> MutexGuard<'_, SqliteStore> {
        self.inner
            .store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn capacity(&self) -> MutexGuard<'_, ()> {
        self.inner
            .capacity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<TaskId, Arc<SessionControl>>> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self, task_id: &TaskId) -> Option<Arc<SessionControl>> {
        self.sessions().get(task_id).cloned()
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<QueuedSpawn>> {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn limits(&self, timeout_secs: Option<u64>) -> Limits {
        let agents = &self.inner.config.agents;
        Limits {
            idle: Duration::from_secs(agents.idle_timeout_secs),
            wall: Duration::from_secs(timeout_secs.unwrap_or(agents.timeout_secs)),
            grace: Duration::from_secs(agents.kill_grace_secs),
            poll: Duration::from_millis(agents.poll_interval_ms.max(10)),
        }
    }

    fn record_event(&self, task_id: Option<&TaskId>, kind: EventKind) -> Result<Event, ConductorError> {
        let event = Event::now(task_id, kind);
        self.store().append_event(&event)?;
        self.inner.events.append_both(&event)?;
        Ok(event)
    }

    /// Event recording from places that must not fail on it.
    fn record_event_quietly(&self, task_id: Option<&TaskId>, kind: EventKind) {
        if let Err(err) = self.record_event(task_id, kind) {
            tracing::warn!(task = ?task_id.map(|id| id.0.as_str()), error = %err, "failed to record event");
        }
    }

    fn update_backlog(&self, task_id: &TaskId, status: TaskStatus, fields: StatusFields) {
        match self
            .inner
            .backlog
            .update_task_status(task_id, status, fields)
        {
            Ok(_) => tracing::debug!(task = %task_id, status = status.as_str(), "updated backlog status"),
            Err(BacklogError::TaskNotFound { .. }) => {
                tracing::warn!(task = %task_id, "task vanished from backlog; status not updated")
            }
            Err(err) => tracing::warn!(task = %task_id, error = %err, "failed to update backlog status"),
        }
    }

    fn output_tail(&self, task_id: &TaskId) -> Vec<String> {
        self.inner
            .logs
            .tail(task_id, OUTPUT_TAIL_LINES)
            .unwrap_or_default()
    }

    // --- Spawn ---

    #[tracing::instrument(skip_all, fields(task = %task_id))]
    pub fn spawn(
        &self,
        task_id: &TaskId,
        options: &SpawnOptions,
    ) -> Result<SpawnOutcome, ConductorError> {
        let _guard = self.inner.locks.lock(&task_id.0);
        self.spawn_locked(task_id, options)
    }

    fn spawn_locked(
        &self,
        task_id: &TaskId,
        options: &SpawnOptions,
    ) -> Result<SpawnOutcome, ConductorError> {
        let tasks = self.inner.backlog.list_tasks()?;
        let Some(task) = tasks.iter().find(|task| &task.id == task_id).cloned() else {
            return Err(ConductorError::precondition(
                task_id,
                PreconditionFailure::TaskNotFound,
            ));
        };
        let graph = build_graph(&tasks)?;
        if let Some(path) = graph.cycle_through(task_id) {
            return Err(ConductorError::Cycle { path });
        }

        let mut failures = Vec::new();
        if let Some(view) = self.view(task_id)? {
            let record = view.record;
            if record.status.is_live() {
                failures.push(PreconditionFailure::AlreadyRunning {
                    status: record.status,
                    pid: record.pid,
                });
            } else if record.status.is_finished() {
                failures.push(PreconditionFailure::UnreapedAgent {
                    status: record.status,
                });
            }
        }
        if let Some(node) = graph.node(task_id) {
            let blockers = graph.unresolved_blockers(node);
            if !blockers.is_empty() {
                failures.push(PreconditionFailure::BlockedBy { blockers });
            }
        }
        let executable = self.inner.config.agents.command.trim();
        if !command_in_path(executable) {
            failures.push(PreconditionFailure::MissingDependency {
                executable: executable.to_string(),
            });
        }
        let dirty = tracked_changes(&self.inner.repo.root, self.git())?;
        if !dirty.is_empty() {
            failures.push(PreconditionFailure::DirtyRepository { files: dirty });
        }
        if !failures.is_empty() {
            return Err(ConductorError::Precondition {
                task_id: task_id.clone(),
                failures,
            });
        }

        let branch = task_branch(&task_id.0);
        let path = self.inner.worktrees.path_for_branch(&branch);
        let mut reattach = false;
        if options.worktree {
            let has_branch = branch_exists(&self.inner.repo, &branch, self.git())?;
            let has_dir = path.exists();
            if has_branch || has_dir {
                if !options.resume {
                    return Err(ConductorError::ResourceConflict {
                        task_id: task_id.clone(),
                        conflict: ResourceConflict::OrphanedWorktree {
                            path,
                            branch,
                            worktree_exists: has_dir,
                        },
                    });
                }
                if has_branch {
                    reattach = true;
                } else {
                    // A directory without its branch holds nothing to resume.
                    self.inner
                        .worktrees
                        .remove(&self.inner.repo, &path, true)?;
                }
            }
        }

        // Spawns of other tasks only hold their own task lock.
        let capacity = self.capacity();
        let running = self.store().count_live_agents()?;
        let max_parallel = self.inner.config.agents.max_parallel;
        if running >= max_parallel {
            if options.queue.unwrap_or(self.inner.config.agents.queue) {
                let position = self.enqueue(task_id, options);
                self.record_event(Some(task_id), EventKind::AgentQueued { position })?;
                tracing::info!(position, "spawn queued at capacity");
                return Ok(SpawnOutcome::Queued { position });
            }
            return Err(ConductorError::precondition(
                task_id,
                PreconditionFailure::AtCapacity {
                    running,
                    max_parallel,
                },
            ));
        }

        let (cwd, worktree, branch) = if options.worktree {
            let created = if reattach {
                self.inner.worktrees.attach(&self.inner.repo, &branch)
            } else {
                let chain = TierChain::for_task(&task_id.0, &task.parent, &self.inner.main_branch);
                self.ensure_tier_branches(task_id, &chain)?;
                let base = chain
                    .parent_of_start()
                    .map(|tier| tier.branch.clone())
                    .unwrap_or_else(|| self.inner.main_branch.clone());
                self.inner
                    .worktrees
                    .create(&self.inner.repo, &branch, &base)
            };
            let info = created.map_err(|err| git_precondition(task_id, err))?;
            (info.path.clone(), Some(info.path), Some(info.branch))
        } else {
            (self.inner.repo.root.clone(), None, None)
        };

        // Commit point: from here on a failure leaves an inspectable record.
        let record = AgentRecord::spawned(task_id.clone(), worktree, branch.clone());
        self.store().upsert_agent(&record)?;
        drop(capacity);
        if let Err(err) = self.inner.logs.truncate(task_id) {
            tracing::warn!(error = %err, "failed to truncate previous agent log");
        }

        let context = CommandContext {
            task_id: task_id.0.clone(),
            title: task.title.clone(),
            worktree: cwd,
            branch: branch.clone(),
            prompt: build_prompt(&task, branch.as_deref()),
        };
        let command = match render_command(&self.inner.config.agents, &context) {
            Ok(command) => command,
            Err(err) => return Err(self.fail_spawn(task_id, err.to_string())),
        };
        let mut process = match self.inner.spawner.spawn(&command) {
            Ok(process) => process,
            Err(err) => return Err(self.fail_spawn(task_id, err.to_string())),
        };
        let pid = process.pid();

        let now = Utc::now();
        let record = self
            .store()
            .update_agent(task_id, |record| {
                record.pid = Some(pid);
                transition_agent(record, AgentStatus::Running, now).is_ok()
            })?
            .unwrap_or(record);
        if record.status != AgentStatus::Running {
            if let Err(err) = process.kill() {
                tracing::warn!(pid, error = %err, "failed to kill agent after a lost launch");
            }
            return Err(ConductorError::Process {
                task_id: task_id.clone(),
                reason: format!("agent was {} while launching", record.status),
                output_tail: Vec::new(),
            });
        }

        self.record_event(
            Some(task_id),
            EventKind::AgentSpawned {
                pid,
                branch: branch.clone(),
                worktree: record
                    .worktree
                    .as_ref()
                    .map(|path| path.display().to_string()),
            },
        )?;
        let fields = if task.started_at.is_some() {
            StatusFields::default()
        } else {
            StatusFields::started(now)
        };
        self.update_backlog(task_id, TaskStatus::InProgress, fields);

        let control = Arc::new(SessionControl::default());
        self.sessions().insert(task_id.clone(), Arc::clone(&control));
        let limits = self.limits(options.timeout_secs);
        let conductor = self.clone();
        let thread_task = task_id.clone();
        let launched = thread::Builder::new()
            .name(format!("tiller-agent-{task_id}"))
            .spawn(move || conductor.supervise(thread_task, process, control, limits, pid));
        if let Err(err) = launched {
            self.sessions().remove(task_id);
            if let Err(kill_err) = kill_pid(pid) {
                tracing::warn!(pid, error = %kill_err, "failed to kill unsupervised agent");
            }
            return Err(self.fail_spawn(task_id, format!("failed to start supervisor: {err}")));
        }

        tracing::info!(pid, branch = ?branch, "agent spawned");
        Ok(SpawnOutcome::Started(record))
    }

    fn fail_spawn(&self, task_id: &TaskId, reason: String) -> ConductorError {
        let now = Utc::now();
        let updated = self.store().update_agent(task_id, |record| {
            record.reason = Some(reason.clone());
            transition_agent(record, AgentStatus::Error, now).is_ok()
        });
        if let Err(err) = updated {
            tracing::warn!(task = %task_id, error = %err, "failed to mark spawn failure");
        }
        self.record_event_quietly(
            Some(task_id),
            EventKind::SpawnFailed {
                message: reason.clone(),
            },
        );
        tracing::error!(task = %task_id, reason = %reason, "agent spawn failed");
        ConductorError::Process {
            task_id: task_id.clone(),
            reason,
            output_tail: Vec::new(),
        }
    }

    /// Create missing PRD/epic branches, highest tier first.
    fn ensure_tier_branches(&self, task_id: &TaskId, chain: &TierChain) -> Result<(), ConductorError> {
        for (tier, base) in chain.ancestors_to_ensure() {
            if branch_exists(&self.inner.repo, &tier.branch, self.git())? {
                continue;
            }
            create_branch(&self.inner.repo, &tier.branch, &base.branch, self.git())
                .map_err(|err| git_precondition(task_id, err))?;
            tracing::info!(branch = %tier.branch, base = %base.branch, "created tier branch");
        }
        Ok(())
    }

    fn enqueue(&self, task_id: &TaskId, options: &SpawnOptions) -> usize {
        let mut queue = self.queue();
        if let Some(index) = queue.iter().position(|entry| &entry.task_id == task_id) {
            return index + 1;
        }
        queue.push_back(QueuedSpawn {
            task_id: task_id.clone(),
            options: options.clone(),
        });
        queue.len()
    }

    fn dequeue(&self, task_id: &TaskId) -> bool {
        let mut queue = self.queue();
        let before = queue.len();
        queue.retain(|entry| &entry.task_id != task_id);
        queue.len() != before
    }

    pub fn queued(&self) -> Vec<TaskId> {
        self.queue().iter().map(|entry| entry.task_id.clone()).collect()
    }

    /// Launch queued spawns while there is capacity.
    pub fn tick(&self) -> Vec<(TaskId, Result<SpawnOutcome, ConductorError>)> {
        let mut launched = Vec::new();
        loop {
            let running = match self.store().count_live_agents() {
                Ok(running) => running,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to count live agents");
                    break;
                }
            };
            if running >= self.inner.config.agents.max_parallel {
                break;
            }
            let Some(next) = self.queue().pop_front() else {
                break;
            };
            let options = SpawnOptions {
                queue: Some(false),
                ..next.options
            };
            let result = self.spawn(&next.task_id, &options);
            launched.push((next.task_id, result));
        }
        launched
    }

    // --- Supervision ---

    fn supervise(
        &self,
        task_id: TaskId,
        mut process: Box<dyn AgentProcess>,
        control: Arc<SessionControl>,
        limits: Limits,
        pid: u32,
    ) {
        let output = process.take_output();
        let mut watchdog = Watchdog::new(limits.idle, limits.wall);
        let mut escalation: Option<KillEscalation> = None;
        let mut stop_reason: Option<String> = None;

        let exit = loop {
            let now = Instant::now();
            let mut lines = Vec::new();
            if let Some(rx) = &output {
                while let Ok(line) = rx.try_recv() {
                    lines.push(line);
                }
            }
            if !lines.is_empty() {
                watchdog.observe_output(now);
                self.append_output(&task_id, &lines);
            }

            match process.try_wait() {
                Ok(Some(exit)) => break Ok(exit),
                Ok(None) => {}
                Err(err) => break Err(err),
            }

            match escalation.as_mut() {
                Some(escalation) => {
                    if escalation.should_force(now) {
                        tracing::warn!(task = %task_id, pid, "agent ignored terminate; killing");
                        if let Err(err) = process.kill() {
                            tracing::warn!(task = %task_id, error = %err, "forced kill failed");
                        }
                    }
                }
                None => {
                    let reason = control
                        .stop_requested()
                        .or_else(|| self.watchdog_reason(&task_id, &watchdog, now));
                    if let Some(reason) = reason {
                        if let Err(err) = process.terminate() {
                            tracing::warn!(task = %task_id, error = %err, "terminate failed");
                        }
                        escalation = Some(KillEscalation::new(now, limits.grace));
                        stop_reason = Some(reason);
                    }
                }
            }

            thread::sleep(limits.poll);
        };

        if let Some(rx) = output {
            let deadline = Instant::now() + Duration::from_millis(500);
            let mut lines = Vec::new();
            while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
                match rx.recv_timeout(remaining) {
                    Ok(line) => lines.push(line),
                    Err(_) => break,
                }
            }
            self.append_output(&task_id, &lines);
        }

        self.finish_session(&task_id, pid, exit, stop_reason);
        self.sessions().remove(&task_id);
        control.finish();
    }

    fn append_output(&self, task_id: &TaskId, lines: &[String]) {
        if let Err(err) = self.inner.logs.append(task_id, lines) {
            tracing::warn!(task = %task_id, error = %err, "failed to append agent output");
        }
    }

    /// Fires at most once per session: the caller starts escalation on `Some`.
    fn watchdog_reason(&self, task_id: &TaskId, watchdog: &Watchdog, now: Instant) -> Option<String> {
        let WatchdogVerdict::Expired { kind, after } = watchdog.check(now) else {
            return None;
        };
        let reason = match kind {
            WatchdogKind::IdleTimeout => format!("no output for {}s", after.as_secs()),
            WatchdogKind::WallTimeout => format!("timed out after {}s", after.as_secs()),
        };
        tracing::warn!(task = %task_id, reason = %reason, "watchdog fired");
        self.record_event_quietly(
            Some(task_id),
            EventKind::WatchdogFired {
                kind,
                after_secs: after.as_secs(),
            },
        );
        if let Err(err) = self.mark_killed(task_id, &reason) {
            tracing::warn!(task = %task_id, error = %err, "failed to mark agent killed");
        }
        Some(reason)
    }

    fn finish_session(
        &self,
        task_id: &TaskId,
        pid: u32,
        exit: Result<ExitInfo, AgentError>,
        stop_reason: Option<String>,
    ) {
        let now = Utc::now();
        let (to, exit_code, reason) = match &exit {
            Ok(info) if stop_reason.is_some() => (AgentStatus::Killed, info.code, stop_reason),
            Ok(info) if info.success() => (AgentStatus::Completed, info.code, None),
            Ok(info) => (AgentStatus::Error, info.code, Some(describe_exit(info))),
            Err(err) => (AgentStatus::Error, None, Some(err.to_string())),
        };

        let updated = self.store().update_agent(task_id, |record| {
            // A reset and respawn replaced this attempt.
            if record.pid != Some(pid) {
                return false;
            }
            record.exit_code = exit_code;
            if record.status.is_live() && transition_agent(record, to, now).is_ok() {
                if record.reason.is_none() {
                    record.reason = reason.clone();
                }
            } else if record.completed_at.is_none() {
                record.completed_at = Some(now);
            }
            true
        });

        match updated {
            Ok(Some(record)) if record.pid == Some(pid) => {
                tracing::info!(task = %task_id, status = %record.status, exit_code = ?exit_code, "agent exited");
                self.record_event_quietly(
                    Some(task_id),
                    EventKind::AgentExited {
                        status: record.status,
                        exit_code,
                    },
                );
            }
            Ok(_) => tracing::debug!(task = %task_id, "agent record gone before exit"),
            Err(err) => tracing::error!(task = %task_id, error = %err, "failed to record agent exit"),
        }
    }

    fn mark_killed(&self, task_id: &TaskId, reason: &str) -> Result<Option<AgentRecord>, ConductorError> {
        let now = Utc::now();
        Ok(self.store().update_agent(task_id, |record| {
            if !record.status.is_live() {
                return false;
            }
            record.reason = Some(reason.to_string());
            transition_agent(record, AgentStatus::Killed, now).is_ok()
        })?)
    }

    // --- Status ---

    /// Read a record and correct it when its process is gone. Live records
    /// with no supervising session are checked by pid.
    fn view(&self, task_id: &TaskId) -> Result<Option<AgentView>, ConductorError> {
        let Some(record) = self.store().load_agent(task_id)? else {
            return Ok(None);
        };
        let supervised = self.session(task_id).is_some();
        if !record.status.is_live() || supervised {
            let process_alive = supervised && record.status.is_live();
            return Ok(Some(AgentView {
                record,
                process_alive,
                supervised,
            }));
        }

        let reason = match record.pid {
            Some(pid) if pid_alive(pid) => None,
            Some(_) => Some("process exited while unsupervised"),
            None if (Utc::now() - record.updated_at).num_seconds() > SPAWN_GRACE_SECS => {
                Some("spawn interrupted before the process started")
            }
            None => None,
        };
        let Some(reason) = reason else {
            return Ok(Some(AgentView {
                process_alive: record.pid.is_some(),
                record,
                supervised,
            }));
        };

        let from = record.status;
        let now = Utc::now();
        let corrected = self
            .store()
            .update_agent(task_id, |record| {
                if record.status != from {
                    return false;
                }
                record.reason = Some(reason.to_string());
                transition_agent(record, AgentStatus::Error, now).is_ok()
            })?
            .unwrap_or(record);
        if corrected.status != from {
            tracing::info!(task = %task_id, from = %from, to = %corrected.status, reason, "reconciled agent status");
            self.record_event(
                Some(task_id),
                EventKind::StatusReconciled {
                    from,
                    to: corrected.status,
                    reason: reason.to_string(),
                },
            )?;
        }
        Ok(Some(AgentView {
            record: corrected,
            process_alive: false,
            supervised,
        }))
    }

    pub fn status(&self, task_id: &TaskId) -> Result<AgentView, ConductorError> {
        let _guard = self.inner.locks.lock(&task_id.0);
        self.view(task_id)?.ok_or_else(|| {
            ConductorError::precondition(task_id, PreconditionFailure::AgentNotFound)
        })
    }

    pub fn list_agents(&self) -> Result<Vec<AgentView>, ConductorError> {
        let records = self.store().list_agents()?;
        let mut views = Vec::with_capacity(records.len());
        for record in records {
            let _guard = self.inner.locks.lock(&record.task_id.0);
            if let Some(view) = self.view(&record.task_id)? {
                views.push(view);
            }
        }
        Ok(views)
    }

    /// Block until the agent is no longer live, or `timeout` passes.
    pub fn wait(&self, task_id: &TaskId, timeout: Option<Duration>) -> Result<AgentView, ConductorError> {
        if let Some(control) = self.session(task_id) {
            control.wait_finished(timeout);
            return self.status(task_id);
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let poll = self.limits(None).poll;
        loop {
            let view = self.status(task_id)?;
            if !view.record.status.is_live() {
                return Ok(view);
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Ok(view);
            }
            thread::sleep(poll);
        }
    }

    // --- Kill ---

    /// Stop a live agent and mark it `Killed`. Finished agents are left as they are.
    #[tracing::instrument(skip_all, fields(task = %task_id))]
    pub fn kill(&self, task_id: &TaskId, reason: Option<&str>) -> Result<AgentRecord, ConductorError> {
        let _guard = self.inner.locks.lock(&task_id.0);
        self.kill_locked(task_id, reason.unwrap_or("killed by operator"))
    }

    fn kill_locked(&self, task_id: &TaskId, reason: &str) -> Result<AgentRecord, ConductorError> {
        let Some(view) = self.view(task_id)? else {
            return Err(ConductorError::precondition(
                task_id,
                PreconditionFailure::AgentNotFound,
            ));
        };
        if !view.record.status.is_live() {
            tracing::debug!(status = %view.record.status, "kill on finished agent is a no-op");
            return Ok(view.record);
        }

        let record = self.mark_killed(task_id, reason)?.unwrap_or(view.record);
        self.record_event(
            Some(task_id),
            EventKind::AgentKilled {
                reason: reason.to_string(),
            },
        )?;
        match self.session(task_id) {
            Some(control) => control.request_stop(reason),
            None => {
                if let Some(pid) = record.pid {
                    self.stop_pid(pid)?;
                }
            }
        }
        tracing::info!(reason, "agent killed");
        Ok(record)
    }

    /// Terminate, then force-kill once the grace period runs out.
    fn stop_pid(&self, pid: u32) -> Result<(), ConductorError> {
        if !terminate_pid(pid)? {
            return Ok(());
        }
        let limits = self.limits(None);
        let started = Instant::now();
        let mut escalation = KillEscalation::new(started, limits.grace);
        while pid_alive(pid) {
            if escalation.should_force(Instant::now()) {
                kill_pid(pid)?;
                break;
            }
            thread::sleep(limits.poll);
        }
        Ok(())
    }

    /// Kill and wait until the process is really gone.
    fn stop_and_wait(&self, task_id: &TaskId, reason: &str) -> Result<(), ConductorError> {
        self.kill_locked(task_id, reason)?;
        if let Some(control) = self.session(task_id) {
            let limits = self.limits(None);
            if !control.wait_finished(Some(limits.grace + limits.poll * 4 + Duration::from_secs(1))) {
                tracing::warn!(task = %task_id, "agent still shutting down");
            }
        }
        Ok(())
    }

    /// Kill every live agent, e.g. on SIGINT.
    pub fn kill_all(&self, reason: &str) -> Vec<TaskId> {
        let live = match self.store().list_agents() {
            Ok(records) => records,
            Err(err) => {
                tracing::error!(error = %err, "failed to list agents");
                return Vec::new();
            }
        };
        let mut killed = Vec::new();
        for record in live.into_iter().filter(|record| record.status.is_live()) {
            match self.kill(&record.task_id, Some(reason)) {
                Ok(_) => killed.push(record.task_id),
                Err(err) => tracing::warn!(task = %record.task_id, error = %err, "kill failed"),
            }
        }
        let grace = self.limits(None).grace + Duration::from_secs(1);
        for task_id in &killed {
            if let Some(control) = self.session(task_id) {
                control.wait_finished(Some(grace));
            }
        }
        killed
    }

    // --- Reap ---

    /// Merge a completed agent's work up the cascade and close its record.
    #[tracing::instrument(skip_all, fields(task = %task_id))]
    pub fn reap(&self, task_id: &TaskId, options: &ReapOptions) -> Result<ReapOutcome, ConductorError> {
        let timeout = options.timeout_secs.map(Duration::from_secs);
        if options.wait {
            self.wait(task_id, timeout)?;
        }

        let _guard = self.inner.locks.lock(&task_id.0);
        let Some(view) = self.view(task_id)? else {
            return Err(ConductorError::precondition(
                task_id,
                PreconditionFailure::AgentNotFound,
            ));
        };
        let record = view.record;
        match record.status {
            AgentStatus::Reaped => {
                return Ok(ReapOutcome {
                    task_id: task_id.clone(),
                    already_reaped: true,
                    merges: Vec::new(),
                    escalation: None,
                    worktree_removed: false,
                });
            }
            AgentStatus::Rejected => {
                return Err(ConductorError::precondition(
                    task_id,
                    PreconditionFailure::AgentRejected,
                ));
            }
            AgentStatus::Spawned | AgentStatus::Running => {
                return Err(ConductorError::precondition(
                    task_id,
                    PreconditionFailure::StillRunning {
                        waited_secs: options.wait.then_some(options.timeout_secs).flatten(),
                    },
                ));
            }
            AgentStatus::Error | AgentStatus::Killed => {
                let reason = match &record.reason {
                    Some(reason) => format!("agent finished as {}: {reason}", record.status),
                    None => format!("agent finished as {}", record.status),
                };
                return Err(ConductorError::Process {
                    task_id: task_id.clone(),
                    reason,
                    output_tail: self.output_tail(task_id),
                });
            }
            AgentStatus::Completed => {}
        }

        let parent = self
            .inner
            .backlog
            .get_task(task_id)?
            .map(|task| task.parent)
            .unwrap_or_default();
        let chain = TierChain::for_task(&task_id.0, &parent, &self.inner.main_branch);
        let steps = chain.steps(&self.inner.config.merge);

        let mut outcome = ReapOutcome {
            task_id: task_id.clone(),
            already_reaped: false,
            merges: Vec::new(),
            escalation: None,
            worktree_removed: false,
        };

        let isolated = match (&record.worktree, &record.branch) {
            (Some(worktree), Some(branch)) => Some((worktree.clone(), branch.clone())),
            _ => None,
        };
        if let Some((worktree, branch)) = &isolated {
            if !worktree.exists() {
                return Err(ConductorError::precondition(
                    task_id,
                    PreconditionFailure::MissingWorktree {
                        path: worktree.clone(),
                    },
                ));
            }
            self.commit_or_refuse(task_id, worktree)?;

            let Some(first) = steps.first() else {
                return Err(ConductorError::precondition(
                    task_id,
                    PreconditionFailure::MissingBranch {
                        branch: self.inner.main_branch.clone(),
                    },
                ));
            };
            let merge = self.merge_step(task_id, first)?;
            if !merge.success {
                return Err(ConductorError::MergeConflict {
                    source_branch: merge.source,
                    target_branch: merge.target,
                    files: merge.conflicts,
                });
            }
            outcome.merges.push(merge);

            self.inner
                .worktrees
                .remove(&self.inner.repo, worktree, true)?;
            delete_branch(&self.inner.repo, branch, true, self.git())?;
            outcome.worktree_removed = true;
        }

        let now = Utc::now();
        self.store().update_agent(task_id, |record| {
            transition_agent(record, AgentStatus::Reaped, now).is_ok()
        })?;
        self.update_backlog(task_id, TaskStatus::Done, StatusFields::done(now));
        self.record_event(
            Some(task_id),
            EventKind::AgentReaped {
                merged_into: outcome
                    .merges
                    .iter()
                    .map(|merge| merge.target.clone())
                    .collect(),
            },
        )?;

        if isolated.is_some() && self.inner.config.merge.auto_cascade {
            self.cascade_upward(task_id, &steps[1..], &mut outcome)?;
        }
        tracing::info!(merges = outcome.merges.len(), "agent reaped");
        Ok(outcome)
    }

    fn commit_or_refuse(&self, task_id: &TaskId, worktree: &Path) -> Result<(), ConductorError> {
        let status = worktree_status(worktree, None, self.git())?;
        if status.clean {
            return Ok(());
        }
        if !self.inner.config.merge.auto_commit {
            return Err(ConductorError::precondition(
                task_id,
                PreconditionFailure::DirtyWorktree {
                    path: worktree.to_path_buf(),
                    files: status.changed_paths(),
                },
            ));
        }
        let message = format!("tiller: commit remaining work for {task_id}");
        if let Some(sha) = commit_all(worktree, &message, self.git())? {
            tracing::info!(sha = %sha, "auto-committed agent changes");
            self.record_event(Some(task_id), EventKind::AutoCommitted { sha })?;
        }
        Ok(())
    }

    fn merge_step(&self, task_id: &TaskId, step: &CascadeStep) -> Result<MergeOutcome, ConductorError> {
        let merger = Merger::new(&self.inner.worktrees);
        let outcome = merger
            .merge(
                &self.inner.repo,
                &step.source.branch,
                &step.target.branch,
                step.strategy,
            )
            .map_err(|err| git_precondition(task_id, err))?;
        let kind = if outcome.success {
            EventKind::MergeCompleted {
                source: outcome.source.clone(),
                target: outcome.target.clone(),
                strategy: outcome.strategy,
                head: outcome.head.clone(),
            }
        } else {
            EventKind::MergeConflict {
                source: outcome.source.clone(),
                target: outcome.target.clone(),
                files: outcome.conflicts.clone(),
            }
        };
        self.record_event(Some(task_id), kind)?;
        Ok(outcome)
    }

    /// Merge epic into PRD and PRD into main while each tier is finished.
    fn cascade_upward(
        &self,
        task_id: &TaskId,
        steps: &[CascadeStep],
        outcome: &mut ReapOutcome,
    ) -> Result<(), ConductorError> {
        if steps.is_empty() {
            return Ok(());
        }
        let tasks = self.inner.backlog.list_tasks()?;
        for step in steps {
            if !tier_complete(&tasks, step.source.tier, &step.source.id) {
                tracing::debug!(tier = %step.source.tier, id = %step.source.id, "tier still open; cascade stops");
                break;
            }
            let tier_key = format!("{}:{}", step.source.tier, step.source.id);
            let _tier_guard = self.inner.locks.lock(&tier_key);
            let merge = self.merge_step(task_id, step)?;
            if !merge.success {
                tracing::warn!(source = %merge.source, target = %merge.target, "cascade escalated on conflicts");
                outcome.escalation = Some(merge);
                break;
            }
            outcome.merges.push(merge);
        }
        Ok(())
    }

    /// Manually merge an epic or PRD branch into its parent tier.
    #[tracing::instrument(skip_all, fields(tier = %tier, id = %id))]
    pub fn merge_tier(&self, tier: BranchTier, id: &str) -> Result<MergeOutcome, ConductorError> {
        let key = TaskId::new(id);
        let tasks = self.inner.backlog.list_tasks()?;
        let chain = match tier {
            BranchTier::Epic => {
                let Some(member) = tasks.iter().find(|task| task.parent.epic.as_deref() == Some(id))
                else {
                    return Err(ConductorError::precondition(
                        &key,
                        PreconditionFailure::EmptyTier {
                            tier,
                            id: id.to_string(),
                        },
                    ));
                };
                TierChain::for_epic(id, member.parent.prd.as_deref(), &self.inner.main_branch)
            }
            BranchTier::Prd => {
                if !tasks.iter().any(|task| task.parent.prd.as_deref() == Some(id)) {
                    return Err(ConductorError::precondition(
                        &key,
                        PreconditionFailure::EmptyTier {
                            tier,
                            id: id.to_string(),
                        },
                    ));
                }
                TierChain::for_prd(id, &self.inner.main_branch)
            }
            BranchTier::Task | BranchTier::Main => {
                return Err(ConductorError::precondition(
                    &key,
                    PreconditionFailure::UnsupportedTier { tier },
                ));
            }
        };

        let steps = chain.steps(&self.inner.config.merge);
        let Some(step) = steps.first() else {
            return Err(ConductorError::precondition(
                &key,
                PreconditionFailure::UnsupportedTier { tier },
            ));
        };
        let _guard = self.inner.locks.lock(&format!("{tier}:{id}"));
        let merge = self.merge_step(&key, step)?;
        if !merge.success {
            return Err(ConductorError::MergeConflict {
                source_branch: merge.source,
                target_branch: merge.target,
                files: merge.conflicts,
            });
        }
        Ok(merge)
    }

    // --- Reject / reset ---

    /// Discard the agent's worktree and branch unconditionally.
    #[tracing::instrument(skip_all, fields(task = %task_id))]
    pub fn reject(&self, task_id: &TaskId, reason: &str) -> Result<Option<AgentRecord>, ConductorError> {
        let _guard = self.inner.locks.lock(&task_id.0);
        let view = self.view(task_id)?;
        if let Some(view) = &view {
            if view.record.status == AgentStatus::Reaped {
                return Err(ConductorError::precondition(
                    task_id,
                    PreconditionFailure::AlreadyReaped,
                ));
            }
            if view.record.status.is_live() {
                self.stop_and_wait(task_id, reason)?;
            }
        }

        self.discard_work(task_id, view.as_ref().map(|view| &view.record))?;
        self.dequeue(task_id);

        let now = Utc::now();
        let record = self.store().update_agent(task_id, |record| {
            record.reason = Some(reason.to_string());
            transition_agent(record, AgentStatus::Rejected, now).is_ok()
        })?;
        self.record_event(
            Some(task_id),
            EventKind::AgentRejected {
                reason: reason.to_string(),
            },
        )?;
        tracing::warn!(reason, "agent work rejected");
        Ok(record)
    }

    /// Remove the task's worktree and branch, whether or not a record knows them.
    fn discard_work(&self, task_id: &TaskId, record: Option<&AgentRecord>) -> Result<(), ConductorError> {
        let branch = record
            .and_then(|record| record.branch.clone())
            .unwrap_or_else(|| task_branch(&task_id.0));
        let path = record
            .and_then(|record| record.worktree.clone())
            .unwrap_or_else(|| self.inner.worktrees.path_for_branch(&branch));

        let registered = self
            .inner
            .worktrees
            .find_checkout(&self.inner.repo, &branch)?
            .map(|listed| listed.path);
        for candidate in [Some(path), registered].into_iter().flatten() {
            if candidate.exists() && !same_path(&candidate, &self.inner.repo.root) {
                self.inner
                    .worktrees
                    .remove(&self.inner.repo, &candidate, true)?;
                tracing::debug!(path = %candidate.display(), "removed worktree");
            }
        }
        self.inner.worktrees.prune(&self.inner.repo)?;

        if branch_exists(&self.inner.repo, &branch, self.git())? {
            delete_branch(&self.inner.repo, &branch, true, self.git())?;
            tracing::debug!(branch = %branch, "deleted branch");
        }
        Ok(())
    }

    /// Kill, discard, clear the record and return the task to `NotStarted`.
    #[tracing::instrument(skip_all, fields(task = %task_id))]
    pub fn reset(&self, task_id: &TaskId) -> Result<(), ConductorError> {
        let _guard = self.inner.locks.lock(&task_id.0);
        let view = self.view(task_id)?;
        if let Some(view) = &view {
            if view.record.status.is_live() {
                self.stop_and_wait(task_id, "reset")?;
            }
        }
        let record = view.map(|view| view.record);
        if record.as_ref().map(|record| record.status) != Some(AgentStatus::Reaped) {
            self.discard_work(task_id, record.as_ref())?;
        }
        self.dequeue(task_id);
        self.store().delete_agent(task_id)?;
        self.update_backlog(task_id, TaskStatus::NotStarted, StatusFields::cleared());
        self.record_event(Some(task_id), EventKind::AgentReset)?;
        tracing::info!("agent reset");
        Ok(())
    }

    // --- Prune ---

    /// Find (and with `apply`, reconcile) orphaned worktrees, ghost agents and
    /// stale worktree metadata.
    #[tracing::instrument(skip_all, fields(apply = apply))]
    pub fn prune(&self, apply: bool) -> Result<PruneReport, ConductorError> {
        let records = self.store().list_agents()?;
        let open: Vec<&AgentRecord> = records
            .iter()
            .filter(|record| !record.status.is_closed())
            .collect();
        let owned_path = |path: &Path| {
            open.iter().any(|record| {
                record
                    .worktree
                    .as_deref()
                    .is_some_and(|worktree| same_path(worktree, path))
            })
        };
        let owned_branch = |branch: &str| {
            open.iter()
                .any(|record| record.branch.as_deref() == Some(branch))
        };

        let tasks = self.inner.backlog.list_tasks()?;
        let mut report = PruneReport::default();
        let mut seen_branches = HashSet::new();
        for listed in self.inner.worktrees.list_haven(&self.inner.repo)? {
            if !listed.path.exists() || owned_path(&listed.path) {
                continue;
            }
            if let Some(branch) = &listed.branch {
                seen_branches.insert(branch.clone());
            }
            let orphan = self.inspect_orphan(listed.path, listed.branch, true, &tasks)?;
            report.orphaned_worktrees.push(orphan);
        }
        for branch in list_branches(&self.inner.repo, "task/", self.git())? {
            if seen_branches.contains(&branch) || owned_branch(&branch) {
                continue;
            }
            let path = self.inner.worktrees.path_for_branch(&branch);
            let orphan = self.inspect_orphan(path, Some(branch), false, &tasks)?;
            report.orphaned_worktrees.push(orphan);
        }

        let sessions: HashSet<TaskId> = self.sessions().keys().cloned().collect();
        for record in &open {
            let Some(worktree) = &record.worktree else {
                continue;
            };
            let alive = sessions.contains(&record.task_id)
                || (record.status.is_live() && record.pid.is_some_and(pid_alive));
            if !worktree.exists() && !alive {
                report.ghost_agents.push(record.task_id.clone());
            }
        }
        report.stale_metadata = self.inner.worktrees.stale(&self.inner.repo)?;

        if apply {
            self.apply_prune(&report)?;
            report.applied = true;
        }
        Ok(report)
    }

    /// Measure what deleting an orphan would lose.
    fn inspect_orphan(
        &self,
        path: PathBuf,
        branch: Option<String>,
        checked_out: bool,
        tasks: &[Task],
    ) -> Result<OrphanedWorktree, ConductorError> {
        let dirty_files = if checked_out {
            worktree_status(&path, None, self.git())?.changed_paths()
        } else {
            Vec::new()
        };
        let merge_target = match branch.as_deref() {
            Some(branch) => Some(self.merge_target_of(branch, tasks)?),
            None => None,
        };
        let unmerged_commits = match (&branch, &merge_target) {
            (Some(branch), Some(target)) => {
                count_commits_between(&self.inner.repo.root, target, branch, self.git())?
            }
            _ => 0,
        };
        Ok(OrphanedWorktree {
            path,
            branch,
            dirty_files,
            merge_target,
            unmerged_commits,
        })
    }

    /// The next tier up for a tier branch, falling back to main when that
    /// tier's branch is gone. Other branches are measured against main.
    fn merge_target_of(&self, branch: &str, tasks: &[Task]) -> Result<String, ConductorError> {
        let main = self.inner.main_branch.as_str();
        let chain = match parse_tier_branch(branch) {
            Some((BranchTier::Task, id)) => {
                let parent = tasks
                    .iter()
                    .find(|task| task_branch(&task.id.0) == branch)
                    .map(|task| task.parent.clone())
                    .unwrap_or_default();
                TierChain::for_task(id, &parent, main)
            }
            Some((BranchTier::Epic, id)) => {
                let prd = tasks
                    .iter()
                    .find(|task| task.parent.epic.as_deref() == Some(id))
                    .and_then(|task| task.parent.prd.as_deref());
                TierChain::for_epic(id, prd, main)
            }
            Some((BranchTier::Prd, id)) => TierChain::for_prd(id, main),
            _ => return Ok(main.to_string()),
        };
        let target = chain
            .parent_of_start()
            .map(|tier| tier.branch.clone())
            .unwrap_or_else(|| main.to_string());
        if target != main && !branch_exists(&self.inner.repo, &target, self.git())? {
            return Ok(main.to_string());
        }
        Ok(target)
    }

    fn apply_prune(&self, report: &PruneReport) -> Result<(), ConductorError> {
        if !report.stale_metadata.is_empty() {
            self.inner.worktrees.prune(&self.inner.repo)?;
        }

        for orphan in &report.orphaned_worktrees {
            if !orphan.is_disposable() {
                tracing::warn!(
                    path = %orphan.path.display(),
                    dirty = orphan.dirty_files.len(),
                    unmerged = orphan.unmerged_commits,
                    "orphan holds work; resume or reject it"
                );
                continue;
            }
            let task_key = orphan
                .branch
                .as_deref()
                .and_then(parse_tier_branch)
                .filter(|(tier, _)| *tier == BranchTier::Task)
                .map(|(_, id)| TaskId::new(id));
            let _guard = task_key
                .as_ref()
                .map(|task_id| self.inner.locks.lock(&task_id.0));
            if orphan.path.exists() {
                if let Err(err) = self
                    .inner
                    .worktrees
                    .remove(&self.inner.repo, &orphan.path, false)
                {
                    tracing::warn!(path = %orphan.path.display(), error = %err, "orphan not removed");
                    continue;
                }
            }
            let tier_owned = orphan
                .branch
                .as_deref()
                .filter(|branch| parse_tier_branch(branch).is_some());
            if let Some(branch) = tier_owned {
                if branch_exists(&self.inner.repo, branch, self.git())? {
                    delete_branch(&self.inner.repo, branch, true, self.git())?;
                }
            }
            self.record_event(
                task_key.as_ref(),
                EventKind::WorktreePruned {
                    path: orphan.path.display().to_string(),
                },
            )?;
            tracing::info!(path = %orphan.path.display(), "pruned orphaned worktree");
        }

        for task_id in &report.ghost_agents {
            let _guard = self.inner.locks.lock(&task_id.0);
            self.store().delete_agent(task_id)?;
            self.record_event(Some(task_id), EventKind::GhostCleared)?;
            tracing::info!(task = %task_id, "cleared ghost agent");
        }
        Ok(())
    }

    // --- Queries ---

    pub fn log_tail(&self, task_id: &TaskId, lines: usize) -> Result<Vec<String>, ConductorError> {
        self.inner
            .logs
            .tail(task_id, lines)
            .map_err(|source| ConductorError::Io {
                path: self.inner.logs.path(task_id),
                source,
            })
    }

    pub fn log_path(&self, task_id: &TaskId) -> PathBuf {
        self.inner.logs.path(task_id)
    }

    pub fn events(&self, task_id: &TaskId) -> Result<Vec<Event>, ConductorError> {
        Ok(self.store().list_events_for_task(task_id)?)
    }

    pub fn tasks(&self) -> Result<Vec<Task>, ConductorError> {
        Ok(self.inner.backlog.list_tasks()?)
    }

    // --- Supervise loop ---

    /// Spawn ready tasks up to capacity and reap them as they complete, until
    /// nothing is running and nothing new can start.
    pub fn run(
        &self,
        options: &SpawnOptions,
        should_stop: &dyn Fn() -> bool,
    ) -> Result<RunSummary, ConductorError> {
        let mut summary = RunSummary::default();
        let mut attempted: HashSet<TaskId> = HashSet::new();
        let mut reported: HashSet<TaskId> = HashSet::new();
        // A refused reap leaves the record Completed; it is not retried.
        let mut reap_failed: HashSet<TaskId> = HashSet::new();
        let poll = self.limits(None).poll;
        let spawn_options = SpawnOptions {
            queue: Some(false),
            ..options.clone()
        };

        loop {
            if should_stop() {
                summary.interrupted = true;
                self.kill_all("interrupted");
                break;
            }
            let mut progressed = false;

            let records = self.store().list_agents()?;
            for record in records {
                if !attempted.contains(&record.task_id) {
                    continue;
                }
                match record.status {
                    AgentStatus::Completed if !reap_failed.contains(&record.task_id) => {
                        match self.reap(&record.task_id, &ReapOptions::default()) {
                            Ok(_) => {
                                summary.reaped.push(record.task_id.clone());
                                progressed = true;
                            }
                            Err(err) => {
                                tracing::warn!(task = %record.task_id, error = %err, "reap failed");
                                summary.skipped.push((record.task_id.clone(), err.to_string()));
                                summary.failed.push(record.task_id.clone());
                                reap_failed.insert(record.task_id.clone());
                            }
                        }
                    }
                    AgentStatus::Error | AgentStatus::Killed => {
                        if reported.insert(record.task_id.clone()) {
                            summary.failed.push(record.task_id.clone());
                            progressed = true;
                        }
                    }
                    _ => {}
                }
            }

            let tasks = self.inner.backlog.list_tasks()?;
            let graph = build_graph(&tasks)?;
            let mut live = self.store().count_live_agents()?;
            for task_id in graph.ready_tasks() {
                if live >= self.inner.config.agents.max_parallel {
                    break;
                }
                if !attempted.insert(task_id.clone()) {
                    continue;
                }
                match self.spawn(&task_id, &spawn_options) {
                    Ok(SpawnOutcome::Started(_)) => {
                        summary.spawned.push(task_id);
                        live += 1;
                        progressed = true;
                    }
                    Ok(SpawnOutcome::Queued { .. }) => {}
                    Err(err) => {
                        tracing::warn!(task = %task_id, error = %err, "spawn skipped");
                        summary.skipped.push((task_id, err.to_string()));
                    }
                }
            }

            if live == 0 && !progressed {
                break;
            }
            thread::sleep(poll);
        }
        Ok(summary)
    }
}

/// Map the git errors that describe fixable conditions onto preconditions.
fn git_precondition(task_id: &TaskId, err: GitError) -> ConductorError {
    match err {
        GitError::BranchNotFound { branch } => {
            ConductorError::precondition(task_id, PreconditionFailure::MissingBranch { branch })
        }
        GitError::DirtyWorktree { path, files } => {
            ConductorError::precondition(task_id, PreconditionFailure::DirtyWorktree { path, files })
        }
        other => ConductorError::Git(other),
    }
}

fn tier_complete(tasks: &[Task], tier: BranchTier, id: &str) -> bool {
    let member = |task: &&Task| match tier {
        BranchTier::Epic => task.parent.epic.as_deref() == Some(id),
        BranchTier::Prd => task.parent.prd.as_deref() == Some(id),
        BranchTier::Task => task.id.0 == id,
        BranchTier::Main => false,
    };
    let mut members = tasks.iter().filter(member).peekable();
    members.peek().is_some() && members.all(|task| task.status.is_terminal())
}

fn describe_exit(info: &ExitInfo) -> String {
    match (info.code, info.signal) {
        (Some(code), _) => format!("exited with status {code}"),
        (None, Some(signal)) => format!("terminated by signal {signal}"),
        (None, None) => "exited abnormally".to_string(),
    }
}
