//! Bounded parallel scheduler
//!
//! A fixed pool of N workers drains a ready set ordered by task path:
//! a task becomes runnable when every dependency is terminal, and
//! equally-runnable tasks dispatch in lexicographic path order, which
//! makes single-worker execution order a function of the graph alone.
//!
//! Failure semantics: a failed task with the default `Fatal` policy
//! cancels its transitive dependents; under `Continue` the dependents
//! still run and observe the upstream failure (usually failing on
//! missing inputs, attributed to the upstream task). Independent
//! subgraphs always keep going.
//!
//! Cancellation: the token is checked between tasks and between
//! actions; in-flight child processes get terminate-then-kill. On
//! drain, every non-terminal task reports as cancelled.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::action::ActionEnv;
use crate::cancel::CancelToken;
use crate::config::Settings;
use crate::digest;
use crate::error::{FailureKind, KilnError, TaskFailure};
use crate::graph::ExecutionSet;
use crate::paths::encode_task_path;
use crate::report::{BuildReport, TaskReport, TaskStatus};
use crate::store::{FingerprintRecord, FingerprintStore};
use crate::task::{FailurePolicy, TaskId, TaskState, TaskUnit};

// ============================================================================
// EXECUTOR
// ============================================================================

/// Topological scheduler with bounded parallelism
pub struct Executor {
    settings: Settings,
    cancel: CancelToken,
}

/// What one worker reports back for one task
struct TaskRun {
    id: TaskId,
    path: Arc<str>,
    status: RunStatus,
    duration: Duration,
    log_path: Option<PathBuf>,
}

enum RunStatus {
    Succeeded,
    Skipped,
    Failed(TaskFailure),
    Cancelled,
}

impl Executor {
    pub fn new(settings: Settings, cancel: CancelToken) -> Self {
        Self { settings, cancel }
    }

    /// Run an execution set to completion, cancellation or failure.
    ///
    /// An empty set succeeds immediately with no fingerprint writes.
    #[instrument(skip_all, fields(tasks = set.len(), workers = self.settings.parallel))]
    pub async fn run(
        &self,
        set: Arc<ExecutionSet>,
        store: Arc<FingerprintStore>,
    ) -> Result<BuildReport, KilnError> {
        let started = Instant::now();
        if set.is_empty() {
            return Ok(BuildReport {
                entries: Vec::new(),
                cancelled_by_user: self.cancel.is_cancelled(),
                elapsed: started.elapsed(),
            });
        }

        info!(tasks = set.len(), workers = self.settings.parallel, "executing");

        let dependents = set.dependents();
        let mut states: HashMap<TaskId, TaskState> = set
            .order
            .iter()
            .map(|id| (*id, TaskState::Queued))
            .collect();
        let mut blocking: HashMap<TaskId, usize> = set
            .order
            .iter()
            .map(|id| (*id, set.unit(*id).deps.len()))
            .collect();
        // Failed upstream attribution for Continue-policy dependents
        let mut failed_upstream: HashMap<TaskId, Arc<str>> = HashMap::new();

        let mut ready: BTreeMap<Arc<str>, TaskId> = set
            .order
            .iter()
            .filter(|id| blocking[*id] == 0)
            .map(|id| (Arc::clone(&set.unit(*id).path), *id))
            .collect();

        let mut pool: JoinSet<TaskRun> = JoinSet::new();
        let mut in_flight = 0usize;
        let mut entries: Vec<TaskReport> = Vec::new();

        loop {
            // Fill idle workers, smallest task path first
            while in_flight < self.settings.parallel && !self.cancel.is_cancelled() {
                let Some((_, id)) = ready.pop_first() else { break };
                states.insert(id, TaskState::Running);
                let unit = set.unit(id).clone();
                let upstream = unit
                    .deps
                    .iter()
                    .find_map(|dep| failed_upstream.get(dep).cloned());
                pool.spawn(run_task(
                    unit,
                    upstream,
                    Arc::clone(&store),
                    self.cancel.clone(),
                    self.settings.clone(),
                ));
                in_flight += 1;
            }

            if in_flight == 0 {
                break;
            }

            let run = match pool.join_next().await {
                Some(Ok(run)) => run,
                Some(Err(join_err)) => {
                    return Err(KilnError::internal(format!(
                        "worker panicked: {}",
                        join_err
                    )));
                }
                None => break,
            };
            in_flight -= 1;

            let (state, status, failure) = match run.status {
                RunStatus::Succeeded => (TaskState::Succeeded, TaskStatus::Succeeded, None),
                RunStatus::Skipped => (TaskState::Skipped, TaskStatus::Skipped, None),
                RunStatus::Cancelled => (TaskState::Cancelled, TaskStatus::Cancelled, None),
                RunStatus::Failed(failure) => {
                    (TaskState::Failed, TaskStatus::Failed, Some(failure))
                }
            };
            states.insert(run.id, state);
            entries.push(TaskReport {
                path: Arc::clone(&run.path),
                status,
                duration: run.duration,
                failure,
                log_path: run.log_path,
            });

            match state {
                TaskState::Succeeded | TaskState::Skipped => {
                    self.release_dependents(run.id, &set, &dependents, &mut blocking, &mut ready, &states);
                }
                TaskState::Failed => {
                    let unit = set.unit(run.id);
                    match unit.failure_policy {
                        FailurePolicy::Fatal => {
                            self.cancel_downstream(
                                run.id,
                                &set,
                                &dependents,
                                &mut states,
                                &mut ready,
                                &mut entries,
                            );
                        }
                        FailurePolicy::Continue => {
                            failed_upstream.insert(run.id, Arc::clone(&run.path));
                            self.release_dependents(
                                run.id,
                                &set,
                                &dependents,
                                &mut blocking,
                                &mut ready,
                                &states,
                            );
                        }
                    }
                }
                TaskState::Cancelled => {}
                _ => unreachable!("worker reported a non-terminal state"),
            }
        }

        // Drain: everything still pending transitions to cancelled
        for id in &set.order {
            if !states[id].is_terminal() {
                states.insert(*id, TaskState::Cancelled);
                entries.push(TaskReport {
                    path: Arc::clone(&set.unit(*id).path),
                    status: TaskStatus::Cancelled,
                    duration: Duration::ZERO,
                    failure: None,
                    log_path: None,
                });
            }
        }

        Ok(BuildReport {
            entries,
            cancelled_by_user: self.cancel.is_cancelled(),
            elapsed: started.elapsed(),
        })
    }

    /// A dependency reached a terminal state usable by dependents:
    /// unblock them, readying any that hit zero
    #[allow(clippy::too_many_arguments)]
    fn release_dependents(
        &self,
        done: TaskId,
        set: &ExecutionSet,
        dependents: &HashMap<TaskId, Vec<TaskId>>,
        blocking: &mut HashMap<TaskId, usize>,
        ready: &mut BTreeMap<Arc<str>, TaskId>,
        states: &HashMap<TaskId, TaskState>,
    ) {
        for dependent in dependents.get(&done).into_iter().flatten() {
            let remaining = blocking.entry(*dependent).or_insert(0);
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 && states[dependent] == TaskState::Queued {
                ready.insert(Arc::clone(&set.unit(*dependent).path), *dependent);
            }
        }
    }

    /// Fatal failure: transitively cancel everything downstream
    fn cancel_downstream(
        &self,
        failed: TaskId,
        set: &ExecutionSet,
        dependents: &HashMap<TaskId, Vec<TaskId>>,
        states: &mut HashMap<TaskId, TaskState>,
        ready: &mut BTreeMap<Arc<str>, TaskId>,
        entries: &mut Vec<TaskReport>,
    ) {
        let failed_path = Arc::clone(&set.unit(failed).path);
        let mut queue: Vec<TaskId> = vec![failed];
        let mut seen: HashSet<TaskId> = HashSet::new();

        while let Some(current) = queue.pop() {
            for dependent in dependents.get(&current).into_iter().flatten() {
                if !seen.insert(*dependent) {
                    continue;
                }
                if states[dependent].is_terminal() {
                    continue;
                }
                let path = Arc::clone(&set.unit(*dependent).path);
                debug!(task = %path, upstream = %failed_path, "cancelled by upstream failure");
                states.insert(*dependent, TaskState::Cancelled);
                ready.remove(&path);
                let mut failure = TaskFailure::new(
                    path.to_string(),
                    FailureKind::Input,
                    "cancelled by upstream failure",
                );
                failure.upstream = Some(failed_path.to_string());
                entries.push(TaskReport {
                    path,
                    status: TaskStatus::Cancelled,
                    duration: Duration::ZERO,
                    failure: Some(failure),
                    log_path: None,
                });
                queue.push(*dependent);
            }
        }
    }
}

// ============================================================================
// WORKER
// ============================================================================

/// Run one task: up-to-date check, actions in order, fingerprinting
#[instrument(skip_all, fields(task = %unit.path))]
async fn run_task(
    unit: TaskUnit,
    upstream: Option<Arc<str>>,
    store: Arc<FingerprintStore>,
    cancel: CancelToken,
    settings: Settings,
) -> TaskRun {
    let started = Instant::now();
    let done = |status: RunStatus, log_path: Option<PathBuf>| TaskRun {
        id: unit.id,
        path: Arc::clone(&unit.path),
        status,
        duration: started.elapsed(),
        log_path,
    };

    if cancel.is_cancelled() {
        return done(RunStatus::Cancelled, None);
    }

    // Up-to-date check on a blocking thread: it hashes files
    if !settings.force_rerun {
        let check_unit = unit.clone();
        let check_store = Arc::clone(&store);
        let up_to_date = tokio::task::spawn_blocking(move || check_unit.is_up_to_date(&check_store))
            .await
            .unwrap_or(false);
        if up_to_date {
            info!(task = %unit.path, "up to date");
            return done(RunStatus::Skipped, None);
        }
    }

    // Declared inputs must exist before any action runs
    for input in &unit.inputs {
        if !input.exists() {
            let mut failure = TaskFailure::new(
                unit.path.to_string(),
                FailureKind::Input,
                format!("declared input '{}' does not exist", input.display()),
            );
            failure.upstream = upstream.as_ref().map(|p| p.to_string());
            return done(RunStatus::Failed(failure), None);
        }
    }

    let log_path = settings
        .log_dir()
        .join(format!("{}.log", encode_task_path(&unit.path)));
    let mut log = TaskLog::create(&log_path);

    let watched = snapshot_output_dirs(&unit.outputs);

    let deadline = unit.deadline.map(|d| tokio::time::Instant::now() + d);
    let env = ActionEnv {
        task_path: Arc::clone(&unit.path),
        project_dir: unit.project_dir.clone(),
        build_dir: settings.build_dir.clone(),
        cancel: cancel.clone(),
        deadline,
    };

    info!(task = %unit.path, actions = unit.actions.len(), "running");
    for (index, action) in unit.actions.iter().enumerate() {
        if cancel.is_cancelled() {
            log.line(&format!("-- cancelled before action {}", index + 1));
            return done(RunStatus::Cancelled, Some(log_path));
        }
        if deadline.is_some_and(|at| tokio::time::Instant::now() >= at) {
            log.line("-- deadline exceeded");
            let failure = TaskFailure::new(
                unit.path.to_string(),
                FailureKind::Deadline,
                format!("task '{}' exceeded its deadline", unit.path),
            );
            return done(RunStatus::Failed(failure), Some(log_path));
        }

        log.line(&format!("-- action {}: {:?}", index + 1, action));
        match action.run(&env).await {
            Ok(output) => {
                log.chunk(&output.stdout);
                log.chunk(&output.stderr);
            }
            Err(KilnError::Cancelled) => {
                log.line("-- cancelled");
                return done(RunStatus::Cancelled, Some(log_path));
            }
            Err(e) => {
                log.line(&format!("-- failed: {}", e));
                let kind = match &e {
                    KilnError::Input(_) => FailureKind::Input,
                    KilnError::Exec(crate::error::ExecError::DeadlineExceeded { .. }) => {
                        FailureKind::Deadline
                    }
                    _ => FailureKind::Action,
                };
                let mut failure = TaskFailure::new(unit.path.to_string(), kind, e.to_string());
                failure.upstream = upstream.as_ref().map(|p| p.to_string());
                return done(RunStatus::Failed(failure), Some(log_path));
            }
        }
    }

    // Success: persist a fresh fingerprint record
    let record_unit = unit.clone();
    let duration_ms = started.elapsed().as_millis() as u64;
    let record = tokio::task::spawn_blocking(move || build_record(&record_unit, duration_ms)).await;
    match record {
        Ok(Ok(record)) => store.save(&unit.path, &record),
        Ok(Err(e)) => {
            warn!(task = %unit.path, error = %e, "could not fingerprint results; task will rerun next time")
        }
        Err(e) => warn!(task = %unit.path, error = %e, "fingerprint worker panicked"),
    }

    warn_undeclared_outputs(&unit, &watched);

    done(RunStatus::Succeeded, Some(log_path))
}

/// Digest current inputs and outputs into a fingerprint record.
///
/// Declared files that are missing are simply left out of the record,
/// which makes the task rerun next time.
fn build_record(unit: &TaskUnit, duration_ms: u64) -> Result<FingerprintRecord, KilnError> {
    let digest_all = |paths: &[PathBuf]| -> Result<Vec<_>, KilnError> {
        let mut entries = Vec::with_capacity(paths.len());
        for path in paths {
            if let Some(digest) = digest::hash_file(path)? {
                entries.push((path.clone(), digest));
            } else {
                warn!(path = %path.display(), "declared file missing after task succeeded");
            }
        }
        Ok(entries)
    };

    Ok(FingerprintRecord {
        task_hash: unit.task_hash,
        inputs: digest_all(&unit.inputs)?,
        outputs: digest_all(&unit.outputs)?,
        duration_ms,
        completed_at_ms: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0),
    })
}

/// Files present in the declared output directories before the task ran
fn snapshot_output_dirs(outputs: &[PathBuf]) -> HashSet<PathBuf> {
    let dirs: HashSet<&std::path::Path> = outputs.iter().filter_map(|p| p.parent()).collect();
    let mut seen = HashSet::new();
    for dir in dirs {
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                    seen.insert(entry.path());
                }
            }
        }
    }
    seen
}

/// Warn (never fail) about files a task produced without declaring
fn warn_undeclared_outputs(unit: &TaskUnit, before: &HashSet<PathBuf>) {
    let declared: HashSet<&PathBuf> = unit.outputs.iter().collect();
    for path in snapshot_output_dirs(&unit.outputs) {
        if !before.contains(&path) && !declared.contains(&path) {
            warn!(
                task = %unit.path,
                file = %path.display(),
                "task produced an undeclared output"
            );
        }
    }
}

// ============================================================================
// TASK LOG
// ============================================================================

/// Append-only per-task log file; IO failures degrade to warnings
struct TaskLog {
    file: Option<std::fs::File>,
}

impl TaskLog {
    fn create(path: &std::path::Path) -> Self {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let file = match std::fs::File::create(path) {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot create task log");
                None
            }
        };
        Self { file }
    }

    fn line(&mut self, text: &str) {
        self.chunk(&format!("{}\n", text));
    }

    fn chunk(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(file) = &mut self.file {
            use std::io::Write;
            let _ = file.write_all(text.as_bytes());
        }
    }
}
