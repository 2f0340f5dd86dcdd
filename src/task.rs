//! Task model: a named, property-bearing node in the build DAG
//!
//! A task carries a property table, an action sequence, explicit
//! dependencies and scheduling flags. Its derived input set is the
//! union of the declared `inputs` property, files produced by tasks
//! referenced through property lineage, and explicit dependencies'
//! outputs; its output set is the `outputs` property.
//!
//! Configuration-time tasks live in the Context's arena and are
//! addressed by `TaskId`. `prepare_execution` bakes each selected task
//! into an immutable [`TaskUnit`], the only shape the scheduler sees.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest as _, Sha256};
use tracing::debug;

use crate::action::Action;
use crate::digest::{self, Digest};
use crate::project::ProjectId;
use crate::property::PropertyId;
use crate::store::FingerprintStore;

/// Name of the well-known declared-inputs property
pub const INPUTS_PROPERTY: &str = "inputs";
/// Name of the well-known declared-outputs property
pub const OUTPUTS_PROPERTY: &str = "outputs";

// ============================================================================
// IDENTITY, STATES, POLICY
// ============================================================================

/// Handle to a task in the Context arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u32);

/// One-way task lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Unconfigured,
    Configured,
    Queued,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Skipped | TaskState::Cancelled
        )
    }

    /// Terminal and usable by dependents
    pub fn is_success(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Skipped)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskState::Unconfigured => "unconfigured",
            TaskState::Configured => "configured",
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Skipped => "skipped",
            TaskState::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// How a task's failure affects its dependents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Dependents are cancelled (the default)
    #[default]
    Fatal,
    /// Dependents still run and observe the failure
    Continue,
}

// ============================================================================
// CONFIGURATION-TIME TASK
// ============================================================================

/// A task as configured in the Context arena
pub struct Task {
    pub id: TaskId,
    pub project: ProjectId,
    pub name: Arc<str>,
    /// Fully-qualified path, e.g. `:app:compile`
    pub path: Arc<str>,
    /// Interned type tag, e.g. `write-file`, `compile`, `run`
    pub kind: Arc<str>,
    pub(crate) properties: BTreeMap<String, PropertyId>,
    pub(crate) explicit_deps: Vec<TaskId>,
    /// Implicit edges derived from property lineage at prepare time
    pub(crate) implicit_deps: Vec<TaskId>,
    pub(crate) actions: Vec<Action>,
    /// Run when no selection is given
    pub default: bool,
    /// Skip the up-to-date check entirely
    pub always_outdated: bool,
    pub failure_policy: FailurePolicy,
    /// Tool version tags folded into the task hash
    pub tool_versions: Vec<String>,
    /// Best-effort per-task wall-clock deadline
    pub deadline: Option<Duration>,
    pub(crate) state: TaskState,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        project: ProjectId,
        name: Arc<str>,
        path: Arc<str>,
        kind: Arc<str>,
    ) -> Self {
        Self {
            id,
            project,
            name,
            path,
            kind,
            properties: BTreeMap::new(),
            explicit_deps: Vec::new(),
            implicit_deps: Vec::new(),
            actions: Vec::new(),
            default: false,
            always_outdated: false,
            failure_policy: FailurePolicy::default(),
            tool_versions: Vec::new(),
            deadline: None,
            state: TaskState::Unconfigured,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Explicit and implicit dependencies, deduplicated
    pub fn dependencies(&self) -> Vec<TaskId> {
        let mut deps = self.explicit_deps.clone();
        deps.extend_from_slice(&self.implicit_deps);
        deps.sort_unstable();
        deps.dedup();
        deps
    }

    pub fn property_id(&self, name: &str) -> Option<PropertyId> {
        self.properties.get(name).copied()
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }
}

// ============================================================================
// TASK HASH
// ============================================================================

/// Hash identifying the *definition* of a task: its serialized action
/// sequence, sorted input and output path lists, and tool version
/// tags. Input *content* is tracked per file in the record instead.
pub fn compute_task_hash(
    actions: &[Action],
    inputs: &[PathBuf],
    outputs: &[PathBuf],
    tool_versions: &[String],
) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(b"kiln-task-v1");

    let mut feed = |bytes: &[u8]| {
        hasher.update((bytes.len() as u64).to_be_bytes());
        hasher.update(bytes);
    };

    for action in actions {
        feed(action.fingerprint_text().as_bytes());
    }

    let mut sorted_inputs: Vec<String> = inputs
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    sorted_inputs.sort();
    for path in &sorted_inputs {
        feed(path.as_bytes());
    }

    let mut sorted_outputs: Vec<String> = outputs
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    sorted_outputs.sort();
    for path in &sorted_outputs {
        feed(path.as_bytes());
    }

    for tag in tool_versions {
        feed(tag.as_bytes());
    }

    Digest::from_bytes(hasher.finalize().into())
}

// ============================================================================
// EXECUTABLE UNIT
// ============================================================================

/// Immutable, baked form of a task handed to the scheduler.
///
/// All paths are normalized and absolute; properties are already
/// evaluated away. Cloning is cheap apart from the path lists.
#[derive(Debug, Clone)]
pub struct TaskUnit {
    pub id: TaskId,
    pub path: Arc<str>,
    pub kind: Arc<str>,
    pub actions: Vec<Action>,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub deps: Vec<TaskId>,
    pub task_hash: Digest,
    pub always_outdated: bool,
    pub failure_policy: FailurePolicy,
    pub deadline: Option<Duration>,
    pub project_dir: PathBuf,
}

impl TaskUnit {
    /// Fingerprint-based up-to-date check, in order:
    ///
    /// 1. `always_outdated` tasks are never up to date
    /// 2. no stored record means not up to date
    /// 3. the stored task hash must match
    /// 4. every current input must hash to its stored digest
    /// 5. every declared output must exist with its stored digest
    ///
    /// Unreadable files count as mismatches; the real error surfaces
    /// when the task actually runs.
    pub fn is_up_to_date(&self, store: &FingerprintStore) -> bool {
        if self.always_outdated {
            return false;
        }

        let record = match store.load(&self.path) {
            Some(record) => record,
            None => return false,
        };

        if record.task_hash != self.task_hash {
            debug!(task = %self.path, "task hash changed");
            return false;
        }

        for input in &self.inputs {
            let stored = match record.input_digest(input) {
                Some(digest) => digest,
                None => {
                    debug!(task = %self.path, input = %input.display(), "input not in record");
                    return false;
                }
            };
            match digest::hash_file(input) {
                Ok(Some(current)) if current == *stored => {}
                _ => {
                    debug!(task = %self.path, input = %input.display(), "input digest changed");
                    return false;
                }
            }
        }

        for output in &self.outputs {
            let stored = match record.output_digest(output) {
                Some(digest) => digest,
                None => return false,
            };
            match digest::hash_file(output) {
                Ok(Some(current)) if current == *stored => {}
                _ => {
                    debug!(task = %self.path, output = %output.display(), "output missing or changed");
                    return false;
                }
            }
        }

        true
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FingerprintRecord;
    use std::fs;

    fn unit_for(dir: &std::path::Path, inputs: Vec<PathBuf>, outputs: Vec<PathBuf>) -> TaskUnit {
        let actions = vec![Action::write_file(dir.join("out.txt"), "x")];
        let task_hash = compute_task_hash(&actions, &inputs, &outputs, &[]);
        TaskUnit {
            id: TaskId(0),
            path: Arc::from(":t"),
            kind: Arc::from("write-file"),
            actions,
            inputs,
            outputs,
            deps: Vec::new(),
            task_hash,
            always_outdated: false,
            failure_policy: FailurePolicy::Fatal,
            deadline: None,
            project_dir: dir.to_path_buf(),
        }
    }

    fn record_for(unit: &TaskUnit) -> FingerprintRecord {
        let digest_of = |p: &PathBuf| digest::hash_file(p).unwrap().unwrap();
        FingerprintRecord {
            task_hash: unit.task_hash,
            inputs: unit.inputs.iter().map(|p| (p.clone(), digest_of(p))).collect(),
            outputs: unit.outputs.iter().map(|p| (p.clone(), digest_of(p))).collect(),
            duration_ms: 5,
            completed_at_ms: 0,
        }
    }

    #[test]
    fn task_hash_depends_on_actions_and_paths() {
        let actions_a = vec![Action::write_file("out.txt", "one")];
        let actions_b = vec![Action::write_file("out.txt", "two")];
        let inputs = vec![PathBuf::from("/in.txt")];
        let outputs = vec![PathBuf::from("/out.txt")];

        let base = compute_task_hash(&actions_a, &inputs, &outputs, &[]);
        assert_eq!(base, compute_task_hash(&actions_a, &inputs, &outputs, &[]));
        assert_ne!(base, compute_task_hash(&actions_b, &inputs, &outputs, &[]));
        assert_ne!(base, compute_task_hash(&actions_a, &[], &outputs, &[]));
        assert_ne!(
            base,
            compute_task_hash(&actions_a, &inputs, &outputs, &["gcc-13".to_string()])
        );
    }

    #[test]
    fn task_hash_ignores_input_order() {
        let a = PathBuf::from("/a");
        let b = PathBuf::from("/b");
        let one = compute_task_hash(&[], &[a.clone(), b.clone()], &[], &[]);
        let two = compute_task_hash(&[], &[b, a], &[], &[]);
        assert_eq!(one, two);
    }

    #[test]
    fn no_record_means_outdated() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FingerprintStore::open(&tmp.path().join("build"));
        let unit = unit_for(tmp.path(), vec![], vec![]);
        assert!(!unit.is_up_to_date(&store));
    }

    #[test]
    fn matching_record_means_up_to_date() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FingerprintStore::open(&tmp.path().join("build"));

        let input = tmp.path().join("in.txt");
        let output = tmp.path().join("out.txt");
        fs::write(&input, "source").unwrap();
        fs::write(&output, "object").unwrap();

        let unit = unit_for(tmp.path(), vec![input], vec![output]);
        store.save(&unit.path, &record_for(&unit));
        assert!(unit.is_up_to_date(&store));
    }

    #[test]
    fn changed_input_invalidates() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FingerprintStore::open(&tmp.path().join("build"));

        let input = tmp.path().join("in.txt");
        fs::write(&input, "source").unwrap();
        let unit = unit_for(tmp.path(), vec![input.clone()], vec![]);
        store.save(&unit.path, &record_for(&unit));

        fs::write(&input, "edited").unwrap();
        assert!(!unit.is_up_to_date(&store));
    }

    #[test]
    fn missing_output_invalidates() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FingerprintStore::open(&tmp.path().join("build"));

        let output = tmp.path().join("out.txt");
        fs::write(&output, "object").unwrap();
        let unit = unit_for(tmp.path(), vec![], vec![output.clone()]);
        store.save(&unit.path, &record_for(&unit));

        fs::remove_file(&output).unwrap();
        assert!(!unit.is_up_to_date(&store));
    }

    #[test]
    fn always_outdated_wins_over_matching_record() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FingerprintStore::open(&tmp.path().join("build"));

        let mut unit = unit_for(tmp.path(), vec![], vec![]);
        store.save(&unit.path, &record_for(&unit));
        assert!(unit.is_up_to_date(&store));

        unit.always_outdated = true;
        assert!(!unit.is_up_to_date(&store));
    }

    #[test]
    fn dependencies_merge_and_dedup() {
        let mut task = Task::new(
            TaskId(0),
            ProjectId(0),
            Arc::from("t"),
            Arc::from(":t"),
            Arc::from("run"),
        );
        task.explicit_deps = vec![TaskId(2), TaskId(1)];
        task.implicit_deps = vec![TaskId(1), TaskId(3)];
        assert_eq!(task.dependencies(), vec![TaskId(1), TaskId(2), TaskId(3)]);
    }
}
