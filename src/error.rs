//! # Kiln Error Module
//!
//! Unified error handling with fix hints for the Kiln CLI.
//!
//! Errors are layered by the phase that produced them:
//!
//! - `ConfigError`: everything reportable before execution begins
//!   (bad selectors, type mismatches, cycles) — exit code 1
//! - `InputError`: missing or unreadable declared inputs — attributed
//!   to the owning task, exit code 2
//! - `ExecError`: action failures (non-zero exit, callable raised,
//!   write failure) — attributed to the owning task, exit code 2
//! - `StoreError`: fingerprint store problems — demoted to warnings
//!   at the call site and never fatal on their own
//!
//! The `Hint` trait is the fix-suggestion surface the CLI prints under
//! each error.

use std::path::PathBuf;

use thiserror::Error;

// ============================================================================
// HINT TRAIT
// ============================================================================

/// Trait for errors that can suggest a fix to the user
pub trait Hint {
    /// Get a fix hint for this error, if available
    fn hint(&self) -> Option<&str>;
}

// ============================================================================
// TOP-LEVEL ERROR
// ============================================================================

/// Top-level error type for the Kiln library and CLI
#[derive(Error, Debug)]
pub enum KilnError {
    /// Configuration-phase error
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// Declared-input error, attributed to a task
    #[error("{0}")]
    Input(#[from] InputError),

    /// Action execution error, attributed to a task
    #[error("{0}")]
    Exec(#[from] ExecError),

    /// Fingerprint store error
    #[error("{0}")]
    Store(#[from] StoreError),

    /// Build was cancelled before completion
    #[error("build cancelled")]
    Cancelled,

    /// IO error (file not found, permission denied, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invariant violation inside the engine
    #[error("internal error: {0}")]
    Internal(String),
}

impl KilnError {
    /// Create an internal error with a message
    pub fn internal(msg: impl Into<String>) -> Self {
        KilnError::Internal(msg.into())
    }

    /// Process exit code for this error when it aborts the build
    pub fn exit_code(&self) -> i32 {
        match self {
            KilnError::Config(_) => 1,
            KilnError::Cancelled => 3,
            _ => 2,
        }
    }

    /// True for errors reported before any action runs
    pub fn is_configuration(&self) -> bool {
        matches!(self, KilnError::Config(_))
    }
}

impl Hint for KilnError {
    fn hint(&self) -> Option<&str> {
        match self {
            KilnError::Config(e) => e.hint(),
            KilnError::Input(e) => e.hint(),
            KilnError::Exec(e) => e.hint(),
            KilnError::Store(_) => {
                Some("delete the fingerprint directory to reset incremental state")
            }
            KilnError::Cancelled => None,
            KilnError::Io(_) => Some("check that the path exists and has correct permissions"),
            KilnError::Internal(_) => {
                Some("this is a bug in kiln; re-run with RUST_LOG=debug and report it")
            }
        }
    }
}

// ============================================================================
// CONFIGURATION ERRORS
// ============================================================================

/// Errors detected while the task graph is being configured
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid name '{name}': names must start with a letter and use only letters, digits, '-' or '_'")]
    InvalidName { name: String },

    #[error("duplicate task '{name}' in project '{project}'")]
    DuplicateTask { project: String, name: String },

    #[error("duplicate project '{name}' under '{parent}'")]
    DuplicateProject { parent: String, name: String },

    #[error("unknown selector '{selector}'{}", render_candidates(.candidates))]
    UnknownSelector {
        selector: String,
        candidates: Vec<String>,
    },

    #[error("unknown project '{path}' in selector '{selector}'")]
    UnknownProject { selector: String, path: String },

    #[error("property '{property}' on task '{task}': expected {expected}, got {actual}")]
    TypeMismatch {
        task: String,
        property: String,
        expected: String,
        actual: String,
    },

    #[error("required property '{property}' on task '{task}' is not set")]
    MissingProperty { task: String, property: String },

    #[error("cyclic property reference: {}", .chain.join(" -> "))]
    CyclicProperty { chain: Vec<String> },

    #[error("cyclic task dependency: {}", .chain.join(" -> "))]
    CyclicTasks { chain: Vec<String> },

    #[error("task set is frozen: {what} cannot be modified after prepare_execution")]
    Frozen { what: String },

    #[error("unknown plugin '{name}'")]
    UnknownPlugin { name: String },

    #[error("no default tasks defined and no selectors given")]
    NoDefaultTasks,

    #[error("manifest error: {0}")]
    Manifest(String),
}

fn render_candidates(candidates: &[String]) -> String {
    if candidates.is_empty() {
        String::new()
    } else {
        format!(" (did you mean {}?)", candidates.join(", "))
    }
}

impl Hint for ConfigError {
    fn hint(&self) -> Option<&str> {
        Some(match self {
            ConfigError::InvalidName { .. } => {
                "rename the task or project to match [A-Za-z][A-Za-z0-9_-]*"
            }
            ConfigError::DuplicateTask { .. } => "task names must be unique within a project",
            ConfigError::DuplicateProject { .. } => {
                "project names must be unique under their parent"
            }
            ConfigError::UnknownSelector { .. } => {
                "selectors look like ':project:task'; omit the leading colon for a relative name"
            }
            ConfigError::UnknownProject { .. } => {
                "check the project segments of the selector against the project tree"
            }
            ConfigError::TypeMismatch { .. } => "set a value matching the declared property type",
            ConfigError::MissingProperty { .. } => {
                "set the property before executing, or remove the code that reads it"
            }
            ConfigError::CyclicProperty { .. } => {
                "break the cycle: a property cannot (transitively) read itself"
            }
            ConfigError::CyclicTasks { .. } => {
                "remove one of the dependency edges in the reported chain"
            }
            ConfigError::Frozen { .. } => "configure tasks before calling execute()",
            ConfigError::UnknownPlugin { .. } => {
                "register the plugin on the Context before applying it"
            }
            ConfigError::NoDefaultTasks => {
                "pass a task selector, or mark a task as default in the manifest"
            }
            ConfigError::Manifest(_) => return None,
        })
    }
}

// ============================================================================
// INPUT ERRORS
// ============================================================================

/// Errors about a task's declared input files
#[derive(Error, Debug)]
pub enum InputError {
    #[error("task '{task}': declared input '{}' does not exist", .path.display())]
    MissingInput { task: String, path: PathBuf },

    #[error("glob base directory '{}' does not exist", .base.display())]
    MissingBase { base: PathBuf },

    #[error("glob pattern '{pattern}' matched no files")]
    EmptyGlob { pattern: String },

    #[error("invalid glob pattern '{pattern}': {detail}")]
    BadPattern { pattern: String, detail: String },

    #[error("failed to read '{}' during glob expansion: {detail}", .path.display())]
    GlobIo { path: PathBuf, detail: String },

    #[error("task '{task}': input '{}' is unreadable: {detail}", .path.display())]
    Unreadable {
        task: String,
        path: PathBuf,
        detail: String,
    },
}

impl Hint for InputError {
    fn hint(&self) -> Option<&str> {
        Some(match self {
            InputError::MissingInput { .. } => {
                "check the spelling, or add a dependency on the task that produces it"
            }
            InputError::MissingBase { .. } => "create the directory or fix the fileset base",
            InputError::EmptyGlob { .. } => {
                "relax the pattern, or allow empty matches on this fileset"
            }
            InputError::BadPattern { .. } => {
                "see the glob syntax: *, **, ? and [..] character classes"
            }
            InputError::GlobIo { .. } | InputError::Unreadable { .. } => "check file permissions",
        })
    }
}

// ============================================================================
// EXECUTION ERRORS
// ============================================================================

/// Errors raised while a task's actions run
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("failed to spawn '{argv0}': {detail}")]
    Spawn { argv0: String, detail: String },

    #[error("command '{argv0}' exited with code {code}")]
    CommandFailed { argv0: String, code: i32 },

    #[error("command '{argv0}' was terminated by a signal")]
    CommandKilled { argv0: String },

    #[error("callable '{name}' failed: {message}")]
    CallableFailed { name: String, message: String },

    #[error("failed to write '{}': {detail}", .path.display())]
    WriteFailed { path: PathBuf, detail: String },

    #[error("task '{task}' exceeded its deadline")]
    DeadlineExceeded { task: String },
}

impl Hint for ExecError {
    fn hint(&self) -> Option<&str> {
        match self {
            ExecError::Spawn { .. } => Some("check that the executable is installed and on PATH"),
            ExecError::CommandFailed { .. } => Some("the full command output is in the task log"),
            ExecError::WriteFailed { .. } => {
                Some("check directory permissions and free disk space")
            }
            _ => None,
        }
    }
}

// ============================================================================
// STORE ERRORS
// ============================================================================

/// Fingerprint store problems. Callers demote these to warnings and
/// treat the affected task as having no prior record.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("corrupt fingerprint record '{}': {detail}", .path.display())]
    Corrupt { path: PathBuf, detail: String },

    #[error("fingerprint store IO failure at '{}': {detail}", .path.display())]
    Io { path: PathBuf, detail: String },
}

// ============================================================================
// TASK FAILURE RECORD
// ============================================================================

/// What kind of failure took a task down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// A declared input was missing or unreadable
    Input,
    /// An action failed (process exit, callable error, write failure)
    Action,
    /// The task's deadline elapsed
    Deadline,
}

/// Boundary record handed from a failed task to the scheduler.
///
/// Errors raised inside actions are caught at the task boundary and
/// converted to this; the scheduler decides downstream cancellation
/// from the owning task's failure policy.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub task: String,
    pub kind: FailureKind,
    pub message: String,
    /// Task path of the upstream failure this one is blamed on, if any
    pub upstream: Option<String>,
}

impl TaskFailure {
    pub fn new(task: impl Into<String>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            kind,
            message: message.into(),
            upstream: None,
        }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.task, self.message)?;
        if let Some(up) = &self.upstream {
            write!(f, " (upstream failure: {})", up)?;
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
