//! Action primitives: the work units inside a task
//!
//! Three core kinds plus an extension trait:
//!
//! - `WriteFile`: atomic text write (temp + rename)
//! - `Execute`: spawn a child process, surface its exit code
//! - `Callable`: invoke an in-process function with a structured record
//! - `Custom`: anything implementing [`TaskWork`]
//!
//! Actions run strictly in declaration order on one worker; the first
//! failure aborts the task's remaining actions. An action never
//! mutates another task's state.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::config::KILL_GRACE;
use crate::error::{ExecError, KilnError};

// ============================================================================
// DEFINITIONS
// ============================================================================

/// Where a child process's output goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Captured and appended to the task log
    #[default]
    Capture,
    /// Inherited from the build console
    Console,
}

/// Atomic text write. Inputs: none. Outputs: the target path.
#[derive(Debug, Clone)]
pub struct WriteFileDef {
    pub path: PathBuf,
    pub text: String,
}

/// Child process invocation. Input and output files are declared by
/// the owning task, not here.
#[derive(Debug, Clone)]
pub struct ExecuteDef {
    pub argv: Vec<String>,
    /// Defaults to the owning project's directory
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub stdin: Option<String>,
    pub output: OutputMode,
}

/// In-process function invocation with a structured argument record.
/// Callables report failures as `anyhow` errors; the engine converts
/// them to task failures at the action boundary.
pub type CallableFn = Arc<dyn Fn(&CallableArgs) -> anyhow::Result<String> + Send + Sync>;

/// Arguments handed to a callable. The record is baked during
/// configuration; callables never read live task properties.
#[derive(Debug, Clone)]
pub struct CallableArgs {
    pub args: serde_json::Value,
    pub task_path: Arc<str>,
    pub project_dir: PathBuf,
    pub build_dir: PathBuf,
}

#[derive(Clone)]
pub struct CallableDef {
    pub name: String,
    pub args: serde_json::Value,
    pub func: CallableFn,
}

impl fmt::Debug for CallableDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallableDef")
            .field("name", &self.name)
            .field("args", &self.args)
            .finish()
    }
}

/// Extension point for plugin-contributed action kinds
pub trait TaskWork: Send + Sync {
    /// Stable identifier, included in the owning task's hash
    fn name(&self) -> &str;

    fn declared_inputs(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    fn declared_outputs(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Do the work; the returned text is appended to the task log
    fn run(&self, env: &ActionEnv) -> anyhow::Result<String>;
}

/// A primitive work unit inside a task
#[derive(Clone)]
pub enum Action {
    WriteFile(WriteFileDef),
    Execute(ExecuteDef),
    Callable(CallableDef),
    Custom(Arc<dyn TaskWork>),
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::WriteFile(d) => f.debug_tuple("WriteFile").field(&d.path).finish(),
            Action::Execute(d) => f.debug_tuple("Execute").field(&d.argv).finish(),
            Action::Callable(d) => f.debug_tuple("Callable").field(&d.name).finish(),
            Action::Custom(w) => f.debug_tuple("Custom").field(&w.name()).finish(),
        }
    }
}

// ============================================================================
// CONSTRUCTION HELPERS
// ============================================================================

impl Action {
    pub fn write_file(path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        Action::WriteFile(WriteFileDef {
            path: path.into(),
            text: text.into(),
        })
    }

    pub fn execute<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Action::Execute(ExecuteDef {
            argv: argv.into_iter().map(Into::into).collect(),
            cwd: None,
            env: BTreeMap::new(),
            stdin: None,
            output: OutputMode::Capture,
        })
    }

    pub fn callable(
        name: impl Into<String>,
        args: serde_json::Value,
        func: CallableFn,
    ) -> Self {
        Action::Callable(CallableDef {
            name: name.into(),
            args,
            func,
        })
    }

    /// Files this action reads on its own account
    pub fn declared_inputs(&self) -> Vec<PathBuf> {
        match self {
            Action::Custom(work) => work.declared_inputs(),
            _ => Vec::new(),
        }
    }

    /// Files this action produces on its own account
    pub fn declared_outputs(&self) -> Vec<PathBuf> {
        match self {
            Action::WriteFile(d) => vec![d.path.clone()],
            Action::Custom(work) => work.declared_outputs(),
            _ => Vec::new(),
        }
    }

    /// Stable descriptor for the owning task's hash. Callables and
    /// custom work hash by name + argument record, never by code.
    pub fn fingerprint_text(&self) -> String {
        let descriptor = match self {
            Action::WriteFile(d) => serde_json::json!({
                "kind": "write-file",
                "path": d.path.to_string_lossy(),
                "text": d.text,
            }),
            Action::Execute(d) => serde_json::json!({
                "kind": "execute",
                "argv": d.argv,
                "cwd": d.cwd.as_ref().map(|p| p.to_string_lossy().into_owned()),
                "env": d.env,
                "stdin": d.stdin,
            }),
            Action::Callable(d) => serde_json::json!({
                "kind": "callable",
                "name": d.name,
                "args": d.args,
            }),
            Action::Custom(work) => serde_json::json!({
                "kind": "custom",
                "name": work.name(),
                "inputs": work
                    .declared_inputs()
                    .iter()
                    .map(|p| p.to_string_lossy().into_owned())
                    .collect::<Vec<_>>(),
                "outputs": work
                    .declared_outputs()
                    .iter()
                    .map(|p| p.to_string_lossy().into_owned())
                    .collect::<Vec<_>>(),
            }),
        };
        descriptor.to_string()
    }

    /// Resolve relative paths against the owning project directory
    pub(crate) fn rebase(&mut self, project_dir: &Path) {
        match self {
            Action::WriteFile(d) => {
                d.path = crate::paths::resolve_in(project_dir, &d.path);
            }
            Action::Execute(d) => {
                if let Some(cwd) = &d.cwd {
                    d.cwd = Some(crate::paths::resolve_in(project_dir, cwd));
                }
            }
            Action::Callable(_) | Action::Custom(_) => {}
        }
    }
}

// ============================================================================
// EXECUTION
// ============================================================================

/// Execution environment handed to each action by the scheduler
#[derive(Clone)]
pub struct ActionEnv {
    pub task_path: Arc<str>,
    pub project_dir: PathBuf,
    pub build_dir: PathBuf,
    pub cancel: CancelToken,
    /// Absolute deadline for the owning task, if one was attached
    pub deadline: Option<tokio::time::Instant>,
}

/// Captured output of one action
#[derive(Debug, Default)]
pub struct ActionOutput {
    pub stdout: String,
    pub stderr: String,
}

impl Action {
    /// Run this action to completion or failure.
    ///
    /// Cancellation and deadlines interrupt `Execute` mid-flight
    /// (terminate, then kill after a grace period); other kinds run to
    /// completion and the boundary check happens between actions.
    pub async fn run(&self, env: &ActionEnv) -> Result<ActionOutput, KilnError> {
        match self {
            Action::WriteFile(d) => run_write_file(d).await,
            Action::Execute(d) => run_execute(d, env).await,
            Action::Callable(d) => {
                debug!(task = %env.task_path, callable = %d.name, "invoking callable");
                let args = CallableArgs {
                    args: d.args.clone(),
                    task_path: Arc::clone(&env.task_path),
                    project_dir: env.project_dir.clone(),
                    build_dir: env.build_dir.clone(),
                };
                let text = (d.func)(&args).map_err(|e| ExecError::CallableFailed {
                    name: d.name.clone(),
                    message: e.to_string(),
                })?;
                Ok(ActionOutput {
                    stdout: text,
                    stderr: String::new(),
                })
            }
            Action::Custom(work) => {
                debug!(task = %env.task_path, work = %work.name(), "running custom work");
                let text = work.run(env).map_err(|e| ExecError::CallableFailed {
                    name: work.name().to_string(),
                    message: e.to_string(),
                })?;
                Ok(ActionOutput {
                    stdout: text,
                    stderr: String::new(),
                })
            }
        }
    }
}

async fn run_write_file(def: &WriteFileDef) -> Result<ActionOutput, KilnError> {
    let def = def.clone();
    tokio::task::spawn_blocking(move || write_atomic(&def.path, def.text.as_bytes()))
        .await
        .map_err(|e| KilnError::internal(format!("write-file worker panicked: {}", e)))??;
    Ok(ActionOutput::default())
}

/// Write via a sibling temp file and rename, so readers never observe
/// a half-written target.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), KilnError> {
    let failed = |detail: String| ExecError::WriteFailed {
        path: path.to_path_buf(),
        detail,
    };

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| failed(e.to_string()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| failed(e.to_string()))?;
    std::io::Write::write_all(&mut tmp, bytes).map_err(|e| failed(e.to_string()))?;
    tmp.persist(path)
        .map_err(|e| failed(e.error.to_string()))?;
    Ok(())
}

async fn run_execute(def: &ExecuteDef, env: &ActionEnv) -> Result<ActionOutput, KilnError> {
    let argv0 = def
        .argv
        .first()
        .cloned()
        .ok_or_else(|| KilnError::internal("execute action with empty argv"))?;

    debug!(task = %env.task_path, argv0 = %argv0, "spawning command");

    let mut cmd = tokio::process::Command::new(&argv0);
    cmd.args(&def.argv[1..]);
    cmd.current_dir(def.cwd.as_deref().unwrap_or(&env.project_dir));
    cmd.envs(&def.env);
    cmd.kill_on_drop(true);
    if def.stdin.is_some() {
        cmd.stdin(std::process::Stdio::piped());
    } else {
        cmd.stdin(std::process::Stdio::null());
    }
    if def.output == OutputMode::Capture {
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
    }

    let mut child = cmd.spawn().map_err(|e| ExecError::Spawn {
        argv0: argv0.clone(),
        detail: e.to_string(),
    })?;

    if let Some(text) = &def.stdin {
        if let Some(mut pipe) = child.stdin.take() {
            let bytes = text.clone().into_bytes();
            // Feed stdin concurrently; the child may not read it all
            tokio::spawn(async move {
                let _ = pipe.write_all(&bytes).await;
            });
        }
    }

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let stdout_reader = tokio::spawn(read_pipe(stdout_pipe));
    let stderr_reader = tokio::spawn(read_pipe(stderr_pipe));

    // Handlers must not touch the child while `wait()` borrows it, so
    // the select produces a plain outcome first
    enum WaitOutcome {
        Exited(std::io::Result<std::process::ExitStatus>),
        Cancelled,
        DeadlineHit,
    }
    let outcome = tokio::select! {
        status = child.wait() => WaitOutcome::Exited(status),
        _ = env.cancel.cancelled() => WaitOutcome::Cancelled,
        _ = deadline_elapsed(env.deadline) => WaitOutcome::DeadlineHit,
    };

    let status = match outcome {
        WaitOutcome::Exited(status) => status.map_err(KilnError::Io)?,
        WaitOutcome::Cancelled => {
            terminate_then_kill(&mut child).await;
            return Err(KilnError::Cancelled);
        }
        WaitOutcome::DeadlineHit => {
            terminate_then_kill(&mut child).await;
            return Err(ExecError::DeadlineExceeded {
                task: env.task_path.to_string(),
            }
            .into());
        }
    };

    let stdout = stdout_reader
        .await
        .map_err(|e| KilnError::internal(format!("stdout reader panicked: {}", e)))?;
    let stderr = stderr_reader
        .await
        .map_err(|e| KilnError::internal(format!("stderr reader panicked: {}", e)))?;

    if status.success() {
        Ok(ActionOutput { stdout, stderr })
    } else if let Some(code) = status.code() {
        Err(ExecError::CommandFailed { argv0, code }.into())
    } else {
        Err(ExecError::CommandKilled { argv0 }.into())
    }
}

async fn read_pipe<R: tokio::io::AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Pending forever when no deadline is attached
async fn deadline_elapsed(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Terminate politely, escalate to kill after the grace period
async fn terminate_then_kill(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid came from a live child we own
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}

// ============================================================================
// TESTS
// ============================================================================
