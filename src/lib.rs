//! # Kiln Build Core
//!
//! Incremental task-graph build engine: lazy properties with
//! provenance tracking, fingerprint-based up-to-date checks, and a
//! bounded parallel scheduler.
//!
//! ## Overview
//!
//! A build is one [`Context`]: a tree of projects owning tasks, each
//! task carrying typed lazy properties, an action sequence and
//! dependency edges. Executing a selection runs four phases:
//!
//! 1. **Configure** — evaluate every property reachable from the
//!    selection; reads recorded during evaluation become the
//!    property's *lineage*, and lineage across task boundaries becomes
//!    implicit dependency edges
//! 2. **Build the graph** — transitive closure with cycle detection,
//!    topologically ordered, ties broken by task path
//! 3. **Schedule** — a fixed worker pool drains the ready set; each
//!    task is skipped when its stored fingerprint still matches, and
//!    otherwise runs its actions in order
//! 4. **Report** — per-task status and elapsed time, worst outcome as
//!    the exit code
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use kiln::{Action, Context, Settings, Value};
//!
//! let mut ctx = Context::new(Settings::for_dir("."));
//! let gen = ctx.add_task(ctx.root(), "gen", "write-file")?;
//! ctx.do_last(gen, Action::write_file("out.py", "print(42)\n"))?;
//! ctx.set_property(gen, "outputs", Value::paths(["out.py"]))?;
//!
//! let run = ctx.add_task(ctx.root(), "run", "run")?;
//! ctx.depends_on(run, gen)?;
//! ctx.do_last(run, Action::execute(["python3", "out.py"]))?;
//! ctx.set_always_outdated(run, true);
//!
//! let report = ctx.execute(&[":run".to_string()]).await?;
//! assert!(report.succeeded());
//! # Ok::<(), kiln::KilnError>(())
//! ```
//!
//! ## Modules
//!
//! - [`property`] - Lazy typed values, lineage capture, cycle errors
//! - [`task`] - Task model, task hash, up-to-date contract
//! - [`project`] - Project tree, plugins, extensions
//! - [`context`] - The owning registry and execution entry points
//! - [`graph`] - Closure, cycle detection, topological order
//! - [`executor`] - Bounded parallel scheduler, failure propagation
//! - [`store`] - Persistent fingerprint records
//! - [`manifest`] - YAML front-end producing projects and tasks

pub mod action;
pub mod cancel;
pub mod config;
pub mod context;
pub mod digest;
pub mod error;
pub mod executor;
pub mod fileset;
pub mod graph;
pub mod manifest;
pub mod paths;
pub mod project;
pub mod property;
pub mod report;
pub mod selector;
pub mod store;
pub mod task;

pub use action::{Action, ActionEnv, CallableArgs, CallableFn, OutputMode, TaskWork};
pub use cancel::CancelToken;
pub use config::Settings;
pub use context::Context;
pub use digest::Digest;
pub use error::{ConfigError, ExecError, Hint, InputError, KilnError, StoreError, TaskFailure};
pub use executor::Executor;
pub use fileset::FileSet;
pub use graph::ExecutionSet;
pub use project::{Plugin, Project, ProjectId};
pub use property::{PropertyId, Value, ValueKind};
pub use report::{BuildReport, TaskReport, TaskStatus};
pub use store::{FingerprintRecord, FingerprintStore};
pub use task::{FailurePolicy, Task, TaskId, TaskState, TaskUnit};
