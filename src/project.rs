//! Project model: the hierarchical namespace owning tasks
//!
//! Projects form a tree rooted at `:`. Each node owns a task table, a
//! child-project table and plugin-contributed extension records. Task
//! names are unique within a project; project names are unique within
//! their parent.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::context::Context;
use crate::error::{ConfigError, KilnError};
use crate::task::TaskId;

/// Valid task and project names
static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_-]*$").expect("static regex"));

/// Validate a task or project name
pub fn check_name(name: &str) -> Result<(), KilnError> {
    if NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(ConfigError::InvalidName {
            name: name.to_string(),
        }
        .into())
    }
}

/// Handle to a project in the Context arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectId(pub(crate) u32);

/// A node in the project tree
pub struct Project {
    pub id: ProjectId,
    /// `None` for the root
    pub parent: Option<ProjectId>,
    pub name: Arc<str>,
    /// `:` for the root, `:a:b` below it
    pub path: Arc<str>,
    /// Source directory of this project
    pub dir: PathBuf,
    pub(crate) children: BTreeMap<String, ProjectId>,
    pub(crate) tasks: BTreeMap<String, TaskId>,
    /// Plugin-contributed opaque records, keyed by extension name
    pub(crate) extensions: BTreeMap<String, serde_json::Value>,
    /// Plugins already applied to this project
    pub(crate) applied_plugins: Vec<String>,
}

impl Project {
    pub(crate) fn new(
        id: ProjectId,
        parent: Option<ProjectId>,
        name: Arc<str>,
        path: Arc<str>,
        dir: PathBuf,
    ) -> Self {
        Self {
            id,
            parent,
            name,
            path,
            dir,
            children: BTreeMap::new(),
            tasks: BTreeMap::new(),
            extensions: BTreeMap::new(),
            applied_plugins: Vec::new(),
        }
    }

    pub fn task_named(&self, name: &str) -> Option<TaskId> {
        self.tasks.get(name).copied()
    }

    pub fn child_named(&self, name: &str) -> Option<ProjectId> {
        self.children.get(name).copied()
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    /// Opaque record attached by a plugin, if present
    pub fn extension(&self, name: &str) -> Option<&serde_json::Value> {
        self.extensions.get(name)
    }
}

// ============================================================================
// PLUGINS
// ============================================================================

/// A plugin contributes tasks and extension records to a project.
///
/// Application is idempotent per project (the second `apply` is a
/// no-op) and add-only: plugins never remove tasks or extensions.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, ctx: &mut Context, project: ProjectId) -> Result<(), KilnError>;
}

/// The conventional base plugin: contributes a `clean` task that
/// deletes the project's build outputs, plus a `base` extension record.
pub struct BasePlugin;

impl Plugin for BasePlugin {
    fn name(&self) -> &str {
        "base"
    }

    fn apply(&self, ctx: &mut Context, project: ProjectId) -> Result<(), KilnError> {
        let build_dir = ctx.settings().build_dir.clone();

        let clean = ctx.add_task(project, "clean", "clean")?;
        ctx.set_always_outdated(clean, true);
        ctx.do_last(
            clean,
            crate::action::Action::callable(
                "clean-build-dir",
                serde_json::json!({ "dir": build_dir.to_string_lossy() }),
                Arc::new(|args| {
                    let dir = args
                        .args
                        .get("dir")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| anyhow::anyhow!("missing 'dir' argument"))?;
                    match std::fs::remove_dir_all(dir) {
                        Ok(()) => Ok(format!("removed {}", dir)),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                            Ok(format!("{} already clean", dir))
                        }
                        Err(e) => Err(e.into()),
                    }
                }),
            ),
        )?;

        ctx.add_extension(
            project,
            "base",
            serde_json::json!({ "buildDir": build_dir.to_string_lossy() }),
        )?;
        Ok(())
    }
}
