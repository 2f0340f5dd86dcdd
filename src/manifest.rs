//! Build manifest: the YAML front-end that populates a Context
//!
//! The manifest is strictly a producer of projects and tasks over the
//! core API; the engine never reads YAML anywhere else. Each task
//! declares exactly one action keyword, nested under it:
//!
//! ```yaml
//! tasks:
//!   - name: gen
//!     write-file:
//!       path: out.py
//!       text: "print(42)\n"
//!     outputs: [out.py]
//!
//!   - name: run
//!     run:
//!       argv: [python3, out.py]
//!     inputs-from: [":gen"]
//!     always-outdated: true
//!     default: true
//!
//! projects:
//!   - name: lib
//!     tasks: [...]
//! ```
//!
//! `inputs` entries are glob patterns over the project directory;
//! `inputs-from` wires this task's inputs to another task's declared
//! outputs through a property reference, so the dependency edge is
//! derived from lineage rather than spelled out.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::action::{Action, ExecuteDef, OutputMode};
use crate::context::Context;
use crate::error::{ConfigError, KilnError};
use crate::fileset::FileSet;
use crate::project::ProjectId;
use crate::property::{PropertyId, Value, ValueKind};
use crate::task::{FailurePolicy, TaskId, INPUTS_PROPERTY, OUTPUTS_PROPERTY};

// ============================================================================
// DOCUMENT SHAPE
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestDoc {
    /// Display name; informational only
    #[allow(dead_code)]
    pub name: Option<String>,

    #[serde(default)]
    pub plugins: Vec<String>,

    #[serde(default)]
    pub tasks: Vec<TaskDecl>,

    #[serde(default)]
    pub projects: Vec<ProjectDecl>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectDecl {
    pub name: String,

    /// Source directory, relative to the parent project
    pub dir: Option<String>,

    #[serde(default)]
    pub plugins: Vec<String>,

    #[serde(default)]
    pub tasks: Vec<TaskDecl>,

    #[serde(default)]
    pub projects: Vec<ProjectDecl>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskDecl {
    pub name: String,

    /// The action, exactly one keyword; absent for aggregator tasks
    #[serde(flatten)]
    pub action: Option<ActionDecl>,

    /// Glob patterns over the project directory
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Patterns removed from `inputs` matches
    #[serde(rename = "exclude-inputs", default)]
    pub exclude_inputs: Vec<String>,

    /// Selectors of tasks whose declared outputs feed this task
    #[serde(rename = "inputs-from", default)]
    pub inputs_from: Vec<String>,

    #[serde(default)]
    pub outputs: Vec<String>,

    /// Explicit dependencies, as selectors
    #[serde(default)]
    pub deps: Vec<String>,

    #[serde(default)]
    pub default: bool,

    #[serde(rename = "always-outdated", default)]
    pub always_outdated: bool,

    #[serde(rename = "continue-on-error", default)]
    pub continue_on_error: bool,

    #[serde(rename = "tool-versions", default)]
    pub tool_versions: Vec<String>,

    /// Best-effort wall-clock deadline
    #[serde(rename = "timeout-secs")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ActionDecl {
    WriteFile {
        #[serde(rename = "write-file")]
        write_file: WriteFileDecl,
    },
    Run {
        run: RunDecl,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriteFileDecl {
    pub path: String,
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunDecl {
    pub argv: Vec<String>,
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub stdin: Option<String>,
    /// Inherit the console instead of capturing to the task log
    #[serde(default)]
    pub console: bool,
}

// ============================================================================
// LOADING
// ============================================================================

/// Parse a manifest and populate the Context's root project
pub fn load_str(ctx: &mut Context, yaml: &str) -> Result<(), KilnError> {
    let doc: ManifestDoc =
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Manifest(e.to_string()))?;
    load_doc(ctx, &doc)
}

pub fn load_file(ctx: &mut Context, path: &Path) -> Result<(), KilnError> {
    let yaml = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Manifest(format!("{}: {}", path.display(), e)))?;
    load_str(ctx, &yaml)
}

pub fn load_doc(ctx: &mut Context, doc: &ManifestDoc) -> Result<(), KilnError> {
    // First pass: create the whole tree so selectors in the second
    // pass can point anywhere
    let mut pending: Vec<(TaskId, ProjectId, TaskDecl)> = Vec::new();

    let root = ctx.root();
    for plugin in &doc.plugins {
        ctx.apply_plugin(root, plugin)?;
    }
    for decl in &doc.tasks {
        declare_task(ctx, root, decl, &mut pending)?;
    }
    for project in &doc.projects {
        declare_project(ctx, root, project, &mut pending)?;
    }

    // Second pass: wire dependencies and input sources
    for (task, project, decl) in &pending {
        wire_task(ctx, *task, *project, decl)?;
    }
    Ok(())
}

fn declare_project(
    ctx: &mut Context,
    parent: ProjectId,
    decl: &ProjectDecl,
    pending: &mut Vec<(TaskId, ProjectId, TaskDecl)>,
) -> Result<(), KilnError> {
    let id = ctx.add_project(parent, &decl.name, decl.dir.as_ref().map(PathBuf::from))?;
    for plugin in &decl.plugins {
        ctx.apply_plugin(id, plugin)?;
    }
    for task in &decl.tasks {
        declare_task(ctx, id, task, pending)?;
    }
    for child in &decl.projects {
        declare_project(ctx, id, child, pending)?;
    }
    Ok(())
}

fn declare_task(
    ctx: &mut Context,
    project: ProjectId,
    decl: &TaskDecl,
    pending: &mut Vec<(TaskId, ProjectId, TaskDecl)>,
) -> Result<(), KilnError> {
    let kind = match &decl.action {
        Some(ActionDecl::WriteFile { .. }) => "write-file",
        Some(ActionDecl::Run { .. }) => "run",
        None => "lifecycle",
    };
    let task = ctx.add_task(project, &decl.name, kind)?;

    match &decl.action {
        Some(ActionDecl::WriteFile { write_file }) => {
            ctx.do_last(
                task,
                Action::write_file(PathBuf::from(&write_file.path), write_file.text.clone()),
            )?;
        }
        Some(ActionDecl::Run { run }) => {
            if run.argv.is_empty() {
                return Err(ConfigError::Manifest(format!(
                    "task '{}': run.argv must not be empty",
                    decl.name
                ))
                .into());
            }
            ctx.do_last(
                task,
                Action::Execute(ExecuteDef {
                    argv: run.argv.clone(),
                    cwd: run.cwd.as_ref().map(PathBuf::from),
                    env: run.env.clone(),
                    stdin: run.stdin.clone(),
                    output: if run.console {
                        OutputMode::Console
                    } else {
                        OutputMode::Capture
                    },
                }),
            )?;
        }
        None => {}
    }

    if !decl.outputs.is_empty() {
        ctx.set_property(
            task,
            OUTPUTS_PROPERTY,
            Value::paths(decl.outputs.iter().map(PathBuf::from)),
        )?;
    }

    ctx.set_default(task, decl.default);
    ctx.set_always_outdated(task, decl.always_outdated);
    if decl.continue_on_error {
        ctx.set_failure_policy(task, FailurePolicy::Continue);
    }
    for tag in &decl.tool_versions {
        ctx.add_tool_version(task, tag.clone());
    }
    if let Some(secs) = decl.timeout_secs {
        ctx.set_deadline(task, std::time::Duration::from_secs(secs));
    }

    pending.push((task, project, decl.clone()));
    Ok(())
}

/// Wire deps and the inputs property once every task exists
fn wire_task(
    ctx: &mut Context,
    task: TaskId,
    project: ProjectId,
    decl: &TaskDecl,
) -> Result<(), KilnError> {
    for selector in &decl.deps {
        let dep = ctx.resolve_in(project, selector)?;
        ctx.depends_on(task, dep)?;
    }

    if decl.inputs.is_empty() && decl.inputs_from.is_empty() {
        return Ok(());
    }

    // Outputs properties of the referenced tasks; read through the
    // producer below so the edges fall out of lineage. Each source's
    // relative output paths resolve against its own project directory.
    let mut sources: Vec<(PropertyId, PathBuf)> = Vec::with_capacity(decl.inputs_from.len());
    for selector in &decl.inputs_from {
        let source_task = ctx.resolve_in(project, selector)?;
        let prop = ctx.property(source_task, OUTPUTS_PROPERTY, ValueKind::PathList)?;
        let source_dir = ctx.project(ctx.task(source_task).project).dir.clone();
        sources.push((prop, source_dir));
    }

    let mut fileset = FileSet::new(ctx.project(project).dir.clone());
    for pattern in &decl.inputs {
        fileset = fileset.include(pattern.clone());
    }
    for pattern in &decl.exclude_inputs {
        fileset = fileset.exclude(pattern.clone());
    }
    let has_patterns = !decl.inputs.is_empty();

    let inputs_prop = ctx.property(task, INPUTS_PROPERTY, ValueKind::PathList)?;
    ctx.set_producer(
        inputs_prop,
        Arc::new(move |reader| {
            let mut all: Vec<PathBuf> = if has_patterns {
                fileset.resolve()?
            } else {
                Vec::new()
            };
            for (source, source_dir) in &sources {
                let value = reader.get(*source)?;
                for path in value.as_path_list().unwrap_or_default() {
                    all.push(crate::paths::resolve_in(source_dir, &path));
                }
            }
            all.sort();
            all.dedup();
            Ok(Value::PathList(all))
        }),
    )?;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn ctx_in(dir: &Path) -> Context {
        Context::new(Settings::for_dir(dir))
    }

    #[test]
    fn parse_minimal_manifest() {
        let yaml = r#"
tasks:
  - name: gen
    write-file:
      path: out.py
      text: "print(42)\n"
    outputs: [out.py]

  - name: run
    run:
      argv: [python3, out.py]
    inputs-from: [":gen"]
    always-outdated: true
    default: true
"#;
        let doc: ManifestDoc = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(doc.tasks.len(), 2);
        assert!(matches!(
            doc.tasks[0].action,
            Some(ActionDecl::WriteFile { .. })
        ));
        assert!(doc.tasks[1].always_outdated);
        assert!(doc.tasks[1].default);
    }

    #[test]
    fn aggregator_task_has_no_action() {
        let yaml = r#"
tasks:
  - name: all
    deps: [":gen"]
  - name: gen
    write-file:
      path: out.txt
      text: hi
"#;
        let doc: ManifestDoc = serde_yaml::from_str(yaml).unwrap();
        assert!(doc.tasks[0].action.is_none());
    }

    #[test]
    fn load_wires_deps_and_inputs() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ctx = ctx_in(tmp.path());
        load_str(
            &mut ctx,
            r#"
tasks:
  - name: gen
    write-file:
      path: out.py
      text: "print(42)\n"
    outputs: [out.py]

  - name: exec
    run:
      argv: [python3, out.py]
    inputs-from: [":gen"]
    deps: [":gen"]
"#,
        )
        .unwrap();

        let exec = ctx.resolve(":exec").unwrap();
        let gen = ctx.resolve(":gen").unwrap();
        let set = ctx.prepare_execution(&[":exec".to_string()]).unwrap();
        assert!(set.unit(exec).deps.contains(&gen));
        // Inputs follow gen's declared outputs
        let expected = crate::paths::normalize(&tmp.path().join("out.py"));
        assert!(set.unit(exec).inputs.contains(&expected));
    }

    #[test]
    fn lineage_alone_creates_the_edge() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ctx = ctx_in(tmp.path());
        load_str(
            &mut ctx,
            r#"
tasks:
  - name: gen
    write-file:
      path: out.txt
      text: data
    outputs: [out.txt]

  - name: consume
    run:
      argv: [cat, out.txt]
    inputs-from: [":gen"]
"#,
        )
        .unwrap();

        let consume = ctx.resolve(":consume").unwrap();
        let gen = ctx.resolve(":gen").unwrap();
        let set = ctx.prepare_execution(&[":consume".to_string()]).unwrap();
        assert!(
            set.unit(consume).deps.contains(&gen),
            "inputs-from must imply the dependency without an explicit deps entry"
        );
    }

    #[test]
    fn nested_projects_and_relative_deps() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("lib")).unwrap();
        let mut ctx = ctx_in(tmp.path());
        load_str(
            &mut ctx,
            r#"
projects:
  - name: lib
    tasks:
      - name: compile
        run:
          argv: [true]
      - name: test
        run:
          argv: [true]
        deps: [compile]
"#,
        )
        .unwrap();

        let test = ctx.resolve(":lib:test").unwrap();
        let compile = ctx.resolve(":lib:compile").unwrap();
        let set = ctx.prepare_execution(&[":lib:test".to_string()]).unwrap();
        assert!(set.unit(test).deps.contains(&compile));
    }

    #[test]
    fn empty_argv_is_a_manifest_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ctx = ctx_in(tmp.path());
        let err = load_str(
            &mut ctx,
            r#"
tasks:
  - name: bad
    run:
      argv: []
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("argv must not be empty"));
    }

    #[test]
    fn bad_yaml_is_a_configuration_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ctx = ctx_in(tmp.path());
        let err = load_str(&mut ctx, "tasks: [not a task").unwrap_err();
        assert!(err.is_configuration());
    }
}
