//! Context: the top-level owner of one build invocation
//!
//! All state hangs off the Context: the project tree, the task and
//! property arenas, settings, the plugin registry. There is no hidden
//! process-wide state; tests instantiate as many Contexts as they
//! like.
//!
//! Lifecycle: scripts and manifests populate projects and tasks, then
//! `prepare_execution` evaluates every property reachable from the
//! selection (deriving implicit dependencies from lineage), freezes
//! the task set, and builds the execution set. `execute` runs it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::action::Action;
use crate::cancel::CancelToken;
use crate::config::Settings;
use crate::error::{ConfigError, KilnError};
use crate::executor::Executor;
use crate::graph::{self, ExecutionSet};
use crate::paths;
use crate::project::{check_name, BasePlugin, Plugin, Project, ProjectId};
use crate::property::{ProducerFn, PropertyId, PropertyTable, Value, ValueKind};
use crate::report::BuildReport;
use crate::selector;
use crate::store::FingerprintStore;
use crate::task::{
    compute_task_hash, FailurePolicy, Task, TaskId, TaskState, TaskUnit, INPUTS_PROPERTY,
    OUTPUTS_PROPERTY,
};

/// Owner of projects, tasks and properties for one build
pub struct Context {
    settings: Settings,
    projects: Vec<Project>,
    tasks: Vec<Task>,
    props: PropertyTable,
    plugins: HashMap<String, Arc<dyn Plugin>>,
    /// Interned task type tags
    kinds: HashMap<String, Arc<str>>,
    frozen: bool,
}

impl Context {
    /// Create a Context with a root project at the settings' root dir
    pub fn new(settings: Settings) -> Self {
        let root = Project::new(
            ProjectId(0),
            None,
            Arc::from(""),
            Arc::from(":"),
            settings.root_dir.clone(),
        );
        let mut ctx = Self {
            settings,
            projects: vec![root],
            tasks: Vec::new(),
            props: PropertyTable::new(),
            plugins: HashMap::new(),
            kinds: HashMap::new(),
            frozen: false,
        };
        ctx.register_plugin(Arc::new(BasePlugin));
        ctx
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn root(&self) -> ProjectId {
        ProjectId(0)
    }

    pub fn project(&self, id: ProjectId) -> &Project {
        &self.projects[id.0 as usize]
    }

    pub fn task(&self, id: TaskId) -> &Task {
        &self.tasks[id.0 as usize]
    }

    fn task_mut(&mut self, id: TaskId) -> &mut Task {
        &mut self.tasks[id.0 as usize]
    }

    fn check_unfrozen(&self, what: &str) -> Result<(), KilnError> {
        if self.frozen {
            return Err(ConfigError::Frozen {
                what: what.to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn intern_kind(&mut self, kind: &str) -> Arc<str> {
        if let Some(tag) = self.kinds.get(kind) {
            return Arc::clone(tag);
        }
        let tag: Arc<str> = Arc::from(kind);
        self.kinds.insert(kind.to_string(), Arc::clone(&tag));
        tag
    }

    // ========================================================================
    // TREE CONSTRUCTION
    // ========================================================================

    /// Create a sub-project. `dir` defaults to `<parent dir>/<name>`.
    pub fn add_project(
        &mut self,
        parent: ProjectId,
        name: &str,
        dir: Option<PathBuf>,
    ) -> Result<ProjectId, KilnError> {
        self.check_unfrozen("project tree")?;
        check_name(name)?;

        let parent_project = self.project(parent);
        if parent_project.children.contains_key(name) {
            return Err(ConfigError::DuplicateProject {
                parent: parent_project.path.to_string(),
                name: name.to_string(),
            }
            .into());
        }

        let path: Arc<str> = if &*parent_project.path == ":" {
            Arc::from(format!(":{}", name))
        } else {
            Arc::from(format!("{}:{}", parent_project.path, name))
        };
        let dir = match dir {
            Some(dir) => paths::resolve_in(&parent_project.dir, &dir),
            None => parent_project.dir.join(name),
        };

        let id = ProjectId(self.projects.len() as u32);
        self.projects
            .push(Project::new(id, Some(parent), Arc::from(name), path, dir));
        self.projects[parent.0 as usize]
            .children
            .insert(name.to_string(), id);
        Ok(id)
    }

    /// Create a task with a type tag like `compile` or `write-file`.
    ///
    /// The well-known `inputs` and `outputs` properties are declared
    /// up front as list-of-path.
    pub fn add_task(
        &mut self,
        project: ProjectId,
        name: &str,
        kind: &str,
    ) -> Result<TaskId, KilnError> {
        self.check_unfrozen("task set")?;
        check_name(name)?;

        let owner = self.project(project);
        if owner.tasks.contains_key(name) {
            return Err(ConfigError::DuplicateTask {
                project: owner.path.to_string(),
                name: name.to_string(),
            }
            .into());
        }

        let path: Arc<str> = if &*owner.path == ":" {
            Arc::from(format!(":{}", name))
        } else {
            Arc::from(format!("{}:{}", owner.path, name))
        };
        let kind = self.intern_kind(kind);

        let id = TaskId(self.tasks.len() as u32);
        let mut task = Task::new(id, project, Arc::from(name), Arc::clone(&path), kind);
        for well_known in [INPUTS_PROPERTY, OUTPUTS_PROPERTY] {
            let prop =
                self.props
                    .declare(id, Arc::clone(&path), well_known, ValueKind::PathList);
            task.properties.insert(well_known.to_string(), prop);
        }
        self.tasks.push(task);
        self.projects[project.0 as usize]
            .tasks
            .insert(name.to_string(), id);
        Ok(id)
    }

    // ========================================================================
    // TASK CONFIGURATION
    // ========================================================================

    /// Declare or obtain a property. The declared type is captured at
    /// the first call; a later call with a different type is an error.
    pub fn property(
        &mut self,
        task: TaskId,
        name: &str,
        kind: ValueKind,
    ) -> Result<PropertyId, KilnError> {
        if let Some(existing) = self.task(task).property_id(name) {
            let declared = self.props.kind(existing);
            if declared != kind {
                return Err(ConfigError::TypeMismatch {
                    task: self.task(task).path.to_string(),
                    property: name.to_string(),
                    expected: declared.to_string(),
                    actual: kind.to_string(),
                }
                .into());
            }
            return Ok(existing);
        }

        self.check_unfrozen("property table")?;
        let path = Arc::clone(&self.task(task).path);
        let id = self.props.declare(task, path, name, kind);
        self.task_mut(task).properties.insert(name.to_string(), id);
        Ok(id)
    }

    /// Declare (from the value's type) and set a literal in one step
    pub fn set_property(
        &mut self,
        task: TaskId,
        name: &str,
        value: Value,
    ) -> Result<PropertyId, KilnError> {
        let id = self.property(task, name, value.kind())?;
        self.props.set_literal(id, value)?;
        Ok(id)
    }

    pub fn set_literal(&mut self, prop: PropertyId, value: Value) -> Result<(), KilnError> {
        self.props.set_literal(prop, value)
    }

    pub fn set_producer(&mut self, prop: PropertyId, producer: ProducerFn) -> Result<(), KilnError> {
        self.props.set_producer(prop, producer)
    }

    pub fn set_reference(&mut self, prop: PropertyId, target: PropertyId) -> Result<(), KilnError> {
        self.props.set_reference(prop, target)
    }

    /// Evaluate a property now (configuration phase only)
    pub fn evaluate(&mut self, prop: PropertyId) -> Result<Value, KilnError> {
        self.props.evaluate(prop)
    }

    /// Add an explicit dependency edge. Cycles are rejected at
    /// graph-build time with the full cycle path.
    pub fn depends_on(&mut self, task: TaskId, dep: TaskId) -> Result<(), KilnError> {
        self.check_unfrozen("dependency set")?;
        let entry = &mut self.task_mut(task).explicit_deps;
        if !entry.contains(&dep) {
            entry.push(dep);
        }
        Ok(())
    }

    /// Prepend an action to the task's sequence
    pub fn do_first(&mut self, task: TaskId, action: Action) -> Result<(), KilnError> {
        self.check_unfrozen("action sequence")?;
        self.task_mut(task).actions.insert(0, action);
        Ok(())
    }

    /// Append an action to the task's sequence
    pub fn do_last(&mut self, task: TaskId, action: Action) -> Result<(), KilnError> {
        self.check_unfrozen("action sequence")?;
        self.task_mut(task).actions.push(action);
        Ok(())
    }

    pub fn set_default(&mut self, task: TaskId, default: bool) {
        self.task_mut(task).default = default;
    }

    pub fn set_always_outdated(&mut self, task: TaskId, always: bool) {
        self.task_mut(task).always_outdated = always;
    }

    pub fn set_failure_policy(&mut self, task: TaskId, policy: FailurePolicy) {
        self.task_mut(task).failure_policy = policy;
    }

    pub fn add_tool_version(&mut self, task: TaskId, tag: impl Into<String>) {
        self.task_mut(task).tool_versions.push(tag.into());
    }

    pub fn set_deadline(&mut self, task: TaskId, deadline: Duration) {
        self.task_mut(task).deadline = Some(deadline);
    }

    // ========================================================================
    // PLUGINS AND EXTENSIONS
    // ========================================================================

    pub fn register_plugin(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.insert(plugin.name().to_string(), plugin);
    }

    /// Apply a registered plugin to a project; the second application
    /// to the same project is a no-op.
    pub fn apply_plugin(&mut self, project: ProjectId, name: &str) -> Result<(), KilnError> {
        if self
            .project(project)
            .applied_plugins
            .iter()
            .any(|applied| applied == name)
        {
            return Ok(());
        }
        let plugin = self
            .plugins
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownPlugin {
                name: name.to_string(),
            })?;
        self.projects[project.0 as usize]
            .applied_plugins
            .push(name.to_string());
        plugin.apply(self, project)
    }

    /// Attach an opaque extension record to a project (add-only)
    pub fn add_extension(
        &mut self,
        project: ProjectId,
        name: &str,
        record: serde_json::Value,
    ) -> Result<(), KilnError> {
        self.check_unfrozen("extensions")?;
        self.projects[project.0 as usize]
            .extensions
            .insert(name.to_string(), record);
        Ok(())
    }

    // ========================================================================
    // SELECTION AND EXECUTION
    // ========================================================================

    /// Resolve a selector against the root project
    pub fn resolve(&self, raw: &str) -> Result<TaskId, KilnError> {
        selector::resolve(self, self.root(), raw)
    }

    /// Resolve a selector relative to a specific project
    pub fn resolve_in(&self, origin: ProjectId, raw: &str) -> Result<TaskId, KilnError> {
        selector::resolve(self, origin, raw)
    }

    fn seeds(&self, selectors: &[String]) -> Result<Vec<TaskId>, KilnError> {
        if selectors.is_empty() {
            let defaults: Vec<TaskId> = self
                .tasks
                .iter()
                .filter(|t| t.default)
                .map(|t| t.id)
                .collect();
            if defaults.is_empty() {
                return Err(ConfigError::NoDefaultTasks.into());
            }
            return Ok(defaults);
        }

        let mut seeds = Vec::with_capacity(selectors.len());
        for raw in selectors {
            seeds.push(self.resolve(raw)?);
        }
        seeds.sort_unstable();
        seeds.dedup();
        Ok(seeds)
    }

    /// Configure a task: evaluate its set properties and derive the
    /// implicit dependency edges from their lineage.
    fn configure_task(&mut self, id: TaskId) -> Result<(), KilnError> {
        if self.task(id).state != TaskState::Unconfigured {
            return Ok(());
        }

        let prop_ids: Vec<PropertyId> = self.task(id).properties.values().copied().collect();
        let mut implicit: Vec<TaskId> = Vec::new();
        for prop in prop_ids {
            if !self.props.is_set(prop) {
                continue;
            }
            self.props.evaluate(prop)?;
            for read in self.props.lineage(prop) {
                let owner = self.props.owner(*read);
                if owner != id {
                    implicit.push(owner);
                }
            }
        }
        implicit.sort_unstable();
        implicit.dedup();

        let task = self.task_mut(id);
        task.implicit_deps = implicit;
        task.state = TaskState::Configured;
        debug!(task = %task.path, deps = task.implicit_deps.len(), "task configured");
        Ok(())
    }

    /// Resolve the selection, configure every reachable task, detect
    /// cycles, freeze the task set and bake the execution set.
    #[instrument(skip(self), fields(selectors = selectors.len()))]
    pub fn prepare_execution(&mut self, selectors: &[String]) -> Result<ExecutionSet, KilnError> {
        let seeds = self.seeds(selectors)?;

        // Path snapshot so the closure below can borrow self mutably
        let paths: Vec<Arc<str>> = self.tasks.iter().map(|t| Arc::clone(&t.path)).collect();
        let order = graph::topo_closure(
            &seeds,
            |id| {
                self.configure_task(id)?;
                Ok(self.task(id).dependencies())
            },
            move |id| Arc::clone(&paths[id.0 as usize]),
        )?;

        self.props.freeze();
        self.frozen = true;

        let mut units: HashMap<TaskId, TaskUnit> = HashMap::with_capacity(order.len());
        for id in &order {
            let unit = self.bake_unit(*id, &units)?;
            units.insert(*id, unit);
        }

        debug!(tasks = order.len(), "execution set prepared");
        Ok(ExecutionSet { order, units })
    }

    /// Evaluate a well-known path-list property into normalized paths
    fn path_list(&mut self, task: TaskId, name: &str) -> Result<Vec<PathBuf>, KilnError> {
        let prop = match self.task(task).property_id(name) {
            Some(prop) if self.props.is_set(prop) => prop,
            _ => return Ok(Vec::new()),
        };
        let value = self.props.evaluate(prop)?;
        let list = value.as_path_list().ok_or_else(|| ConfigError::TypeMismatch {
            task: self.task(task).path.to_string(),
            property: name.to_string(),
            expected: ValueKind::PathList.to_string(),
            actual: value.kind().to_string(),
        })?;
        let dir = self.project(self.task(task).project).dir.clone();
        Ok(list
            .iter()
            .map(|p| paths::resolve_in(&dir, p))
            .collect())
    }

    /// Bake one task into its immutable executable unit.
    ///
    /// Dependencies are baked first (topological order), so their
    /// output lists are available to derive this task's inputs.
    fn bake_unit(
        &mut self,
        id: TaskId,
        baked: &HashMap<TaskId, TaskUnit>,
    ) -> Result<TaskUnit, KilnError> {
        let outputs = self.path_list(id, OUTPUTS_PROPERTY)?;
        let mut inputs = self.path_list(id, INPUTS_PROPERTY)?;

        let deps = self.task(id).dependencies();
        for dep in &deps {
            if let Some(dep_unit) = baked.get(dep) {
                inputs.extend(dep_unit.outputs.iter().cloned());
            }
        }
        for action in self.task(id).actions() {
            inputs.extend(action.declared_inputs());
        }
        inputs.sort();
        inputs.dedup();

        let project_dir = self.project(self.task(id).project).dir.clone();
        let task = self.task(id);
        let mut actions = task.actions.clone();
        for action in &mut actions {
            action.rebase(&project_dir);
        }

        let task_hash = compute_task_hash(&actions, &inputs, &outputs, &task.tool_versions);
        Ok(TaskUnit {
            id,
            path: Arc::clone(&task.path),
            kind: Arc::clone(&task.kind),
            actions,
            inputs,
            outputs,
            deps,
            task_hash,
            always_outdated: task.always_outdated,
            failure_policy: if self.settings.continue_on_error {
                FailurePolicy::Continue
            } else {
                task.failure_policy
            },
            deadline: task.deadline,
            project_dir,
        })
    }

    /// Prepare and run a selection to completion
    pub async fn execute(&mut self, selectors: &[String]) -> Result<BuildReport, KilnError> {
        self.execute_with_cancel(selectors, CancelToken::new()).await
    }

    /// Prepare and run, with an externally-owned cancellation token
    pub async fn execute_with_cancel(
        &mut self,
        selectors: &[String],
        cancel: CancelToken,
    ) -> Result<BuildReport, KilnError> {
        let set = self.prepare_execution(selectors)?;
        let store = Arc::new(FingerprintStore::open(&self.settings.build_dir));
        let executor = Executor::new(self.settings.clone(), cancel);
        executor.run(Arc::new(set), store).await
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx() -> (tempfile::TempDir, Context) {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = Context::new(Settings::for_dir(tmp.path()));
        (tmp, ctx)
    }

    #[test]
    fn task_paths_are_fully_qualified() {
        let (_tmp, mut ctx) = test_ctx();
        let app = ctx.add_project(ctx.root(), "app", None).unwrap();
        let lib = ctx.add_project(app, "lib", None).unwrap();
        let compile = ctx.add_task(lib, "compile", "compile").unwrap();
        let top = ctx.add_task(ctx.root(), "assemble", "lifecycle").unwrap();

        assert_eq!(&*ctx.task(compile).path, ":app:lib:compile");
        assert_eq!(&*ctx.task(top).path, ":assemble");
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let (_tmp, mut ctx) = test_ctx();
        ctx.add_task(ctx.root(), "build", "run").unwrap();
        assert!(ctx.add_task(ctx.root(), "build", "run").is_err());

        ctx.add_project(ctx.root(), "lib", None).unwrap();
        assert!(ctx.add_project(ctx.root(), "lib", None).is_err());
    }

    #[test]
    fn property_redeclaration_with_other_type_fails() {
        let (_tmp, mut ctx) = test_ctx();
        let task = ctx.add_task(ctx.root(), "t", "run").unwrap();
        ctx.property(task, "mode", ValueKind::Str).unwrap();
        assert!(ctx.property(task, "mode", ValueKind::Str).is_ok());
        assert!(ctx.property(task, "mode", ValueKind::Int).is_err());
    }

    #[test]
    fn implicit_deps_follow_property_lineage() {
        let (_tmp, mut ctx) = test_ctx();
        let write = ctx.add_task(ctx.root(), "write", "write-file").unwrap();
        let gen = ctx.add_task(ctx.root(), "gen", "generate").unwrap();

        let file_path = ctx.property(write, "file_path", ValueKind::Path).unwrap();
        ctx.set_literal(file_path, Value::path("out.txt")).unwrap();

        let derived = ctx.property(gen, "file_path", ValueKind::Path).unwrap();
        ctx.set_producer(
            derived,
            Arc::new(move |reader| {
                let upstream = reader.get(file_path)?;
                Ok(upstream)
            }),
        )
        .unwrap();

        let set = ctx
            .prepare_execution(&[":gen".to_string()])
            .unwrap();
        let deps = &set.unit(gen).deps;
        assert!(deps.contains(&write), "lineage must imply a task dependency");
    }

    #[test]
    fn explicit_dep_outputs_feed_dependent_inputs() {
        let (tmp, mut ctx) = test_ctx();
        let producer = ctx.add_task(ctx.root(), "produce", "write-file").unwrap();
        ctx.set_property(producer, OUTPUTS_PROPERTY, Value::paths(["out.bin"]))
            .unwrap();

        let consumer = ctx.add_task(ctx.root(), "consume", "run").unwrap();
        ctx.depends_on(consumer, producer).unwrap();

        let set = ctx.prepare_execution(&[":consume".to_string()]).unwrap();
        let expected = paths::normalize(&tmp.path().join("out.bin"));
        assert!(set.unit(consumer).inputs.contains(&expected));
    }

    #[test]
    fn frozen_context_rejects_mutation() {
        let (_tmp, mut ctx) = test_ctx();
        let task = ctx.add_task(ctx.root(), "t", "run").unwrap();
        ctx.set_default(task, true);
        ctx.prepare_execution(&[]).unwrap();

        assert!(ctx.add_task(ctx.root(), "late", "run").is_err());
        assert!(ctx.depends_on(task, task).is_err());
        assert!(ctx.set_property(task, "x", Value::from("y")).is_err());
    }

    #[test]
    fn empty_selection_without_defaults_is_an_error() {
        let (_tmp, mut ctx) = test_ctx();
        ctx.add_task(ctx.root(), "t", "run").unwrap();
        let err = ctx.prepare_execution(&[]).unwrap_err();
        assert!(err.to_string().contains("no default tasks"));
    }

    #[test]
    fn base_plugin_adds_clean_once() {
        let (_tmp, mut ctx) = test_ctx();
        ctx.apply_plugin(ctx.root(), "base").unwrap();
        ctx.apply_plugin(ctx.root(), "base").unwrap(); // idempotent

        let clean = ctx.resolve(":clean").unwrap();
        assert!(ctx.task(clean).always_outdated);
        assert!(ctx.project(ctx.root()).extension("base").is_some());
    }

    #[test]
    fn unknown_plugin_is_a_config_error() {
        let (_tmp, mut ctx) = test_ctx();
        let err = ctx.apply_plugin(ctx.root(), "cxx").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn selector_resolution_prefers_nearest_scope() {
        let (_tmp, mut ctx) = test_ctx();
        let sub = ctx.add_project(ctx.root(), "sub", None).unwrap();
        let root_task = ctx.add_task(ctx.root(), "check", "run").unwrap();
        let sub_task = ctx.add_task(sub, "check", "run").unwrap();

        assert_eq!(ctx.resolve_in(sub, ":check").unwrap(), sub_task);
        assert_eq!(ctx.resolve(":check").unwrap(), root_task);
        assert_eq!(ctx.resolve(":sub:check").unwrap(), sub_task);
    }
}
