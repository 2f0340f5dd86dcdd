//! Lazy, typed, provenance-tracking task properties
//!
//! A property's value is unset, a literal, a deferred producer, or a
//! reference to another property. Evaluation records every property
//! transitively read into the evaluated property's **lineage**; lineage
//! owners later become implicit task dependencies.
//!
//! All slots live in one arena (`PropertyTable`) owned by the Context,
//! so cross-task references are plain indices. Evaluation happens only
//! during the single-threaded configuration phase; producers are
//! invoked at most once and memoized together with their lineage.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{ConfigError, KilnError};
use crate::task::TaskId;

// ============================================================================
// VALUES
// ============================================================================

/// A property value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
    Path(PathBuf),
    PathList(Vec<PathBuf>),
    StringList(Vec<String>),
    /// Opaque structured record (plugin extensions, callable args)
    Record(serde_json::Value),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Str(_) => ValueKind::Str,
            Value::Int(_) => ValueKind::Int,
            Value::Bool(_) => ValueKind::Bool,
            Value::Path(_) => ValueKind::Path,
            Value::PathList(_) => ValueKind::PathList,
            Value::StringList(_) => ValueKind::StringList,
            Value::Record(_) => ValueKind::Record,
        }
    }

    pub fn path(path: impl Into<PathBuf>) -> Self {
        Value::Path(path.into())
    }

    pub fn paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Value::PathList(paths.into_iter().map(Into::into).collect())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// View as a list of paths; a single `Path` coerces to one element
    pub fn as_path_list(&self) -> Option<Vec<PathBuf>> {
        match self {
            Value::Path(p) => Some(vec![p.clone()]),
            Value::PathList(list) => Some(list.clone()),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Record(v) => Some(v),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Declared type of a property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Str,
    Int,
    Bool,
    Path,
    PathList,
    StringList,
    Record,
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ValueKind::Str => "string",
            ValueKind::Int => "integer",
            ValueKind::Bool => "boolean",
            ValueKind::Path => "path",
            ValueKind::PathList => "list-of-path",
            ValueKind::StringList => "list-of-string",
            ValueKind::Record => "record",
        };
        write!(f, "{}", name)
    }
}

// ============================================================================
// SLOTS
// ============================================================================

/// Handle to a property slot in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyId(pub(crate) u32);

/// Deferred producer: invoked once during configuration. Reads through
/// the handed-in reader are recorded into the property's lineage.
pub type ProducerFn =
    Arc<dyn Fn(&mut PropertyReader<'_>) -> Result<Value, KilnError> + Send + Sync>;

enum Source {
    Unset,
    Literal(Value),
    Producer(ProducerFn),
    Reference(PropertyId),
}

struct Slot {
    owner: TaskId,
    /// Owning task path, for error messages
    owner_path: Arc<str>,
    name: Arc<str>,
    kind: ValueKind,
    source: Source,
    /// Memoized value, filled on first evaluation
    value: Option<Value>,
    /// Memoized lineage, filled together with `value`
    lineage: Option<Vec<PropertyId>>,
}

impl Slot {
    fn qualified_name(&self) -> String {
        format!("{}.{}", self.owner_path, self.name)
    }
}

// ============================================================================
// TABLE
// ============================================================================

/// Arena of all property slots in a Context
pub struct PropertyTable {
    slots: Vec<Slot>,
    /// Evaluation stack for lineage capture and cycle detection
    stack: Vec<PropertyId>,
    frozen: bool,
}

impl Default for PropertyTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PropertyTable {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            stack: Vec::new(),
            frozen: false,
        }
    }

    /// Create a new slot for `(owner, name)`
    pub fn declare(
        &mut self,
        owner: TaskId,
        owner_path: Arc<str>,
        name: &str,
        kind: ValueKind,
    ) -> PropertyId {
        let id = PropertyId(self.slots.len() as u32);
        self.slots.push(Slot {
            owner,
            owner_path,
            name: Arc::from(name),
            kind,
            source: Source::Unset,
            value: None,
            lineage: None,
        });
        id
    }

    pub fn owner(&self, id: PropertyId) -> TaskId {
        self.slots[id.0 as usize].owner
    }

    pub fn owner_path(&self, id: PropertyId) -> Arc<str> {
        Arc::clone(&self.slots[id.0 as usize].owner_path)
    }

    pub fn name(&self, id: PropertyId) -> Arc<str> {
        Arc::clone(&self.slots[id.0 as usize].name)
    }

    pub fn kind(&self, id: PropertyId) -> ValueKind {
        self.slots[id.0 as usize].kind
    }

    pub fn is_set(&self, id: PropertyId) -> bool {
        !matches!(self.slots[id.0 as usize].source, Source::Unset)
    }

    /// Reject further mutation; called by `prepare_execution`
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    fn check_mutable(&self, id: PropertyId) -> Result<(), KilnError> {
        if self.frozen {
            return Err(ConfigError::Frozen {
                what: format!("property '{}'", self.slots[id.0 as usize].qualified_name()),
            }
            .into());
        }
        Ok(())
    }

    /// Set a literal value; the type is checked immediately
    pub fn set_literal(&mut self, id: PropertyId, value: Value) -> Result<(), KilnError> {
        self.check_mutable(id)?;
        let slot = &self.slots[id.0 as usize];
        if value.kind() != slot.kind {
            return Err(type_mismatch(slot, value.kind()));
        }
        let slot = &mut self.slots[id.0 as usize];
        slot.source = Source::Literal(value);
        slot.value = None;
        slot.lineage = None;
        Ok(())
    }

    /// Set a deferred producer; the type is checked at first evaluation
    pub fn set_producer(&mut self, id: PropertyId, producer: ProducerFn) -> Result<(), KilnError> {
        self.check_mutable(id)?;
        let slot = &mut self.slots[id.0 as usize];
        slot.source = Source::Producer(producer);
        slot.value = None;
        slot.lineage = None;
        Ok(())
    }

    /// Point this property at another; the type is checked at first evaluation
    pub fn set_reference(&mut self, id: PropertyId, target: PropertyId) -> Result<(), KilnError> {
        self.check_mutable(id)?;
        let slot = &mut self.slots[id.0 as usize];
        slot.source = Source::Reference(target);
        slot.value = None;
        slot.lineage = None;
        Ok(())
    }

    /// Lineage of an already-evaluated property (empty before evaluation)
    pub fn lineage(&self, id: PropertyId) -> &[PropertyId] {
        self.slots[id.0 as usize]
            .lineage
            .as_deref()
            .unwrap_or(&[])
    }

    /// Evaluate a property, memoizing value and lineage.
    ///
    /// Re-entering a property already on the evaluation stack is a
    /// cycle; the error names the whole chain.
    pub fn evaluate(&mut self, id: PropertyId) -> Result<Value, KilnError> {
        if let Some(value) = &self.slots[id.0 as usize].value {
            return Ok(value.clone());
        }

        if self.stack.contains(&id) {
            let mut chain: Vec<String> = self
                .stack
                .iter()
                .skip_while(|p| **p != id)
                .map(|p| self.slots[p.0 as usize].qualified_name())
                .collect();
            chain.push(self.slots[id.0 as usize].qualified_name());
            return Err(ConfigError::CyclicProperty { chain }.into());
        }

        // Snapshot the source so the arena stays borrowable during the call
        enum Fetched {
            Unset,
            Literal(Value),
            Producer(ProducerFn),
            Reference(PropertyId),
        }
        let fetched = match &self.slots[id.0 as usize].source {
            Source::Unset => Fetched::Unset,
            Source::Literal(v) => Fetched::Literal(v.clone()),
            Source::Producer(f) => Fetched::Producer(Arc::clone(f)),
            Source::Reference(r) => Fetched::Reference(*r),
        };

        self.stack.push(id);
        let result = match fetched {
            Fetched::Unset => {
                let slot = &self.slots[id.0 as usize];
                Err(ConfigError::MissingProperty {
                    task: slot.owner_path.to_string(),
                    property: slot.name.to_string(),
                }
                .into())
            }
            Fetched::Literal(value) => {
                self.memoize(id, value.clone(), Vec::new());
                Ok(value)
            }
            Fetched::Reference(target) => self.evaluate(target).and_then(|value| {
                let slot = &self.slots[id.0 as usize];
                if value.kind() != slot.kind {
                    return Err(type_mismatch(slot, value.kind()));
                }
                let mut lineage = vec![target];
                lineage.extend_from_slice(self.lineage(target));
                dedup_sorted(&mut lineage);
                self.memoize(id, value.clone(), lineage);
                Ok(value)
            }),
            Fetched::Producer(producer) => {
                let mut reader = PropertyReader {
                    table: self,
                    reads: Vec::new(),
                };
                let produced = producer(&mut reader);
                let reads = reader.reads;
                produced.and_then(|value| {
                    let slot = &self.slots[id.0 as usize];
                    if value.kind() != slot.kind {
                        return Err(type_mismatch(slot, value.kind()));
                    }
                    let mut lineage = Vec::new();
                    for read in reads {
                        lineage.push(read);
                        lineage.extend_from_slice(self.lineage(read));
                    }
                    dedup_sorted(&mut lineage);
                    self.memoize(id, value.clone(), lineage);
                    Ok(value)
                })
            }
        };
        self.stack.pop();
        result
    }

    fn memoize(&mut self, id: PropertyId, value: Value, lineage: Vec<PropertyId>) {
        debug_assert!(!lineage.contains(&id), "lineage must not contain the property itself");
        let slot = &mut self.slots[id.0 as usize];
        slot.value = Some(value);
        slot.lineage = Some(lineage);
    }
}

fn type_mismatch(slot: &Slot, actual: ValueKind) -> KilnError {
    ConfigError::TypeMismatch {
        task: slot.owner_path.to_string(),
        property: slot.name.to_string(),
        expected: slot.kind.to_string(),
        actual: actual.to_string(),
    }
    .into()
}

fn dedup_sorted(ids: &mut Vec<PropertyId>) {
    ids.sort_unstable();
    ids.dedup();
}

// ============================================================================
// READER
// ============================================================================

/// Handle passed to producers: the only way a producer reads other
/// properties, so every read lands in the lineage being captured.
pub struct PropertyReader<'a> {
    table: &'a mut PropertyTable,
    reads: Vec<PropertyId>,
}

impl PropertyReader<'_> {
    pub fn get(&mut self, id: PropertyId) -> Result<Value, KilnError> {
        let value = self.table.evaluate(id)?;
        self.reads.push(id);
        Ok(value)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn table_with_task() -> (PropertyTable, TaskId, Arc<str>) {
        (PropertyTable::new(), TaskId(0), Arc::from(":t"))
    }

    #[test]
    fn literal_round_trips_and_typechecks() {
        let (mut table, task, path) = table_with_task();
        let prop = table.declare(task, Arc::clone(&path), "mode", ValueKind::Str);

        table.set_literal(prop, Value::from("release")).unwrap();
        assert_eq!(table.evaluate(prop).unwrap(), Value::from("release"));
        assert!(table.lineage(prop).is_empty());

        let err = table.set_literal(prop, Value::from(3)).unwrap_err();
        assert!(err.to_string().contains("expected string"));
    }

    #[test]
    fn unset_property_is_a_configuration_error() {
        let (mut table, task, path) = table_with_task();
        let prop = table.declare(task, path, "outputs", ValueKind::PathList);
        assert!(!table.is_set(prop));
        let err = table.evaluate(prop).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn producer_runs_once_and_memoizes() {
        let (mut table, task, path) = table_with_task();
        let prop = table.declare(task, path, "count", ValueKind::Int);

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        table
            .set_producer(
                prop,
                Arc::new(move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::from(7))
                }),
            )
            .unwrap();

        assert_eq!(table.evaluate(prop).unwrap(), Value::from(7));
        assert_eq!(table.evaluate(prop).unwrap(), Value::from(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reference_inherits_value_and_lineage() {
        let mut table = PropertyTable::new();
        let upstream_path: Arc<str> = Arc::from(":up");
        let downstream_path: Arc<str> = Arc::from(":down");

        let source = table.declare(TaskId(0), Arc::clone(&upstream_path), "out", ValueKind::Path);
        table.set_literal(source, Value::path("/tmp/a.o")).unwrap();

        let derived = table.declare(TaskId(0), upstream_path, "derived", ValueKind::Path);
        table.set_reference(derived, source).unwrap();

        let reference = table.declare(TaskId(1), downstream_path, "input", ValueKind::Path);
        table.set_reference(reference, derived).unwrap();

        assert_eq!(table.evaluate(reference).unwrap(), Value::path("/tmp/a.o"));
        let lineage = table.lineage(reference);
        assert!(lineage.contains(&derived));
        assert!(lineage.contains(&source));
        assert!(!lineage.contains(&reference));
    }

    #[test]
    fn producer_reads_are_captured_transitively() {
        let mut table = PropertyTable::new();
        let a = table.declare(TaskId(0), Arc::from(":a"), "out", ValueKind::Str);
        table.set_literal(a, Value::from("x")).unwrap();

        let b = table.declare(TaskId(1), Arc::from(":b"), "mid", ValueKind::Str);
        table
            .set_producer(
                b,
                Arc::new(move |reader| {
                    let v = reader.get(a)?;
                    Ok(Value::from(format!("{}-mid", v.as_str().unwrap())))
                }),
            )
            .unwrap();

        let c = table.declare(TaskId(2), Arc::from(":c"), "top", ValueKind::Str);
        table
            .set_producer(
                c,
                Arc::new(move |reader| {
                    let v = reader.get(b)?;
                    Ok(Value::from(format!("{}-top", v.as_str().unwrap())))
                }),
            )
            .unwrap();

        assert_eq!(table.evaluate(c).unwrap(), Value::from("x-mid-top"));
        let lineage = table.lineage(c);
        assert!(lineage.contains(&a), "transitive read must appear in lineage");
        assert!(lineage.contains(&b));
    }

    #[test]
    fn self_referential_evaluation_is_a_cycle() {
        let mut table = PropertyTable::new();
        let a = table.declare(TaskId(0), Arc::from(":a"), "x", ValueKind::Str);
        let b = table.declare(TaskId(0), Arc::from(":a"), "y", ValueKind::Str);
        table.set_reference(a, b).unwrap();
        table.set_reference(b, a).unwrap();

        let err = table.evaluate(a).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("cyclic property reference"));
        assert!(msg.contains(":a.x"));
        assert!(msg.contains(":a.y"));
    }

    #[test]
    fn frozen_table_rejects_mutation() {
        let (mut table, task, path) = table_with_task();
        let prop = table.declare(task, path, "mode", ValueKind::Str);
        table.freeze();
        let err = table.set_literal(prop, Value::from("debug")).unwrap_err();
        assert!(err.to_string().contains("frozen"));
    }

    #[test]
    fn reference_type_mismatch_reported_at_evaluation() {
        let mut table = PropertyTable::new();
        let source = table.declare(TaskId(0), Arc::from(":a"), "count", ValueKind::Int);
        table.set_literal(source, Value::from(3)).unwrap();

        let target = table.declare(TaskId(1), Arc::from(":b"), "name", ValueKind::Str);
        table.set_reference(target, source).unwrap();

        let err = table.evaluate(target).unwrap_err();
        assert!(err.to_string().contains("expected string, got integer"));
    }
}
