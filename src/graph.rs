//! Graph builder: transitive closure and topological order
//!
//! Walks explicit and implicit dependency edges from the selected
//! tasks with white/grey/black coloring. Hitting a grey vertex is a
//! cycle; the error names the whole cycle path. The resulting order is
//! stable: at every branch, neighbors are visited in lexicographic
//! task-path order.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ConfigError, KilnError};
use crate::task::{TaskId, TaskUnit};

/// The transitive closure of a selection, topologically ordered with
/// dependencies first, plus the baked unit for every member.
#[derive(Debug)]
pub struct ExecutionSet {
    pub order: Vec<TaskId>,
    pub units: HashMap<TaskId, TaskUnit>,
}

impl ExecutionSet {
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn unit(&self, id: TaskId) -> &TaskUnit {
        &self.units[&id]
    }

    /// Reverse edges within the set: who waits on whom
    pub fn dependents(&self) -> HashMap<TaskId, Vec<TaskId>> {
        let mut map: HashMap<TaskId, Vec<TaskId>> = HashMap::with_capacity(self.units.len());
        for id in &self.order {
            map.entry(*id).or_default();
        }
        for (id, unit) in &self.units {
            for dep in &unit.deps {
                map.entry(*dep).or_default().push(*id);
            }
        }
        map
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    Grey,
    Black,
}

/// Depth-first closure over `deps_of`, returning a topological order.
///
/// `deps_of` is consulted once per task and may do work (it evaluates
/// properties to derive implicit edges); `path_of` is used for the
/// deterministic visit order and for cycle reporting.
pub fn topo_closure(
    seeds: &[TaskId],
    mut deps_of: impl FnMut(TaskId) -> Result<Vec<TaskId>, KilnError>,
    path_of: impl Fn(TaskId) -> Arc<str>,
) -> Result<Vec<TaskId>, KilnError> {
    let mut colors: HashMap<TaskId, Color> = HashMap::new();
    let mut order: Vec<TaskId> = Vec::new();

    let mut roots: Vec<TaskId> = seeds.to_vec();
    roots.sort_by_key(|id| path_of(*id));
    roots.dedup();

    for root in roots {
        if colors.get(&root) == Some(&Color::Black) {
            continue;
        }

        let mut stack: Vec<Frame> = Vec::new();
        push_frame(&mut stack, root, &mut deps_of, &path_of, &mut colors)?;

        while let Some(frame) = stack.last_mut() {
            if frame.next >= frame.deps.len() {
                colors.insert(frame.task, Color::Black);
                order.push(frame.task);
                stack.pop();
                continue;
            }

            let dep = frame.deps[frame.next];
            frame.next += 1;

            match colors.get(&dep) {
                Some(Color::Black) => {}
                Some(Color::Grey) => {
                    // Cycle: report the grey chain from the first
                    // occurrence of `dep` back around to it
                    let mut chain: Vec<String> = stack
                        .iter()
                        .skip_while(|f| f.task != dep)
                        .map(|f| path_of(f.task).to_string())
                        .collect();
                    chain.push(path_of(dep).to_string());
                    return Err(ConfigError::CyclicTasks { chain }.into());
                }
                None => {
                    push_frame(&mut stack, dep, &mut deps_of, &path_of, &mut colors)?;
                }
            }
        }
    }

    Ok(order)
}

fn push_frame(
    stack: &mut Vec<Frame>,
    task: TaskId,
    deps_of: &mut impl FnMut(TaskId) -> Result<Vec<TaskId>, KilnError>,
    path_of: &impl Fn(TaskId) -> Arc<str>,
    colors: &mut HashMap<TaskId, Color>,
) -> Result<(), KilnError> {
    colors.insert(task, Color::Grey);
    let mut deps = deps_of(task)?;
    deps.sort_by_key(|id| path_of(*id));
    deps.dedup();
    stack.push(Frame {
        task,
        deps,
        next: 0,
    });
    Ok(())
}

/// Explicit DFS frame: a grey task and its sorted dependency cursor
struct Frame {
    task: TaskId,
    deps: Vec<TaskId>,
    next: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path_table(paths: &[&str]) -> impl Fn(TaskId) -> Arc<str> {
        let owned: Vec<Arc<str>> = paths.iter().map(|p| Arc::from(*p)).collect();
        move |id: TaskId| Arc::clone(&owned[id.0 as usize])
    }

    fn deps_table(edges: Vec<Vec<u32>>) -> impl FnMut(TaskId) -> Result<Vec<TaskId>, KilnError> {
        move |id: TaskId| Ok(edges[id.0 as usize].iter().map(|d| TaskId(*d)).collect())
    }

    #[test]
    fn dependencies_come_first() {
        // 0 -> 1 -> 2
        let order = topo_closure(
            &[TaskId(0)],
            deps_table(vec![vec![1], vec![2], vec![]]),
            path_table(&[":a", ":b", ":c"]),
        )
        .unwrap();
        assert_eq!(order, vec![TaskId(2), TaskId(1), TaskId(0)]);
    }

    #[test]
    fn closure_only_includes_reachable_tasks() {
        let order = topo_closure(
            &[TaskId(1)],
            deps_table(vec![vec![], vec![2], vec![]]),
            path_table(&[":a", ":b", ":c"]),
        )
        .unwrap();
        assert_eq!(order, vec![TaskId(2), TaskId(1)]);
    }

    #[test]
    fn ties_break_by_task_path() {
        // 0 depends on 2 and 1; 1 (:aa) must be visited before 2 (:zz)
        let order = topo_closure(
            &[TaskId(0)],
            deps_table(vec![vec![2, 1], vec![], vec![]]),
            path_table(&[":top", ":aa", ":zz"]),
        )
        .unwrap();
        assert_eq!(order, vec![TaskId(1), TaskId(2), TaskId(0)]);
    }

    #[test]
    fn two_task_cycle_names_both() {
        let err = topo_closure(
            &[TaskId(0)],
            deps_table(vec![vec![1], vec![0]]),
            path_table(&[":a", ":b"]),
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("cyclic task dependency"));
        assert!(msg.contains(":a"));
        assert!(msg.contains(":b"));
        assert!(err.is_configuration());
    }

    #[test]
    fn self_edge_is_a_cycle() {
        let err = topo_closure(
            &[TaskId(0)],
            deps_table(vec![vec![0]]),
            path_table(&[":a"]),
        )
        .unwrap_err();
        assert!(err.to_string().contains(":a -> :a"));
    }

    #[test]
    fn diamond_is_visited_once() {
        // 0 -> {1, 2}, both -> 3
        let order = topo_closure(
            &[TaskId(0)],
            deps_table(vec![vec![1, 2], vec![3], vec![3], vec![]]),
            path_table(&[":d", ":b", ":c", ":a"]),
        )
        .unwrap();
        assert_eq!(order, vec![TaskId(3), TaskId(1), TaskId(2), TaskId(0)]);
    }
}
