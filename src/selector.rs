//! Task selectors: `[:project_path][:task_name]`
//!
//! Resolution rules:
//!
//! - a name with no colon is local to the origin project
//! - a selector with a leading colon is absolute from the root
//! - a single-segment `:name` seen from a sub-project resolves in the
//!   nearest enclosing scope that defines it
//!
//! Unknown names fail at graph-build time with near-miss suggestions.

use crate::context::Context;
use crate::error::{ConfigError, KilnError};
use crate::project::ProjectId;
use crate::task::TaskId;

/// A parsed task selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    pub absolute: bool,
    pub segments: Vec<String>,
    pub raw: String,
}

impl Selector {
    pub fn parse(raw: &str) -> Result<Self, KilnError> {
        let absolute = raw.starts_with(':');
        let trimmed = if absolute { &raw[1..] } else { raw };
        if trimmed.is_empty() {
            return Err(unknown(raw, Vec::new()));
        }

        let segments: Vec<String> = trimmed.split(':').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(unknown(raw, Vec::new()));
        }

        Ok(Self {
            absolute,
            segments,
            raw: raw.to_string(),
        })
    }
}

fn unknown(selector: &str, candidates: Vec<String>) -> KilnError {
    ConfigError::UnknownSelector {
        selector: selector.to_string(),
        candidates,
    }
    .into()
}

/// Resolve a selector to a task, relative to `origin`
pub fn resolve(ctx: &Context, origin: ProjectId, raw: &str) -> Result<TaskId, KilnError> {
    let selector = Selector::parse(raw)?;
    let (name, project_segments) = selector
        .segments
        .split_last()
        .expect("parse guarantees at least one segment");

    if selector.absolute && project_segments.is_empty() {
        // `:name`: nearest enclosing scope that defines it
        let mut scope = Some(origin);
        while let Some(project_id) = scope {
            let project = ctx.project(project_id);
            if let Some(task) = project.task_named(name) {
                return Ok(task);
            }
            scope = project.parent;
        }
        return Err(unknown(raw, similar_tasks(ctx, ctx.root(), name)));
    }

    let start = if selector.absolute { ctx.root() } else { origin };
    let mut project_id = start;
    for segment in project_segments {
        project_id = match ctx.project(project_id).child_named(segment) {
            Some(child) => child,
            None => {
                return Err(ConfigError::UnknownProject {
                    selector: raw.to_string(),
                    path: segment.clone(),
                }
                .into());
            }
        };
    }

    ctx.project(project_id)
        .task_named(name)
        .ok_or_else(|| unknown(raw, similar_tasks(ctx, project_id, name)))
}

/// Near-miss task names in a project, closest first
fn similar_tasks(ctx: &Context, project: ProjectId, name: &str) -> Vec<String> {
    let project = ctx.project(project);
    let mut scored: Vec<(usize, String)> = project
        .task_names()
        .filter_map(|candidate| {
            let distance = edit_distance(name, candidate);
            (distance <= 2).then(|| (distance, format!("{}{}", prefix_of(&project.path), candidate)))
        })
        .collect();
    scored.sort();
    scored.into_iter().take(3).map(|(_, s)| s).collect()
}

fn prefix_of(project_path: &str) -> String {
    if project_path == ":" {
        ":".to_string()
    } else {
        format!("{}:", project_path)
    }
}

/// Plain Levenshtein distance; selector names are short
fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_absolute_and_relative() {
        let abs = Selector::parse(":lib:compile").unwrap();
        assert!(abs.absolute);
        assert_eq!(abs.segments, vec!["lib", "compile"]);

        let rel = Selector::parse("compile").unwrap();
        assert!(!rel.absolute);
        assert_eq!(rel.segments, vec!["compile"]);
    }

    #[test]
    fn parse_rejects_empty_and_degenerate() {
        assert!(Selector::parse("").is_err());
        assert!(Selector::parse(":").is_err());
        assert!(Selector::parse("a::b").is_err());
    }

    #[test]
    fn edit_distance_basics() {
        assert_eq!(edit_distance("compile", "compile"), 0);
        assert_eq!(edit_distance("compil", "compile"), 1);
        assert_eq!(edit_distance("kitten", "sitting"), 3);
        assert_eq!(edit_distance("", "abc"), 3);
    }
}
