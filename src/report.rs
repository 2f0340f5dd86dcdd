//! Build report: per-task outcomes and the user-visible summary

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;

use crate::error::TaskFailure;

/// Terminal outcome of one task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// One row of the summary
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub path: Arc<str>,
    pub status: TaskStatus,
    pub duration: Duration,
    pub failure: Option<TaskFailure>,
    /// Log file for tasks that actually ran
    pub log_path: Option<PathBuf>,
}

/// Outcome of one execution
#[derive(Debug, Clone)]
pub struct BuildReport {
    /// In completion order
    pub entries: Vec<TaskReport>,
    /// Set when the user (not a task failure) cancelled the build
    pub cancelled_by_user: bool,
    pub elapsed: Duration,
}

impl BuildReport {
    /// Worst outcome wins: user cancellation 3, any failure 2, else 0
    pub fn exit_code(&self) -> i32 {
        if self.cancelled_by_user {
            3
        } else if self.entries.iter().any(|e| e.status == TaskStatus::Failed) {
            2
        } else {
            0
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code() == 0
    }

    pub fn status_of(&self, path: &str) -> Option<TaskStatus> {
        self.entries
            .iter()
            .find(|e| &*e.path == path)
            .map(|e| e.status)
    }

    pub fn first_failure(&self) -> Option<&TaskReport> {
        self.entries.iter().find(|e| e.status == TaskStatus::Failed)
    }

    fn count(&self, status: TaskStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }

    /// Render the per-task summary table
    pub fn render(&self) -> String {
        let mut out = String::new();
        let width = self
            .entries
            .iter()
            .map(|e| e.path.len())
            .max()
            .unwrap_or(0);

        for entry in &self.entries {
            let status = match entry.status {
                TaskStatus::Succeeded => "succeeded".green(),
                TaskStatus::Failed => "failed".red().bold(),
                TaskStatus::Skipped => "skipped (up to date)".cyan(),
                TaskStatus::Cancelled => "cancelled".yellow(),
            };
            out.push_str(&format!(
                "  {:width$}  {}  {:.1?}\n",
                entry.path,
                status,
                entry.duration,
                width = width
            ));
            if let Some(failure) = &entry.failure {
                out.push_str(&format!("      {}\n", failure.message));
                if let Some(upstream) = &failure.upstream {
                    out.push_str(&format!("      upstream failure: {}\n", upstream));
                }
            }
        }

        out.push_str(&format!(
            "\n{} succeeded, {} skipped, {} failed, {} cancelled in {:.1?}\n",
            self.count(TaskStatus::Succeeded),
            self.count(TaskStatus::Skipped),
            self.count(TaskStatus::Failed),
            self.count(TaskStatus::Cancelled),
            self.elapsed
        ));
        out
    }
}
