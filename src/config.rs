//! Build settings and environment overrides
//!
//! Precedence: CLI flags > environment variables > defaults.
//!
//! Environment variables consumed: `KILN_BUILD_DIR`, `KILN_PARALLEL`,
//! `KILN_NO_COLOR`. Unrecognized variables are ignored.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Grace period between terminate and kill when cancelling a child process
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Global settings for one build invocation
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root project directory
    pub root_dir: PathBuf,

    /// Build-output directory (fingerprints, logs, tmp)
    pub build_dir: PathBuf,

    /// Worker pool size; fixed for the whole execution phase
    pub parallel: usize,

    /// Treat every task as out of date
    pub force_rerun: bool,

    /// Treat every task's failure policy as `Continue`
    pub continue_on_error: bool,

    /// Colored console output
    pub color: bool,
}

impl Settings {
    /// Settings rooted at `root_dir`, with environment overrides applied
    pub fn for_dir(root_dir: impl AsRef<Path>) -> Self {
        let root_dir = crate::paths::normalize(root_dir.as_ref());
        let build_dir = match std::env::var_os("KILN_BUILD_DIR") {
            Some(dir) => crate::paths::normalize(Path::new(&dir)),
            None => root_dir.join("build"),
        };

        let parallel = std::env::var("KILN_PARALLEL")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or_else(num_cpus::get);

        let color = std::env::var_os("KILN_NO_COLOR").is_none();

        Self {
            root_dir,
            build_dir,
            parallel,
            force_rerun: false,
            continue_on_error: false,
            color,
        }
    }

    /// Override the worker count (CLI flag)
    pub fn with_parallel(mut self, workers: usize) -> Self {
        self.parallel = workers.max(1);
        self
    }

    /// Override the build-output directory (CLI flag)
    pub fn with_build_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.build_dir = crate::paths::normalize(dir.as_ref());
        self
    }

    pub fn with_force_rerun(mut self, force: bool) -> Self {
        self.force_rerun = force;
        self
    }

    pub fn with_continue_on_error(mut self, cont: bool) -> Self {
        self.continue_on_error = cont;
        self
    }

    /// Directory holding per-task fingerprint records
    pub fn fingerprint_dir(&self) -> PathBuf {
        self.build_dir.join("fingerprints")
    }

    /// Directory holding per-task logs
    pub fn log_dir(&self) -> PathBuf {
        self.build_dir.join("logs")
    }

    /// Scratch directory for atomic writes
    pub fn tmp_dir(&self) -> PathBuf {
        self.build_dir.join("tmp")
    }
}
