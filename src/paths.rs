//! Path normalization and task-path encoding
//!
//! Normalization is lexical: no filesystem access, so paths to files
//! that do not exist yet (task outputs) normalize the same way as
//! existing ones. On targets whose filesystems are case-insensitive
//! by convention (Windows), normalization also case-folds, so two
//! spellings of one file compare, deduplicate and hash as one path.

use std::path::{Component, Path, PathBuf};

/// Normalize a path: absolute, `.` and `..` folded, no trailing
/// separator, case-folded on case-insensitive targets.
///
/// Relative paths are resolved against the current working directory.
/// Idempotent: `normalize(normalize(p)) == normalize(p)`.
pub fn normalize(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                // Never pop past the root
                if out.parent().is_some() {
                    out.pop();
                }
            }
            Component::Normal(seg) => out.push(seg),
        }
    }

    if cfg!(windows) {
        PathBuf::from(out.to_string_lossy().to_lowercase())
    } else {
        out
    }
}

/// Resolve `path` against `base` unless it is already absolute, then normalize
pub fn resolve_in(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize(path)
    } else {
        normalize(&base.join(path))
    }
}

/// Encode a `:`-separated project path as a single filesystem-safe
/// directory name. The root project encodes as `root`.
pub fn encode_project_path(path: &str) -> String {
    let trimmed = path.trim_start_matches(':');
    if trimmed.is_empty() {
        "root".to_string()
    } else {
        trimmed.replace(':', "_")
    }
}

/// Encode a full task path as a single filesystem-safe file stem,
/// e.g. `:app:compile` becomes `app_compile`.
pub fn encode_task_path(path: &str) -> String {
    path.trim_start_matches(':').replace(':', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_folds_dot_segments() {
        let p = normalize(Path::new("/a/./b/../c"));
        assert_eq!(p, PathBuf::from("/a/c"));
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize(Path::new("/a/b/../b/./c/"));
        let twice = normalize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn normalize_drops_trailing_separator() {
        assert_eq!(normalize(Path::new("/a/b/")), PathBuf::from("/a/b"));
    }

    #[test]
    fn normalize_stops_at_root() {
        assert_eq!(normalize(Path::new("/../../x")), PathBuf::from("/x"));
    }

    #[cfg(windows)]
    #[test]
    fn normalize_folds_case_on_case_insensitive_targets() {
        assert_eq!(
            normalize(Path::new(r"C:\Src\Main.C")),
            normalize(Path::new(r"c:\src\main.c"))
        );
    }

    #[cfg(not(windows))]
    #[test]
    fn normalize_preserves_case_on_case_sensitive_targets() {
        assert_ne!(
            normalize(Path::new("/src/Main.c")),
            normalize(Path::new("/src/main.c"))
        );
    }

    #[test]
    fn resolve_in_keeps_absolute_paths() {
        let resolved = resolve_in(Path::new("/base"), Path::new("/other/file"));
        assert_eq!(resolved, PathBuf::from("/other/file"));
    }

    #[test]
    fn resolve_in_joins_relative_paths() {
        let resolved = resolve_in(Path::new("/base"), Path::new("sub/file"));
        assert_eq!(resolved, PathBuf::from("/base/sub/file"));
    }

    #[test]
    fn project_path_encoding() {
        assert_eq!(encode_project_path(":"), "root");
        assert_eq!(encode_project_path(""), "root");
        assert_eq!(encode_project_path(":app"), "app");
        assert_eq!(encode_project_path(":app:lib"), "app_lib");
    }

    #[test]
    fn task_path_encoding() {
        assert_eq!(encode_task_path(":compile"), "compile");
        assert_eq!(encode_task_path(":app:lib:compile"), "app_lib_compile");
    }
}
