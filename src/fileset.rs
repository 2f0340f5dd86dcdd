//! Include/exclude file sets with glob expansion
//!
//! Patterns use `*`, `**`, `?` and character classes; `**` matches zero
//! or more path segments. Excludes are applied after includes. Results
//! are sorted lexicographically and deduplicated so the same tree
//! always yields the same ordered list.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};

use crate::error::{InputError, KilnError};
use crate::paths;

/// A lazily-resolved set of files under a base directory
#[derive(Debug, Clone)]
pub struct FileSet {
    base: PathBuf,
    includes: Vec<String>,
    excludes: Vec<String>,
    /// When set, an include pattern matching nothing is an error
    strict: bool,
}

impl FileSet {
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self {
            base: paths::normalize(base.as_ref()),
            includes: Vec::new(),
            excludes: Vec::new(),
            strict: false,
        }
    }

    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.includes.push(pattern.into());
        self
    }

    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.excludes.push(pattern.into());
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Expand the patterns against the filesystem.
    ///
    /// A missing base directory is always an error; an include pattern
    /// with zero matches is an error only in strict mode.
    pub fn resolve(&self) -> Result<Vec<PathBuf>, KilnError> {
        if !self.base.is_dir() {
            return Err(InputError::MissingBase {
                base: self.base.clone(),
            }
            .into());
        }

        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };

        let exclude_patterns: Vec<Pattern> = self
            .excludes
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|e| InputError::BadPattern {
                    pattern: p.clone(),
                    detail: e.to_string(),
                })
            })
            .collect::<Result<_, _>>()?;

        let mut matched: BTreeSet<PathBuf> = BTreeSet::new();
        for pattern in &self.includes {
            let full = self.base.join(pattern);
            let full = full.to_string_lossy();
            let walker = glob::glob_with(&full, options).map_err(|e| InputError::BadPattern {
                pattern: pattern.clone(),
                detail: e.to_string(),
            })?;

            let mut hits = 0usize;
            for entry in walker {
                let path = entry.map_err(|e| InputError::GlobIo {
                    path: e.path().to_path_buf(),
                    detail: e.error().to_string(),
                })?;
                if !path.is_file() {
                    continue;
                }
                hits += 1;
                let rel = path.strip_prefix(&self.base).unwrap_or(&path);
                if exclude_patterns
                    .iter()
                    .any(|ex| ex.matches_path_with(rel, options))
                {
                    continue;
                }
                matched.insert(paths::normalize(&path));
            }

            if hits == 0 && self.strict {
                return Err(InputError::EmptyGlob {
                    pattern: pattern.clone(),
                }
                .into());
            }
        }

        Ok(matched.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn seed_tree(root: &Path) {
        fs::create_dir_all(root.join("src/sub")).unwrap();
        fs::write(root.join("src/a.c"), "int a;").unwrap();
        fs::write(root.join("src/b.c"), "int b;").unwrap();
        fs::write(root.join("src/b.h"), "extern int b;").unwrap();
        fs::write(root.join("src/sub/c.c"), "int c;").unwrap();
    }

    #[test]
    fn glob_results_are_sorted_and_deduplicated() {
        let tmp = tempfile::tempdir().unwrap();
        seed_tree(tmp.path());

        let files = FileSet::new(tmp.path())
            .include("src/**/*.c")
            .include("src/*.c")
            .resolve()
            .unwrap();

        let names: Vec<String> = files
            .iter()
            .map(|p| p.strip_prefix(tmp.path()).unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["src/a.c", "src/b.c", "src/sub/c.c"]);
    }

    #[test]
    fn excludes_apply_after_includes() {
        let tmp = tempfile::tempdir().unwrap();
        seed_tree(tmp.path());

        let files = FileSet::new(tmp.path())
            .include("src/**/*.c")
            .exclude("src/sub/*")
            .resolve()
            .unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|p| !p.to_string_lossy().contains("sub")));
    }

    #[test]
    fn identical_inputs_give_identical_output() {
        let tmp = tempfile::tempdir().unwrap();
        seed_tree(tmp.path());

        let set = FileSet::new(tmp.path()).include("src/**/*.c").exclude("src/a.c");
        assert_eq!(set.resolve().unwrap(), set.resolve().unwrap());
    }

    #[test]
    fn missing_base_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let result = FileSet::new(tmp.path().join("nope")).include("*.c").resolve();
        assert!(matches!(
            result,
            Err(KilnError::Input(InputError::MissingBase { .. }))
        ));
    }

    #[test]
    fn empty_match_allowed_unless_strict() {
        let tmp = tempfile::tempdir().unwrap();
        seed_tree(tmp.path());

        let relaxed = FileSet::new(tmp.path()).include("*.zig").resolve().unwrap();
        assert!(relaxed.is_empty());

        let strict = FileSet::new(tmp.path()).include("*.zig").strict(true).resolve();
        assert!(matches!(
            strict,
            Err(KilnError::Input(InputError::EmptyGlob { .. }))
        ));
    }
}
