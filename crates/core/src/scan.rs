//! Working-tree scanning with gitignore support via the `ignore` crate

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use color_eyre::Result;
use ignore::WalkBuilder;
use ignore::overrides::{Override, OverrideBuilder};
use serde::{Deserialize, Serialize};

use crate::config::CONFIG_FILE;
use crate::hash::ContentHash;

/// Administrative directory kept next to the working files (base state lives here)
pub const ADMIN_DIR: &str = ".catchup";

/// Filename for force-include patterns (like .gitignore, but inverted)
pub const INCLUDE_FILE: &str = ".catchupinclude";

/// Metadata for a single local file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Relative path from the working-tree root
    pub path: PathBuf,
    /// File size in bytes
    pub size: u64,
    /// Modification time
    pub modified: SystemTime,
    /// Content hash (BLAKE3)
    pub hash: ContentHash,
}

impl FileEntry {
    /// Read metadata and hash for `full_path`, recording it under `relative`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be stat'ed or read.
    pub fn from_path(full_path: &Path, relative: PathBuf) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(full_path)?;
        Ok(Self {
            path: relative,
            size: metadata.len(),
            modified: metadata.modified()?,
            hash: ContentHash::from_file(full_path)?,
        })
    }

    /// Modification time in whole seconds since the UNIX epoch
    #[must_use]
    pub fn modified_secs(&self) -> i64 {
        self.modified
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
    }
}

/// Scanner for working trees with gitignore support
pub struct Scanner {
    root: PathBuf,
    /// Additional ignore patterns beyond .gitignore
    extra_ignores: Vec<String>,
    /// Patterns to force-include even if gitignored
    includes: Vec<String>,
}

impl Scanner {
    /// Create a new scanner for the given root directory
    ///
    /// Loads patterns from `.catchupinclude` if present.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let includes = std::fs::read_to_string(root.join(INCLUDE_FILE))
            .map(|contents| {
                contents
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && !line.starts_with('#'))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            root,
            extra_ignores: Vec::new(),
            includes,
        }
    }

    /// Add an extra ignore pattern (a path to an ignore file)
    #[must_use]
    pub fn ignore(mut self, pattern: impl Into<String>) -> Self {
        self.extra_ignores.push(pattern.into());
        self
    }

    /// Force-include a glob even if it matches .gitignore
    #[must_use]
    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.includes.push(pattern.into());
        self
    }

    fn walk_builder(&self, respect_ignores: bool) -> WalkBuilder {
        let mut builder = WalkBuilder::new(&self.root);
        builder
            .hidden(false)
            .git_ignore(respect_ignores)
            .git_global(respect_ignores)
            .git_exclude(respect_ignores)
            .require_git(false)
            .filter_entry(|e| {
                let name = e.file_name();
                name != ".git" && name != ADMIN_DIR && name != CONFIG_FILE
            });

        if respect_ignores {
            for pattern in &self.extra_ignores {
                builder.add_ignore(pattern);
            }
        }

        builder
    }

    fn include_matcher(&self) -> Result<Option<Override>> {
        if self.includes.is_empty() {
            return Ok(None);
        }

        let mut overrides = OverrideBuilder::new(&self.root);
        for pattern in &self.includes {
            overrides.add(pattern)?;
        }
        Ok(Some(overrides.build()?))
    }

    /// Walk the tree, keeping files accepted by `keep`
    fn walk(
        &self,
        respect_ignores: bool,
        keep: impl Fn(&Path) -> bool,
    ) -> Result<Vec<FileEntry>> {
        let mut entries = Vec::new();
        for result in self.walk_builder(respect_ignores).build() {
            let entry = result?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let relative = path.strip_prefix(&self.root)?.to_path_buf();
            if keep(&relative) {
                entries.push(FileEntry::from_path(path, relative)?);
            }
        }
        Ok(entries)
    }

    /// Scan the tree and return all file entries, sorted by path
    ///
    /// # Errors
    /// Returns an error if directory traversal or file reading fails
    pub fn scan(&self) -> Result<Vec<FileEntry>> {
        let mut entries = self.walk(true, |_| true)?;
        let seen: HashSet<PathBuf> = entries.iter().map(|e| e.path.clone()).collect();

        if let Some(matcher) = self.include_matcher()? {
            let included = self.walk(false, |relative| {
                !seen.contains(relative) && matcher.matched(relative, false).is_whitelist()
            })?;
            entries.extend(included);
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn paths(entries: &[FileEntry]) -> Vec<PathBuf> {
        entries.iter().map(|e| e.path.clone()).collect()
    }

    #[test]
    fn test_scan_nested_sorted() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sub/dir")).unwrap();
        fs::write(dir.path().join("root.txt"), "root").unwrap();
        fs::write(dir.path().join("sub/nested.txt"), "nested").unwrap();
        fs::write(dir.path().join("sub/dir/deep.txt"), "deep").unwrap();

        let entries = Scanner::new(dir.path()).scan().unwrap();

        assert_eq!(
            paths(&entries),
            vec![
                PathBuf::from("root.txt"),
                PathBuf::from("sub/dir/deep.txt"),
                PathBuf::from("sub/nested.txt"),
            ]
        );
        assert_eq!(entries[0].hash, ContentHash::from_bytes(b"root"));
        assert_eq!(entries[0].size, 4);
    }

    #[test]
    fn test_scan_skips_admin_dir() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(ADMIN_DIR)).unwrap();
        fs::write(dir.path().join(ADMIN_DIR).join("base.rkyv"), "state").unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();

        let entries = Scanner::new(dir.path()).scan().unwrap();
        assert_eq!(paths(&entries), vec![PathBuf::from("a.txt")]);
    }

    #[test]
    fn test_scan_respects_gitignore() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".gitignore"), "*.log\n").unwrap();
        fs::write(dir.path().join("keep.txt"), "keep").unwrap();
        fs::write(dir.path().join("ignore.log"), "ignore").unwrap();

        let found = paths(&Scanner::new(dir.path()).scan().unwrap());
        assert!(found.contains(&PathBuf::from("keep.txt")), "{found:?}");
        assert!(!found.contains(&PathBuf::from("ignore.log")), "{found:?}");
    }

    #[test]
    fn test_include_file_overrides_gitignore() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join(".gitignore"), ".env\n").unwrap();
        fs::write(dir.path().join(".env"), "SECRET=123").unwrap();
        fs::write(dir.path().join(INCLUDE_FILE), "# forced\n.env\n").unwrap();

        let found = paths(&Scanner::new(dir.path()).scan().unwrap());
        assert!(found.contains(&PathBuf::from(".env")), "{found:?}");
    }

    #[test]
    fn test_modified_secs() {
        let entry = FileEntry {
            path: PathBuf::from("a"),
            size: 0,
            modified: UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000),
            hash: ContentHash::from_bytes(b""),
        };
        assert_eq!(entry.modified_secs(), 1_700_000_000);
    }
}
