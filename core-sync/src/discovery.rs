//! # File Discovery
//!
//! Lazy, restartable walk over a repository's candidate files.
//!
//! ## Overview
//!
//! [`Discovery`] describes a walk; every call to [`Discovery::iter`] starts a
//! fresh one. Entries come out in a stable order (sorted by file name at each
//! level) so progress is reproducible. The walk:
//!
//! - prunes excluded directories (`.git`, `node_modules`, `target`, ...)
//!   without descending into them
//! - keeps files whose extension is on the allow-list, plus extension-less
//!   special names such as `Dockerfile`
//! - reports files above the size ceiling as skipped
//! - does not follow symlinks
//!
//! A failure to read the root itself is reported as
//! [`DiscoveryItem::RootError`]; failures below the root only affect their
//! own subtree.

use core_runtime::config::SyncEngineConfig;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::{DirEntry, WalkDir};

/// Which files a walk yields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFilter {
    pub extensions: BTreeSet<String>,
    pub special_file_names: BTreeSet<String>,
    pub excluded_dirs: BTreeSet<String>,
    pub max_file_size: u64,
}

impl DiscoveryFilter {
    pub fn is_indexable_name(&self, file_name: &str) -> bool {
        let lower = file_name.to_ascii_lowercase();
        if self.special_file_names.contains(&lower) {
            return true;
        }
        match lower.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => self.extensions.contains(ext),
            _ => false,
        }
    }

    pub fn is_excluded_dir(&self, dir_name: &str) -> bool {
        let lower = dir_name.to_ascii_lowercase();
        self.excluded_dirs.contains(&lower) || lower.ends_with(".egg-info")
    }

    /// Whether any component of repository-relative `path` is excluded
    pub fn is_excluded_path(&self, path: &str) -> bool {
        let mut parts: Vec<&str> = path.split('/').collect();
        parts.pop();
        parts.into_iter().any(|dir| self.is_excluded_dir(dir))
    }
}

impl From<&SyncEngineConfig> for DiscoveryFilter {
    fn from(config: &SyncEngineConfig) -> Self {
        Self {
            extensions: config.extensions.clone(),
            special_file_names: config.special_file_names.clone(),
            excluded_dirs: config.excluded_dirs.clone(),
            max_file_size: config.max_file_size,
        }
    }
}

/// A candidate file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    /// Absolute (root-joined) path
    pub path: PathBuf,
    /// Repository-relative path with `/` separators
    pub relative: String,
    pub size: u64,
}

/// Why a matching file was left out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    TooLarge { size: u64, limit: u64 },
}

/// One step of a walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryItem {
    File(DiscoveredFile),
    Skipped { relative: String, reason: SkipReason },
    /// An entry below the root could not be read
    Error { path: String, message: String },
    /// The root itself is missing or unreadable
    RootError(String),
}

/// Description of a walk over `root`
#[derive(Debug, Clone)]
pub struct Discovery {
    root: PathBuf,
    filter: Arc<DiscoveryFilter>,
}

impl Discovery {
    pub fn new(root: impl Into<PathBuf>, filter: DiscoveryFilter) -> Self {
        Self {
            root: root.into(),
            filter: Arc::new(filter),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn filter(&self) -> &DiscoveryFilter {
        &self.filter
    }

    /// Start a new walk
    pub fn iter(&self) -> DiscoveryIter {
        let filter = Arc::clone(&self.filter);
        let prune: Box<dyn FnMut(&DirEntry) -> bool + Send> = Box::new(move |entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || !filter.is_excluded_dir(&entry.file_name().to_string_lossy())
        });

        let walk = WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(prune);

        DiscoveryIter {
            root: self.root.clone(),
            filter: Arc::clone(&self.filter),
            walk,
            finished: false,
        }
    }
}

impl<'a> IntoIterator for &'a Discovery {
    type Item = DiscoveryItem;
    type IntoIter = DiscoveryIter;

    fn into_iter(self) -> DiscoveryIter {
        self.iter()
    }
}

type Prune = Box<dyn FnMut(&DirEntry) -> bool + Send>;

/// Iterator returned by [`Discovery::iter`]
pub struct DiscoveryIter {
    root: PathBuf,
    filter: Arc<DiscoveryFilter>,
    walk: walkdir::FilterEntry<walkdir::IntoIter, Prune>,
    finished: bool,
}

impl Iterator for DiscoveryIter {
    type Item = DiscoveryItem;

    fn next(&mut self) -> Option<DiscoveryItem> {
        if self.finished {
            return None;
        }

        loop {
            let entry = match self.walk.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    if err.depth() == 0 {
                        self.finished = true;
                        return Some(DiscoveryItem::RootError(format!(
                            "{}: {}",
                            self.root.display(),
                            err
                        )));
                    }
                    let path = err
                        .path()
                        .map(|p| relative_path(&self.root, p))
                        .unwrap_or_default();
                    return Some(DiscoveryItem::Error {
                        path,
                        message: err.to_string(),
                    });
                }
            };

            if entry.depth() == 0 && !entry.file_type().is_dir() {
                self.finished = true;
                return Some(DiscoveryItem::RootError(format!(
                    "{} is not a directory",
                    self.root.display()
                )));
            }

            if !entry.file_type().is_file() {
                continue;
            }
            if !self.filter.is_indexable_name(&entry.file_name().to_string_lossy()) {
                continue;
            }

            let relative = relative_path(&self.root, entry.path());
            let size = match entry.metadata() {
                Ok(metadata) => metadata.len(),
                Err(err) => {
                    return Some(DiscoveryItem::Error {
                        path: relative,
                        message: err.to_string(),
                    })
                }
            };

            if size > self.filter.max_file_size {
                return Some(DiscoveryItem::Skipped {
                    relative,
                    reason: SkipReason::TooLarge {
                        size,
                        limit: self.filter.max_file_size,
                    },
                });
            }

            return Some(DiscoveryItem::File(DiscoveredFile {
                path: entry.into_path(),
                relative,
                size,
            }));
        }
    }
}

/// `path` relative to `root`, `/`-separated
pub fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn filter() -> DiscoveryFilter {
        DiscoveryFilter {
            extensions: ["rs", "md", "py"].iter().map(|s| s.to_string()).collect(),
            special_file_names: ["dockerfile"].iter().map(|s| s.to_string()).collect(),
            excluded_dirs: ["target", "node_modules", ".git"].iter().map(|s| s.to_string()).collect(),
            max_file_size: 64,
        }
    }

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn files(discovery: &Discovery) -> Vec<String> {
        discovery
            .iter()
            .filter_map(|item| match item {
                DiscoveryItem::File(f) => Some(f.relative),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_walk_filters_and_orders() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "src/main.rs", "fn main() {}");
        write(root, "src/lib.rs", "pub fn f() {}");
        write(root, "README.md", "# hi");
        write(root, "Dockerfile", "FROM scratch");
        write(root, "image.png", "binary");
        write(root, "target/debug/build.rs", "ignored");
        write(root, "node_modules/pkg/index.py", "ignored");
        write(root, ".git/config.md", "ignored");
        write(root, "pkg.egg-info/setup.py", "ignored");

        let discovery = Discovery::new(root, filter());
        assert_eq!(
            files(&discovery),
            vec!["Dockerfile", "README.md", "src/lib.rs", "src/main.rs"]
        );
    }

    #[test]
    fn test_walk_is_restartable() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.rs", "a");
        let discovery = Discovery::new(dir.path(), filter());

        assert_eq!(files(&discovery), vec!["a.rs"]);
        write(dir.path(), "b.rs", "b");
        assert_eq!(files(&discovery), vec!["a.rs", "b.rs"]);
        assert_eq!((&discovery).into_iter().count(), 2);
    }

    #[test]
    fn test_large_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "big.rs", &"x".repeat(65));
        let items: Vec<_> = Discovery::new(dir.path(), filter()).iter().collect();

        assert_eq!(
            items,
            vec![DiscoveryItem::Skipped {
                relative: "big.rs".into(),
                reason: SkipReason::TooLarge { size: 65, limit: 64 }
            }]
        );
    }

    #[test]
    fn test_missing_root_is_root_error() {
        let dir = tempfile::tempdir().unwrap();
        let items: Vec<_> = Discovery::new(dir.path().join("gone"), filter()).iter().collect();
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], DiscoveryItem::RootError(_)));
    }

    #[test]
    fn test_excluded_path_components() {
        let filter = filter();
        assert!(filter.is_excluded_path("target/debug/x.rs"));
        assert!(filter.is_excluded_path("a/node_modules/b.py"));
        assert!(!filter.is_excluded_path("src/target.rs"));
    }
}
