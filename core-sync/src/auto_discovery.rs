//! # Repository Discovery
//!
//! Finds code repositories below a set of scan roots.
//!
//! ## Overview
//!
//! A directory counts as a repository when it carries at least one project
//! marker (`.git`, `Cargo.toml`, `package.json`, a `*.sln` file, ...) and
//! holds at least `min_code_files` source files. Once a directory is taken
//! as a repository its subdirectories are not searched for further
//! repositories. Hidden and excluded directories are never entered.
//!
//! Each hit is profiled: dominant language, size of its code files and the
//! newest modification time. Results are ordered largest first.
//!
//! Scanning is blocking filesystem work; async callers run it on
//! `spawn_blocking`.

use chrono::{DateTime, Utc};
use core_runtime::config::AutoSyncConfig;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

/// Files and directories that mark a project root
const PROJECT_MARKERS: &[&str] = &[
    "package.json",
    "pom.xml",
    "build.gradle",
    "Cargo.toml",
    "go.mod",
    "requirements.txt",
    "Gemfile",
    "composer.json",
    ".project",
    ".vscode",
    ".idea",
    "Makefile",
    "README.md",
    "README.rst",
    "README.txt",
];

/// Language name, source extensions and build files
const LANGUAGES: &[(&str, &[&str], &[&str])] = &[
    ("python", &["py"], &["requirements.txt", "pyproject.toml"]),
    ("javascript", &["js", "jsx", "mjs"], &["package.json"]),
    ("typescript", &["ts", "tsx"], &["tsconfig.json"]),
    ("java", &["java"], &["pom.xml", "build.gradle"]),
    ("go", &["go"], &["go.mod"]),
    ("rust", &["rs"], &["Cargo.toml"]),
    ("ruby", &["rb"], &["Gemfile"]),
    ("php", &["php"], &["composer.json"]),
    ("csharp", &["cs"], &[]),
    ("cpp", &["cpp", "cc", "cxx", "hpp", "h"], &["CMakeLists.txt"]),
];

/// Upper bound on files looked at while profiling one repository
const MAX_PROFILED_FILES: usize = 20_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryKind {
    Git,
    Unknown,
}

/// A repository found by [`RepositoryScanner::scan`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredRepository {
    pub path: PathBuf,
    /// Unique within one scan
    pub name: String,
    pub kind: RepositoryKind,
    /// Language with the most code files
    pub language: Option<String>,
    /// Bytes in code files
    pub size: u64,
    pub code_files: usize,
    pub last_modified: Option<DateTime<Utc>>,
    /// Markers that qualified the directory
    pub indicators: Vec<String>,
}

#[derive(Debug, Default)]
struct Profile {
    languages: BTreeMap<&'static str, usize>,
    code_files: usize,
    size: u64,
    last_modified: Option<DateTime<Utc>>,
}

impl Profile {
    fn dominant_language(&self) -> Option<String> {
        self.languages
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(language, _)| language.to_string())
    }
}

/// Walks scan roots looking for repositories
#[derive(Debug, Clone)]
pub struct RepositoryScanner {
    roots: Vec<PathBuf>,
    excluded_dirs: BTreeSet<String>,
    max_depth: usize,
    min_code_files: usize,
}

impl RepositoryScanner {
    pub fn new(config: &AutoSyncConfig) -> Self {
        Self {
            roots: config.scan_paths.clone(),
            excluded_dirs: config.excluded_dirs.clone(),
            max_depth: config.max_depth,
            min_code_files: config.min_code_files,
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Find every repository below the scan roots. Blocking.
    ///
    /// Unreadable roots and directories are logged and skipped.
    pub fn scan(&self) -> Vec<DiscoveredRepository> {
        let mut found: BTreeMap<PathBuf, DiscoveredRepository> = BTreeMap::new();

        for root in &self.roots {
            let root = match fs::canonicalize(root) {
                Ok(root) if root.is_dir() => root,
                Ok(_) => {
                    warn!("Scan path {} is not a directory", root.display());
                    continue;
                }
                Err(e) => {
                    warn!("Cannot scan {}: {}", root.display(), e);
                    continue;
                }
            };

            let mut walk = WalkDir::new(&root)
                .follow_links(false)
                .max_depth(self.max_depth)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| e.file_type().is_dir() && (e.depth() == 0 || !self.skips(e)));

            while let Some(entry) = walk.next() {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        debug!("Skipping unreadable directory: {}", e);
                        continue;
                    }
                };
                if found.contains_key(entry.path()) {
                    walk.skip_current_dir();
                    continue;
                }
                if let Some(repository) = self.detect(entry.path()) {
                    debug!(
                        "Found repository {} at {}",
                        repository.name,
                        repository.path.display()
                    );
                    found.insert(repository.path.clone(), repository);
                    walk.skip_current_dir();
                }
            }
        }

        let mut repositories: Vec<DiscoveredRepository> = found.into_values().collect();
        assign_unique_names(&mut repositories);
        repositories.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.path.cmp(&b.path)));

        info!(
            "Discovered {} repositories under {} scan paths",
            repositories.len(),
            self.roots.len()
        );
        repositories
    }

    /// Hidden or excluded directory
    fn skips(&self, entry: &DirEntry) -> bool {
        let name = entry.file_name().to_string_lossy();
        name.starts_with('.') || self.excluded_dirs.contains(&name.to_lowercase())
    }

    /// Inspect one directory
    fn detect(&self, path: &Path) -> Option<DiscoveredRepository> {
        let is_git = path.join(".git").exists();
        let mut indicators = Vec::new();
        if is_git {
            indicators.push(".git".to_string());
        }
        for marker in PROJECT_MARKERS {
            if path.join(marker).exists() {
                indicators.push(marker.to_string());
            }
        }
        if has_solution_file(path) {
            indicators.push("*.sln".to_string());
        }
        if indicators.is_empty() {
            return None;
        }

        let profile = self.profile(path);
        if profile.code_files < self.min_code_files.max(1) {
            debug!(
                "Skipping {}: {} code files",
                path.display(),
                profile.code_files
            );
            return None;
        }

        Some(DiscoveredRepository {
            path: path.to_path_buf(),
            name: repository_name(path, is_git),
            kind: if is_git {
                RepositoryKind::Git
            } else {
                RepositoryKind::Unknown
            },
            language: profile.dominant_language(),
            size: profile.size,
            code_files: profile.code_files,
            last_modified: profile.last_modified,
            indicators,
        })
    }

    fn profile(&self, path: &Path) -> Profile {
        let mut profile = Profile::default();
        let files = WalkDir::new(path)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !e.file_type().is_dir() || !self.skips(e))
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .take(MAX_PROFILED_FILES);

        for entry in files {
            let Some(language) = language_of(&entry.file_name().to_string_lossy()) else {
                continue;
            };
            *profile.languages.entry(language).or_default() += 1;
            profile.code_files += 1;

            if let Ok(metadata) = entry.metadata() {
                profile.size += metadata.len();
                if let Ok(modified) = metadata.modified() {
                    let modified = DateTime::<Utc>::from(modified);
                    if profile.last_modified.map_or(true, |newest| modified > newest) {
                        profile.last_modified = Some(modified);
                    }
                }
            }
        }
        profile
    }
}

/// Language a file belongs to, by build-file name or extension
pub fn language_of(file_name: &str) -> Option<&'static str> {
    if let Some((language, _, _)) = LANGUAGES
        .iter()
        .find(|(_, _, build_files)| build_files.contains(&file_name))
    {
        return Some(*language);
    }

    let (stem, extension) = file_name.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    let extension = extension.to_ascii_lowercase();
    LANGUAGES
        .iter()
        .find(|(_, extensions, _)| extensions.contains(&extension.as_str()))
        .map(|(language, _, _)| *language)
}

fn has_solution_file(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|entries| {
            entries.filter_map(|e| e.ok()).any(|e| {
                e.path()
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("sln"))
            })
        })
        .unwrap_or(false)
}

/// Remote name from `.git/config`, else the directory name
fn repository_name(path: &Path, is_git: bool) -> String {
    if is_git {
        if let Some(name) = remote_name(&path.join(".git").join("config")) {
            return name;
        }
    }
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "repository".to_string())
}

fn remote_name(git_config: &Path) -> Option<String> {
    let content = fs::read_to_string(git_config).ok()?;
    let url = content.lines().find_map(|line| {
        let (key, value) = line.trim().split_once('=')?;
        (key.trim() == "url").then(|| value.trim().to_string())
    })?;

    let last = url
        .trim_end_matches('/')
        .rsplit(|c| c == '/' || c == ':')
        .next()?
        .trim_end_matches(".git");
    (!last.is_empty()).then(|| last.to_string())
}

/// Suffix `-2`, `-3`, ... onto names taken by an earlier path
fn assign_unique_names(repositories: &mut [DiscoveredRepository]) {
    let mut seen: HashMap<String, usize> = HashMap::new();
    for repository in repositories.iter_mut() {
        let count = seen.entry(repository.name.clone()).or_default();
        *count += 1;
        if *count > 1 {
            repository.name = format!("{}-{}", repository.name, count);
        }
    }
}
