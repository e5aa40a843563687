//! # Core Configuration Module
//!
//! Provides configuration for the concurrent-access and background-sync
//! engine.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a
//! `SyncEngineConfig`. Every field has a default matching the documented
//! engine behavior, so the only thing a host has to supply is the store path.
//! `build()` runs fail-fast validation and returns an actionable error for
//! settings that cannot work together (for example a batch larger than the
//! queue that feeds it).
//!
//! Settings can also be overlaid from `MEMORY_SYNC_*` environment variables
//! with [`SyncEngineConfig::from_env`].
//!
//! ## Usage
//!
//! ```
//! use core_runtime::config::SyncEngineConfig;
//! use std::time::Duration;
//!
//! let config = SyncEngineConfig::builder()
//!     .store_path("/var/lib/memory/store")
//!     .batch_size(100)
//!     .flush_interval(Duration::from_millis(250))
//!     .build()
//!     .expect("valid config");
//!
//! assert_eq!(config.worker_threads, 4);
//! ```
//!
//! ## Error Handling
//!
//! ```should_panic
//! use core_runtime::config::SyncEngineConfig;
//!
//! // Batch size cannot exceed the queue capacity
//! let config = SyncEngineConfig::builder()
//!     .store_path("/tmp/store")
//!     .queue_capacity(10)
//!     .batch_size(50)
//!     .build()
//!     .expect("Should fail - batch larger than queue");
//! ```

use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_WORKER_THREADS: usize = 4;
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

const DEFAULT_EXTENSIONS: &[&str] = &[
    "py", "pyw", "js", "jsx", "mjs", "ts", "tsx", "go", "rs", "java", "cpp", "c", "h", "hpp",
    "cs", "php", "rb", "swift", "kt", "scala", "r", "sql", "sh", "bash", "zsh", "fish", "ps1",
    "yaml", "yml", "json", "xml", "html", "css", "scss", "less", "md", "rst", "txt",
    "dockerfile", "makefile",
];

const DEFAULT_SPECIAL_FILES: &[&str] = &["dockerfile", "makefile", "rakefile", "gemfile"];

const DEFAULT_EXCLUDED_DIRS: &[&str] = &[
    "__pycache__", ".git", ".svn", ".hg", "node_modules", ".pytest_cache", ".coverage", ".tox",
    ".venv", "venv", "env", ".env", "dist", "build", "target", ".idea", ".vscode", ".vs",
    ".mypy_cache", ".ruff_cache",
];

/// Environment variable prefix recognized by [`SyncEngineConfig::from_env`]
pub const ENV_PREFIX: &str = "MEMORY_SYNC_";

// ============================================================================
// Retry settings
// ============================================================================

/// Retry settings applied to storage operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry; doubles for each later one
    pub base_delay: Duration,
    /// Randomize each delay by up to ±20%
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            base_delay: DEFAULT_RETRY_BASE_DELAY,
            jitter: true,
        }
    }
}

// ============================================================================
// Engine configuration
// ============================================================================

/// Configuration for the sync engine.
///
/// Use [`SyncEngineConfigBuilder`] to construct instances.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncEngineConfig {
    /// Directory of the shared on-disk store; the lock file lives inside it
    pub store_path: PathBuf,

    /// SQLite file for persisted repository state (in-memory when `None`)
    pub state_database_path: Option<PathBuf>,

    /// Maximum time to wait for the store lock
    pub lock_timeout: Duration,

    /// Sleep between non-blocking attempts on the OS lock
    pub lock_poll_interval: Duration,

    /// Threads in the blocking-call bridge
    pub worker_threads: usize,

    /// Bounded write queue capacity (excess offers are dropped)
    pub queue_capacity: usize,

    /// Items written per lock hold
    pub batch_size: usize,

    /// Maximum time a partial batch waits before flushing
    pub flush_interval: Duration,

    /// Quiet period before a burst of file changes triggers a re-sync
    pub debounce_window: Duration,

    pub retry: RetrySettings,

    /// Files larger than this are skipped during discovery
    pub max_file_size: u64,

    /// Lowercase extensions (without dot) eligible for indexing
    pub extensions: BTreeSet<String>,

    /// Lowercase extension-less file names eligible for indexing
    pub special_file_names: BTreeSet<String>,

    /// Directory names pruned from discovery
    pub excluded_dirs: BTreeSet<String>,
}

impl SyncEngineConfig {
    /// Creates a new builder for constructing a `SyncEngineConfig`.
    pub fn builder() -> SyncEngineConfigBuilder {
        SyncEngineConfigBuilder::default()
    }

    /// Build a configuration from `MEMORY_SYNC_*` environment variables.
    ///
    /// | Variable | Meaning |
    /// |----------|---------|
    /// | `MEMORY_SYNC_STORE_PATH` | store directory (required) |
    /// | `MEMORY_SYNC_STATE_DB` | SQLite file for repository state |
    /// | `MEMORY_SYNC_LOCK_TIMEOUT_SECS` | lock timeout |
    /// | `MEMORY_SYNC_WORKERS` | bridge worker threads |
    /// | `MEMORY_SYNC_QUEUE_CAPACITY` | write queue capacity |
    /// | `MEMORY_SYNC_BATCH_SIZE` | items per batch |
    /// | `MEMORY_SYNC_FLUSH_INTERVAL_MS` | partial batch deadline |
    /// | `MEMORY_SYNC_DEBOUNCE_MS` | watcher quiet period |
    /// | `MEMORY_SYNC_RETRY_ATTEMPTS` | attempts per storage call |
    /// | `MEMORY_SYNC_RETRY_BASE_MS` | first retry delay |
    /// | `MEMORY_SYNC_MAX_FILE_SIZE` | bytes |
    /// | `MEMORY_SYNC_EXTENSIONS` | comma-separated extensions |
    /// | `MEMORY_SYNC_EXCLUDED_DIRS` | comma-separated directory names |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let mut builder = Self::builder();

        if let Some(path) = var("STORE_PATH") {
            builder = builder.store_path(path);
        }
        if let Some(path) = var("STATE_DB") {
            builder = builder.state_database_path(path);
        }
        if let Some(secs) = var("LOCK_TIMEOUT_SECS") {
            builder = builder.lock_timeout(Duration::from_secs(parse_number("LOCK_TIMEOUT_SECS", &secs)?));
        }
        if let Some(workers) = var("WORKERS") {
            builder = builder.worker_threads(parse_number("WORKERS", &workers)?);
        }
        if let Some(capacity) = var("QUEUE_CAPACITY") {
            builder = builder.queue_capacity(parse_number("QUEUE_CAPACITY", &capacity)?);
        }
        if let Some(size) = var("BATCH_SIZE") {
            builder = builder.batch_size(parse_number("BATCH_SIZE", &size)?);
        }
        if let Some(ms) = var("FLUSH_INTERVAL_MS") {
            builder = builder.flush_interval(Duration::from_millis(parse_number("FLUSH_INTERVAL_MS", &ms)?));
        }
        if let Some(ms) = var("DEBOUNCE_MS") {
            builder = builder.debounce_window(Duration::from_millis(parse_number("DEBOUNCE_MS", &ms)?));
        }
        if let Some(attempts) = var("RETRY_ATTEMPTS") {
            builder = builder.retry_attempts(parse_number("RETRY_ATTEMPTS", &attempts)?);
        }
        if let Some(ms) = var("RETRY_BASE_MS") {
            builder = builder.retry_base_delay(Duration::from_millis(parse_number("RETRY_BASE_MS", &ms)?));
        }
        if let Some(bytes) = var("MAX_FILE_SIZE") {
            builder = builder.max_file_size(parse_number("MAX_FILE_SIZE", &bytes)?);
        }
        if let Some(list) = var("EXTENSIONS") {
            builder = builder.extensions(split_list(&list));
        }
        if let Some(list) = var("EXCLUDED_DIRS") {
            builder = builder.excluded_dirs(split_list(&list));
        }

        builder.build()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first offending setting.
    pub fn validate(&self) -> Result<()> {
        if self.store_path.as_os_str().is_empty() {
            return Err(Error::Config("Store path cannot be empty".to_string()));
        }

        if self.worker_threads == 0 {
            return Err(Error::Config(
                "Worker pool must have at least one thread".to_string(),
            ));
        }

        if self.queue_capacity == 0 {
            return Err(Error::Config("Queue capacity must be greater than 0".to_string()));
        }

        if self.batch_size == 0 {
            return Err(Error::Config("Batch size must be greater than 0".to_string()));
        }

        if self.batch_size > self.queue_capacity {
            return Err(Error::Config(format!(
                "Batch size ({}) cannot exceed queue capacity ({})",
                self.batch_size, self.queue_capacity
            )));
        }

        if self.retry.max_attempts == 0 {
            return Err(Error::Config(
                "Retry policy needs at least one attempt".to_string(),
            ));
        }

        if self.lock_poll_interval.is_zero() {
            return Err(Error::Config(
                "Lock poll interval must be greater than 0".to_string(),
            ));
        }

        if self.flush_interval.is_zero() {
            return Err(Error::Config(
                "Flush interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether a file name passes the extension allow-list
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

    /// Whether a directory name is pruned from discovery
    pub fn is_excluded_dir(&self, dir_name: &str) -> bool {
        let lower = dir_name.to_ascii_lowercase();
        self.excluded_dirs.contains(&lower) || lower.ends_with(".egg-info")
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    parse_variable(&format!("{}{}", ENV_PREFIX, name), value)
}

fn parse_variable<T: std::str::FromStr>(variable: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        Error::Config(format!(
            "{} must be a non-negative integer, got '{}'",
            variable, value
        ))
    })
}

fn parse_flag(variable: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!(
            "{} must be true or false, got '{}'",
            variable, value
        ))),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn to_set<I, S>(items: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items
        .into_iter()
        .map(|s| s.as_ref().trim_start_matches('.').to_ascii_lowercase())
        .collect()
}

/// Lowercased names, dots kept
fn to_name_set<I, S>(items: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items
        .into_iter()
        .map(|s| s.as_ref().trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for constructing [`SyncEngineConfig`] instances.
#[derive(Debug, Default)]
pub struct SyncEngineConfigBuilder {
    store_path: Option<PathBuf>,
    state_database_path: Option<PathBuf>,
    lock_timeout: Option<Duration>,
    lock_poll_interval: Option<Duration>,
    worker_threads: Option<usize>,
    queue_capacity: Option<usize>,
    batch_size: Option<usize>,
    flush_interval: Option<Duration>,
    debounce_window: Option<Duration>,
    retry: RetrySettings,
    max_file_size: Option<u64>,
    extensions: Option<BTreeSet<String>>,
    special_file_names: Option<BTreeSet<String>>,
    excluded_dirs: Option<BTreeSet<String>>,
}

impl SyncEngineConfigBuilder {
    /// Sets the store directory (required).
    pub fn store_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.store_path = Some(path.into());
        self
    }

    /// Persist repository state in this SQLite file.
    pub fn state_database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.state_database_path = Some(path.into());
        self
    }

    /// Default: 30 seconds
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Default: 50 milliseconds
    pub fn lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval = Some(interval);
        self
    }

    /// Default: 4
    pub fn worker_threads(mut self, workers: usize) -> Self {
        self.worker_threads = Some(workers);
        self
    }

    /// Default: 10 000
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Default: 50
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Default: 100 milliseconds
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    /// Default: 500 milliseconds
    pub fn debounce_window(mut self, window: Duration) -> Self {
        self.debounce_window = Some(window);
        self
    }

    /// Default: 3
    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.retry.max_attempts = attempts;
        self
    }

    /// Default: 100 milliseconds
    pub fn retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry.base_delay = delay;
        self
    }

    /// Default: enabled
    pub fn retry_jitter(mut self, jitter: bool) -> Self {
        self.retry.jitter = jitter;
        self
    }

    /// Default: 10 MiB
    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = Some(bytes);
        self
    }

    /// Replace the extension allow-list. Leading dots are ignored.
    pub fn extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.extensions = Some(to_set(extensions));
        self
    }

    /// Replace the extension-less file names that are always indexed.
    pub fn special_file_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.special_file_names = Some(to_set(names));
        self
    }

    /// Replace the excluded directory set.
    pub fn excluded_dirs<I, S>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.excluded_dirs = Some(to_name_set(dirs));
        self
    }

    /// Builds the configuration, applying defaults and validating it.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the store path is missing or any setting
    /// is invalid.
    pub fn build(self) -> Result<SyncEngineConfig> {
        let store_path = self.store_path.ok_or_else(|| {
            Error::Config(
                "Store path is required. Call .store_path(...) or set MEMORY_SYNC_STORE_PATH"
                    .to_string(),
            )
        })?;

        let config = SyncEngineConfig {
            store_path,
            state_database_path: self.state_database_path,
            lock_timeout: self.lock_timeout.unwrap_or(DEFAULT_LOCK_TIMEOUT),
            lock_poll_interval: self.lock_poll_interval.unwrap_or(DEFAULT_LOCK_POLL_INTERVAL),
            worker_threads: self.worker_threads.unwrap_or(DEFAULT_WORKER_THREADS),
            queue_capacity: self.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
            batch_size: self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            flush_interval: self.flush_interval.unwrap_or(DEFAULT_FLUSH_INTERVAL),
            debounce_window: self.debounce_window.unwrap_or(DEFAULT_DEBOUNCE_WINDOW),
            retry: self.retry,
            max_file_size: self.max_file_size.unwrap_or(DEFAULT_MAX_FILE_SIZE),
            extensions: self.extensions.unwrap_or_else(|| to_set(DEFAULT_EXTENSIONS)),
            special_file_names: self
                .special_file_names
                .unwrap_or_else(|| to_set(DEFAULT_SPECIAL_FILES)),
            excluded_dirs: self
                .excluded_dirs
                .unwrap_or_else(|| to_name_set(DEFAULT_EXCLUDED_DIRS)),
        };

        config.validate()?;
        Ok(config)
    }
}

// ============================================================================
// Auto-sync configuration
// ============================================================================

pub const DEFAULT_AUTO_SCAN_INTERVAL: Duration = Duration::from_secs(3600);
pub const DEFAULT_AUTO_SYNC_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_CONCURRENT_SYNCS: usize = 3;
pub const DEFAULT_SIZE_THRESHOLD: u64 = 100 * 1024 * 1024;
pub const DEFAULT_SCAN_DEPTH: usize = 5;
pub const DEFAULT_MIN_CODE_FILES: usize = 3;

const DEFAULT_PRIORITY_LANGUAGES: &[&str] = &["python", "javascript", "typescript"];

const DEFAULT_SCAN_EXCLUDES: &[&str] = &[
    "node_modules", ".git", "__pycache__", "venv", "env", "build", "dist", "target",
    ".pytest_cache", ".tox",
];

/// Environment variable prefix recognized by [`AutoSyncConfig::from_env`]
pub const AUTO_SYNC_ENV_PREFIX: &str = "AUTO_SYNC_";

/// Settings for discovering repositories under scan roots and syncing them
/// in the background.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoSyncConfig {
    pub enabled: bool,
    /// Directories searched for repositories
    pub scan_paths: Vec<PathBuf>,
    /// Directory names never descended into while scanning
    pub excluded_dirs: BTreeSet<String>,
    /// Levels below a scan root that are searched
    pub max_depth: usize,
    /// Code files a directory needs to count as a repository
    pub min_code_files: usize,
    /// Period between scans
    pub scan_interval: Duration,
    /// Wait before a busy or failed repository is tried again
    pub sync_interval: Duration,
    pub max_concurrent_syncs: usize,
    /// Synced first, in this order
    pub priority_languages: Vec<String>,
    /// Repositories larger than this go to the back of the queue
    pub size_threshold: u64,
    /// Watch repositories after a successful first sync
    pub auto_watch: bool,
    /// Scan as soon as the manager starts
    pub sync_on_startup: bool,
}

impl Default for AutoSyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_paths: Vec::new(),
            excluded_dirs: to_name_set(DEFAULT_SCAN_EXCLUDES),
            max_depth: DEFAULT_SCAN_DEPTH,
            min_code_files: DEFAULT_MIN_CODE_FILES,
            scan_interval: DEFAULT_AUTO_SCAN_INTERVAL,
            sync_interval: DEFAULT_AUTO_SYNC_INTERVAL,
            max_concurrent_syncs: DEFAULT_MAX_CONCURRENT_SYNCS,
            priority_languages: DEFAULT_PRIORITY_LANGUAGES.iter().map(|s| s.to_string()).collect(),
            size_threshold: DEFAULT_SIZE_THRESHOLD,
            auto_watch: true,
            sync_on_startup: true,
        }
    }
}

impl AutoSyncConfig {
    pub fn with_scan_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.scan_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Read `AUTO_SYNC_*` environment variables over the defaults.
    ///
    /// | Variable | Meaning |
    /// |----------|---------|
    /// | `AUTO_SYNC_ENABLED` | master switch |
    /// | `AUTO_SYNC_PATHS` | comma-separated scan roots |
    /// | `AUTO_SYNC_EXCLUDE` | comma-separated directory names |
    /// | `AUTO_SYNC_SCAN_INTERVAL` | seconds between scans |
    /// | `AUTO_SYNC_INTERVAL` | seconds before a busy repository is retried |
    /// | `AUTO_SYNC_MAX_CONCURRENT` | parallel syncs |
    /// | `AUTO_SYNC_PRIORITY_LANGUAGES` | comma-separated languages |
    /// | `AUTO_SYNC_SIZE_THRESHOLD` | bytes |
    /// | `AUTO_SYNC_AUTO_WATCH` | watch after first sync |
    /// | `AUTO_SYNC_ON_STARTUP` | scan at start |
    /// | `AUTO_SYNC_MAX_DEPTH` | scan depth |
    /// | `AUTO_SYNC_MIN_FILES` | code files per repository |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            let variable = format!("{}{}", AUTO_SYNC_ENV_PREFIX, name);
            lookup(&variable).map(|value| (variable, value))
        };
        let mut config = Self::default();

        if let Some((name, value)) = var("ENABLED") {
            config.enabled = parse_flag(&name, &value)?;
        }
        if let Some((_, value)) = var("PATHS") {
            config.scan_paths = split_list(&value).into_iter().map(PathBuf::from).collect();
        }
        if let Some((_, value)) = var("EXCLUDE") {
            let excluded = split_list(&value);
            if !excluded.is_empty() {
                config.excluded_dirs = to_name_set(excluded);
            }
        }
        if let Some((name, value)) = var("SCAN_INTERVAL") {
            config.scan_interval = Duration::from_secs(parse_variable(&name, &value)?);
        }
        if let Some((name, value)) = var("INTERVAL") {
            config.sync_interval = Duration::from_secs(parse_variable(&name, &value)?);
        }
        if let Some((name, value)) = var("MAX_CONCURRENT") {
            config.max_concurrent_syncs = parse_variable(&name, &value)?;
        }
        if let Some((_, value)) = var("PRIORITY_LANGUAGES") {
            let languages = split_list(&value);
            if !languages.is_empty() {
                config.priority_languages = languages.iter().map(|l| l.to_ascii_lowercase()).collect();
            }
        }
        if let Some((name, value)) = var("SIZE_THRESHOLD") {
            config.size_threshold = parse_variable(&name, &value)?;
        }
        if let Some((name, value)) = var("AUTO_WATCH") {
            config.auto_watch = parse_flag(&name, &value)?;
        }
        if let Some((name, value)) = var("ON_STARTUP") {
            config.sync_on_startup = parse_flag(&name, &value)?;
        }
        if let Some((name, value)) = var("MAX_DEPTH") {
            config.max_depth = parse_variable(&name, &value)?;
        }
        if let Some((name, value)) = var("MIN_FILES") {
            config.min_code_files = parse_variable(&name, &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns `Error::Config` describing the first offending setting.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_syncs == 0 {
            return Err(Error::Config(
                "Auto-sync needs at least one concurrent sync".to_string(),
            ));
        }
        if self.scan_interval.is_zero() {
            return Err(Error::Config("Scan interval must be greater than 0".to_string()));
        }
        if self.sync_interval.is_zero() {
            return Err(Error::Config("Sync interval must be greater than 0".to_string()));
        }
        Ok(())
    }

    /// Position of `language` in the priority list
    pub fn language_rank(&self, language: Option<&str>) -> Option<usize> {
        let language = language?;
        self.priority_languages.iter().position(|l| l == language)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base() -> SyncEngineConfigBuilder {
        SyncEngineConfig::builder().store_path("/tmp/store")
    }

    #[test]
    fn test_defaults() {
        let config = base().build().unwrap();
        assert_eq!(config.lock_timeout, Duration::from_secs(30));
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.queue_capacity, 10_000);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.flush_interval, Duration::from_millis(100));
        assert_eq!(config.debounce_window, Duration::from_millis(500));
        assert_eq!(config.retry, RetrySettings::default());
        assert_eq!(config.max_file_size, 10 * 1024 * 1024);
        assert!(config.extensions.contains("rs"));
        assert!(config.excluded_dirs.contains("node_modules"));
        assert!(config.state_database_path.is_none());
    }

    #[test]
    fn test_missing_store_path() {
        let err = SyncEngineConfig::builder().build().unwrap_err();
        assert!(err.to_string().contains("Store path is required"));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(base().batch_size(0).build().is_err());
        assert!(base().queue_capacity(0).build().is_err());
        assert!(base().worker_threads(0).build().is_err());
        assert!(base().retry_attempts(0).build().is_err());
        assert!(base().queue_capacity(10).batch_size(11).build().is_err());
        assert!(SyncEngineConfig::builder().store_path("").build().is_err());
    }

    #[test]
    fn test_extension_matching() {
        let config = base().build().unwrap();
        assert!(config.is_indexable_name("main.RS"));
        assert!(config.is_indexable_name("Dockerfile"));
        assert!(config.is_indexable_name("Makefile"));
        assert!(!config.is_indexable_name("image.png"));
        assert!(!config.is_indexable_name("README"));
        assert!(!config.is_indexable_name(".rs"));
    }

    #[test]
    fn test_custom_extensions_strip_dots() {
        let config = base().extensions([".py", "GO"]).build().unwrap();
        assert!(config.is_indexable_name("app.py"));
        assert!(config.is_indexable_name("main.go"));
        assert!(!config.is_indexable_name("lib.rs"));
    }

    #[test]
    fn test_excluded_dirs() {
        let config = base().build().unwrap();
        assert!(config.is_excluded_dir(".git"));
        assert!(config.is_excluded_dir("Target"));
        assert!(config.is_excluded_dir("my_pkg.egg-info"));
        assert!(!config.is_excluded_dir("src"));
    }

    #[test]
    fn test_from_lookup_overlays_values() {
        let vars: HashMap<&str, &str> = [
            ("MEMORY_SYNC_STORE_PATH", "/data/store"),
            ("MEMORY_SYNC_LOCK_TIMEOUT_SECS", "5"),
            ("MEMORY_SYNC_WORKERS", "2"),
            ("MEMORY_SYNC_BATCH_SIZE", "10"),
            ("MEMORY_SYNC_FLUSH_INTERVAL_MS", "20"),
            ("MEMORY_SYNC_EXTENSIONS", "rs, .py ,"),
            ("MEMORY_SYNC_EXCLUDED_DIRS", "vendor"),
        ]
        .into_iter()
        .collect();

        let config =
            SyncEngineConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();

        assert_eq!(config.store_path, PathBuf::from("/data/store"));
        assert_eq!(config.lock_timeout, Duration::from_secs(5));
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.flush_interval, Duration::from_millis(20));
        assert_eq!(config.extensions.len(), 2);
        assert!(config.is_excluded_dir("vendor"));
        assert!(!config.is_excluded_dir("node_modules"));
    }

    #[test]
    fn test_auto_sync_defaults() {
        let config = AutoSyncConfig::default();
        assert!(config.enabled);
        assert!(config.scan_paths.is_empty());
        assert_eq!(config.scan_interval, Duration::from_secs(3600));
        assert_eq!(config.sync_interval, Duration::from_secs(300));
        assert_eq!(config.max_concurrent_syncs, 3);
        assert_eq!(config.size_threshold, 100 * 1024 * 1024);
        assert!(config.excluded_dirs.contains(".git"));
        assert_eq!(config.language_rank(Some("javascript")), Some(1));
        assert_eq!(config.language_rank(Some("rust")), None);
        assert_eq!(config.language_rank(None), None);
    }

    #[test]
    fn test_auto_sync_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("AUTO_SYNC_ENABLED", "false"),
            ("AUTO_SYNC_PATHS", "/src/a, /src/b"),
            ("AUTO_SYNC_EXCLUDE", "vendor"),
            ("AUTO_SYNC_SCAN_INTERVAL", "60"),
            ("AUTO_SYNC_MAX_CONCURRENT", "1"),
            ("AUTO_SYNC_PRIORITY_LANGUAGES", "Rust,go"),
            ("AUTO_SYNC_AUTO_WATCH", "0"),
        ]
        .into_iter()
        .collect();

        let config = AutoSyncConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();

        assert!(!config.enabled);
        assert_eq!(config.scan_paths, vec![PathBuf::from("/src/a"), PathBuf::from("/src/b")]);
        assert_eq!(config.excluded_dirs.len(), 1);
        assert_eq!(config.scan_interval, Duration::from_secs(60));
        assert_eq!(config.max_concurrent_syncs, 1);
        assert_eq!(config.priority_languages, vec!["rust", "go"]);
        assert!(!config.auto_watch);
        assert!(config.sync_on_startup);
    }

    #[test]
    fn test_auto_sync_rejects_bad_values() {
        let err = AutoSyncConfig::from_lookup(|key| {
            (key == "AUTO_SYNC_ENABLED").then(|| "maybe".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("AUTO_SYNC_ENABLED"));

        let err = AutoSyncConfig::from_lookup(|key| {
            (key == "AUTO_SYNC_MAX_CONCURRENT").then(|| "0".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = SyncEngineConfig::from_lookup(|key| match key {
            "MEMORY_SYNC_STORE_PATH" => Some("/data".to_string()),
            "MEMORY_SYNC_WORKERS" => Some("many".to_string()),
            _ => None,
        })
        .unwrap_err();
        assert!(err.to_string().contains("MEMORY_SYNC_WORKERS"));
    }
}
