//! Directory scanner: the producer side of the pipeline
//!
//! Walks a file tree and enqueues one [`Document`] per eligible file:
//!
//! ```text
//! walkdir ──► exclude? ──► include? ──► stat ──► enqueue ──► latch.signal()
//!   │ (dirs pruned)  (skip)    (skip)   (warn+skip)  │ full-queue policy
//!   ▼                                                ▼
//! done / failed / shutdown ─────────────────► latch.seal() + signal()
//! ```
//!
//! The latch is sealed however the walk ends, so a drainer waiting on it is
//! never stranded.

use crate::document::{Document, DocumentFactory};
use crate::error::{ConfigError, ScanError, ScanResult};
use crate::latch::SealableLatch;
use crate::queue::DocumentQueue;
use globset::{Glob, GlobMatcher};
use parking_lot::Mutex;
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Slice in which a blocking enqueue re-checks the shutdown flag
const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Default wait before a full queue triggers the hook or fails the scan
pub const DEFAULT_FULL_QUEUE_TIMEOUT: Duration = Duration::from_secs(30);

/// A compiled include/exclude pattern
///
/// Patterns are globs by default; prefix with `regex:` for a regular
/// expression or `glob:` to be explicit. Globs are tried against both the
/// full path and the file name.
#[derive(Debug, Clone)]
pub enum PathMatcher {
    Glob(GlobMatcher),
    Regex(Regex),
}

impl PathMatcher {
    pub fn is_match(&self, path: &Path) -> bool {
        match self {
            PathMatcher::Glob(glob) => {
                glob.is_match(path) || path.file_name().is_some_and(|name| glob.is_match(name))
            }
            PathMatcher::Regex(regex) => regex.is_match(&path.to_string_lossy()),
        }
    }
}

impl FromStr for PathMatcher {
    type Err = ConfigError;

    fn from_str(pattern: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            reason,
        };

        if let Some(expr) = pattern.strip_prefix("regex:") {
            return Regex::new(expr)
                .map(PathMatcher::Regex)
                .map_err(|e| invalid(e.to_string()));
        }

        let glob = pattern.strip_prefix("glob:").unwrap_or(pattern);
        Glob::new(glob)
            .map(|g| PathMatcher::Glob(g.compile_matcher()))
            .map_err(|e| invalid(e.to_string()))
    }
}

/// What to do when the queue stays full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FullQueuePolicy {
    /// Wait as long as it takes
    #[default]
    Block,
    /// Wait up to the timeout, then ask the full-queue handler
    Hook(Duration),
    /// Wait up to the timeout, then fail the scan
    Fail(Duration),
}

impl FullQueuePolicy {
    /// Build from a policy name and timeout
    pub fn parse(name: &str, timeout: Duration) -> Result<Self, ConfigError> {
        match name.to_lowercase().as_str() {
            "block" => Ok(FullQueuePolicy::Block),
            "hook" => Ok(FullQueuePolicy::Hook(timeout)),
            "fail" => Ok(FullQueuePolicy::Fail(timeout)),
            _ => Err(ConfigError::InvalidQueuePolicy(name.to_string())),
        }
    }
}

/// Decision returned by a full-queue handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullQueueAction {
    /// Try to enqueue the same document again
    Retry,
    /// Drop this document and continue the walk
    Skip,
    /// Stop the scan with an error
    Abort,
}

/// Callback consulted under [`FullQueuePolicy::Hook`]
pub type FullQueueHandler = Box<dyn Fn(&Document) -> FullQueueAction + Send + Sync>;

/// Scanner configuration
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Include patterns; when non-empty a file must match one
    pub includes: Vec<String>,
    /// Exclude patterns, checked first; matching directories are pruned
    pub excludes: Vec<String>,
    pub follow_links: bool,
    /// Maximum depth below the root (`None` = unlimited)
    pub max_depth: Option<usize>,
    pub full_queue: FullQueuePolicy,
}

/// Scanner lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Walking,
    Completed,
    Failed,
    Terminated,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanState::Idle => "idle",
            ScanState::Walking => "walking",
            ScanState::Completed => "completed",
            ScanState::Failed => "failed",
            ScanState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Live counters, readable from a progress thread
#[derive(Debug, Default)]
pub struct ScanStats {
    pub files_enqueued: AtomicU64,
    pub bytes_enqueued: AtomicU64,
    pub files_skipped: AtomicU64,
    pub dirs_pruned: AtomicU64,
    pub errors: AtomicU64,
}

impl ScanStats {
    pub fn enqueued(&self) -> u64 {
        self.files_enqueued.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes_enqueued.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.files_skipped.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.files_enqueued.store(0, Ordering::Relaxed);
        self.bytes_enqueued.store(0, Ordering::Relaxed);
        self.files_skipped.store(0, Ordering::Relaxed);
        self.dirs_pruned.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }
}

/// Result of a finished scan
#[derive(Debug, Clone)]
pub struct ScanSummary {
    pub root: PathBuf,
    pub state: ScanState,
    pub files_enqueued: u64,
    pub bytes_enqueued: u64,
    pub files_skipped: u64,
    pub dirs_pruned: u64,
    pub errors: u64,
    pub duration: Duration,
}

/// Outcome of enqueueing one document
enum Enqueued {
    Queued,
    Skipped,
    Interrupted,
}

/// File-tree producer feeding a [`DocumentQueue`]
pub struct Scanner {
    options: ScanOptions,
    includes: Vec<PathMatcher>,
    excludes: Vec<PathMatcher>,
    queue: Arc<dyn DocumentQueue>,
    factory: DocumentFactory,
    latch: Option<Arc<dyn SealableLatch>>,
    on_queue_full: FullQueueHandler,
    shutdown: Arc<AtomicBool>,
    state: Mutex<ScanState>,
    stats: ScanStats,
}

impl Scanner {
    /// Create a scanner, compiling its patterns up front
    pub fn new(
        options: ScanOptions,
        queue: Arc<dyn DocumentQueue>,
        factory: DocumentFactory,
    ) -> Result<Self, ConfigError> {
        let compile = |patterns: &[String]| {
            patterns
                .iter()
                .map(|p| p.parse::<PathMatcher>())
                .collect::<Result<Vec<_>, _>>()
        };

        Ok(Self {
            includes: compile(&options.includes)?,
            excludes: compile(&options.excludes)?,
            options,
            queue,
            factory,
            latch: None,
            on_queue_full: Box::new(default_full_queue_handler),
            shutdown: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(ScanState::Idle),
            stats: ScanStats::default(),
        })
    }

    /// Signal `latch` after every enqueue and seal it when the walk ends
    pub fn with_latch(mut self, latch: Arc<dyn SealableLatch>) -> Self {
        self.latch = Some(latch);
        self
    }

    /// Share a shutdown flag (e.g. set by a Ctrl-C handler)
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Replace the handler consulted under [`FullQueuePolicy::Hook`]
    pub fn on_queue_full<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Document) -> FullQueueAction + Send + Sync + 'static,
    {
        self.on_queue_full = Box::new(handler);
        self
    }

    pub fn state(&self) -> ScanState {
        *self.state.lock()
    }

    pub fn stats(&self) -> &ScanStats {
        &self.stats
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Walk `root` and enqueue every eligible file
    ///
    /// Runs on the calling thread; use [`spawn`](Self::spawn) to overlap
    /// with consumption.
    pub fn scan(&self, root: &Path) -> ScanResult<ScanSummary> {
        {
            let mut state = self.state.lock();
            if *state == ScanState::Walking {
                return Err(ScanError::AlreadyWalking);
            }
            *state = ScanState::Walking;
            // Counters describe one walk only
            self.stats.reset();
        }

        let start = Instant::now();
        info!(root = %root.display(), "Scan started");

        let outcome = self.walk(root);
        self.finish_latch();

        let state = match &outcome {
            Ok(true) => ScanState::Completed,
            Ok(false) => ScanState::Terminated,
            Err(_) => ScanState::Failed,
        };
        *self.state.lock() = state;

        let summary = ScanSummary {
            root: root.to_path_buf(),
            state,
            files_enqueued: self.stats.enqueued(),
            bytes_enqueued: self.stats.bytes(),
            files_skipped: self.stats.skipped(),
            dirs_pruned: self.stats.dirs_pruned.load(Ordering::Relaxed),
            errors: self.stats.errors(),
            duration: start.elapsed(),
        };

        match outcome {
            Ok(_) => {
                info!(
                    root = %root.display(),
                    state = %state,
                    enqueued = summary.files_enqueued,
                    skipped = summary.files_skipped,
                    errors = summary.errors,
                    "Scan finished"
                );
                Ok(summary)
            }
            Err(e) => {
                warn!(root = %root.display(), error = %e, "Scan failed");
                Err(e)
            }
        }
    }

    /// Run [`scan`](Self::scan) on a named thread
    pub fn spawn(self: Arc<Self>, root: PathBuf) -> std::io::Result<JoinHandle<ScanResult<ScanSummary>>> {
        thread::Builder::new()
            .name("scanner".into())
            .spawn(move || self.scan(&root))
    }

    fn is_excluded(&self, path: &Path) -> bool {
        self.excludes.iter().any(|m| m.is_match(path))
    }

    fn is_included(&self, path: &Path) -> bool {
        self.includes.is_empty() || self.includes.iter().any(|m| m.is_match(path))
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Returns `Ok(false)` if the walk was cut short by shutdown
    fn walk(&self, root: &Path) -> ScanResult<bool> {
        if let Err(e) = std::fs::metadata(root) {
            return Err(ScanError::InvalidRoot {
                path: root.to_path_buf(),
                reason: e.to_string(),
            });
        }

        let mut walker = WalkDir::new(root).follow_links(self.options.follow_links);
        if let Some(depth) = self.options.max_depth {
            walker = walker.max_depth(depth);
        }

        let entries = walker.into_iter().filter_entry(|entry| {
            let prune = entry.depth() > 0 && entry.file_type().is_dir() && self.is_excluded(entry.path());
            if prune {
                self.stats.dirs_pruned.fetch_add(1, Ordering::Relaxed);
                debug!(path = %entry.path().display(), "Pruned excluded directory");
            }
            !prune
        });

        for entry in entries {
            if self.is_shutdown() {
                info!(root = %root.display(), "Scan interrupted by shutdown");
                return Ok(false);
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    if e.path().is_some_and(|p| self.is_excluded(p)) {
                        continue;
                    }
                    warn!(path = ?e.path(), error = %e, "Skipping unreadable entry");
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            if self.is_excluded(path) || !self.is_included(path) {
                self.stats.files_skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let size = match entry.metadata() {
                Ok(metadata) => metadata.len(),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read file attributes, skipping");
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            let doc = self.factory.create(path, Some(size));
            match self.enqueue(&doc)? {
                Enqueued::Queued => {
                    self.stats.files_enqueued.fetch_add(1, Ordering::Relaxed);
                    self.stats.bytes_enqueued.fetch_add(size, Ordering::Relaxed);
                    if let Some(latch) = &self.latch {
                        latch.signal()?;
                    }
                }
                Enqueued::Skipped => {
                    self.stats.files_skipped.fetch_add(1, Ordering::Relaxed);
                }
                Enqueued::Interrupted => {
                    info!(root = %root.display(), "Scan interrupted by shutdown");
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }

    fn enqueue(&self, doc: &Document) -> ScanResult<Enqueued> {
        let offer = |timeout: Duration| {
            self.queue
                .offer_timeout(doc, timeout)
                .map_err(|source| ScanError::Enqueue {
                    path: doc.path().to_path_buf(),
                    source,
                })
        };

        match self.options.full_queue {
            FullQueuePolicy::Block => loop {
                if offer(SHUTDOWN_CHECK_INTERVAL)? {
                    return Ok(Enqueued::Queued);
                }
                if self.is_shutdown() {
                    return Ok(Enqueued::Interrupted);
                }
            },
            FullQueuePolicy::Hook(timeout) => loop {
                if offer(timeout)? {
                    return Ok(Enqueued::Queued);
                }
                if self.is_shutdown() {
                    return Ok(Enqueued::Interrupted);
                }
                match (self.on_queue_full)(doc) {
                    FullQueueAction::Retry => continue,
                    FullQueueAction::Skip => {
                        warn!(path = %doc.path().display(), "Queue full, skipping document");
                        return Ok(Enqueued::Skipped);
                    }
                    FullQueueAction::Abort => {
                        return Err(ScanError::Aborted {
                            path: doc.path().to_path_buf(),
                        })
                    }
                }
            },
            FullQueuePolicy::Fail(timeout) => {
                if offer(timeout)? {
                    Ok(Enqueued::Queued)
                } else if self.is_shutdown() {
                    Ok(Enqueued::Interrupted)
                } else {
                    Err(ScanError::QueueFull {
                        path: doc.path().to_path_buf(),
                        timeout,
                    })
                }
            }
        }
    }

    /// Seal, then signal, exactly once per scan
    fn finish_latch(&self) {
        if let Some(latch) = &self.latch {
            if let Err(e) = latch.seal().and_then(|_| latch.signal()) {
                warn!(error = %e, "Failed to seal scan latch");
            }
        }
    }
}

fn default_full_queue_handler(doc: &Document) -> FullQueueAction {
    warn!(path = %doc.path().display(), "Queue still full, retrying");
    FullQueueAction::Retry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latch::LocalLatch;
    use crate::queue::MemoryQueue;
    use std::fs;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        fs::write(dir.path().join("b.log"), "beta").unwrap();
        fs::create_dir_all(dir.path().join("sub/deep")).unwrap();
        fs::write(dir.path().join("sub/c.txt"), "gamma").unwrap();
        fs::write(dir.path().join("sub/deep/d.txt"), "delta").unwrap();
        fs::create_dir(dir.path().join("skip")).unwrap();
        fs::write(dir.path().join("skip/e.txt"), "epsilon").unwrap();
        dir
    }

    fn scanner(options: ScanOptions, capacity: usize) -> (Scanner, Arc<MemoryQueue>) {
        let queue = Arc::new(MemoryQueue::new("test", capacity));
        let scanner = Scanner::new(options, queue.clone(), DocumentFactory::default()).unwrap();
        (scanner, queue)
    }

    fn queued_names(queue: &MemoryQueue) -> Vec<String> {
        let mut names = Vec::new();
        while let Some(doc) = queue.poll().unwrap() {
            names.push(doc.path().file_name().unwrap().to_string_lossy().into_owned());
        }
        names.sort();
        names
    }

    #[test]
    fn test_matcher_parsing() {
        let glob: PathMatcher = "*.log".parse().unwrap();
        assert!(glob.is_match(Path::new("/var/app/b.log")));
        assert!(!glob.is_match(Path::new("/var/app/b.txt")));

        let regex: PathMatcher = r"regex:/sub/.*\.txt$".parse().unwrap();
        assert!(regex.is_match(Path::new("/root/sub/c.txt")));

        assert!(matches!(
            "regex:(".parse::<PathMatcher>(),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_excludes_prune_directories() {
        let dir = tree();
        let (scanner, queue) = scanner(
            ScanOptions {
                excludes: vec!["**/skip".into(), "*.log".into()],
                ..Default::default()
            },
            0,
        );

        let summary = scanner.scan(dir.path()).unwrap();
        assert_eq!(summary.state, ScanState::Completed);
        assert_eq!(summary.files_enqueued, 3);
        assert_eq!(summary.dirs_pruned, 1);
        assert_eq!(queued_names(&queue), vec!["a.txt", "c.txt", "d.txt"]);
    }

    #[test]
    fn test_rescan_counts_only_its_own_walk() {
        let dir = tree();
        let (scanner, queue) = scanner(
            ScanOptions {
                excludes: vec!["**/skip".into()],
                ..Default::default()
            },
            0,
        );

        let first = scanner.scan(dir.path()).unwrap();
        assert_eq!(first.files_enqueued, 4);
        assert_eq!(first.dirs_pruned, 1);
        assert_eq!(queued_names(&queue).len(), 4);

        let second = scanner.scan(dir.path()).unwrap();
        assert_eq!(second.state, ScanState::Completed);
        assert_eq!(second.files_enqueued, 4);
        assert_eq!(second.bytes_enqueued, first.bytes_enqueued);
        assert_eq!(second.dirs_pruned, 1);
        assert_eq!(scanner.stats().enqueued(), 4);
    }

    #[test]
    fn test_includes_and_depth() {
        let dir = tree();
        let (scanner, queue) = scanner(
            ScanOptions {
                includes: vec!["*.txt".into()],
                max_depth: Some(2),
                ..Default::default()
            },
            0,
        );

        scanner.scan(dir.path()).unwrap();
        assert_eq!(queued_names(&queue), vec!["a.txt", "c.txt", "e.txt"]);
    }

    #[test]
    fn test_latch_sealed_after_scan() {
        let dir = tree();
        let latch = Arc::new(LocalLatch::new());
        let (scanner, _queue) = scanner(ScanOptions::default(), 0);
        let scanner = scanner.with_latch(latch.clone());

        scanner.scan(dir.path()).unwrap();
        assert!(latch.is_sealed().unwrap());
    }

    #[test]
    fn test_latch_sealed_on_invalid_root() {
        let latch = Arc::new(LocalLatch::new());
        let (scanner, _queue) = scanner(ScanOptions::default(), 0);
        let scanner = scanner.with_latch(latch.clone());

        let result = scanner.scan(Path::new("/definitely/not/here"));
        assert!(matches!(result, Err(ScanError::InvalidRoot { .. })));
        assert_eq!(scanner.state(), ScanState::Failed);
        assert!(latch.is_sealed().unwrap());
    }

    #[test]
    fn test_fail_policy_on_full_queue() {
        let dir = tree();
        let (scanner, queue) = scanner(
            ScanOptions {
                full_queue: FullQueuePolicy::Fail(Duration::from_millis(10)),
                ..Default::default()
            },
            1,
        );

        let result = scanner.scan(dir.path());
        assert!(matches!(result, Err(ScanError::QueueFull { .. })));
        assert_eq!(scanner.state(), ScanState::Failed);
        assert_eq!(queue.size().unwrap(), 1);
    }

    #[test]
    fn test_hook_policy_skip() {
        let dir = tree();
        let (scanner, queue) = scanner(
            ScanOptions {
                full_queue: FullQueuePolicy::Hook(Duration::from_millis(5)),
                ..Default::default()
            },
            2,
        );
        let scanner = scanner.on_queue_full(|_| FullQueueAction::Skip);

        let summary = scanner.scan(dir.path()).unwrap();
        assert_eq!(summary.files_enqueued, 2);
        assert_eq!(summary.files_skipped, 3);
        assert_eq!(queue.size().unwrap(), 2);
    }

    #[test]
    fn test_shutdown_terminates_scan() {
        let dir = tree();
        let (scanner, queue) = scanner(ScanOptions::default(), 0);
        scanner.shutdown_flag().store(true, Ordering::SeqCst);

        let summary = scanner.scan(dir.path()).unwrap();
        assert_eq!(summary.state, ScanState::Terminated);
        assert_eq!(queue.size().unwrap(), 0);
    }
}
