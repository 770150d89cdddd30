//! File-backed idempotent repository.
//!
//! Keys are stored one per line. New keys are appended; the file is
//! rebalanced (rewritten from the in-memory window, oldest entries dropped
//! first) whenever it holds more than `cache_size` entries plus a quarter of
//! slack, or grows beyond `max_file_size_bytes`. Either threshold triggers on
//! its own. The in-memory window never holds more than `cache_size` keys, so
//! evicted keys lingering in the file until the next rebalance are not seen
//! as duplicates.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::fifo::FifoSet;
use super::{IdempotentRepository, RepositoryError};
use crate::error::ConfigError;
use crate::service::{ManagedService, ServiceContext};

fn default_cache_size() -> usize {
    1000
}

fn default_max_file_size() -> u64 {
    32 * 1024 * 1024
}

/// Settings for [`FileIdempotentRepository`].
#[derive(Debug, Clone, Deserialize)]
pub struct FileIdempotentConfig {
    /// File holding the keys.
    pub path: PathBuf,
    /// Maximum number of keys remembered. The file is compacted once it
    /// holds a quarter more lines than this.
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    /// Maximum file size; exceeding it rebalances the file.
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,
}

impl FileIdempotentConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache_size: default_cache_size(),
            max_file_size_bytes: default_max_file_size(),
        }
    }

    #[must_use]
    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    #[must_use]
    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size_bytes = bytes;
        self
    }
}

/// Bytes a key occupies on disk, including its line terminator.
fn entry_len(key: &str) -> u64 {
    key.len() as u64 + 1
}

#[derive(Debug)]
struct FileState {
    loaded: bool,
    window: FifoSet,
    /// Lines currently in the file.
    file_entries: usize,
    /// Bytes currently in the file.
    file_bytes: u64,
}

/// Idempotent repository persisted to a local file.
///
/// One async mutex serialises every operation, so `add` is atomic and file
/// writes never interleave. The file is loaded lazily on first use, or
/// eagerly when the repository is initialised as a managed service.
#[derive(Debug)]
pub struct FileIdempotentRepository {
    name: String,
    config: FileIdempotentConfig,
    state: Mutex<FileState>,
}

impl FileIdempotentRepository {
    /// Creates a repository; nothing is read until first use.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidRepository`] for a zero cache size or
    /// a zero maximum file size.
    pub fn new(config: FileIdempotentConfig) -> Result<Self, ConfigError> {
        if config.cache_size == 0 {
            return Err(ConfigError::InvalidRepository(
                "cache_size must be positive".into(),
            ));
        }
        if config.max_file_size_bytes == 0 {
            return Err(ConfigError::InvalidRepository(
                "max_file_size_bytes must be positive".into(),
            ));
        }
        Ok(Self {
            name: format!("file-idempotent-repository:{}", config.path.display()),
            state: Mutex::new(FileState {
                loaded: false,
                window: FifoSet::new(Some(config.cache_size)),
                file_entries: 0,
                file_bytes: 0,
            }),
            config,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Number of keys currently held.
    pub async fn entry_count(&self) -> Result<usize, RepositoryError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        Ok(state.window.len())
    }

    async fn ensure_loaded(&self, state: &mut FileState) -> Result<(), RepositoryError> {
        if state.loaded {
            return Ok(());
        }
        let content = match tokio::fs::read_to_string(&self.config.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        state.window.clear();
        state.file_entries = 0;
        state.file_bytes = 0;
        for key in content.lines().filter(|l| !l.is_empty()) {
            state.window.insert(key);
            state.file_entries += 1;
            state.file_bytes += entry_len(key);
        }
        state.loaded = true;
        info!(
            path = %self.config.path.display(),
            entries = state.window.len(),
            "loaded idempotent repository"
        );

        if self.needs_rebalance(state) {
            self.rebalance(state).await?;
        }
        Ok(())
    }

    /// Line count above which the file is compacted.
    fn entry_threshold(&self) -> usize {
        let slack = (self.config.cache_size / 4).max(1);
        self.config.cache_size.saturating_add(slack)
    }

    fn needs_rebalance(&self, state: &FileState) -> bool {
        state.file_entries > self.entry_threshold()
            || state.file_bytes > self.config.max_file_size_bytes
    }

    /// Rewrites the file from the in-memory window, oldest first, after
    /// dropping the oldest keys that do not fit the size limit.
    async fn rebalance(&self, state: &mut FileState) -> Result<(), RepositoryError> {
        let mut bytes: u64 = state.window.iter().map(entry_len).sum();
        while bytes > self.config.max_file_size_bytes {
            match state.window.pop_oldest() {
                Some(evicted) => bytes -= entry_len(&evicted),
                None => break,
            }
        }
        self.rewrite(state).await?;
        debug!(
            path = %self.config.path.display(),
            entries = state.file_entries,
            bytes = state.file_bytes,
            "rebalanced idempotent repository"
        );
        Ok(())
    }

    /// Replaces the file with the window's content via a temp file + rename.
    async fn rewrite(&self, state: &mut FileState) -> Result<(), RepositoryError> {
        let mut content = String::new();
        for key in state.window.iter() {
            content.push_str(key);
            content.push('\n');
        }

        let mut tmp = self.config.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, content.as_bytes()).await?;
        tokio::fs::rename(&tmp, &self.config.path).await?;

        state.file_entries = state.window.len();
        state.file_bytes = content.len() as u64;
        Ok(())
    }

    async fn append(&self, state: &mut FileState, key: &str) -> Result<(), RepositoryError> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.path)
            .await?;
        file.write_all(format!("{key}\n").as_bytes()).await?;
        file.flush().await?;
        state.file_entries += 1;
        state.file_bytes += entry_len(key);
        Ok(())
    }
}

#[async_trait]
impl IdempotentRepository for FileIdempotentRepository {
    async fn add(&self, key: &str) -> Result<bool, RepositoryError> {
        if key.contains(['\n', '\r']) {
            return Err(RepositoryError::Backend(
                "keys must not contain line breaks".into(),
            ));
        }
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;

        if state.window.contains(key) {
            return Ok(false);
        }
        // The key only enters the window once it is on disk.
        self.append(&mut state, key).await?;
        state.window.insert(key);
        if self.needs_rebalance(&state) {
            if let Err(e) = self.rebalance(&mut state).await {
                // The key is persisted; compaction is retried on the next add.
                warn!(
                    path = %self.config.path.display(),
                    error = %e,
                    "idempotent repository rebalance failed"
                );
            }
        }
        Ok(true)
    }

    async fn contains(&self, key: &str) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        Ok(state.window.contains(key))
    }

    async fn remove(&self, key: &str) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        if !state.window.remove(key) {
            return Ok(false);
        }
        self.rewrite(&mut state).await?;
        Ok(true)
    }

    async fn clear(&self) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        state.window.clear();
        self.rewrite(&mut state).await
    }
}

#[async_trait]
impl ManagedService for FileIdempotentRepository {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state).await?;
        Ok(())
    }

    async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
        // Every write is flushed as it happens; forget the window so a
        // restart reloads from disk.
        let mut state = self.state.lock().await;
        state.loaded = false;
        state.window.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    const KEYS: [&str; 9] = [
        "f1.20171123",
        "f2.20171123",
        "f1.20171124",
        "f3.20171125",
        "f2.20171126",
        "fixed.20171126",
        "pricing.20171126",
        "test.20171126",
        "processing.20171126",
    ];

    async fn file_lines(path: &Path) -> Vec<String> {
        tokio::fs::read_to_string(path)
            .await
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn repo(dir: &tempfile::TempDir, cache_size: usize) -> FileIdempotentRepository {
        let config = FileIdempotentConfig::new(dir.path().join("keys.dat")).with_cache_size(cache_size);
        FileIdempotentRepository::new(config).unwrap()
    }

    #[tokio::test]
    async fn keeps_last_entries_in_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(&dir, 5);
        for key in KEYS {
            assert!(repo.add(key).await.unwrap());
        }

        assert_eq!(
            file_lines(repo.path()).await,
            vec![
                "f2.20171126",
                "fixed.20171126",
                "pricing.20171126",
                "test.20171126",
                "processing.20171126",
            ]
        );
        assert!(!repo.contains("f1.20171123").await.unwrap());
        assert!(repo.contains("processing.20171126").await.unwrap());
    }

    #[tokio::test]
    async fn under_capacity_file_holds_every_key() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(&dir, 100);
        for key in KEYS {
            repo.add(key).await.unwrap();
        }
        assert_eq!(file_lines(repo.path()).await, KEYS.to_vec());
    }

    #[tokio::test]
    async fn eviction_is_deterministic_across_runs() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        for dir in [&first, &second] {
            let repo = repo(dir, 4);
            for key in KEYS {
                repo.add(key).await.unwrap();
            }
        }
        assert_eq!(
            file_lines(&first.path().join("keys.dat")).await,
            file_lines(&second.path().join("keys.dat")).await
        );
    }

    #[tokio::test]
    async fn size_limit_triggers_rebalance_independently() {
        let dir = tempfile::tempdir().unwrap();
        // Each key takes 5 bytes on disk; 12 bytes fit two of them.
        let config = FileIdempotentConfig::new(dir.path().join("keys.dat"))
            .with_cache_size(100)
            .with_max_file_size(12);
        let repo = FileIdempotentRepository::new(config).unwrap();
        for key in ["aaaa", "bbbb", "cccc", "dddd"] {
            assert!(repo.add(key).await.unwrap());
        }
        assert_eq!(file_lines(repo.path()).await, vec!["cccc", "dddd"]);
        assert!(!repo.contains("aaaa").await.unwrap());
    }

    #[tokio::test]
    async fn reload_restores_keys() {
        let dir = tempfile::tempdir().unwrap();
        {
            let repo = repo(&dir, 10);
            repo.add("a").await.unwrap();
            repo.add("b").await.unwrap();
        }
        let reopened = repo(&dir, 10);
        reopened.init(&ServiceContext::default()).await.unwrap();
        assert!(reopened.contains("a").await.unwrap());
        assert!(!reopened.add("b").await.unwrap());
        assert_eq!(reopened.entry_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn reload_of_oversized_file_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.dat");
        tokio::fs::write(&path, "a\nb\nc\nd\n").await.unwrap();

        let repo = repo(&dir, 2);
        assert!(repo.contains("d").await.unwrap());
        assert!(!repo.contains("a").await.unwrap());
        assert_eq!(file_lines(&path).await, vec!["c", "d"]);
    }

    #[tokio::test]
    async fn remove_and_clear_rewrite_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(&dir, 10);
        for key in ["a", "b", "c"] {
            repo.add(key).await.unwrap();
        }
        assert!(repo.remove("b").await.unwrap());
        assert!(!repo.remove("b").await.unwrap());
        assert_eq!(file_lines(repo.path()).await, vec!["a", "c"]);

        repo.clear().await.unwrap();
        assert!(file_lines(repo.path()).await.is_empty());
        assert!(!repo.contains("a").await.unwrap());
    }

    #[tokio::test]
    async fn failed_append_does_not_remember_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(&dir, 10);
        repo.add("a").await.unwrap();

        tokio::fs::remove_file(repo.path()).await.unwrap();
        tokio::fs::create_dir(repo.path()).await.unwrap();
        assert!(matches!(repo.add("k").await, Err(RepositoryError::Io(_))));
        assert!(!repo.contains("k").await.unwrap());

        tokio::fs::remove_dir(repo.path()).await.unwrap();
        assert!(repo.add("k").await.unwrap());
        assert_eq!(file_lines(repo.path()).await, vec!["k"]);
    }

    #[tokio::test]
    async fn failed_rebalance_keeps_the_appended_key() {
        let dir = tempfile::tempdir().unwrap();
        // cache_size 1 compacts once the file holds more than two lines.
        let repo = repo(&dir, 1);
        repo.add("a").await.unwrap();
        repo.add("b").await.unwrap();

        let tmp = dir.path().join("keys.dat.tmp");
        tokio::fs::create_dir(&tmp).await.unwrap();
        assert!(repo.add("c").await.unwrap());
        assert!(repo.contains("c").await.unwrap());
        assert_eq!(file_lines(repo.path()).await, vec!["a", "b", "c"]);

        tokio::fs::remove_dir(&tmp).await.unwrap();
        assert!(repo.add("d").await.unwrap());
        assert_eq!(file_lines(repo.path()).await, vec!["d"]);
    }

    #[tokio::test]
    async fn compaction_waits_for_slack_past_cache_size() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(&dir, 8);
        for key in &KEYS[..8] {
            repo.add(key).await.unwrap();
        }
        // Eight keys plus slack of two: nothing compacted yet.
        assert_eq!(file_lines(repo.path()).await, KEYS[..8].to_vec());
        repo.add(KEYS[8]).await.unwrap();
        assert_eq!(file_lines(repo.path()).await, KEYS.to_vec());
        assert_eq!(repo.entry_count().await.unwrap(), 8);
        assert!(!repo.contains(KEYS[0]).await.unwrap());

        repo.add("extra-1").await.unwrap();
        assert_eq!(file_lines(repo.path()).await.len(), 10);
        repo.add("extra-2").await.unwrap();
        let lines = file_lines(repo.path()).await;
        assert_eq!(lines.len(), 8);
        assert_eq!(lines.last().map(String::as_str), Some("extra-2"));
    }

    #[tokio::test]
    async fn rejects_keys_with_line_breaks() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(&dir, 10);
        assert!(repo.add("bad\nkey").await.is_err());
    }

    #[test]
    fn zero_cache_size_is_a_configuration_error() {
        let config = FileIdempotentConfig::new("/tmp/unused").with_cache_size(0);
        assert!(matches!(
            FileIdempotentRepository::new(config),
            Err(ConfigError::InvalidRepository(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_add_of_same_key_wins_once() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Arc::new(repo(&dir, 10));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let repo = Arc::clone(&repo);
            handles.push(tokio::spawn(async move { repo.add("K").await.unwrap() }));
        }
        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(file_lines(repo.path()).await, vec!["K"]);
    }
}
