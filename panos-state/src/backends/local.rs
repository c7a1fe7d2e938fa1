//! Local file backend for state storage
//!
//! State lives in a JSON file (default: panos.state.json) next to a `.lock`
//! file. The lock file is created exclusively so two runs cannot both win it.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::backend::{BackendConfig, BackendError, BackendResult, StateBackend};
use crate::lock::{DEFAULT_LOCK_TIMEOUT_SECS, LockInfo};
use crate::state::StateFile;

pub struct LocalBackend {
    state_path: PathBuf,
    lock_path: PathBuf,
    lock_timeout_secs: i64,
}

impl LocalBackend {
    pub const DEFAULT_STATE_FILE: &'static str = "panos.state.json";

    pub fn new() -> Self {
        Self::with_path(PathBuf::from(Self::DEFAULT_STATE_FILE))
    }

    pub fn with_path(state_path: PathBuf) -> Self {
        let lock_path = state_path.with_extension("lock");
        Self {
            state_path,
            lock_path,
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
        }
    }

    /// Recognised attributes: `path` and `lock_timeout` (seconds)
    pub fn from_config(config: &BackendConfig) -> BackendResult<Self> {
        let path = config
            .get_string("path")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_STATE_FILE));

        let mut backend = Self::with_path(path);
        if let Some(timeout) = config.get_int("lock_timeout") {
            if timeout <= 0 {
                return Err(BackendError::Configuration(format!(
                    "lock_timeout must be positive, got {}",
                    timeout
                )));
            }
            backend.lock_timeout_secs = timeout;
        }
        Ok(backend)
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    async fn read_lock(&self) -> BackendResult<Option<LockInfo>> {
        match tokio::fs::read_to_string(&self.lock_path).await {
            Ok(content) => serde_json::from_str(&content).map(Some).map_err(|e| {
                BackendError::InvalidState(format!("lock file {}: {}", self.lock_path.display(), e))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BackendError::io("failed to read lock file")(e)),
        }
    }

    async fn remove_lock_file(&self) -> BackendResult<()> {
        tokio::fs::remove_file(&self.lock_path)
            .await
            .map_err(BackendError::io("failed to remove lock file"))
    }

    /// Create the lock file exclusively. `Ok(false)` when it already exists.
    async fn try_create_lock(&self, lock: &LockInfo) -> BackendResult<bool> {
        let content = serde_json::to_vec_pretty(lock)?;

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(BackendError::io("failed to create lock file")(e)),
        };

        file.write_all(&content)
            .await
            .map_err(BackendError::io("failed to write lock file"))?;
        file.flush()
            .await
            .map_err(BackendError::io("failed to write lock file"))?;
        Ok(true)
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateBackend for LocalBackend {
    async fn read_state(&self) -> BackendResult<Option<StateFile>> {
        let content = match tokio::fs::read_to_string(&self.state_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BackendError::io("failed to read state file")(e)),
        };

        let state: StateFile = serde_json::from_str(&content).map_err(|e| {
            BackendError::InvalidState(format!("{}: {}", self.state_path.display(), e))
        })?;

        if state.version > StateFile::CURRENT_VERSION {
            return Err(BackendError::InvalidState(format!(
                "state file version {} is newer than supported version {}",
                state.version,
                StateFile::CURRENT_VERSION
            )));
        }

        Ok(Some(state))
    }

    async fn write_state(&self, state: &StateFile) -> BackendResult<()> {
        let content = serde_json::to_string_pretty(state)?;

        // Write beside the target and rename so a crash never leaves half a file
        let tmp_path = self.state_path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, content)
            .await
            .map_err(BackendError::io("failed to write state file"))?;
        tokio::fs::rename(&tmp_path, &self.state_path)
            .await
            .map_err(BackendError::io("failed to replace state file"))?;

        log::debug!(
            "wrote state serial {} to {}",
            state.serial,
            self.state_path.display()
        );
        Ok(())
    }

    async fn acquire_lock(&self, operation: &str) -> BackendResult<LockInfo> {
        let lock = LockInfo::with_timeout(operation, self.lock_timeout_secs);
        if self.try_create_lock(&lock).await? {
            return Ok(lock);
        }

        match self.read_lock().await? {
            Some(holder) if !holder.is_expired() => Err(BackendError::Locked { holder }),
            existing => {
                if let Some(stale) = existing {
                    log::warn!("taking over expired lock {}", stale);
                    self.remove_lock_file().await?;
                }
                if self.try_create_lock(&lock).await? {
                    return Ok(lock);
                }
                // Another process won the race after the stale lock was removed
                match self.read_lock().await? {
                    Some(holder) => Err(BackendError::Locked { holder }),
                    None => Err(BackendError::LockNotFound(lock.id)),
                }
            }
        }
    }

    async fn release_lock(&self, lock: &LockInfo) -> BackendResult<()> {
        let existing = self
            .read_lock()
            .await?
            .ok_or_else(|| BackendError::LockNotFound(lock.id.clone()))?;

        if existing.id != lock.id {
            return Err(BackendError::LockMismatch {
                expected: lock.id.clone(),
                actual: existing.id,
            });
        }

        self.remove_lock_file().await
    }

    async fn force_unlock(&self, lock_id: &str) -> BackendResult<()> {
        let existing = self
            .read_lock()
            .await?
            .ok_or_else(|| BackendError::LockNotFound(lock_id.to_string()))?;

        if existing.id != lock_id {
            return Err(BackendError::LockMismatch {
                expected: lock_id.to_string(),
                actual: existing.id,
            });
        }

        self.remove_lock_file().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ResourceState;
    use panos_core::resource::Value;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_local_backend_read_write() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_path(dir.path().join("test.state.json"));

        assert!(backend.read_state().await.unwrap().is_none());

        let mut state = StateFile::new();
        state.upsert_resource(
            ResourceState::new("bgp_export_rule_group", "exports").with_id("tmplA::vr1:1::YQ=="),
        );
        state.increment_serial();
        backend.write_state(&state).await.unwrap();

        let read = backend.read_state().await.unwrap().unwrap();
        assert_eq!(read.serial, 1);
        assert_eq!(read.lineage, state.lineage);
        assert_eq!(
            read.find_resource("bgp_export_rule_group", "exports")
                .and_then(|r| r.id.as_deref()),
            Some("tmplA::vr1:1::YQ==")
        );
        assert!(!dir.path().join("test.state.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_local_backend_rejects_newer_version() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_path(dir.path().join("test.state.json"));

        let mut state = StateFile::new();
        state.version = StateFile::CURRENT_VERSION + 1;
        backend.write_state(&state).await.unwrap();

        let result = backend.read_state().await;
        assert!(matches!(result, Err(BackendError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_local_backend_corrupt_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.state.json");
        std::fs::write(&path, "{not json").unwrap();

        let backend = LocalBackend::with_path(path);
        assert!(matches!(
            backend.read_state().await,
            Err(BackendError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_local_backend_locking() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_path(dir.path().join("test.state.json"));

        let lock = backend.acquire_lock("apply").await.unwrap();
        assert!(backend.lock_path().exists());

        match backend.acquire_lock("destroy").await {
            Err(BackendError::Locked { holder }) => assert_eq!(holder, lock),
            other => panic!("Expected Locked error, got {:?}", other),
        }

        backend.release_lock(&lock).await.unwrap();
        assert!(!backend.lock_path().exists());

        let lock2 = backend.acquire_lock("destroy").await.unwrap();
        backend.release_lock(&lock2).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_backend_takes_over_expired_lock() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_path(dir.path().join("test.state.json"));

        let stale = LockInfo::with_timeout("apply", -1);
        std::fs::write(
            backend.lock_path(),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();

        let lock = backend.acquire_lock("apply").await.unwrap();
        assert_ne!(lock.id, stale.id);
        backend.release_lock(&lock).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_backend_release_mismatch() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_path(dir.path().join("test.state.json"));

        let _held = backend.acquire_lock("apply").await.unwrap();
        let other = LockInfo::new("apply");

        assert!(matches!(
            backend.release_lock(&other).await,
            Err(BackendError::LockMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_local_backend_force_unlock() {
        let dir = tempdir().unwrap();
        let backend = LocalBackend::with_path(dir.path().join("test.state.json"));

        let lock = backend.acquire_lock("apply").await.unwrap();

        assert!(matches!(
            backend.force_unlock("wrong-id").await,
            Err(BackendError::LockMismatch { .. })
        ));

        backend.force_unlock(&lock.id).await.unwrap();
        assert!(!backend.lock_path().exists());

        assert!(matches!(
            backend.force_unlock(&lock.id).await,
            Err(BackendError::LockNotFound(_))
        ));
    }

    #[test]
    fn test_from_config() {
        let config = BackendConfig::local()
            .with_attribute("path", Value::String("custom.state.json".to_string()))
            .with_attribute("lock_timeout", Value::Int(60));
        let backend = LocalBackend::from_config(&config).unwrap();
        assert_eq!(backend.state_path(), Path::new("custom.state.json"));
        assert_eq!(backend.lock_path(), Path::new("custom.state.lock"));

        let bad = BackendConfig::local().with_attribute("lock_timeout", Value::Int(0));
        assert!(matches!(
            LocalBackend::from_config(&bad),
            Err(BackendError::Configuration(_))
        ));
    }

    #[test]
    fn test_default_path() {
        let backend = LocalBackend::from_config(&BackendConfig::local()).unwrap();
        assert_eq!(backend.state_path(), Path::new(LocalBackend::DEFAULT_STATE_FILE));
    }
}
