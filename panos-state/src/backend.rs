//! Where state lives, and what can go wrong getting at it

use std::collections::HashMap;

use async_trait::async_trait;
use panos_core::resource::Value;
use thiserror::Error;

use crate::lock::LockInfo;
use crate::state::StateFile;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("state is locked by {holder}")]
    Locked { holder: LockInfo },

    #[error("no lock is held (expected {0})")]
    LockNotFound(String),

    #[error("lock {actual} is held, not {expected}")]
    LockMismatch { expected: String, actual: String },

    #[error("unsupported backend type {0:?}")]
    UnsupportedBackend(String),

    #[error("invalid backend configuration: {0}")]
    Configuration(String),

    /// Unparseable, or written by a newer format version
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode state: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BackendError {
    /// Adapter for `map_err` on filesystem calls
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> BackendError {
        let context = context.into();
        move |source| BackendError::Io { context, source }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

#[async_trait]
pub trait StateBackend: Send + Sync {
    /// `None` until the first write
    async fn read_state(&self) -> BackendResult<Option<StateFile>>;

    /// Callers bump the serial before writing
    async fn write_state(&self, state: &StateFile) -> BackendResult<()>;

    /// Fails with `Locked` while another unexpired lock exists
    async fn acquire_lock(&self, operation: &str) -> BackendResult<LockInfo>;

    async fn release_lock(&self, lock: &LockInfo) -> BackendResult<()>;

    /// Remove a lock by ID, whoever holds it
    async fn force_unlock(&self, lock_id: &str) -> BackendResult<()>;
}

/// Backend type plus its settings, e.g. `local` with a `path`
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    pub backend_type: String,
    pub attributes: HashMap<String, Value>,
}

impl BackendConfig {
    pub fn local() -> Self {
        BackendConfig {
            backend_type: "local".to_string(),
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        if let Some(Value::String(s)) = self.attributes.get(key) {
            Some(s)
        } else {
            None
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        if let Some(Value::Int(n)) = self.attributes.get(key) {
            Some(*n)
        } else {
            None
        }
    }
}
