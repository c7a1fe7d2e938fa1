//! Advisory lock held for the length of an apply, refresh or destroy.
//!
//! Two runs touching the same rule list would otherwise interleave their
//! edits and moves.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 15 minutes
pub const DEFAULT_LOCK_TIMEOUT_SECS: i64 = 900;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub id: String,
    /// Command holding the lock ("apply", "refresh", "destroy")
    pub operation: String,
    /// user@host
    pub who: String,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

impl LockInfo {
    pub fn new(operation: impl Into<String>) -> Self {
        Self::with_timeout(operation, DEFAULT_LOCK_TIMEOUT_SECS)
    }

    pub fn with_timeout(operation: impl Into<String>, timeout_secs: i64) -> Self {
        let created = Utc::now();
        LockInfo {
            id: uuid::Uuid::new_v4().to_string(),
            operation: operation.into(),
            who: current_owner(),
            created,
            expires: created + Duration::seconds(timeout_secs),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires < Utc::now()
    }

    /// Time left before the lock may be taken over, zero once expired
    pub fn remaining(&self) -> Duration {
        (self.expires - Utc::now()).max(Duration::zero())
    }
}

impl fmt::Display for LockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} by {} since {})",
            self.id,
            self.operation,
            self.who,
            self.created.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

fn current_owner() -> String {
    let user = ["USER", "USERNAME"]
        .iter()
        .find_map(|key| std::env::var(key).ok())
        .unwrap_or_else(|| "unknown".to_string());
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{}@{}", user, host)
}
