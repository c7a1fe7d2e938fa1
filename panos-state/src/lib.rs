//! PAN-OS State Management
//!
//! Persists what `panos apply` last pushed: the composite identity of each
//! rule group and the fields of each settings section. Every resource in
//! the state file is keyed by resource type and configured name.
//!
//! - **StateFile**: all managed resources plus serial and lineage
//! - **StateBackend**: storage trait, implemented by [`LocalBackend`]
//! - **LockInfo**: the lock held for the length of an apply or destroy
//!
//! # Example
//!
//! ```ignore
//! use panos_state::{create_backend, BackendConfig};
//!
//! let backend = create_backend(&BackendConfig::local())?;
//! let lock = backend.acquire_lock("apply").await?;
//! let mut state = backend.read_state().await?.unwrap_or_default();
//! // ... reconcile groups, upsert resources ...
//! state.increment_serial();
//! backend.write_state(&state).await?;
//! backend.release_lock(&lock).await?;
//! ```

pub mod backend;
pub mod backends;
pub mod lock;
pub mod state;

pub use backend::{BackendConfig, BackendError, BackendResult, StateBackend};
pub use backends::{LocalBackend, create_backend};
pub use lock::LockInfo;
pub use state::{ResourceState, StateFile};
