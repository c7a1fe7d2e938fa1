//! Provider - Traits abstracting device operations
//!
//! A gateway is the client side of a PAN-OS device (firewall or Panorama).
//! It is responsible for turning list and settings operations into actual
//! API calls; everything in this crate talks to the device through it.

use std::future::Future;
use std::pin::Pin;

use crate::movement::MovementDirective;
use crate::rule::RuleEntry;
use crate::scope::{Scope, Target};
use crate::settings::{SectionSettings, SettingsSection};

/// Error type for gateway operations
#[derive(Debug)]
pub struct ProviderError {
    pub message: String,
    /// The referenced object does not exist on the device
    pub not_found: bool,
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|e| e.as_ref() as &dyn std::error::Error)
    }
}

impl ProviderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            not_found: false,
            cause: None,
        }
    }

    /// An "object not found" error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            not_found: true,
            ..Self::new(message)
        }
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn is_not_found(&self) -> bool {
        self.not_found
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Return type for async operations
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Access to one kind of ordered rule list on a device
///
/// Implementations must keep entry order: `set` appends entries that do not
/// exist yet and updates existing ones in place. `delete` must not fail for
/// entries that are already gone.
pub trait OrderedListGateway: Send + Sync {
    type Entry: RuleEntry;

    /// Entry names in current remote order
    fn get_list(&self, scope: &Scope) -> BoxFuture<'_, ProviderResult<Vec<String>>>;

    /// Fetch one entry. Returns `None` if it does not exist.
    fn get(&self, scope: &Scope, name: &str) -> BoxFuture<'_, ProviderResult<Option<Self::Entry>>>;

    /// Bulk upsert
    fn set(&self, scope: &Scope, entries: &[Self::Entry]) -> BoxFuture<'_, ProviderResult<()>>;

    /// Single upsert
    fn edit(&self, scope: &Scope, entry: &Self::Entry) -> BoxFuture<'_, ProviderResult<()>>;

    /// Bulk delete by name
    fn delete(&self, scope: &Scope, names: &[String]) -> BoxFuture<'_, ProviderResult<()>>;

    /// Relocate the named entries as one contiguous block, in the given order
    fn move_group(
        &self,
        scope: &Scope,
        directive: MovementDirective,
        anchor: &str,
        names: &[String],
    ) -> BoxFuture<'_, ProviderResult<()>>;
}

/// Forwarding implementation so boxed gateways can be used directly
impl<G: OrderedListGateway + ?Sized> OrderedListGateway for Box<G> {
    type Entry = G::Entry;

    fn get_list(&self, scope: &Scope) -> BoxFuture<'_, ProviderResult<Vec<String>>> {
        (**self).get_list(scope)
    }

    fn get(&self, scope: &Scope, name: &str) -> BoxFuture<'_, ProviderResult<Option<Self::Entry>>> {
        (**self).get(scope, name)
    }

    fn set(&self, scope: &Scope, entries: &[Self::Entry]) -> BoxFuture<'_, ProviderResult<()>> {
        (**self).set(scope, entries)
    }

    fn edit(&self, scope: &Scope, entry: &Self::Entry) -> BoxFuture<'_, ProviderResult<()>> {
        (**self).edit(scope, entry)
    }

    fn delete(&self, scope: &Scope, names: &[String]) -> BoxFuture<'_, ProviderResult<()>> {
        (**self).delete(scope, names)
    }

    fn move_group(
        &self,
        scope: &Scope,
        directive: MovementDirective,
        anchor: &str,
        names: &[String],
    ) -> BoxFuture<'_, ProviderResult<()>> {
        (**self).move_group(scope, directive, anchor, names)
    }
}

/// Access to singleton settings sections (general settings, management settings)
pub trait SettingsGateway: Send + Sync {
    /// Current content of a section; a section never written reads as empty
    fn get_settings(
        &self,
        target: &Target,
        section: SettingsSection,
    ) -> BoxFuture<'_, ProviderResult<SectionSettings>>;

    /// Replace a section with the given content
    fn edit_settings(
        &self,
        target: &Target,
        settings: &SectionSettings,
    ) -> BoxFuture<'_, ProviderResult<()>>;
}
