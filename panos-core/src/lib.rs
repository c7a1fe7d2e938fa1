//! PAN-OS Core
//!
//! Core library for managing PAN-OS configuration as declared groups of
//! ordered rules and singleton settings sections.
//!
//! ## Module Structure
//!
//! - `scope` - Device targets and rule list containers
//! - `movement` - Position keywords and anchor validation
//! - `identity` - Composite identifiers persisted for each rule group
//! - `rule` - Rule entries, including BGP export rules
//! - `provider` - Gateway traits implemented by device clients
//! - `reconciler` - Create / read / delete of ordered rule groups
//! - `differ` / `plan` - Deciding what needs to change
//! - `settings` - Merge-then-edit for singleton settings
//! - `memory` - In-process device model

pub mod differ;
pub mod identity;
pub mod memory;
pub mod movement;
pub mod plan;
pub mod provider;
pub mod reconciler;
pub mod resource;
pub mod rule;
pub mod scope;
pub mod settings;

// Re-export main types
pub use identity::{CompositeIdentity, IdentityError};
pub use movement::{DirectiveError, MovementDirective};
pub use provider::{OrderedListGateway, ProviderError, ProviderResult, SettingsGateway};
pub use reconciler::{GroupError, GroupReconciler, Rehydration};
pub use rule::{BgpExportRule, RuleEntry};
pub use scope::{DeviceKind, Scope, Target};
pub use settings::{GeneralSettings, ManagementSettings, SectionSettings, SettingsSection};
