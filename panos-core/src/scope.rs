//! Scope - Where a rule group lives
//!
//! A Scope pins a group to one configuration container: the device target
//! (a firewall, or a Panorama template / template stack) plus the virtual
//! router that owns the BGP export list.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Field separator used by persisted identifiers.
/// Scope values must never contain it.
pub const ID_SEPARATOR: char = ':';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeError {
    #[error("virtual router must not be empty")]
    MissingVirtualRouter,

    #[error("a panorama target needs a template or a template stack")]
    MissingTemplate,

    #[error("{field} {value:?} must not contain ':'")]
    Separator { field: &'static str, value: String },

    #[error("This is a {expected} resource, but encountered a {actual} system")]
    WrongSystem {
        expected: DeviceKind,
        actual: DeviceKind,
    },
}

/// Kind of PAN-OS system a client is talking to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Firewall,
    Panorama,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Firewall => write!(f, "firewall"),
            DeviceKind::Panorama => write!(f, "panorama"),
        }
    }
}

/// Which configuration tree a resource is written to.
///
/// Resolved once at the boundary instead of checking for an empty template
/// at every call site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Target {
    Firewall,
    Panorama {
        #[serde(default)]
        template: String,
        #[serde(default)]
        template_stack: String,
    },
}

impl Target {
    pub fn panorama(template: impl Into<String>, template_stack: impl Into<String>) -> Self {
        Self::Panorama {
            template: template.into(),
            template_stack: template_stack.into(),
        }
    }

    /// Build a target from the two raw identifier fields.
    /// Both empty means the firewall itself.
    pub fn from_fields(template: &str, template_stack: &str) -> Self {
        if template.is_empty() && template_stack.is_empty() {
            Self::Firewall
        } else {
            Self::panorama(template, template_stack)
        }
    }

    pub fn template(&self) -> &str {
        match self {
            Target::Firewall => "",
            Target::Panorama { template, .. } => template,
        }
    }

    pub fn template_stack(&self) -> &str {
        match self {
            Target::Firewall => "",
            Target::Panorama { template_stack, .. } => template_stack,
        }
    }

    /// The kind of system this target must be applied against
    pub fn device_kind(&self) -> DeviceKind {
        match self {
            Target::Firewall => DeviceKind::Firewall,
            Target::Panorama { .. } => DeviceKind::Panorama,
        }
    }

    /// Fail when the connected system does not match this target
    pub fn ensure_device(&self, actual: DeviceKind) -> Result<(), ScopeError> {
        let expected = self.device_kind();
        if expected == actual {
            Ok(())
        } else {
            Err(ScopeError::WrongSystem { expected, actual })
        }
    }

    pub fn validate(&self) -> Result<(), ScopeError> {
        if let Target::Panorama {
            template,
            template_stack,
        } = self
        {
            if template.is_empty() && template_stack.is_empty() {
                return Err(ScopeError::MissingTemplate);
            }
            check_separator("template", template)?;
            check_separator("template_stack", template_stack)?;
        }
        Ok(())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Firewall => write!(f, "firewall"),
            Target::Panorama {
                template,
                template_stack,
            } => {
                if template_stack.is_empty() {
                    write!(f, "template {}", template)
                } else if template.is_empty() {
                    write!(f, "template-stack {}", template_stack)
                } else {
                    write!(f, "template {} / stack {}", template, template_stack)
                }
            }
        }
    }
}

/// Container of one ordered rule list
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub target: Target,
    pub virtual_router: String,
}

impl Scope {
    pub fn new(target: Target, virtual_router: impl Into<String>) -> Self {
        Self {
            target,
            virtual_router: virtual_router.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ScopeError> {
        self.target.validate()?;
        if self.virtual_router.is_empty() {
            return Err(ScopeError::MissingVirtualRouter);
        }
        check_separator("virtual_router", &self.virtual_router)
    }

    /// Stable key used when a scope has to index a map (e.g. the device file)
    pub fn key(&self) -> String {
        [
            self.target.template(),
            self.target.template_stack(),
            self.virtual_router.as_str(),
        ]
        .join(&ID_SEPARATOR.to_string())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} vr {}", self.target, self.virtual_router)
    }
}

pub(crate) fn check_separator(field: &'static str, value: &str) -> Result<(), ScopeError> {
    if value.contains(ID_SEPARATOR) {
        Err(ScopeError::Separator {
            field,
            value: value.to_string(),
        })
    } else {
        Ok(())
    }
}
