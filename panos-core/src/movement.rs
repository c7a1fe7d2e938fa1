//! Movement - Position keywords for rule groups

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectiveError {
    #[error("invalid position keyword: {0:?}")]
    InvalidDirective(String),

    #[error("invalid position code: {0}")]
    InvalidCode(u8),

    #[error("'position_reference' is required for '{0}' movement")]
    AnchorRequired(MovementDirective),

    #[error("'position_reference' must be empty for non-relative movement (got {anchor:?})")]
    AnchorNotAllowed {
        directive: MovementDirective,
        anchor: String,
    },
}

/// Where a rule group is placed in the remote ordered list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MovementDirective {
    /// Leave the group wherever the remote system put it
    #[default]
    Unspecified,
    Top,
    Bottom,
    /// Directly before the anchor rule
    Before,
    /// Directly after the anchor rule
    After,
    /// Gather members into a block starting at the first member's position
    TopOfGroup,
    /// Gather members into a block ending at the last member's position
    BottomOfGroup,
}

impl MovementDirective {
    pub const ALL: [MovementDirective; 7] = [
        MovementDirective::Unspecified,
        MovementDirective::Top,
        MovementDirective::Bottom,
        MovementDirective::Before,
        MovementDirective::After,
        MovementDirective::TopOfGroup,
        MovementDirective::BottomOfGroup,
    ];

    /// Accepted position keywords, in code order
    pub fn keywords() -> impl Iterator<Item = &'static str> {
        Self::ALL.iter().map(|d| d.keyword())
    }

    pub fn keyword(self) -> &'static str {
        match self {
            MovementDirective::Unspecified => "",
            MovementDirective::Top => "top",
            MovementDirective::Bottom => "bottom",
            MovementDirective::Before => "before",
            MovementDirective::After => "after",
            MovementDirective::TopOfGroup => "top of group",
            MovementDirective::BottomOfGroup => "bottom of group",
        }
    }

    /// Integer code persisted inside composite identities
    pub fn code(self) -> u8 {
        match self {
            MovementDirective::Unspecified => 0,
            MovementDirective::Top => 1,
            MovementDirective::Bottom => 2,
            MovementDirective::Before => 3,
            MovementDirective::After => 4,
            MovementDirective::TopOfGroup => 5,
            MovementDirective::BottomOfGroup => 6,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, DirectiveError> {
        Self::ALL
            .into_iter()
            .find(|d| d.code() == code)
            .ok_or(DirectiveError::InvalidCode(code))
    }

    /// Relative directives position the group against an anchor rule
    pub fn is_relative(self) -> bool {
        matches!(self, MovementDirective::Before | MovementDirective::After)
    }

    /// Check that an anchor is given exactly when the directive needs one
    pub fn validate(self, anchor: &str) -> Result<(), DirectiveError> {
        match (self.is_relative(), anchor.is_empty()) {
            (true, true) => Err(DirectiveError::AnchorRequired(self)),
            (false, false) => Err(DirectiveError::AnchorNotAllowed {
                directive: self,
                anchor: anchor.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

impl FromStr for MovementDirective {
    type Err = DirectiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|d| d.keyword() == normalized)
            .ok_or_else(|| DirectiveError::InvalidDirective(s.to_string()))
    }
}

impl TryFrom<String> for MovementDirective {
    type Error = DirectiveError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MovementDirective> for String {
    fn from(value: MovementDirective) -> Self {
        value.keyword().to_string()
    }
}

impl fmt::Display for MovementDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MovementDirective::Unspecified => write!(f, "unspecified"),
            other => write!(f, "{}", other.keyword()),
        }
    }
}
