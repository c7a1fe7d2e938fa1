//! Plan - what `apply` is about to do, one effect per resource.
//!
//! Building a plan only reads from the device.

use std::fmt;

use crate::resource::ResourceId;

/// A change to one managed resource
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Create(ResourceId),
    Update {
        id: ResourceId,
        reasons: Vec<String>,
    },
    Delete(ResourceId),
}

impl Effect {
    pub fn id(&self) -> &ResourceId {
        match self {
            Effect::Create(id) | Effect::Delete(id) => id,
            Effect::Update { id, .. } => id,
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::Create(id) => write!(f, "+ {}", id),
            Effect::Update { id, reasons } if reasons.is_empty() => write!(f, "~ {}", id),
            Effect::Update { id, reasons } => write!(f, "~ {} ({})", id, reasons.join("; ")),
            Effect::Delete(id) => write!(f, "- {}", id),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Plan {
    effects: Vec<Effect>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    pub fn effects(&self) -> &[Effect] {
        &self.effects
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    /// Count of effects by kind
    pub fn summary(&self) -> PlanSummary {
        self.effects
            .iter()
            .fold(PlanSummary::default(), |mut counts, effect| {
                match effect {
                    Effect::Create(_) => counts.create += 1,
                    Effect::Update { .. } => counts.update += 1,
                    Effect::Delete(_) => counts.delete += 1,
                }
                counts
            })
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to delete",
            self.create, self.update, self.delete
        )
    }
}
