//! Differ - Compare desired groups with what the device holds
//!
//! Compares the desired rule group declared in configuration with the group
//! read back from the device, and decides whether a reconciliation is needed.

use crate::identity::CompositeIdentity;
use crate::plan::Effect;
use crate::reconciler::Rehydration;
use crate::resource::ResourceId;
use crate::rule::RuleEntry;

/// Result of comparing one rule group
#[derive(Debug, Clone, PartialEq)]
pub enum GroupDiff {
    /// Never applied, or the group vanished from the device
    Create,
    Update(GroupChanges),
    NoChange,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupChanges {
    /// Rules present on the device whose content differs
    pub changed: Vec<String>,
    /// Desired rules not part of the group on the device
    pub missing: Vec<String>,
    /// Previously owned rules that are no longer desired
    pub removed: Vec<String>,
    /// Scope, position or member order differ from the desired group
    pub reposition: bool,
}

impl GroupChanges {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
            && self.missing.is_empty()
            && self.removed.is_empty()
            && !self.reposition
    }

    /// Human-readable reasons for the update
    pub fn reasons(&self) -> Vec<String> {
        let mut reasons = Vec::new();
        if !self.missing.is_empty() {
            reasons.push(format!("add {}", self.missing.join(", ")));
        }
        if !self.changed.is_empty() {
            reasons.push(format!("modify {}", self.changed.join(", ")));
        }
        if !self.removed.is_empty() {
            reasons.push(format!("remove {}", self.removed.join(", ")));
        }
        if self.reposition {
            reasons.push("reposition".to_string());
        }
        reasons
    }
}

impl GroupDiff {
    /// Returns whether this diff involves a change
    pub fn is_change(&self) -> bool {
        !matches!(self, GroupDiff::NoChange)
    }

    pub fn into_effect(self, id: ResourceId) -> Option<Effect> {
        match self {
            GroupDiff::Create => Some(Effect::Create(id)),
            GroupDiff::Update(changes) => Some(Effect::Update {
                id,
                reasons: changes.reasons(),
            }),
            GroupDiff::NoChange => None,
        }
    }
}

/// Compare a desired group with the previous identity and what a read found.
///
/// `current` is `None` when there is no previous identity to read with.
pub fn diff_group<E>(
    desired_identity: &CompositeIdentity,
    desired: &[E],
    previous: Option<&CompositeIdentity>,
    current: Option<&Rehydration<E>>,
) -> GroupDiff
where
    E: RuleEntry + PartialEq,
{
    let (Some(previous), Some(Rehydration::Found(readout))) = (previous, current) else {
        return GroupDiff::Create;
    };

    let mut changes = GroupChanges::default();

    for entry in desired {
        match readout.entries.iter().find(|e| e.name() == entry.name()) {
            Some(remote) if remote == entry => {}
            Some(_) => changes.changed.push(entry.name().to_string()),
            None => changes.missing.push(entry.name().to_string()),
        }
    }

    changes.removed = previous
        .names()
        .iter()
        .filter(|n| previous.scope() != desired_identity.scope() || !desired_identity.owns(n))
        .cloned()
        .collect();

    changes.reposition = previous.scope() != desired_identity.scope()
        || previous.directive() != desired_identity.directive()
        || previous.anchor() != desired_identity.anchor()
        || !readout.position_correct
        || readout
            .names()
            .iter()
            .zip(desired_identity.names())
            .any(|(remote, wanted)| remote != wanted);

    if changes.is_empty() {
        GroupDiff::NoChange
    } else {
        GroupDiff::Update(changes)
    }
}
