//! Rule - Entries of an ordered rule list
//!
//! The reconciler only cares about a rule's name; everything else is
//! carried along untouched. `BgpExportRule` is the concrete entry type for
//! virtual-router BGP export policy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An element of an ordered rule list, identified by name within its container
pub trait RuleEntry: Clone + Send + Sync + 'static {
    fn name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    #[error("rule name must not be empty")]
    EmptyName,

    #[error("rule {rule}: {field} is required when {type_field} is {kind}")]
    MissingValue {
        rule: String,
        field: &'static str,
        type_field: &'static str,
        kind: String,
    },

    #[error("rule {rule}: as_path_limit must be between 1 and 255, got {value}")]
    AsPathLimit { rule: String, value: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[default]
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteTable {
    Unicast,
    Multicast,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Igp,
    Egp,
    Incomplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AsPathType {
    None,
    Remove,
    Prepend,
    RemoveAndPrepend,
}

impl AsPathType {
    fn needs_value(self) -> bool {
        matches!(self, AsPathType::Prepend | AsPathType::RemoveAndPrepend)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommunityType {
    None,
    RemoveAll,
    RemoveRegex,
    Append,
    Overwrite,
}

impl CommunityType {
    fn needs_value(self) -> bool {
        matches!(
            self,
            CommunityType::RemoveRegex | CommunityType::Append | CommunityType::Overwrite
        )
    }
}

fn default_enable() -> bool {
    true
}

/// One BGP export rule of a virtual router
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BgpExportRule {
    pub name: String,
    #[serde(default = "default_enable")]
    pub enable: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub used_by: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_as_path_regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_community_regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_extended_community_regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_med: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_route_table: Option<RouteTable>,
    /// Prefix -> exact match
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_address_prefix: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_next_hops: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_from_peers: Vec<String>,

    #[serde(default)]
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_preference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub med: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_hop: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_path_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_path_type: Option<AsPathType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_path_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub community_type: Option<CommunityType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub community_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_community_type: Option<CommunityType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_community_value: Option<String>,
}

impl BgpExportRule {
    /// An enabled allow rule with no match criteria
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enable: true,
            used_by: Vec::new(),
            match_as_path_regex: None,
            match_community_regex: None,
            match_extended_community_regex: None,
            match_med: None,
            match_route_table: None,
            match_address_prefix: BTreeMap::new(),
            match_next_hops: Vec::new(),
            match_from_peers: Vec::new(),
            action: Action::Allow,
            local_preference: None,
            med: None,
            next_hop: None,
            origin: None,
            as_path_limit: None,
            as_path_type: None,
            as_path_value: None,
            community_type: None,
            community_value: None,
            extended_community_type: None,
            extended_community_value: None,
        }
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>, exact: bool) -> Self {
        self.match_address_prefix.insert(prefix.into(), exact);
        self
    }

    pub fn with_used_by(mut self, peer_group: impl Into<String>) -> Self {
        self.used_by.push(peer_group.into());
        self
    }

    pub fn validate(&self) -> Result<(), RuleError> {
        if self.name.is_empty() {
            return Err(RuleError::EmptyName);
        }

        if let Some(limit) = self.as_path_limit
            && !(1..=255).contains(&limit)
        {
            return Err(RuleError::AsPathLimit {
                rule: self.name.clone(),
                value: limit,
            });
        }

        if let Some(kind) = self.as_path_type
            && kind.needs_value()
            && is_blank(&self.as_path_value)
        {
            return Err(self.missing("as_path_value", "as_path_type", kind));
        }
        if let Some(kind) = self.community_type
            && kind.needs_value()
            && is_blank(&self.community_value)
        {
            return Err(self.missing("community_value", "community_type", kind));
        }
        if let Some(kind) = self.extended_community_type
            && kind.needs_value()
            && is_blank(&self.extended_community_value)
        {
            return Err(self.missing(
                "extended_community_value",
                "extended_community_type",
                kind,
            ));
        }

        Ok(())
    }

    fn missing(
        &self,
        field: &'static str,
        type_field: &'static str,
        kind: impl Serialize,
    ) -> RuleError {
        let kind = serde_json::to_value(kind)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        RuleError::MissingValue {
            rule: self.name.clone(),
            field,
            type_field,
            kind,
        }
    }
}

impl RuleEntry for BgpExportRule {
    fn name(&self) -> &str {
        &self.name
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(str::is_empty)
}
