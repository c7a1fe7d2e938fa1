//! Memory - An in-process device model
//!
//! `MemoryDevice` keeps per-scope ordered BGP export lists and settings
//! sections with the same ordering rules as a real device. It is
//! serialisable so it can back an offline device file, and `MemoryGateway`
//! exposes it through the gateway traits.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::movement::MovementDirective;
use crate::provider::{
    BoxFuture, OrderedListGateway, ProviderError, ProviderResult, SettingsGateway,
};
use crate::rule::{BgpExportRule, RuleEntry};
use crate::scope::{DeviceKind, Scope, Target};
use crate::settings::{SectionSettings, SettingsSection};

/// Device operations, used for the journal and for failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOp {
    GetList,
    Get,
    Set,
    Edit,
    Delete,
    MoveGroup,
    GetSettings,
    EditSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryDevice {
    pub kind: DeviceKind,
    /// Scope key -> ordered rules
    #[serde(default)]
    bgp_export: BTreeMap<String, Vec<BgpExportRule>>,
    /// Settings key -> section content
    #[serde(default)]
    settings: BTreeMap<String, SectionSettings>,
    #[serde(skip)]
    journal: Vec<GatewayOp>,
}

impl MemoryDevice {
    pub fn new(kind: DeviceKind) -> Self {
        Self {
            kind,
            bgp_export: BTreeMap::new(),
            settings: BTreeMap::new(),
            journal: Vec::new(),
        }
    }

    /// Seed a scope with existing rules (rules not managed by any group)
    pub fn with_rules(mut self, scope: &Scope, names: &[&str]) -> Self {
        let list = self.bgp_export.entry(scope.key()).or_default();
        for name in names {
            list.push(BgpExportRule::new(*name));
        }
        self
    }

    pub fn put_settings(&mut self, target: &Target, settings: SectionSettings) {
        self.settings
            .insert(settings_key(target, settings.section()), settings);
    }

    /// Operations performed so far, in order
    pub fn journal(&self) -> &[GatewayOp] {
        &self.journal
    }

    pub fn settings_writes(&self) -> usize {
        self.journal
            .iter()
            .filter(|op| **op == GatewayOp::EditSettings)
            .count()
    }

    fn check_target(&self, target: &Target) -> ProviderResult<()> {
        target
            .ensure_device(self.kind)
            .map_err(|e| ProviderError::new(e.to_string()).with_cause(e))
    }

    fn list(&self, scope: &Scope) -> &[BgpExportRule] {
        self.bgp_export
            .get(&scope.key())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn names(&mut self, scope: &Scope) -> ProviderResult<Vec<String>> {
        self.journal.push(GatewayOp::GetList);
        self.check_target(&scope.target)?;
        Ok(self
            .list(scope)
            .iter()
            .map(|r| r.name().to_string())
            .collect())
    }

    pub fn rule(&mut self, scope: &Scope, name: &str) -> ProviderResult<Option<BgpExportRule>> {
        self.journal.push(GatewayOp::Get);
        self.check_target(&scope.target)?;
        Ok(self.list(scope).iter().find(|r| r.name() == name).cloned())
    }

    pub fn set_rules(&mut self, scope: &Scope, entries: &[BgpExportRule]) -> ProviderResult<()> {
        self.journal.push(GatewayOp::Set);
        self.check_target(&scope.target)?;
        for entry in entries {
            self.upsert(scope, entry);
        }
        Ok(())
    }

    pub fn edit_rule(&mut self, scope: &Scope, entry: &BgpExportRule) -> ProviderResult<()> {
        self.journal.push(GatewayOp::Edit);
        self.check_target(&scope.target)?;
        self.upsert(scope, entry);
        Ok(())
    }

    pub fn delete_rules(&mut self, scope: &Scope, names: &[String]) -> ProviderResult<()> {
        self.journal.push(GatewayOp::Delete);
        self.check_target(&scope.target)?;
        if let Some(list) = self.bgp_export.get_mut(&scope.key()) {
            list.retain(|r| !names.iter().any(|n| n == r.name()));
        }
        Ok(())
    }

    pub fn move_rules(
        &mut self,
        scope: &Scope,
        directive: MovementDirective,
        anchor: &str,
        names: &[String],
    ) -> ProviderResult<()> {
        self.journal.push(GatewayOp::MoveGroup);
        self.check_target(&scope.target)?;

        let list = self.bgp_export.entry(scope.key()).or_default();
        for name in names {
            if !list.iter().any(|r| r.name() == name) {
                return Err(ProviderError::not_found(format!(
                    "cannot move {:?}: rule is not present",
                    name
                )));
            }
        }
        if directive == MovementDirective::Unspecified || names.is_empty() {
            return Ok(());
        }
        if directive.is_relative() {
            if names.iter().any(|n| n == anchor) {
                return Err(ProviderError::new(format!(
                    "cannot move a group relative to its own member {:?}",
                    anchor
                )));
            }
            if !list.iter().any(|r| r.name() == anchor) {
                return Err(ProviderError::not_found(format!(
                    "cannot move group {} {:?}: rule is not present",
                    directive, anchor
                )));
            }
        }

        let members: HashSet<&str> = names.iter().map(String::as_str).collect();
        // Non-members preceding each member, used by the group-relative directives
        let mut preceding = Vec::new();
        let mut others = 0;
        for rule in list.iter() {
            if members.contains(rule.name()) {
                preceding.push(others);
            } else {
                others += 1;
            }
        }

        let mut block: Vec<BgpExportRule> = Vec::with_capacity(names.len());
        for name in names {
            if let Some(pos) = list.iter().position(|r| r.name() == name) {
                block.push(list.remove(pos));
            }
        }

        let insert_at = match directive {
            MovementDirective::Top => 0,
            MovementDirective::Bottom => list.len(),
            MovementDirective::Before | MovementDirective::After => {
                let pos = list
                    .iter()
                    .position(|r| r.name() == anchor)
                    .unwrap_or(list.len());
                if directive == MovementDirective::After {
                    pos + 1
                } else {
                    pos
                }
            }
            MovementDirective::TopOfGroup => preceding.first().copied().unwrap_or(0),
            MovementDirective::BottomOfGroup => preceding.last().copied().unwrap_or(list.len()),
            MovementDirective::Unspecified => list.len(),
        };

        let tail = list.split_off(insert_at);
        list.extend(block);
        list.extend(tail);
        Ok(())
    }

    pub fn section(
        &mut self,
        target: &Target,
        section: SettingsSection,
    ) -> ProviderResult<SectionSettings> {
        self.journal.push(GatewayOp::GetSettings);
        self.check_target(target)?;
        Ok(self
            .settings
            .get(&settings_key(target, section))
            .cloned()
            .unwrap_or_else(|| SectionSettings::empty(section)))
    }

    pub fn write_section(&mut self, target: &Target, settings: &SectionSettings) -> ProviderResult<()> {
        self.journal.push(GatewayOp::EditSettings);
        self.check_target(target)?;
        self.settings
            .insert(settings_key(target, settings.section()), settings.clone());
        Ok(())
    }

    fn upsert(&mut self, scope: &Scope, entry: &BgpExportRule) {
        let list = self.bgp_export.entry(scope.key()).or_default();
        match list.iter_mut().find(|r| r.name() == entry.name()) {
            Some(existing) => *existing = entry.clone(),
            None => list.push(entry.clone()),
        }
    }
}

fn settings_key(target: &Target, section: SettingsSection) -> String {
    format!(
        "{}:{}:{}",
        target.template(),
        target.template_stack(),
        section
    )
}

/// Gateway over a shared `MemoryDevice`
pub struct MemoryGateway {
    device: Mutex<MemoryDevice>,
    failing: Mutex<HashSet<GatewayOp>>,
}

impl MemoryGateway {
    pub fn new(device: MemoryDevice) -> Self {
        Self {
            device: Mutex::new(device),
            failing: Mutex::new(HashSet::new()),
        }
    }

    /// Make every future call of `op` fail
    pub fn fail_on(&self, op: GatewayOp) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(op);
        }
    }

    pub fn recover(&self) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.clear();
        }
    }

    /// Copy of the current device content
    pub fn snapshot(&self) -> MemoryDevice {
        match self.device.lock() {
            Ok(device) => device.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn with_device<T>(
        &self,
        op: GatewayOp,
        f: impl FnOnce(&mut MemoryDevice) -> ProviderResult<T>,
    ) -> ProviderResult<T> {
        let injected = self
            .failing
            .lock()
            .map(|failing| failing.contains(&op))
            .unwrap_or(false);
        if injected {
            return Err(ProviderError::new(format!("{:?}: injected failure", op)));
        }

        let mut device = self
            .device
            .lock()
            .map_err(|_| ProviderError::new("device lock poisoned"))?;
        f(&mut device)
    }
}

impl OrderedListGateway for MemoryGateway {
    type Entry = BgpExportRule;

    fn get_list(&self, scope: &Scope) -> BoxFuture<'_, ProviderResult<Vec<String>>> {
        let scope = scope.clone();
        Box::pin(async move { self.with_device(GatewayOp::GetList, |d| d.names(&scope)) })
    }

    fn get(&self, scope: &Scope, name: &str) -> BoxFuture<'_, ProviderResult<Option<BgpExportRule>>> {
        let scope = scope.clone();
        let name = name.to_string();
        Box::pin(async move { self.with_device(GatewayOp::Get, |d| d.rule(&scope, &name)) })
    }

    fn set(&self, scope: &Scope, entries: &[BgpExportRule]) -> BoxFuture<'_, ProviderResult<()>> {
        let scope = scope.clone();
        let entries = entries.to_vec();
        Box::pin(async move { self.with_device(GatewayOp::Set, |d| d.set_rules(&scope, &entries)) })
    }

    fn edit(&self, scope: &Scope, entry: &BgpExportRule) -> BoxFuture<'_, ProviderResult<()>> {
        let scope = scope.clone();
        let entry = entry.clone();
        Box::pin(async move { self.with_device(GatewayOp::Edit, |d| d.edit_rule(&scope, &entry)) })
    }

    fn delete(&self, scope: &Scope, names: &[String]) -> BoxFuture<'_, ProviderResult<()>> {
        let scope = scope.clone();
        let names = names.to_vec();
        Box::pin(async move {
            self.with_device(GatewayOp::Delete, |d| d.delete_rules(&scope, &names))
        })
    }

    fn move_group(
        &self,
        scope: &Scope,
        directive: MovementDirective,
        anchor: &str,
        names: &[String],
    ) -> BoxFuture<'_, ProviderResult<()>> {
        let scope = scope.clone();
        let anchor = anchor.to_string();
        let names = names.to_vec();
        Box::pin(async move {
            self.with_device(GatewayOp::MoveGroup, |d| {
                d.move_rules(&scope, directive, &anchor, &names)
            })
        })
    }
}

impl SettingsGateway for MemoryGateway {
    fn get_settings(
        &self,
        target: &Target,
        section: SettingsSection,
    ) -> BoxFuture<'_, ProviderResult<SectionSettings>> {
        let target = target.clone();
        Box::pin(async move {
            self.with_device(GatewayOp::GetSettings, |d| d.section(&target, section))
        })
    }

    fn edit_settings(
        &self,
        target: &Target,
        settings: &SectionSettings,
    ) -> BoxFuture<'_, ProviderResult<()>> {
        let target = target.clone();
        let settings = settings.clone();
        Box::pin(async move {
            self.with_device(GatewayOp::EditSettings, |d| d.write_section(&target, &settings))
        })
    }
}
