//! JSON configuration file: where the device lives, where state is kept,
//! and the rule groups and settings overlays to converge on.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use panos_core::identity::CompositeIdentity;
use panos_core::movement::MovementDirective;
use panos_core::resource::{ResourceId, Value};
use panos_core::rule::BgpExportRule;
use panos_core::scope::{Scope, Target};
use panos_core::settings::{SectionSettings, SettingsSection};
use panos_state::BackendConfig;

pub const GROUP_RESOURCE_TYPE: &str = "bgp_export_rule_group";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Device file, relative to the configuration file
    pub device: PathBuf,
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub bgp_export_rule_groups: Vec<GroupConfig>,
    #[serde(default)]
    pub settings: Vec<SettingsConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendSection {
    #[serde(rename = "type", default = "default_backend_type")]
    pub backend_type: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub lock_timeout: Option<i64>,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            backend_type: default_backend_type(),
            path: None,
            lock_timeout: None,
        }
    }
}

fn default_backend_type() -> String {
    "local".to_string()
}

fn default_target() -> Target {
    Target::Firewall
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    pub name: String,
    #[serde(default = "default_target")]
    pub target: Target,
    pub virtual_router: String,
    #[serde(default)]
    pub position_keyword: String,
    #[serde(default)]
    pub position_reference: String,
    pub rules: Vec<BgpExportRule>,
}

impl GroupConfig {
    pub fn resource_id(&self) -> ResourceId {
        ResourceId::new(GROUP_RESOURCE_TYPE, &self.name)
    }

    pub fn scope(&self) -> Scope {
        Scope::new(self.target.clone(), &self.virtual_router)
    }

    pub fn directive(&self) -> Result<MovementDirective, String> {
        self.position_keyword
            .parse()
            .map_err(|e| format!("{}: {}", self.resource_id(), e))
    }

    /// The identity this group would have once applied
    pub fn desired_identity(&self) -> Result<CompositeIdentity, String> {
        let names = self.rules.iter().map(|r| r.name.clone()).collect();
        CompositeIdentity::new(
            self.scope(),
            self.directive()?,
            &self.position_reference,
            names,
        )
        .map_err(|e| format!("{}: {}", self.resource_id(), e))
    }
}

/// A settings overlay. `fields` is checked against the section's field set
/// while the file is parsed.
#[derive(Debug, Deserialize)]
#[serde(try_from = "SettingsEntry")]
pub struct SettingsConfig {
    pub name: String,
    pub target: Target,
    pub settings: SectionSettings,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsEntry {
    name: String,
    #[serde(default = "default_target")]
    target: Target,
    section: SettingsSection,
    fields: serde_json::Value,
}

impl TryFrom<SettingsEntry> for SettingsConfig {
    type Error = String;

    fn try_from(entry: SettingsEntry) -> Result<Self, Self::Error> {
        let settings = SectionSettings::from_fields(entry.section, entry.fields).map_err(|e| {
            format!(
                "{}.{}: {}",
                entry.section.resource_type(),
                entry.name,
                e
            )
        })?;
        Ok(SettingsConfig {
            name: entry.name,
            target: entry.target,
            settings,
        })
    }
}

impl SettingsConfig {
    pub fn section(&self) -> SettingsSection {
        self.settings.section()
    }

    pub fn resource_id(&self) -> ResourceId {
        ResourceId::new(self.section().resource_type(), &self.name)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        let mut config: Config = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))?;

        // Paths in the file are relative to the file itself
        let base_dir = path.parent().unwrap_or(Path::new("."));
        if config.device.is_relative() {
            config.device = base_dir.join(&config.device);
        }
        if let Some(state_path) = &config.backend.path
            && Path::new(state_path).is_relative()
        {
            config.backend.path = Some(base_dir.join(state_path).display().to_string());
        }

        Ok(config)
    }

    pub fn backend_config(&self) -> BackendConfig {
        let mut config = BackendConfig {
            backend_type: self.backend.backend_type.clone(),
            attributes: Default::default(),
        };
        if let Some(path) = &self.backend.path {
            config = config.with_attribute("path", Value::String(path.clone()));
        }
        if let Some(timeout) = self.backend.lock_timeout {
            config = config.with_attribute("lock_timeout", Value::Int(timeout));
        }
        config
    }

    /// Check every declared resource, collecting all problems
    pub fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();
        // (scope key, rule name) -> owning group
        let mut owners: HashMap<(String, &str), &str> = HashMap::new();

        for group in &self.bgp_export_rule_groups {
            if !seen.insert(group.resource_id()) {
                errors.push(format!("{}: declared more than once", group.resource_id()));
            }
            if let Err(e) = group.desired_identity() {
                errors.push(e);
            }
            let scope_key = group.scope().key();
            for rule in &group.rules {
                if let Err(e) = rule.validate() {
                    errors.push(format!("{}: {}", group.resource_id(), e));
                }
                let key = (scope_key.clone(), rule.name.as_str());
                if let Some(owner) = owners.insert(key, group.name.as_str())
                    && owner != group.name
                {
                    errors.push(format!(
                        "{}: rule {:?} in {} is already part of {}.{}",
                        group.resource_id(),
                        rule.name,
                        group.scope(),
                        GROUP_RESOURCE_TYPE,
                        owner
                    ));
                }
            }
        }

        for settings in &self.settings {
            if !seen.insert(settings.resource_id()) {
                errors.push(format!(
                    "{}: declared more than once",
                    settings.resource_id()
                ));
            }
            if let Err(e) = settings.target.validate() {
                errors.push(format!("{}: {}", settings.resource_id(), e));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("\n"))
        }
    }

    pub fn resource_count(&self) -> usize {
        self.bgp_export_rule_groups.len() + self.settings.len()
    }

    pub fn group(&self, name: &str) -> Option<&GroupConfig> {
        self.bgp_export_rule_groups.iter().find(|g| g.name == name)
    }

    pub fn settings_for(&self, id: &ResourceId) -> Option<&SettingsConfig> {
        self.settings.iter().find(|s| &s.resource_id() == id)
    }

    pub fn declares(&self, id: &ResourceId) -> bool {
        self.bgp_export_rule_groups
            .iter()
            .map(GroupConfig::resource_id)
            .chain(self.settings.iter().map(SettingsConfig::resource_id))
            .any(|declared| &declared == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Config {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn parse_minimal_config() {
        let config = parse(
            r#"{
                "device": "device.json",
                "bgp_export_rule_groups": [{
                    "name": "exports",
                    "virtual_router": "default",
                    "position_keyword": "after",
                    "position_reference": "base",
                    "rules": [{"name": "r1"}, {"name": "r2", "action": "deny"}]
                }]
            }"#,
        );

        assert_eq!(config.backend.backend_type, "local");
        let group = &config.bgp_export_rule_groups[0];
        assert_eq!(group.target, Target::Firewall);
        assert_eq!(group.directive().unwrap(), MovementDirective::After);
        let identity = group.desired_identity().unwrap();
        assert_eq!(identity.names(), &["r1".to_string(), "r2".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_panorama_target_and_settings() {
        let config = parse(
            r#"{
                "device": "pano.json",
                "backend": {"type": "local", "path": "state.json", "lock_timeout": 30},
                "settings": [{
                    "name": "tmpl",
                    "target": {"kind": "panorama", "template": "tmplA"},
                    "section": "general",
                    "fields": {"hostname": "fw01", "login_banner": "hi"}
                }]
            }"#,
        );

        let settings = &config.settings[0];
        assert_eq!(settings.target, Target::panorama("tmplA", ""));
        assert_eq!(settings.resource_id().to_string(), "general_settings.tmpl");
        match &settings.settings {
            SectionSettings::General(fields) => {
                assert_eq!(fields.hostname.as_deref(), Some("fw01"));
                assert_eq!(fields.login_banner.as_deref(), Some("hi"));
                assert_eq!(fields.timezone, None);
            }
            other => panic!("Expected general settings, got {:?}", other),
        }

        let backend = config.backend_config();
        assert_eq!(backend.get_string("path"), Some("state.json"));
        assert_eq!(backend.get_int("lock_timeout"), Some(30));
    }

    #[test]
    fn validate_collects_every_problem() {
        let config = parse(
            r#"{
                "device": "device.json",
                "bgp_export_rule_groups": [
                    {"name": "a", "virtual_router": "vr1", "position_keyword": "sideways", "rules": [{"name": "r1"}]},
                    {"name": "a", "virtual_router": "vr1", "position_keyword": "before", "rules": [{"name": "r1"}]},
                    {"name": "b", "virtual_router": "vr1", "rules": []},
                    {"name": "c", "virtual_router": "vr1", "rules": [{"name": "r1", "as_path_limit": 0}]}
                ],
                "settings": [
                    {"name": "s", "target": {"kind": "panorama"}, "section": "management", "fields": {"idle_timeout": 10}}
                ]
            }"#,
        );

        let errors = config.validate().unwrap_err();
        assert!(errors.contains("bgp_export_rule_group.a: declared more than once"));
        assert!(errors.contains("sideways"));
        assert!(errors.contains("bgp_export_rule_group.b"));
        assert!(errors.contains("bgp_export_rule_group.c"));
        assert!(errors.contains("setting_management.s"));
    }

    #[test]
    fn settings_fields_are_checked_while_parsing() {
        let result: Result<Config, _> = serde_json::from_str(
            r#"{
                "device": "device.json",
                "settings": [{"name": "fw", "section": "general", "fields": {"hostnmae": "fw01"}}]
            }"#,
        );
        let err = result.unwrap_err().to_string();
        assert!(err.contains("general_settings.fw"));
        assert!(err.contains("hostnmae"));

        let result: Result<Config, _> = serde_json::from_str(
            r#"{
                "device": "device.json",
                "settings": [{"name": "fw", "section": "management", "fields": {"_idle": 5}}]
            }"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn rule_owned_by_two_groups_is_rejected() {
        let config = parse(
            r#"{
                "device": "device.json",
                "bgp_export_rule_groups": [
                    {"name": "a", "virtual_router": "vr1", "position_keyword": "top", "rules": [{"name": "r1"}]},
                    {"name": "b", "virtual_router": "vr1", "position_keyword": "bottom", "rules": [{"name": "r1", "action": "deny"}]},
                    {"name": "c", "virtual_router": "vr2", "rules": [{"name": "r1"}]}
                ]
            }"#,
        );

        let errors = config.validate().unwrap_err();
        assert!(errors.contains("bgp_export_rule_group.b: rule \"r1\""));
        assert!(errors.contains("already part of bgp_export_rule_group.a"));
        assert!(!errors.contains("bgp_export_rule_group.c"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<Config, _> =
            serde_json::from_str(r#"{"device": "d.json", "providers": []}"#);
        assert!(result.is_err());
    }

    #[test]
    fn load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("panos.json");
        fs::write(
            &path,
            r#"{"device": "device.json", "backend": {"path": "panos.state.json"}}"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.device, dir.path().join("device.json"));
        assert_eq!(
            config.backend.path.as_deref(),
            Some(dir.path().join("panos.state.json").display().to_string().as_str())
        );
    }
}
