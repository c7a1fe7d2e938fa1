//! Settings - Merge-then-edit for singleton settings sections
//!
//! General and management settings exist exactly once per target and are
//! shared with whatever else configures the device. A resource therefore
//! only owns the fields it declares: writes go through a fetch / overlay /
//! write-back transaction where declared fields win and every other field
//! keeps its current value.

use std::fmt;
use std::str::FromStr;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provider::{ProviderError, SettingsGateway};
use crate::scope::{ScopeError, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingsSection {
    /// Hostname, DNS, NTP, update server, proxy, login banner
    General,
    /// Session limits, lockout, logging behaviour
    Management,
}

impl SettingsSection {
    pub fn resource_type(self) -> &'static str {
        match self {
            SettingsSection::General => "general_settings",
            SettingsSection::Management => "setting_management",
        }
    }
}

impl fmt::Display for SettingsSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingsSection::General => write!(f, "general"),
            SettingsSection::Management => write!(f, "management"),
        }
    }
}

impl FromStr for SettingsSection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "general" => Ok(SettingsSection::General),
            "management" => Ok(SettingsSection::Management),
            other => Err(format!("unknown settings section: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NtpAuthType {
    None,
    Autokey,
    SymmetricKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NtpAlgorithm {
    Sha1,
    Md5,
}

/// Declares a settings section whose fields are all optional. `None` means
/// "not declared": it is never written and never compared.
macro_rules! settings_section {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $($(#[$field_meta:meta])* $field:ident: $ty:ty,)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        #[serde(deny_unknown_fields)]
        pub struct $name {
            $(
                $(#[$field_meta])*
                #[serde(default, skip_serializing_if = "Option::is_none")]
                pub $field: Option<$ty>,
            )*
        }

        impl $name {
            /// `self` with every declared field of `overlay` copied over it
            pub fn overlay(&self, overlay: &Self) -> Self {
                Self {
                    $($field: overlay.$field.clone().or_else(|| self.$field.clone()),)*
                }
            }

            /// Declared fields of `overlay` whose value differs from `self`, sorted
            pub fn changed_fields(&self, overlay: &Self) -> Vec<&'static str> {
                let mut changed = Vec::new();
                $(
                    if overlay.$field.is_some() && overlay.$field != self.$field {
                        changed.push(stringify!($field));
                    }
                )*
                changed.sort_unstable();
                changed
            }
        }
    };
}

settings_section! {
    /// `deviceconfig system` fields
    pub struct GeneralSettings {
        hostname: String,
        timezone: String,
        domain: String,
        login_banner: String,
        update_server: String,
        verify_update_server: bool,
        proxy_server: String,
        proxy_port: u16,
        proxy_user: String,
        proxy_password: String,
        panorama_primary: String,
        panorama_secondary: String,
        dns_primary: String,
        dns_secondary: String,
        ntp_primary_address: String,
        ntp_primary_auth_type: NtpAuthType,
        ntp_primary_key_id: u32,
        ntp_primary_algorithm: NtpAlgorithm,
        ntp_primary_auth_key: String,
        ntp_secondary_address: String,
        ntp_secondary_auth_type: NtpAuthType,
        ntp_secondary_key_id: u32,
        ntp_secondary_algorithm: NtpAlgorithm,
        ntp_secondary_auth_key: String,
    }
}

settings_section! {
    /// `deviceconfig setting management` fields
    pub struct ManagementSettings {
        enable_log_high_dp_load: bool,
        enable_high_speed_log_forwarding: bool,
        support_utf8_for_log_output: bool,
        traffic_stop_on_logdb_full: bool,
        /// Minutes
        idle_timeout: u32,
        hostname_type_in_syslog: String,
        failed_attempts: u32,
        /// Minutes
        lockout_time: u32,
        max_session_count: u32,
        /// Minutes
        max_session_time: u32,
        threat_vault_access: bool,
    }
}

/// Content of one settings section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "section", content = "fields", rename_all = "lowercase")]
pub enum SectionSettings {
    General(GeneralSettings),
    Management(ManagementSettings),
}

impl SectionSettings {
    /// A section with no field set
    pub fn empty(section: SettingsSection) -> Self {
        match section {
            SettingsSection::General => SectionSettings::General(GeneralSettings::default()),
            SettingsSection::Management => {
                SectionSettings::Management(ManagementSettings::default())
            }
        }
    }

    /// Parse the fields of `section`. Unknown field names are rejected.
    pub fn from_fields(
        section: SettingsSection,
        fields: serde_json::Value,
    ) -> serde_json::Result<Self> {
        match section {
            SettingsSection::General => serde_json::from_value(fields).map(SectionSettings::General),
            SettingsSection::Management => {
                serde_json::from_value(fields).map(SectionSettings::Management)
            }
        }
    }

    pub fn section(&self) -> SettingsSection {
        match self {
            SectionSettings::General(_) => SettingsSection::General,
            SectionSettings::Management(_) => SettingsSection::Management,
        }
    }

    /// Declared fields as a JSON object
    pub fn to_fields(&self) -> serde_json::Result<serde_json::Map<String, serde_json::Value>> {
        let value = match self {
            SectionSettings::General(fields) => serde_json::to_value(fields)?,
            SectionSettings::Management(fields) => serde_json::to_value(fields)?,
        };
        serde_json::from_value(value)
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error(transparent)]
    Target(#[from] ScopeError),

    #[error("failed to read {section} settings: {source}")]
    Fetch {
        section: SettingsSection,
        source: ProviderError,
    },

    #[error("failed to write {section} settings: {source}")]
    WriteBack {
        section: SettingsSection,
        source: ProviderError,
    },

    #[error("asked for {expected} settings, device returned {actual}")]
    SectionMismatch {
        expected: SettingsSection,
        actual: SettingsSection,
    },
}

/// Outcome of a merge-then-edit transaction
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsChange {
    /// Section content after the overlay
    pub merged: SectionSettings,
    /// Declared fields whose value differed from the device, sorted
    pub changed_fields: Vec<&'static str>,
}

impl SettingsChange {
    pub fn is_noop(&self) -> bool {
        self.changed_fields.is_empty()
    }
}

/// Apply the declared fields of `overlay` on top of `current`.
/// Fields `overlay` leaves undeclared keep their current value.
pub fn overlay(
    current: &SectionSettings,
    overlay: &SectionSettings,
) -> Result<SettingsChange, SettingsError> {
    match (current, overlay) {
        (SectionSettings::General(current), SectionSettings::General(overlay)) => {
            Ok(SettingsChange {
                merged: SectionSettings::General(current.overlay(overlay)),
                changed_fields: current.changed_fields(overlay),
            })
        }
        (SectionSettings::Management(current), SectionSettings::Management(overlay)) => {
            Ok(SettingsChange {
                merged: SectionSettings::Management(current.overlay(overlay)),
                changed_fields: current.changed_fields(overlay),
            })
        }
        _ => Err(SettingsError::SectionMismatch {
            expected: overlay.section(),
            actual: current.section(),
        }),
    }
}

async fn fetch<G>(
    gateway: &G,
    target: &Target,
    section: SettingsSection,
) -> Result<SectionSettings, SettingsError>
where
    G: SettingsGateway + ?Sized,
{
    target.validate()?;
    gateway
        .get_settings(target, section)
        .await
        .map_err(|source| SettingsError::Fetch { section, source })
}

/// Declared fields that differ from the device, without writing anything
pub async fn plan_settings<G>(
    gateway: &G,
    target: &Target,
    fields: &SectionSettings,
) -> Result<Vec<&'static str>, SettingsError>
where
    G: SettingsGateway + ?Sized,
{
    let current = fetch(gateway, target, fields.section()).await?;
    Ok(overlay(&current, fields)?.changed_fields)
}

/// Fetch the current section, overlay `fields` and write the result back.
///
/// Nothing is written when the overlay does not change any value.
pub async fn merge_then_edit<G>(
    gateway: &G,
    target: &Target,
    fields: &SectionSettings,
) -> Result<SettingsChange, SettingsError>
where
    G: SettingsGateway + ?Sized,
{
    let section = fields.section();
    let current = fetch(gateway, target, section).await?;
    let change = overlay(&current, fields)?;

    if change.is_noop() {
        debug!("{} settings on {} already up to date", section, target);
        return Ok(change);
    }

    info!(
        "updating {} settings on {}: {}",
        section,
        target,
        change.changed_fields.join(", ")
    );
    gateway
        .edit_settings(target, &change.merged)
        .await
        .map_err(|source| SettingsError::WriteBack { section, source })?;

    Ok(change)
}
