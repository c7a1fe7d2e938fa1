//! File-backed device: a `MemoryDevice` persisted as JSON after every write.
//!
//! Lets `panos` run end to end without a firewall. Each mutating call is
//! saved immediately, so a run that fails halfway leaves the file in the
//! same partial state a real device would be in.

use std::fs;
use std::path::{Path, PathBuf};

use panos_core::memory::{MemoryDevice, MemoryGateway};
use panos_core::movement::MovementDirective;
use panos_core::provider::{
    BoxFuture, OrderedListGateway, ProviderError, ProviderResult, SettingsGateway,
};
use panos_core::rule::BgpExportRule;
use panos_core::scope::{Scope, Target};
use panos_core::settings::{SectionSettings, SettingsSection};

pub struct FileDevice {
    path: PathBuf,
    inner: MemoryGateway,
}

impl FileDevice {
    pub fn open(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read device file {}: {}", path.display(), e))?;
        let device: MemoryDevice = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse device file {}: {}", path.display(), e))?;
        log::debug!("opened {} device from {}", device.kind, path.display());

        Ok(Self {
            path: path.to_path_buf(),
            inner: MemoryGateway::new(device),
        })
    }

    fn persist(&self) -> ProviderResult<()> {
        let content = serde_json::to_string_pretty(&self.inner.snapshot()).map_err(|e| {
            ProviderError::new("Failed to serialize device").with_cause(e)
        })?;
        fs::write(&self.path, content).map_err(|e| {
            ProviderError::new(format!("Failed to save {}", self.path.display())).with_cause(e)
        })
    }
}

impl OrderedListGateway for FileDevice {
    type Entry = BgpExportRule;

    fn get_list(&self, scope: &Scope) -> BoxFuture<'_, ProviderResult<Vec<String>>> {
        self.inner.get_list(scope)
    }

    fn get(&self, scope: &Scope, name: &str) -> BoxFuture<'_, ProviderResult<Option<BgpExportRule>>> {
        self.inner.get(scope, name)
    }

    fn set(&self, scope: &Scope, entries: &[BgpExportRule]) -> BoxFuture<'_, ProviderResult<()>> {
        let scope = scope.clone();
        let entries = entries.to_vec();
        Box::pin(async move {
            self.inner.set(&scope, &entries).await?;
            self.persist()
        })
    }

    fn edit(&self, scope: &Scope, entry: &BgpExportRule) -> BoxFuture<'_, ProviderResult<()>> {
        let scope = scope.clone();
        let entry = entry.clone();
        Box::pin(async move {
            self.inner.edit(&scope, &entry).await?;
            self.persist()
        })
    }

    fn delete(&self, scope: &Scope, names: &[String]) -> BoxFuture<'_, ProviderResult<()>> {
        let scope = scope.clone();
        let names = names.to_vec();
        Box::pin(async move {
            self.inner.delete(&scope, &names).await?;
            self.persist()
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
            self.inner
                .move_group(&scope, directive, &anchor, &names)
                .await?;
            self.persist()
        })
    }
}

impl SettingsGateway for FileDevice {
    fn get_settings(
        &self,
        target: &Target,
        section: SettingsSection,
    ) -> BoxFuture<'_, ProviderResult<SectionSettings>> {
        self.inner.get_settings(target, section)
    }

    fn edit_settings(
        &self,
        target: &Target,
        settings: &SectionSettings,
    ) -> BoxFuture<'_, ProviderResult<()>> {
        let target = target.clone();
        let settings = settings.clone();
        Box::pin(async move {
            self.inner.edit_settings(&target, &settings).await?;
            self.persist()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panos_core::scope::DeviceKind;

    fn write_device(dir: &Path, device: &MemoryDevice) -> PathBuf {
        let path = dir.join("device.json");
        fs::write(&path, serde_json::to_string(device).unwrap()).unwrap();
        path
    }

    #[tokio::test]
    async fn writes_are_saved_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let scope = Scope::new(Target::Firewall, "default");
        let path = write_device(
            dir.path(),
            &MemoryDevice::new(DeviceKind::Firewall).with_rules(&scope, &["base"]),
        );

        let device = FileDevice::open(&path).unwrap();
        device
            .set(&scope, &[BgpExportRule::new("r1"), BgpExportRule::new("r2")])
            .await
            .unwrap();
        device
            .move_group(
                &scope,
                MovementDirective::Top,
                "",
                &["r1".to_string(), "r2".to_string()],
            )
            .await
            .unwrap();

        let reopened = FileDevice::open(&path).unwrap();
        assert_eq!(
            reopened.get_list(&scope).await.unwrap(),
            vec!["r1", "r2", "base"]
        );
    }

    #[tokio::test]
    async fn failed_write_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let scope = Scope::new(Target::panorama("tmplA", ""), "vr1");
        let path = write_device(dir.path(), &MemoryDevice::new(DeviceKind::Firewall));
        let before = fs::read_to_string(&path).unwrap();

        let device = FileDevice::open(&path).unwrap();
        assert!(device.edit(&scope, &BgpExportRule::new("r1")).await.is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn settings_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let target = Target::panorama("tmplA", "");
        let path = write_device(dir.path(), &MemoryDevice::new(DeviceKind::Panorama));
        let settings = SectionSettings::from_fields(
            SettingsSection::Management,
            serde_json::json!({"idle_timeout": 30, "failed_attempts": 5}),
        )
        .unwrap();

        let device = FileDevice::open(&path).unwrap();
        device.edit_settings(&target, &settings).await.unwrap();

        let reopened = FileDevice::open(&path).unwrap();
        assert_eq!(
            reopened
                .get_settings(&target, SettingsSection::Management)
                .await
                .unwrap(),
            settings
        );
        assert_eq!(
            reopened
                .get_settings(&target, SettingsSection::General)
                .await
                .unwrap(),
            SectionSettings::empty(SettingsSection::General)
        );
    }

    #[test]
    fn open_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileDevice::open(&dir.path().join("absent.json"))
            .err()
            .unwrap();
        assert!(err.contains("Failed to read device file"));
    }
}
