use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use super::DeviceEntry;

const STORE_VERSION: u32 = 1;

#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum StoreError {
    #[display("device {_0} is already configured")]
    AlreadyConfigured(#[error(not(source))] String),

    #[display("device {_0} is not configured")]
    NotConfigured(#[error(not(source))] String),

    #[display("error accessing device store {}: {}", _0.display(), _1)]
    Io(PathBuf, #[error(source)] io::Error),

    #[display("device store {} is corrupt: {}", _0.display(), _1)]
    Corrupt(PathBuf, #[error(source)] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    entries: Vec<DeviceEntry>,
}

/// Provisioned devices, persisted as a JSON file.
#[derive(Debug)]
pub struct DeviceStore {
    path: PathBuf,
    entries: Vec<DeviceEntry>,
}

impl DeviceStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        let entries = match fs::read_to_string(&path) {
            Ok(content) => {
                let file: StoreFile =
                    serde_json::from_str(&content).map_err(|e| StoreError::Corrupt(path.clone(), e))?;
                file.entries
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("No device store at {}, starting empty", path.display());
                vec![]
            }
            Err(e) => return Err(StoreError::Io(path, e)),
        };

        Ok(Self { path, entries })
    }

    pub fn entries(&self) -> &[DeviceEntry] {
        &self.entries
    }

    pub fn get(&self, device_id: &str) -> Option<&DeviceEntry> {
        self.entries.iter().find(|e| e.device_id == device_id)
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.get(device_id).is_some()
    }

    /// API key of the first stored device, reused for further provisioning.
    pub fn api_key(&self) -> Option<&str> {
        self.entries.iter().map(|e| e.api_key.as_str()).find(|k| !k.is_empty())
    }

    pub fn add(&mut self, entry: DeviceEntry) -> Result<(), StoreError> {
        if self.contains(&entry.device_id) {
            return Err(StoreError::AlreadyConfigured(entry.device_id));
        }

        self.entries.push(entry);
        Ok(())
    }

    pub fn remove(&mut self, device_id: &str) -> Result<DeviceEntry, StoreError> {
        match self.entries.iter().position(|e| e.device_id == device_id) {
            Some(index) => Ok(self.entries.remove(index)),
            None => Err(StoreError::NotConfigured(device_id.to_owned())),
        }
    }

    pub fn save(&self) -> Result<(), StoreError> {
        let file = StoreFile {
            version: STORE_VERSION,
            entries: self.entries.clone(),
        };

        let content = serde_json::to_string_pretty(&file).map_err(|e| StoreError::Corrupt(self.path.clone(), e))?;

        write_private(&self.path, content.as_bytes()).map_err(|e| StoreError::Io(self.path.clone(), e))?;

        tracing::debug!("Saved {} device(s) to {}", self.entries.len(), self.path.display());
        Ok(())
    }
}

//write to a sibling file and rename, readable by the owner only
pub(crate) fn write_private(path: &Path, content: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&tmp_path)?;
    file.write_all(content)?;
    file.sync_all()?;

    fs::rename(&tmp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::{entry, sensor};

    #[test]
    fn missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeviceStore::load(dir.path().join("devices.json")).unwrap();

        assert!(store.entries().is_empty());
        assert_eq!(store.api_key(), None);
    }

    #[test]
    fn entries_survive_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("devices.json");

        let mut store = DeviceStore::load(&path).unwrap();
        store.add(entry("X1", vec![sensor("TEMPERATURE", "Temperature")])).unwrap();
        store.save().unwrap();

        let reloaded = DeviceStore::load(&path).unwrap();
        assert_eq!(reloaded.entries().len(), 1);
        assert_eq!(reloaded.get("X1"), store.get("X1"));
        assert_eq!(reloaded.api_key(), Some("api-key"));
    }

    #[test]
    fn duplicate_device_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DeviceStore::load(dir.path().join("devices.json")).unwrap();

        store.add(entry("X1", vec![])).unwrap();
        let result = store.add(entry("X1", vec![]));

        assert!(matches!(result, Err(StoreError::AlreadyConfigured(id)) if id == "X1"));
    }

    #[test]
    fn remove_device() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DeviceStore::load(dir.path().join("devices.json")).unwrap();
        store.add(entry("X1", vec![])).unwrap();

        assert_eq!(store.remove("X1").unwrap().device_id, "X1");
        assert!(matches!(store.remove("X1"), Err(StoreError::NotConfigured(_))));
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        fs::write(&path, "{not json").unwrap();

        assert!(matches!(DeviceStore::load(&path), Err(StoreError::Corrupt(_, _))));
    }

    #[cfg(unix)]
    #[test]
    fn store_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        let mut store = DeviceStore::load(&path).unwrap();
        store.add(entry("X1", vec![])).unwrap();
        store.save().unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
