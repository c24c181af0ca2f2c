//! Persistence of GUID to LID bindings across manager restarts.
//!
//! The file is JSON: `{ "version": 1, "saved_at": ..., "bindings": {
//! "<port guid>": { "lid": .., "lmc": .. } } }`. Writes go to a sibling
//! temporary file first and are renamed into place.

use crate::error::{Result, SmdError};
use chrono::{DateTime, Utc};
use fabric_sm_core::LidBinding;
use fabric_sm_types::Guid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const GUID2LID_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guid2LidFile {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub bindings: BTreeMap<Guid, LidBinding>,
}

impl Guid2LidFile {
    pub fn new(bindings: BTreeMap<Guid, LidBinding>) -> Self {
        Self {
            version: GUID2LID_VERSION,
            saved_at: Utc::now(),
            bindings,
        }
    }
}

/// Reads and writes one guid2lid file.
#[derive(Debug, Clone)]
pub struct Guid2LidStore {
    path: PathBuf,
}

impl Guid2LidStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the saved bindings. A missing file yields no bindings.
    pub fn load(&self) -> Result<BTreeMap<Guid, LidBinding>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no guid2lid file");
                return Ok(BTreeMap::new());
            }
            Err(e) => return Err(SmdError::guid2lid(&self.path, e)),
        };
        let file: Guid2LidFile =
            serde_json::from_str(&content).map_err(|e| SmdError::guid2lid(&self.path, e))?;
        if file.version != GUID2LID_VERSION {
            return Err(SmdError::guid2lid(
                &self.path,
                format!("unsupported version {}", file.version),
            ));
        }
        info!(
            path = %self.path.display(),
            bindings = file.bindings.len(),
            saved_at = %file.saved_at,
            "guid2lid bindings loaded"
        );
        Ok(file.bindings)
    }

    pub fn save(&self, bindings: BTreeMap<Guid, LidBinding>) -> Result<()> {
        let file = Guid2LidFile::new(bindings);
        let content =
            serde_json::to_string_pretty(&file).map_err(|e| SmdError::guid2lid(&self.path, e))?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| SmdError::guid2lid(&self.path, e))?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, content).map_err(|e| SmdError::guid2lid(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| SmdError::guid2lid(&self.path, e))?;
        debug!(path = %self.path.display(), bindings = file.bindings.len(), "guid2lid saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_sm_types::Lid;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn bindings() -> BTreeMap<Guid, LidBinding> {
        [
            (Guid::new(0x21), LidBinding { lid: Lid::new(2), lmc: 0 }),
            (Guid::new(0x31), LidBinding { lid: Lid::new(8), lmc: 2 }),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = Guid2LidStore::new(dir.path().join("guid2lid"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = Guid2LidStore::new(dir.path().join("state").join("guid2lid"));

        store.save(bindings()).unwrap();
        assert_eq!(store.load().unwrap(), bindings());
        assert!(!dir.path().join("state").join("guid2lid.tmp").exists());
    }

    #[test]
    fn test_file_keys_are_guid_strings() {
        let dir = TempDir::new().unwrap();
        let store = Guid2LidStore::new(dir.path().join("guid2lid"));
        store.save(bindings()).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["version"], 1);
        assert!(raw["bindings"]
            .as_object()
            .unwrap()
            .contains_key("0x0000000000000031"));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guid2lid");
        fs::write(
            &path,
            r#"{"version": 9, "saved_at": "2026-01-01T00:00:00Z", "bindings": {}}"#,
        )
        .unwrap();

        let err = Guid2LidStore::new(&path).load().unwrap_err();
        assert!(err.to_string().contains("unsupported version 9"));
    }

    #[test]
    fn test_garbage_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("guid2lid");
        fs::write(&path, "not json").unwrap();
        assert!(Guid2LidStore::new(&path).load().is_err());
    }
}
