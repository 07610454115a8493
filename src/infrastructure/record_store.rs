//! Persisted sensor records in a JSON file.
//!
//! The whole file is kept in memory and rewritten on every change:
//!
//! ```json
//! { "RSCM": { "AA:BB:CC:DD:EE:FF": [1, 31, 0, 0, 0, 14, 0, 0, 0] } }
//! ```

use crate::domain::facades::RecordStore;
use crate::domain::models::BdAddr;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Default, Serialize, Deserialize)]
struct RecordFile {
    #[serde(rename = "RSCM", default)]
    sensors: BTreeMap<BdAddr, Vec<u8>>,
}

pub struct FileRecordStore {
    path: PathBuf,
    records: Mutex<RecordFile>,
}

impl FileRecordStore {
    pub fn default_path() -> Result<PathBuf> {
        let mut path = dirs::data_local_dir()
            .ok_or_else(|| anyhow!("Could not determine local data directory"))?;
        path.push("RscProfileManager");
        path.push("records.json");
        Ok(path)
    }

    /// Open the store at `path`. A missing file is an empty store; an
    /// unreadable one is logged and replaced on the next write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match Self::read(&path) {
            Ok(records) => records,
            Err(e) => {
                warn!("Ignoring record file {}: {:#}", path.display(), e);
                RecordFile::default()
            }
        };
        debug!(
            "{} sensor records loaded from {}",
            records.sensors.len(),
            path.display()
        );

        Self {
            path,
            records: Mutex::new(records),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(path: &Path) -> Result<RecordFile> {
        if !path.exists() {
            return Ok(RecordFile::default());
        }
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn write(&self, records: &RecordFile) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Cannot create {}", dir.display()))?;
        }
        let json = serde_json::to_string_pretty(records)?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, json)?;
        fs::rename(&staging, &self.path)
            .with_context(|| format!("Cannot replace {}", self.path.display()))?;
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut RecordFile) -> bool) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| anyhow!("Record store poisoned"))?;
        if f(&mut records) {
            self.write(&records)?;
        }
        Ok(())
    }
}

impl RecordStore for FileRecordStore {
    fn load(&self, address: BdAddr) -> Result<Option<Vec<u8>>> {
        let records = self
            .records
            .lock()
            .map_err(|_| anyhow!("Record store poisoned"))?;
        Ok(records.sensors.get(&address).cloned())
    }

    fn store(&self, address: BdAddr, record: &[u8]) -> Result<()> {
        self.update(|records| {
            records.sensors.insert(address, record.to_vec()).as_deref() != Some(record)
        })
    }

    fn clear(&self, address: BdAddr) -> Result<()> {
        self.update(|records| records.sensors.remove(&address).is_some())
    }
}
