//! Persisted slave records.
//!
//! The current format is `<name>.json`. Records written by older masters
//! are `<name>.yaml` with a flatter layout; they are read when no JSON
//! record exists and are replaced by a JSON record on first load.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::slave::masks::HostMaskCollection;
use crate::stats::TransferStats;

/// A delete (no destination) or rename waiting for an offline slave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub source: String,
    pub destination: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveRecord {
    pub name: String,
    #[serde(default)]
    pub masks: HostMaskCollection,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub queue: VecDeque<QueuedOperation>,
    #[serde(default)]
    pub stats: TransferStats,
}

impl SlaveRecord {
    pub fn new(name: &str) -> Self {
        SlaveRecord {
            name: name.to_string(),
            masks: HostMaskCollection::default(),
            properties: BTreeMap::new(),
            queue: VecDeque::new(),
            stats: TransferStats::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LegacySlaveRecord {
    name: String,
    #[serde(default)]
    masks: Vec<String>,
    #[serde(default, rename = "keysAndValues")]
    keys_and_values: BTreeMap<String, String>,
    #[serde(default, rename = "renameQueue")]
    rename_queue: Vec<LegacyQueuedOperation>,
}

#[derive(Debug, Deserialize)]
struct LegacyQueuedOperation {
    source: String,
    #[serde(default)]
    destination: Option<String>,
}

impl TryFrom<LegacySlaveRecord> for SlaveRecord {
    type Error = crate::error::MasterError;

    fn try_from(old: LegacySlaveRecord) -> Result<Self> {
        Ok(SlaveRecord {
            name: old.name,
            masks: HostMaskCollection::try_from(old.masks)?,
            properties: old.keys_and_values,
            queue: old
                .rename_queue
                .into_iter()
                .map(|op| QueuedOperation {
                    source: op.source,
                    destination: op.destination,
                })
                .collect(),
            stats: TransferStats::default(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOrigin {
    Current,
    Legacy,
}

pub fn record_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.json"))
}

pub fn legacy_record_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.yaml"))
}

/// Reads the record stored for `name`, preferring the current format.
pub fn read_record(dir: &Path, name: &str) -> Result<Option<(SlaveRecord, RecordOrigin)>> {
    match fs::read(record_path(dir, name)) {
        Ok(data) => {
            debug!("Loading slave '{name}' JSON data from disk.");
            return Ok(Some((serde_json::from_slice(&data)?, RecordOrigin::Current)));
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    match fs::read_to_string(legacy_record_path(dir, name)) {
        Ok(data) => {
            debug!("Loading slave '{name}' legacy data from disk.");
            let old: LegacySlaveRecord = serde_yaml::from_str(&data)?;
            Ok(Some((SlaveRecord::try_from(old)?, RecordOrigin::Legacy)))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Writes the record next to its final location and renames it into place.
pub fn write_record(dir: &Path, record: &SlaveRecord) -> Result<()> {
    fs::create_dir_all(dir)?;
    let path = record_path(dir, &record.name);
    let tmp = dir.join(format!(".{}.json.tmp", record.name));
    {
        let mut file = fs::File::create(&tmp)?;
        serde_json::to_writer_pretty(&mut file, record)?;
        file.flush()?;
        file.sync_all()?;
    }
    fs::rename(&tmp, &path)?;
    debug!("Wrote slavefile for {}", record.name);
    Ok(())
}

/// Removes the record file. `false` if there was none.
pub fn delete_record(dir: &Path, name: &str) -> Result<bool> {
    match fs::remove_file(record_path(dir, name)) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Slave names with a record of either format in `dir`.
pub fn list_records(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let ext = path.extension().and_then(|e| e.to_str());
        if !matches!(ext, Some("json") | Some("yaml")) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if stem.starts_with('.') {
            continue;
        }
        names.push(stem.to_string());
    }
    names.sort();
    names.dedup();
    Ok(names)
}
