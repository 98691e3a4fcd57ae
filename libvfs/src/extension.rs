//! Typed side-table for optional data attached to inodes.
//!
//! Values are stored as JSON so the record format does not change when a
//! new key is introduced. Access goes through a `Key<T>` which fixes the
//! value type at the call site.

use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub struct Key<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    pub const fn new(name: &'static str) -> Self {
        Key {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Key<T> {}

/// Number of completed downloads of a file.
pub const DOWNLOADED_TIMES: Key<u64> = Key::new("downloaded.times");
/// Accumulated download time of a file in milliseconds.
pub const DOWNLOADED_MILLISECONDS: Key<u64> = Key::new("downloaded.milliseconds");
/// Remote address of the uploader.
pub const UPLOADER_ADDRESS: Key<String> = Key::new("uploader.address");

pub fn builtin_keys() -> BTreeSet<String> {
    [DOWNLOADED_TIMES.name(), DOWNLOADED_MILLISECONDS.name(), UPLOADER_ADDRESS.name()]
        .into_iter()
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Extensions(BTreeMap<String, serde_json::Value>);

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: DeserializeOwned>(&self, key: &Key<T>) -> Option<T> {
        let value = self.0.get(key.name)?;
        match serde_json::from_value(value.clone()) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("extension {} holds an unexpected value: {e}", key.name);
                None
            }
        }
    }

    pub fn set<T: Serialize>(&mut self, key: &Key<T>, value: T) -> Result<()> {
        self.0.insert(key.name.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn remove<T: DeserializeOwned>(&mut self, key: &Key<T>) -> Option<T> {
        self.0
            .remove(key.name)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn contains<T>(&self, key: &Key<T>) -> bool {
        self.0.contains_key(key.name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Drops every entry whose key was never registered. Returns the
    /// dropped names.
    pub fn retain_known(&mut self, known: &BTreeSet<String>) -> Vec<String> {
        let dropped: Vec<String> = self
            .0
            .keys()
            .filter(|k| !known.contains(*k))
            .cloned()
            .collect();
        for name in &dropped {
            debug!("dropping unknown extension {name}");
            self.0.remove(name);
        }
        dropped
    }
}
