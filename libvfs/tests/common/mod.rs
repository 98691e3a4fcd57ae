#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, Once};

use async_trait::async_trait;
use libvfs::{DirectoryHandle, RemergeSlave, Result, SlaveOps, Vfs, VfsError, VfsOptions};
use tempfile::TempDir;

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_secs()
            .is_test(true)
            .init();
    });
}

pub fn open_vfs() -> (TempDir, Arc<Vfs>) {
    init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let vfs = Vfs::open(tmp.path(), VfsOptions::default()).unwrap();
    (tmp, vfs)
}

/// Records what the engine asked one slave to do.
#[derive(Default)]
pub struct FakeRemergeSlave {
    pub name: String,
    pub checksums: bool,
    pub renames: Mutex<Vec<(String, String, String)>>,
    pub deletes: Mutex<Vec<String>>,
    pub queued: Mutex<Vec<String>>,
}

impl FakeRemergeSlave {
    pub fn new(name: &str) -> Self {
        FakeRemergeSlave {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_checksums(name: &str) -> Self {
        FakeRemergeSlave {
            checksums: true,
            ..Self::new(name)
        }
    }
}

impl RemergeSlave for FakeRemergeSlave {
    fn name(&self) -> &str {
        &self.name
    }

    fn checksums_on_remerge(&self) -> bool {
        self.checksums
    }

    fn queue_checksum(&self, path: &str) {
        self.queued.lock().unwrap().push(path.to_string());
    }

    fn simple_rename(&self, from: &str, to_dir: &str, to_name: &str) {
        self.renames
            .lock()
            .unwrap()
            .push((from.to_string(), to_dir.to_string(), to_name.to_string()));
    }

    fn simple_delete(&self, path: &str) {
        self.deletes.lock().unwrap().push(path.to_string());
    }
}

/// Registry stand-in with a fixed set of known and online slaves.
#[derive(Default)]
pub struct FakeSlaveOps {
    pub known: BTreeSet<String>,
    pub online: BTreeSet<String>,
    pub checksums: BTreeMap<String, u64>,
    pub deletes: Mutex<Vec<(String, String)>>,
    pub renames: Mutex<Vec<(String, String, String, String)>>,
    pub broadcast_deletes: Mutex<Vec<String>>,
    pub broadcast_renames: Mutex<Vec<(String, String, String)>>,
    pub cancelled: Mutex<Vec<String>>,
    pub checksum_calls: Mutex<Vec<String>>,
}

impl FakeSlaveOps {
    pub fn new(known: &[&str], online: &[&str]) -> Self {
        FakeSlaveOps {
            known: known.iter().map(|s| s.to_string()).collect(),
            online: online.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl SlaveOps for FakeSlaveOps {
    fn is_known(&self, slave: &str) -> bool {
        self.known.contains(slave)
    }

    fn is_available(&self, slave: &str) -> bool {
        self.online.contains(slave)
    }

    fn available_slaves(&self) -> BTreeSet<String> {
        self.online.clone()
    }

    fn simple_delete(&self, slave: &str, path: &str) {
        self.deletes
            .lock()
            .unwrap()
            .push((slave.to_string(), path.to_string()));
    }

    fn simple_rename(&self, slave: &str, from: &str, to_dir: &str, to_name: &str) {
        self.renames.lock().unwrap().push((
            slave.to_string(),
            from.to_string(),
            to_dir.to_string(),
            to_name.to_string(),
        ));
    }

    async fn delete_on_all_slaves(&self, path: &str) {
        self.broadcast_deletes.lock().unwrap().push(path.to_string());
    }

    fn rename_on_all_slaves(&self, from: &str, to_dir: &str, to_name: &str) {
        self.broadcast_renames.lock().unwrap().push((
            from.to_string(),
            to_dir.to_string(),
            to_name.to_string(),
        ));
    }

    fn cancel_transfers_in_directory(&self, path: &str, _reason: &str) {
        self.cancelled.lock().unwrap().push(path.to_string());
    }

    async fn checksum(&self, slave: &str, path: &str) -> Result<u64> {
        self.checksum_calls.lock().unwrap().push(slave.to_string());
        match self.checksums.get(slave) {
            Some(c) => Ok(*c),
            None => Err(VfsError::SlaveUnavailable(format!("{slave} cannot read {path}"))),
        }
    }
}

/// Name, slaves and size of every file, plus size and ref counts of every
/// directory, walking the whole subtree.
pub fn snapshot(dir: &DirectoryHandle) -> Vec<String> {
    let mut out = Vec::new();
    let inode = dir.inode().unwrap();
    let data = inode.as_directory().unwrap();
    out.push(format!(
        "d {} size={} refs={:?}",
        dir.path(),
        data.size(),
        data.ref_counts()
    ));
    for handle in dir.sorted_inode_handles_unchecked().unwrap() {
        match handle {
            libvfs::Handle::Directory(d) => out.extend(snapshot(&d)),
            libvfs::Handle::File(f) => out.push(format!(
                "f {} size={} slaves={:?}",
                f.path(),
                f.size().unwrap(),
                f.slaves().unwrap()
            )),
            libvfs::Handle::Link(l) => {
                out.push(format!("l {} -> {}", l.path(), l.target().unwrap()))
            }
        }
    }
    out
}

/// Checks that every directory's size and per-slave counts equal the sum
/// over its children.
pub fn assert_aggregates(dir: &DirectoryHandle) {
    let inode = dir.inode().unwrap();
    let data = inode.as_directory().unwrap();
    let mut size = 0;
    let mut refs: BTreeMap<String, u64> = BTreeMap::new();
    for handle in dir.inode_handles_unchecked().unwrap() {
        match &handle {
            libvfs::Handle::Directory(d) => {
                assert_aggregates(d);
                let child = d.inode().unwrap();
                let cd = child.as_directory().unwrap();
                size += cd.size();
                for (s, c) in cd.ref_counts() {
                    *refs.entry(s).or_default() += c;
                }
            }
            libvfs::Handle::File(f) => {
                size += f.size().unwrap();
                for s in f.slaves().unwrap() {
                    *refs.entry(s).or_default() += 1;
                }
            }
            libvfs::Handle::Link(_) => {}
        }
    }
    assert_eq!(data.size(), size, "size of {}", dir.path());
    assert_eq!(data.ref_counts(), refs, "ref counts of {}", dir.path());
}
