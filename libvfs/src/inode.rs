//! In-memory inode tree.
//!
//! Every inode lives behind an `Arc`. A directory owns its children through
//! its child map; children only point back at their parent with a `Weak`
//! which is used to walk upward when sizes and slave reference counts change.
//! Structural mutation goes through [`crate::Vfs`], which knows how to persist
//! and notify; the types here only guard their own state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::extension::{Extensions, Key};
use crate::lock;
use crate::path::{self, CiName};
use crate::slave::TransferHandle;

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attributes {
    pub username: String,
    pub group: String,
    pub last_modified: i64,
    pub creation_time: i64,
    pub extensions: Extensions,
}

impl Attributes {
    pub fn owned_by(username: &str, group: &str) -> Self {
        let now = now_millis();
        Attributes {
            username: username.to_string(),
            group: group.to_string(),
            last_modified: now,
            creation_time: now,
            extensions: Extensions::new(),
        }
    }
}

struct Header {
    name: String,
    parent: Weak<Inode>,
    attrs: Attributes,
}

pub struct Inode {
    header: Mutex<Header>,
    loaded: AtomicBool,
    deleted: AtomicBool,
    kind: InodeKind,
}

pub enum InodeKind {
    Directory(DirectoryData),
    File(FileData),
    Link(LinkData),
}

impl Inode {
    pub(crate) fn new(name: &str, attrs: Attributes, kind: InodeKind) -> Arc<Inode> {
        Arc::new(Inode {
            header: Mutex::new(Header {
                name: name.to_string(),
                parent: Weak::new(),
                attrs,
            }),
            loaded: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            kind,
        })
    }

    pub fn name(&self) -> String {
        lock(&self.header).name.clone()
    }

    pub fn parent(&self) -> Option<Arc<Inode>> {
        lock(&self.header).parent.upgrade()
    }

    /// Name and parent read under one lock so a concurrent rename cannot
    /// hand back a mismatched pair.
    pub(crate) fn name_and_parent(&self) -> (String, Option<Arc<Inode>>) {
        let header = lock(&self.header);
        (header.name.clone(), header.parent.upgrade())
    }

    pub(crate) fn attach(&self, parent: &Arc<Inode>, name: &str) {
        let mut header = lock(&self.header);
        header.parent = Arc::downgrade(parent);
        header.name = name.to_string();
    }

    pub fn path(&self) -> String {
        let (name, parent) = self.name_and_parent();
        match parent {
            None => "/".to_string(),
            Some(p) => path::join(&p.path(), &name),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent().is_none() && !self.is_deleted()
    }

    pub fn attributes(&self) -> Attributes {
        lock(&self.header).attrs.clone()
    }

    pub(crate) fn with_attrs<R>(&self, f: impl FnOnce(&mut Attributes) -> R) -> R {
        f(&mut lock(&self.header).attrs)
    }

    pub fn username(&self) -> String {
        lock(&self.header).attrs.username.clone()
    }

    pub fn group(&self) -> String {
        lock(&self.header).attrs.group.clone()
    }

    pub fn last_modified(&self) -> i64 {
        lock(&self.header).attrs.last_modified
    }

    pub fn creation_time(&self) -> i64 {
        lock(&self.header).attrs.creation_time
    }

    pub fn extension<T: serde::de::DeserializeOwned>(&self, key: &Key<T>) -> Option<T> {
        lock(&self.header).attrs.extensions.get(key)
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub(crate) fn mark_loaded(&self) {
        self.loaded.store(true, Ordering::Release);
    }

    /// `true` once this inode or any ancestor has been removed from the tree.
    pub fn is_deleted(&self) -> bool {
        if self.deleted.load(Ordering::Acquire) {
            return true;
        }
        match self.parent() {
            Some(p) => p.is_deleted(),
            None => false,
        }
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    pub fn kind(&self) -> &InodeKind {
        &self.kind
    }

    pub fn type_name(&self) -> &'static str {
        match self.kind {
            InodeKind::Directory(_) => "directory",
            InodeKind::File(_) => "file",
            InodeKind::Link(_) => "link",
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, InodeKind::Directory(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, InodeKind::File(_))
    }

    pub fn is_link(&self) -> bool {
        matches!(self.kind, InodeKind::Link(_))
    }

    pub fn as_directory(&self) -> Option<&DirectoryData> {
        match &self.kind {
            InodeKind::Directory(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileData> {
        match &self.kind {
            InodeKind::File(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_link(&self) -> Option<&LinkData> {
        match &self.kind {
            InodeKind::Link(l) => Some(l),
            _ => None,
        }
    }

    /// Size as seen by the parent: explicit for files, aggregated for
    /// directories, zero for links.
    pub fn size(&self) -> u64 {
        match &self.kind {
            InodeKind::Directory(d) => d.size(),
            InodeKind::File(f) => f.size(),
            InodeKind::Link(_) => 0,
        }
    }

    /// Slave usage as seen by the parent: one per holder for files,
    /// aggregated for directories, nothing for links.
    pub fn ref_counts(&self) -> BTreeMap<String, u64> {
        match &self.kind {
            InodeKind::Directory(d) => d.ref_counts(),
            InodeKind::File(f) => f.slaves().into_iter().map(|s| (s, 1)).collect(),
            InodeKind::Link(_) => BTreeMap::new(),
        }
    }
}

impl PartialEq for Inode {
    fn eq(&self, other: &Self) -> bool {
        path::eq_ignore_case(&self.path(), &other.path())
    }
}

impl fmt::Debug for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.type_name(), self.path())
    }
}

/// What a directory remembers about a child without loading it.
#[derive(Clone, Default)]
pub(crate) struct ChildEntry {
    pub cached: Option<Arc<Inode>>,
    pub size: u64,
    pub ref_counts: BTreeMap<String, u64>,
}

#[derive(Default)]
pub(crate) struct DirectoryState {
    pub children: BTreeMap<CiName, ChildEntry>,
    pub size: u64,
    pub ref_counts: BTreeMap<String, u64>,
    pub placeholder_last_modified: bool,
}

impl DirectoryState {
    /// Adjusts the aggregate totals by a child's delta.
    pub fn apply(&mut self, size_delta: i64, ref_deltas: &[(String, i64)]) {
        apply_size(&mut self.size, size_delta);
        apply_refs(&mut self.ref_counts, ref_deltas);
    }

    /// Recomputes the aggregates from the child summaries.
    pub fn recompute(&mut self) {
        let mut size = 0u64;
        let mut refs: BTreeMap<String, u64> = BTreeMap::new();
        for entry in self.children.values() {
            size += entry.size;
            for (slave, count) in &entry.ref_counts {
                *refs.entry(slave.clone()).or_default() += count;
            }
        }
        self.size = size;
        self.ref_counts = refs;
    }
}

pub(crate) fn apply_size(size: &mut u64, delta: i64) {
    if delta >= 0 {
        *size = size.saturating_add(delta as u64);
    } else {
        *size = size.saturating_sub(delta.unsigned_abs());
    }
}

pub(crate) fn apply_refs(refs: &mut BTreeMap<String, u64>, deltas: &[(String, i64)]) {
    for (slave, delta) in deltas {
        let count = refs.entry(slave.clone()).or_default();
        apply_size(count, *delta);
        if *count == 0 {
            refs.remove(slave);
        }
    }
}

/// Difference between two ref-count maps, `after - before`, zero entries
/// omitted.
pub(crate) fn ref_diff(
    before: &BTreeMap<String, u64>,
    after: &BTreeMap<String, u64>,
) -> Vec<(String, i64)> {
    let mut out = Vec::new();
    for (slave, count) in after {
        let old = before.get(slave).copied().unwrap_or(0);
        if old != *count {
            out.push((slave.clone(), *count as i64 - old as i64));
        }
    }
    for (slave, count) in before {
        if !after.contains_key(slave) && *count != 0 {
            out.push((slave.clone(), -(*count as i64)));
        }
    }
    out
}

pub(crate) fn negate(deltas: &[(String, i64)]) -> Vec<(String, i64)> {
    deltas.iter().map(|(s, d)| (s.clone(), -d)).collect()
}

pub struct DirectoryData {
    state: Mutex<DirectoryState>,
}

impl DirectoryData {
    pub(crate) fn new(state: DirectoryState) -> Self {
        DirectoryData {
            state: Mutex::new(state),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, DirectoryState> {
        lock(&self.state)
    }

    /// Child names in case-insensitive order.
    pub fn child_names(&self) -> Vec<String> {
        self.state()
            .children
            .keys()
            .map(|k| k.as_str().to_string())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state().children.contains_key(&CiName::from(name))
    }

    pub fn len(&self) -> usize {
        self.state().children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().children.is_empty()
    }

    pub fn size(&self) -> u64 {
        self.state().size
    }

    pub fn ref_counts(&self) -> BTreeMap<String, u64> {
        self.state().ref_counts.clone()
    }

    pub fn ref_count(&self, slave: &str) -> u64 {
        self.state().ref_counts.get(slave).copied().unwrap_or(0)
    }

    pub fn has_placeholder_last_modified(&self) -> bool {
        self.state().placeholder_last_modified
    }

    /// Recorded summary of one child: (size, ref counts).
    pub fn child_summary(&self, name: &str) -> Option<(u64, BTreeMap<String, u64>)> {
        self.state()
            .children
            .get(&CiName::from(name))
            .map(|e| (e.size, e.ref_counts.clone()))
    }

    pub(crate) fn cached_children(&self) -> Vec<Arc<Inode>> {
        self.state()
            .children
            .values()
            .filter_map(|e| e.cached.clone())
            .collect()
    }
}

#[derive(Default, Clone)]
pub(crate) struct FileState {
    pub slaves: BTreeSet<String>,
    pub size: u64,
    pub checksum: u64,
    pub xfertime: u64,
}

#[derive(Default)]
struct Transfers {
    uploads: Vec<Arc<dyn TransferHandle>>,
    downloads: Vec<Arc<dyn TransferHandle>>,
}

pub struct FileData {
    state: Mutex<FileState>,
    transfers: Mutex<Transfers>,
    checksum_fetch: tokio::sync::Mutex<()>,
}

impl FileData {
    pub(crate) fn new(state: FileState) -> Self {
        FileData {
            state: Mutex::new(state),
            transfers: Mutex::new(Transfers::default()),
            checksum_fetch: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, FileState> {
        lock(&self.state)
    }

    pub fn slaves(&self) -> BTreeSet<String> {
        self.state().slaves.clone()
    }

    pub fn has_slave(&self, slave: &str) -> bool {
        self.state().slaves.contains(slave)
    }

    pub fn size(&self) -> u64 {
        self.state().size
    }

    /// Cached checksum, 0 when unknown.
    pub fn checksum(&self) -> u64 {
        self.state().checksum
    }

    pub fn xfertime(&self) -> u64 {
        self.state().xfertime
    }

    /// One checksum fetch per file at a time.
    pub(crate) fn checksum_fetch(&self) -> &tokio::sync::Mutex<()> {
        &self.checksum_fetch
    }

    pub fn add_upload(&self, transfer: Arc<dyn TransferHandle>) {
        let mut t = lock(&self.transfers);
        t.uploads.retain(|x| !x.is_finished());
        t.uploads.push(transfer);
    }

    pub fn add_download(&self, transfer: Arc<dyn TransferHandle>) {
        let mut t = lock(&self.transfers);
        t.downloads.retain(|x| !x.is_finished());
        t.downloads.push(transfer);
    }

    pub fn active_uploads(&self) -> usize {
        lock(&self.transfers)
            .uploads
            .iter()
            .filter(|x| !x.is_finished())
            .count()
    }

    pub fn active_downloads(&self) -> usize {
        lock(&self.transfers)
            .downloads
            .iter()
            .filter(|x| !x.is_finished())
            .count()
    }

    pub fn has_active_transfers(&self) -> bool {
        self.active_uploads() + self.active_downloads() > 0
    }

    /// Signals every tracked transfer to abort and forgets them. Does not
    /// wait for the slaves to acknowledge.
    pub fn abort_transfers(&self, reason: &str) -> usize {
        let Transfers { uploads, downloads } = std::mem::take(&mut *lock(&self.transfers));
        let mut aborted = 0;
        for t in uploads.into_iter().chain(downloads) {
            if !t.is_finished() {
                t.abort(reason);
                aborted += 1;
            }
        }
        aborted
    }
}

pub struct LinkData {
    target: Mutex<String>,
}

impl LinkData {
    pub(crate) fn new(target: &str) -> Self {
        LinkData {
            target: Mutex::new(target.to_string()),
        }
    }

    pub fn target(&self) -> String {
        lock(&self.target).clone()
    }

    pub(crate) fn set_target(&self, target: &str) {
        *lock(&self.target) = target.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_diff() {
        let before: BTreeMap<String, u64> = [("a".to_string(), 2), ("b".to_string(), 1)].into();
        let after: BTreeMap<String, u64> = [("a".to_string(), 3), ("c".to_string(), 1)].into();
        let mut diff = ref_diff(&before, &after);
        diff.sort();
        assert_eq!(
            diff,
            vec![
                ("a".to_string(), 1),
                ("b".to_string(), -1),
                ("c".to_string(), 1)
            ]
        );
    }

    #[test]
    fn test_apply_refs_drops_zero() {
        let mut refs: BTreeMap<String, u64> = [("a".to_string(), 1)].into();
        apply_refs(&mut refs, &[("a".to_string(), -1), ("b".to_string(), 2)]);
        assert_eq!(refs.get("a"), None);
        assert_eq!(refs.get("b"), Some(&2));
    }

    #[test]
    fn test_path_follows_parents() {
        let root = Inode::new(
            "/",
            Attributes::owned_by("rkfs", "rkfs"),
            InodeKind::Directory(DirectoryData::new(DirectoryState::default())),
        );
        let dir = Inode::new(
            "rls",
            Attributes::owned_by("rkfs", "rkfs"),
            InodeKind::Directory(DirectoryData::new(DirectoryState::default())),
        );
        dir.attach(&root, "rls");
        let file = Inode::new(
            "a.bin",
            Attributes::owned_by("u", "g"),
            InodeKind::File(FileData::new(FileState::default())),
        );
        file.attach(&dir, "a.bin");
        assert_eq!(root.path(), "/");
        assert_eq!(file.path(), "/rls/a.bin");
        assert!(!file.is_deleted());
        dir.mark_deleted();
        assert!(file.is_deleted());
    }
}
