//! Namespace store: owns the root, resolves paths and lazily loads inodes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use log::{debug, error, info, warn};

use crate::commit::{CommitManager, Commitable};
use crate::disk::{DiskStore, RecordRead};
use crate::error::{Result, VfsError};
use crate::event::{EventBus, VfsEvent};
use crate::extension;
use crate::inode::{
    Attributes, ChildEntry, DirectoryData, DirectoryState, Inode, InodeKind, ref_diff,
};
use crate::path::{self, CiName};
use crate::permissions::{AllowAll, VfsPermissions};
use crate::record::{ChildSummary, InodeRecord};
use crate::slave::SlaveOps;

#[derive(Debug, Clone)]
pub struct VfsOptions {
    /// Extension keys kept when records are loaded. Anything else is dropped.
    pub known_extensions: BTreeSet<String>,
    /// Upper bound on link hops followed while resolving one path.
    pub max_link_hops: usize,
    /// Owner and group of directories the store creates on its own.
    pub system_owner: String,
    pub event_capacity: usize,
}

impl Default for VfsOptions {
    fn default() -> Self {
        VfsOptions {
            known_extensions: extension::builtin_keys(),
            max_link_hops: 16,
            system_owner: "rkfs".to_string(),
            event_capacity: 1024,
        }
    }
}

/// Persists one inode through the commit manager.
pub(crate) struct InodeCommit {
    disk: DiskStore,
    inode: Arc<Inode>,
}

impl Commitable for InodeCommit {
    fn descriptive_name(&self) -> String {
        self.inode.path()
    }

    fn commit_key(&self) -> usize {
        Arc::as_ptr(&self.inode) as usize
    }

    fn write_to_disk(&self) -> Result<()> {
        if self.inode.is_deleted() {
            debug!("skipping write of deleted {:?}", self.inode);
            return Ok(());
        }
        self.disk
            .write_record(&self.inode.path(), &self.inode.to_record())
    }
}

pub struct Vfs {
    root: Arc<Inode>,
    disk: DiskStore,
    commits: Arc<CommitManager>,
    events: EventBus,
    options: VfsOptions,
    slaves: RwLock<Option<Arc<dyn SlaveOps>>>,
    permissions: RwLock<Arc<dyn VfsPermissions>>,
}

impl Vfs {
    pub fn open(base: impl Into<PathBuf>, options: VfsOptions) -> Result<Arc<Vfs>> {
        Self::open_with(base, options, Arc::new(CommitManager::new()))
    }

    /// Opens (or bootstraps) the namespace stored under `base`, sharing
    /// `commits` with other persisted objects of the process.
    pub fn open_with(
        base: impl Into<PathBuf>,
        options: VfsOptions,
        commits: Arc<CommitManager>,
    ) -> Result<Arc<Vfs>> {
        let disk = DiskStore::new(base)?;
        let events = EventBus::new(options.event_capacity);
        let mut vfs = Vfs {
            root: Inode::new(
                "/",
                Attributes::owned_by(&options.system_owner, &options.system_owner),
                InodeKind::Directory(DirectoryData::new(DirectoryState::default())),
            ),
            disk,
            commits,
            events,
            options,
            slaves: RwLock::new(None),
            permissions: RwLock::new(Arc::new(AllowAll)),
        };
        vfs.root = vfs.load_root()?;
        info!(
            "vfs opened at {} ({} top level entries)",
            vfs.disk.base().display(),
            vfs.root.as_directory().map(|d| d.len()).unwrap_or(0)
        );
        Ok(Arc::new(vfs))
    }

    fn load_root(&self) -> Result<Arc<Inode>> {
        let root = match self.disk.read_record("/")? {
            RecordRead::Found(record) => {
                let (root, changed) = self.materialize("/", record)?;
                root.mark_loaded();
                if changed {
                    self.commit(&root);
                }
                return Ok(root);
            }
            RecordRead::Absent { .. } => {
                info!("no root record found, creating a fresh one");
                self.synthesize_directory("/")?
            }
            RecordRead::Corrupt { error, .. } => {
                error!("root record is corrupt ({error}), recreating it");
                self.disk.delete_record("/")?;
                self.synthesize_directory("/")?
            }
        };
        root.mark_loaded();
        self.flush_now(&root).map_err(|e| {
            VfsError::Fatal(format!("unable to write root record: {e}"))
        })?;
        Ok(root)
    }

    pub fn root(&self) -> Arc<Inode> {
        Arc::clone(&self.root)
    }

    pub fn disk(&self) -> &DiskStore {
        &self.disk
    }

    pub fn commits(&self) -> &Arc<CommitManager> {
        &self.commits
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn options(&self) -> &VfsOptions {
        &self.options
    }

    pub fn set_slave_ops(&self, ops: Arc<dyn SlaveOps>) {
        *self.slaves.write().unwrap_or_else(|e| e.into_inner()) = Some(ops);
    }

    pub fn slave_ops(&self) -> Option<Arc<dyn SlaveOps>> {
        self.slaves
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_permissions(&self, perms: Arc<dyn VfsPermissions>) {
        *self.permissions.write().unwrap_or_else(|e| e.into_inner()) = perms;
    }

    pub fn permissions(&self) -> Arc<dyn VfsPermissions> {
        self.permissions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Schedules `inode` for persistence. No-op until the inode is loaded.
    pub fn commit(&self, inode: &Arc<Inode>) {
        if !inode.is_loaded() {
            return;
        }
        self.commits.add(Arc::new(InodeCommit {
            disk: self.disk.clone(),
            inode: Arc::clone(inode),
        }));
    }

    /// Writes `inode` now, dropping any queued write for it.
    pub fn flush_now(&self, inode: &Arc<Inode>) -> Result<()> {
        self.commits.flush_immediate(&InodeCommit {
            disk: self.disk.clone(),
            inode: Arc::clone(inode),
        })
    }

    pub(crate) fn forget_commit(&self, inode: &Arc<Inode>) {
        self.commits.remove(Arc::as_ptr(inode) as usize);
    }

    /// Writes every queued record.
    pub fn flush(&self) -> usize {
        self.commits.flush_pending()
    }

    /// Publishes `event` if `inode` has finished loading.
    pub(crate) fn notify(&self, inode: &Inode, event: VfsEvent) {
        if inode.is_loaded() {
            self.events.publish(event);
        }
    }

    /// Resolves an absolute path. Links in the middle of the path are
    /// followed; the last component is returned as is.
    pub fn resolve(&self, path: &str) -> Result<Arc<Inode>> {
        self.resolve_hops(path, 0)
    }

    fn resolve_hops(&self, path: &str, hops: usize) -> Result<Arc<Inode>> {
        let fixed = path::fix_path(path);
        if !fixed.starts_with(path::SEPARATOR) {
            return Err(VfsError::not_found(path));
        }
        let segments: Vec<&str> = path::segments(&fixed).collect();
        let mut current = self.root();
        for (idx, segment) in segments.iter().enumerate() {
            let next = self.child_of(&current, segment).map_err(|e| match e {
                VfsError::NotFound(_) => VfsError::not_found(fixed.as_str()),
                other => other,
            })?;
            if idx + 1 == segments.len() {
                return Ok(next);
            }
            current = if next.is_directory() {
                next
            } else if let Some(link) = next.as_link() {
                if hops >= self.options.max_link_hops {
                    warn!("too many link hops resolving {fixed}");
                    return Err(VfsError::not_found(fixed.as_str()));
                }
                let target = self.resolve_hops(&link_target(&next, &link.target()), hops + 1)?;
                if !target.is_directory() {
                    return Err(VfsError::not_found(fixed.as_str()));
                }
                target
            } else {
                // a file cannot have children
                return Err(VfsError::not_found(fixed.as_str()));
            };
        }
        Ok(current)
    }

    /// Follows `inode` through links until something that is not a link.
    pub fn follow_links(&self, inode: Arc<Inode>) -> Result<Arc<Inode>> {
        let mut current = inode;
        for _ in 0..=self.options.max_link_hops {
            let Some(link) = current.as_link() else {
                return Ok(current);
            };
            let target = link_target(&current, &link.target());
            current = self.resolve(&target)?;
        }
        Err(VfsError::not_found(current.path()))
    }

    /// Looks up `name` in `dir`, loading it from disk when it is not cached.
    pub fn child_of(&self, dir: &Arc<Inode>, name: &str) -> Result<Arc<Inode>> {
        let data = dir
            .as_directory()
            .ok_or_else(|| VfsError::not_a_directory(dir.path()))?;
        match name {
            "." | "" => return Ok(Arc::clone(dir)),
            ".." => return Ok(dir.parent().unwrap_or_else(|| Arc::clone(dir))),
            _ => {}
        }
        let key = CiName::from(name);
        let real_name = {
            let state = data.state();
            match state.children.get_key_value(&key) {
                None => None,
                Some((k, entry)) => match &entry.cached {
                    Some(cached) => return Ok(Arc::clone(cached)),
                    None => Some(k.as_str().to_string()),
                },
            }
        };
        let Some(real_name) = real_name else {
            return Err(VfsError::not_found(path::join(&dir.path(), name)));
        };

        let child_path = path::join(&dir.path(), &real_name);
        let (inode, changed) = match self.load_inode(&child_path) {
            Ok(loaded) => loaded,
            Err(e) => {
                if e.is_not_found() {
                    self.remove_missing_child(dir, &real_name);
                }
                return Err(e);
            }
        };
        inode.attach(dir, &real_name);

        let (size_delta, ref_deltas) = {
            let mut state = data.state();
            let Some(entry) = state.children.get_mut(&key) else {
                return Err(VfsError::not_found(child_path));
            };
            if let Some(existing) = &entry.cached {
                return Ok(Arc::clone(existing));
            }
            let size = inode.size();
            let refs = inode.ref_counts();
            let size_delta = size as i64 - entry.size as i64;
            let ref_deltas = ref_diff(&entry.ref_counts, &refs);
            entry.cached = Some(Arc::clone(&inode));
            entry.size = size;
            entry.ref_counts = refs;
            state.apply(size_delta, &ref_deltas);
            (size_delta, ref_deltas)
        };
        inode.mark_loaded();
        if changed {
            self.commit(&inode);
            self.notify(
                &inode,
                VfsEvent::Refresh {
                    path: child_path.clone(),
                    sync: false,
                },
            );
        }
        if size_delta != 0 || !ref_deltas.is_empty() {
            warn!("recorded summary of {child_path} was stale, correcting ancestors");
            self.commit(dir);
            self.propagate(dir, size_delta, &ref_deltas);
        }
        Ok(inode)
    }

    /// Materializes the inode stored at `path`. The second value is `true`
    /// when the in-memory form differs from what was on disk and must be
    /// written back.
    fn load_inode(&self, path: &str) -> Result<(Arc<Inode>, bool)> {
        match self.disk.read_record(path)? {
            RecordRead::Found(record) => self.materialize(path, record),
            RecordRead::Absent { physical_dir: true } => {
                warn!("directory {path} has no record, regenerating it from disk");
                Ok((self.synthesize_directory(path)?, true))
            }
            RecordRead::Absent {
                physical_dir: false,
            } => Err(VfsError::not_found(path)),
            RecordRead::Corrupt {
                physical_dir,
                error,
            } => {
                error!("record of {path} is corrupt ({error}), deleting it");
                self.disk.delete_record(path)?;
                if physical_dir {
                    Ok((self.synthesize_directory(path)?, true))
                } else {
                    Err(VfsError::not_found(path))
                }
            }
        }
    }

    fn materialize(&self, path: &str, mut record: InodeRecord) -> Result<(Arc<Inode>, bool)> {
        let dropped = record
            .common_mut()
            .extensions
            .retain_known(&self.options.known_extensions);
        let mut changed = !dropped.is_empty();
        if changed {
            debug!("dropped extensions {dropped:?} from {path}");
        }

        let mut children = BTreeMap::new();
        let mut recorded_totals = None;
        if let InodeRecord::Directory(d) = &mut record {
            recorded_totals = Some((d.size, d.slave_ref_counts.clone()));
            let mut recorded = std::mem::take(&mut d.children);
            for name in self.disk.list_children(path)? {
                let summary = match recorded.remove(&name) {
                    Some(s) => s,
                    None => {
                        warn!("{name} exists in {path} but is missing from its record");
                        changed = true;
                        self.summarize_on_disk(&path::join(path, &name))
                    }
                };
                children.insert(name, summary);
            }
            for name in recorded.keys() {
                error!("{} is recorded but has no physical backing", path::join(path, name));
                changed = true;
            }
        }

        let inode = Inode::from_record(path::get_last(path), record, children);
        if let Some((size, refs)) = recorded_totals {
            if inode.size() != size || inode.ref_counts() != refs {
                warn!("aggregates of {path} did not match its children, recomputed");
                changed = true;
            }
        }
        Ok((inode, changed))
    }

    /// Builds a directory from the physical layout alone. Child summaries
    /// are read from the children's own records.
    fn synthesize_directory(&self, path: &str) -> Result<Arc<Inode>> {
        let mut state = DirectoryState::default();
        if self.disk.is_physical_dir(path) {
            for name in self.disk.list_children(path)? {
                let summary = self.summarize_on_disk(&path::join(path, &name));
                state.children.insert(
                    CiName::new(name),
                    ChildEntry {
                        cached: None,
                        size: summary.size,
                        ref_counts: summary.ref_counts,
                    },
                );
            }
        }
        state.recompute();
        state.placeholder_last_modified = true;
        let owner = &self.options.system_owner;
        Ok(Inode::new(
            path::get_last(path),
            Attributes::owned_by(owner, owner),
            InodeKind::Directory(DirectoryData::new(state)),
        ))
    }

    fn summarize_on_disk(&self, path: &str) -> ChildSummary {
        match self.disk.read_record(path) {
            Ok(RecordRead::Found(InodeRecord::Directory(d))) => ChildSummary {
                size: d.size,
                ref_counts: d.slave_ref_counts,
            },
            Ok(RecordRead::Found(InodeRecord::File(f))) => ChildSummary {
                size: f.size,
                ref_counts: f.slaves.into_iter().map(|s| (s, 1)).collect(),
            },
            _ => ChildSummary::default(),
        }
    }

    /// Drops every cached child of `dir` so it is reloaded from disk on next
    /// access. Queued records are written first. Files with transfers in
    /// flight stay cached. Returns the number of evicted children.
    pub fn evict_children(&self, dir: &Arc<Inode>) -> usize {
        let Some(data) = dir.as_directory() else {
            return 0;
        };
        self.flush();
        let mut state = data.state();
        let mut evicted = 0;
        for entry in state.children.values_mut() {
            let busy = entry
                .cached
                .as_ref()
                .and_then(|c| c.as_file().map(|f| f.has_active_transfers()))
                .unwrap_or(false);
            if entry.cached.is_some() && !busy {
                entry.cached = None;
                evicted += 1;
            }
        }
        evicted
    }
}

/// Absolute target of a link; relative targets are taken from the link's
/// directory.
pub(crate) fn link_target(link: &Inode, target: &str) -> String {
    if target.starts_with(path::SEPARATOR) {
        target.to_string()
    } else {
        let link_path = link.path();
        path::join(path::strip_last(&link_path), target)
    }
}
