//! Structural mutation of the inode tree.
//!
//! A directory's child map and aggregates change under that directory's own
//! lock. Size and slave deltas then walk upward one ancestor at a time, each
//! step taking only that ancestor's lock.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::error::{Result, VfsError};
use crate::event::VfsEvent;
use crate::extension::Key;
use crate::inode::{
    Attributes, ChildEntry, DirectoryData, DirectoryState, FileData, FileState, Inode, InodeKind,
    LinkData, apply_refs, apply_size, negate, now_millis, ref_diff,
};
use crate::path::{self, CiName};
use crate::store::Vfs;

/// Result of [`Vfs::validate_size_recursive`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeValidation {
    pub old_size: u64,
    pub new_size: u64,
    /// Number of directories whose aggregates had to be corrected.
    pub corrected: usize,
}

fn positive(refs: &BTreeMap<String, u64>) -> Vec<(String, i64)> {
    refs.iter()
        .filter(|(_, c)| **c > 0)
        .map(|(s, c)| (s.clone(), *c as i64))
        .collect()
}

pub(crate) fn validate_name(dir_path: &str, name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(path::SEPARATOR)
        || path::is_reserved_name(name)
    {
        return Err(VfsError::NotValidType {
            path: path::join(dir_path, name),
            expected: "valid name",
        });
    }
    Ok(())
}

fn directory_of(inode: &Arc<Inode>) -> Result<&DirectoryData> {
    inode
        .as_directory()
        .ok_or_else(|| VfsError::not_a_directory(inode.path()))
}

fn file_of(inode: &Arc<Inode>) -> Result<&FileData> {
    inode
        .as_file()
        .ok_or_else(|| VfsError::not_a_file(inode.path()))
}

impl Vfs {
    /// Applies a child's delta to every ancestor of `from`, nearest first.
    /// `from` itself must already reflect the change.
    pub(crate) fn propagate(&self, from: &Arc<Inode>, size_delta: i64, ref_deltas: &[(String, i64)]) {
        if size_delta == 0 && ref_deltas.is_empty() {
            return;
        }
        let mut current = Arc::clone(from);
        loop {
            let (name, parent) = current.name_and_parent();
            let Some(parent) = parent else { break };
            let Some(data) = parent.as_directory() else { break };
            {
                let mut state = data.state();
                let Some(entry) = state.children.get_mut(&CiName::from(name.as_str())) else {
                    debug!("{name} left its parent while propagating, stopping");
                    break;
                };
                if let Some(cached) = &entry.cached {
                    if !Arc::ptr_eq(cached, &current) {
                        break;
                    }
                }
                apply_size(&mut entry.size, size_delta);
                apply_refs(&mut entry.ref_counts, ref_deltas);
                state.apply(size_delta, ref_deltas);
            }
            self.commit(&parent);
            current = parent;
        }
    }

    /// Adds `child` to `dir` under `name`. Fails if the name is taken,
    /// ignoring case.
    pub(crate) fn insert_child(&self, dir: &Arc<Inode>, name: &str, child: &Arc<Inode>) -> Result<()> {
        let data = directory_of(dir)?;
        let size = child.size();
        let refs = child.ref_counts();
        let child_last_modified = child.last_modified();
        let dir_path = dir.path();
        {
            let mut state = data.state();
            let key = CiName::from(name);
            if state.children.contains_key(&key) {
                return Err(VfsError::AlreadyExists(path::join(&dir_path, name)));
            }
            child.attach(dir, name);
            state.children.insert(
                key,
                ChildEntry {
                    cached: Some(Arc::clone(child)),
                    size,
                    ref_counts: refs.clone(),
                },
            );
            state.apply(size as i64, &positive(&refs));
        }
        dir.with_attrs(|a| {
            if child_last_modified > a.last_modified {
                a.last_modified = child_last_modified;
            }
        });
        self.commit(dir);
        self.propagate(dir, size as i64, &positive(&refs));
        Ok(())
    }

    /// Removes the child entry `name` from `dir`, subtracting its recorded
    /// summary from every ancestor. When `expected` is given the entry must
    /// hold that exact inode.
    pub(crate) fn detach_child(
        &self,
        dir: &Arc<Inode>,
        name: &str,
        expected: Option<&Arc<Inode>>,
    ) -> Result<ChildEntry> {
        let data = directory_of(dir)?;
        let key = CiName::from(name);
        let entry = {
            let mut state = data.state();
            match (state.children.get(&key), expected) {
                (None, _) => return Err(VfsError::not_found(path::join(&dir.path(), name))),
                (Some(entry), Some(expected)) => {
                    if let Some(cached) = &entry.cached {
                        if !Arc::ptr_eq(cached, expected) {
                            return Err(VfsError::not_found(path::join(&dir.path(), name)));
                        }
                    }
                }
                _ => {}
            }
            let Some(entry) = state.children.remove(&key) else {
                return Err(VfsError::not_found(path::join(&dir.path(), name)));
            };
            let refs = negate(&positive(&entry.ref_counts));
            state.apply(-(entry.size as i64), &refs);
            entry
        };
        self.commit(dir);
        self.propagate(
            dir,
            -(entry.size as i64),
            &negate(&positive(&entry.ref_counts)),
        );
        Ok(entry)
    }

    /// Drops a child whose backing vanished from disk.
    pub(crate) fn remove_missing_child(&self, dir: &Arc<Inode>, name: &str) {
        warn!("removing missing child {} from {}", name, dir.path());
        if self.detach_child(dir, name, None).is_ok() {
            dir.with_attrs(|a| a.last_modified = now_millis());
            self.commit(dir);
        }
    }

    fn new_inode(&self, name: &str, attrs: Attributes, kind: InodeKind) -> Arc<Inode> {
        let inode = Inode::new(name, attrs, kind);
        inode.mark_loaded();
        inode
    }

    fn install(&self, dir: &Arc<Inode>, name: &str, inode: Arc<Inode>) -> Result<Arc<Inode>> {
        validate_name(&dir.path(), name)?;
        self.insert_child(dir, name, &inode)?;
        self.commit(&inode);
        let path = inode.path();
        info!("created {} {path}", inode.type_name());
        self.notify(&inode, VfsEvent::Created { path });
        Ok(inode)
    }

    pub fn create_directory(
        &self,
        dir: &Arc<Inode>,
        name: &str,
        username: &str,
        group: &str,
    ) -> Result<Arc<Inode>> {
        let inode = self.new_inode(
            name,
            Attributes::owned_by(username, group),
            InodeKind::Directory(DirectoryData::new(DirectoryState::default())),
        );
        self.install(dir, name, inode)
    }

    /// Creates a directory whose timestamp is a placeholder until real
    /// content stamps it.
    pub fn create_placeholder_directory(
        &self,
        dir: &Arc<Inode>,
        name: &str,
        username: &str,
        group: &str,
    ) -> Result<Arc<Inode>> {
        let state = DirectoryState {
            placeholder_last_modified: true,
            ..Default::default()
        };
        let mut attrs = Attributes::owned_by(username, group);
        // never newer than real content, so it cannot win a compare-and-max
        attrs.last_modified = 0;
        let inode = self.new_inode(
            name,
            attrs,
            InodeKind::Directory(DirectoryData::new(state)),
        );
        self.install(dir, name, inode)
    }

    pub fn create_file(
        &self,
        dir: &Arc<Inode>,
        name: &str,
        username: &str,
        group: &str,
        initial_slave: Option<&str>,
    ) -> Result<Arc<Inode>> {
        let mut state = FileState::default();
        if let Some(slave) = initial_slave {
            state.slaves.insert(slave.to_string());
        }
        let inode = self.new_inode(
            name,
            Attributes::owned_by(username, group),
            InodeKind::File(FileData::new(state)),
        );
        self.install(dir, name, inode)
    }

    /// Creates a file already known to live on `slave` with `size` bytes,
    /// as discovered by remerge.
    pub(crate) fn create_remerged_file(
        &self,
        dir: &Arc<Inode>,
        name: &str,
        slave: &str,
        size: u64,
        last_modified: i64,
    ) -> Result<Arc<Inode>> {
        let owner = &self.options().system_owner;
        let mut attrs = Attributes::owned_by(owner, owner);
        attrs.last_modified = last_modified;
        let inode = self.new_inode(
            name,
            attrs,
            InodeKind::File(FileData::new(FileState {
                slaves: BTreeSet::from([slave.to_string()]),
                size,
                ..Default::default()
            })),
        );
        self.install(dir, name, inode)
    }

    pub fn create_link(
        &self,
        dir: &Arc<Inode>,
        name: &str,
        target: &str,
        username: &str,
        group: &str,
    ) -> Result<Arc<Inode>> {
        let inode = self.new_inode(
            name,
            Attributes::owned_by(username, group),
            InodeKind::Link(LinkData::new(target)),
        );
        self.install(dir, name, inode)
    }

    /// Removes `inode` and its subtree from the namespace and from disk.
    /// Slave-side content is not touched here.
    pub fn delete_inode(&self, inode: &Arc<Inode>) -> Result<()> {
        let (name, parent) = inode.name_and_parent();
        let Some(parent) = parent else {
            return Err(VfsError::PermissionDenied("the root cannot be deleted".into()));
        };
        let path = inode.path();
        self.detach_child(&parent, &name, Some(inode))?;
        inode.mark_deleted();
        self.forget_commit(inode);
        if let Some(file) = inode.as_file() {
            file.abort_transfers(&format!("{path} is being deleted"));
        }
        if let Err(e) = self.disk().delete(&path) {
            error!("metadata of {path} is gone but its record could not be removed: {e}");
        }
        info!("deleted {} {path}", inode.type_name());
        self.events().publish(VfsEvent::Deleted { path });
        Ok(())
    }

    /// Moves `inode` to the absolute path `destination`.
    ///
    /// Both the inode and the destination directory are flushed to disk
    /// before the physical move.
    pub fn rename_inode(&self, inode: &Arc<Inode>, destination: &str) -> Result<()> {
        let destination = path::fix_path(destination);
        if inode.parent().is_none() {
            return Err(VfsError::PermissionDenied("the root cannot be renamed".into()));
        }
        match self.resolve(&destination) {
            Ok(existing) if !Arc::ptr_eq(&existing, inode) => {
                return Err(VfsError::AlreadyExists(destination));
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        let dest_dir = self.resolve(path::strip_last(&destination))?;
        let dest_dir = self.follow_links(dest_dir)?;
        if !dest_dir.is_directory() {
            return Err(VfsError::not_a_directory(dest_dir.path()));
        }
        let new_name = path::get_last(&destination).to_string();
        validate_name(&dest_dir.path(), &new_name)?;
        let from = inode.path();
        let to = path::join(&dest_dir.path(), &new_name);
        if inode.is_directory() && path::is_within(&to, &from) && !path::eq_ignore_case(&to, &from) {
            return Err(VfsError::PermissionDenied(format!(
                "cannot move {from} inside itself"
            )));
        }

        self.flush_now(&dest_dir)?;
        self.flush_now(inode)?;

        let (old_name, old_parent) = inode.name_and_parent();
        let Some(old_parent) = old_parent else {
            return Err(VfsError::not_found(from));
        };
        self.detach_child(&old_parent, &old_name, Some(inode))?;
        if let Err(e) = self.disk().rename(&from, &to) {
            if let Err(restore) = self.insert_child(&old_parent, &old_name, inode) {
                error!("unable to restore {from} after a failed move: {restore}");
            }
            return Err(e);
        }
        if let Err(e) = self.insert_child(&dest_dir, &new_name, inode) {
            error!("moved {from} to {to} on disk but could not link it in: {e}");
            return Err(e);
        }
        self.commit(inode);
        info!("renamed {from} to {to}");
        self.notify(inode, VfsEvent::Renamed { from, to });
        Ok(())
    }

    pub fn set_owner(&self, inode: &Arc<Inode>, username: &str, group: &str) {
        inode.with_attrs(|a| {
            a.username = username.to_string();
            a.group = group.to_string();
        });
        self.commit(inode);
        self.notify(
            inode,
            VfsEvent::OwnerChanged {
                path: inode.path(),
                username: username.to_string(),
                group: group.to_string(),
            },
        );
    }

    /// Unconditionally sets the timestamp. For directories this also ends
    /// any placeholder state.
    pub fn set_last_modified(&self, inode: &Arc<Inode>, last_modified: i64) {
        inode.with_attrs(|a| a.last_modified = last_modified);
        if let Some(dir) = inode.as_directory() {
            dir.state().placeholder_last_modified = false;
        }
        self.commit(inode);
        self.notify(
            inode,
            VfsEvent::LastModifiedChanged {
                path: inode.path(),
                last_modified,
            },
        );
    }

    /// Remerge timestamp rule: a placeholder is always replaced, a real
    /// timestamp only moves forward. Returns `true` if anything changed.
    pub fn stamp_last_modified(&self, dir: &Arc<Inode>, last_modified: i64) -> Result<bool> {
        let data = directory_of(dir)?;
        let placeholder = {
            let mut state = data.state();
            std::mem::replace(&mut state.placeholder_last_modified, false)
        };
        let changed = dir.with_attrs(|a| {
            if placeholder || last_modified > a.last_modified {
                let changed = a.last_modified != last_modified;
                a.last_modified = last_modified;
                changed
            } else {
                false
            }
        });
        if changed || placeholder {
            self.commit(dir);
        }
        if changed {
            self.notify(
                dir,
                VfsEvent::LastModifiedChanged {
                    path: dir.path(),
                    last_modified,
                },
            );
        }
        Ok(changed)
    }

    pub fn set_extension<T: serde::Serialize>(
        &self,
        inode: &Arc<Inode>,
        key: &Key<T>,
        value: T,
    ) -> Result<()> {
        inode.with_attrs(|a| a.extensions.set(key, value))?;
        self.commit(inode);
        self.notify(
            inode,
            VfsEvent::Refresh {
                path: inode.path(),
                sync: false,
            },
        );
        Ok(())
    }

    pub fn remove_extension<T: serde::de::DeserializeOwned>(
        &self,
        inode: &Arc<Inode>,
        key: &Key<T>,
    ) -> Option<T> {
        let removed = inode.with_attrs(|a| a.extensions.remove(key));
        if removed.is_some() {
            self.commit(inode);
        }
        removed
    }

    pub fn set_link_target(&self, inode: &Arc<Inode>, target: &str) -> Result<()> {
        let link = inode
            .as_link()
            .ok_or_else(|| VfsError::not_a_link(inode.path()))?;
        link.set_target(target);
        self.commit(inode);
        self.notify(
            inode,
            VfsEvent::Refresh {
                path: inode.path(),
                sync: false,
            },
        );
        Ok(())
    }

    /// Records `slave` as holding a copy of `file`. Returns `false` if it
    /// already did.
    pub fn add_slave(&self, file: &Arc<Inode>, slave: &str) -> Result<bool> {
        let data = file_of(file)?;
        let (added, slaves) = {
            let mut state = data.state();
            let added = state.slaves.insert(slave.to_string());
            (added, state.slaves.clone())
        };
        if added {
            self.propagate(file, 0, &[(slave.to_string(), 1)]);
            self.commit(file);
            self.notify(
                file,
                VfsEvent::SlavesChanged {
                    path: file.path(),
                    slaves,
                },
            );
        }
        Ok(added)
    }

    /// Forgets `slave` as a holder of `file`. A file left without slaves is
    /// deleted. Returns `false` if the slave was not a holder.
    pub fn remove_slave(&self, file: &Arc<Inode>, slave: &str) -> Result<bool> {
        let data = file_of(file)?;
        let (removed, slaves) = {
            let mut state = data.state();
            let removed = state.slaves.remove(slave);
            (removed, state.slaves.clone())
        };
        if !removed {
            return Ok(false);
        }
        if slaves.is_empty() {
            debug!("{} lost its last slave {slave}", file.path());
            // the parent's summary still counts this slave, detaching
            // subtracts it along with the size
            self.delete_inode(file)?;
            return Ok(true);
        }
        self.propagate(file, 0, &[(slave.to_string(), -1)]);
        self.commit(file);
        self.notify(
            file,
            VfsEvent::SlavesChanged {
                path: file.path(),
                slaves,
            },
        );
        Ok(true)
    }

    pub fn set_file_size(&self, file: &Arc<Inode>, size: u64) -> Result<()> {
        let data = file_of(file)?;
        let old = std::mem::replace(&mut data.state().size, size);
        if old == size {
            return Ok(());
        }
        self.propagate(file, size as i64 - old as i64, &[]);
        self.commit(file);
        self.notify(
            file,
            VfsEvent::SizeChanged {
                path: file.path(),
                size,
            },
        );
        Ok(())
    }

    pub fn set_checksum(&self, file: &Arc<Inode>, checksum: u64) -> Result<()> {
        file_of(file)?.state().checksum = checksum;
        self.commit(file);
        Ok(())
    }

    pub fn set_xfertime(&self, file: &Arc<Inode>, xfertime: u64) -> Result<()> {
        file_of(file)?.state().xfertime = xfertime;
        self.commit(file);
        Ok(())
    }

    /// Removes `slave` from every file beneath `inode`, visiting only
    /// subtrees that still count it. Directories emptied by this are
    /// pruned. Returns the number of files touched.
    pub fn remove_slave_recursive(&self, inode: &Arc<Inode>, slave: &str) -> Result<usize> {
        match inode.kind() {
            InodeKind::File(_) => Ok(usize::from(self.remove_slave(inode, slave)?)),
            InodeKind::Link(_) => Ok(0),
            InodeKind::Directory(data) => {
                if data.ref_count(slave) == 0 {
                    return Ok(0);
                }
                let was_empty = data.is_empty();
                let mut touched = 0;
                for name in data.child_names() {
                    let uses_slave = data
                        .child_summary(&name)
                        .map(|(_, refs)| refs.get(slave).copied().unwrap_or(0) > 0)
                        .unwrap_or(false);
                    if !uses_slave {
                        continue;
                    }
                    let child = match self.child_of(inode, &name) {
                        Ok(c) => c,
                        Err(e) if e.is_not_found() => continue,
                        Err(e) => return Err(e),
                    };
                    touched += self.remove_slave_recursive(&child, slave)?;
                }
                if !was_empty && data.is_empty() && inode.parent().is_some() {
                    debug!("pruning {} after losing {slave}", inode.path());
                    self.delete_inode(inode)?;
                }
                Ok(touched)
            }
        }
    }

    /// Recomputes sizes and slave counts of `dir` and everything beneath it
    /// from the children themselves, correcting any drift.
    pub fn validate_size_recursive(&self, dir: &Arc<Inode>) -> Result<SizeValidation> {
        let data = directory_of(dir)?;
        let old_size = data.size();
        let old_refs = data.ref_counts();
        let mut corrected = 0;
        for name in data.child_names() {
            let child = match self.child_of(dir, &name) {
                Ok(c) => c,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            if child.is_directory() {
                corrected += self.validate_size_recursive(&child)?.corrected;
            }
        }
        {
            let mut state = data.state();
            for entry in state.children.values_mut() {
                if let Some(child) = &entry.cached {
                    entry.size = child.size();
                    entry.ref_counts = child.ref_counts();
                }
            }
            state.recompute();
        }
        let new_size = data.size();
        let new_refs = data.ref_counts();
        if new_size != old_size || new_refs != old_refs {
            corrected += 1;
            warn!(
                "corrected aggregates of {}: size {old_size} -> {new_size}",
                dir.path()
            );
            self.commit(dir);
            self.propagate(
                dir,
                new_size as i64 - old_size as i64,
                &ref_diff(&old_refs, &new_refs),
            );
        }
        Ok(SizeValidation {
            old_size,
            new_size,
            corrected,
        })
    }
}
