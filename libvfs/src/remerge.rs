//! Reconciles a slave's physical listing of one directory with the
//! namespace.
//!
//! Both sides are walked as case-insensitively sorted sequences. Entries
//! only the slave has become files owned by it, entries only the namespace
//! has lose the slave, and entries present on both sides are compared. The
//! pass converges: replaying the same listing changes nothing.

use std::cmp::Ordering;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{RemergeError, VfsError};
use crate::handle::{DirectoryHandle, FileHandle, Handle};
use crate::path;
use crate::slave::RemergeSlave;

/// One entry of a slave's physical listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightRemoteInode {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub last_modified: i64,
}

impl LightRemoteInode {
    pub fn file(name: &str, size: u64, last_modified: i64) -> Self {
        LightRemoteInode {
            name: name.to_string(),
            is_dir: false,
            size,
            last_modified,
        }
    }

    pub fn directory(name: &str, last_modified: i64) -> Self {
        LightRemoteInode {
            name: name.to_string(),
            is_dir: true,
            size: 0,
            last_modified,
        }
    }
}

/// What happens to a slave's copy that clashes with the namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    /// Keep both: the slave renames its copy to `<name>.collision.<slave>`
    /// and a record is created under that name.
    #[default]
    Rename,
    /// Discard the incoming copy: the slave deletes it.
    #[serde(rename = "delete")]
    DeleteIncoming,
}

/// Counters describing one remerge pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemergeReport {
    pub created: usize,
    pub slaves_added: usize,
    pub slaves_removed: usize,
    pub sizes_corrected: usize,
    pub collisions: usize,
    pub checksums_queued: usize,
}

pub fn collision_name(name: &str, slave: &str) -> String {
    format!("{name}.collision.{slave}")
}

struct Pass<'a> {
    dir: &'a DirectoryHandle,
    slave: &'a dyn RemergeSlave,
    policy: CollisionPolicy,
    report: RemergeReport,
}

impl DirectoryHandle {
    /// Merges `files`, the physical content `slave` holds directly inside
    /// this directory, into the namespace. `last_modified` is the slave's
    /// timestamp for the directory itself.
    ///
    /// The directory is created (with a placeholder timestamp) when it does
    /// not exist yet. A physical directory the namespace has never heard of
    /// aborts the pass with [`RemergeError::UnexpectedDirectory`].
    pub fn remerge(
        &self,
        files: &[LightRemoteInode],
        slave: &dyn RemergeSlave,
        last_modified: i64,
        policy: CollisionPolicy,
    ) -> Result<RemergeReport, RemergeError> {
        let destinations = match self.sorted_inode_handles_unchecked() {
            Ok(list) => list,
            Err(e) if e.is_not_found() => {
                debug!("{} does not exist yet, creating it for {}", self.path(), slave.name());
                if !self.is_root() {
                    self.parent().create_directory_recursive(self.name())?;
                }
                self.sorted_inode_handles_unchecked()?
            }
            Err(e) => return Err(e.into()),
        };
        let dir = self.inode()?;
        self.vfs().stamp_last_modified(&dir, last_modified)?;

        let mut sources = files.to_vec();
        sources.sort_by(|a, b| path::cmp_ignore_case(&a.name, &b.name));

        let mut pass = Pass {
            dir: self,
            slave,
            policy,
            report: RemergeReport::default(),
        };
        let mut src = sources.iter().peekable();
        let mut dst = destinations.iter().peekable();
        loop {
            match (src.peek(), dst.peek()) {
                (None, None) => break,
                (None, Some(d)) => {
                    pass.lose_slave(d)?;
                    dst.next();
                }
                (Some(s), None) => {
                    pass.add_new(s)?;
                    src.next();
                }
                (Some(s), Some(d)) => match path::cmp_ignore_case(&s.name, d.name()) {
                    Ordering::Less => {
                        pass.add_new(s)?;
                        src.next();
                    }
                    Ordering::Greater => {
                        pass.lose_slave(d)?;
                        dst.next();
                    }
                    Ordering::Equal => {
                        pass.same_name(s, d)?;
                        src.next();
                        dst.next();
                    }
                },
            }
        }
        let report = pass.report;
        if report != RemergeReport::default() {
            info!("remerge of {} from {}: {report:?}", self.path(), slave.name());
        }
        Ok(report)
    }
}

impl Pass<'_> {
    fn entry_path(&self, name: &str) -> String {
        path::join(self.dir.path(), name)
    }

    fn lose_slave(&mut self, destination: &Handle) -> Result<(), RemergeError> {
        match destination.remove_slave(self.slave.name()) {
            Ok(n) => self.report.slaves_removed += n,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn add_new(&mut self, source: &LightRemoteInode) -> Result<(), RemergeError> {
        if source.is_dir {
            let path = self.entry_path(&source.name);
            error!(
                "slave {} reported directory {path} which has no record, \
                 deeper directories must be remerged first",
                self.slave.name()
            );
            return Err(RemergeError::UnexpectedDirectory {
                slave: self.slave.name().to_string(),
                path,
            });
        }
        match self.create_file(&source.name, source) {
            Ok(()) => Ok(()),
            Err(VfsError::AlreadyExists(_)) => {
                // another pass created it since the listing was taken
                debug!("{} appeared during remerge", self.entry_path(&source.name));
                let existing = self.dir.inode_handle_unchecked(&source.name)?;
                self.same_name(source, &existing)
            }
            Err(e @ VfsError::NotValidType { .. }) => {
                warn!("{} sent an unusable name: {e}", self.slave.name());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn create_file(&mut self, name: &str, source: &LightRemoteInode) -> Result<(), VfsError> {
        let dir = self.dir.inode()?;
        let vfs = self.dir.vfs();
        let file = vfs.create_remerged_file(
            &dir,
            name,
            self.slave.name(),
            source.size,
            source.last_modified,
        )?;
        self.report.created += 1;
        if self.slave.checksums_on_remerge() {
            self.slave.queue_checksum(&file.path());
            self.report.checksums_queued += 1;
        }
        Ok(())
    }

    fn same_name(&mut self, source: &LightRemoteInode, destination: &Handle) -> Result<(), RemergeError> {
        let remote = self.slave;
        let slave = remote.name();
        let path = self.entry_path(&source.name);
        match destination {
            Handle::Link(_) if source.is_dir => {
                warn!("in remerging {slave}, a directory on the slave ({path}) collided with a link");
            }
            Handle::Link(_) => {
                warn!("in remerging {slave}, a file on the slave ({path}) collided with a link");
                self.collide(source)?;
            }
            Handle::File(file) if !source.is_dir => self.merge_file(source, file)?,
            Handle::Directory(_) if source.is_dir => {}
            Handle::File(_) => {
                warn!("in remerging {slave}, a directory on the slave ({path}) collided with a file");
            }
            Handle::Directory(_) => {
                warn!("in remerging {slave}, a file on the slave ({path}) collided with a directory");
                self.collide(source)?;
            }
        }
        Ok(())
    }

    fn merge_file(&mut self, source: &LightRemoteInode, file: &FileHandle) -> Result<(), RemergeError> {
        let remote = self.slave;
        let slave = remote.name();
        let inode = match file.inode() {
            Ok(inode) => inode,
            Err(e) if e.is_not_found() => return self.add_new(source),
            Err(e) => return Err(e.into()),
        };
        let dir = self.dir;
        let vfs = dir.vfs();
        let Some(data) = inode.as_file() else {
            return Ok(());
        };
        let slaves = data.slaves();
        if source.size == data.size() {
            if vfs.add_slave(&inode, slave)? {
                self.report.slaves_added += 1;
            }
            if data.checksum() == 0 && remote.checksums_on_remerge() {
                remote.queue_checksum(file.path());
                self.report.checksums_queued += 1;
            }
            return Ok(());
        }
        if slaves.iter().all(|s| s == slave) {
            info!(
                "{slave} is the only source of {}, taking its size {} over {}",
                file.path(),
                source.size,
                data.size()
            );
            vfs.set_file_size(&inode, source.size)?;
            vfs.set_checksum(&inode, 0)?;
            if vfs.add_slave(&inode, slave)? {
                self.report.slaves_added += 1;
            }
            self.report.sizes_corrected += 1;
            return Ok(());
        }
        warn!(
            "in remerging {slave}, a file on the slave ({}) differs in size from the namespace ({} vs {})",
            file.path(),
            source.size,
            data.size()
        );
        if vfs.remove_slave(&inode, slave)? {
            self.report.slaves_removed += 1;
        }
        self.collide(source)
    }

    /// Applies the collision policy to the slave's copy of `source`.
    fn collide(&mut self, source: &LightRemoteInode) -> Result<(), RemergeError> {
        self.report.collisions += 1;
        let from = self.entry_path(&source.name);
        match self.policy {
            CollisionPolicy::DeleteIncoming => {
                info!("asking {} to delete its copy of {from}", self.slave.name());
                self.slave.simple_delete(&from);
                Ok(())
            }
            CollisionPolicy::Rename => {
                let name = collision_name(&source.name, self.slave.name());
                self.slave.simple_rename(&from, self.dir.path(), &name);
                match self.create_file(&name, source) {
                    Ok(()) => Ok(()),
                    Err(VfsError::AlreadyExists(_)) => {
                        // left over from an earlier pass
                        let existing = self.dir.inode_handle_unchecked(&name)?;
                        if let Handle::File(file) = existing {
                            let inode = file.inode()?;
                            if inode.size() == source.size
                                && self.dir.vfs().add_slave(&inode, self.slave.name())?
                            {
                                self.report.slaves_added += 1;
                            }
                        } else {
                            warn!("collision target {} is not a file", self.entry_path(&name));
                        }
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }
}
