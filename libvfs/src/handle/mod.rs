//! Path-addressed handles over the namespace.
//!
//! A handle is only a path plus the store. Every call resolves the path
//! again, so a handle whose target was deleted or moved by someone else
//! fails with `NotFound` instead of acting on stale state.
//!
//! Checked operations take the acting [`User`] and consult the installed
//! [`crate::permissions::VfsPermissions`]. A hidden path fails with exactly
//! the same `NotFound` a missing one would.

mod directory;
mod file;
mod link;

use std::fmt;
use std::sync::Arc;

pub use directory::DirectoryHandle;
pub use file::FileHandle;
pub use link::LinkHandle;

use crate::error::{Result, VfsError};
use crate::extension::Key;
use crate::inode::{Attributes, Inode};
use crate::path;
use crate::permissions::{PermAction, User};
use crate::store::Vfs;

impl Vfs {
    pub fn directory(self: &Arc<Self>, path: &str) -> DirectoryHandle {
        DirectoryHandle::new(Arc::clone(self), path)
    }

    pub fn file(self: &Arc<Self>, path: &str) -> FileHandle {
        FileHandle::new(Arc::clone(self), path)
    }

    pub fn link(self: &Arc<Self>, path: &str) -> LinkHandle {
        LinkHandle::new(Arc::clone(self), path)
    }

    pub fn root_handle(self: &Arc<Self>) -> DirectoryHandle {
        self.directory("/")
    }

    /// Handle of whatever currently lives at `path`.
    pub fn handle(self: &Arc<Self>, path: &str) -> Result<Handle> {
        let inode = self.resolve(path)?;
        Ok(Handle::for_inode(self, &inode))
    }
}

/// Part shared by every handle kind.
#[derive(Clone)]
pub struct InodeHandle {
    vfs: Arc<Vfs>,
    path: String,
}

impl InodeHandle {
    pub(crate) fn new(vfs: Arc<Vfs>, path: &str) -> Self {
        InodeHandle {
            vfs,
            path: path::fix_path(path),
        }
    }

    pub fn vfs(&self) -> &Arc<Vfs> {
        &self.vfs
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn name(&self) -> &str {
        path::get_last(&self.path)
    }

    pub fn is_root(&self) -> bool {
        self.path == "/"
    }

    /// The directory this path lives in. The root is its own parent.
    pub fn parent(&self) -> DirectoryHandle {
        DirectoryHandle::new(Arc::clone(&self.vfs), path::strip_last(&self.path))
    }

    /// Resolves the path without any type check.
    pub fn inode(&self) -> Result<Arc<Inode>> {
        self.vfs.resolve(&self.path)
    }

    pub fn exists(&self) -> bool {
        self.inode().is_ok()
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.inode()?.size())
    }

    pub fn attributes(&self) -> Result<Attributes> {
        Ok(self.inode()?.attributes())
    }

    pub fn username(&self) -> Result<String> {
        Ok(self.inode()?.username())
    }

    pub fn group(&self) -> Result<String> {
        Ok(self.inode()?.group())
    }

    pub fn last_modified(&self) -> Result<i64> {
        Ok(self.inode()?.last_modified())
    }

    pub fn creation_time(&self) -> Result<i64> {
        Ok(self.inode()?.creation_time())
    }

    pub fn set_owner(&self, username: &str, group: &str) -> Result<()> {
        let inode = self.inode()?;
        self.vfs.set_owner(&inode, username, group);
        Ok(())
    }

    pub fn set_last_modified(&self, last_modified: i64) -> Result<()> {
        let inode = self.inode()?;
        self.vfs.set_last_modified(&inode, last_modified);
        Ok(())
    }

    pub fn extension<T: serde::de::DeserializeOwned>(&self, key: &Key<T>) -> Result<Option<T>> {
        Ok(self.inode()?.extension(key))
    }

    pub fn set_extension<T: serde::Serialize>(&self, key: &Key<T>, value: T) -> Result<()> {
        let inode = self.inode()?;
        self.vfs.set_extension(&inode, key, value)
    }

    pub fn remove_extension<T: serde::de::DeserializeOwned>(
        &self,
        key: &Key<T>,
    ) -> Result<Option<T>> {
        let inode = self.inode()?;
        Ok(self.vfs.remove_extension(&inode, key))
    }

    /// Directory whose rules govern this path: itself for directories, the
    /// parent otherwise.
    fn governing_dir(&self, inode: &Inode) -> String {
        if inode.is_directory() {
            self.path.clone()
        } else {
            path::strip_last(&self.path).to_string()
        }
    }

    /// Fails with the ordinary `NotFound` when `user` may not see this path.
    pub fn check_hidden(&self, user: &User) -> Result<()> {
        let inode = self.inode()?;
        let dir = self.governing_dir(&inode);
        if self.vfs.permissions().is_hidden(user, &dir) {
            return Err(VfsError::not_found(self.path.as_str()));
        }
        Ok(())
    }

    /// Same check for a path that may not exist yet: only its parent is
    /// consulted.
    pub(crate) fn check_hidden_new(&self, user: &User) -> Result<()> {
        if self
            .vfs
            .permissions()
            .is_hidden(user, path::strip_last(&self.path))
        {
            return Err(VfsError::not_found(self.path.as_str()));
        }
        Ok(())
    }

    pub fn is_hidden(&self, user: &User) -> Result<bool> {
        match self.check_hidden(user) {
            Ok(()) => Ok(false),
            Err(VfsError::NotFound(_)) => {
                // the inode itself resolved, so this is the hidden case
                self.inode()?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Owner-specific permission wins over the generic one.
    fn check_owner_permission(
        &self,
        user: &User,
        own: PermAction,
        generic: PermAction,
        verb: &str,
    ) -> Result<()> {
        let inode = self.inode()?;
        let dir = self.governing_dir(&inode);
        let perms = self.vfs.permissions();
        if user.name == inode.username() {
            if perms.check_path_permission(own, user, &dir) {
                return Ok(());
            }
            return Err(VfsError::PermissionDenied(format!(
                "you are not allowed to {verb} {}",
                self.path
            )));
        }
        if !perms.check_path_permission(generic, user, &dir) {
            return Err(VfsError::PermissionDenied(format!(
                "you are not allowed to {verb} {}",
                self.path
            )));
        }
        Ok(())
    }

    pub(crate) fn check_delete(&self, user: &User) -> Result<()> {
        self.check_hidden(user)?;
        self.check_owner_permission(user, PermAction::DeleteOwn, PermAction::Delete, "delete")
    }

    pub(crate) fn check_rename(&self, user: &User, destination: &InodeHandle) -> Result<()> {
        self.check_hidden(user)?;
        destination.check_hidden_new(user)?;
        self.check_owner_permission(user, PermAction::RenameOwn, PermAction::Rename, "rename")
    }

    /// Moves this inode to `destination`, telling the slaves holding its
    /// content to do the same.
    pub fn rename_to_unchecked(&self, destination: &str) -> Result<()> {
        let inode = self.inode()?;
        self.vfs.rename_inode(&inode, destination)?;
        let moved_to = inode.path();
        let to_dir = path::strip_last(&moved_to);
        let to_name = path::get_last(&moved_to);
        if let Some(ops) = self.vfs.slave_ops() {
            if let Some(file) = inode.as_file() {
                for slave in file.slaves() {
                    if ops.is_known(&slave) {
                        ops.simple_rename(&slave, &self.path, to_dir, to_name);
                    }
                }
            } else if inode.is_directory() {
                ops.rename_on_all_slaves(&self.path, to_dir, to_name);
            }
        }
        Ok(())
    }

    pub fn rename_to(&self, user: &User, destination: &str) -> Result<()> {
        let dest = InodeHandle::new(Arc::clone(&self.vfs), destination);
        self.check_rename(user, &dest)?;
        self.rename_to_unchecked(&dest.path)
    }
}

impl PartialEq for InodeHandle {
    fn eq(&self, other: &Self) -> bool {
        path::eq_ignore_case(&self.path, &other.path)
    }
}

impl Eq for InodeHandle {}

impl fmt::Debug for InodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InodeHandle").field(&self.path).finish()
    }
}

/// Any handle, as produced by listings and lookups.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Handle {
    Directory(DirectoryHandle),
    File(FileHandle),
    Link(LinkHandle),
}

impl Handle {
    pub(crate) fn for_inode(vfs: &Arc<Vfs>, inode: &Inode) -> Handle {
        Self::for_path(vfs, &inode.path(), inode)
    }

    pub(crate) fn for_path(vfs: &Arc<Vfs>, path: &str, inode: &Inode) -> Handle {
        let vfs = Arc::clone(vfs);
        if inode.is_directory() {
            Handle::Directory(DirectoryHandle::new(vfs, path))
        } else if inode.is_file() {
            Handle::File(FileHandle::new(vfs, path))
        } else {
            Handle::Link(LinkHandle::new(vfs, path))
        }
    }

    pub fn base(&self) -> &InodeHandle {
        match self {
            Handle::Directory(d) => &d.base,
            Handle::File(f) => &f.base,
            Handle::Link(l) => &l.base,
        }
    }

    pub fn path(&self) -> &str {
        self.base().path()
    }

    pub fn name(&self) -> &str {
        self.base().name()
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, Handle::Directory(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Handle::File(_))
    }

    pub fn is_link(&self) -> bool {
        matches!(self, Handle::Link(_))
    }

    pub fn as_directory(&self) -> Option<&DirectoryHandle> {
        match self {
            Handle::Directory(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileHandle> {
        match self {
            Handle::File(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_link(&self) -> Option<&LinkHandle> {
        match self {
            Handle::Link(l) => Some(l),
            _ => None,
        }
    }

    /// Removes this inode from the namespace and from every slave.
    pub async fn delete_unchecked(&self) -> Result<()> {
        match self {
            Handle::Directory(d) => d.delete_unchecked().await,
            Handle::File(f) => f.delete_unchecked().await,
            Handle::Link(l) => l.delete_unchecked(),
        }
    }

    pub async fn delete(&self, user: &User) -> Result<()> {
        self.base().check_delete(user)?;
        self.delete_unchecked().await
    }

    /// Forgets `slave` everywhere beneath this handle.
    pub fn remove_slave(&self, slave: &str) -> Result<usize> {
        let inode = self.base().inode()?;
        self.base().vfs().remove_slave_recursive(&inode, slave)
    }
}
