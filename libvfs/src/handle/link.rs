use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use log::info;

use super::{DirectoryHandle, FileHandle, InodeHandle};
use crate::error::{Result, VfsError};
use crate::inode::Inode;
use crate::permissions::User;
use crate::store::{Vfs, link_target};

#[derive(Clone, PartialEq, Eq)]
pub struct LinkHandle {
    pub(crate) base: InodeHandle,
}

impl Deref for LinkHandle {
    type Target = InodeHandle;

    fn deref(&self) -> &InodeHandle {
        &self.base
    }
}

impl fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LinkHandle").field(&self.path()).finish()
    }
}

impl LinkHandle {
    pub(crate) fn new(vfs: Arc<Vfs>, path: &str) -> Self {
        LinkHandle {
            base: InodeHandle::new(vfs, path),
        }
    }

    pub fn inode(&self) -> Result<Arc<Inode>> {
        let inode = self.base.inode()?;
        if !inode.is_link() {
            return Err(VfsError::not_a_link(self.path()));
        }
        Ok(inode)
    }

    /// The target as stored, possibly relative to the link's directory.
    pub fn target(&self) -> Result<String> {
        let inode = self.inode()?;
        Ok(inode.as_link().map(|l| l.target()).unwrap_or_default())
    }

    /// The target as an absolute path.
    pub fn absolute_target(&self) -> Result<String> {
        let inode = self.inode()?;
        let target = inode.as_link().map(|l| l.target()).unwrap_or_default();
        Ok(link_target(&inode, &target))
    }

    pub fn set_target(&self, target: &str) -> Result<()> {
        let inode = self.inode()?;
        self.vfs().set_link_target(&inode, target)
    }

    /// Whatever the link ends up at after following every hop.
    pub fn target_inode(&self) -> Result<Arc<Inode>> {
        let inode = self.inode()?;
        self.vfs().follow_links(inode)
    }

    pub fn target_directory(&self) -> Result<DirectoryHandle> {
        let target = self.target_inode()?;
        if !target.is_directory() {
            return Err(VfsError::not_a_directory(target.path()));
        }
        Ok(DirectoryHandle::new(Arc::clone(self.vfs()), &target.path()))
    }

    pub fn target_file(&self) -> Result<FileHandle> {
        let target = self.target_inode()?;
        if !target.is_file() {
            return Err(VfsError::not_a_file(target.path()));
        }
        Ok(FileHandle::new(Arc::clone(self.vfs()), &target.path()))
    }

    /// Links exist only in the namespace, no slave is involved.
    pub fn delete_unchecked(&self) -> Result<()> {
        let inode = self.inode()?;
        self.vfs().delete_inode(&inode)?;
        info!("link {} deleted", self.path());
        Ok(())
    }

    pub fn delete(&self, user: &User) -> Result<()> {
        self.check_delete(user)?;
        self.delete_unchecked()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::VfsOptions;
    use tempfile::tempdir;

    #[test]
    fn test_relative_target() {
        let tmp = tempdir().unwrap();
        let vfs = Vfs::open(tmp.path(), VfsOptions::default()).unwrap();
        let root = vfs.root_handle();
        let a = root.create_directory_unchecked("a", "u", "g").unwrap();
        a.create_directory_unchecked("target", "u", "g").unwrap();
        let link = a.create_link_unchecked("ln", "target", "u", "g").unwrap();

        assert_eq!(link.target().unwrap(), "target");
        assert_eq!(link.absolute_target().unwrap(), "/a/target");
        assert_eq!(link.target_directory().unwrap().path(), "/a/target");
        assert!(link.target_file().is_err());

        link.set_target("/a").unwrap();
        assert_eq!(link.target_directory().unwrap().path(), "/a");
        link.delete_unchecked().unwrap();
        assert!(!link.exists());
    }

    #[test]
    fn test_dangling_link() {
        let tmp = tempdir().unwrap();
        let vfs = Vfs::open(tmp.path(), VfsOptions::default()).unwrap();
        let link = vfs
            .root_handle()
            .create_link_unchecked("ln", "/nowhere", "u", "g")
            .unwrap();
        assert!(link.exists());
        assert!(link.target_inode().unwrap_err().is_not_found());
    }
}
