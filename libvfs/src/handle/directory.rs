use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use log::{debug, info};

use super::{FileHandle, Handle, InodeHandle, LinkHandle};
use crate::error::{Result, VfsError};
use crate::inode::Inode;
use crate::path;
use crate::permissions::{PermAction, User};
use crate::store::Vfs;
use crate::tree::SizeValidation;

#[derive(Clone, PartialEq, Eq)]
pub struct DirectoryHandle {
    pub(crate) base: InodeHandle,
}

impl Deref for DirectoryHandle {
    type Target = InodeHandle;

    fn deref(&self) -> &InodeHandle {
        &self.base
    }
}

impl fmt::Debug for DirectoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DirectoryHandle").field(&self.path()).finish()
    }
}

impl DirectoryHandle {
    pub(crate) fn new(vfs: Arc<Vfs>, path: &str) -> Self {
        DirectoryHandle {
            base: InodeHandle::new(vfs, path),
        }
    }

    /// Resolves to the directory inode, following a link at the end of the
    /// path.
    pub fn inode(&self) -> Result<Arc<Inode>> {
        let inode = self.vfs().follow_links(self.base.inode()?)?;
        if !inode.is_directory() {
            return Err(VfsError::not_a_directory(self.path()));
        }
        Ok(inode)
    }

    fn child_path(&self, name: &str) -> String {
        path::join(self.path(), name)
    }

    /// Handle for `name` in this directory, whether it exists or not.
    pub fn non_existent_file(&self, name: &str) -> FileHandle {
        FileHandle::new(Arc::clone(self.vfs()), &self.child_path(name))
    }

    pub fn non_existent_directory(&self, name: &str) -> DirectoryHandle {
        DirectoryHandle::new(Arc::clone(self.vfs()), &self.child_path(name))
    }

    pub fn non_existent_link(&self, name: &str) -> LinkHandle {
        LinkHandle::new(Arc::clone(self.vfs()), &self.child_path(name))
    }

    fn collect_children(&self) -> Result<Vec<Handle>> {
        let inode = self.inode()?;
        let vfs = self.vfs();
        let mut out = Vec::new();
        for name in inode.as_directory().map(|d| d.child_names()).unwrap_or_default() {
            match vfs.child_of(&inode, &name) {
                Ok(child) => out.push(Handle::for_path(vfs, &self.child_path(&name), &child)),
                Err(e) if e.is_not_found() => debug!("{name} vanished while listing {}", self.path()),
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    fn filter_visible(&self, user: &User, handles: Vec<Handle>) -> Vec<Handle> {
        handles
            .into_iter()
            .filter(|h| matches!(h.base().is_hidden(user), Ok(false)))
            .collect()
    }

    /// Every child, in no particular order.
    pub fn inode_handles_unchecked(&self) -> Result<Vec<Handle>> {
        self.collect_children()
    }

    /// Every child, ordered by name without regard to case.
    pub fn sorted_inode_handles_unchecked(&self) -> Result<Vec<Handle>> {
        let mut handles = self.collect_children()?;
        handles.sort_by(|a, b| path::cmp_ignore_case(a.name(), b.name()));
        Ok(handles)
    }

    /// Children visible to `user`, in no particular order.
    pub fn inode_handles(&self, user: &User) -> Result<Vec<Handle>> {
        self.check_hidden(user)?;
        Ok(self.filter_visible(user, self.collect_children()?))
    }

    /// Children visible to `user`, ordered by name without regard to case.
    pub fn sorted_inode_handles(&self, user: &User) -> Result<Vec<Handle>> {
        self.check_hidden(user)?;
        Ok(self.filter_visible(user, self.sorted_inode_handles_unchecked()?))
    }

    pub fn files_unchecked(&self) -> Result<Vec<FileHandle>> {
        Ok(self
            .sorted_inode_handles_unchecked()?
            .into_iter()
            .filter_map(|h| match h {
                Handle::File(f) => Some(f),
                _ => None,
            })
            .collect())
    }

    pub fn files(&self, user: &User) -> Result<Vec<FileHandle>> {
        Ok(self
            .sorted_inode_handles(user)?
            .into_iter()
            .filter_map(|h| match h {
                Handle::File(f) => Some(f),
                _ => None,
            })
            .collect())
    }

    pub fn directories_unchecked(&self) -> Result<Vec<DirectoryHandle>> {
        Ok(self
            .sorted_inode_handles_unchecked()?
            .into_iter()
            .filter_map(|h| match h {
                Handle::Directory(d) => Some(d),
                _ => None,
            })
            .collect())
    }

    pub fn directories(&self, user: &User) -> Result<Vec<DirectoryHandle>> {
        Ok(self
            .sorted_inode_handles(user)?
            .into_iter()
            .filter_map(|h| match h {
                Handle::Directory(d) => Some(d),
                _ => None,
            })
            .collect())
    }

    pub fn links_unchecked(&self) -> Result<Vec<LinkHandle>> {
        Ok(self
            .sorted_inode_handles_unchecked()?
            .into_iter()
            .filter_map(|h| match h {
                Handle::Link(l) => Some(l),
                _ => None,
            })
            .collect())
    }

    pub fn is_empty_unchecked(&self) -> Result<bool> {
        Ok(self
            .inode()?
            .as_directory()
            .map(|d| d.is_empty())
            .unwrap_or(true))
    }

    pub fn is_empty(&self, user: &User) -> Result<bool> {
        self.inode()?;
        self.check_hidden(user).map_err(|_| {
            VfsError::PermissionDenied(format!("unable to check if {} is empty", self.path()))
        })?;
        self.is_empty_unchecked()
    }

    /// Looks up one child by name.
    pub fn inode_handle_unchecked(&self, name: &str) -> Result<Handle> {
        let inode = self.inode()?;
        let child = self.vfs().child_of(&inode, name)?;
        Ok(Handle::for_inode(self.vfs(), &child))
    }

    pub fn inode_handle(&self, name: &str, user: &User) -> Result<Handle> {
        let handle = self.inode_handle_unchecked(name)?;
        handle.base().check_hidden(user)?;
        Ok(handle)
    }

    /// Relative navigation: accepts `.`, `..`, `./x`, `../x`, absolute
    /// paths and names. Links are followed to their target directory.
    pub fn directory_unchecked(&self, name: &str) -> Result<DirectoryHandle> {
        if name == "/" {
            return Ok(DirectoryHandle::new(Arc::clone(self.vfs()), "/"));
        }
        if name.starts_with(path::SEPARATOR) {
            let inode = self.vfs().resolve(name)?;
            return self.as_directory_handle(&inode, name);
        }
        if name == ".." {
            return Ok(self.parent());
        }
        if let Some(rest) = name.strip_prefix("../") {
            return self.parent().directory_unchecked(rest);
        }
        if name == "." || name.is_empty() {
            return Ok(self.clone());
        }
        if let Some(rest) = name.strip_prefix("./") {
            return self.directory_unchecked(rest);
        }
        let inode = self.vfs().resolve(&self.child_path(name))?;
        self.as_directory_handle(&inode, name)
    }

    fn as_directory_handle(&self, inode: &Arc<Inode>, name: &str) -> Result<DirectoryHandle> {
        let target = self.vfs().follow_links(Arc::clone(inode))?;
        if !target.is_directory() {
            return Err(VfsError::not_a_directory(name));
        }
        Ok(DirectoryHandle::new(Arc::clone(self.vfs()), &target.path()))
    }

    pub fn directory(&self, name: &str, user: &User) -> Result<DirectoryHandle> {
        let dir = self.directory_unchecked(name)?;
        dir.check_hidden(user)?;
        Ok(dir)
    }

    /// Looks up a file, following links to their target file.
    pub fn file_unchecked(&self, name: &str) -> Result<FileHandle> {
        let path = if name.starts_with(path::SEPARATOR) {
            name.to_string()
        } else {
            self.child_path(name)
        };
        let inode = self.vfs().follow_links(self.vfs().resolve(&path)?)?;
        if !inode.is_file() {
            return Err(VfsError::not_a_file(path));
        }
        Ok(FileHandle::new(Arc::clone(self.vfs()), &inode.path()))
    }

    pub fn file(&self, name: &str, user: &User) -> Result<FileHandle> {
        let file = self.file_unchecked(name)?;
        file.check_hidden(user)?;
        Ok(file)
    }

    pub fn link_unchecked(&self, name: &str) -> Result<LinkHandle> {
        let path = self.child_path(name);
        let inode = self.vfs().resolve(&path)?;
        if !inode.is_link() {
            return Err(VfsError::not_a_link(path));
        }
        Ok(LinkHandle::new(Arc::clone(self.vfs()), &path))
    }

    pub fn link(&self, name: &str, user: &User) -> Result<LinkHandle> {
        let link = self.link_unchecked(name)?;
        link.check_hidden(user)?;
        Ok(link)
    }

    pub fn create_directory_unchecked(
        &self,
        name: &str,
        username: &str,
        group: &str,
    ) -> Result<DirectoryHandle> {
        let inode = self.inode()?;
        let created = self.vfs().create_directory(&inode, name, username, group)?;
        Ok(DirectoryHandle::new(Arc::clone(self.vfs()), &created.path()))
    }

    pub fn create_directory(&self, user: &User, name: &str) -> Result<DirectoryHandle> {
        let new_dir = self.non_existent_directory(name);
        new_dir.check_hidden_new(user)?;
        if !self
            .vfs()
            .permissions()
            .check_path_permission(PermAction::MakeDir, user, self.path())
        {
            return Err(VfsError::PermissionDenied(format!(
                "you are not allowed to create a directory in {}",
                self.path()
            )));
        }
        self.create_directory_unchecked(name, &user.name, &user.group)
    }

    /// Owner-less directory belonging to the system account.
    pub fn create_directory_system(&self, name: &str) -> Result<DirectoryHandle> {
        let owner = self.vfs().options().system_owner.clone();
        self.create_directory_unchecked(name, &owner, &owner)
    }

    /// Makes sure `name` exists in this directory, creating this directory
    /// and any missing ancestors first. Directories made here carry a
    /// placeholder timestamp. Losing a creation race to another caller is
    /// not an error.
    pub fn create_directory_recursive(&self, name: &str) -> Result<DirectoryHandle> {
        let inode = match self.inode() {
            Ok(inode) => inode,
            Err(e) if e.is_not_found() && !self.is_root() => {
                self.parent().create_directory_recursive(self.name())?;
                self.inode()?
            }
            Err(e) => return Err(e),
        };
        let owner = self.vfs().options().system_owner.clone();
        match self
            .vfs()
            .create_placeholder_directory(&inode, name, &owner, &owner)
        {
            Ok(created) => {
                debug!("created directory {}", created.path());
                Ok(DirectoryHandle::new(Arc::clone(self.vfs()), &created.path()))
            }
            Err(VfsError::AlreadyExists(_)) => self.directory_unchecked(name),
            Err(e) => Err(e),
        }
    }

    pub fn create_file_unchecked(
        &self,
        name: &str,
        username: &str,
        group: &str,
        initial_slave: Option<&str>,
    ) -> Result<FileHandle> {
        let inode = self.inode()?;
        let created = self
            .vfs()
            .create_file(&inode, name, username, group, initial_slave)?;
        Ok(FileHandle::new(Arc::clone(self.vfs()), &created.path()))
    }

    pub fn create_file(
        &self,
        user: &User,
        name: &str,
        initial_slave: Option<&str>,
    ) -> Result<FileHandle> {
        self.check_hidden(user)?;
        if !self
            .vfs()
            .permissions()
            .check_path_permission(PermAction::Upload, user, self.path())
        {
            return Err(VfsError::PermissionDenied(format!(
                "you are not allowed to upload to {}",
                self.path()
            )));
        }
        self.create_file_unchecked(name, &user.name, &user.group, initial_slave)
    }

    pub fn create_link_unchecked(
        &self,
        name: &str,
        target: &str,
        username: &str,
        group: &str,
    ) -> Result<LinkHandle> {
        let inode = self.inode()?;
        let created = self
            .vfs()
            .create_link(&inode, name, target, username, group)?;
        Ok(LinkHandle::new(Arc::clone(self.vfs()), &created.path()))
    }

    /// Links may only point at directories or files the user can see.
    pub fn create_link(&self, user: &User, name: &str, target: &str) -> Result<LinkHandle> {
        self.check_hidden(user)?;
        let target_path = if target.starts_with(path::SEPARATOR) {
            target.to_string()
        } else {
            self.child_path(target)
        };
        let target_handle = self.vfs().handle(&target_path)?;
        target_handle.base().check_hidden(user)?;
        if target_handle.is_link() {
            return Err(VfsError::PermissionDenied(
                "a link cannot point to another link".to_string(),
            ));
        }
        self.create_link_unchecked(name, target, &user.name, &user.group)
    }

    pub fn ref_count(&self, slave: &str) -> Result<u64> {
        Ok(self
            .inode()?
            .as_directory()
            .map(|d| d.ref_count(slave))
            .unwrap_or(0))
    }

    /// Forgets `slave` in this whole subtree, pruning directories it
    /// empties. Returns the number of files touched.
    pub fn remove_slave(&self, slave: &str) -> Result<usize> {
        let inode = self.inode()?;
        self.vfs().remove_slave_recursive(&inode, slave)
    }

    /// `true` if any file beneath this directory has no available slave.
    pub fn has_offline_files(&self) -> Result<bool> {
        let Some(ops) = self.vfs().slave_ops() else {
            return Ok(false);
        };
        let available = ops.available_slaves();
        self.has_offline_files_with(&self.inode()?, &available)
    }

    fn has_offline_files_with(
        &self,
        inode: &Arc<Inode>,
        available: &std::collections::BTreeSet<String>,
    ) -> Result<bool> {
        let Some(dir) = inode.as_directory() else {
            return Ok(false);
        };
        for name in dir.child_names() {
            let child = match self.vfs().child_of(inode, &name) {
                Ok(c) => c,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            if let Some(file) = child.as_file() {
                if file.slaves().is_disjoint(available) {
                    return Ok(true);
                }
            } else if child.is_directory() && self.has_offline_files_with(&child, available)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Aborts every transfer beneath this directory, both those tracked on
    /// loaded files and those the slaves know about.
    pub fn abort_all_transfers(&self, reason: &str) -> Result<usize> {
        let inode = self.inode()?;
        let mut aborted = 0;
        let mut stack = vec![inode];
        while let Some(current) = stack.pop() {
            if let Some(dir) = current.as_directory() {
                stack.extend(dir.cached_children());
            } else if let Some(file) = current.as_file() {
                aborted += file.abort_transfers(reason);
            }
        }
        if let Some(ops) = self.vfs().slave_ops() {
            ops.cancel_transfers_in_directory(self.path(), reason);
        }
        Ok(aborted)
    }

    /// Deletes the directory from every slave and then from the namespace.
    pub async fn delete_unchecked(&self) -> Result<()> {
        let inode = self.inode()?;
        self.abort_all_transfers(&format!("directory {} is being deleted", self.path()))?;
        if let Some(ops) = self.vfs().slave_ops() {
            ops.delete_on_all_slaves(self.path()).await;
        }
        self.vfs().delete_inode(&inode)?;
        info!("directory {} deleted", self.path());
        Ok(())
    }

    pub async fn delete(&self, user: &User) -> Result<()> {
        self.check_delete(user)?;
        self.delete_unchecked().await
    }

    pub fn validate_size_recursive(&self) -> Result<SizeValidation> {
        let inode = self.inode()?;
        self.vfs().validate_size_recursive(&inode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::PathPermissions;
    use crate::store::VfsOptions;
    use tempfile::{TempDir, tempdir};

    fn open() -> (TempDir, Arc<Vfs>) {
        let tmp = tempdir().unwrap();
        let vfs = Vfs::open(tmp.path(), VfsOptions::default()).unwrap();
        (tmp, vfs)
    }

    #[test]
    fn test_case_insensitive_uniqueness() {
        let (_tmp, vfs) = open();
        let root = vfs.root_handle();
        root.create_directory_unchecked("Foo", "u", "g").unwrap();
        let err = root.create_directory_unchecked("foo", "u", "g").unwrap_err();
        assert!(matches!(err, VfsError::AlreadyExists(_)));
        let err = root.create_file_unchecked("FOO", "u", "g", None).unwrap_err();
        assert!(matches!(err, VfsError::AlreadyExists(_)));
        assert!(vfs.directory("/fOO").exists());
    }

    #[test]
    fn test_relative_navigation() {
        let (_tmp, vfs) = open();
        let root = vfs.root_handle();
        let a = root.create_directory_unchecked("a", "u", "g").unwrap();
        let b = a.create_directory_unchecked("b", "u", "g").unwrap();
        root.create_link_unchecked("shortcut", "/a/b", "u", "g").unwrap();

        assert_eq!(b.directory_unchecked("..").unwrap().path(), "/a");
        assert_eq!(b.directory_unchecked("../b").unwrap().path(), "/a/b");
        assert_eq!(a.directory_unchecked("./b").unwrap().path(), "/a/b");
        assert_eq!(b.directory_unchecked(".").unwrap().path(), "/a/b");
        assert_eq!(b.directory_unchecked("/").unwrap().path(), "/");
        assert_eq!(root.directory_unchecked("shortcut").unwrap().path(), "/a/b");

        b.create_file_unchecked("x.bin", "u", "g", Some("S1")).unwrap();
        assert!(vfs.file("/shortcut/x.bin").exists());
        assert!(matches!(
            a.directory_unchecked("b/x.bin"),
            Err(VfsError::NotValidType { .. })
        ));
    }

    #[test]
    fn test_sorted_listing() {
        let (_tmp, vfs) = open();
        let root = vfs.root_handle();
        for name in ["b", "C", "a"] {
            root.create_file_unchecked(name, "u", "g", Some("S1")).unwrap();
        }
        let names: Vec<String> = root
            .sorted_inode_handles_unchecked()
            .unwrap()
            .iter()
            .map(|h| h.name().to_string())
            .collect();
        assert_eq!(names, vec!["a", "b", "C"]);
        assert_eq!(root.files_unchecked().unwrap().len(), 3);
        assert!(root.directories_unchecked().unwrap().is_empty());
    }

    #[test]
    fn test_hidden_path_looks_missing() {
        let (_tmp, vfs) = open();
        let root = vfs.root_handle();
        let staff = root.create_directory_unchecked("staff", "admin", "staff").unwrap();
        staff
            .create_file_unchecked("secret.txt", "admin", "staff", Some("S1"))
            .unwrap();
        root.create_directory_unchecked("public", "admin", "staff")
            .unwrap();

        let mut perms = PathPermissions::new();
        perms.add_rule(PermAction::PrivPath, "/staff*", &["=staff"]);
        vfs.set_permissions(Arc::new(perms));

        let outsider = User::new("bob", "users");
        let hidden = root.directory("staff", &outsider).unwrap_err();
        let missing = root.directory("nothere", &outsider).unwrap_err();
        assert!(hidden.is_not_found());
        assert!(missing.is_not_found());
        assert_eq!(
            hidden.to_string(),
            VfsError::not_found("/staff").to_string()
        );

        let err = vfs
            .file("/staff/secret.txt")
            .check_hidden(&outsider)
            .unwrap_err();
        assert!(err.is_not_found());

        let listing = root.sorted_inode_handles(&outsider).unwrap();
        let names: Vec<&str> = listing.iter().map(|h| h.name()).collect();
        assert_eq!(names, vec!["public"]);

        let mut insider = User::new("carol", "users");
        insider.groups.push("staff".to_string());
        assert!(root.directory("staff", &insider).is_ok());
        assert!(vfs.directory("/staff").is_hidden(&outsider).unwrap());
    }

    #[test]
    fn test_checked_create_respects_acl() {
        let (_tmp, vfs) = open();
        let root = vfs.root_handle();
        let mut perms = PathPermissions::new();
        perms.add_rule(PermAction::MakeDir, "/*", &["=siteop"]);
        vfs.set_permissions(Arc::new(perms));

        let user = User::new("bob", "users");
        assert!(matches!(
            root.create_directory(&user, "mine"),
            Err(VfsError::PermissionDenied(_))
        ));
        let op = User::new("op", "siteop");
        let dir = root.create_directory(&op, "mine").unwrap();
        assert_eq!(dir.username().unwrap(), "op");
    }

    #[test]
    fn test_link_to_link_rejected() {
        let (_tmp, vfs) = open();
        let root = vfs.root_handle();
        let user = User::new("u", "g");
        root.create_directory(&user, "target").unwrap();
        root.create_link(&user, "first", "/target").unwrap();
        let err = root.create_link(&user, "second", "/first").unwrap_err();
        assert!(matches!(err, VfsError::PermissionDenied(_)));
    }

    #[test]
    fn test_create_directory_recursive() {
        let (_tmp, vfs) = open();
        let deep = vfs.directory("/a/b");
        let c = deep.create_directory_recursive("c").unwrap();
        assert_eq!(c.path(), "/a/b/c");
        assert!(vfs.directory("/a").exists());
        let again = deep.create_directory_recursive("c").unwrap();
        assert_eq!(again.path(), "/a/b/c");
        assert!(
            vfs.directory("/a")
                .inode()
                .unwrap()
                .as_directory()
                .unwrap()
                .has_placeholder_last_modified()
        );
    }
}
