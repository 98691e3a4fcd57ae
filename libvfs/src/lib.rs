//! Virtual namespace engine of the rkfs master.
//!
//! The tree of [`inode::Inode`]s is persisted as one JSON record per inode
//! under a base directory and loaded lazily. Every directory keeps the total
//! size and per-slave file counts of its subtree so that "does this subtree
//! use slave S" is answered without walking it.

pub mod commit;
pub mod disk;
pub mod error;
pub mod event;
pub mod extension;
pub mod handle;
pub mod inode;
pub mod path;
pub mod permissions;
pub mod record;
pub mod remerge;
pub mod slave;
pub mod store;
pub mod tree;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use commit::{CommitManager, Commitable};
pub use error::{RemergeError, Result, VfsError};
pub use event::{EventBus, VfsEvent};
pub use extension::Key;
pub use handle::{DirectoryHandle, FileHandle, Handle, InodeHandle, LinkHandle};
pub use permissions::{AllowAll, PathPermissions, PermAction, User, VfsPermissions};
pub use remerge::{CollisionPolicy, LightRemoteInode, RemergeReport};
pub use slave::{RemergeSlave, SlaveOps, TransferHandle};
pub use store::{Vfs, VfsOptions};
pub use tree::SizeValidation;

/// Locks `m`, carrying on with the data if a previous holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
