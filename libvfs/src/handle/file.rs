use std::collections::BTreeSet;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use log::{debug, info, warn};

use super::InodeHandle;
use crate::error::{Result, VfsError};
use crate::extension::{DOWNLOADED_MILLISECONDS, DOWNLOADED_TIMES};
use crate::inode::{FileData, Inode};
use crate::permissions::User;
use crate::slave::TransferHandle;
use crate::store::Vfs;

#[derive(Clone, PartialEq, Eq)]
pub struct FileHandle {
    pub(crate) base: InodeHandle,
}

impl Deref for FileHandle {
    type Target = InodeHandle;

    fn deref(&self) -> &InodeHandle {
        &self.base
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FileHandle").field(&self.path()).finish()
    }
}

impl FileHandle {
    pub(crate) fn new(vfs: Arc<Vfs>, path: &str) -> Self {
        FileHandle {
            base: InodeHandle::new(vfs, path),
        }
    }

    pub fn inode(&self) -> Result<Arc<Inode>> {
        let inode = self.base.inode()?;
        if !inode.is_file() {
            return Err(VfsError::not_a_file(self.path()));
        }
        Ok(inode)
    }

    fn with_data<R>(&self, f: impl FnOnce(&FileData) -> R) -> Result<R> {
        let inode = self.inode()?;
        match inode.as_file() {
            Some(data) => Ok(f(data)),
            None => Err(VfsError::not_a_file(self.path())),
        }
    }

    pub fn slaves(&self) -> Result<BTreeSet<String>> {
        self.with_data(|d| d.slaves())
    }

    pub fn has_slave(&self, slave: &str) -> Result<bool> {
        self.with_data(|d| d.has_slave(slave))
    }

    /// Slaves holding this file that are currently usable. Holders the
    /// registry no longer knows about are forgotten along the way.
    pub fn available_slaves(&self) -> Result<BTreeSet<String>> {
        let inode = self.inode()?;
        let Some(ops) = self.vfs().slave_ops() else {
            return Ok(BTreeSet::new());
        };
        let mut available = BTreeSet::new();
        for slave in self.slaves()? {
            if !ops.is_known(&slave) {
                warn!("{} references unknown slave {slave}, dropping it", self.path());
                self.vfs().remove_slave(&inode, &slave)?;
                continue;
            }
            if ops.is_available(&slave) {
                available.insert(slave);
            }
        }
        Ok(available)
    }

    pub fn is_available(&self) -> Result<bool> {
        Ok(!self.available_slaves()?.is_empty())
    }

    /// Picks one available holder, or fails with `NoAvailableSlave`.
    pub fn a_slave_for_function(&self) -> Result<String> {
        self.available_slaves()?
            .into_iter()
            .next()
            .ok_or_else(|| VfsError::NoAvailableSlave(self.path().to_string()))
    }

    pub fn add_slave(&self, slave: &str) -> Result<bool> {
        let inode = self.inode()?;
        self.vfs().add_slave(&inode, slave)
    }

    /// Forgets `slave` as a holder. The file is deleted once no holder is
    /// left.
    pub fn remove_slave(&self, slave: &str) -> Result<bool> {
        let inode = self.inode()?;
        self.vfs().remove_slave(&inode, slave)
    }

    pub fn set_size(&self, size: u64) -> Result<()> {
        let inode = self.inode()?;
        self.vfs().set_file_size(&inode, size)
    }

    /// Checksum as currently recorded, 0 if unknown.
    pub fn checksum_cached(&self) -> Result<u64> {
        self.with_data(|d| d.checksum())
    }

    pub fn set_checksum(&self, checksum: u64) -> Result<()> {
        let inode = self.inode()?;
        self.vfs().set_checksum(&inode, checksum)
    }

    /// Returns the checksum, asking the available slaves for it when it is
    /// not known yet. Concurrent callers share one fetch.
    pub async fn checksum(&self) -> Result<u64> {
        let inode = self.inode()?;
        let Some(data) = inode.as_file() else {
            return Err(VfsError::not_a_file(self.path()));
        };
        let cached = data.checksum();
        if cached != 0 {
            return Ok(cached);
        }
        let _guard = data.checksum_fetch().lock().await;
        let cached = data.checksum();
        if cached != 0 {
            return Ok(cached);
        }
        let Some(ops) = self.vfs().slave_ops() else {
            return Err(VfsError::NoAvailableSlave(self.path().to_string()));
        };
        let mut candidates = self.available_slaves()?;
        while let Some(slave) = candidates.pop_first() {
            match ops.checksum(&slave, self.path()).await {
                Ok(checksum) => {
                    debug!("checksum of {} is {checksum:08x} according to {slave}", self.path());
                    self.vfs().set_checksum(&inode, checksum)?;
                    return Ok(checksum);
                }
                Err(e) => warn!("{slave} could not checksum {}: {e}", self.path()),
            }
        }
        Err(VfsError::NoAvailableSlave(self.path().to_string()))
    }

    pub fn xfertime(&self) -> Result<u64> {
        self.with_data(|d| d.xfertime())
    }

    pub fn set_xfertime(&self, xfertime: u64) -> Result<()> {
        let inode = self.inode()?;
        self.vfs().set_xfertime(&inode, xfertime)
    }

    pub fn downloaded_times(&self) -> Result<u64> {
        Ok(self.extension(&DOWNLOADED_TIMES)?.unwrap_or(0))
    }

    pub fn downloaded_milliseconds(&self) -> Result<u64> {
        Ok(self.extension(&DOWNLOADED_MILLISECONDS)?.unwrap_or(0))
    }

    /// Records one completed download that took `millis`.
    pub fn record_download(&self, millis: u64) -> Result<()> {
        let times = self.downloaded_times()?;
        let total = self.downloaded_milliseconds()?;
        self.set_extension(&DOWNLOADED_TIMES, times + 1)?;
        self.set_extension(&DOWNLOADED_MILLISECONDS, total + millis)
    }

    pub fn add_upload(&self, transfer: Arc<dyn TransferHandle>) -> Result<()> {
        self.with_data(|d| d.add_upload(transfer))
    }

    pub fn add_download(&self, transfer: Arc<dyn TransferHandle>) -> Result<()> {
        self.with_data(|d| d.add_download(transfer))
    }

    pub fn active_uploads(&self) -> Result<usize> {
        self.with_data(|d| d.active_uploads())
    }

    pub fn active_downloads(&self) -> Result<usize> {
        self.with_data(|d| d.active_downloads())
    }

    pub fn is_uploading(&self) -> Result<bool> {
        Ok(self.active_uploads()? > 0)
    }

    pub fn abort_transfers(&self, reason: &str) -> Result<usize> {
        self.with_data(|d| d.abort_transfers(reason))
    }

    /// Aborts transfers, asks every holder to delete its copy and drops the
    /// file from the namespace.
    pub async fn delete_unchecked(&self) -> Result<()> {
        let inode = self.inode()?;
        self.abort_transfers(&format!("file {} is being deleted", self.path()))?;
        if let Some(ops) = self.vfs().slave_ops() {
            for slave in self.slaves()? {
                ops.simple_delete(&slave, self.path());
            }
        }
        self.vfs().delete_inode(&inode)?;
        info!("file {} deleted", self.path());
        Ok(())
    }

    pub async fn delete(&self, user: &User) -> Result<()> {
        self.check_delete(user)?;
        self.delete_unchecked().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::VfsOptions;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    struct FakeTransfer(AtomicBool);

    impl TransferHandle for FakeTransfer {
        fn abort(&self, _reason: &str) {
            self.0.store(true, Ordering::SeqCst);
        }

        fn is_finished(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_slave_removal_deletes_orphan() {
        let tmp = tempdir().unwrap();
        let vfs = Vfs::open(tmp.path(), VfsOptions::default()).unwrap();
        let root = vfs.root_handle();
        let file = root.create_file_unchecked("a.bin", "u", "g", Some("S1")).unwrap();
        file.set_size(100).unwrap();
        file.add_slave("S2").unwrap();
        assert_eq!(root.ref_count("S1").unwrap(), 1);
        assert_eq!(root.ref_count("S2").unwrap(), 1);

        assert!(file.remove_slave("S1").unwrap());
        assert!(file.exists());
        assert_eq!(root.ref_count("S1").unwrap(), 0);
        assert_eq!(root.size().unwrap(), 100);

        assert!(file.remove_slave("S2").unwrap());
        assert!(!file.exists());
        assert_eq!(root.size().unwrap(), 0);
        assert_eq!(root.ref_count("S2").unwrap(), 0);
    }

    #[test]
    fn test_abort_transfers() {
        let tmp = tempdir().unwrap();
        let vfs = Vfs::open(tmp.path(), VfsOptions::default()).unwrap();
        let file = vfs
            .root_handle()
            .create_file_unchecked("a.bin", "u", "g", Some("S1"))
            .unwrap();
        let upload = Arc::new(FakeTransfer(AtomicBool::new(false)));
        file.add_upload(upload.clone()).unwrap();
        assert!(file.is_uploading().unwrap());
        assert_eq!(file.abort_transfers("test").unwrap(), 1);
        assert!(upload.is_finished());
        assert!(!file.is_uploading().unwrap());
    }

    #[test]
    fn test_download_stats() {
        let tmp = tempdir().unwrap();
        let vfs = Vfs::open(tmp.path(), VfsOptions::default()).unwrap();
        let file = vfs
            .root_handle()
            .create_file_unchecked("a.bin", "u", "g", Some("S1"))
            .unwrap();
        file.record_download(250).unwrap();
        file.record_download(750).unwrap();
        assert_eq!(file.downloaded_times().unwrap(), 2);
        assert_eq!(file.downloaded_milliseconds().unwrap(), 1000);
    }

    #[test]
    fn test_wrong_type_is_reported() {
        let tmp = tempdir().unwrap();
        let vfs = Vfs::open(tmp.path(), VfsOptions::default()).unwrap();
        vfs.root_handle()
            .create_directory_unchecked("dir", "u", "g")
            .unwrap();
        assert!(matches!(
            vfs.file("/dir").slaves(),
            Err(VfsError::NotValidType { .. })
        ));
    }
}
