use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Weak};

use libvfs::TransferHandle;
use log::debug;

use crate::lock;
use crate::slave::remote::RemoteSlave;
use crate::slave::status::{TransferDirection, TransferStatus};

/// Master-side view of a transfer running on a slave.
pub struct RemoteTransfer {
    slave: Weak<RemoteSlave>,
    id: u64,
    path: String,
    direction: TransferDirection,
    status: Mutex<TransferStatus>,
    aborted: AtomicBool,
}

impl RemoteTransfer {
    pub(crate) fn new(slave: Weak<RemoteSlave>, status: &TransferStatus) -> Self {
        RemoteTransfer {
            slave,
            id: status.transfer,
            path: status.path.clone(),
            direction: status.direction,
            status: Mutex::new(status.clone()),
            aborted: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn status(&self) -> TransferStatus {
        lock(&self.status).clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub(crate) fn update(&self, status: &TransferStatus) {
        *lock(&self.status) = status.clone();
    }

    /// `true` if the transfer's file lies in `dir` or below it.
    pub fn is_under(&self, dir: &str) -> bool {
        if dir == "/" {
            return true;
        }
        let dir = dir.trim_end_matches('/');
        self.path == dir
            || (self.path.starts_with(dir) && self.path[dir.len()..].starts_with('/'))
    }
}

impl TransferHandle for RemoteTransfer {
    fn abort(&self, reason: &str) {
        if self.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.slave.upgrade() {
            Some(slave) => slave.abort_transfer(self.id, reason),
            None => debug!("slave of transfer {} is gone", self.id),
        }
    }

    fn is_finished(&self) -> bool {
        lock(&self.status).finished
    }
}
