use std::collections::BTreeSet;

use log::debug;
use tokio::sync::broadcast;

/// Change notifications emitted by the namespace.
///
/// Delivery is fire-and-forget: nothing in the tree depends on a listener
/// having seen an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VfsEvent {
    Created {
        path: String,
    },
    Deleted {
        path: String,
    },
    Renamed {
        from: String,
        to: String,
    },
    SizeChanged {
        path: String,
        size: u64,
    },
    LastModifiedChanged {
        path: String,
        last_modified: i64,
    },
    OwnerChanged {
        path: String,
        username: String,
        group: String,
    },
    SlavesChanged {
        path: String,
        slaves: BTreeSet<String>,
    },
    /// Something about `path` changed that listeners should re-read.
    /// `sync` asks listeners to refresh before returning control.
    Refresh {
        path: String,
        sync: bool,
    },
}

impl VfsEvent {
    pub fn path(&self) -> &str {
        match self {
            VfsEvent::Created { path }
            | VfsEvent::Deleted { path }
            | VfsEvent::SizeChanged { path, .. }
            | VfsEvent::LastModifiedChanged { path, .. }
            | VfsEvent::OwnerChanged { path, .. }
            | VfsEvent::SlavesChanged { path, .. }
            | VfsEvent::Refresh { path, .. } => path,
            VfsEvent::Renamed { to, .. } => to,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<VfsEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VfsEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: VfsEvent) {
        debug!("vfs event: {event:?}");
        // no receivers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(1024)
    }
}
