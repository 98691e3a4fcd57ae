//! Slave registry: persisted records, live sessions and routing of
//! namespace operations to the slaves holding the data.

pub mod manager;
pub mod masks;
pub mod record;
pub mod remote;
pub mod status;
pub mod transfer;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use libvfs::Vfs;
use tokio::sync::broadcast;

pub use manager::SlaveManager;
pub use remote::{PendingResponse, RemoteSlave};

use crate::config::{Config, RemergeConfig};
use crate::protocol::RemergeListing;

#[derive(Debug, Clone)]
pub struct SlaveSettings {
    pub slaves_dir: PathBuf,
    pub handshake_timeout: Duration,
    /// Default wait for a command response. A slave's `timeout` property,
    /// in milliseconds, overrides it.
    pub response_timeout: Duration,
    pub delete_timeout: Duration,
    pub remerge: RemergeConfig,
}

impl SlaveSettings {
    pub fn from_config(cfg: &Config) -> Self {
        SlaveSettings {
            slaves_dir: cfg.slaves_dir.clone(),
            handshake_timeout: cfg.timeouts.handshake(),
            response_timeout: cfg.timeouts.response(),
            delete_timeout: cfg.timeouts.delete(),
            remerge: cfg.remerge.clone(),
        }
    }

    pub fn with_slaves_dir(slaves_dir: impl Into<PathBuf>) -> Self {
        SlaveSettings {
            slaves_dir: slaves_dir.into(),
            handshake_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(60),
            delete_timeout: Duration::from_secs(300),
            remerge: RemergeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlaveEventKind {
    /// The slave finished its first remerge and takes work.
    Added,
    /// An available slave went away.
    Deleted { reason: String },
    Message(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveEvent {
    pub slave: String,
    pub kind: SlaveEventKind,
}

/// Shared by the manager and every slave it owns.
pub struct SlaveContext {
    pub vfs: Arc<Vfs>,
    pub settings: SlaveSettings,
    events: broadcast::Sender<SlaveEvent>,
}

impl SlaveContext {
    pub fn new(vfs: Arc<Vfs>, settings: SlaveSettings) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(SlaveContext {
            vfs,
            settings,
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SlaveEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, slave: &str, kind: SlaveEventKind) {
        // nobody listening is fine
        let _ = self.events.send(SlaveEvent {
            slave: slave.to_string(),
            kind,
        });
    }
}

/// Work item of a slave's remerge worker.
#[derive(Debug)]
pub enum RemergeMessage {
    Listing(RemergeListing),
    /// The slave has sent its whole listing.
    Completed,
}
