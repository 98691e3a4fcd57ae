use libvfs::VfsError;
use thiserror::Error;

use crate::protocol::RemoteErrorKind;

#[derive(Debug, Error)]
pub enum MasterError {
    #[error("{0} does not exist, use \"site addslave\"")]
    UnknownSlave(String),
    #[error("slave {requested} is registered as {registered}")]
    CaseMismatch { requested: String, registered: String },
    #[error("slave {0} already exists")]
    SlaveExists(String),
    #[error("Already online")]
    AlreadyOnline(String),
    #[error("{addr} is not a valid mask for {slave}")]
    AddressRejected { addr: String, slave: String },
    #[error("slave {slave} is unavailable: {reason}")]
    SlaveUnavailable { slave: String, reason: String },
    #[error("slave {slave} failed: {message}")]
    RemoteIo {
        slave: String,
        kind: RemoteErrorKind,
        message: String,
    },
    #[error("no available slave")]
    NoAvailableSlave,
    #[error("mask {0} is already present")]
    DuplicateMask(String),
    #[error("invalid mask {mask}: {reason}")]
    InvalidMask { mask: String, reason: String },
    #[error("property {0} is not set")]
    KeyNotFound(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("fatal configuration: {0}")]
    FatalConfiguration(String),
    #[error(transparent)]
    Vfs(#[from] VfsError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Bincode(#[from] bincode::Error),
}

impl MasterError {
    pub fn unavailable(slave: &str, reason: impl Into<String>) -> Self {
        MasterError::SlaveUnavailable {
            slave: slave.to_string(),
            reason: reason.into(),
        }
    }

    /// The slave answered that the path was already gone.
    pub fn is_file_not_found(&self) -> bool {
        matches!(
            self,
            MasterError::RemoteIo {
                kind: RemoteErrorKind::NotFound,
                ..
            }
        )
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, MasterError::SlaveUnavailable { .. })
    }
}

impl From<MasterError> for VfsError {
    fn from(e: MasterError) -> Self {
        match e {
            MasterError::Vfs(inner) => inner,
            MasterError::SlaveUnavailable { slave, .. } => VfsError::SlaveUnavailable(slave),
            MasterError::NoAvailableSlave => VfsError::NoAvailableSlave("no slave online".into()),
            MasterError::RemoteIo {
                kind: RemoteErrorKind::NotFound,
                message,
                ..
            } => VfsError::NotFound(message),
            MasterError::Io(inner) => VfsError::Io(inner),
            MasterError::Json(inner) => VfsError::Json(inner),
            other => VfsError::Other(anyhow::Error::new(other)),
        }
    }
}

pub type Result<T> = std::result::Result<T, MasterError>;
