use thiserror::Error;

pub type Result<T> = std::result::Result<T, VfsError>;

#[derive(Debug, Error)]
pub enum VfsError {
    #[error("{0}: no such file or directory")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("{path} is not a {expected}")]
    NotValidType { path: String, expected: &'static str },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("slave {0} is unavailable")]
    SlaveUnavailable(String),
    #[error("no available slave: {0}")]
    NoAvailableSlave(String),
    #[error("fatal: {0}")]
    Fatal(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VfsError {
    pub fn not_found(path: impl Into<String>) -> Self {
        VfsError::NotFound(path.into())
    }

    pub fn not_a_directory(path: impl Into<String>) -> Self {
        VfsError::NotValidType {
            path: path.into(),
            expected: "directory",
        }
    }

    pub fn not_a_file(path: impl Into<String>) -> Self {
        VfsError::NotValidType {
            path: path.into(),
            expected: "file",
        }
    }

    pub fn not_a_link(path: impl Into<String>) -> Self {
        VfsError::NotValidType {
            path: path.into(),
            expected: "link",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, VfsError::NotFound(_))
    }
}

/// Failures of a single remerge pass.
#[derive(Debug, Error)]
pub enum RemergeError {
    /// The slave reported a physical directory the namespace has no record of.
    /// Slaves remerge deeper directories before their parents, which creates
    /// them, so this means the reconciliation order was broken upstream.
    #[error("slave {slave} reported unknown directory {path} during remerge")]
    UnexpectedDirectory { slave: String, path: String },
    #[error(transparent)]
    Vfs(#[from] VfsError),
}
