//! Error types for the keva operator.

use thiserror::Error;

/// Convenient result alias used throughout the operator.
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Main error type for the operator.
#[derive(Error, Debug)]
pub enum OperatorError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("KevaCluster CRD not installed. Please install the keva CRDs first.")]
    CrdNotInstalled,

    #[error("invalid cluster spec: {0}")]
    InvalidSpec(String),

    #[error("cluster failed to be created")]
    CreateInterrupted,

    #[error("unexpected cluster phase: {0}")]
    UnexpectedPhase(String),

    #[error("no backup exists for recovery")]
    NoBackupExist,

    #[error("pod '{0}' cannot be parsed as a member of this cluster")]
    InvalidMemberName(String),

    #[error("member '{0}' is in an unexpected unready state")]
    UnexpectedUnreadyMember(String),

    #[error("replica admin API error: {0}")]
    ReplicaAdmin(String),

    #[error("backup storage error: {0}")]
    Backup(String),

    #[error("resource already exists: {0}")]
    AlreadyExists(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl OperatorError {
    /// Fatal errors terminate the controller and mark the cluster `Failed`.
    /// Everything else is retried on the next reconciliation tick.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OperatorError::NoBackupExist
                | OperatorError::InvalidMemberName(_)
                | OperatorError::UnexpectedUnreadyMember(_)
                | OperatorError::InvalidSpec(_)
                | OperatorError::CreateInterrupted
                | OperatorError::UnexpectedPhase(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            OperatorError::NotFound(_) => true,
            OperatorError::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        match self {
            OperatorError::AlreadyExists(_) => true,
            OperatorError::Kube(kube::Error::Api(resp)) => {
                resp.code == 409 && resp.reason == "AlreadyExists"
            }
            _ => false,
        }
    }

    /// Version-precondition failure on a status write.
    pub fn is_conflict(&self) -> bool {
        match self {
            OperatorError::Conflict(_) => true,
            OperatorError::Kube(kube::Error::Api(resp)) => {
                resp.code == 409 && resp.reason == "Conflict"
            }
            _ => false,
        }
    }
}
