pub mod client;
pub mod config;
pub mod namespace;
pub mod naming;
pub mod net;
pub mod registry;
pub mod router;
pub mod storage;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A SHA-256 digest of the bytes moved by one file transfer.
pub type Digest256 = [u8; 32];

/// Compute the SHA-256 digest of a byte slice.
pub fn sha256(data: &[u8]) -> Digest256 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] postcard::Error),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Storage server is not active: {0}")]
    ServerInactive(String),

    #[error("Parent path is not a directory: {0}")]
    ParentNotDirectory(String),

    #[error("Name already exists: {0}")]
    DuplicateName(String),

    #[error("Invalid path format: {0}")]
    InvalidPathFormat(String),

    #[error("Cannot delete the root directory")]
    CannotDeleteRoot,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("No such storage server: {0}")]
    NoSuchServer(usize),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("Transfer interrupted: {0}")]
    TransferInterrupted(String),

    #[error("Protocol desync: {0}")]
    ProtocolDesync(String),

    #[error("Malformed tree: {0}")]
    MalformedTree(String),

    #[error("Storage server reported: {0}")]
    Remote(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ShardError>;

/// Wire-level classification of a [`ShardError`], so a failure keeps its
/// kind when it is relayed to a client or across a storage channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    PathNotFound,
    ServerInactive,
    ParentNotDirectory,
    DuplicateName,
    InvalidPathFormat,
    CannotDeleteRoot,
    PermissionDenied,
    NoSuchServer,
    InvalidCommand,
    PeerUnreachable,
    TransferInterrupted,
    ProtocolDesync,
    MalformedTree,
    Remote,
    Io,
    Other,
}

impl ShardError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Io,
            Self::Codec(_) | Self::ProtocolDesync(_) => ErrorKind::ProtocolDesync,
            Self::PathNotFound(_) => ErrorKind::PathNotFound,
            Self::ServerInactive(_) => ErrorKind::ServerInactive,
            Self::ParentNotDirectory(_) => ErrorKind::ParentNotDirectory,
            Self::DuplicateName(_) => ErrorKind::DuplicateName,
            Self::InvalidPathFormat(_) => ErrorKind::InvalidPathFormat,
            Self::CannotDeleteRoot => ErrorKind::CannotDeleteRoot,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::NoSuchServer(_) => ErrorKind::NoSuchServer,
            Self::InvalidCommand(_) => ErrorKind::InvalidCommand,
            Self::PeerUnreachable(_) => ErrorKind::PeerUnreachable,
            Self::TransferInterrupted(_) => ErrorKind::TransferInterrupted,
            Self::MalformedTree(_) => ErrorKind::MalformedTree,
            Self::Remote(_) => ErrorKind::Remote,
            Self::Other(_) => ErrorKind::Other,
        }
    }

    /// Rebuild an error that was reported by a remote peer with its kind.
    pub fn from_remote(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::PathNotFound => Self::PathNotFound(message),
            ErrorKind::ServerInactive => Self::ServerInactive(message),
            ErrorKind::ParentNotDirectory => Self::ParentNotDirectory(message),
            ErrorKind::DuplicateName => Self::DuplicateName(message),
            ErrorKind::InvalidPathFormat => Self::InvalidPathFormat(message),
            ErrorKind::CannotDeleteRoot => Self::CannotDeleteRoot,
            ErrorKind::PermissionDenied => Self::PermissionDenied(message),
            ErrorKind::InvalidCommand => Self::InvalidCommand(message),
            ErrorKind::PeerUnreachable => Self::PeerUnreachable(message),
            ErrorKind::TransferInterrupted => Self::TransferInterrupted(message),
            ErrorKind::ProtocolDesync => Self::ProtocolDesync(message),
            ErrorKind::MalformedTree => Self::MalformedTree(message),
            ErrorKind::NoSuchServer | ErrorKind::Remote | ErrorKind::Io | ErrorKind::Other => {
                Self::Remote(message)
            }
        }
    }

    /// The bare message without the variant prefix added by `Display`.
    pub fn detail(&self) -> String {
        match self {
            Self::Io(e) => e.to_string(),
            Self::Codec(e) => e.to_string(),
            Self::CannotDeleteRoot => "/".to_string(),
            Self::NoSuchServer(n) => n.to_string(),
            Self::PathNotFound(s)
            | Self::ServerInactive(s)
            | Self::ParentNotDirectory(s)
            | Self::DuplicateName(s)
            | Self::InvalidPathFormat(s)
            | Self::PermissionDenied(s)
            | Self::InvalidCommand(s)
            | Self::PeerUnreachable(s)
            | Self::TransferInterrupted(s)
            | Self::ProtocolDesync(s)
            | Self::MalformedTree(s)
            | Self::Remote(s)
            | Self::Other(s) => s.clone(),
        }
    }
}
