use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Known failure signatures reported by the mount/umount tools.
///
/// The executor matches the tool's combined output against these so callers
/// can react to the common cases without parsing text themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Monitor rejected the credentials
    AccessDenied,
    /// Monitor hostname could not be resolved
    ServerUnresolved,
    /// Mount point is busy
    Busy,
    /// Anything else
    Other,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::AccessDenied => "access denied",
            FailureKind::ServerUnresolved => "server unresolved",
            FailureKind::Busy => "device busy",
            FailureKind::Other => "command failed",
        };
        f.write_str(s)
    }
}

/// Main error type for volume driver operations
#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("{0:?} already exists and is not a directory")]
    DirectoryConflict(PathBuf),

    #[error("Cannot pass secret and secretfile options together")]
    ConflictingCredentials,

    #[error("Failed to read secret file {path:?}: {source}")]
    SecretFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Mount failed ({kind}): {output}")]
    MountFailed { kind: FailureKind, output: String },

    #[error("Unmount of {path:?} failed ({kind}): {output}")]
    UnmountFailed {
        path: PathBuf,
        kind: FailureKind,
        output: String,
    },

    #[error("Volume is currently in use: {0}")]
    InUse(String),

    #[error("Volume not found: {0}")]
    NotFound(String),

    #[error("Invalid volume name: {0}")]
    InvalidName(String),

    #[error("Reconciliation failed: {0}")]
    Reconciliation(String),

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl VolumeError {
    /// Failure classification for errors coming from the external tools
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            VolumeError::MountFailed { kind, .. } | VolumeError::UnmountFailed { kind, .. } => {
                Some(*kind)
            }
            _ => None,
        }
    }
}

/// Result type alias for volume driver operations
pub type Result<T> = std::result::Result<T, VolumeError>;
