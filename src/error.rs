//! Error types for vmvol.

use crate::transport::TransportError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using vmvol's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in vmvol operations.
#[derive(Error, Debug)]
pub enum Error {
    // Transport errors
    /// The RPC transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    // Remote service errors
    /// The volume service returned an error payload.
    #[error("{0}")]
    Remote(String),

    /// The volume service reply could not be understood.
    #[error("invalid reply to {command}: {message}")]
    Protocol {
        /// Command whose reply was malformed.
        command: String,
        /// Parse failure.
        message: String,
    },

    // Consistency errors
    /// Reference count would drop below zero.
    #[error("volume {0} is not mounted")]
    NotMounted(String),

    /// Removal attempted while the volume is mounted.
    #[error("Remove failure - volume is still mounted. volume={name}, refcount={refcnt}")]
    VolumeInUse {
        /// Volume name.
        name: String,
        /// Current reference count.
        refcnt: u32,
    },

    // Local resource errors
    /// No mkfs helper exists for the requested filesystem.
    #[error("Not found mkfs for {fstype}. Supported filesystems found: {supported}")]
    UnsupportedFilesystem {
        /// Requested filesystem type.
        fstype: String,
        /// Comma-separated list of filesystems with a mkfs helper.
        supported: String,
    },

    /// Attached disk could not be mapped to a device node.
    #[error("device path error: {0}")]
    DevicePath(String),

    /// Generic mount error.
    #[error("mount error: {0}")]
    Mount(String),

    /// External command failed.
    #[error("command failed: {command}: {message}")]
    CommandFailed {
        /// The command that failed.
        command: String,
        /// Error message.
        message: String,
    },

    // Configuration errors
    /// Generic configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to load configuration.
    #[error("failed to load config {}: {message}", path.display())]
    ConfigLoad {
        /// Config file path.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    // IO errors
    /// IO error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a remote service error with a message.
    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    /// Create a protocol error for a malformed reply.
    pub fn protocol(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a mount error with a message.
    pub fn mount(msg: impl Into<String>) -> Self {
        Self::Mount(msg.into())
    }

    /// Create a command failed error.
    pub fn command_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Error text is what the container engine shows the user, so it must
    /// carry the volume and the reason.

    #[test]
    fn test_remote_error_is_verbatim() {
        let err = Error::remote("Volume vol1 already exists");
        assert_eq!(err.to_string(), "Volume vol1 already exists");
    }

    #[test]
    fn test_volume_in_use_includes_name_and_count() {
        let err = Error::VolumeInUse {
            name: "vol1".to_string(),
            refcnt: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("still mounted"));
        assert!(msg.contains("volume=vol1"));
        assert!(msg.contains("refcount=2"));
    }

    #[test]
    fn test_unsupported_filesystem_lists_alternatives() {
        let err = Error::UnsupportedFilesystem {
            fstype: "zfs".to_string(),
            supported: "ext4, xfs".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("zfs"));
        assert!(msg.contains("ext4, xfs"));
    }

    #[test]
    fn test_transport_error_is_transparent() {
        let err = Error::from(TransportError::BindExhausted {
            first: 100,
            last: 1023,
        });
        assert!(err.to_string().contains("100"));
        assert!(err.to_string().contains("1023"));
    }

    #[test]
    fn test_command_failed_includes_command_and_message() {
        let err = Error::command_failed("mkfs.ext4", "device busy");
        let msg = err.to_string();
        assert!(msg.contains("mkfs.ext4"));
        assert!(msg.contains("device busy"));
    }
}
