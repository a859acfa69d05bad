//! Error type shared by every layer of the QCOW reader.

use std::io;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, QcowError>;

/// Everything that can go wrong while opening or reading a QCOW image.
///
/// Callers are expected to branch on the variant. The messages are meant for
/// humans and are not part of the contract.
#[derive(Debug, thiserror::Error)]
pub enum QcowError {
    /// The operation needs a state the handle is not in (e.g. `read` on a
    /// closed file, `set_password` on an open one).
    #[error("Invalid state: cannot {operation} while the file is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
    /// A seek or positioned read would put the cursor before the start of the
    /// media (or outside the representable range).
    #[error("Invalid offset: {0}")]
    InvalidOffset(i64),
    /// Unrecognized whence value, wrong key length, oversized read request…
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    /// The image is encrypted and no usable credential was supplied.
    #[error("Credential error: {0}")]
    Credential(String),
    /// The underlying byte source could not be opened or queried.
    #[error("Unable to access source: {0}")]
    Access(#[source] io::Error),
    /// `open` was called on a handle that is already open.
    #[error("File is already open")]
    AlreadyOpen,
    /// The image is corrupt or uses a feature this reader does not support.
    #[error("Invalid Format: {0}")]
    Format(String),
    /// Reading from the byte source failed.
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),
}

impl QcowError {
    pub(crate) fn closed(operation: &'static str) -> Self {
        QcowError::InvalidState {
            operation,
            state: "closed",
        }
    }

    pub(crate) fn open(operation: &'static str) -> Self {
        QcowError::InvalidState {
            operation,
            state: "open",
        }
    }
}

impl From<QcowError> for io::Error {
    fn from(e: QcowError) -> Self {
        let kind = match &e {
            QcowError::Io(inner) | QcowError::Access(inner) => inner.kind(),
            QcowError::InvalidOffset(_) | QcowError::InvalidArgument(_) => {
                io::ErrorKind::InvalidInput
            }
            QcowError::Format(_) => io::ErrorKind::InvalidData,
            QcowError::Credential(_) => io::ErrorKind::PermissionDenied,
            QcowError::InvalidState { .. } | QcowError::AlreadyOpen => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_kind_mapping() {
        let err: io::Error = QcowError::InvalidOffset(-1).into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let err: io::Error = QcowError::Format("bad signature".into()).into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let err: io::Error =
            QcowError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "short")).into();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_invalid_state_message() {
        let err = QcowError::closed("seek");
        assert_eq!(
            err.to_string(),
            "Invalid state: cannot seek while the file is closed"
        );
    }
}
