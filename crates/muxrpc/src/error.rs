use thiserror::Error;

use crate::frame::StreamId;
use crate::status::Status;

/// Errors raised while reading or writing frames on a connection.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FrameError {
    /// The underlying byte stream failed.
    #[error("connection I/O error")]
    Io(#[from] std::io::Error),

    /// The length prefix announces more bytes than the connection accepts.
    #[error("frame length {len} exceeds the maximum of {max}")]
    TooLarge { len: usize, max: usize },

    /// The length prefix is too short to hold a frame header.
    #[error("frame length {0} is shorter than the frame header")]
    TooSmall(usize),

    /// A well-delimited frame carried a kind this side does not understand.
    #[error("unknown frame kind {kind} on stream {stream_id}")]
    UnknownKind { stream_id: StreamId, kind: u8 },

    /// The peer closed the byte stream between frames.
    #[error("connection closed by peer")]
    Closed,

    /// The peer closed the byte stream in the middle of a frame.
    #[error("connection closed in the middle of a frame")]
    Truncated,
}

impl FrameError {
    /// Whether the error leaves the read side out of sync, so the whole
    /// connection has to be torn down.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FrameError::UnknownKind { .. })
    }
}

impl From<&FrameError> for Status {
    fn from(err: &FrameError) -> Self {
        match err {
            FrameError::TooLarge { .. } | FrameError::TooSmall(_) => {
                Status::internal(format!("frame desync: {err}"))
            }
            FrameError::UnknownKind { .. } => Status::internal(err.to_string()),
            FrameError::Io(e) => Status::unavailable(format!("connection lost: {e}")),
            FrameError::Closed | FrameError::Truncated => Status::unavailable(err.to_string()),
        }
    }
}

impl From<FrameError> for Status {
    fn from(err: FrameError) -> Self {
        Status::from(&err)
    }
}

/// Errors raised by a message codec.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    /// Failed to encode a protobuf message.
    #[error("protobuf encode error")]
    Encode(#[from] prost::EncodeError),

    /// Failed to decode a protobuf message.
    #[error("protobuf decode error")]
    Decode(#[from] prost::DecodeError),

    /// A codec other than the protobuf one rejected the input.
    #[error("codec error: {0}")]
    Other(String),
}

impl From<CodecError> for Status {
    fn from(err: CodecError) -> Self {
        match &err {
            CodecError::Encode(e) => Status::internal(format!("failed to encode message: {e}")),
            CodecError::Decode(e) => Status::internal(format!("failed to decode message: {e}")),
            CodecError::Other(msg) => Status::internal(msg.clone()),
        }
    }
}

/// Errors that can occur while parsing method paths.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PathError {
    #[error("invalid method path: {0}")]
    Invalid(String),
}

/// Errors that can occur while registering handlers on a router.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// The service or method name does not form a valid path.
    #[error(transparent)]
    Path(#[from] PathError),

    /// A handler is already registered for this path.
    #[error("handler already registered for '{0}'")]
    DuplicateHandler(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;

    #[test]
    fn test_desync_is_internal_and_fatal() {
        let err = FrameError::TooLarge { len: 10, max: 5 };
        assert!(err.is_fatal());
        assert_eq!(Status::from(&err).code(), Code::Internal);
    }

    #[test]
    fn test_network_loss_is_unavailable() {
        let err = FrameError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(err.is_fatal());
        assert_eq!(Status::from(err).code(), Code::Unavailable);
        assert_eq!(Status::from(FrameError::Truncated).code(), Code::Unavailable);
    }

    #[test]
    fn test_unknown_kind_is_per_stream() {
        let err = FrameError::UnknownKind {
            stream_id: 3,
            kind: 42,
        };
        assert!(!err.is_fatal());
        assert_eq!(Status::from(&err).code(), Code::Internal);
    }
}
