use bytes::{Bytes, BytesMut};
use prost::Message;
use std::fmt;

/// Canonical outcome codes carried by every terminal call status.
///
/// Numeric values follow the widely used canonical RPC numbering so that
/// statuses stay recognisable in logs and packet captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Code {
    Ok,
    Cancelled,
    InvalidArgument,
    DeadlineExceeded,
    ResourceExhausted,
    Unimplemented,
    Internal,
    Unavailable,
}

impl Code {
    pub const CODE_OK: u32 = 0;
    pub const CODE_CANCELLED: u32 = 1;
    pub const CODE_INVALID_ARGUMENT: u32 = 3;
    pub const CODE_DEADLINE_EXCEEDED: u32 = 4;
    pub const CODE_RESOURCE_EXHAUSTED: u32 = 8;
    pub const CODE_UNIMPLEMENTED: u32 = 12;
    pub const CODE_INTERNAL: u32 = 13;
    pub const CODE_UNAVAILABLE: u32 = 14;

    pub fn to_u32(self) -> u32 {
        match self {
            Code::Ok => Self::CODE_OK,
            Code::Cancelled => Self::CODE_CANCELLED,
            Code::InvalidArgument => Self::CODE_INVALID_ARGUMENT,
            Code::DeadlineExceeded => Self::CODE_DEADLINE_EXCEEDED,
            Code::ResourceExhausted => Self::CODE_RESOURCE_EXHAUSTED,
            Code::Unimplemented => Self::CODE_UNIMPLEMENTED,
            Code::Internal => Self::CODE_INTERNAL,
            Code::Unavailable => Self::CODE_UNAVAILABLE,
        }
    }

    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            Self::CODE_OK => Some(Code::Ok),
            Self::CODE_CANCELLED => Some(Code::Cancelled),
            Self::CODE_INVALID_ARGUMENT => Some(Code::InvalidArgument),
            Self::CODE_DEADLINE_EXCEEDED => Some(Code::DeadlineExceeded),
            Self::CODE_RESOURCE_EXHAUSTED => Some(Code::ResourceExhausted),
            Self::CODE_UNIMPLEMENTED => Some(Code::Unimplemented),
            Self::CODE_INTERNAL => Some(Code::Internal),
            Self::CODE_UNAVAILABLE => Some(Code::Unavailable),
            _ => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Code::Ok => "ok",
            Code::Cancelled => "cancelled",
            Code::InvalidArgument => "invalid argument",
            Code::DeadlineExceeded => "deadline exceeded",
            Code::ResourceExhausted => "resource exhausted",
            Code::Unimplemented => "unimplemented",
            Code::Internal => "internal error",
            Code::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// The terminal outcome of a call: a code, a human readable message and an
/// opaque details blob owned by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: Code,
    message: String,
    details: Bytes,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Bytes::new(),
        }
    }

    /// Attach structured details. The format is owned by the application.
    pub fn with_details(mut self, details: impl Into<Bytes>) -> Self {
        self.details = details.into();
        self
    }

    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> &Bytes {
        &self.details
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }

    /// Encode the status as a trailer or cancel payload.
    pub fn to_wire(&self) -> Bytes {
        let proto = StatusProto {
            code: self.code.to_u32(),
            message: self.message.clone(),
            details: self.details.clone(),
        };
        let mut buf = BytesMut::with_capacity(proto.encoded_len());
        // BytesMut grows on demand, so encoding cannot run out of space.
        let _ = proto.encode(&mut buf);
        buf.freeze()
    }

    /// Decode a status payload received from the peer.
    ///
    /// A payload that does not parse is itself a fault on that call and is
    /// reported as `INTERNAL`, as is a code outside the canonical set.
    pub fn from_wire(payload: Bytes) -> Self {
        let proto = match StatusProto::decode(payload) {
            Ok(proto) => proto,
            Err(e) => return Status::internal(format!("malformed status payload: {e}")),
        };

        match Code::from_u32(proto.code) {
            Some(code) => Status {
                code,
                message: proto.message,
                details: proto.details,
            },
            None => Status::internal(format!(
                "unknown status code {}: {}",
                proto.code, proto.message
            ))
            .with_details(proto.details),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "status: {}", self.code)
        } else {
            write!(f, "status: {}, message: {}", self.code, self.message)
        }
    }
}

impl std::error::Error for Status {}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct StatusProto {
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(bytes = "bytes", tag = "3")]
    pub details: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_numbers_are_stable() {
        assert_eq!(Code::Ok.to_u32(), 0);
        assert_eq!(Code::DeadlineExceeded.to_u32(), 4);
        assert_eq!(Code::Unimplemented.to_u32(), 12);
        assert_eq!(Code::Unavailable.to_u32(), 14);
        assert_eq!(Code::from_u32(8), Some(Code::ResourceExhausted));
        assert_eq!(Code::from_u32(2), None);
    }

    #[test]
    fn test_status_wire_keeps_details() {
        let status = Status::invalid_argument("bad field").with_details(&b"\x01\x02"[..]);
        let decoded = Status::from_wire(status.to_wire());
        assert_eq!(decoded, status);
    }

    #[test]
    fn test_empty_payload_is_ok() {
        let decoded = Status::from_wire(Bytes::new());
        assert!(decoded.is_ok());
    }

    #[test]
    fn test_unknown_code_maps_to_internal() {
        let proto = StatusProto {
            code: 99,
            message: "mystery".into(),
            details: Bytes::new(),
        };
        let decoded = Status::from_wire(proto.encode_to_vec().into());
        assert_eq!(decoded.code(), Code::Internal);
        assert!(decoded.message().contains("99"));
    }

    #[test]
    fn test_garbage_payload_maps_to_internal() {
        let decoded = Status::from_wire(Bytes::from_static(&[0xff, 0xff, 0xff]));
        assert_eq!(decoded.code(), Code::Internal);
    }
}
