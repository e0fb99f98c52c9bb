use std::fmt;

/// Errors surfaced while reading or writing frames over a byte stream.
#[derive(Debug)]
pub enum IoError {
    /// The underlying stream returned an error, or closed mid-frame.
    Io(std::io::Error),
    /// A frame's buffered byte count exceeded `IoLimits::max_frame_bytes`
    /// before a complete frame could be recognized.
    OversizeFrame { limit: u64 },
    /// A complete frame failed to decode below the segment-table layer.
    Decode(capnp_message::DecodeError),
    /// A `Peer`'s outbound message failed to encode.
    Encode(capnp_message::EncodeError),
    /// Dispatching an inbound frame through the peer failed.
    Rpc(capnp_rpc_core::RpcError),
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::Io(e) => write!(f, "{e}"),
            IoError::OversizeFrame { limit } => write!(f, "frame exceeded the {limit}-byte limit before it could be decoded"),
            IoError::Decode(e) => write!(f, "{e}"),
            IoError::Encode(e) => write!(f, "{e}"),
            IoError::Rpc(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IoError::Io(e) => Some(e),
            IoError::OversizeFrame { .. } => None,
            IoError::Decode(e) => Some(e),
            IoError::Encode(e) => Some(e),
            IoError::Rpc(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for IoError {
    fn from(e: std::io::Error) -> Self {
        IoError::Io(e)
    }
}

impl From<capnp_message::DecodeError> for IoError {
    fn from(e: capnp_message::DecodeError) -> Self {
        IoError::Decode(e)
    }
}

impl From<capnp_message::EncodeError> for IoError {
    fn from(e: capnp_message::EncodeError) -> Self {
        IoError::Encode(e)
    }
}

impl From<capnp_rpc_core::RpcError> for IoError {
    fn from(e: capnp_rpc_core::RpcError) -> Self {
        IoError::Rpc(e)
    }
}
