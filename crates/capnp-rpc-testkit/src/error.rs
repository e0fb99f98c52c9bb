use std::fmt;

/// The test bridge's own ceiling, enforced before a pushed frame ever
/// reaches a `Peer`'s decoder — production code configures this through
/// `capnp-rpc-io::IoLimits` instead, but the bridge has no I/O layer of its
/// own to put the check in.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug)]
pub enum BridgeError {
    /// A pushed frame exceeded `MAX_FRAME_BYTES`; the bridge's queues are
    /// left exactly as they were, no partial frame is recorded.
    FrameTooLarge { bytes: usize },
    Rpc(capnp_rpc_core::RpcError),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::FrameTooLarge { bytes } => {
                write!(f, "frame of {bytes} bytes exceeds the {MAX_FRAME_BYTES}-byte test bridge limit")
            }
            BridgeError::Rpc(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BridgeError::FrameTooLarge { .. } => None,
            BridgeError::Rpc(e) => Some(e),
        }
    }
}

impl From<capnp_rpc_core::RpcError> for BridgeError {
    fn from(e: capnp_rpc_core::RpcError) -> Self {
        BridgeError::Rpc(e)
    }
}
