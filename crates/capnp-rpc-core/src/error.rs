use std::fmt;

/// Exact reason strings from the protocol's error contract. Other
/// implementations match on these strings, so they are never localized
/// and never routed through `Display` formatting that could drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    UnknownCapability,
    UnknownPromisedCapability,
    PromisedCapabilityUnresolved,
    PromiseBroken,
    MissingExportHandler,
    MissingPromisedCapabilityHandler,
    UnknownProvision,
    JoinMismatch,
    DuplicateProvideQuestion,
    DuplicateProvideRecipient,
    DuplicateJoinQuestion,
    ProvideMissingRecipient,
    BootstrapStub,
}

impl Reason {
    pub fn reason_str(self) -> &'static str {
        match self {
            Reason::UnknownCapability => "unknown capability",
            Reason::UnknownPromisedCapability => "unknown promised capability",
            Reason::PromisedCapabilityUnresolved => "promised capability unresolved",
            Reason::PromiseBroken => "promise broken",
            Reason::MissingExportHandler => "missing export handler",
            Reason::MissingPromisedCapabilityHandler => "missing promised capability handler",
            Reason::UnknownProvision => "unknown provision",
            Reason::JoinMismatch => "join target mismatch",
            Reason::DuplicateProvideQuestion => "duplicate provide question",
            Reason::DuplicateProvideRecipient => "duplicate provide recipient",
            Reason::DuplicateJoinQuestion => "duplicate join question",
            Reason::ProvideMissingRecipient => "provide missing recipient",
            Reason::BootstrapStub => "bootstrap stub",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason_str())
    }
}

/// Errors the peer surfaces directly to its caller (not as a per-question
/// `Return.exception`, which goes out over the wire instead).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// A frame failed to parse, or referenced an unknown/duplicate id in a
    /// way that violates the protocol. The caller should send `Abort` and
    /// close the transport; the peer does not do this itself since closing
    /// the transport is the I/O adapter's job.
    ProtocolViolation(String),
    /// Sending would exceed `PeerLimits::max_outbound_frames`.
    OutgoingQueueLimitExceeded,
    /// Sending would exceed `PeerLimits::max_outbound_bytes`.
    OutgoingBytesLimitExceeded,
    /// Writing into an outbound message builder failed (pointer out of
    /// range, etc).
    Encode(capnp_message::OutOfBounds),
    /// Framing a finished message builder into wire bytes failed.
    FrameEncode(capnp_message::EncodeError),
    /// Decoding an inbound frame failed below the message-union layer.
    Decode(capnp_rpc_proto::ProtoError),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::ProtocolViolation(msg) => write!(f, "protocol violation: {msg}"),
            RpcError::OutgoingQueueLimitExceeded => write!(f, "outgoing queue limit exceeded"),
            RpcError::OutgoingBytesLimitExceeded => write!(f, "outgoing bytes limit exceeded"),
            RpcError::Encode(e) => write!(f, "{e}"),
            RpcError::FrameEncode(e) => write!(f, "{e}"),
            RpcError::Decode(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RpcError {}

impl From<capnp_message::OutOfBounds> for RpcError {
    fn from(e: capnp_message::OutOfBounds) -> Self {
        RpcError::Encode(e)
    }
}

impl From<capnp_message::EncodeError> for RpcError {
    fn from(e: capnp_message::EncodeError) -> Self {
        RpcError::FrameEncode(e)
    }
}

impl From<capnp_rpc_proto::ProtoError> for RpcError {
    fn from(e: capnp_rpc_proto::ProtoError) -> Self {
        RpcError::Decode(e)
    }
}
