use std::fmt;

/// Errors from parsing a frame as the RPC message union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
    /// The root struct's discriminant did not match the variant the
    /// caller asked for.
    UnexpectedMessage { expected: &'static str, found: u8 },
    /// The discriminant byte did not correspond to any known message kind.
    UnknownMessageKind { tag: u8 },
    /// A capability descriptor's discriminant was not recognized.
    UnknownCapDescriptor { tag: u8 },
    /// A message target's discriminant was not recognized.
    UnknownMessageTarget { tag: u8 },
    /// A return variant's discriminant was not recognized.
    UnknownReturnVariant { tag: u8 },
    /// A disembargo context's discriminant was not recognized.
    UnknownDisembargoContext { tag: u8 },
    /// A pipeline transform op's discriminant was not recognized.
    UnknownPipelineOp { tag: u8 },
    Decode(capnp_message::DecodeError),
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtoError::UnexpectedMessage { expected, found } => {
                write!(f, "expected a {expected} message, found tag {found}")
            }
            ProtoError::UnknownMessageKind { tag } => write!(f, "unknown message kind tag {tag}"),
            ProtoError::UnknownCapDescriptor { tag } => {
                write!(f, "unknown capability descriptor tag {tag}")
            }
            ProtoError::UnknownMessageTarget { tag } => write!(f, "unknown message target tag {tag}"),
            ProtoError::UnknownReturnVariant { tag } => write!(f, "unknown return variant tag {tag}"),
            ProtoError::UnknownDisembargoContext { tag } => {
                write!(f, "unknown disembargo context tag {tag}")
            }
            ProtoError::UnknownPipelineOp { tag } => write!(f, "unknown pipeline op tag {tag}"),
            ProtoError::Decode(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ProtoError {}

impl From<capnp_message::DecodeError> for ProtoError {
    fn from(e: capnp_message::DecodeError) -> Self {
        ProtoError::Decode(e)
    }
}
