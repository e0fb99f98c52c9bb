//! Typed reader/builder views over the Cap'n Proto Level 3 RPC message
//! union, built on top of `capnp-message`'s generic struct/list accessors.

pub mod cap_descriptor;
pub mod error;
pub mod message;

pub use cap_descriptor::{CapDescriptor, MessageTarget, PayloadBuilder, PayloadReader, PipelineOp};
pub use error::ProtoError;
pub use message::{
    build_abort, build_accept, build_bootstrap, build_disembargo, build_finish, build_join,
    build_provide, build_release, build_resolve_cap, build_resolve_exception, build_unimplemented,
    AbortReader, AcceptReader, BootstrapReader, CallBuilder, CallReader, DecodedMessage,
    DisembargoContext, DisembargoReader, FinishReader, JoinReader, MessageKind, ProvideReader,
    ReleaseReader, ResolveOutcome, ResolveReader, ReturnBuilder, ReturnReader, ReturnVariantTag,
    SendResultsTo,
};
