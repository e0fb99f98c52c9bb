#![doc = include_str!("../README.md")]

//! Re-exports the workspace's four layers under one crate: the wire codec,
//! the protocol message union, the peer state machine, and the tokio
//! framing adapter. Each layer also stays independently usable as its own
//! crate for an embedder that only needs part of the stack (e.g. a custom
//! transport that wants `capnp-rpc-core` without `capnp-rpc-io`'s tokio
//! dependency).

pub use capnp_rpc_core::{
    descriptor_to_resolved_cap, plan_imported_target, plan_promised_target, Answer, AnswerState, CallOutcome,
    CapabilityHandler, Export, ForwardReturnMode, IdTable, Import, ImportedTargetPlan, InboundCapTable,
    InsertJoinPartOutcome, JoinOutcome, JoinTable, PendingCall, Peer, PeerEffects, PeerLimits, PromisedTargetPlan,
    ProvideOutcome, ProvideTable, Question, QuestionDisposition, QuestionState, Reason, Resolution, ResolvedCap,
    RpcError,
};

pub use capnp_rpc_io::{FrameReader, FrameWriter, IoError, IoLimits, PeerDriver};

/// The Cap'n Proto Level 3 message union: typed readers/builders over
/// `Bootstrap`/`Call`/`Return`/`Finish`/`Resolve`/`Release`/`Disembargo`/
/// `Provide`/`Accept`/`Join`/`Abort`/`Unimplemented`, and the capability
/// descriptor/message target types every one of them carries.
pub mod message {
    pub use capnp_rpc_proto::{
        build_abort, build_accept, build_bootstrap, build_disembargo, build_finish, build_join, build_provide,
        build_release, build_resolve_cap, build_resolve_exception, build_unimplemented, AbortReader, AcceptReader,
        BootstrapReader, CallBuilder, CallReader, CapDescriptor, DecodedMessage, DisembargoContext, DisembargoReader,
        FinishReader, JoinReader, MessageKind, MessageTarget, PayloadBuilder, PayloadReader, PipelineOp, ProtoError,
        ProvideReader, ReleaseReader, ResolveOutcome, ResolveReader, ReturnBuilder, ReturnReader, ReturnVariantTag,
        SendResultsTo,
    };
}

/// The underlying segment/pointer wire codec, independent of the RPC
/// message schema built on top of it. Most embedders won't need this
/// directly — `message` and the `Peer` API operate on whole frames — but
/// it's here for anything inspecting raw segments.
pub mod wire {
    pub use capnp_message::{
        decode_frame, decode_pointer, encode_frame, encode_pointer, AnyPointerReader, DecodeError, ElementSize,
        EncodeError, ListBuilder, ListReader, MessageBuilder, MessageReader, OutOfBounds, Resolved, StructBuilder,
        StructListBuilder, StructReader, WirePointer,
    };
}

/// Convenience imports for an embedder wiring up a `Peer` behind a real
/// transport.
///
/// ```ignore
/// use capnp_rpc::prelude::*;
/// ```
pub mod prelude {
    pub use crate::message::{CapDescriptor, MessageTarget, PayloadBuilder, PayloadReader};
    pub use crate::{CallOutcome, CapabilityHandler, Peer, PeerDriver, PeerEffects, PeerLimits};
}
