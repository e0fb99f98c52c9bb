#![doc = include_str!("../README.md")]

pub mod cap_table;
pub mod embargo;
pub mod error;
pub mod limits;
pub mod peer;
pub mod planner;
pub mod provide_accept;
pub mod question_answer;
pub mod slab;

pub use cap_table::{CapabilityHandler, Export, Import, InboundCapTable, PendingCall, Resolution, ResolvedCap};
pub use embargo::Embargoes;
pub use error::{Reason, RpcError};
pub use limits::PeerLimits;
pub use peer::{descriptor_to_resolved_cap, CallOutcome, Peer, PeerEffects};
pub use planner::{plan_imported_target, plan_promised_target, ForwardReturnMode, ImportedTargetPlan, PromisedTargetPlan};
pub use provide_accept::{InsertJoinPartOutcome, JoinOutcome, JoinTable, ProvideOutcome, ProvideTable};
pub use question_answer::{Answer, AnswerState, Question, QuestionDisposition, QuestionState};
pub use slab::IdTable;
