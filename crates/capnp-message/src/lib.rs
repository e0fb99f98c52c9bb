//! Cap'n Proto message encoding: segment framing, the pointer codec, and
//! typed reader/builder accessors, independent of any particular schema or
//! of the RPC protocol built on top of it.

pub mod builder;
pub mod error;
pub mod frame;
pub mod pointer;
pub mod reader;
pub mod segment;

pub use builder::{ListBuilder, MessageBuilder, StructBuilder, StructListBuilder};
pub use error::{DecodeError, EncodeError, OutOfBounds};
pub use frame::{decode_frame, encode_frame};
pub use pointer::{decode_pointer, encode_pointer, ElementSize, WirePointer};
pub use reader::{AnyPointerReader, ListReader, StructReader};
pub use segment::{resolve_pointer, MessageReader, Resolved};
