#![doc = include_str!("../README.md")]

pub mod bridge;
pub mod effects;
pub mod error;

pub use bridge::{pump, Bridge};
pub use effects::{decode_return_frame, CapturedReturn, RecordingEffects, StubBootstrapHandler};
pub use error::{BridgeError, MAX_FRAME_BYTES};
