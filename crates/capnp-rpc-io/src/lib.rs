#![doc = include_str!("../README.md")]

pub mod driver;
pub mod error;
pub mod framing;
pub mod limits;

pub use driver::PeerDriver;
pub use error::IoError;
pub use framing::{FrameReader, FrameWriter};
pub use limits::IoLimits;
