//! Error types for segment framing, pointer resolution, and struct/list access.

use std::fmt;

/// Errors that can occur while decoding a pointer or resolving it to content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// A far pointer pointed at another far pointer landing pad, which
    /// itself was a far pointer (more than two hops).
    FarPointerChainTooLong,
    /// A far pointer's landing pad pointed back at the same location it
    /// came from.
    SelfReferentialFarPointer,
    /// A pointer referenced a segment id that doesn't exist in the message.
    UnknownSegment { segment_id: u32 },
    /// A pointer's computed target falls outside the bounds of its segment.
    OutOfBounds {
        segment_id: u32,
        word_offset: i64,
        words_needed: u64,
        segment_words: usize,
    },
    /// An inline-composite list's tag word claimed an element size that
    /// doesn't fit the list's declared word count.
    InvalidInlineCompositeTag,
    /// The frame header claimed a segment count of zero.
    ZeroSegmentCount,
    /// The byte slice ended before the declared frame contents did.
    TruncatedFrame,
    /// A capability pointer referenced a slot outside the call's cap table.
    InvalidCapabilityIndex { index: u32, table_len: usize },
    /// A pointer word's tag bits didn't correspond to a known pointer kind.
    InvalidPointerTag { tag: u8 },
    /// `readTextStrict` found bytes that are not valid UTF-8.
    InvalidUtf8,
    /// A NULL pointer was read where a capability was required.
    InvalidPointer,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::FarPointerChainTooLong => {
                write!(f, "far pointer chain exceeded two hops")
            }
            DecodeError::SelfReferentialFarPointer => {
                write!(f, "far pointer landing pad is self-referential")
            }
            DecodeError::UnknownSegment { segment_id } => {
                write!(f, "pointer referenced unknown segment {segment_id}")
            }
            DecodeError::OutOfBounds {
                segment_id,
                word_offset,
                words_needed,
                segment_words,
            } => write!(
                f,
                "pointer target out of bounds: segment {segment_id} offset {word_offset} needs {words_needed} words, segment has {segment_words}"
            ),
            DecodeError::InvalidInlineCompositeTag => {
                write!(f, "inline-composite list tag word is inconsistent with the list's word count")
            }
            DecodeError::ZeroSegmentCount => write!(f, "frame header declared zero segments"),
            DecodeError::TruncatedFrame => write!(f, "frame ended before declared content"),
            DecodeError::InvalidCapabilityIndex { index, table_len } => write!(
                f,
                "capability index {index} out of range for cap table of length {table_len}"
            ),
            DecodeError::InvalidPointerTag { tag } => write!(f, "invalid pointer tag {tag}"),
            DecodeError::InvalidUtf8 => write!(f, "text field is not valid UTF-8"),
            DecodeError::InvalidPointer => write!(f, "expected a non-null pointer"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors from the strict builder variants that must fail loudly instead of
/// silently dropping out-of-range writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutOfBounds {
    /// The data-section offset being written is past the struct's data word
    /// count.
    DataOffset { byte_offset: usize, data_words: u16 },
    /// The pointer-section index being written is past the struct's pointer
    /// word count.
    PointerIndex { index: u16, pointer_words: u16 },
}

impl fmt::Display for OutOfBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutOfBounds::DataOffset {
                byte_offset,
                data_words,
            } => write!(
                f,
                "data write at byte offset {byte_offset} exceeds struct data section of {data_words} words"
            ),
            OutOfBounds::PointerIndex {
                index,
                pointer_words,
            } => write!(
                f,
                "pointer write at index {index} exceeds struct pointer section of {pointer_words} words"
            ),
        }
    }
}

impl std::error::Error for OutOfBounds {}

/// Errors from encoding a message builder into a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// A single segment grew past `u32::MAX` words, which cannot be
    /// represented in the frame header.
    SegmentTooLarge { segment_id: u32, words: u64 },
    /// The message has more segments than the frame header can address.
    TooManySegments { count: usize },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::SegmentTooLarge { segment_id, words } => write!(
                f,
                "segment {segment_id} grew to {words} words, which overflows the frame header"
            ),
            EncodeError::TooManySegments { count } => {
                write!(f, "message has {count} segments, more than the frame header can address")
            }
        }
    }
}

impl std::error::Error for EncodeError {}
