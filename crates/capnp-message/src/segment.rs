//! Segment storage and far-pointer resolution.

use bytes::Bytes;

use crate::error::DecodeError;
use crate::pointer::{decode_pointer, ElementSize, WirePointer};

/// A read-only Cap'n Proto message: an ordered set of 8-byte-aligned
/// segments.
#[derive(Debug, Clone)]
pub struct MessageReader {
    segments: Vec<Bytes>,
}

impl MessageReader {
    pub fn new(segments: Vec<Bytes>) -> Self {
        Self { segments }
    }

    /// Build a reader over a single segment (the common case for messages
    /// built in one shot by [`crate::builder::MessageBuilder`]).
    pub fn single_segment(bytes: Bytes) -> Self {
        Self::new(vec![bytes])
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segment(&self, id: u32) -> Result<&Bytes, DecodeError> {
        self.segments
            .get(id as usize)
            .ok_or(DecodeError::UnknownSegment { segment_id: id })
    }

    /// Read the 64-bit little-endian word at `word_index` in `segment_id`.
    pub fn read_word(&self, segment_id: u32, word_index: u64) -> Result<u64, DecodeError> {
        let seg = self.segment(segment_id)?;
        let byte_offset = word_index
            .checked_mul(8)
            .ok_or(DecodeError::OutOfBounds {
                segment_id,
                word_offset: word_index as i64,
                words_needed: 1,
                segment_words: seg.len() / 8,
            })? as usize;
        let end = byte_offset + 8;
        if end > seg.len() {
            return Err(DecodeError::OutOfBounds {
                segment_id,
                word_offset: word_index as i64,
                words_needed: 1,
                segment_words: seg.len() / 8,
            });
        }
        Ok(u64::from_le_bytes(seg[byte_offset..end].try_into().unwrap()))
    }

    /// The root pointer: word 0 of segment 0.
    pub fn root(&self) -> Result<Resolved, DecodeError> {
        resolve_pointer(self, 0, 0)
    }

    fn check_range(&self, segment_id: u32, start_word: u64, word_count: u64) -> Result<(), DecodeError> {
        let seg = self.segment(segment_id)?;
        let segment_words = (seg.len() / 8) as u64;
        let end = start_word.checked_add(word_count);
        match end {
            Some(end) if end <= segment_words => Ok(()),
            _ => Err(DecodeError::OutOfBounds {
                segment_id,
                word_offset: start_word as i64,
                words_needed: word_count,
                segment_words: segment_words as usize,
            }),
        }
    }
}

/// A pointer word resolved to its content, after following far-pointer
/// indirection (at most two hops).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    Null,
    Struct {
        segment_id: u32,
        content_word: u64,
        data_words: u16,
        pointer_words: u16,
    },
    List {
        segment_id: u32,
        content_word: u64,
        element_size: ElementSize,
        element_count: u32,
    },
    Capability {
        index: u32,
    },
}

/// Resolve the pointer word at `(segment_id, word_index)`, following far
/// pointers up to two hops.
pub fn resolve_pointer(
    msg: &MessageReader,
    mut segment_id: u32,
    mut word_index: u64,
) -> Result<Resolved, DecodeError> {
    let mut far_hops = 0u8;
    loop {
        let word = msg.read_word(segment_id, word_index)?;
        match decode_pointer(word)? {
            WirePointer::Null => return Ok(Resolved::Null),
            WirePointer::Struct {
                offset,
                data_words,
                pointer_words,
            } => {
                let content_word = offset_word(word_index + 1, offset, segment_id)?;
                msg.check_range(segment_id, content_word, data_words as u64 + pointer_words as u64)?;
                return Ok(Resolved::Struct {
                    segment_id,
                    content_word,
                    data_words,
                    pointer_words,
                });
            }
            WirePointer::List {
                offset,
                element_size,
                element_count,
            } => {
                let content_word = offset_word(word_index + 1, offset, segment_id)?;
                return Ok(Resolved::List {
                    segment_id,
                    content_word,
                    element_size,
                    element_count,
                });
            }
            WirePointer::Capability { index } => return Ok(Resolved::Capability { index }),
            WirePointer::Far {
                double_far,
                landing_pad_offset,
                segment_id: target_segment,
            } => {
                far_hops += 1;
                if far_hops > 2 {
                    return Err(DecodeError::FarPointerChainTooLong);
                }
                if !double_far {
                    if target_segment == segment_id && landing_pad_offset as u64 == word_index {
                        return Err(DecodeError::SelfReferentialFarPointer);
                    }
                    segment_id = target_segment;
                    word_index = landing_pad_offset as u64;
                    continue;
                } else {
                    let pad0 = msg.read_word(target_segment, landing_pad_offset as u64)?;
                    let pad1 = msg.read_word(target_segment, landing_pad_offset as u64 + 1)?;
                    let (content_segment, content_word) = match decode_pointer(pad0)? {
                        WirePointer::Far {
                            double_far: false,
                            landing_pad_offset: off2,
                            segment_id: seg2,
                        } => (seg2, off2 as u64),
                        _ => return Err(DecodeError::FarPointerChainTooLong),
                    };
                    return match decode_pointer(pad1)? {
                        WirePointer::Struct {
                            data_words,
                            pointer_words,
                            ..
                        } => {
                            msg.check_range(
                                content_segment,
                                content_word,
                                data_words as u64 + pointer_words as u64,
                            )?;
                            Ok(Resolved::Struct {
                                segment_id: content_segment,
                                content_word,
                                data_words,
                                pointer_words,
                            })
                        }
                        WirePointer::List {
                            element_size,
                            element_count,
                            ..
                        } => Ok(Resolved::List {
                            segment_id: content_segment,
                            content_word,
                            element_size,
                            element_count,
                        }),
                        other => Err(DecodeError::InvalidPointerTag {
                            tag: match other {
                                WirePointer::Capability { .. } => 0b11,
                                _ => 0b10,
                            },
                        }),
                    };
                }
            }
        }
    }
}

fn offset_word(base: u64, offset: i32, segment_id: u32) -> Result<u64, DecodeError> {
    let target = base as i64 + offset as i64;
    if target < 0 {
        return Err(DecodeError::OutOfBounds {
            segment_id,
            word_offset: target,
            words_needed: 0,
            segment_words: 0,
        });
    }
    Ok(target as u64)
}
