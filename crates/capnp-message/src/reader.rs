//! Typed accessors over a resolved pointer: structs, lists, text, data, and
//! capability slots.

use crate::error::DecodeError;
use crate::pointer::ElementSize;
use crate::segment::{resolve_pointer, MessageReader, Resolved};

/// A pointer slot that hasn't been interpreted as struct, list, or
/// capability yet. Resolving a NULL pointer here is not an error; callers
/// ask for the shape they expect and get schema-evolution-safe defaults
/// back (an empty struct, a zero-length list, an empty string).
#[derive(Clone, Copy)]
pub struct AnyPointerReader<'a> {
    msg: &'a MessageReader,
    segment_id: u32,
    word_index: u64,
}

impl<'a> AnyPointerReader<'a> {
    pub fn new(msg: &'a MessageReader, segment_id: u32, word_index: u64) -> Self {
        Self {
            msg,
            segment_id,
            word_index,
        }
    }

    fn resolve(&self) -> Result<Resolved, DecodeError> {
        resolve_pointer(self.msg, self.segment_id, self.word_index)
    }

    pub fn is_null(&self) -> Result<bool, DecodeError> {
        Ok(matches!(self.resolve()?, Resolved::Null))
    }

    /// Interpret this slot as a struct. A NULL pointer reads as a
    /// zero-size struct, matching Cap'n Proto's "absent struct" default.
    pub fn read_struct(&self) -> Result<StructReader<'a>, DecodeError> {
        match self.resolve()? {
            Resolved::Null => Ok(StructReader::empty(self.msg)),
            Resolved::Struct {
                segment_id,
                content_word,
                data_words,
                pointer_words,
            } => Ok(StructReader {
                msg: self.msg,
                segment_id,
                data_word: content_word,
                data_words,
                pointer_word: content_word + data_words as u64,
                pointer_words,
            }),
            other => Err(unexpected("struct", other)),
        }
    }

    /// Interpret this slot as a list. A NULL pointer reads as a zero-length
    /// list of the requested element size.
    pub fn read_list(&self, expected: ElementSize) -> Result<ListReader<'a>, DecodeError> {
        match self.resolve()? {
            Resolved::Null => Ok(ListReader::empty(self.msg, expected)),
            Resolved::List {
                segment_id,
                content_word,
                element_size,
                element_count,
            } => {
                if element_size == ElementSize::InlineComposite {
                    let tag_word = self.msg.read_word(segment_id, content_word)?;
                    let tag = crate::pointer::decode_pointer(tag_word)?;
                    let (data_words, pointer_words, count) = match tag {
                        crate::pointer::WirePointer::Struct {
                            data_words,
                            pointer_words,
                            ..
                        } => (data_words, pointer_words, element_count),
                        _ => return Err(DecodeError::InvalidInlineCompositeTag),
                    };
                    Ok(ListReader {
                        msg: self.msg,
                        segment_id,
                        first_element_word: content_word + 1,
                        element_size,
                        element_count: count,
                        struct_data_words: data_words,
                        struct_pointer_words: pointer_words,
                    })
                } else {
                    Ok(ListReader {
                        msg: self.msg,
                        segment_id,
                        first_element_word: content_word,
                        element_size,
                        element_count,
                        struct_data_words: 0,
                        struct_pointer_words: 0,
                    })
                }
            }
            other => Err(unexpected("list", other)),
        }
    }

    /// Interpret this slot as a capability index into the enclosing
    /// message's capability table.
    pub fn read_capability_index(&self) -> Result<Option<u32>, DecodeError> {
        match self.resolve()? {
            Resolved::Null => Ok(None),
            Resolved::Capability { index } => Ok(Some(index)),
            other => Err(unexpected("capability", other)),
        }
    }

    /// Convenience accessor for a `Text` field: a list of bytes including a
    /// trailing NUL, validated as UTF-8 and returned without it.
    pub fn read_text(&self) -> Result<&'a str, DecodeError> {
        let list = self.read_list(ElementSize::Byte)?;
        let bytes = list.byte_slice()?;
        let without_nul = bytes.strip_suffix(&[0]).unwrap_or(bytes);
        std::str::from_utf8(without_nul).map_err(|_| DecodeError::InvalidUtf8)
    }

    /// Convenience accessor for a `Data` field: a raw byte list.
    pub fn read_data(&self) -> Result<&'a [u8], DecodeError> {
        self.read_list(ElementSize::Byte)?.byte_slice()
    }
}

fn unexpected(expected: &'static str, got: Resolved) -> DecodeError {
    let tag = match got {
        Resolved::Struct { .. } => 0b00,
        Resolved::List { .. } => 0b01,
        Resolved::Capability { .. } => 0b11,
        Resolved::Null => {
            return DecodeError::InvalidPointer;
        }
    };
    let _ = expected;
    DecodeError::InvalidPointerTag { tag }
}

/// A struct's data section and pointer section, located in a message.
#[derive(Clone, Copy)]
pub struct StructReader<'a> {
    msg: &'a MessageReader,
    segment_id: u32,
    data_word: u64,
    data_words: u16,
    pointer_word: u64,
    pointer_words: u16,
}

impl<'a> StructReader<'a> {
    fn empty(msg: &'a MessageReader) -> Self {
        Self {
            msg,
            segment_id: 0,
            data_word: 0,
            data_words: 0,
            pointer_word: 0,
            pointer_words: 0,
        }
    }

    pub fn data_words(&self) -> u16 {
        self.data_words
    }

    pub fn pointer_words(&self) -> u16 {
        self.pointer_words
    }

    // Struct resolution already validated that `data_word..data_word +
    // data_words` lies inside the segment (see `resolve_pointer`'s
    // `check_range` call), so a word read here can never be out of bounds;
    // these accessors are infallible like their `StructBuilder` counterparts.
    fn data_byte(&self, byte_offset: usize) -> u8 {
        if byte_offset >= self.data_words as usize * 8 {
            // Reading a field beyond an older, shorter struct: default value.
            return 0;
        }
        let word_index = self.data_word + (byte_offset / 8) as u64;
        let word = self
            .msg
            .read_word(self.segment_id, word_index)
            .expect("data word within struct bounds validated at resolution");
        word.to_le_bytes()[byte_offset % 8]
    }

    pub fn get_bool(&self, bit_offset: usize) -> bool {
        let byte = self.data_byte(bit_offset / 8);
        (byte >> (bit_offset % 8)) & 1 == 1
    }

    pub fn get_u8(&self, byte_offset: usize) -> u8 {
        self.data_byte(byte_offset)
    }

    pub fn get_u16(&self, byte_offset: usize) -> u16 {
        let mut buf = [0u8; 2];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.data_byte(byte_offset + i);
        }
        u16::from_le_bytes(buf)
    }

    pub fn get_u32(&self, byte_offset: usize) -> u32 {
        let mut buf = [0u8; 4];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.data_byte(byte_offset + i);
        }
        u32::from_le_bytes(buf)
    }

    pub fn get_u64(&self, byte_offset: usize) -> u64 {
        let mut buf = [0u8; 8];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.data_byte(byte_offset + i);
        }
        u64::from_le_bytes(buf)
    }

    pub fn get_i8(&self, byte_offset: usize) -> i8 {
        self.get_u8(byte_offset) as i8
    }

    pub fn get_i16(&self, byte_offset: usize) -> i16 {
        self.get_u16(byte_offset) as i16
    }

    pub fn get_i32(&self, byte_offset: usize) -> i32 {
        self.get_u32(byte_offset) as i32
    }

    pub fn get_i64(&self, byte_offset: usize) -> i64 {
        self.get_u64(byte_offset) as i64
    }

    pub fn get_f32(&self, byte_offset: usize) -> f32 {
        f32::from_bits(self.get_u32(byte_offset))
    }

    pub fn get_f64(&self, byte_offset: usize) -> f64 {
        f64::from_bits(self.get_u64(byte_offset))
    }

    /// A pointer field by index within this struct's pointer section. A
    /// newer reader asking for a pointer an older writer never allocated
    /// gets a NULL reader back, not an error.
    pub fn pointer_field(&self, index: u16) -> AnyPointerReader<'a> {
        if index >= self.pointer_words {
            return AnyPointerReader::new(self.msg, self.segment_id, self.data_word);
        }
        AnyPointerReader::new(self.msg, self.segment_id, self.pointer_word + index as u64)
    }
}

/// A list of fixed-size elements or of inline-composite structs.
#[derive(Clone, Copy)]
pub struct ListReader<'a> {
    msg: &'a MessageReader,
    segment_id: u32,
    first_element_word: u64,
    element_size: ElementSize,
    element_count: u32,
    struct_data_words: u16,
    struct_pointer_words: u16,
}

impl<'a> ListReader<'a> {
    fn empty(msg: &'a MessageReader, element_size: ElementSize) -> Self {
        Self {
            msg,
            segment_id: 0,
            first_element_word: 0,
            element_size,
            element_count: 0,
            struct_data_words: 0,
            struct_pointer_words: 0,
        }
    }

    pub fn len(&self) -> u32 {
        self.element_count
    }

    pub fn is_empty(&self) -> bool {
        self.element_count == 0
    }

    pub fn element_size(&self) -> ElementSize {
        self.element_size
    }

    /// Element `index` of an `InlineComposite` list, as a struct reader.
    pub fn get_struct(&self, index: u32) -> Result<StructReader<'a>, DecodeError> {
        debug_assert!(index < self.element_count);
        let stride = self.struct_data_words as u64 + self.struct_pointer_words as u64;
        let data_word = self.first_element_word + stride * index as u64;
        Ok(StructReader {
            msg: self.msg,
            segment_id: self.segment_id,
            data_word,
            data_words: self.struct_data_words,
            pointer_word: data_word + self.struct_data_words as u64,
            pointer_words: self.struct_pointer_words,
        })
    }

    /// Element `index` of a `Pointer`-size list, as an unresolved pointer
    /// slot (used for `List(List(T))`, `List(Text)`, and so on).
    pub fn get_pointer_element(&self, index: u32) -> AnyPointerReader<'a> {
        debug_assert!(index < self.element_count);
        AnyPointerReader::new(self.msg, self.segment_id, self.first_element_word + index as u64)
    }

    fn data_byte(&self, byte_offset: u64) -> Result<u8, DecodeError> {
        let word_index = self.first_element_word + byte_offset / 8;
        let word = self.msg.read_word(self.segment_id, word_index)?;
        Ok(word.to_le_bytes()[(byte_offset % 8) as usize])
    }

    pub fn get_bool(&self, index: u32) -> Result<bool, DecodeError> {
        debug_assert_eq!(self.element_size, ElementSize::Bit);
        let bit = index as u64;
        let byte = self.data_byte(bit / 8)?;
        Ok((byte >> (bit % 8)) & 1 == 1)
    }

    pub fn get_u8(&self, index: u32) -> Result<u8, DecodeError> {
        debug_assert_eq!(self.element_size, ElementSize::Byte);
        self.data_byte(index as u64)
    }

    pub fn get_u16(&self, index: u32) -> Result<u16, DecodeError> {
        debug_assert_eq!(self.element_size, ElementSize::TwoBytes);
        let base = index as u64 * 2;
        Ok(u16::from_le_bytes([
            self.data_byte(base)?,
            self.data_byte(base + 1)?,
        ]))
    }

    pub fn get_u32(&self, index: u32) -> Result<u32, DecodeError> {
        debug_assert_eq!(self.element_size, ElementSize::FourBytes);
        let base = index as u64 * 4;
        let mut buf = [0u8; 4];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.data_byte(base + i as u64)?;
        }
        Ok(u32::from_le_bytes(buf))
    }

    pub fn get_u64(&self, index: u32) -> Result<u64, DecodeError> {
        debug_assert_eq!(self.element_size, ElementSize::EightBytes);
        let base = index as u64 * 8;
        let mut buf = [0u8; 8];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.data_byte(base + i as u64)?;
        }
        Ok(u64::from_le_bytes(buf))
    }

    /// The full contents of a `Byte`-element list as a contiguous slice.
    /// Falls back to a copy-free zero-length slice for an empty list.
    pub fn byte_slice(&self) -> Result<&'a [u8], DecodeError> {
        debug_assert_eq!(self.element_size, ElementSize::Byte);
        if self.element_count == 0 {
            return Ok(&[]);
        }
        let seg = self.msg.segment(self.segment_id)?;
        let start = (self.first_element_word * 8) as usize;
        let end = start + self.element_count as usize;
        seg.get(start..end).ok_or(DecodeError::OutOfBounds {
            segment_id: self.segment_id,
            word_offset: self.first_element_word as i64,
            words_needed: (self.element_count as u64).div_ceil(8),
            segment_words: seg.len() / 8,
        })
    }
}
