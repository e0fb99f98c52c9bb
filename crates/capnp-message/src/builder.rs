//! Message construction: segment allocation, struct/list builders, and
//! far-pointer landing pads for cross-segment references.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::OutOfBounds;
use crate::pointer::{encode_pointer, ElementSize, WirePointer};

const DEFAULT_SEGMENT_WORDS: u64 = 1024;

struct Arena {
    segments: Vec<Vec<u8>>,
}

impl Arena {
    fn new() -> Self {
        Self { segments: vec![Vec::new()] }
    }

    fn allocate(&mut self, preferred_segment: u32, words: u64) -> (u32, u64) {
        if let Some(seg) = self.segments.get_mut(preferred_segment as usize) {
            let word_offset = (seg.len() / 8) as u64;
            seg.resize(seg.len() + (words * 8) as usize, 0);
            return (preferred_segment, word_offset);
        }
        self.allocate_new_segment(words)
    }

    fn allocate_new_segment(&mut self, words: u64) -> (u32, u64) {
        let capacity = words.max(DEFAULT_SEGMENT_WORDS) * 8;
        let mut seg = Vec::with_capacity(capacity as usize);
        seg.resize((words * 8) as usize, 0);
        self.segments.push(seg);
        ((self.segments.len() - 1) as u32, 0)
    }

    fn write_word(&mut self, segment_id: u32, word_index: u64, word: u64) {
        let seg = &mut self.segments[segment_id as usize];
        let start = (word_index * 8) as usize;
        seg[start..start + 8].copy_from_slice(&word.to_le_bytes());
    }

    fn read_word(&self, segment_id: u32, word_index: u64) -> u64 {
        let seg = &self.segments[segment_id as usize];
        let start = (word_index * 8) as usize;
        u64::from_le_bytes(seg[start..start + 8].try_into().unwrap())
    }

    fn write_byte(&mut self, segment_id: u32, byte_index: u64, value: u8) {
        self.segments[segment_id as usize][byte_index as usize] = value;
    }

    fn read_byte(&self, segment_id: u32, byte_index: u64) -> u8 {
        self.segments[segment_id as usize][byte_index as usize]
    }
}

/// A growable set of segments being assembled into a message.
#[derive(Clone)]
pub struct MessageBuilder {
    arena: Rc<RefCell<Arena>>,
}

impl Default for MessageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self {
            arena: Rc::new(RefCell::new(Arena::new())),
        }
    }

    /// Allocate the root struct and return a builder for it. Only valid to
    /// call once per message.
    pub fn init_root(&self, data_words: u16, pointer_words: u16) -> StructBuilder {
        let (segment_id, word_offset) = self
            .arena
            .borrow_mut()
            .allocate(0, 1 + data_words as u64 + pointer_words as u64);
        // word_offset points at the root pointer slot itself; content follows.
        StructBuilder {
            arena: self.arena.clone(),
            segment_id,
            data_word: word_offset + 1,
            data_words,
            pointer_word: word_offset + 1 + data_words as u64,
            pointer_words,
        }
        .also_writing_root_pointer(word_offset)
    }

    /// Finish the message, returning one word-aligned byte buffer per
    /// segment, ready for [`crate::frame::encode_frame`].
    pub fn finish(self) -> Vec<Vec<u8>> {
        Rc::try_unwrap(self.arena)
            .unwrap_or_else(|rc| Arena {
                segments: rc.borrow().segments.clone(),
            })
            .into_inner()
            .segments
    }
}

impl StructBuilder {
    fn also_writing_root_pointer(self, root_pointer_word: u64) -> Self {
        let offset = (self.data_word as i64 - (root_pointer_word as i64 + 1)) as i32;
        let word = encode_pointer(WirePointer::Struct {
            offset,
            data_words: self.data_words,
            pointer_words: self.pointer_words,
        });
        self.arena
            .borrow_mut()
            .write_word(self.segment_id, root_pointer_word, word);
        self
    }
}

/// A struct's data and pointer sections, writable in place.
pub struct StructBuilder {
    arena: Rc<RefCell<Arena>>,
    segment_id: u32,
    data_word: u64,
    data_words: u16,
    pointer_word: u64,
    pointer_words: u16,
}

impl StructBuilder {
    pub fn data_words(&self) -> u16 {
        self.data_words
    }

    pub fn pointer_words(&self) -> u16 {
        self.pointer_words
    }

    fn data_byte_offset(&self, byte_offset: usize) -> u64 {
        self.data_word * 8 + byte_offset as u64
    }

    /// Write a data byte, silently dropping writes past the struct's data
    /// section (schema-evolution-safe: a builder compiled against a newer
    /// schema than the struct was allocated with just loses the field).
    pub fn set_u8(&mut self, byte_offset: usize, value: u8) {
        if byte_offset >= self.data_words as usize * 8 {
            return;
        }
        self.arena
            .borrow_mut()
            .write_byte(self.segment_id, self.data_byte_offset(byte_offset), value);
    }

    /// Strict counterpart to [`Self::set_u8`] that reports out-of-range
    /// writes instead of dropping them.
    pub fn try_set_u8(&mut self, byte_offset: usize, value: u8) -> Result<(), OutOfBounds> {
        if byte_offset >= self.data_words as usize * 8 {
            return Err(OutOfBounds::DataOffset {
                byte_offset,
                data_words: self.data_words,
            });
        }
        self.set_u8(byte_offset, value);
        Ok(())
    }

    pub fn get_u8(&self, byte_offset: usize) -> u8 {
        if byte_offset >= self.data_words as usize * 8 {
            return 0;
        }
        self.arena.borrow().read_byte(self.segment_id, self.data_byte_offset(byte_offset))
    }

    pub fn set_bool(&mut self, bit_offset: usize, value: bool) {
        let byte_offset = bit_offset / 8;
        let mut byte = self.get_u8(byte_offset);
        let mask = 1u8 << (bit_offset % 8);
        if value {
            byte |= mask;
        } else {
            byte &= !mask;
        }
        self.set_u8(byte_offset, byte);
    }

    pub fn get_bool(&self, bit_offset: usize) -> bool {
        (self.get_u8(bit_offset / 8) >> (bit_offset % 8)) & 1 == 1
    }

    pub fn set_u16(&mut self, byte_offset: usize, value: u16) {
        for (i, b) in value.to_le_bytes().into_iter().enumerate() {
            self.set_u8(byte_offset + i, b);
        }
    }

    pub fn get_u16(&self, byte_offset: usize) -> u16 {
        u16::from_le_bytes([self.get_u8(byte_offset), self.get_u8(byte_offset + 1)])
    }

    pub fn set_u32(&mut self, byte_offset: usize, value: u32) {
        for (i, b) in value.to_le_bytes().into_iter().enumerate() {
            self.set_u8(byte_offset + i, b);
        }
    }

    pub fn get_u32(&self, byte_offset: usize) -> u32 {
        let mut buf = [0u8; 4];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.get_u8(byte_offset + i);
        }
        u32::from_le_bytes(buf)
    }

    pub fn set_u64(&mut self, byte_offset: usize, value: u64) {
        for (i, b) in value.to_le_bytes().into_iter().enumerate() {
            self.set_u8(byte_offset + i, b);
        }
    }

    pub fn get_u64(&self, byte_offset: usize) -> u64 {
        let mut buf = [0u8; 8];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.get_u8(byte_offset + i);
        }
        u64::from_le_bytes(buf)
    }

    pub fn set_i32(&mut self, byte_offset: usize, value: i32) {
        self.set_u32(byte_offset, value as u32);
    }

    pub fn set_i64(&mut self, byte_offset: usize, value: i64) {
        self.set_u64(byte_offset, value as u64);
    }

    pub fn set_f64(&mut self, byte_offset: usize, value: f64) {
        self.set_u64(byte_offset, value.to_bits());
    }

    fn pointer_slot_word(&self, index: u16) -> Option<u64> {
        if index >= self.pointer_words {
            return None;
        }
        Some(self.pointer_word + index as u64)
    }

    /// Allocate a new struct and wire up the pointer at `index` to it,
    /// placing a far pointer with landing pad if the new struct lands in a
    /// different segment than this one.
    pub fn init_struct_pointer(
        &mut self,
        index: u16,
        data_words: u16,
        pointer_words: u16,
    ) -> Result<StructBuilder, OutOfBounds> {
        let slot = self.pointer_slot_word(index).ok_or(OutOfBounds::PointerIndex {
            index,
            pointer_words: self.pointer_words,
        })?;
        let (segment_id, content_word) = self
            .arena
            .borrow_mut()
            .allocate(self.segment_id, data_words as u64 + pointer_words as u64);
        write_pointer_slot(
            &self.arena,
            self.segment_id,
            slot,
            segment_id,
            content_word,
            WirePointer::Struct {
                offset: 0,
                data_words,
                pointer_words,
            },
        );
        Ok(StructBuilder {
            arena: self.arena.clone(),
            segment_id,
            data_word: content_word,
            data_words,
            pointer_word: content_word + data_words as u64,
            pointer_words,
        })
    }

    pub fn init_list_pointer(
        &mut self,
        index: u16,
        element_size: ElementSize,
        element_count: u32,
    ) -> Result<ListBuilder, OutOfBounds> {
        let slot = self.pointer_slot_word(index).ok_or(OutOfBounds::PointerIndex {
            index,
            pointer_words: self.pointer_words,
        })?;
        let content_words = crate::pointer::content_bytes(element_size, element_count).div_ceil(8);
        let (segment_id, content_word) = self.arena.borrow_mut().allocate(self.segment_id, content_words);
        write_pointer_slot(
            &self.arena,
            self.segment_id,
            slot,
            segment_id,
            content_word,
            WirePointer::List {
                offset: 0,
                element_size,
                element_count,
            },
        );
        Ok(ListBuilder {
            arena: self.arena.clone(),
            segment_id,
            first_element_word: content_word,
            element_size,
            element_count,
        })
    }

    /// Allocate an inline-composite list of structs, each with the given
    /// data/pointer word counts, and wire up the pointer at `index`.
    pub fn init_struct_list_pointer(
        &mut self,
        index: u16,
        element_count: u32,
        struct_data_words: u16,
        struct_pointer_words: u16,
    ) -> Result<StructListBuilder, OutOfBounds> {
        let slot = self.pointer_slot_word(index).ok_or(OutOfBounds::PointerIndex {
            index,
            pointer_words: self.pointer_words,
        })?;
        let stride = struct_data_words as u64 + struct_pointer_words as u64;
        let total_words = 1 + stride * element_count as u64;
        let (segment_id, tag_word) = self.arena.borrow_mut().allocate(self.segment_id, total_words);
        let tag = encode_pointer(WirePointer::Struct {
            offset: element_count as i32,
            data_words: struct_data_words,
            pointer_words: struct_pointer_words,
        });
        self.arena.borrow_mut().write_word(segment_id, tag_word, tag);
        write_pointer_slot(
            &self.arena,
            self.segment_id,
            slot,
            segment_id,
            tag_word,
            WirePointer::List {
                offset: 0,
                element_size: ElementSize::InlineComposite,
                element_count: (total_words - 1) as u32,
            },
        );
        Ok(StructListBuilder {
            arena: self.arena.clone(),
            segment_id,
            first_element_word: tag_word + 1,
            element_count,
            struct_data_words,
            struct_pointer_words,
        })
    }

    pub fn set_text(&mut self, index: u16, value: &str) -> Result<(), OutOfBounds> {
        let bytes = value.as_bytes();
        let mut list = self.init_list_pointer(index, ElementSize::Byte, bytes.len() as u32 + 1)?;
        for (i, b) in bytes.iter().enumerate() {
            list.set_u8(i as u32, *b);
        }
        list.set_u8(bytes.len() as u32, 0);
        Ok(())
    }

    pub fn set_data(&mut self, index: u16, value: &[u8]) -> Result<(), OutOfBounds> {
        let mut list = self.init_list_pointer(index, ElementSize::Byte, value.len() as u32)?;
        for (i, b) in value.iter().enumerate() {
            list.set_u8(i as u32, *b);
        }
        Ok(())
    }

    /// Wire up the pointer at `index` as a capability reference into the
    /// enclosing message's cap table.
    pub fn set_capability(&mut self, index: u16, cap_index: u32) -> Result<(), OutOfBounds> {
        let slot = self.pointer_slot_word(index).ok_or(OutOfBounds::PointerIndex {
            index,
            pointer_words: self.pointer_words,
        })?;
        let word = encode_pointer(WirePointer::Capability { index: cap_index });
        self.arena.borrow_mut().write_word(self.segment_id, slot, word);
        Ok(())
    }
}

fn write_pointer_slot(
    arena: &Rc<RefCell<Arena>>,
    pointer_segment: u32,
    pointer_word: u64,
    content_segment: u32,
    content_word: u64,
    mut tag: WirePointer,
) {
    if pointer_segment == content_segment {
        let offset = content_word as i64 - (pointer_word as i64 + 1);
        match &mut tag {
            WirePointer::Struct { offset: o, .. } | WirePointer::List { offset: o, .. } => {
                *o = offset as i32;
            }
            _ => {}
        }
        arena
            .borrow_mut()
            .write_word(pointer_segment, pointer_word, encode_pointer(tag));
        return;
    }

    // Content lives in a different segment: plant a single-word landing pad
    // immediately before it and point a far pointer at that pad.
    let (landing_segment, landing_word) = arena.borrow_mut().allocate(content_segment, 1);
    debug_assert_eq!(landing_segment, content_segment);
    let landing_offset = content_word as i64 - (landing_word as i64 + 1);
    match &mut tag {
        WirePointer::Struct { offset: o, .. } | WirePointer::List { offset: o, .. } => {
            *o = landing_offset as i32;
        }
        _ => {}
    }
    arena.borrow_mut().write_word(landing_segment, landing_word, encode_pointer(tag));
    let far = encode_pointer(WirePointer::Far {
        double_far: false,
        landing_pad_offset: landing_word as u32,
        segment_id: landing_segment,
    });
    arena.borrow_mut().write_word(pointer_segment, pointer_word, far);
}

/// A fixed-size-element list, writable in place.
pub struct ListBuilder {
    arena: Rc<RefCell<Arena>>,
    segment_id: u32,
    first_element_word: u64,
    element_size: ElementSize,
    element_count: u32,
}

impl ListBuilder {
    pub fn len(&self) -> u32 {
        self.element_count
    }

    pub fn is_empty(&self) -> bool {
        self.element_count == 0
    }

    fn byte_offset(&self, index: u32) -> u64 {
        self.first_element_word * 8 + index as u64
    }

    pub fn set_u8(&mut self, index: u32, value: u8) {
        debug_assert_eq!(self.element_size, ElementSize::Byte);
        self.arena.borrow_mut().write_byte(self.segment_id, self.byte_offset(index), value);
    }

    pub fn set_u16(&mut self, index: u32, value: u16) {
        debug_assert_eq!(self.element_size, ElementSize::TwoBytes);
        let base = self.first_element_word * 8 + index as u64 * 2;
        for (i, b) in value.to_le_bytes().into_iter().enumerate() {
            self.arena.borrow_mut().write_byte(self.segment_id, base + i as u64, b);
        }
    }

    pub fn set_u32(&mut self, index: u32, value: u32) {
        debug_assert_eq!(self.element_size, ElementSize::FourBytes);
        let base = self.first_element_word * 8 + index as u64 * 4;
        for (i, b) in value.to_le_bytes().into_iter().enumerate() {
            self.arena.borrow_mut().write_byte(self.segment_id, base + i as u64, b);
        }
    }

    pub fn set_u64(&mut self, index: u32, value: u64) {
        debug_assert_eq!(self.element_size, ElementSize::EightBytes);
        let base = self.first_element_word * 8 + index as u64 * 8;
        for (i, b) in value.to_le_bytes().into_iter().enumerate() {
            self.arena.borrow_mut().write_byte(self.segment_id, base + i as u64, b);
        }
    }
}

/// An inline-composite list of structs, writable in place.
pub struct StructListBuilder {
    arena: Rc<RefCell<Arena>>,
    segment_id: u32,
    first_element_word: u64,
    element_count: u32,
    struct_data_words: u16,
    struct_pointer_words: u16,
}

impl StructListBuilder {
    pub fn len(&self) -> u32 {
        self.element_count
    }

    pub fn get(&self, index: u32) -> StructBuilder {
        debug_assert!(index < self.element_count);
        let stride = self.struct_data_words as u64 + self.struct_pointer_words as u64;
        let data_word = self.first_element_word + stride * index as u64;
        StructBuilder {
            arena: self.arena.clone(),
            segment_id: self.segment_id,
            data_word,
            data_words: self.struct_data_words,
            pointer_word: data_word + self.struct_data_words as u64,
            pointer_words: self.struct_pointer_words,
        }
    }
}
