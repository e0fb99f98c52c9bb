//! Shared sub-structures referenced by several message variants: capability
//! descriptors, call targets, pipeline transforms, and call/return payloads.

use capnp_message::{AnyPointerReader, ElementSize, OutOfBounds, StructBuilder, StructReader};

use crate::error::ProtoError;

/// One step of a promised-answer transform path: either pass through the
/// content pointer unchanged, or descend into one of its pointer fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOp {
    Noop,
    GetPointerField(u16),
}

impl PipelineOp {
    fn write(self, builder: &mut StructBuilder) {
        match self {
            PipelineOp::Noop => builder.set_u8(0, 0),
            PipelineOp::GetPointerField(index) => {
                builder.set_u8(0, 1);
                builder.set_u32(4, index as u32);
            }
        }
    }

    fn read(reader: &StructReader) -> Result<Self, ProtoError> {
        match reader.get_u8(0) {
            0 => Ok(PipelineOp::Noop),
            1 => Ok(PipelineOp::GetPointerField(reader.get_u32(4) as u16)),
            tag => Err(ProtoError::UnknownPipelineOp { tag }),
        }
    }
}

fn write_transform(parent: &mut StructBuilder, pointer_index: u16, ops: &[PipelineOp]) -> Result<(), OutOfBounds> {
    let list = parent.init_struct_list_pointer(pointer_index, ops.len() as u32, 1, 0)?;
    for (i, op) in ops.iter().enumerate() {
        let mut elem = list.get(i as u32);
        op.write(&mut elem);
    }
    Ok(())
}

fn read_transform(parent: &StructReader, pointer_index: u16) -> Result<Vec<PipelineOp>, ProtoError> {
    let list = parent
        .pointer_field(pointer_index)
        .read_list(ElementSize::InlineComposite)?;
    (0..list.len())
        .map(|i| PipelineOp::read(&list.get_struct(i)?))
        .collect()
}

/// Where a `Call` or `Disembargo` is addressed: an import the receiver
/// already holds, or a not-yet-resolved pipelined answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageTarget {
    ImportedCap { export_id: u32 },
    PromisedAnswer { question_id: u32, transform: Vec<PipelineOp> },
}

impl MessageTarget {
    pub(crate) fn write(&self, parent: &mut StructBuilder, pointer_index: u16) -> Result<(), OutOfBounds> {
        let mut target = parent.init_struct_pointer(pointer_index, 2, 1)?;
        match self {
            MessageTarget::ImportedCap { export_id } => {
                target.set_u8(0, 0);
                target.set_u32(4, *export_id);
            }
            MessageTarget::PromisedAnswer { question_id, transform } => {
                target.set_u8(0, 1);
                target.set_u32(4, *question_id);
                write_transform(&mut target, 0, transform)?;
            }
        }
        Ok(())
    }

    pub(crate) fn read(parent: &StructReader, pointer_index: u16) -> Result<Self, ProtoError> {
        let target = parent.pointer_field(pointer_index).read_struct()?;
        match target.get_u8(0) {
            0 => Ok(MessageTarget::ImportedCap {
                export_id: target.get_u32(4),
            }),
            1 => Ok(MessageTarget::PromisedAnswer {
                question_id: target.get_u32(4),
                transform: read_transform(&target, 0)?,
            }),
            tag => Err(ProtoError::UnknownMessageTarget { tag }),
        }
    }
}

/// A reference to a capability crossing the wire, as carried in a call's
/// parameter cap table or a return's result cap table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapDescriptor {
    None,
    SenderHosted { export_id: u32 },
    SenderPromise { export_id: u32 },
    ReceiverHosted { import_id: u32 },
    ReceiverAnswer { question_id: u32, transform: Vec<PipelineOp> },
    ThirdPartyHosted { vine_id: u32, recipient: Vec<u8> },
}

impl CapDescriptor {
    fn write(&self, builder: &mut StructListBuilderElem) -> Result<(), OutOfBounds> {
        match self {
            CapDescriptor::None => {
                builder.s.set_u8(0, 0);
            }
            CapDescriptor::SenderHosted { export_id } => {
                builder.s.set_u8(0, 1);
                builder.s.set_u32(4, *export_id);
            }
            CapDescriptor::SenderPromise { export_id } => {
                builder.s.set_u8(0, 2);
                builder.s.set_u32(4, *export_id);
            }
            CapDescriptor::ReceiverHosted { import_id } => {
                builder.s.set_u8(0, 3);
                builder.s.set_u32(4, *import_id);
            }
            CapDescriptor::ReceiverAnswer { question_id, transform } => {
                builder.s.set_u8(0, 4);
                builder.s.set_u32(8, *question_id);
                write_transform(&mut builder.s, 0, transform)?;
            }
            CapDescriptor::ThirdPartyHosted { vine_id, recipient } => {
                builder.s.set_u8(0, 5);
                builder.s.set_u32(4, *vine_id);
                builder.s.set_data(0, recipient)?;
            }
        }
        Ok(())
    }

    fn read(reader: &StructReader) -> Result<Self, ProtoError> {
        match reader.get_u8(0) {
            0 => Ok(CapDescriptor::None),
            1 => Ok(CapDescriptor::SenderHosted {
                export_id: reader.get_u32(4),
            }),
            2 => Ok(CapDescriptor::SenderPromise {
                export_id: reader.get_u32(4),
            }),
            3 => Ok(CapDescriptor::ReceiverHosted {
                import_id: reader.get_u32(4),
            }),
            4 => Ok(CapDescriptor::ReceiverAnswer {
                question_id: reader.get_u32(8),
                transform: read_transform(reader, 0)?,
            }),
            5 => Ok(CapDescriptor::ThirdPartyHosted {
                vine_id: reader.get_u32(4),
                recipient: reader.pointer_field(0).read_data()?.to_vec(),
            }),
            tag => Err(ProtoError::UnknownCapDescriptor { tag }),
        }
    }
}

/// Thin wrapper so [`CapDescriptor::write`] can borrow a struct slot out of
/// an in-progress inline-composite list element without repeating the
/// struct-list indexing at every call site.
struct StructListBuilderElem {
    s: StructBuilder,
}

fn write_cap_table(parent: &mut StructBuilder, pointer_index: u16, caps: &[CapDescriptor]) -> Result<(), OutOfBounds> {
    let list = parent.init_struct_list_pointer(pointer_index, caps.len() as u32, 2, 1)?;
    for (i, cap) in caps.iter().enumerate() {
        let mut elem = StructListBuilderElem {
            s: list.get(i as u32),
        };
        cap.write(&mut elem)?;
    }
    Ok(())
}

fn read_cap_table(parent: &StructReader, pointer_index: u16) -> Result<Vec<CapDescriptor>, ProtoError> {
    let list = parent
        .pointer_field(pointer_index)
        .read_list(ElementSize::InlineComposite)?;
    (0..list.len())
        .map(|i| CapDescriptor::read(&list.get_struct(i)?))
        .collect()
}

/// An application-defined payload plus the capability table it references:
/// call parameters, or return results. Owns its own nested struct (pointer0
/// = content, pointer1 = cap table) rather than borrowing into its parent,
/// so it can outlive the call that allocated it.
pub struct PayloadBuilder {
    payload: StructBuilder,
}

impl PayloadBuilder {
    pub(crate) fn from_struct(payload: StructBuilder) -> Self {
        Self { payload }
    }

    /// Allocate the content as a struct and return a builder for it.
    pub fn init_content(&mut self, data_words: u16, pointer_words: u16) -> Result<StructBuilder, OutOfBounds> {
        self.payload.init_struct_pointer(0, data_words, pointer_words)
    }

    /// Set the content pointer itself to a capability, for payloads whose
    /// result is a bare capability rather than a method's return struct
    /// (`Accept` and the converged leg of a `Join`).
    pub fn set_content_capability(&mut self, cap_index: u32) -> Result<(), OutOfBounds> {
        self.payload.set_capability(0, cap_index)
    }

    pub fn set_cap_table(&mut self, caps: &[CapDescriptor]) -> Result<(), OutOfBounds> {
        write_cap_table(&mut self.payload, 1, caps)
    }
}

pub struct PayloadReader<'a> {
    payload: StructReader<'a>,
}

impl<'a> PayloadReader<'a> {
    pub(crate) fn from_struct(payload: StructReader<'a>) -> Self {
        Self { payload }
    }

    pub fn content(&self) -> AnyPointerReader<'a> {
        self.payload.pointer_field(0)
    }

    pub fn cap_table(&self) -> Result<Vec<CapDescriptor>, ProtoError> {
        read_cap_table(&self.payload, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capnp_message::MessageBuilder;

    #[test]
    fn cap_table_round_trips_every_variant() {
        let caps = vec![
            CapDescriptor::None,
            CapDescriptor::SenderHosted { export_id: 1 },
            CapDescriptor::SenderPromise { export_id: 2 },
            CapDescriptor::ReceiverHosted { import_id: 3 },
            CapDescriptor::ReceiverAnswer {
                question_id: 4,
                transform: vec![PipelineOp::GetPointerField(0), PipelineOp::Noop],
            },
            CapDescriptor::ThirdPartyHosted {
                vine_id: 5,
                recipient: b"vine".to_vec(),
            },
        ];

        let msg = MessageBuilder::new();
        let mut root = msg.init_root(0, 1);
        write_cap_table(&mut root, 0, &caps).unwrap();

        let segments = msg.finish();
        let reader = capnp_message::MessageReader::new(segments.into_iter().map(bytes::Bytes::from).collect());
        let root_any = AnyPointerReader::new(&reader, 0, 0);
        let root_struct = root_any.read_struct().unwrap();
        let decoded = read_cap_table(&root_struct, 0).unwrap();
        assert_eq!(decoded, caps);
    }

    #[test]
    fn message_target_round_trips_imported_cap() {
        let msg = MessageBuilder::new();
        let mut root = msg.init_root(0, 1);
        let target = MessageTarget::ImportedCap { export_id: 77 };
        target.write(&mut root, 0).unwrap();

        let segments = msg.finish();
        let reader = capnp_message::MessageReader::new(segments.into_iter().map(bytes::Bytes::from).collect());
        let root_any = AnyPointerReader::new(&reader, 0, 0);
        let root_struct = root_any.read_struct().unwrap();
        assert_eq!(MessageTarget::read(&root_struct, 0).unwrap(), target);
    }
}
