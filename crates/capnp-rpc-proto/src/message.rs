//! The RPC `Message` union: one root struct per frame, discriminated by a
//! tag byte at data offset 0.

use capnp_message::{AnyPointerReader, MessageBuilder, OutOfBounds, StructBuilder, StructReader};

use crate::cap_descriptor::{CapDescriptor, MessageTarget, PayloadBuilder, PayloadReader};
use crate::error::ProtoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Bootstrap = 0,
    Call = 1,
    Return = 2,
    Finish = 3,
    Resolve = 4,
    Release = 5,
    Disembargo = 6,
    Unimplemented = 7,
    Abort = 8,
    Provide = 9,
    Accept = 10,
    Join = 11,
}

impl MessageKind {
    fn from_tag(tag: u8) -> Result<Self, ProtoError> {
        Ok(match tag {
            0 => MessageKind::Bootstrap,
            1 => MessageKind::Call,
            2 => MessageKind::Return,
            3 => MessageKind::Finish,
            4 => MessageKind::Resolve,
            5 => MessageKind::Release,
            6 => MessageKind::Disembargo,
            7 => MessageKind::Unimplemented,
            8 => MessageKind::Abort,
            9 => MessageKind::Provide,
            10 => MessageKind::Accept,
            11 => MessageKind::Join,
            tag => return Err(ProtoError::UnknownMessageKind { tag }),
        })
    }

    fn name(self) -> &'static str {
        match self {
            MessageKind::Bootstrap => "bootstrap",
            MessageKind::Call => "call",
            MessageKind::Return => "return",
            MessageKind::Finish => "finish",
            MessageKind::Resolve => "resolve",
            MessageKind::Release => "release",
            MessageKind::Disembargo => "disembargo",
            MessageKind::Unimplemented => "unimplemented",
            MessageKind::Abort => "abort",
            MessageKind::Provide => "provide",
            MessageKind::Accept => "accept",
            MessageKind::Join => "join",
        }
    }
}

/// A parsed frame, not yet interpreted as any particular variant.
pub struct DecodedMessage<'a> {
    root: StructReader<'a>,
    kind: MessageKind,
}

impl<'a> DecodedMessage<'a> {
    pub fn init(root_pointer: AnyPointerReader<'a>) -> Result<Self, ProtoError> {
        let root = root_pointer.read_struct()?;
        let kind = MessageKind::from_tag(root.get_u8(0))?;
        Ok(Self { root, kind })
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    fn expect(&self, kind: MessageKind) -> Result<(), ProtoError> {
        if self.kind != kind {
            return Err(ProtoError::UnexpectedMessage {
                expected: kind.name(),
                found: self.kind as u8,
            });
        }
        Ok(())
    }

    pub fn as_bootstrap(&self) -> Result<BootstrapReader<'a>, ProtoError> {
        self.expect(MessageKind::Bootstrap)?;
        Ok(BootstrapReader { root: self.root })
    }

    pub fn as_call(&self) -> Result<CallReader<'a>, ProtoError> {
        self.expect(MessageKind::Call)?;
        Ok(CallReader { root: self.root })
    }

    pub fn as_return(&self) -> Result<ReturnReader<'a>, ProtoError> {
        self.expect(MessageKind::Return)?;
        Ok(ReturnReader { root: self.root })
    }

    pub fn as_finish(&self) -> Result<FinishReader<'a>, ProtoError> {
        self.expect(MessageKind::Finish)?;
        Ok(FinishReader { root: self.root })
    }

    pub fn as_resolve(&self) -> Result<ResolveReader<'a>, ProtoError> {
        self.expect(MessageKind::Resolve)?;
        Ok(ResolveReader { root: self.root })
    }

    pub fn as_release(&self) -> Result<ReleaseReader<'a>, ProtoError> {
        self.expect(MessageKind::Release)?;
        Ok(ReleaseReader { root: self.root })
    }

    pub fn as_disembargo(&self) -> Result<DisembargoReader<'a>, ProtoError> {
        self.expect(MessageKind::Disembargo)?;
        Ok(DisembargoReader { root: self.root })
    }

    pub fn as_unimplemented(&self) -> Result<UnimplementedReader<'a>, ProtoError> {
        self.expect(MessageKind::Unimplemented)?;
        Ok(UnimplementedReader { root: self.root })
    }

    pub fn as_abort(&self) -> Result<AbortReader<'a>, ProtoError> {
        self.expect(MessageKind::Abort)?;
        Ok(AbortReader { root: self.root })
    }

    pub fn as_provide(&self) -> Result<ProvideReader<'a>, ProtoError> {
        self.expect(MessageKind::Provide)?;
        Ok(ProvideReader { root: self.root })
    }

    pub fn as_accept(&self) -> Result<AcceptReader<'a>, ProtoError> {
        self.expect(MessageKind::Accept)?;
        Ok(AcceptReader { root: self.root })
    }

    pub fn as_join(&self) -> Result<JoinReader<'a>, ProtoError> {
        self.expect(MessageKind::Join)?;
        Ok(JoinReader { root: self.root })
    }
}

fn new_root(kind: MessageKind, data_words: u16, pointer_words: u16) -> (MessageBuilder, StructBuilder) {
    let msg = MessageBuilder::new();
    let mut root = msg.init_root(data_words, pointer_words);
    root.set_u8(0, kind as u8);
    (msg, root)
}

// ---- bootstrap ----

pub struct BootstrapReader<'a> {
    root: StructReader<'a>,
}

impl BootstrapReader<'_> {
    pub fn question_id(&self) -> u32 {
        self.root.get_u32(4)
    }
}

pub fn build_bootstrap(question_id: u32) -> MessageBuilder {
    let (msg, mut root) = new_root(MessageKind::Bootstrap, 1, 0);
    root.set_u32(4, question_id);
    msg
}

// ---- call ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResultsTo {
    Caller,
    Yourself,
}

pub struct CallReader<'a> {
    root: StructReader<'a>,
}

impl<'a> CallReader<'a> {
    pub fn question_id(&self) -> u32 {
        self.root.get_u32(4)
    }

    pub fn interface_id(&self) -> u64 {
        self.root.get_u64(8)
    }

    pub fn method_id(&self) -> u32 {
        self.root.get_u32(16)
    }

    pub fn send_results_to(&self) -> SendResultsTo {
        if self.root.get_u8(20) == 1 {
            SendResultsTo::Yourself
        } else {
            SendResultsTo::Caller
        }
    }

    pub fn allow_third_party_tail_call(&self) -> bool {
        self.root.get_bool(21 * 8)
    }

    pub fn target(&self) -> Result<MessageTarget, ProtoError> {
        MessageTarget::read(&self.root, 0)
    }

    pub fn params(&self) -> Result<PayloadReader<'a>, ProtoError> {
        Ok(PayloadReader::from_struct(self.root.pointer_field(1).read_struct()?))
    }
}

pub struct CallBuilder {
    pub msg: MessageBuilder,
    root: StructBuilder,
}

impl CallBuilder {
    pub fn new(
        question_id: u32,
        interface_id: u64,
        method_id: u32,
        send_results_to: SendResultsTo,
        target: &MessageTarget,
    ) -> Result<Self, OutOfBounds> {
        let (msg, mut root) = new_root(MessageKind::Call, 3, 2);
        root.set_u32(4, question_id);
        root.set_u64(8, interface_id);
        root.set_u32(16, method_id);
        root.set_u8(20, matches!(send_results_to, SendResultsTo::Yourself) as u8);
        target.write(&mut root, 0)?;
        Ok(Self { msg, root })
    }

    pub fn set_allow_third_party_tail_call(&mut self, allow: bool) {
        self.root.set_bool(21 * 8, allow);
    }

    /// Access the call's parameter payload (content + cap table), stored at
    /// pointer index 1. The payload itself is a nested struct with its own
    /// two pointer slots.
    pub fn params(&mut self) -> Result<PayloadBuilder, OutOfBounds> {
        let payload_struct = self.root.init_struct_pointer(1, 0, 2)?;
        Ok(PayloadBuilder::from_struct(payload_struct))
    }
}

// ---- return ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnVariantTag {
    Results,
    Exception,
    Canceled,
    ResultsSentElsewhere,
    TakeFromOtherQuestion,
    AcceptFromThirdParty,
}

impl ReturnVariantTag {
    fn from_tag(tag: u8) -> Result<Self, ProtoError> {
        Ok(match tag {
            0 => ReturnVariantTag::Results,
            1 => ReturnVariantTag::Exception,
            2 => ReturnVariantTag::Canceled,
            3 => ReturnVariantTag::ResultsSentElsewhere,
            4 => ReturnVariantTag::TakeFromOtherQuestion,
            5 => ReturnVariantTag::AcceptFromThirdParty,
            tag => return Err(ProtoError::UnknownReturnVariant { tag }),
        })
    }
}

pub struct ReturnReader<'a> {
    root: StructReader<'a>,
}

impl<'a> ReturnReader<'a> {
    pub fn question_id(&self) -> u32 {
        self.root.get_u32(4)
    }

    pub fn variant(&self) -> Result<ReturnVariantTag, ProtoError> {
        ReturnVariantTag::from_tag(self.root.get_u8(8))
    }

    pub fn results(&self) -> Result<PayloadReader<'a>, ProtoError> {
        Ok(PayloadReader::from_struct(self.root.pointer_field(0).read_struct()?))
    }

    pub fn exception_reason(&self) -> Result<&'a str, ProtoError> {
        Ok(self.root.pointer_field(0).read_text()?)
    }

    pub fn aux_question_id(&self) -> u32 {
        self.root.get_u32(12)
    }

    pub fn third_party_recipient(&self) -> Result<&'a [u8], ProtoError> {
        Ok(self.root.pointer_field(1).read_data()?)
    }
}

pub struct ReturnBuilder {
    pub msg: MessageBuilder,
    root: StructBuilder,
}

impl ReturnBuilder {
    fn new_raw(question_id: u32, variant: ReturnVariantTag) -> Self {
        let (msg, mut root) = new_root(MessageKind::Return, 2, 2);
        root.set_u32(4, question_id);
        root.set_u8(8, variant as u8);
        Self { msg, root }
    }

    pub fn results(question_id: u32) -> Result<(Self, PayloadBuilder), OutOfBounds> {
        let mut this = Self::new_raw(question_id, ReturnVariantTag::Results);
        let payload_struct = this.root.init_struct_pointer(0, 0, 2)?;
        Ok((this, PayloadBuilder::from_struct(payload_struct)))
    }

    pub fn exception(question_id: u32, reason: &str) -> Result<Self, OutOfBounds> {
        let mut this = Self::new_raw(question_id, ReturnVariantTag::Exception);
        this.root.set_text(0, reason)?;
        Ok(this)
    }

    pub fn canceled(question_id: u32) -> Self {
        Self::new_raw(question_id, ReturnVariantTag::Canceled)
    }

    pub fn results_sent_elsewhere(question_id: u32) -> Self {
        Self::new_raw(question_id, ReturnVariantTag::ResultsSentElsewhere)
    }

    pub fn take_from_other_question(question_id: u32, other_question_id: u32) -> Self {
        let mut this = Self::new_raw(question_id, ReturnVariantTag::TakeFromOtherQuestion);
        this.root.set_u32(12, other_question_id);
        this
    }

    pub fn accept_from_third_party(question_id: u32, recipient: &[u8]) -> Result<Self, OutOfBounds> {
        let mut this = Self::new_raw(question_id, ReturnVariantTag::AcceptFromThirdParty);
        this.root.set_data(1, recipient)?;
        Ok(this)
    }
}

// ---- finish ----

pub struct FinishReader<'a> {
    root: StructReader<'a>,
}

impl FinishReader<'_> {
    pub fn question_id(&self) -> u32 {
        self.root.get_u32(4)
    }

    pub fn release_result_caps(&self) -> bool {
        self.root.get_bool(8 * 8)
    }
}

pub fn build_finish(question_id: u32, release_result_caps: bool) -> MessageBuilder {
    let (msg, mut root) = new_root(MessageKind::Finish, 2, 0);
    root.set_u32(4, question_id);
    root.set_bool(8 * 8, release_result_caps);
    msg
}

// ---- resolve ----

pub enum ResolveOutcome {
    Cap(CapDescriptor),
    Exception(String),
}

pub struct ResolveReader<'a> {
    root: StructReader<'a>,
}

impl ResolveReader<'_> {
    pub fn export_id(&self) -> u32 {
        self.root.get_u32(4)
    }

    pub fn outcome(&self) -> Result<ResolveOutcome, ProtoError> {
        match self.root.get_u8(8) {
            0 => {
                let cap = self.root.pointer_field(0).read_struct()?;
                Ok(ResolveOutcome::Cap(read_lone_cap_descriptor(&cap)?))
            }
            1 => Ok(ResolveOutcome::Exception(
                self.root.pointer_field(0).read_text()?.to_string(),
            )),
            tag => Err(ProtoError::UnknownCapDescriptor { tag }),
        }
    }
}

fn read_lone_cap_descriptor(reader: &StructReader) -> Result<CapDescriptor, ProtoError> {
    // Mirrors `CapDescriptor::read`'s layout; kept local because resolve's
    // cap slot isn't part of a cap table list.
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
            transform: Vec::new(),
        }),
        5 => Ok(CapDescriptor::ThirdPartyHosted {
            vine_id: reader.get_u32(4),
            recipient: reader.pointer_field(0).read_data()?.to_vec(),
        }),
        tag => Err(ProtoError::UnknownCapDescriptor { tag }),
    }
}

pub fn build_resolve_cap(export_id: u32, export_cap_id: u32) -> MessageBuilder {
    let (msg, mut root) = new_root(MessageKind::Resolve, 2, 1);
    root.set_u32(4, export_id);
    root.set_u8(8, 0);
    let mut cap = root
        .init_struct_pointer(0, 2, 1)
        .expect("fixed-size resolve cap allocation");
    cap.set_u8(0, 1);
    cap.set_u32(4, export_cap_id);
    msg
}

pub fn build_resolve_exception(export_id: u32, reason: &str) -> MessageBuilder {
    let (msg, mut root) = new_root(MessageKind::Resolve, 2, 1);
    root.set_u32(4, export_id);
    root.set_u8(8, 1);
    root.set_text(0, reason).expect("text always fits a freshly allocated pointer");
    msg
}

// ---- release ----

pub struct ReleaseReader<'a> {
    root: StructReader<'a>,
}

impl ReleaseReader<'_> {
    pub fn export_id(&self) -> u32 {
        self.root.get_u32(4)
    }

    pub fn reference_count(&self) -> u32 {
        self.root.get_u32(8)
    }
}

pub fn build_release(export_id: u32, reference_count: u32) -> MessageBuilder {
    let (msg, mut root) = new_root(MessageKind::Release, 2, 0);
    root.set_u32(4, export_id);
    root.set_u32(8, reference_count);
    msg
}

// ---- disembargo ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisembargoContext {
    SenderLoopback,
    ReceiverLoopback,
}

pub struct DisembargoReader<'a> {
    root: StructReader<'a>,
}

impl<'a> DisembargoReader<'a> {
    pub fn context(&self) -> Result<DisembargoContext, ProtoError> {
        match self.root.get_u8(8) {
            0 => Ok(DisembargoContext::SenderLoopback),
            1 => Ok(DisembargoContext::ReceiverLoopback),
            tag => Err(ProtoError::UnknownDisembargoContext { tag }),
        }
    }

    pub fn embargo_id(&self) -> u32 {
        self.root.get_u32(12)
    }

    pub fn target(&self) -> Result<MessageTarget, ProtoError> {
        MessageTarget::read(&self.root, 0)
    }
}

pub fn build_disembargo(
    context: DisembargoContext,
    embargo_id: u32,
    target: &MessageTarget,
) -> Result<MessageBuilder, OutOfBounds> {
    let (msg, mut root) = new_root(MessageKind::Disembargo, 2, 1);
    root.set_u8(8, context as u8);
    root.set_u32(12, embargo_id);
    target.write(&mut root, 0)?;
    Ok(msg)
}

// ---- unimplemented ----

pub struct UnimplementedReader<'a> {
    root: StructReader<'a>,
}

impl<'a> UnimplementedReader<'a> {
    pub fn original_frame(&self) -> Result<&'a [u8], ProtoError> {
        Ok(self.root.pointer_field(0).read_data()?)
    }
}

pub fn build_unimplemented(original_frame: &[u8]) -> Result<MessageBuilder, OutOfBounds> {
    let (msg, mut root) = new_root(MessageKind::Unimplemented, 1, 1);
    root.set_data(0, original_frame)?;
    Ok(msg)
}

// ---- abort ----

pub struct AbortReader<'a> {
    root: StructReader<'a>,
}

impl<'a> AbortReader<'a> {
    pub fn reason(&self) -> Result<&'a str, ProtoError> {
        Ok(self.root.pointer_field(0).read_text()?)
    }
}

pub fn build_abort(reason: &str) -> MessageBuilder {
    let (msg, mut root) = new_root(MessageKind::Abort, 1, 1);
    root.set_text(0, reason).expect("text always fits a freshly allocated pointer");
    msg
}

// ---- provide ----

pub struct ProvideReader<'a> {
    root: StructReader<'a>,
}

impl<'a> ProvideReader<'a> {
    pub fn question_id(&self) -> u32 {
        self.root.get_u32(4)
    }

    pub fn target(&self) -> Result<MessageTarget, ProtoError> {
        MessageTarget::read(&self.root, 0)
    }

    pub fn recipient(&self) -> Result<&'a [u8], ProtoError> {
        Ok(self.root.pointer_field(1).read_data()?)
    }
}

pub fn build_provide(question_id: u32, target: &MessageTarget, recipient: &[u8]) -> Result<MessageBuilder, OutOfBounds> {
    let (msg, mut root) = new_root(MessageKind::Provide, 2, 2);
    root.set_u32(4, question_id);
    target.write(&mut root, 0)?;
    root.set_data(1, recipient)?;
    Ok(msg)
}

// ---- accept ----

pub struct AcceptReader<'a> {
    root: StructReader<'a>,
}

impl<'a> AcceptReader<'a> {
    pub fn question_id(&self) -> u32 {
        self.root.get_u32(4)
    }

    pub fn embargo(&self) -> bool {
        self.root.get_bool(8 * 8)
    }

    pub fn provision(&self) -> Result<&'a [u8], ProtoError> {
        Ok(self.root.pointer_field(0).read_data()?)
    }
}

pub fn build_accept(question_id: u32, provision: &[u8], embargo: bool) -> Result<MessageBuilder, OutOfBounds> {
    let (msg, mut root) = new_root(MessageKind::Accept, 2, 1);
    root.set_u32(4, question_id);
    root.set_bool(8 * 8, embargo);
    root.set_data(0, provision)?;
    Ok(msg)
}

// ---- join ----

pub struct JoinReader<'a> {
    root: StructReader<'a>,
}

impl<'a> JoinReader<'a> {
    pub fn question_id(&self) -> u32 {
        self.root.get_u32(4)
    }

    pub fn join_id(&self) -> u32 {
        self.root.get_u32(8)
    }

    pub fn part_count(&self) -> u32 {
        self.root.get_u32(12)
    }

    pub fn part_num(&self) -> u32 {
        self.root.get_u32(16)
    }

    pub fn target(&self) -> Result<MessageTarget, ProtoError> {
        MessageTarget::read(&self.root, 0)
    }
}

pub fn build_join(
    question_id: u32,
    join_id: u32,
    part_count: u32,
    part_num: u32,
    target: &MessageTarget,
) -> Result<MessageBuilder, OutOfBounds> {
    let (msg, mut root) = new_root(MessageKind::Join, 3, 1);
    root.set_u32(4, question_id);
    root.set_u32(8, join_id);
    root.set_u32(12, part_count);
    root.set_u32(16, part_num);
    target.write(&mut root, 0)?;
    Ok(msg)
}
