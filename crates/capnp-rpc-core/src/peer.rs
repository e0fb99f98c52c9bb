//! The Level 3 peer: owns the four tables and drives every inbound frame
//! through them. Single-threaded by design (see the crate's module docs);
//! an embedder wanting concurrency runs one `Peer` per connection behind
//! its own task and talks to it through channels, the same shape the
//! transport layer one level up (`capnp-rpc-io`) uses.

use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;
use capnp_message::{decode_frame, encode_frame, AnyPointerReader};
use capnp_rpc_proto::{
    build_abort, build_accept, build_bootstrap, build_disembargo, build_join, build_provide, build_resolve_cap,
    build_resolve_exception, CallBuilder, CallReader, CapDescriptor, DecodedMessage, DisembargoContext, MessageKind,
    MessageTarget, PayloadBuilder, ProtoError, ReturnBuilder, ReturnReader, ReturnVariantTag, SendResultsTo,
};

use crate::cap_table::{CapabilityHandler, Export, Import, InboundCapTable, PendingCall, Resolution, ResolvedCap};
use crate::embargo::Embargoes;
use crate::error::{Reason, RpcError};
use crate::limits::PeerLimits;
use crate::planner::{plan_imported_target, plan_promised_target, ForwardReturnMode, ImportedTargetPlan, PromisedTargetPlan};
use crate::provide_accept::{InsertJoinPartOutcome, JoinOutcome, JoinTable, ProvideOutcome, ProvideTable};
use crate::question_answer::{Answer, AnswerState, Question, QuestionDisposition};
use crate::slab::IdTable;

/// Callbacks the peer invokes for events an embedder needs to react to but
/// that don't otherwise produce an outbound frame: a `Return` landing for a
/// question the embedder itself asked (as opposed to one forwarded on
/// another peer's behalf), and the connection-ending decision to abort.
pub trait PeerEffects {
    fn on_local_return(&mut self, question_id: u32, ret: &ReturnReader<'_>);
    fn on_abort(&mut self, reason: &str);
}

/// Outcome of `Peer::call_import`: whether the call went out immediately or
/// is waiting on the import's promise to resolve (or an outstanding
/// embargo to drain).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Sent { question_id: u32 },
    Queued { question_id: u32 },
}

/// One side of a Level 3 connection: the four tables, the three-party
/// introduction tables, the embargo tracker, and the outbound frame queue.
/// Frames in and out are opaque `Vec<u8>`s — wiring them to an actual
/// transport is the I/O adapter's job, not this crate's.
pub struct Peer<E: PeerEffects> {
    limits: PeerLimits,
    questions: IdTable<Question>,
    answers: IdTable<Answer>,
    exports: IdTable<Export>,
    imports: IdTable<Import>,
    provide: ProvideTable,
    joins: JoinTable,
    embargoes: Embargoes,
    bootstrap: Option<Rc<dyn CapabilityHandler>>,
    outbound: VecDeque<Vec<u8>>,
    outbound_bytes: u64,
    effects: E,
}

impl<E: PeerEffects> Peer<E> {
    pub fn new(limits: PeerLimits, effects: E) -> Self {
        Self {
            limits,
            questions: IdTable::new(),
            answers: IdTable::new(),
            exports: IdTable::new(),
            imports: IdTable::new(),
            provide: ProvideTable::new(),
            joins: JoinTable::new(),
            embargoes: Embargoes::new(),
            bootstrap: None,
            outbound: VecDeque::new(),
            outbound_bytes: 0,
            effects,
        }
    }

    pub fn set_bootstrap_handler(&mut self, handler: Rc<dyn CapabilityHandler>) {
        self.bootstrap = Some(handler);
    }

    /// Export a capability this peer hosts under a freshly chosen id,
    /// returning that id so the embedder can reference it in a
    /// `CapDescriptor::SenderHosted` (e.g. to hand it back from a method's
    /// own results).
    pub fn export_capability(&mut self, handler: Rc<dyn CapabilityHandler>) -> u32 {
        self.exports.insert_new(Export::new_resolved(handler))
    }

    /// Export a capability that isn't resolved yet: calls against it queue
    /// until [`Peer::resolve_export`] is called.
    pub fn new_promise_export(&mut self, handler: Rc<dyn CapabilityHandler>) -> u32 {
        self.exports.insert_new(Export::new_promise(handler))
    }

    pub fn pop_outbound_frame(&mut self) -> Option<Vec<u8>> {
        let frame = self.outbound.pop_front()?;
        self.outbound_bytes = self.outbound_bytes.saturating_sub(frame.len() as u64);
        Some(frame)
    }

    pub fn outbound_frame_count(&self) -> usize {
        self.outbound.len()
    }

    pub fn outbound_byte_count(&self) -> u64 {
        self.outbound_bytes
    }

    pub fn question_count(&self) -> usize {
        self.questions.len()
    }

    /// Access to the effects sink, for an embedder (or test) that needs to
    /// read back what `on_local_return`/`on_abort` recorded rather than
    /// reacting to them as they happen.
    pub fn effects(&self) -> &E {
        &self.effects
    }

    pub fn effects_mut(&mut self) -> &mut E {
        &mut self.effects
    }

    // ---- encode / send plumbing ----

    fn encode(&self, msg: capnp_message::MessageBuilder) -> Result<Vec<u8>, RpcError> {
        let segments = msg.finish();
        Ok(encode_frame(&segments)?)
    }

    fn enqueue_bytes(&mut self, bytes: Vec<u8>) {
        self.outbound_bytes += bytes.len() as u64;
        self.outbound.push_back(bytes);
    }

    /// Checks the outbound limits for a frame of `next_frame_bytes` bytes
    /// without touching any table. Every method that originates an
    /// outbound message calls this *before* mutating the question/answer
    /// tables, so a rejected send never leaves a half-committed entry.
    fn check_send_limits(&self, next_frame_bytes: u64) -> Result<(), RpcError> {
        if let Some(max) = self.limits.max_outbound_frames() {
            if self.outbound.len() as u32 + 1 > max {
                return Err(RpcError::OutgoingQueueLimitExceeded);
            }
        }
        if let Some(max) = self.limits.max_outbound_bytes() {
            if self.outbound_bytes + next_frame_bytes > max {
                return Err(RpcError::OutgoingBytesLimitExceeded);
            }
        }
        Ok(())
    }

    /// Check limits, then send an already-encoded frame with no table
    /// mutation attached (aborts, disembargo echoes, `Resolve`).
    fn send_preencoded(&mut self, bytes: Vec<u8>) -> Result<(), RpcError> {
        self.check_send_limits(bytes.len() as u64)?;
        self.enqueue_bytes(bytes);
        Ok(())
    }

    /// Check limits, insert a freshly allocated `Question`, then send.
    /// `expected_id` is the id `bytes` was built to carry — peeked before
    /// encoding so the frame and the table agree on the id without
    /// allocating it twice.
    fn commit_question(
        &mut self,
        expected_id: u32,
        bytes: Vec<u8>,
        disposition: QuestionDisposition,
        is_bootstrap: bool,
    ) -> Result<u32, RpcError> {
        self.check_send_limits(bytes.len() as u64)?;
        let question_id = self.questions.insert_new(Question::new(disposition, is_bootstrap));
        debug_assert_eq!(
            question_id, expected_id,
            "no other question-table insert may happen between peek_next_id and commit_question"
        );
        self.enqueue_bytes(bytes);
        Ok(question_id)
    }

    fn send_abort_text(&mut self, reason: Reason) -> Result<(), RpcError> {
        self.send_abort(reason.reason_str())
    }

    fn send_abort(&mut self, reason: &str) -> Result<(), RpcError> {
        let bytes = self.encode(build_abort(reason))?;
        self.send_preencoded(bytes)?;
        self.effects.on_abort(reason);
        Ok(())
    }

    // ---- answering inbound questions (Call, Provide, Accept, Join all
    // answer through the same Answer table, so a pipelined call can
    // target any of their results) ----

    fn finish_answer(&mut self, question_id: u32, target: Option<ResolvedCap>, bytes: Vec<u8>) -> Result<(), RpcError> {
        self.check_send_limits(bytes.len() as u64)?;
        let answer = self.answers.get_or_insert_with(question_id, Answer::new_pending);
        answer.mark_returned(target, Some(bytes.clone()));
        let pending = answer.take_pending_calls();
        self.enqueue_bytes(bytes);
        for call in pending {
            self.dispatch(&call.frame)?;
        }
        Ok(())
    }

    fn send_return_exception(&mut self, question_id: u32, reason: Reason) -> Result<(), RpcError> {
        self.send_return_exception_text(question_id, reason.reason_str())
    }

    fn send_return_exception_text(&mut self, question_id: u32, reason: &str) -> Result<(), RpcError> {
        let builder = ReturnBuilder::exception(question_id, reason)?;
        let bytes = self.encode(builder.msg)?;
        self.finish_answer(question_id, Some(ResolvedCap::Broken), bytes)
    }

    /// Answer `question_id` with a bare capability result (as opposed to a
    /// method's own return struct) — the shape `Accept` and a converged
    /// `Join` leg both return.
    fn send_return_results_with_cap(&mut self, question_id: u32, target: ResolvedCap) -> Result<(), RpcError> {
        let (builder, mut payload) = ReturnBuilder::results(question_id)?;
        let descriptor = self.resolved_cap_to_descriptor(&target);
        payload.set_cap_table(std::slice::from_ref(&descriptor))?;
        payload.set_content_capability(0)?;
        let bytes = self.encode(builder.msg)?;
        self.finish_answer(question_id, Some(target), bytes)
    }

    fn resolved_cap_to_descriptor(&self, cap: &ResolvedCap) -> CapDescriptor {
        match cap {
            ResolvedCap::None | ResolvedCap::Broken => CapDescriptor::None,
            ResolvedCap::Exported { export_id } => {
                let is_promise = self
                    .exports
                    .get(*export_id)
                    .is_some_and(|export| export.is_promise && !export.is_resolved());
                if is_promise {
                    CapDescriptor::SenderPromise { export_id: *export_id }
                } else {
                    CapDescriptor::SenderHosted { export_id: *export_id }
                }
            }
            ResolvedCap::Imported { import_id } => CapDescriptor::ReceiverHosted { import_id: *import_id },
            ResolvedCap::Promised { question_id, transform } => CapDescriptor::ReceiverAnswer {
                question_id: *question_id,
                transform: transform.clone(),
            },
        }
    }

    /// Resolves a wire `MessageTarget` as found in an inbound `Provide` or
    /// `Join`, against this peer's own tables — `importedCap` always names
    /// one of our own exports on receipt, the same convention
    /// `handle_call_to_export` relies on for ordinary calls.
    fn resolve_message_target(&self, target: &MessageTarget) -> Option<ResolvedCap> {
        match target {
            MessageTarget::ImportedCap { export_id } => {
                self.exports.get(*export_id)?;
                Some(ResolvedCap::Exported { export_id: *export_id })
            }
            MessageTarget::PromisedAnswer { question_id, transform } => self.walk_answer_transform(*question_id, transform),
        }
    }

    /// Re-decodes a stored `Return.results` frame and walks a pipeline
    /// transform through it, resolving the terminal capability slot. Used
    /// both for ordinary promise pipelining and for a `Provide`/`Join`
    /// target expressed as a `promisedAnswer`.
    fn walk_answer_transform(&self, answer_question_id: u32, transform: &[capnp_rpc_proto::PipelineOp]) -> Option<ResolvedCap> {
        let answer = self.answers.get(answer_question_id)?;
        let frame_bytes = answer.results_frame.as_ref()?;
        let bytes = Bytes::copy_from_slice(frame_bytes);
        let (reader, _) = decode_frame(&bytes).ok()?;
        let root = AnyPointerReader::new(&reader, 0, 0);
        let decoded = DecodedMessage::init(root).ok()?;
        let ret = decoded.as_return().ok()?;
        if ret.variant().ok()? != ReturnVariantTag::Results {
            return Some(ResolvedCap::Broken);
        }
        let results = ret.results().ok()?;
        let index = crate::cap_table::resolve_transform(&results, transform).ok()??;
        let caps = results.cap_table().ok()?;
        caps.get(index as usize).map(descriptor_to_resolved_cap)
    }

    // ---- dispatch ----

    pub fn dispatch(&mut self, frame: &[u8]) -> Result<(), RpcError> {
        let bytes = Bytes::copy_from_slice(frame);
        let (reader, _) = decode_frame(&bytes).map_err(ProtoError::from)?;
        let root = AnyPointerReader::new(&reader, 0, 0);
        let decoded = DecodedMessage::init(root)?;
        match decoded.kind() {
            MessageKind::Bootstrap => self.handle_bootstrap(decoded.as_bootstrap()?),
            MessageKind::Call => self.handle_call(frame, decoded.as_call()?),
            MessageKind::Return => self.handle_return(decoded.as_return()?),
            MessageKind::Finish => self.handle_finish(decoded.as_finish()?),
            MessageKind::Resolve => self.handle_resolve(decoded.as_resolve()?),
            MessageKind::Release => self.handle_release(decoded.as_release()?),
            MessageKind::Disembargo => self.handle_disembargo(decoded.as_disembargo()?),
            MessageKind::Provide => self.handle_provide(decoded.as_provide()?),
            MessageKind::Accept => self.handle_accept(decoded.as_accept()?),
            MessageKind::Join => self.handle_join(decoded.as_join()?),
            MessageKind::Unimplemented | MessageKind::Abort => Ok(()),
        }
    }

    fn handle_bootstrap(&mut self, bootstrap: capnp_rpc_proto::BootstrapReader<'_>) -> Result<(), RpcError> {
        let question_id = bootstrap.question_id();
        match self.bootstrap.clone() {
            Some(handler) => {
                let export_id = self.exports.insert_new(Export::new_resolved(handler));
                self.send_return_results_with_cap(question_id, ResolvedCap::Exported { export_id })
            }
            None => self.send_return_exception(question_id, Reason::BootstrapStub),
        }
    }

    fn handle_call(&mut self, frame: &[u8], call: CallReader<'_>) -> Result<(), RpcError> {
        {
            let params = call.params()?;
            let caps = params.cap_table()?;
            InboundCapTable::new(&mut self.imports, &caps);
        }
        match call.target()? {
            MessageTarget::ImportedCap { export_id } => self.handle_call_to_export(frame, export_id, call),
            MessageTarget::PromisedAnswer { question_id, transform } => {
                self.handle_call_to_promised_answer(frame, question_id, transform, call)
            }
        }
    }

    fn handle_call_to_export(&mut self, frame: &[u8], export_id: u32, call: CallReader<'_>) -> Result<(), RpcError> {
        let question_id = call.question_id();
        let (has_export, is_promise, resolved) = match self.exports.get(export_id) {
            None => (false, false, None),
            Some(export) if export.is_promise => {
                let resolved = export.resolution.as_ref().map(|r| !matches!(r, Resolution::Broken(_)));
                (true, true, resolved)
            }
            Some(_) => (true, false, None),
        };
        // `Export::handler` is never optional in this representation, so
        // `has_handler` tracks `has_export`: `MissingExportHandler` is
        // structurally unreachable here, but the planner still names it
        // for embedders whose export representation makes the handler
        // itself optional.
        match plan_imported_target(has_export, is_promise, resolved, has_export) {
            ImportedTargetPlan::UnknownCapability => self.send_return_exception(question_id, Reason::UnknownCapability),
            ImportedTargetPlan::PromiseBroken => self.send_return_exception(question_id, Reason::PromiseBroken),
            ImportedTargetPlan::MissingExportHandler => {
                self.send_return_exception(question_id, Reason::MissingExportHandler)
            }
            ImportedTargetPlan::QueuePromiseExport => {
                self.exports
                    .get_mut(export_id)
                    .expect("has_export checked above")
                    .pending_calls
                    .push(PendingCall {
                        frame: frame.to_vec(),
                        inbound_caps: Vec::new(),
                    });
                Ok(())
            }
            ImportedTargetPlan::CallHandler => {
                let handler = Rc::clone(&self.exports.get(export_id).expect("has_export checked above").handler);
                self.dispatch_to_handler(question_id, &handler, &call)
            }
            ImportedTargetPlan::HandleResolved => {
                enum Next {
                    Handler(Rc<dyn CapabilityHandler>),
                    OtherExport(u32),
                }
                let next = match &self.exports.get(export_id).expect("has_export checked above").resolution {
                    Some(Resolution::Local(handler)) => Next::Handler(Rc::clone(handler)),
                    Some(Resolution::ExportedElsewhere(other_id)) => Next::OtherExport(*other_id),
                    _ => unreachable!("resolved implies a Local or ExportedElsewhere resolution"),
                };
                match next {
                    Next::Handler(handler) => self.dispatch_to_handler(question_id, &handler, &call),
                    Next::OtherExport(other_id) => self.handle_call_to_export(frame, other_id, call),
                }
            }
        }
    }

    fn handle_call_to_promised_answer(
        &mut self,
        frame: &[u8],
        answer_question_id: u32,
        transform: Vec<capnp_rpc_proto::PipelineOp>,
        call: CallReader<'_>,
    ) -> Result<(), RpcError> {
        let caller_question_id = call.question_id();
        let answer_ready = self
            .answers
            .get(answer_question_id)
            .map(|a| a.state == AnswerState::Returned)
            .unwrap_or(false);
        if !answer_ready {
            let answer = self.answers.get_or_insert_with(answer_question_id, Answer::new_pending);
            answer.queue_pending_call(PendingCall {
                frame: frame.to_vec(),
                inbound_caps: Vec::new(),
            });
            answer.track_pipelined_question(caller_question_id);
            return Ok(());
        }
        let terminal = self.walk_answer_transform(answer_question_id, &transform);
        match plan_promised_target(true, terminal.as_ref()) {
            PromisedTargetPlan::QueuePromisedCall => {
                unreachable!("answer_ready guarantees plan_promised_target resolves a terminal")
            }
            PromisedTargetPlan::SendException => {
                self.send_return_exception(caller_question_id, Reason::UnknownPromisedCapability)
            }
            PromisedTargetPlan::QueueExportPromise => match terminal {
                Some(ResolvedCap::Promised {
                    question_id: inner_question,
                    transform: inner_transform,
                }) => self.handle_call_to_promised_answer(frame, inner_question, inner_transform, call),
                _ => self.send_return_exception(caller_question_id, Reason::PromisedCapabilityUnresolved),
            },
            PromisedTargetPlan::HandleResolved => match terminal {
                Some(ResolvedCap::Exported { export_id }) => self.handle_call_to_export(frame, export_id, call),
                Some(ResolvedCap::Imported { .. }) => {
                    self.send_return_exception(caller_question_id, Reason::MissingPromisedCapabilityHandler)
                }
                _ => self.send_return_exception(caller_question_id, Reason::UnknownPromisedCapability),
            },
        }
    }

    fn dispatch_to_handler(
        &mut self,
        question_id: u32,
        handler: &Rc<dyn CapabilityHandler>,
        call: &CallReader<'_>,
    ) -> Result<(), RpcError> {
        let params = call.params()?;
        let (builder, mut payload) = ReturnBuilder::results(question_id)?;
        match handler.handle_call(call.interface_id(), call.method_id(), params, &mut payload) {
            Ok(()) => {
                let bytes = self.encode(builder.msg)?;
                self.finish_answer(question_id, None, bytes)
            }
            Err(reason) => self.send_return_exception_text(question_id, &reason),
        }
    }

    fn handle_return(&mut self, ret: ReturnReader<'_>) -> Result<(), RpcError> {
        let question_id = ret.question_id();
        let Some(question) = self.questions.get(question_id) else {
            return Ok(());
        };
        if ret.variant()? == ReturnVariantTag::TakeFromOtherQuestion {
            let other = ret.aux_question_id();
            self.questions
                .get_mut(question_id)
                .expect("checked above")
                .mark_awaiting_take_from_other(other);
            return Ok(());
        }
        let disposition = question.disposition.clone();
        self.questions.get_mut(question_id).expect("checked above").mark_returned();
        match disposition {
            QuestionDisposition::Local => {
                self.effects.on_local_return(question_id, &ret);
                Ok(())
            }
            QuestionDisposition::Forwarded(mode) => self.forward_return(question_id, mode, &ret),
        }
    }

    fn forward_return(&mut self, question_id: u32, mode: ForwardReturnMode, ret: &ReturnReader<'_>) -> Result<(), RpcError> {
        match mode {
            ForwardReturnMode::TranslateToCaller => match ret.variant()? {
                ReturnVariantTag::Results => {
                    let results = ret.results()?;
                    let cap_table = results.cap_table()?;
                    let (builder, mut payload) = ReturnBuilder::results(question_id)?;
                    payload.set_cap_table(&cap_table)?;
                    if let Some(index) = results.content().read_capability_index().ok().flatten() {
                        payload.set_content_capability(index)?;
                    }
                    let bytes = self.encode(builder.msg)?;
                    self.send_preencoded(bytes)
                }
                ReturnVariantTag::Exception => {
                    let reason = ret.exception_reason()?;
                    let builder = ReturnBuilder::exception(question_id, reason)?;
                    let bytes = self.encode(builder.msg)?;
                    self.send_preencoded(bytes)
                }
                _ => self.send_abort_text(Reason::UnknownCapability),
            },
            ForwardReturnMode::SentElsewhere { upstream_question_id } => {
                let builder = ReturnBuilder::take_from_other_question(upstream_question_id, question_id);
                let bytes = self.encode(builder.msg)?;
                self.send_preencoded(bytes)
            }
            ForwardReturnMode::PropagateResultsSentElsewhere => {
                let builder = ReturnBuilder::results_sent_elsewhere(question_id);
                let bytes = self.encode(builder.msg)?;
                self.send_preencoded(bytes)
            }
            ForwardReturnMode::PropagateAcceptFromThirdParty { recipient } => {
                let builder = ReturnBuilder::accept_from_third_party(question_id, &recipient)?;
                let bytes = self.encode(builder.msg)?;
                self.send_preencoded(bytes)
            }
        }
    }

    pub fn send_finish(&mut self, question_id: u32, release_result_caps: bool) -> Result<(), RpcError> {
        let bytes = self.encode(capnp_rpc_proto::build_finish(question_id, release_result_caps))?;
        self.send_preencoded(bytes)?;
        if let Some(question) = self.questions.get_mut(question_id) {
            if question.mark_finished() {
                self.questions.remove(question_id);
            }
        }
        Ok(())
    }

    fn handle_finish(&mut self, finish: capnp_rpc_proto::FinishReader<'_>) -> Result<(), RpcError> {
        let question_id = finish.question_id();
        if let Some(answer) = self.answers.get_mut(question_id) {
            answer.finish_received = true;
            if answer.is_complete() {
                self.answers.remove(question_id);
            }
        }
        Ok(())
    }

    pub fn resolve_export(&mut self, export_id: u32, resolution: Resolution) -> Result<(), RpcError> {
        let msg = {
            let export = self
                .exports
                .get_mut(export_id)
                .ok_or_else(|| RpcError::ProtocolViolation(format!("no such export: {export_id}")))?;
            let msg = match &resolution {
                Resolution::Local(_) => build_resolve_cap(export_id, export_id),
                Resolution::ExportedElsewhere(other_id) => build_resolve_cap(export_id, *other_id),
                Resolution::Broken(reason) => build_resolve_exception(export_id, reason),
            };
            export.resolution = Some(resolution);
            msg
        };
        let bytes = self.encode(msg)?;
        self.send_preencoded(bytes)?;
        let pending = self
            .exports
            .get_mut(export_id)
            .expect("checked above")
            .take_pending_calls();
        for call in pending {
            self.dispatch(&call.frame)?;
        }
        Ok(())
    }

    fn handle_resolve(&mut self, resolve: capnp_rpc_proto::ResolveReader<'_>) -> Result<(), RpcError> {
        let import_id = resolve.export_id();
        if self.imports.get(import_id).is_none() {
            return Ok(());
        }
        let resolution = match resolve.outcome()? {
            capnp_rpc_proto::ResolveOutcome::Cap(descriptor) => match descriptor_to_resolved_cap(&descriptor) {
                ResolvedCap::Exported { export_id } => Resolution::ExportedElsewhere(export_id),
                _ => Resolution::Broken("resolved capability is not locally dispatchable".to_string()),
            },
            capnp_rpc_proto::ResolveOutcome::Exception(reason) => Resolution::Broken(reason),
        };
        {
            let import = self.imports.get_mut(import_id).expect("checked above");
            import.resolution = Some(resolution);
            import.is_promise = false;
        }
        self.drain_import_pending_calls(import_id);
        Ok(())
    }

    fn drain_import_pending_calls(&mut self, import_id: u32) {
        let Some(import) = self.imports.get_mut(import_id) else {
            return;
        };
        let pending = import.take_pending_calls();
        for call in pending {
            self.enqueue_bytes(call.frame);
        }
    }

    fn handle_release(&mut self, release: capnp_rpc_proto::ReleaseReader<'_>) -> Result<(), RpcError> {
        let export_id = release.export_id();
        let count = release.reference_count();
        if let Some(export) = self.exports.get_mut(export_id) {
            export.ref_count = export.ref_count.saturating_sub(count);
            if export.ref_count == 0 {
                self.exports.remove(export_id);
            }
        }
        Ok(())
    }

    fn handle_disembargo(&mut self, disembargo: capnp_rpc_proto::DisembargoReader<'_>) -> Result<(), RpcError> {
        let context = disembargo.context()?;
        let embargo_id = disembargo.embargo_id();
        let target = disembargo.target()?;
        match context {
            DisembargoContext::ReceiverLoopback => {
                let msg = build_disembargo(DisembargoContext::SenderLoopback, embargo_id, &target)?;
                let bytes = self.encode(msg)?;
                self.send_preencoded(bytes)
            }
            DisembargoContext::SenderLoopback => {
                let MessageTarget::ImportedCap { export_id: import_id } = target else {
                    return self.send_abort_text(Reason::UnknownCapability);
                };
                let released = self.embargoes.on_disembargo_echo(import_id, context, embargo_id);
                for frame in released {
                    self.enqueue_bytes(frame);
                }
                Ok(())
            }
        }
    }

    fn handle_provide(&mut self, provide: capnp_rpc_proto::ProvideReader<'_>) -> Result<(), RpcError> {
        let question_id = provide.question_id();
        let recipient = provide.recipient()?.to_vec();
        let target = provide.target()?;
        let Some(resolved) = self.resolve_message_target(&target) else {
            return self.send_return_exception(question_id, Reason::UnknownCapability);
        };
        match self.provide.insert(question_id, recipient, resolved) {
            ProvideOutcome::Inserted => Ok(()),
            ProvideOutcome::DuplicateQuestion => self.send_abort_text(Reason::DuplicateProvideQuestion),
            ProvideOutcome::DuplicateRecipient => self.send_abort_text(Reason::DuplicateProvideRecipient),
        }
    }

    fn handle_accept(&mut self, accept: capnp_rpc_proto::AcceptReader<'_>) -> Result<(), RpcError> {
        let question_id = accept.question_id();
        let provision = accept.provision()?;
        match self.provide.accept(provision) {
            Some(target) => self.send_return_results_with_cap(question_id, target),
            None => self.send_return_exception(question_id, Reason::UnknownProvision),
        }
    }

    fn handle_join(&mut self, join: capnp_rpc_proto::JoinReader<'_>) -> Result<(), RpcError> {
        let question_id = join.question_id();
        let join_id = join.join_id();
        let part_count = join.part_count();
        let part_num = join.part_num();
        let target = join.target()?;
        let Some(resolved) = self.resolve_message_target(&target) else {
            return self.send_return_exception(question_id, Reason::UnknownCapability);
        };
        match self.joins.insert_part(join_id, part_count, part_num, question_id, resolved) {
            InsertJoinPartOutcome::Inserted => Ok(()),
            InsertJoinPartOutcome::DuplicatePart => self.send_abort_text(Reason::DuplicateJoinQuestion),
            InsertJoinPartOutcome::PartCountMismatch => self.send_abort_text(Reason::JoinMismatch),
            InsertJoinPartOutcome::InsertedReady => {
                match self.joins.complete_join(join_id).expect("just reported ready") {
                    JoinOutcome::Converged { question_ids, target } => {
                        for qid in question_ids {
                            self.send_return_results_with_cap(qid, target.clone())?;
                        }
                        Ok(())
                    }
                    JoinOutcome::Mismatch { question_ids } => {
                        for qid in question_ids {
                            self.send_return_exception(qid, Reason::JoinMismatch)?;
                        }
                        Ok(())
                    }
                }
            }
        }
    }

    // ---- originating calls ----

    pub fn send_bootstrap(&mut self) -> Result<u32, RpcError> {
        let question_id = self.questions.peek_next_id();
        let bytes = self.encode(build_bootstrap(question_id))?;
        self.commit_question(question_id, bytes, QuestionDisposition::Local, true)
    }

    pub fn send_provide(&mut self, target: MessageTarget, recipient: Vec<u8>) -> Result<u32, RpcError> {
        let question_id = self.questions.peek_next_id();
        let bytes = self.encode(build_provide(question_id, &target, &recipient)?)?;
        self.commit_question(question_id, bytes, QuestionDisposition::Local, false)
    }

    pub fn send_accept(&mut self, provision: Vec<u8>, embargo: bool) -> Result<u32, RpcError> {
        let question_id = self.questions.peek_next_id();
        let bytes = self.encode(build_accept(question_id, &provision, embargo)?)?;
        self.commit_question(question_id, bytes, QuestionDisposition::Local, false)
    }

    pub fn send_join(&mut self, join_id: u32, part_count: u32, part_num: u32, target: MessageTarget) -> Result<u32, RpcError> {
        let question_id = self.questions.peek_next_id();
        let bytes = self.encode(build_join(question_id, join_id, part_count, part_num, &target)?)?;
        self.commit_question(question_id, bytes, QuestionDisposition::Local, false)
    }

    /// Start an embargo on `import_id`: calls `call_import` makes against it
    /// from now on queue until the other side echoes the loopback
    /// `Disembargo` this sends. An embedder reaches for this when a promise
    /// resolves to a capability reachable by a shorter path than the one
    /// calls already in flight took, and must not let a new call overtake
    /// them.
    pub fn begin_embargo(&mut self, import_id: u32) -> Result<u32, RpcError> {
        let embargo_id = self.embargoes.issue(import_id);
        let target = MessageTarget::ImportedCap { export_id: import_id };
        let msg = build_disembargo(DisembargoContext::ReceiverLoopback, embargo_id, &target)?;
        let bytes = self.encode(msg)?;
        self.send_preencoded(bytes)?;
        Ok(embargo_id)
    }

    /// Call through a resolved or still-resolving import. `build_params`
    /// fills in the call's parameter payload. If the import is an
    /// unresolved promise, or currently embargoed, the frame is held and
    /// sent once the resolution (or disembargo echo) arrives — the
    /// question is allocated either way, since from the caller's
    /// perspective the call has already gone out and it's waiting on a
    /// `Return`.
    pub fn call_import<F>(
        &mut self,
        import_id: u32,
        interface_id: u64,
        method_id: u32,
        disposition: QuestionDisposition,
        build_params: F,
    ) -> Result<CallOutcome, RpcError>
    where
        F: FnOnce(&mut PayloadBuilder) -> Result<(), capnp_message::OutOfBounds>,
    {
        if !self.imports.contains(import_id) {
            return Err(RpcError::ProtocolViolation(format!("no such import: {import_id}")));
        }
        let question_id = self.questions.peek_next_id();
        let target = MessageTarget::ImportedCap { export_id: import_id };
        let mut builder = CallBuilder::new(question_id, interface_id, method_id, SendResultsTo::Caller, &target)?;
        {
            let mut params = builder.params()?;
            build_params(&mut params)?;
        }
        let bytes = self.encode(builder.msg)?;
        self.check_send_limits(bytes.len() as u64)?;
        let committed_id = self.questions.insert_new(Question::new(disposition, false));
        debug_assert_eq!(committed_id, question_id);

        let waiting = self
            .imports
            .get(import_id)
            .is_some_and(|i| i.is_promise && i.resolution.is_none());
        if waiting {
            self.imports
                .get_mut(import_id)
                .expect("checked above")
                .pending_calls
                .push(PendingCall {
                    frame: bytes,
                    inbound_caps: Vec::new(),
                });
            Ok(CallOutcome::Queued { question_id })
        } else if self.embargoes.is_embargoed(import_id) {
            // Goes through the embargo's own FIFO, not `Import::pending_calls`,
            // so `handle_disembargo`'s echo handler (which only drains that
            // FIFO) is the thing that releases it.
            self.embargoes.queue_call(import_id, bytes);
            Ok(CallOutcome::Queued { question_id })
        } else {
            self.enqueue_bytes(bytes);
            Ok(CallOutcome::Sent { question_id })
        }
    }
}

/// The converse of [`Peer::resolved_cap_to_descriptor`]: turns a wire
/// `CapDescriptor` we're reading back out of our own stored cap tables
/// into the internal representation used for pipelining and routing.
pub fn descriptor_to_resolved_cap(descriptor: &CapDescriptor) -> ResolvedCap {
    match descriptor {
        CapDescriptor::None => ResolvedCap::None,
        CapDescriptor::SenderHosted { export_id } | CapDescriptor::SenderPromise { export_id } => {
            ResolvedCap::Exported { export_id: *export_id }
        }
        CapDescriptor::ReceiverHosted { import_id } => ResolvedCap::Imported { import_id: *import_id },
        CapDescriptor::ReceiverAnswer { question_id, transform } => ResolvedCap::Promised {
            question_id: *question_id,
            transform: transform.clone(),
        },
        CapDescriptor::ThirdPartyHosted { .. } => ResolvedCap::Broken,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    impl CapabilityHandler for EchoHandler {
        fn handle_call(
            &self,
            _interface_id: u64,
            _method_id: u32,
            params: capnp_rpc_proto::PayloadReader<'_>,
            results: &mut PayloadBuilder,
        ) -> Result<(), String> {
            let value = params.content().read_struct().map(|s| s.get_u64(0)).unwrap_or(0);
            let mut content = results.init_content(1, 0).map_err(|e| e.to_string())?;
            content.set_u64(0, value + 1);
            results.set_cap_table(&[]).map_err(|e| e.to_string())?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestEffects {
        local_returns: Vec<(u32, ReturnVariantTag)>,
        aborts: Vec<String>,
    }

    impl PeerEffects for TestEffects {
        fn on_local_return(&mut self, question_id: u32, ret: &ReturnReader<'_>) {
            self.local_returns.push((question_id, ret.variant().unwrap()));
        }

        fn on_abort(&mut self, reason: &str) {
            self.aborts.push(reason.to_string());
        }
    }

    fn build_call_frame_with_caps(question_id: u32, target: MessageTarget, value: u64, caps: &[CapDescriptor]) -> Vec<u8> {
        let mut builder = CallBuilder::new(question_id, 1, 2, SendResultsTo::Caller, &target).unwrap();
        {
            let mut params = builder.params().unwrap();
            let mut content = params.init_content(1, 0).unwrap();
            content.set_u64(0, value);
            params.set_cap_table(caps).unwrap();
        }
        encode_frame(&builder.msg.finish()).unwrap()
    }

    fn build_call_frame(question_id: u32, target: MessageTarget, value: u64) -> Vec<u8> {
        build_call_frame_with_caps(question_id, target, value, &[])
    }

    fn decode_one(frame: Vec<u8>) -> (capnp_message::MessageReader, usize) {
        decode_frame(&Bytes::from(frame)).unwrap()
    }

    #[test]
    fn bootstrap_without_a_handler_returns_the_stub_exception() {
        let mut peer = Peer::new(PeerLimits::default(), TestEffects::default());
        peer.send_bootstrap().unwrap();
        let bootstrap_frame = build_frame_bootstrap(0);
        peer.dispatch(&bootstrap_frame).unwrap();

        let reply = peer.pop_outbound_frame().unwrap();
        let (reader, _) = decode_one(reply);
        let root = AnyPointerReader::new(&reader, 0, 0);
        let decoded = DecodedMessage::init(root).unwrap();
        let ret = decoded.as_return().unwrap();
        assert_eq!(ret.variant().unwrap(), ReturnVariantTag::Exception);
        assert_eq!(ret.exception_reason().unwrap(), "bootstrap stub");
    }

    fn build_frame_bootstrap(question_id: u32) -> Vec<u8> {
        encode_frame(&build_bootstrap(question_id).finish()).unwrap()
    }

    #[test]
    fn bootstrap_with_a_handler_exports_it_under_a_fresh_id() {
        let mut peer = Peer::new(PeerLimits::default(), TestEffects::default());
        peer.set_bootstrap_handler(Rc::new(EchoHandler));
        peer.dispatch(&build_frame_bootstrap(0)).unwrap();

        let reply = peer.pop_outbound_frame().unwrap();
        let (reader, _) = decode_one(reply);
        let root = AnyPointerReader::new(&reader, 0, 0);
        let decoded = DecodedMessage::init(root).unwrap();
        let ret = decoded.as_return().unwrap();
        assert_eq!(ret.variant().unwrap(), ReturnVariantTag::Results);
        let caps = ret.results().unwrap().cap_table().unwrap();
        assert!(matches!(caps[0], CapDescriptor::SenderHosted { .. }));
    }

    #[test]
    fn call_to_a_local_export_invokes_the_handler() {
        let mut peer = Peer::new(PeerLimits::default(), TestEffects::default());
        let export_id = peer.export_capability(Rc::new(EchoHandler));
        let frame = build_call_frame(5, MessageTarget::ImportedCap { export_id }, 9);
        peer.dispatch(&frame).unwrap();

        let reply = peer.pop_outbound_frame().unwrap();
        let (reader, _) = decode_one(reply);
        let root = AnyPointerReader::new(&reader, 0, 0);
        let decoded = DecodedMessage::init(root).unwrap();
        let ret = decoded.as_return().unwrap();
        assert_eq!(ret.question_id(), 5);
        assert_eq!(ret.variant().unwrap(), ReturnVariantTag::Results);
        let content = ret.results().unwrap().content().read_struct().unwrap();
        assert_eq!(content.get_u64(0), 10);
    }

    #[test]
    fn call_to_an_unknown_export_returns_unknown_capability() {
        let mut peer = Peer::new(PeerLimits::default(), TestEffects::default());
        let frame = build_call_frame(1, MessageTarget::ImportedCap { export_id: 404 }, 0);
        peer.dispatch(&frame).unwrap();

        let reply = peer.pop_outbound_frame().unwrap();
        let (reader, _) = decode_one(reply);
        let root = AnyPointerReader::new(&reader, 0, 0);
        let decoded = DecodedMessage::init(root).unwrap();
        let ret = decoded.as_return().unwrap();
        assert_eq!(ret.variant().unwrap(), ReturnVariantTag::Exception);
        assert_eq!(ret.exception_reason().unwrap(), "unknown capability");
    }

    #[test]
    fn call_pipelined_on_a_pending_answer_is_replayed_once_it_resolves() {
        let mut peer = Peer::new(PeerLimits::default(), TestEffects::default());
        let export_id = peer.export_capability(Rc::new(EchoHandler));

        // The pipelined call arrives first, referencing an answer this
        // peer has never seen yet: it must queue rather than error.
        let pipelined = build_call_frame(
            2,
            MessageTarget::PromisedAnswer {
                question_id: 1,
                transform: vec![],
            },
            0,
        );
        peer.dispatch(&pipelined).unwrap();
        assert!(peer.pop_outbound_frame().is_none());

        // The original call completes the answer, which must replay the
        // queued pipelined call.
        let original = build_call_frame(1, MessageTarget::ImportedCap { export_id }, 9);
        peer.dispatch(&original).unwrap();

        let mut replies = Vec::new();
        while let Some(frame) = peer.pop_outbound_frame() {
            let (reader, _) = decode_one(frame);
            let root = AnyPointerReader::new(&reader, 0, 0);
            let decoded = DecodedMessage::init(root).unwrap();
            let ret = decoded.as_return().unwrap();
            replies.push((ret.question_id(), ret.variant().unwrap()));
        }
        replies.sort_by_key(|(q, _)| *q);
        assert_eq!(replies, vec![(1, ReturnVariantTag::Results), (2, ReturnVariantTag::Exception)]);
    }

    #[test]
    fn call_on_an_unresolved_promise_import_is_queued_until_resolve_arrives() {
        let mut peer = Peer::new(PeerLimits::default(), TestEffects::default());
        let registering = build_call_frame_with_caps(
            1,
            MessageTarget::ImportedCap { export_id: 999 },
            0,
            &[CapDescriptor::SenderPromise { export_id: 5 }],
        );
        peer.dispatch(&registering).unwrap();
        peer.pop_outbound_frame();

        let outcome = peer
            .call_import(5, 1, 2, QuestionDisposition::Local, |params| {
                params.init_content(1, 0)?;
                params.set_cap_table(&[])
            })
            .unwrap();
        assert!(matches!(outcome, CallOutcome::Queued { .. }));
        assert!(peer.pop_outbound_frame().is_none());

        let resolve_frame = encode_frame(&build_resolve_cap(5, 42).finish()).unwrap();
        peer.dispatch(&resolve_frame).unwrap();

        let sent = peer.pop_outbound_frame().unwrap();
        let (reader, _) = decode_one(sent);
        let root = AnyPointerReader::new(&reader, 0, 0);
        let decoded = DecodedMessage::init(root).unwrap();
        assert_eq!(decoded.kind(), MessageKind::Call);
    }

    #[test]
    fn provide_then_accept_through_the_peer_returns_the_registered_target() {
        let mut peer = Peer::new(PeerLimits::default(), TestEffects::default());
        let export_id = peer.export_capability(Rc::new(EchoHandler));

        let provide = build_provide(1, &MessageTarget::ImportedCap { export_id }, b"vine-key").unwrap();
        peer.dispatch(&encode_frame(&provide.finish()).unwrap()).unwrap();
        assert!(peer.pop_outbound_frame().is_none());

        let accept = build_accept(2, b"vine-key", false).unwrap();
        peer.dispatch(&encode_frame(&accept.finish()).unwrap()).unwrap();

        let reply = peer.pop_outbound_frame().unwrap();
        let (reader, _) = decode_one(reply);
        let root = AnyPointerReader::new(&reader, 0, 0);
        let decoded = DecodedMessage::init(root).unwrap();
        let ret = decoded.as_return().unwrap();
        assert_eq!(ret.question_id(), 2);
        assert_eq!(ret.variant().unwrap(), ReturnVariantTag::Results);
        assert_eq!(
            ret.results().unwrap().cap_table().unwrap(),
            vec![CapDescriptor::SenderHosted { export_id }]
        );
    }

    #[test]
    fn duplicate_provide_question_id_aborts() {
        let mut peer = Peer::new(PeerLimits::default(), TestEffects::default());
        let export_id = peer.export_capability(Rc::new(EchoHandler));
        let target = MessageTarget::ImportedCap { export_id };

        let first = build_provide(1, &target, b"a").unwrap();
        peer.dispatch(&encode_frame(&first.finish()).unwrap()).unwrap();
        peer.pop_outbound_frame();

        let second = build_provide(1, &target, b"b").unwrap();
        peer.dispatch(&encode_frame(&second.finish()).unwrap()).unwrap();

        let reply = peer.pop_outbound_frame().unwrap();
        let (reader, _) = decode_one(reply);
        let root = AnyPointerReader::new(&reader, 0, 0);
        let decoded = DecodedMessage::init(root).unwrap();
        assert_eq!(decoded.as_abort().unwrap().reason().unwrap(), "duplicate provide question");
    }

    #[test]
    fn join_converges_when_both_legs_resolve_to_the_same_export() {
        let mut peer = Peer::new(PeerLimits::default(), TestEffects::default());
        let export_id = peer.export_capability(Rc::new(EchoHandler));
        let target = MessageTarget::ImportedCap { export_id };

        let part0 = build_join(10, 77, 2, 0, &target).unwrap();
        peer.dispatch(&encode_frame(&part0.finish()).unwrap()).unwrap();
        assert!(peer.pop_outbound_frame().is_none());

        let part1 = build_join(11, 77, 2, 1, &target).unwrap();
        peer.dispatch(&encode_frame(&part1.finish()).unwrap()).unwrap();

        let mut seen = Vec::new();
        while let Some(frame) = peer.pop_outbound_frame() {
            let (reader, _) = decode_one(frame);
            let root = AnyPointerReader::new(&reader, 0, 0);
            let decoded = DecodedMessage::init(root).unwrap();
            let ret = decoded.as_return().unwrap();
            assert_eq!(ret.variant().unwrap(), ReturnVariantTag::Results);
            seen.push(ret.question_id());
        }
        seen.sort();
        assert_eq!(seen, vec![10, 11]);
    }

    #[test]
    fn call_during_an_embargo_is_released_only_after_the_loopback_echoes() {
        let mut peer = Peer::new(PeerLimits::default(), TestEffects::default());
        let registering = build_call_frame_with_caps(
            1,
            MessageTarget::ImportedCap { export_id: 999 },
            0,
            &[CapDescriptor::SenderHosted { export_id: 5 }],
        );
        peer.dispatch(&registering).unwrap();
        peer.pop_outbound_frame();

        let embargo_id = peer.begin_embargo(5).unwrap();
        let disembargo_frame = peer.pop_outbound_frame().unwrap();
        let (reader, _) = decode_one(disembargo_frame);
        let root = AnyPointerReader::new(&reader, 0, 0);
        let decoded = DecodedMessage::init(root).unwrap();
        let sent = decoded.as_disembargo().unwrap();
        assert_eq!(sent.context().unwrap(), capnp_rpc_proto::DisembargoContext::ReceiverLoopback);
        assert_eq!(sent.embargo_id(), embargo_id);

        let outcome = peer
            .call_import(5, 1, 2, QuestionDisposition::Local, |params| {
                params.init_content(1, 0)?;
                params.set_cap_table(&[])
            })
            .unwrap();
        assert!(matches!(outcome, CallOutcome::Queued { .. }));
        assert!(peer.pop_outbound_frame().is_none());

        let echo = build_disembargo(DisembargoContext::SenderLoopback, embargo_id, &MessageTarget::ImportedCap { export_id: 5 })
            .unwrap();
        peer.dispatch(&encode_frame(&echo.finish()).unwrap()).unwrap();

        let released = peer.pop_outbound_frame().unwrap();
        let (reader, _) = decode_one(released);
        let root = AnyPointerReader::new(&reader, 0, 0);
        let decoded = DecodedMessage::init(root).unwrap();
        assert_eq!(decoded.kind(), MessageKind::Call);
    }

    #[test]
    fn outbound_frame_limit_is_enforced_before_mutating_the_question_table() {
        let limits = PeerLimits::default().with_max_outbound_frames(1);
        let mut peer = Peer::new(limits, TestEffects::default());
        peer.send_bootstrap().unwrap();
        let err = peer.send_bootstrap().unwrap_err();
        assert_eq!(err, RpcError::OutgoingQueueLimitExceeded);
        assert_eq!(peer.question_count(), 1);
    }
}
