//! End-to-end scenarios driving two in-process peers through a `Bridge`
//! pair, exercising the same call/return/provide/join machinery
//! `capnp-rpc-core`'s own unit tests exercise against a single `Peer`, but
//! across an actual frame boundary.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use capnp_message::{decode_frame, encode_frame, AnyPointerReader};
use capnp_rpc_core::{CapabilityHandler, Peer, PeerLimits, QuestionDisposition, Reason};
use capnp_rpc_proto::{
    build_accept, build_bootstrap, build_join, build_provide, CallBuilder, CapDescriptor, DecodedMessage, MessageKind,
    MessageTarget, PayloadBuilder, PayloadReader, ReturnVariantTag, SendResultsTo,
};
use capnp_rpc_testkit::{decode_return_frame, pump, Bridge, RecordingEffects, StubBootstrapHandler};

fn new_bridge() -> Bridge<RecordingEffects> {
    Bridge::new(Peer::new(PeerLimits::default(), RecordingEffects::default()))
}

/// Registers `export_id` (as seen by the other side) as an import on this
/// peer by feeding it a throwaway call frame whose sole purpose is to carry
/// that id in a `SenderHosted` cap descriptor — the only path that inserts
/// an `Import` entry, mirroring how an embedder would end up with one from
/// a real inbound call's own parameter cap table.
fn register_import(bridge: &mut Bridge<RecordingEffects>, export_id: u32) {
    let target = MessageTarget::ImportedCap { export_id: u32::MAX };
    let mut builder = CallBuilder::new(u32::MAX, 0, 0, SendResultsTo::Caller, &target).unwrap();
    {
        let mut params = builder.params().unwrap();
        params.init_content(0, 0).unwrap();
        params
            .set_cap_table(&[CapDescriptor::SenderHosted { export_id }])
            .unwrap();
    }
    let frame = encode_frame(&builder.msg.finish()).unwrap();
    bridge.push_frame(frame).unwrap();
    // The registering call itself targets a nonexistent export, so it comes
    // straight back as an exception; discard it.
    bridge.pop_outgoing_frame();
}

fn decode_abort_reason(frame: &[u8]) -> String {
    let (reader, _) = decode_frame(&Bytes::copy_from_slice(frame)).unwrap();
    let root = AnyPointerReader::new(&reader, 0, 0);
    let decoded = DecodedMessage::init(root).unwrap();
    assert_eq!(decoded.kind(), MessageKind::Abort);
    decoded.as_abort().unwrap().reason().unwrap().to_string()
}

/// Reads a `u64` out of offset 0 of a call's parameter content, and writes
/// `count + 1` into the same slot of the results — the one interesting
/// field every fixture in this file cares about.
struct PingHandler;

impl CapabilityHandler for PingHandler {
    fn handle_call(
        &self,
        _interface_id: u64,
        _method_id: u32,
        params: PayloadReader<'_>,
        results: &mut PayloadBuilder,
    ) -> Result<(), String> {
        let count = params.content().read_struct().map(|s| s.get_u64(0)).unwrap_or(0);
        let mut content = results.init_content(1, 0).map_err(|e| e.to_string())?;
        content.set_u64(0, count + 1);
        results.set_cap_table(&[]).map_err(|e| e.to_string())?;
        Ok(())
    }
}

/// `findMatch`'s bootstrap-reachable handler: always hands back the same
/// pre-exported controller capability as a bare result, the way a matcher
/// that already knows its one opponent would.
struct MatcherHandler {
    controller_export_id: u32,
}

impl CapabilityHandler for MatcherHandler {
    fn handle_call(
        &self,
        _interface_id: u64,
        _method_id: u32,
        _params: PayloadReader<'_>,
        results: &mut PayloadBuilder,
    ) -> Result<(), String> {
        results
            .set_cap_table(&[CapDescriptor::SenderHosted {
                export_id: self.controller_export_id,
            }])
            .map_err(|e| e.to_string())?;
        results.set_content_capability(0).map_err(|e| e.to_string())?;
        Ok(())
    }
}

/// The capability `findMatch` resolves to. `getInfo` against it returns a
/// fixed value and counts how many times it was actually invoked.
struct ControllerHandler {
    calls: RefCell<u32>,
}

impl CapabilityHandler for ControllerHandler {
    fn handle_call(
        &self,
        _interface_id: u64,
        _method_id: u32,
        _params: PayloadReader<'_>,
        results: &mut PayloadBuilder,
    ) -> Result<(), String> {
        *self.calls.borrow_mut() += 1;
        let mut content = results.init_content(1, 0).map_err(|e| e.to_string())?;
        content.set_u64(0, 123);
        results.set_cap_table(&[]).map_err(|e| e.to_string())?;
        Ok(())
    }
}

#[test]
fn bootstrap_round_trip() {
    let mut a = new_bridge();
    let mut b = new_bridge();
    b.peer_mut().set_bootstrap_handler(Rc::new(PingHandler));

    let question_id = a.peer_mut().send_bootstrap().unwrap();
    a.peer_mut().send_finish(question_id, false).unwrap();
    assert_eq!(a.peer().outbound_frame_count(), 2);

    pump(&mut a, &mut b).unwrap();

    let returns = &a.peer().effects().local_returns;
    assert_eq!(returns.len(), 1);
    let ret = &returns[0];
    assert_eq!(ret.question_id, question_id);
    assert_eq!(ret.variant, ReturnVariantTag::Results);
    assert!(matches!(ret.cap_table.as_slice(), [CapDescriptor::SenderHosted { .. }]));
}

#[test]
fn ping_pong_call() {
    let mut a = new_bridge();
    let mut b = new_bridge();
    b.peer_mut().set_bootstrap_handler(Rc::new(PingHandler));

    let bootstrap_qid = a.peer_mut().send_bootstrap().unwrap();
    pump(&mut a, &mut b).unwrap();
    let bootstrap_export_id = match a.peer().effects().local_returns[0].cap_table.as_slice() {
        [CapDescriptor::SenderHosted { export_id }] => *export_id,
        other => panic!("unexpected bootstrap cap table: {other:?}"),
    };
    a.peer_mut().send_finish(bootstrap_qid, false).unwrap();
    pump(&mut a, &mut b).unwrap();

    register_import(&mut a, bootstrap_export_id);
    let outcome = a
        .peer_mut()
        .call_import(bootstrap_export_id, 1, 1, QuestionDisposition::Local, |params| {
            let mut content = params.init_content(1, 0)?;
            content.set_u64(0, 41);
            params.set_cap_table(&[])
        })
        .unwrap();
    let ping_qid = match outcome {
        capnp_rpc_core::CallOutcome::Sent { question_id } => question_id,
        other => panic!("expected the call to go out immediately, got {other:?}"),
    };

    pump(&mut a, &mut b).unwrap();

    let ping_return = a
        .peer()
        .effects()
        .local_returns
        .iter()
        .find(|r| r.question_id == ping_qid)
        .unwrap();
    assert_eq!(ping_return.variant, ReturnVariantTag::Results);
    assert_eq!(ping_return.content_u64, Some(42));
}

#[test]
fn promise_pipelining_resolves_the_queued_call() {
    let mut b = new_bridge();
    let controller = Rc::new(ControllerHandler { calls: RefCell::new(0) });
    let controller_export_id = b.peer_mut().export_capability(controller.clone());
    b.peer_mut()
        .set_bootstrap_handler(Rc::new(MatcherHandler { controller_export_id }));

    // Bootstrap isn't a call; findMatch is invoked directly against the
    // bootstrap capability's export id, learned the same way any client
    // would: from the bootstrap Return's cap table.
    let bootstrap = build_bootstrap(0);
    b.push_frame(encode_frame(&bootstrap.finish()).unwrap()).unwrap();
    let bootstrap_return = decode_return_frame(&b.pop_outgoing_frame().unwrap()).unwrap();
    let matcher_export_id = match bootstrap_return.cap_table.as_slice() {
        [CapDescriptor::SenderHosted { export_id }] => *export_id,
        other => panic!("unexpected bootstrap cap table: {other:?}"),
    };

    let find_match_qid = 1;
    let get_info_qid = 2;

    // The pipelined `getInfo` call is sent first, addressed at an answer B
    // has not seen yet: it must queue rather than error.
    let pipelined_target = MessageTarget::PromisedAnswer {
        question_id: find_match_qid,
        transform: vec![],
    };
    let mut get_info = CallBuilder::new(get_info_qid, 2, 1, SendResultsTo::Caller, &pipelined_target).unwrap();
    {
        let mut params = get_info.params().unwrap();
        params.init_content(0, 0).unwrap();
        params.set_cap_table(&[]).unwrap();
    }
    b.push_frame(encode_frame(&get_info.msg.finish()).unwrap()).unwrap();
    assert!(b.pop_outgoing_frame().is_none());
    assert_eq!(*controller.calls.borrow(), 0);

    // `findMatch` lands next, resolving the answer `getInfo` was pipelined
    // against and replaying the queued call.
    let find_match_target = MessageTarget::ImportedCap { export_id: matcher_export_id };
    let mut find_match = CallBuilder::new(find_match_qid, 3, 0, SendResultsTo::Caller, &find_match_target).unwrap();
    {
        let mut params = find_match.params().unwrap();
        params.init_content(0, 0).unwrap();
        params.set_cap_table(&[]).unwrap();
    }
    b.push_frame(encode_frame(&find_match.msg.finish()).unwrap()).unwrap();

    let mut returns = Vec::new();
    while let Some(frame) = b.pop_outgoing_frame() {
        returns.push(decode_return_frame(&frame).unwrap());
    }
    returns.sort_by_key(|r| r.question_id);
    assert_eq!(returns.len(), 2);

    let find_match_return = &returns[0];
    assert_eq!(find_match_return.question_id, find_match_qid);
    assert_eq!(find_match_return.variant, ReturnVariantTag::Results);
    assert!(matches!(
        find_match_return.cap_table.as_slice(),
        [CapDescriptor::SenderHosted { export_id }] if *export_id == controller_export_id
    ));

    let get_info_return = &returns[1];
    assert_eq!(get_info_return.question_id, get_info_qid);
    assert_eq!(get_info_return.variant, ReturnVariantTag::Results);
    assert_eq!(get_info_return.content_u64, Some(123));
    assert_eq!(*controller.calls.borrow(), 1);
}

#[test]
fn join_convergence() {
    let mut b = new_bridge();
    let export_id = b.peer_mut().export_capability(Rc::new(PingHandler));
    let target = MessageTarget::ImportedCap { export_id };

    let part0 = build_join(10, 77, 2, 0, &target).unwrap();
    b.push_frame(encode_frame(&part0.finish()).unwrap()).unwrap();
    assert!(b.pop_outgoing_frame().is_none());

    let part1 = build_join(11, 77, 2, 1, &target).unwrap();
    b.push_frame(encode_frame(&part1.finish()).unwrap()).unwrap();

    let mut seen = Vec::new();
    while let Some(frame) = b.pop_outgoing_frame() {
        let ret = decode_return_frame(&frame).unwrap();
        assert_eq!(ret.variant, ReturnVariantTag::Results);
        seen.push(ret.question_id);
    }
    seen.sort();
    assert_eq!(seen, vec![10, 11]);
}

#[test]
fn join_mismatch_reports_an_exception_on_every_leg() {
    let mut b = new_bridge();
    let export_a = b.peer_mut().export_capability(Rc::new(PingHandler));
    let export_b = b.peer_mut().export_capability(Rc::new(PingHandler));

    let part0 = build_join(20, 88, 2, 0, &MessageTarget::ImportedCap { export_id: export_a }).unwrap();
    b.push_frame(encode_frame(&part0.finish()).unwrap()).unwrap();
    assert!(b.pop_outgoing_frame().is_none());

    let part1 = build_join(21, 88, 2, 1, &MessageTarget::ImportedCap { export_id: export_b }).unwrap();
    b.push_frame(encode_frame(&part1.finish()).unwrap()).unwrap();

    let mut seen = Vec::new();
    while let Some(frame) = b.pop_outgoing_frame() {
        let ret = decode_return_frame(&frame).unwrap();
        assert_eq!(ret.variant, ReturnVariantTag::Exception);
        seen.push((ret.question_id, ret.exception_reason.clone()));
    }
    seen.sort_by_key(|(qid, _)| *qid);
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].1.as_deref(), Some("join mismatch"));
    assert_eq!(seen[1].1.as_deref(), Some("join mismatch"));
}

#[test]
fn oversize_frame_refusal() {
    let mut a = new_bridge();
    let oversize = vec![0u8; capnp_rpc_testkit::MAX_FRAME_BYTES + 1];

    let before = a.peer().outbound_frame_count();
    let err = a.push_frame(oversize).unwrap_err();
    assert!(matches!(err, capnp_rpc_testkit::BridgeError::FrameTooLarge { .. }));
    assert_eq!(a.peer().outbound_frame_count(), before);
}

#[test]
fn duplicate_provide_recipient_aborts() {
    let mut b = new_bridge();
    let export_id = b.peer_mut().export_capability(Rc::new(PingHandler));
    let target = MessageTarget::ImportedCap { export_id };

    let first = build_provide(1, &target, b"shared-key").unwrap();
    b.push_frame(encode_frame(&first.finish()).unwrap()).unwrap();
    assert!(b.pop_outgoing_frame().is_none());

    let second = build_provide(2, &target, b"shared-key").unwrap();
    b.push_frame(encode_frame(&second.finish()).unwrap()).unwrap();

    let reply = b.pop_outgoing_frame().unwrap();
    assert_eq!(decode_abort_reason(&reply), Reason::DuplicateProvideRecipient.reason_str());
    assert!(b.pop_outgoing_frame().is_none());

    // The first recipient is still live: a matching accept still resolves.
    let accept = build_accept(3, b"shared-key", false).unwrap();
    b.push_frame(encode_frame(&accept.finish()).unwrap()).unwrap();
    let reply = b.pop_outgoing_frame().unwrap();
    let ret = decode_return_frame(&reply).unwrap();
    assert_eq!(ret.variant, ReturnVariantTag::Results);
}

#[test]
fn bootstrap_stub_handler_reports_the_same_reason_wire_side() {
    let mut a = new_bridge();
    let mut b = new_bridge();
    b.peer_mut().set_bootstrap_handler(Rc::new(StubBootstrapHandler));

    let qid = a.peer_mut().send_bootstrap().unwrap();
    pump(&mut a, &mut b).unwrap();

    let ret = &a.peer().effects().local_returns[0];
    assert_eq!(ret.question_id, qid);
    assert_eq!(ret.variant, ReturnVariantTag::Exception);
    assert_eq!(ret.exception_reason.as_deref(), Some(Reason::BootstrapStub.reason_str()));
}
