//! Fixtures scenario tests wire into a `Peer` instead of hand-rolling a new
//! `PeerEffects`/`CapabilityHandler` impl per test.

use bytes::Bytes;
use capnp_message::{decode_frame, AnyPointerReader};
use capnp_rpc_core::{CapabilityHandler, PeerEffects};
use capnp_rpc_proto::{CapDescriptor, DecodedMessage, PayloadBuilder, PayloadReader, ProtoError, ReturnReader, ReturnVariantTag};

/// A `Return` as seen from the question that was waiting on it, decoded
/// eagerly since the `ReturnReader` it came from only lives for the
/// duration of one `dispatch` call.
#[derive(Debug, Clone)]
pub struct CapturedReturn {
    pub question_id: u32,
    pub variant: ReturnVariantTag,
    pub cap_table: Vec<CapDescriptor>,
    /// The first 8 bytes of the results content struct, interpreted as a
    /// little-endian `u64` — every handler in this kit's test scenarios
    /// uses that slot for its one interesting field, the same convention
    /// `capnp-rpc-core`'s own `EchoHandler` test fixture uses.
    pub content_u64: Option<u64>,
    pub exception_reason: Option<String>,
}

fn capture_return(question_id: u32, ret: &ReturnReader<'_>) -> CapturedReturn {
    let variant = ret.variant().unwrap_or(ReturnVariantTag::Exception);
    let (cap_table, content_u64) = match ret.results() {
        Ok(results) => (
            results.cap_table().unwrap_or_default(),
            results.content().read_struct().ok().map(|s| s.get_u64(0)),
        ),
        Err(_) => (Vec::new(), None),
    };
    let exception_reason = ret.exception_reason().ok().map(str::to_string);
    CapturedReturn {
        question_id,
        variant,
        cap_table,
        content_u64,
        exception_reason,
    }
}

/// Decodes a raw frame a test popped off a `Bridge` directly, for the cases
/// (pipelined calls, three-party legs) where the `Return` in question isn't
/// tied to a question either peer's own `RecordingEffects` is watching.
pub fn decode_return_frame(frame: &[u8]) -> Result<CapturedReturn, ProtoError> {
    let (reader, _) = decode_frame(&Bytes::copy_from_slice(frame))?;
    let root = AnyPointerReader::new(&reader, 0, 0);
    let decoded = DecodedMessage::init(root)?;
    let ret = decoded.as_return()?;
    Ok(capture_return(ret.question_id(), &ret))
}

/// Records every `on_local_return`/`on_abort` callback a `Peer` fires, so a
/// test can assert on them after pumping frames instead of threading a
/// channel through the scenario.
#[derive(Default)]
pub struct RecordingEffects {
    pub local_returns: Vec<CapturedReturn>,
    pub aborts: Vec<String>,
}

impl PeerEffects for RecordingEffects {
    fn on_local_return(&mut self, question_id: u32, ret: &ReturnReader<'_>) {
        self.local_returns.push(capture_return(question_id, ret));
    }

    fn on_abort(&mut self, reason: &str) {
        self.aborts.push(reason.to_string());
    }
}

/// A capability handler that never does anything useful: every method call
/// against it fails with the same reason the protocol uses for a peer that
/// never set a bootstrap at all. Exporting this explicitly (as opposed to
/// leaving `Peer::set_bootstrap_handler` uncalled) lets a scenario
/// distinguish "no bootstrap" from "bootstrap present but intentionally
/// broken" while producing the same wire-visible reason string either way.
pub struct StubBootstrapHandler;

impl CapabilityHandler for StubBootstrapHandler {
    fn handle_call(
        &self,
        _interface_id: u64,
        _method_id: u32,
        _params: PayloadReader<'_>,
        _results: &mut PayloadBuilder,
    ) -> Result<(), String> {
        Err(capnp_rpc_core::Reason::BootstrapStub.reason_str().to_string())
    }
}
