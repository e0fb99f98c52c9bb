//! The four tables' capability-facing half: exports, imports, and the
//! per-call inbound capability table that maps a `Call`'s cap descriptors
//! onto local resolutions.

use std::rc::Rc;

use capnp_rpc_proto::{CapDescriptor, PayloadBuilder, PayloadReader, PipelineOp};

use crate::slab::IdTable;

/// Outcome of dispatching a call to a local handler: the handler writes
/// its results directly into the `PayloadBuilder` the peer hands it (the
/// same pattern the real `capnp-rpc` crate uses for `ResultsHook::get`),
/// rather than returning an owned message the peer would have to splice
/// into a different arena.
pub trait CapabilityHandler {
    fn handle_call(
        &self,
        interface_id: u64,
        method_id: u32,
        params: PayloadReader<'_>,
        results: &mut PayloadBuilder,
    ) -> Result<(), String>;
}

/// A capability reference resolved against this peer's local tables,
/// ready to be dispatched against or forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedCap {
    None,
    Imported { import_id: u32 },
    Exported { export_id: u32 },
    Promised { question_id: u32, transform: Vec<PipelineOp> },
    Broken,
}

/// What an export (or import) ultimately resolves to, once known.
pub enum Resolution {
    Local(Rc<dyn CapabilityHandler>),
    ExportedElsewhere(u32),
    Broken(String),
}

/// A local capability exposed to the peer under a sender-chosen id.
pub struct Export {
    pub handler: Rc<dyn CapabilityHandler>,
    pub ref_count: u32,
    pub is_promise: bool,
    pub resolution: Option<Resolution>,
    /// Calls that arrived while this export was still an unresolved
    /// promise, held here keyed implicitly by this export's id.
    pub pending_calls: Vec<PendingCall>,
}

impl Export {
    pub fn new_resolved(handler: Rc<dyn CapabilityHandler>) -> Self {
        Self {
            handler,
            ref_count: 1,
            is_promise: false,
            resolution: None,
            pending_calls: Vec::new(),
        }
    }

    pub fn new_promise(handler: Rc<dyn CapabilityHandler>) -> Self {
        Self {
            handler,
            ref_count: 1,
            is_promise: true,
            resolution: None,
            pending_calls: Vec::new(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        !self.is_promise || self.resolution.is_some()
    }

    pub fn take_pending_calls(&mut self) -> Vec<PendingCall> {
        std::mem::take(&mut self.pending_calls)
    }
}

/// A single `Call` frame parked because its target isn't resolved yet.
pub struct PendingCall {
    pub frame: Vec<u8>,
    pub inbound_caps: Vec<ResolvedCap>,
}

/// A remote capability held by this peer, identified by the id the peer
/// chose when it exported it to us.
pub struct Import {
    pub ref_count: u32,
    /// `senderPromise` descriptors need a `Resolve` before they're safe to
    /// call through directly; `senderHosted` ones don't and are created
    /// with this already `false`.
    pub is_promise: bool,
    pub resolution: Option<Resolution>,
    pub pending_calls: Vec<PendingCall>,
}

impl Import {
    pub fn new_unresolved(is_promise: bool) -> Self {
        Self {
            ref_count: 1,
            is_promise,
            resolution: None,
            pending_calls: Vec::new(),
        }
    }

    pub fn take_pending_calls(&mut self) -> Vec<PendingCall> {
        std::mem::take(&mut self.pending_calls)
    }
}

/// Resolves a `Call`'s or `Return`'s cap-table entries against this
/// peer's export/import tables, issuing or reusing import ids for
/// capabilities newly hosted by the sender.
pub struct InboundCapTable {
    entries: Vec<ResolvedCap>,
}

impl InboundCapTable {
    /// Build the table eagerly from the wire cap descriptors. `imports` is
    /// mutated: a `senderHosted`/`senderPromise` descriptor whose id we
    /// haven't seen before allocates a new `Import` entry (or reuses one
    /// already created for the same wire id, since the sender may
    /// reference the same capability from more than one descriptor slot
    /// within a message, or across messages while it's still exported).
    pub fn new(imports: &mut IdTable<Import>, descriptors: &[CapDescriptor]) -> Self {
        let entries = descriptors
            .iter()
            .map(|d| match d {
                CapDescriptor::None => ResolvedCap::None,
                CapDescriptor::SenderHosted { export_id } => {
                    imports.get_or_insert_with(*export_id, || Import::new_unresolved(false));
                    ResolvedCap::Imported { import_id: *export_id }
                }
                CapDescriptor::SenderPromise { export_id } => {
                    imports.get_or_insert_with(*export_id, || Import::new_unresolved(true));
                    ResolvedCap::Imported { import_id: *export_id }
                }
                CapDescriptor::ReceiverHosted { import_id } => ResolvedCap::Exported { export_id: *import_id },
                CapDescriptor::ReceiverAnswer { question_id, transform } => ResolvedCap::Promised {
                    question_id: *question_id,
                    transform: transform.clone(),
                },
                // Three-party introductions resolve through provide/accept, not
                // through this table; treating them as broken here is correct
                // until the embedder completes the accept leg and re-exports
                // the result under an ordinary descriptor.
                CapDescriptor::ThirdPartyHosted { .. } => ResolvedCap::Broken,
            })
            .collect();
        Self { entries }
    }

    pub fn resolve(&self, index: u32) -> ResolvedCap {
        self.entries.get(index as usize).cloned().unwrap_or(ResolvedCap::None)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Walks a pipeline transform path through a resolved answer's results
/// payload, then reads the terminal capability slot against the answer's
/// cap table (itself an `InboundCapTable`, since a pipelined call's
/// params can reference capabilities the answer exported back to us).
pub fn resolve_transform(results: &PayloadReader<'_>, transform: &[PipelineOp]) -> Result<Option<u32>, capnp_message::DecodeError> {
    let mut any = results.content();
    for op in transform {
        match op {
            PipelineOp::Noop => {}
            PipelineOp::GetPointerField(index) => {
                let s = any.read_struct()?;
                any = s.pointer_field(*index);
            }
        }
    }
    any.read_capability_index()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_hosted_descriptor_allocates_an_import() {
        let mut imports = IdTable::new();
        let table = InboundCapTable::new(&mut imports, &[CapDescriptor::SenderHosted { export_id: 7 }]);
        assert!(matches!(table.resolve(0), ResolvedCap::Imported { import_id: 7 }));
        assert!(imports.contains(7));
    }

    #[test]
    fn receiver_hosted_descriptor_resolves_to_export() {
        let mut imports = IdTable::new();
        let table = InboundCapTable::new(&mut imports, &[CapDescriptor::ReceiverHosted { import_id: 3 }]);
        assert!(matches!(table.resolve(0), ResolvedCap::Exported { export_id: 3 }));
    }

    #[test]
    fn out_of_range_index_resolves_to_none() {
        let mut imports = IdTable::new();
        let table = InboundCapTable::new(&mut imports, &[]);
        assert!(matches!(table.resolve(0), ResolvedCap::None));
    }

    #[test]
    fn repeated_sender_hosted_id_reuses_the_same_import() {
        let mut imports = IdTable::new();
        InboundCapTable::new(&mut imports, &[CapDescriptor::SenderHosted { export_id: 9 }]);
        InboundCapTable::new(&mut imports, &[CapDescriptor::SenderHosted { export_id: 9 }]);
        assert_eq!(imports.len(), 1);
    }
}
