//! Pure decision functions for call dispatch. Kept free of any table or
//! I/O access so they stay the easiest part of the peer to property-test:
//! every planner is a total function from a handful of booleans/enums to
//! a tagged outcome.

use capnp_rpc_proto::PipelineOp;

use crate::cap_table::ResolvedCap;

/// Outcome of routing a `Call` whose target is `importedCap{exportId}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportedTargetPlan {
    UnknownCapability,
    QueuePromiseExport,
    PromiseBroken,
    HandleResolved,
    CallHandler,
    MissingExportHandler,
}

/// `has_export`: does an export with this id exist at all.
/// `is_promise`: is it still an unresolved promise.
/// `resolved_to_local`: once resolved, does it resolve to a local handler
/// (vs. re-exported elsewhere, vs. broken) — only meaningful when
/// `is_promise` is true and a resolution has landed.
/// `has_handler`: does the export carry a dispatchable handler right now.
pub fn plan_imported_target(
    has_export: bool,
    is_promise: bool,
    resolved: Option<bool>,
    has_handler: bool,
) -> ImportedTargetPlan {
    if !has_export {
        return ImportedTargetPlan::UnknownCapability;
    }
    if is_promise {
        return match resolved {
            None => ImportedTargetPlan::QueuePromiseExport,
            Some(true) => ImportedTargetPlan::HandleResolved,
            Some(false) => ImportedTargetPlan::PromiseBroken,
        };
    }
    if has_handler {
        ImportedTargetPlan::CallHandler
    } else {
        ImportedTargetPlan::MissingExportHandler
    }
}

/// Outcome of routing a `Call` whose target is `receiverAnswer{questionId,
/// transform}` — a promise pipelined off an answer we're still computing,
/// or off another export that is itself a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromisedTargetPlan {
    QueuePromisedCall,
    QueueExportPromise,
    HandleResolved,
    SendException,
}

/// `answer_ready`: has the answer's `Return` already been computed.
/// `terminal`: once the transform path is walked, what the terminal slot
/// resolves to (only meaningful when `answer_ready` is true).
pub fn plan_promised_target(answer_ready: bool, terminal: Option<&ResolvedCap>) -> PromisedTargetPlan {
    if !answer_ready {
        return PromisedTargetPlan::QueuePromisedCall;
    }
    match terminal {
        None => PromisedTargetPlan::SendException,
        Some(ResolvedCap::Promised { .. }) => PromisedTargetPlan::QueueExportPromise,
        Some(ResolvedCap::Broken) | Some(ResolvedCap::None) => PromisedTargetPlan::SendException,
        Some(ResolvedCap::Exported { .. }) | Some(ResolvedCap::Imported { .. }) => PromisedTargetPlan::HandleResolved,
    }
}

/// How a forwarded call's `Return` should be relayed back, chosen when
/// the call is first forwarded (a tail call, a pipelined call whose
/// target turned out to live on a third peer, …) rather than recomputed
/// on `Return` arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardReturnMode {
    /// Rewrite `sendResultsTo=caller` and re-encode the cap table against
    /// the original caller's export/import tables.
    TranslateToCaller,
    /// The call is a tail call: mark the upstream question as waiting on
    /// this one (`takeFromOtherQuestion`) and suppress its auto-finish.
    SentElsewhere { upstream_question_id: u32 },
    /// Transparently relay a `resultsSentElsewhere` to the original
    /// caller, preserving the destination payload unchanged.
    PropagateResultsSentElsewhere,
    /// Preserve a captured third-party recipient and relay
    /// `acceptFromThirdParty` unchanged.
    PropagateAcceptFromThirdParty { recipient: Vec<u8> },
}

/// One step of walking a pipeline transform for diagnostics/equality
/// checks outside the cap-table resolution path (e.g. comparing two join
/// legs' transforms for the disembargo ordering rules).
pub fn transform_eq(a: &[PipelineOp], b: &[PipelineOp]) -> bool {
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn imported_target_unknown_when_export_missing() {
        assert_eq!(
            plan_imported_target(false, false, None, false),
            ImportedTargetPlan::UnknownCapability
        );
    }

    #[test]
    fn imported_target_queues_unresolved_promise() {
        assert_eq!(
            plan_imported_target(true, true, None, false),
            ImportedTargetPlan::QueuePromiseExport
        );
    }

    #[test]
    fn imported_target_reports_broken_promise() {
        assert_eq!(
            plan_imported_target(true, true, Some(false), false),
            ImportedTargetPlan::PromiseBroken
        );
    }

    #[test]
    fn imported_target_calls_handler_when_resolved_and_present() {
        assert_eq!(
            plan_imported_target(true, false, None, true),
            ImportedTargetPlan::CallHandler
        );
    }

    #[test]
    fn imported_target_reports_missing_handler() {
        assert_eq!(
            plan_imported_target(true, false, None, false),
            ImportedTargetPlan::MissingExportHandler
        );
    }

    #[test]
    fn promised_target_queues_while_answer_pending() {
        assert_eq!(plan_promised_target(false, None), PromisedTargetPlan::QueuePromisedCall);
    }

    #[test]
    fn promised_target_exceptions_on_broken_terminal() {
        assert_eq!(
            plan_promised_target(true, Some(&ResolvedCap::Broken)),
            PromisedTargetPlan::SendException
        );
    }

    #[test]
    fn promised_target_chains_through_another_promise() {
        assert_eq!(
            plan_promised_target(
                true,
                Some(&ResolvedCap::Promised {
                    question_id: 1,
                    transform: vec![]
                })
            ),
            PromisedTargetPlan::QueueExportPromise
        );
    }

    #[test]
    fn promised_target_handles_resolved_export() {
        assert_eq!(
            plan_promised_target(true, Some(&ResolvedCap::Exported { export_id: 4 })),
            PromisedTargetPlan::HandleResolved
        );
    }
}
