//! Question and Answer bookkeeping: the two tables that track calls this
//! peer made (questions, keyed by our own chosen id) and calls the peer
//! made of us (answers, keyed by the peer's question id).

use crate::cap_table::{PendingCall, ResolvedCap};
use crate::planner::ForwardReturnMode;

/// Where a resolved `Return` should be delivered once it arrives. Plain
/// data rather than a boxed callback: the peer driving this table decides
/// what to actually do with a `Return` (wake a waiting future, translate
/// and forward it, …) by matching on this enum, keeping the table itself
/// free of any callback-trait object and therefore trivial to unit test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuestionDisposition {
    /// An ordinary call this peer made on its own behalf.
    Local,
    /// A call forwarded on behalf of another peer's question, along with
    /// how its `Return` should be relayed.
    Forwarded(ForwardReturnMode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionState {
    Sent,
    AwaitingReturn,
    AwaitingTakeFromOther,
    Returned,
    Finished,
}

pub struct Question {
    pub disposition: QuestionDisposition,
    pub state: QuestionState,
    pub is_bootstrap: bool,
    /// Set once a `Return{takeFromOtherQuestion}` arrives for this
    /// question, pinning it in `Returned` until the tail resolves.
    pub awaiting_question_id: Option<u32>,
}

impl Question {
    pub fn new(disposition: QuestionDisposition, is_bootstrap: bool) -> Self {
        Self {
            disposition,
            state: QuestionState::Sent,
            is_bootstrap,
            awaiting_question_id: None,
        }
    }

    pub fn mark_awaiting_return(&mut self) {
        if self.state == QuestionState::Sent {
            self.state = QuestionState::AwaitingReturn;
        }
    }

    /// A `Return{takeFromOtherQuestion}` arrived: this question is done
    /// only once the question it points at resolves.
    pub fn mark_awaiting_take_from_other(&mut self, other_question_id: u32) {
        self.state = QuestionState::AwaitingTakeFromOther;
        self.awaiting_question_id = Some(other_question_id);
    }

    pub fn mark_returned(&mut self) {
        self.state = QuestionState::Returned;
    }

    /// We've sent `Finish` for this question: ready for removal from the
    /// table unless a suppressed auto-finish is still holding it open.
    pub fn mark_finished(&mut self) -> bool {
        self.state = QuestionState::Finished;
        self.awaiting_question_id.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerState {
    Pending,
    Returned,
}

/// A call the peer made of us. Tracks what's needed to fulfil pipelined
/// calls against our not-yet-sent (or already-sent) `Return`, and whether
/// both halves of the answer's lifecycle (`Return` sent, `Finish`
/// received) have completed.
pub struct Answer {
    pub state: AnswerState,
    pub resolved_target: Option<ResolvedCap>,
    pub pipelined_question_ids: Vec<u32>,
    pub finish_received: bool,
    /// Serialized `Return` results frame, kept around so a pipelined call
    /// that arrives after we've already returned can walk its transform
    /// path against the payload we actually sent.
    pub results_frame: Option<Vec<u8>>,
    /// Calls pipelined against this answer while it was still pending.
    pub pending_calls: Vec<PendingCall>,
}

impl Answer {
    pub fn new_pending() -> Self {
        Self {
            state: AnswerState::Pending,
            resolved_target: None,
            pipelined_question_ids: Vec::new(),
            finish_received: false,
            results_frame: None,
            pending_calls: Vec::new(),
        }
    }

    pub fn track_pipelined_question(&mut self, question_id: u32) {
        self.pipelined_question_ids.push(question_id);
    }

    pub fn queue_pending_call(&mut self, call: PendingCall) {
        self.pending_calls.push(call);
    }

    pub fn take_pending_calls(&mut self) -> Vec<PendingCall> {
        std::mem::take(&mut self.pending_calls)
    }

    pub fn mark_returned(&mut self, target: Option<ResolvedCap>, results_frame: Option<Vec<u8>>) {
        self.state = AnswerState::Returned;
        self.resolved_target = target;
        self.results_frame = results_frame;
    }

    /// Ready to drop from the table: `Return` has gone out and the
    /// caller's `Finish` has come back.
    pub fn is_complete(&self) -> bool {
        self.state == AnswerState::Returned && self.finish_received
    }
}
