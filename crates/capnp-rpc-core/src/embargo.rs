//! Disembargo bookkeeping: when a promise resolves to a capability the
//! peer would otherwise have called out of order, outbound calls on that
//! import are held back until a loopback `Disembargo` echoes.
//!
//! Ordering resolution (an explicit design decision, not inferable from
//! the protocol sketch alone): a single FIFO per resolved import rather
//! than separate per-context queues. A `Disembargo` only unblocks calls
//! queued strictly before it on that import, regardless of whether it was
//! issued as `senderLoopback` or `receiverLoopback` — interleaving the two
//! contexts on the same import still drains in send order.

use std::collections::{HashMap, VecDeque};

use capnp_rpc_proto::DisembargoContext;

#[derive(Default)]
struct ImportEmbargo {
    /// Disembargo ids issued on this import, oldest first. A call is only
    /// released once every embargo queued ahead of it has echoed.
    outstanding: VecDeque<u32>,
    /// Call frames held back, paired with the embargo id count that was
    /// outstanding when they were queued (so a call queued after embargo
    /// A was issued but before embargo B is released once A echoes, not
    /// held hostage to B).
    queued: VecDeque<(u32, Vec<u8>)>,
}

#[derive(Default)]
pub struct Embargoes {
    by_import: HashMap<u32, ImportEmbargo>,
    next_embargo_id: u32,
}

impl Embargoes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a new embargo on `import_id`, returning the id to send in the
    /// outbound `Disembargo`.
    pub fn issue(&mut self, import_id: u32) -> u32 {
        let id = self.next_embargo_id;
        self.next_embargo_id = self.next_embargo_id.wrapping_add(1);
        self.by_import.entry(import_id).or_default().outstanding.push_back(id);
        id
    }

    pub fn is_embargoed(&self, import_id: u32) -> bool {
        self.by_import.get(&import_id).is_some_and(|e| !e.outstanding.is_empty())
    }

    /// Hold a call back because `import_id` is currently embargoed.
    pub fn queue_call(&mut self, import_id: u32, frame: Vec<u8>) {
        let entry = self.by_import.entry(import_id).or_default();
        let depth = entry.outstanding.len() as u32;
        entry.queued.push_back((depth, frame));
    }

    /// A `Disembargo` with the given context and id echoed back for
    /// `import_id`. Returns the call frames now safe to send, in order.
    /// `context` is accepted but not distinguished: both loopback
    /// contexts drain the same FIFO (see module docs).
    pub fn on_disembargo_echo(&mut self, import_id: u32, _context: DisembargoContext, embargo_id: u32) -> Vec<Vec<u8>> {
        let Some(entry) = self.by_import.get_mut(&import_id) else {
            return Vec::new();
        };
        match entry.outstanding.front() {
            Some(front) if *front == embargo_id => {
                entry.outstanding.pop_front();
            }
            _ => return Vec::new(),
        }
        let remaining_depth = entry.outstanding.len() as u32;
        let mut released = Vec::new();
        while let Some((depth, _)) = entry.queued.front() {
            if *depth > remaining_depth {
                break;
            }
            released.push(entry.queued.pop_front().unwrap().1);
        }
        if entry.outstanding.is_empty() && entry.queued.is_empty() {
            self.by_import.remove(&import_id);
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calls_queued_during_an_embargo_release_on_echo() {
        let mut e = Embargoes::new();
        let id = e.issue(1);
        assert!(e.is_embargoed(1));
        e.queue_call(1, b"a".to_vec());
        e.queue_call(1, b"b".to_vec());
        let released = e.on_disembargo_echo(1, DisembargoContext::ReceiverLoopback, id);
        assert_eq!(released, vec![b"a".to_vec(), b"b".to_vec()]);
        assert!(!e.is_embargoed(1));
    }

    #[test]
    fn unrelated_embargo_id_releases_nothing() {
        let mut e = Embargoes::new();
        e.issue(1);
        e.queue_call(1, b"a".to_vec());
        let released = e.on_disembargo_echo(1, DisembargoContext::SenderLoopback, 999);
        assert!(released.is_empty());
    }

    #[test]
    fn later_call_waits_for_its_own_embargo_depth() {
        let mut e = Embargoes::new();
        let first = e.issue(1);
        e.queue_call(1, b"before-second-embargo".to_vec());
        let second = e.issue(1);
        e.queue_call(1, b"after-second-embargo".to_vec());

        let released = e.on_disembargo_echo(1, DisembargoContext::SenderLoopback, first);
        assert_eq!(released, vec![b"before-second-embargo".to_vec()]);
        assert!(e.is_embargoed(1));

        let released = e.on_disembargo_echo(1, DisembargoContext::SenderLoopback, second);
        assert_eq!(released, vec![b"after-second-embargo".to_vec()]);
        assert!(!e.is_embargoed(1));
    }
}
