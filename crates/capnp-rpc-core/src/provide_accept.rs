//! Three-party introduction state: `Provide` registers a capability under
//! an opaque recipient key for a third peer to `Accept`; `Join` converges
//! several accept legs of the same introduction onto one agreed target.

use std::collections::HashMap;

use crate::cap_table::ResolvedCap;
use crate::slab::IdTable;

struct ProvideEntry {
    target: ResolvedCap,
    recipient: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvideOutcome {
    Inserted,
    DuplicateQuestion,
    DuplicateRecipient,
}

#[derive(Default)]
pub struct ProvideTable {
    by_question: IdTable<ProvideEntry>,
    by_recipient: HashMap<Vec<u8>, u32>,
}

impl ProvideTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, question_id: u32, recipient: Vec<u8>, target: ResolvedCap) -> ProvideOutcome {
        if self.by_question.contains(question_id) {
            return ProvideOutcome::DuplicateQuestion;
        }
        if self.by_recipient.contains_key(&recipient) {
            return ProvideOutcome::DuplicateRecipient;
        }
        self.by_recipient.insert(recipient.clone(), question_id);
        self.by_question.insert_at(question_id, ProvideEntry { target, recipient });
        ProvideOutcome::Inserted
    }

    /// Look up the target provided under `recipient`, for `Accept`.
    pub fn accept(&self, recipient: &[u8]) -> Option<ResolvedCap> {
        let question_id = *self.by_recipient.get(recipient)?;
        self.by_question.get(question_id).map(|e| e.target.clone())
    }

    pub fn remove_by_question(&mut self, question_id: u32) {
        if let Some(entry) = self.by_question.remove(question_id) {
            self.by_recipient.remove(&entry.recipient);
        }
    }
}

struct JoinPart {
    question_id: u32,
    target: ResolvedCap,
}

struct JoinState {
    part_count: u32,
    parts: HashMap<u32, JoinPart>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertJoinPartOutcome {
    Inserted,
    InsertedReady,
    PartCountMismatch,
    DuplicatePart,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Every leg resolved to the same target: all waiting questions get
    /// `Return.provided_target`.
    Converged { question_ids: Vec<u32>, target: ResolvedCap },
    /// Legs disagreed: all waiting questions get
    /// `Return.exception("join target mismatch")`.
    Mismatch { question_ids: Vec<u32> },
}

#[derive(Default)]
pub struct JoinTable {
    joins: HashMap<u32, JoinState>,
}

impl JoinTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_part(
        &mut self,
        join_id: u32,
        part_count: u32,
        part_num: u32,
        question_id: u32,
        target: ResolvedCap,
    ) -> InsertJoinPartOutcome {
        let state = self.joins.entry(join_id).or_insert_with(|| JoinState {
            part_count,
            parts: HashMap::new(),
        });
        if state.part_count != part_count {
            return InsertJoinPartOutcome::PartCountMismatch;
        }
        if state.parts.contains_key(&part_num) {
            return InsertJoinPartOutcome::DuplicatePart;
        }
        state.parts.insert(part_num, JoinPart { question_id, target });
        if state.parts.len() as u32 == state.part_count {
            InsertJoinPartOutcome::InsertedReady
        } else {
            InsertJoinPartOutcome::Inserted
        }
    }

    /// Called once `insert_part` reports `InsertedReady`. Removes the join
    /// and compares every part's resolved target for equality.
    pub fn complete_join(&mut self, join_id: u32) -> Option<JoinOutcome> {
        let state = self.joins.remove(&join_id)?;
        let mut parts: Vec<JoinPart> = state.parts.into_values().collect();
        parts.sort_by_key(|p| p.question_id);
        let question_ids = parts.iter().map(|p| p.question_id).collect();
        let first = &parts[0].target;
        if parts.iter().all(|p| &p.target == first) {
            Some(JoinOutcome::Converged {
                question_ids,
                target: first.clone(),
            })
        } else {
            Some(JoinOutcome::Mismatch { question_ids })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provide_then_accept_round_trips_the_target() {
        let mut table = ProvideTable::new();
        let target = ResolvedCap::Exported { export_id: 1 };
        assert_eq!(
            table.insert(10, b"key".to_vec(), target.clone()),
            ProvideOutcome::Inserted
        );
        assert_eq!(table.accept(b"key"), Some(target));
        assert_eq!(table.accept(b"missing"), None);
    }

    #[test]
    fn duplicate_question_id_is_rejected() {
        let mut table = ProvideTable::new();
        table.insert(10, b"a".to_vec(), ResolvedCap::None);
        assert_eq!(
            table.insert(10, b"b".to_vec(), ResolvedCap::None),
            ProvideOutcome::DuplicateQuestion
        );
    }

    #[test]
    fn duplicate_recipient_key_is_rejected() {
        let mut table = ProvideTable::new();
        table.insert(10, b"key".to_vec(), ResolvedCap::None);
        assert_eq!(
            table.insert(11, b"key".to_vec(), ResolvedCap::None),
            ProvideOutcome::DuplicateRecipient
        );
    }

    #[test]
    fn join_converges_when_every_part_agrees() {
        let mut joins = JoinTable::new();
        let target = ResolvedCap::Exported { export_id: 4 };
        assert_eq!(
            joins.insert_part(9, 2, 0, 100, target.clone()),
            InsertJoinPartOutcome::Inserted
        );
        assert_eq!(
            joins.insert_part(9, 2, 1, 101, target.clone()),
            InsertJoinPartOutcome::InsertedReady
        );
        let outcome = joins.complete_join(9).unwrap();
        match outcome {
            JoinOutcome::Converged { mut question_ids, target: t } => {
                question_ids.sort();
                assert_eq!(question_ids, vec![100, 101]);
                assert_eq!(t, target);
            }
            other => panic!("expected Converged, got {other:?}"),
        }
    }

    #[test]
    fn join_reports_mismatch_when_parts_disagree() {
        let mut joins = JoinTable::new();
        joins.insert_part(9, 2, 0, 100, ResolvedCap::Exported { export_id: 1 });
        joins.insert_part(9, 2, 1, 101, ResolvedCap::Exported { export_id: 2 });
        match joins.complete_join(9).unwrap() {
            JoinOutcome::Mismatch { .. } => {}
            other => panic!("expected Mismatch, got {other:?}"),
        }
    }

    #[test]
    fn join_part_count_mismatch_is_reported() {
        let mut joins = JoinTable::new();
        joins.insert_part(9, 2, 0, 100, ResolvedCap::None);
        assert_eq!(
            joins.insert_part(9, 3, 1, 101, ResolvedCap::None),
            InsertJoinPartOutcome::PartCountMismatch
        );
    }

    #[test]
    fn duplicate_join_part_is_reported() {
        let mut joins = JoinTable::new();
        joins.insert_part(9, 2, 0, 100, ResolvedCap::None);
        assert_eq!(
            joins.insert_part(9, 2, 0, 100, ResolvedCap::None),
            InsertJoinPartOutcome::DuplicatePart
        );
    }
}
