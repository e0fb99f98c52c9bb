//! Property tests for `JoinTable`: the convergence/mismatch verdict must
//! not depend on the order parts arrive in, only on whether every leg
//! resolved to the same target.

use capnp_rpc_core::{InsertJoinPartOutcome, JoinOutcome, JoinTable, ResolvedCap};
use proptest::prelude::*;

/// Feed every part of one join through the table in `order`, returning the
/// outcome reported once the last part lands.
fn run_join(targets: &[ResolvedCap], order: &[usize]) -> JoinOutcome {
    let mut joins = JoinTable::new();
    let part_count = targets.len() as u32;
    let mut last = None;
    for &part_num in order {
        let question_id = 100 + part_num as u32;
        let outcome = joins.insert_part(
            7,
            part_count,
            part_num as u32,
            question_id,
            targets[part_num].clone(),
        );
        if outcome == InsertJoinPartOutcome::InsertedReady {
            last = joins.complete_join(7);
        }
    }
    last.expect("every part was inserted exactly once, so the last one must complete the join")
}

fn permutation(len: usize, seed: u64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    // Fisher-Yates with a tiny xorshift so the test stays deterministic
    // across proptest shrinking without pulling in `rand`.
    let mut state = seed.max(1);
    for i in (1..order.len()).rev() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let j = (state as usize) % (i + 1);
        order.swap(i, j);
    }
    order
}

proptest! {
    #[test]
    fn agreeing_parts_converge_regardless_of_arrival_order(
        export_id in any::<u32>(),
        part_count in 1u32..6,
        seed in any::<u64>(),
    ) {
        let targets: Vec<ResolvedCap> = (0..part_count)
            .map(|_| ResolvedCap::Exported { export_id })
            .collect();
        let order = permutation(part_count as usize, seed);
        match run_join(&targets, &order) {
            JoinOutcome::Converged { mut question_ids, target } => {
                question_ids.sort();
                let expected: Vec<u32> = (0..part_count).map(|i| 100 + i).collect();
                prop_assert_eq!(question_ids, expected);
                prop_assert_eq!(target, ResolvedCap::Exported { export_id });
            }
            other => prop_assert!(false, "expected Converged, got {other:?}"),
        }
    }

    #[test]
    fn a_single_disagreeing_leg_forces_mismatch_regardless_of_arrival_order(
        export_id in any::<u32>(),
        other_export_id in any::<u32>(),
        part_count in 2u32..6,
        odd_one_out in 0u32..6,
        seed in any::<u64>(),
    ) {
        prop_assume!(export_id != other_export_id);
        let odd_one_out = odd_one_out % part_count;
        let targets: Vec<ResolvedCap> = (0..part_count)
            .map(|i| ResolvedCap::Exported {
                export_id: if i == odd_one_out { other_export_id } else { export_id },
            })
            .collect();
        let order = permutation(part_count as usize, seed);
        match run_join(&targets, &order) {
            JoinOutcome::Mismatch { mut question_ids } => {
                question_ids.sort();
                let expected: Vec<u32> = (0..part_count).map(|i| 100 + i).collect();
                prop_assert_eq!(question_ids, expected);
            }
            other => prop_assert!(false, "expected Mismatch, got {other:?}"),
        }
    }

    #[test]
    fn part_count_mismatch_is_rejected_before_any_target_comparison(
        declared_a in 2u32..6,
        declared_b in 2u32..6,
    ) {
        prop_assume!(declared_a != declared_b);
        let mut joins = JoinTable::new();
        assert_eq!(
            joins.insert_part(1, declared_a, 0, 100, ResolvedCap::None),
            InsertJoinPartOutcome::Inserted
        );
        prop_assert_eq!(
            joins.insert_part(1, declared_b, 1, 101, ResolvedCap::None),
            InsertJoinPartOutcome::PartCountMismatch
        );
    }
}
