//! Proptest strategies over the lifecycle graph.

use consent_core::status::PermissionProcessStatus;
use consent_core::transition::TransitionTable;
use proptest::prelude::*;

/// Any status.
pub fn any_status() -> impl Strategy<Value = PermissionProcessStatus> {
    proptest::sample::select(PermissionProcessStatus::ALL.to_vec())
}

/// Any sequence of statuses, legal or not.
pub fn any_statuses(max_len: usize) -> impl Strategy<Value = Vec<PermissionProcessStatus>> {
    proptest::collection::vec(any_status(), 0..=max_len)
}

/// A legal walk through the canonical table starting at `CREATED`.
///
/// Each step picks one allowed successor; the walk stops early once it
/// reaches a status without successors.
pub fn valid_walk(max_steps: usize) -> impl Strategy<Value = Vec<PermissionProcessStatus>> {
    proptest::collection::vec(any::<prop::sample::Index>(), 0..=max_steps)
        .prop_map(|choices| walk(&TransitionTable::canonical(), &choices))
}

/// Follow `choices` through `table` starting at `CREATED`.
#[must_use]
pub fn walk(table: &TransitionTable, choices: &[prop::sample::Index]) -> Vec<PermissionProcessStatus> {
    let mut statuses = vec![PermissionProcessStatus::Created];
    let mut current = PermissionProcessStatus::Created;
    for choice in choices {
        let successors = table.successors(current);
        if successors.is_empty() {
            break;
        }
        current = *choice.get(&successors);
        statuses.push(current);
    }
    statuses
}
