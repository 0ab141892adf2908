//! The transition table: which status may follow which.
//!
//! The table is the single arbiter of legal lifecycle moves. It is written out
//! once as the [`CANONICAL_EDGES`] literal and turned into an immutable
//! [`TransitionTable`] at startup; nothing mutates it afterwards.
//!
//! ```text
//! CREATED ──► VALIDATED ──► SENT_TO_PA ──► ACCEPTED ──► FULFILLED ─┐
//!    │          │  ▲  │        ▲  │ │ │       │ │ │                 │
//!    ▼          │  │  ▼        │  │ │ │       │ │ └► UNFULFILLABLE ─┤
//! MALFORMED     │  UNABLE_TO   │  │ │ │       │ └──► TERMINATED ────┤
//!               │  _SEND       │  │ │ │       └────► REVOKED        │
//!               ▼              │  ▼ ▼ ▼                             ▼
//!            PENDING_ACK ──────┘  TIMED_OUT                 REQUIRES_EXTERNAL_
//!                                 INVALID                   TERMINATION ◄──┐
//!                                 REJECTED                    │      │     │
//!                                                             ▼      ▼     │
//!                                              EXTERNALLY_TERMINATED  FAILED_TO_TERMINATE
//! ```
//!
//! Region connectors may operate on a narrower table (see
//! [`TransitionTable::without`]) but can never add an edge.
//!
//! The module also hosts the walk checker used both by the outbox when it
//! rehydrates streams and by the property tests: a sequence of committed
//! statuses is valid only if every consecutive pair is an allowed edge.

use crate::status::PermissionProcessStatus;
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

use PermissionProcessStatus::{
    Accepted, Created, ExternallyTerminated, FailedToTerminate, Fulfilled, Invalid, Malformed,
    PendingPermissionAdministratorAcknowledgement, Rejected, RequiresExternalTermination,
    Revoked, SentToPermissionAdministrator, Terminated, TimedOut, UnableToSend, Unfulfillable,
    Validated,
};

/// One row of the canonical table: `(status, terminal, allowed next statuses)`.
pub type EdgeRow = (
    PermissionProcessStatus,
    bool,
    &'static [PermissionProcessStatus],
);

/// The canonical status graph shared by every region connector.
pub const CANONICAL_EDGES: [EdgeRow; 17] = [
    (Created, false, &[Validated, Malformed]),
    (
        Validated,
        false,
        &[
            SentToPermissionAdministrator,
            PendingPermissionAdministratorAcknowledgement,
            UnableToSend,
        ],
    ),
    (Malformed, true, &[]),
    (UnableToSend, false, &[Validated]),
    (
        SentToPermissionAdministrator,
        false,
        &[TimedOut, Invalid, Rejected, Accepted],
    ),
    (
        PendingPermissionAdministratorAcknowledgement,
        false,
        &[SentToPermissionAdministrator],
    ),
    (Accepted, false, &[Fulfilled, Terminated, Unfulfillable, Revoked]),
    (Rejected, true, &[]),
    (Invalid, true, &[]),
    (TimedOut, true, &[]),
    (Fulfilled, true, &[RequiresExternalTermination]),
    (Unfulfillable, true, &[RequiresExternalTermination]),
    (Terminated, true, &[RequiresExternalTermination]),
    (Revoked, true, &[]),
    (
        RequiresExternalTermination,
        false,
        &[ExternallyTerminated, FailedToTerminate],
    ),
    (FailedToTerminate, false, &[RequiresExternalTermination]),
    (ExternallyTerminated, true, &[]),
];

/// A move that the table does not allow.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Transition {from} -> {to} is not allowed")]
pub struct IllegalTransition {
    /// Status the aggregate was in.
    pub from: PermissionProcessStatus,
    /// Status that was requested.
    pub to: PermissionProcessStatus,
}

/// Errors reported by the walk checker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalkError {
    /// The stream contains no events at all.
    #[error("Event stream is empty")]
    Empty,

    /// The first event does not assert `CREATED`.
    #[error("Event stream must start with CREATED, found {0}")]
    InvalidStart(PermissionProcessStatus),

    /// Two consecutive statuses are not connected by an edge.
    #[error("Illegal step at position {position}: {from} -> {to}")]
    IllegalStep {
        /// Zero-based index of the offending event.
        position: usize,
        /// Status before the step.
        from: PermissionProcessStatus,
        /// Status asserted by the step.
        to: PermissionProcessStatus,
    },

    /// A status-preserving fact asserted a status other than the current one.
    #[error("Event at position {position} asserts {asserted} while the request is {current}")]
    AssertionMismatch {
        /// Zero-based index of the offending event.
        position: usize,
        /// Status the stream was in.
        current: PermissionProcessStatus,
        /// Status the event asserted.
        asserted: PermissionProcessStatus,
    },
}

/// How one committed event moves the status.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Step {
    /// The event moves the request to this status.
    Transition(PermissionProcessStatus),
    /// The event records a fact and asserts the request stays in this status.
    Assertion(PermissionProcessStatus),
}

impl Step {
    /// Status asserted by this step.
    #[must_use]
    pub const fn status(self) -> PermissionProcessStatus {
        match self {
            Self::Transition(status) | Self::Assertion(status) => status,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct StatusRule {
    terminal: bool,
    next: BTreeSet<PermissionProcessStatus>,
}

/// Immutable adjacency map of allowed status changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionTable {
    rules: HashMap<PermissionProcessStatus, StatusRule>,
}

impl TransitionTable {
    /// Build the table from [`CANONICAL_EDGES`].
    #[must_use]
    pub fn canonical() -> Self {
        let rules = CANONICAL_EDGES
            .iter()
            .map(|&(status, terminal, next)| {
                (
                    status,
                    StatusRule {
                        terminal,
                        next: next.iter().copied().collect(),
                    },
                )
            })
            .collect();
        Self { rules }
    }

    /// Narrow the table by dropping statuses a connector never uses.
    ///
    /// Every edge into or out of an omitted status disappears. The result is
    /// always a subset of the original table.
    ///
    /// # Examples
    ///
    /// ```
    /// use consent_core::status::PermissionProcessStatus as S;
    /// use consent_core::transition::TransitionTable;
    ///
    /// let table = TransitionTable::canonical()
    ///     .without(&[S::PendingPermissionAdministratorAcknowledgement]);
    /// assert!(table.allowed(S::Validated, S::SentToPermissionAdministrator));
    /// assert!(!table.allowed(S::Validated, S::PendingPermissionAdministratorAcknowledgement));
    /// ```
    #[must_use]
    pub fn without(mut self, omitted: &[PermissionProcessStatus]) -> Self {
        for status in omitted {
            self.rules.remove(status);
        }
        for rule in self.rules.values_mut() {
            rule.next.retain(|next| !omitted.contains(next));
        }
        self
    }

    /// Whether `current -> next` is an edge of the table.
    #[must_use]
    pub fn allowed(&self, current: PermissionProcessStatus, next: PermissionProcessStatus) -> bool {
        self.rules
            .get(&current)
            .is_some_and(|rule| rule.next.contains(&next))
    }

    /// Whether `status` is terminal (stops accepting domain transitions).
    #[must_use]
    pub fn is_terminal(&self, status: PermissionProcessStatus) -> bool {
        self.rules.get(&status).is_some_and(|rule| rule.terminal)
    }

    /// Whether the table knows `status` at all.
    #[must_use]
    pub fn contains(&self, status: PermissionProcessStatus) -> bool {
        self.rules.contains_key(&status)
    }

    /// Allowed successors of `status`, in declaration order.
    #[must_use]
    pub fn successors(&self, status: PermissionProcessStatus) -> Vec<PermissionProcessStatus> {
        self.rules
            .get(&status)
            .map(|rule| rule.next.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Check a single edge.
    ///
    /// # Errors
    ///
    /// Returns [`IllegalTransition`] if the edge is absent.
    pub fn check(
        &self,
        from: PermissionProcessStatus,
        to: PermissionProcessStatus,
    ) -> Result<(), IllegalTransition> {
        if self.allowed(from, to) {
            Ok(())
        } else {
            Err(IllegalTransition { from, to })
        }
    }

    /// Fold a stream of steps through the table and return the final status.
    ///
    /// The first step must be a transition to `CREATED`. Every following
    /// transition must be an allowed edge; every assertion must repeat the
    /// current status.
    ///
    /// # Errors
    ///
    /// Returns the first [`WalkError`] encountered.
    pub fn check_walk<I>(&self, steps: I) -> Result<PermissionProcessStatus, WalkError>
    where
        I: IntoIterator<Item = Step>,
    {
        let mut steps = steps.into_iter().enumerate();
        let current = match steps.next() {
            None => return Err(WalkError::Empty),
            Some((_, Step::Transition(Created))) => Created,
            Some((_, step)) => return Err(WalkError::InvalidStart(step.status())),
        };

        steps.try_fold(current, |current, (position, step)| match step {
            Step::Transition(to) if self.allowed(current, to) => Ok(to),
            Step::Transition(to) => Err(WalkError::IllegalStep {
                position,
                from: current,
                to,
            }),
            Step::Assertion(asserted) if asserted == current => Ok(current),
            Step::Assertion(asserted) => Err(WalkError::AssertionMismatch {
                position,
                current,
                asserted,
            }),
        })
    }

    /// Convenience wrapper of [`check_walk`](Self::check_walk) for plain status sequences.
    ///
    /// # Errors
    ///
    /// Returns the first [`WalkError`] encountered.
    pub fn check_statuses<I>(&self, statuses: I) -> Result<PermissionProcessStatus, WalkError>
    where
        I: IntoIterator<Item = PermissionProcessStatus>,
    {
        self.check_walk(statuses.into_iter().map(Step::Transition))
    }
}

impl Default for TransitionTable {
    fn default() -> Self {
        Self::canonical()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn every_status_has_a_row() {
        let table = TransitionTable::canonical();
        for status in PermissionProcessStatus::ALL {
            assert!(table.contains(status), "missing row for {status}");
        }
    }

    #[test]
    fn non_terminal_statuses_have_successors() {
        let table = TransitionTable::canonical();
        for status in PermissionProcessStatus::ALL {
            if !table.is_terminal(status) {
                assert!(!table.successors(status).is_empty(), "{status} is a dead end");
            }
        }
    }

    #[test]
    fn compensating_edges_only_lead_to_external_termination() {
        let table = TransitionTable::canonical();
        for status in [Fulfilled, Terminated, Unfulfillable] {
            assert!(table.is_terminal(status));
            assert_eq!(table.successors(status), vec![RequiresExternalTermination]);
        }
    }

    #[test]
    fn absorbing_statuses_have_no_edges() {
        let table = TransitionTable::canonical();
        for status in [Malformed, TimedOut, Invalid, Rejected, Revoked, ExternallyTerminated] {
            assert!(table.is_terminal(status));
            assert!(table.successors(status).is_empty());
        }
    }

    #[test]
    fn retry_loops_exist() {
        let table = TransitionTable::canonical();
        assert!(table.allowed(UnableToSend, Validated));
        assert!(table.allowed(FailedToTerminate, RequiresExternalTermination));
        assert!(!table.is_terminal(FailedToTerminate));
    }

    #[test]
    fn check_reports_illegal_edges() {
        let table = TransitionTable::canonical();
        assert_eq!(
            table.check(Created, Accepted),
            Err(IllegalTransition {
                from: Created,
                to: Accepted
            })
        );
    }

    #[test]
    fn walk_through_happy_path() {
        let table = TransitionTable::canonical();
        let result = table.check_statuses([
            Created,
            Validated,
            PendingPermissionAdministratorAcknowledgement,
            SentToPermissionAdministrator,
            Accepted,
            Terminated,
            RequiresExternalTermination,
            FailedToTerminate,
            RequiresExternalTermination,
            ExternallyTerminated,
        ]);
        assert_eq!(result, Ok(ExternallyTerminated));
    }

    #[test]
    fn walk_must_start_with_created() {
        let table = TransitionTable::canonical();
        assert_eq!(table.check_statuses([]), Err(WalkError::Empty));
        assert_eq!(
            table.check_statuses([Validated]),
            Err(WalkError::InvalidStart(Validated))
        );
    }

    #[test]
    fn walk_reports_position_of_illegal_step() {
        let table = TransitionTable::canonical();
        assert_eq!(
            table.check_statuses([Created, Validated, Accepted]),
            Err(WalkError::IllegalStep {
                position: 2,
                from: Validated,
                to: Accepted
            })
        );
    }

    #[test]
    fn assertions_must_repeat_current_status() {
        let table = TransitionTable::canonical();
        let steps = [
            Step::Transition(Created),
            Step::Transition(Validated),
            Step::Transition(SentToPermissionAdministrator),
            Step::Transition(Accepted),
            Step::Assertion(Accepted),
            Step::Assertion(Accepted),
            Step::Transition(Fulfilled),
        ];
        assert_eq!(table.check_walk(steps), Ok(Fulfilled));

        let bad = [Step::Transition(Created), Step::Assertion(Accepted)];
        assert_eq!(
            table.check_walk(bad),
            Err(WalkError::AssertionMismatch {
                position: 1,
                current: Created,
                asserted: Accepted
            })
        );
    }

    #[test]
    fn narrowed_table_is_a_subset() {
        let canonical = TransitionTable::canonical();
        let narrow = canonical
            .clone()
            .without(&[PendingPermissionAdministratorAcknowledgement, UnableToSend]);
        for from in PermissionProcessStatus::ALL {
            for to in PermissionProcessStatus::ALL {
                if narrow.allowed(from, to) {
                    assert!(canonical.allowed(from, to));
                }
            }
        }
        assert!(!narrow.contains(UnableToSend));
    }

    fn any_status() -> impl Strategy<Value = PermissionProcessStatus> {
        proptest::sample::select(PermissionProcessStatus::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn absorbing_statuses_accept_nothing(to in any_status()) {
            let table = TransitionTable::canonical();
            for from in [Malformed, TimedOut, Invalid, Rejected, Revoked, ExternallyTerminated] {
                prop_assert!(!table.allowed(from, to));
            }
        }

        #[test]
        fn random_walks_along_edges_are_valid(choices in proptest::collection::vec(0usize..8, 0..40)) {
            let table = TransitionTable::canonical();
            let mut path = vec![Created];
            for choice in choices {
                let Some(&last) = path.last() else { break };
                let next = table.successors(last);
                if next.is_empty() {
                    break;
                }
                path.push(next[choice % next.len()]);
            }
            let last = path.last().copied();
            prop_assert_eq!(table.check_statuses(path).ok(), last);
        }
    }
}
