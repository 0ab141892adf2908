//! Property tests over arbitrary commit sequences.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use common::{bare, fast_config, harness_with};
use consent_core::environment::Clock;
use consent_core::event::PermissionEvent;
use consent_core::event_bus::EventBus;
use consent_core::event_store::{EventStore, load_permission_events};
use consent_core::outbox::Outbox;
use consent_core::repository::PermissionRequestRepository;
use consent_core::request::PermissionRequest;
use consent_core::stream::PermissionId;
use consent_core::transition::TransitionTable;
use consent_core::PermissionProcessStatus as Status;
use consent_testing::helpers::{events_for, payload_for};
use consent_testing::properties::{any_statuses, valid_walk};
use consent_testing::{ScriptedAdministrator, ScriptedMeterDataSource};
use proptest::prelude::*;

/// Everything a delivery could have changed.
#[derive(Debug, PartialEq, Eq)]
struct Outcome {
    status: Status,
    version: u64,
    submit_calls: usize,
    terminate_calls: usize,
    meter_calls: usize,
}

/// Feed `walk` to a fresh engine, recover it, and deliver the last event
/// `extra_deliveries` more times on top of the one recovery publishes.
async fn replay_with_deliveries(walk: &[Status], extra_deliveries: usize) -> Outcome {
    let h = harness_with(
        fast_config(),
        ScriptedAdministrator::new(),
        Some(ScriptedMeterDataSource::new()),
    );
    let permission_id = PermissionId::new("p1");
    let events = events_for(&permission_id, walk, h.clock.now());
    let serialized = events.iter().map(|event| event.to_serialized().unwrap()).collect();
    let store: &dyn EventStore = &h.store;
    store.append(permission_id.clone(), None, serialized).await.unwrap();
    assert!(h.engine.rehydrate().await.unwrap().is_clean());

    let last = events.last().unwrap();
    for _ in 0..extra_deliveries {
        h.engine.bus().publish(last).unwrap();
    }
    h.engine.settle().await;

    let request = h.engine.request(&permission_id).await.unwrap();
    Outcome {
        status: request.status(),
        version: request.version().value(),
        submit_calls: h.administrator.submit_calls(),
        terminate_calls: h.administrator.terminate_calls(),
        meter_calls: h.meter_data.as_ref().map_or(0, |source| source.calls()),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn committed_streams_are_always_legal(statuses in any_statuses(12)) {
        tokio_test::block_on(async {
            let b = bare();
            let permission_id = PermissionId::new("p1");
            for status in &statuses {
                let event = PermissionEvent::new(permission_id.clone(), payload_for(*status), b.clock.now());
                // Illegal changes are refused; the rest must commit.
                let _ = b.outbox.commit(event).await;
            }

            let stored = load_permission_events(&b.store, &permission_id).await.unwrap();
            if stored.is_empty() {
                prop_assert!(statuses.first() != Some(&Status::Created));
                return Ok(());
            }

            let table = TransitionTable::canonical();
            let last = table.check_walk(stored.iter().map(PermissionEvent::step));
            prop_assert!(last.is_ok(), "{:?}", last);

            // Past a terminal status only the external termination may proceed.
            if let Some(position) = stored.iter().position(|event| table.is_terminal(event.status())) {
                for event in &stored[position + 1..] {
                    prop_assert!(matches!(
                        event.status(),
                        Status::RequiresExternalTermination
                            | Status::FailedToTerminate
                            | Status::ExternallyTerminated
                    ));
                }
            }

            // The projection equals the fold of the stored stream.
            let replayed = PermissionRequest::from_events(&stored).unwrap();
            let projected = b
                .repository
                .find_by_permission_id(&permission_id)
                .await
                .unwrap()
                .unwrap();
            prop_assert_eq!(replayed.status(), projected.status());
            prop_assert_eq!(replayed.version(), projected.version());
            prop_assert_eq!(replayed.version().value(), stored.len() as u64);
            Ok(())
        })?;
    }

    #[test]
    fn duplicate_delivery_changes_nothing(walk in valid_walk(8)) {
        tokio_test::block_on(async {
            let once = replay_with_deliveries(&walk, 0).await;
            let twice = replay_with_deliveries(&walk, 1).await;
            prop_assert_eq!(once, twice);
            Ok(())
        })?;
    }
}
