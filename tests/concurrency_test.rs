//! Racing confirmations against a shared file database

mod common;

use std::sync::Arc;
use std::thread;

use chrono::Duration;
use proptest::prelude::*;

use crowd_confirm::consensus::FanOutOutcome;
use crowd_confirm::db::Claim;
use crowd_confirm::error::ConflictKind;
use crowd_confirm::models::{Choice, EventStatus, NewEventOptions};

use common::Harness;

const DEVICES: [&str; 8] = ["d0", "d1", "d2", "d3", "d4", "d5", "d6", "d7"];

fn roster_event(h: &Harness) -> i64 {
    h.add_program(7, "Cup Final");
    h.follow(7, &DEVICES);
    h.follow(7, &["watcher-1", "watcher-2"]);
    h.service.create_event("d0", 7, &NewEventOptions::default()).unwrap().event.id
}

#[test]
fn test_concurrent_confirms_validate_exactly_once() {
    let h = Harness::on_disk();
    let id = roster_event(&h);
    let engine = Arc::clone(&h.engine);

    let workers: Vec<_> = DEVICES
        .iter()
        .map(|device| {
            let engine = Arc::clone(&engine);
            let device = device.to_string();
            thread::spawn(move || engine.confirm_event(id, &device, Choice::Corroborate, false).unwrap())
        })
        .collect();
    let outcomes: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    assert_eq!(outcomes.iter().filter(|o| o.validated).count(), 1);
    assert!(outcomes.iter().all(|o| o.created));
    assert_eq!(h.engine.get_confirmations_count(id).unwrap(), DEVICES.len() as i64);
    assert_eq!(h.service.get_event(id).unwrap().status, EventStatus::Validated);
}

#[test]
fn test_concurrent_confirms_on_stale_event_all_fail() {
    let h = Harness::on_disk();
    let id = roster_event(&h);
    h.clock.advance(Duration::minutes(61));
    let engine = Arc::clone(&h.engine);

    let workers: Vec<_> = DEVICES
        .iter()
        .map(|device| {
            let engine = Arc::clone(&engine);
            let device = device.to_string();
            thread::spawn(move || engine.confirm_event(id, &device, Choice::Corroborate, false))
        })
        .collect();
    let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    assert!(results
        .iter()
        .all(|r| matches!(r, Err(e) if e.is_conflict(ConflictKind::Expired))));
    assert_eq!(h.engine.get_confirmations_count(id).unwrap(), 0);
    assert!(h.engine.list_confirmations(id).unwrap().is_empty());
    assert_eq!(h.service.get_event(id).unwrap().status, EventStatus::Expired);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_service_confirms_push_once() {
    let h = Harness::on_disk();
    let id = roster_event(&h);

    let tasks: Vec<_> = DEVICES
        .iter()
        .map(|device| {
            let service = h.service.clone();
            let device = device.to_string();
            tokio::spawn(async move { service.confirm_event(id, &device, Choice::Corroborate, false).await })
        })
        .collect();

    let mut dispatched = 0;
    for task in tasks {
        let report = task.await.unwrap().unwrap();
        if matches!(report.fan_out, Some(FanOutOutcome::Dispatched { .. })) {
            dispatched += 1;
        }
    }

    assert_eq!(dispatched, 1);
    let pushes = h.gateway.of_kind("EVENT_STARTED");
    assert_eq!(pushes.len(), 1);
    // Whoever had not confirmed when the fan-out ran; the two watchers never confirm
    assert!(pushes[0].0.contains(&"watcher-1".to_string()));
    assert!(pushes[0].0.contains(&"watcher-2".to_string()));
    assert!(!pushes[0].0.contains(&"d0".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_fan_out_claims_once() {
    let h = Harness::on_disk();
    let id = roster_event(&h);
    for device in &DEVICES[..3] {
        h.engine.confirm_event(id, device, Choice::Corroborate, false).unwrap();
    }

    let tasks: Vec<_> = (0..6)
        .map(|_| {
            let engine = Arc::clone(&h.engine);
            tokio::spawn(async move { engine.fan_out(id).await.unwrap() })
        })
        .collect();

    let mut claimed = 0;
    for task in tasks {
        if task.await.unwrap() != FanOutOutcome::AlreadyClaimed {
            claimed += 1;
        }
    }
    assert_eq!(claimed, 1);
    assert_eq!(h.gateway.of_kind("EVENT_STARTED").len(), 1);
}

#[derive(Debug, Clone)]
enum Op {
    Confirm { device: usize, corroborate: bool },
    Claim,
    AdvanceMinutes(i64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..6usize, any::<bool>()).prop_map(|(device, corroborate)| Op::Confirm { device, corroborate }),
        2 => Just(Op::Claim),
        1 => (1..40i64).prop_map(Op::AdvanceMinutes),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: the push claim is granted at most once, never before validation,
    /// and a validated event stays validated.
    #[test]
    fn push_claim_at_most_once_and_status_never_reverts(ops in proptest::collection::vec(op(), 1..40)) {
        let h = Harness::new();
        h.add_program(3, "Election Night");
        h.follow(3, &["p0", "p1", "p2", "p3", "p4", "p5"]);
        let id = h.service.create_event("p0", 3, &NewEventOptions::default()).unwrap().event.id;

        let mut claims = 0;
        let mut pushed_at = None;
        let mut seen_validated = false;

        for op in ops {
            match op {
                Op::Confirm { device, corroborate } => {
                    let choice = if corroborate { Choice::Corroborate } else { Choice::Deny };
                    // Conflicts after expiry are expected
                    let _ = h.engine.confirm_event(id, &format!("p{device}"), choice, false);
                }
                Op::Claim => {
                    if h.engine.claim_initial_push(id).unwrap() == Claim::Claimed {
                        claims += 1;
                    }
                }
                Op::AdvanceMinutes(minutes) => h.clock.advance(Duration::minutes(minutes)),
            }

            let event = h.service.get_event(id).unwrap();
            if seen_validated {
                prop_assert_eq!(event.status, EventStatus::Validated);
            }
            seen_validated |= event.status == EventStatus::Validated;

            if event.initial_push_sent_at.is_some() {
                prop_assert!(event.validated_at.is_some());
            }
            if let Some(at) = pushed_at {
                prop_assert_eq!(event.initial_push_sent_at, Some(at));
            }
            pushed_at = event.initial_push_sent_at;
        }

        prop_assert!(claims <= 1);
    }
}
