//! Program-start tiers, sensitivity and claim dedupe

mod common;

use chrono::Duration;

use crowd_confirm::clock::Clock;
use crowd_confirm::models::Sensitivity;

use common::Harness;

fn tiered_followers(h: &Harness) {
    h.add_program_at(5, "Season Finale", h.clock.now() + Duration::minutes(15));
    h.follow(5, &["dev-h", "dev-l", "dev-m"]);
    h.db.set_notification_sensitivity("dev-m", Sensitivity::Medium).unwrap();
    h.db.set_notification_sensitivity("dev-l", Sensitivity::Low).unwrap();
}

fn recipients(h: &Harness, kind: &str) -> Vec<Vec<String>> {
    h.gateway.of_kind(kind).into_iter().map(|(to, _)| to).collect()
}

#[tokio::test]
async fn test_tiers_follow_sensitivity() {
    let h = Harness::new();
    tiered_followers(&h);
    let notifier = h.program_notifier();

    let report = notifier.run_once().await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(recipients(&h, "PROGRAM_START_SOON"), vec![vec!["dev-h".to_string()]]);
    assert_eq!(h.gateway.of_kind("PROGRAM_START_SOON")[0].1.data["minutes"], 15);

    h.clock.advance(Duration::minutes(5));
    notifier.run_once().await.unwrap();
    h.clock.advance(Duration::minutes(5));
    notifier.run_once().await.unwrap();
    assert_eq!(
        recipients(&h, "PROGRAM_START_SOON"),
        vec![
            vec!["dev-h".to_string()],
            vec!["dev-h".to_string(), "dev-m".to_string()],
            vec!["dev-h".to_string(), "dev-l".to_string(), "dev-m".to_string()],
        ]
    );

    h.clock.advance(Duration::seconds(5 * 60 + 30));
    notifier.run_once().await.unwrap();
    assert_eq!(
        recipients(&h, "PROGRAM_STARTED"),
        vec![vec!["dev-h".to_string(), "dev-l".to_string(), "dev-m".to_string()]]
    );
}

#[tokio::test]
async fn test_repeated_ticks_inside_window_dispatch_once() {
    let h = Harness::new();
    tiered_followers(&h);
    let notifier = h.program_notifier();

    notifier.run_once().await.unwrap();
    h.clock.advance(Duration::seconds(50));
    let second = notifier.run_once().await.unwrap();

    assert_eq!(second.programs_matched, 1);
    assert_eq!(second.claimed, 0);
    assert_eq!(second.already_claimed, 1);
    assert_eq!(h.gateway.of_kind("PROGRAM_START_SOON").len(), 1);
}

#[tokio::test]
async fn test_overlapping_notifiers_dispatch_once() {
    let h = Harness::on_disk();
    tiered_followers(&h);
    let first = h.program_notifier();
    let second = h.program_notifier();

    let (a, b) = tokio::join!(first.run_once(), second.run_once());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.claimed + b.claimed, 1);
    assert_eq!(a.already_claimed + b.already_claimed, 1);
    assert_eq!(h.gateway.of_kind("PROGRAM_START_SOON").len(), 1);
}

#[tokio::test]
async fn test_unfollowed_and_ineligible_programs_are_skipped() {
    let h = Harness::new();
    h.add_program_at(6, "Nobody Watches", h.clock.now() + Duration::minutes(15));
    h.add_program_at(7, "Low Only", h.clock.now() + Duration::minutes(15));
    h.follow(7, &["dev-l"]);
    h.db.set_notification_sensitivity("dev-l", Sensitivity::Low).unwrap();

    let report = h.program_notifier().run_once().await.unwrap();
    assert_eq!(report.programs_matched, 1);
    assert_eq!(report.no_eligible_devices, 1);
    assert_eq!(report.claimed, 0);
    assert!(h.gateway.sent().is_empty());

    // The unclaimed 15-minute slot does not block the later tier
    h.clock.advance(Duration::minutes(10));
    let report = h.program_notifier().run_once().await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(recipients(&h, "PROGRAM_START_SOON"), vec![vec!["dev-l".to_string()]]);
}
