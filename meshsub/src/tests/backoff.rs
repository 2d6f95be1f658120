use std::time::{Duration, Instant};

use crate::backoff::BackoffTable;
use crate::types::PeerId;

#[test]
fn test_backoff_suppresses_until_expiry() {
    let mut table = BackoffTable::new();
    let peer = PeerId::random();
    let now = Instant::now();

    table.set("topic", &peer, now + Duration::from_secs(60));

    assert!(table.is_backing_off("topic", &peer, now, Duration::ZERO));
    assert!(table.is_backing_off("topic", &peer, now + Duration::from_secs(59), Duration::ZERO));
    assert!(!table.is_backing_off("topic", &peer, now + Duration::from_secs(60), Duration::ZERO));
    assert!(!table.is_backing_off("topic", &peer, now + Duration::from_secs(90), Duration::ZERO));
}

#[test]
fn test_backoff_slack_ends_embargo_early() {
    let mut table = BackoffTable::new();
    let peer = PeerId::random();
    let now = Instant::now();
    let slack = Duration::from_secs(2);

    table.set("topic", &peer, now + Duration::from_secs(60));

    // With slack, the embargo reads as over `slack` before expiry.
    assert!(table.is_backing_off("topic", &peer, now + Duration::from_secs(57), slack));
    assert!(!table.is_backing_off("topic", &peer, now + Duration::from_secs(58), slack));
    assert!(!table.is_backing_off("topic", &peer, now + Duration::from_secs(59), slack));
}

#[test]
fn test_backoff_never_shortens() {
    let mut table = BackoffTable::new();
    let peer = PeerId::random();
    let now = Instant::now();

    table.set("topic", &peer, now + Duration::from_secs(60));
    table.set("topic", &peer, now + Duration::from_secs(10));
    assert_eq!(table.get("topic", &peer), Some(now + Duration::from_secs(60)));

    table.set("topic", &peer, now + Duration::from_secs(90));
    assert_eq!(table.get("topic", &peer), Some(now + Duration::from_secs(90)));
}

#[test]
fn test_backoff_interval_clamped_to_one_day() {
    let mut table = BackoffTable::new();
    let peer = PeerId::random();
    let now = Instant::now();

    table.set_interval("topic", &peer, now, Duration::from_secs(3 * 24 * 60 * 60));
    let expiry = table.get("topic", &peer).unwrap();
    assert_eq!(expiry, now + Duration::from_secs(24 * 60 * 60));
}

#[test]
fn test_age_expired_removes_only_elapsed_entries() {
    let mut table = BackoffTable::new();
    let expired = PeerId::random();
    let live = PeerId::random();
    let now = Instant::now();

    table.set("topic", &expired, now + Duration::from_secs(5));
    table.set("topic", &live, now + Duration::from_secs(60));
    assert_eq!(table.len("topic"), 2);

    table.age_expired("topic", now + Duration::from_secs(5));
    assert_eq!(table.len("topic"), 1);
    assert!(table.get("topic", &expired).is_none());
    assert!(table.get("topic", &live).is_some());

    table.age_expired("topic", now + Duration::from_secs(60));
    assert!(table.is_empty());
}

#[test]
fn test_entries_are_per_topic() {
    let mut table = BackoffTable::new();
    let peer = PeerId::random();
    let now = Instant::now();

    table.set("blocks", &peer, now + Duration::from_secs(60));
    assert!(table.is_backing_off("blocks", &peer, now, Duration::ZERO));
    assert!(!table.is_backing_off("votes", &peer, now, Duration::ZERO));
}
