//! Song Availability Tests
//!
//! The repetition rule over the usage ledger:
//! - recently used songs are "recent"
//! - frequently used songs are "caution"
//! - everything else is "available"
//! - completing a service records its songs exactly once

mod helpers;

use chrono::{Duration, TimeZone, Utc};

use helpers::{eventually, Fixture, SETTLE};
use setlist_common::models::UsageRecord;
use setlist_common::{ServiceId, SongId};
use setlist_compose::authz::Role;
use setlist_compose::usage::UsageLedger;
use setlist_compose::{Availability, AvailabilityPolicy};

fn used(song_id: SongId, at: chrono::DateTime<Utc>) -> UsageRecord {
    UsageRecord {
        song_id,
        service_id: ServiceId::new(),
        used_at: at,
    }
}

#[test]
fn test_rule_scenarios() {
    let now = Utc.with_ymd_and_hms(2026, 5, 3, 9, 0, 0).unwrap();
    let policy = AvailabilityPolicy {
        window_days: 30,
        frequency_threshold: 3,
        lookback_days: 90,
    };
    let mut ledger = UsageLedger::new();

    let recent = SongId::new();
    ledger.append(used(recent, now - Duration::days(10)));

    let frequent = SongId::new();
    for days_ago in [45, 52, 60, 75] {
        ledger.append(used(frequent, now - Duration::days(days_ago)));
    }

    let occasional = SongId::new();
    ledger.append(used(occasional, now - Duration::days(45)));
    ledger.append(used(occasional, now - Duration::days(200)));

    let never = SongId::new();

    assert_eq!(policy.evaluate(ledger.history(recent), now), Availability::Recent);
    assert_eq!(policy.evaluate(ledger.history(frequent), now), Availability::Caution);
    assert_eq!(policy.evaluate(ledger.history(occasional), now), Availability::Available);
    assert_eq!(policy.evaluate(ledger.history(never), now), Availability::Available);

    let lenient = AvailabilityPolicy {
        frequency_threshold: 0,
        ..policy
    };
    assert_eq!(lenient.evaluate(ledger.history(frequent), now), Availability::Available);
}

#[tokio::test]
async fn test_completed_service_feeds_availability() {
    let fixture = Fixture::new();
    let leader = fixture.started(Role::Leader).await;
    let songs: Vec<SongId> = (0..3).map(|_| SongId::new()).collect();
    for song in &songs {
        let after = leader.ids().last().copied();
        leader.composer.propose_add(*song, after).unwrap();
    }
    assert!(eventually(SETTLE, || fixture.converged(&[&leader])).await);

    let completed_at = Utc::now();
    leader
        .composer
        .complete_service(&leader.link, completed_at)
        .await
        .unwrap();
    // Completing again must not double count
    leader
        .composer
        .complete_service(&leader.link, completed_at)
        .await
        .unwrap();

    let ledger = fixture.ledger.lock().unwrap();
    assert_eq!(ledger.len(), 3);
    drop(ledger);

    for song in &songs {
        assert_eq!(
            leader.composer.availability_for(*song, completed_at + Duration::days(1)),
            Availability::Recent
        );
        assert_eq!(
            leader.composer.availability_for(*song, completed_at + Duration::days(31)),
            Availability::Available
        );
    }
    assert_eq!(
        leader.composer.availability_for(SongId::new(), completed_at),
        Availability::Available
    );
}

#[tokio::test]
async fn test_completed_service_rejects_edits_everywhere() {
    let fixture = Fixture::new();
    let leader = fixture.started(Role::Leader).await;
    let other = fixture.started(Role::Leader).await;

    leader
        .composer
        .complete_service(&leader.link, Utc::now())
        .await
        .unwrap();
    assert!(eventually(SETTLE, || {
        other.composer.service_status() == setlist_common::models::ServiceStatus::Completed
    })
    .await);
    assert!(other.composer.propose_add(SongId::new(), None).is_err());
}
