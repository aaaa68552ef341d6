//! Connection Loss and Resync Tests
//!
//! When the event stream is lost the dispatcher rebuilds state from a
//! snapshot:
//! - Recent offline edits are resent once and confirmed
//! - Changes made by others while offline appear after reconnecting
//! - Repeated resync failures raise a notice that persists until recovery
//! - Edits older than the retry budget are rolled back for manual retry
//! - Stopping the dispatcher releases its event stream

mod helpers;

use std::sync::Arc;

use helpers::{eventually, fast_config, Fixture, SETTLE};
use setlist_common::{ClientId, Error, SongId, UserId};
use setlist_compose::authz::Role;
use setlist_compose::identity::StaticIdentity;
use setlist_compose::store::BackingStore;
use setlist_compose::{Composer, ConnectionState, Dispatcher, NoticeKind};

#[tokio::test]
async fn test_offline_edits_are_resent_after_reconnect() {
    let fixture = Fixture::new();
    let client = fixture.started(Role::Leader).await;

    client.link.set_online(false);
    assert!(eventually(SETTLE, || client.composer.connection() != ConnectionState::Live).await);

    client.composer.propose_add(SongId::new(), None).unwrap();
    let after = client.ids().first().copied();
    client.composer.propose_add(SongId::new(), after).unwrap();
    assert_eq!(client.ids().len(), 2);
    assert!(fixture.canonical_ids().is_empty());

    client.link.set_online(true);
    assert!(eventually(SETTLE, || fixture.converged(&[&client])).await);
    assert_eq!(fixture.canonical_ids().len(), 2);
    assert!(!client.has_notice(NoticeKind::ManualRetry));
}

#[tokio::test]
async fn test_changes_missed_while_offline_appear() {
    let fixture = Fixture::new();
    let a = fixture.started(Role::Leader).await;
    let b = fixture.started(Role::Leader).await;
    for _ in 0..3 {
        let after = b.ids().last().copied();
        b.composer.propose_add(SongId::new(), after).unwrap();
    }
    assert!(eventually(SETTLE, || fixture.converged(&[&a, &b])).await);

    a.link.set_online(false);
    assert!(eventually(SETTLE, || a.composer.connection() != ConnectionState::Live).await);

    let gone = b.ids()[1];
    b.composer.propose_remove(gone).unwrap();
    b.composer.propose_add(SongId::new(), None).unwrap();
    assert!(eventually(SETTLE, || fixture.converged(&[&b])).await);
    assert!(a.ids().contains(&gone), "offline client still shows the old list");

    a.link.set_online(true);
    assert!(eventually(SETTLE, || fixture.converged(&[&a, &b])).await);
    assert!(!a.ids().contains(&gone));
}

#[tokio::test]
async fn test_resync_failure_notice_persists_until_recovery() {
    let fixture = Fixture::new();
    let client = fixture.started(Role::Leader).await;

    client.link.set_online(false);
    assert!(eventually(SETTLE, || client.has_notice(NoticeKind::ResyncFailing)).await);

    client.composer.dismiss_notices();
    assert!(client.has_notice(NoticeKind::ResyncFailing));

    client.link.set_online(true);
    assert!(eventually(SETTLE, || !client.has_notice(NoticeKind::ResyncFailing)).await);
    assert_eq!(client.composer.connection(), ConnectionState::Live);
}

#[tokio::test]
async fn test_old_offline_edits_need_manual_retry() {
    let mut config = fast_config();
    config.sync.retry_budget_ms = 0;
    let fixture = Fixture::with_config(config);
    let client = fixture.started(Role::Leader).await;

    client.link.set_online(false);
    assert!(eventually(SETTLE, || client.composer.connection() != ConnectionState::Live).await);
    client.composer.propose_add(SongId::new(), None).unwrap();

    client.link.set_online(true);
    assert!(eventually(SETTLE, || client.has_notice(NoticeKind::ManualRetry)).await);
    assert_eq!(client.composer.pending_count(), 0);
    assert!(client.ids().is_empty());
    assert!(fixture.canonical_ids().is_empty());
}

#[tokio::test]
async fn test_stop_releases_event_stream() {
    let fixture = Fixture::new();
    let user = UserId::new();
    fixture.store.grant(user, fixture.tenant, Role::Leader);
    let identity = StaticIdentity::new(user).with_role(fixture.tenant, Role::Leader);
    let composer = Composer::connect(
        &identity,
        fixture.store.as_ref(),
        &fixture.service,
        ClientId::new(),
        &fixture.config,
    )
    .await
    .unwrap();
    assert_eq!(fixture.store.event_bus().subscriber_count(), 0);

    let store: Arc<dyn BackingStore> = fixture.store.clone();
    let handle = Dispatcher::start(composer.clone(), store, fixture.config.sync.clone())
        .await
        .unwrap();
    assert!(handle.is_running());
    assert_eq!(fixture.store.event_bus().subscriber_count(), 1);

    composer.propose_add(SongId::new(), None).unwrap();
    assert!(eventually(SETTLE, || composer.pending_count() == 0).await);

    handle.stop().await;
    assert_eq!(fixture.store.event_bus().subscriber_count(), 0);

    // Proposals still work locally, nothing sends them
    composer.propose_add(SongId::new(), None).unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(composer.pending_count(), 1);
    assert_eq!(fixture.canonical_ids().len(), 1);
}

#[tokio::test]
async fn test_resync_attempts_back_off_while_offline() {
    let mut config = fast_config();
    config.sync.heartbeat_interval_ms = 20;
    config.sync.resync_backoff_max_ms = 1_000;
    config.sync.resync_banner_after = 100;
    let fixture = Fixture::with_config(config);
    let client = fixture.started(Role::Leader).await;

    client.link.set_online(false);
    assert!(eventually(SETTLE, || client.composer.connection() != ConnectionState::Live).await);
    let before = client.link.heartbeat_count();
    tokio::time::sleep(std::time::Duration::from_millis(600)).await;

    // About 30 ticks pass; doubling gaps leave room for only a handful of attempts
    let attempts = client.link.heartbeat_count() - before;
    assert!(attempts >= 2, "resync stopped retrying: {attempts}");
    assert!(attempts <= 10, "resync retried on every tick: {attempts}");

    client.link.set_online(true);
    assert!(eventually(SETTLE, || client.composer.connection() == ConnectionState::Live).await);
}

#[tokio::test]
async fn test_start_rejects_invalid_sync_config() {
    let fixture = Fixture::new();
    let client = fixture.client(Role::Leader).await;

    let mut zero_heartbeat = fixture.config.sync.clone();
    zero_heartbeat.heartbeat_interval_ms = 0;
    let mut no_banner = fixture.config.sync.clone();
    no_banner.resync_banner_after = 0;

    for config in [zero_heartbeat, no_banner] {
        let store: Arc<dyn BackingStore> = Arc::new(client.link.clone());
        let result = Dispatcher::start(client.composer.clone(), store, config).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
    assert_eq!(fixture.store.event_bus().subscriber_count(), 0);
}
