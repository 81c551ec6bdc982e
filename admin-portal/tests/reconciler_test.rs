mod common;

use admin_portal::models::{AllowListEntry, IdentitySource, Verdict};
use admin_portal::services::session_source::SessionEvent;
use common::{cached, drain, session, Harness};
use std::time::Duration;

#[tokio::test]
async fn no_session_and_no_cache_is_unauthorized_without_lookup() {
    let harness = Harness::new();

    let verdict = harness.reconciler().verify().await;

    assert_eq!(verdict, Some(Verdict::Unauthorized));
    assert!(harness.allow_list.lookups().is_empty());
    assert_eq!(harness.cache.write_count(), 0);
    assert_eq!(harness.cache.clear_count(), 0);
}

#[tokio::test]
async fn cached_identity_is_reverified_and_refreshed() {
    let harness = Harness::new();
    let old = cached("a@x.com", Duration::from_secs(3600));
    harness.cache.seed(Some(old.clone()));
    harness.allow_list.insert(AllowListEntry::active("a@x.com"));

    let verdict = harness.reconciler().verify().await.expect("run is current");
    drain().await;

    let identity = verdict.identity().expect("authorized");
    assert_eq!(identity.email, "a@x.com");
    assert_eq!(identity.source, IdentitySource::LocalCache);

    let rewritten = harness.cache.current().expect("cache holds the identity");
    assert!(rewritten.verified_at > old.verified_at);
    assert_eq!(harness.cache.write_count(), 1);

    let logins = harness.allow_list.logins();
    assert_eq!(logins.len(), 1);
    assert_eq!(logins[0].0, "a@x.com");
}

#[tokio::test]
async fn inactive_remote_identity_clears_cache_and_signs_out() {
    let harness = Harness::new();
    harness.source.set_session(Some(session("b@x.com")));
    harness.cache.seed(Some(cached("b@x.com", Duration::from_secs(60))));
    harness.allow_list.insert(AllowListEntry::inactive("b@x.com"));

    let verdict = harness.reconciler().verify().await;
    drain().await;

    assert_eq!(verdict, Some(Verdict::Unauthorized));
    assert!(harness.cache.current().is_none());
    assert_eq!(harness.source.sign_out_count(), 1);
}

#[tokio::test]
async fn ambiguous_failure_leaves_cache_and_session_alone() {
    let harness = Harness::new();
    harness.source.set_session(Some(session("d@x.com")));
    let before = cached("d@x.com", Duration::from_secs(60));
    harness.cache.seed(Some(before.clone()));
    harness.allow_list.fail_for("d@x.com");

    let verdict = harness.reconciler().verify().await;
    drain().await;

    assert_eq!(verdict, Some(Verdict::Unauthorized));
    assert_eq!(harness.cache.current(), Some(before));
    assert_eq!(harness.cache.write_count(), 0);
    assert_eq!(harness.cache.clear_count(), 0);
    assert_eq!(harness.source.sign_out_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn newer_sign_in_wins_over_slow_initial_check() {
    let harness = Harness::new();
    harness.source.set_session(Some(session("a@x.com")));
    harness.allow_list.insert(AllowListEntry::active("a@x.com"));
    harness.allow_list.insert(AllowListEntry::active("c@x.com"));
    harness
        .allow_list
        .delay_for("a@x.com", Duration::from_secs(2));

    let reconciler = harness.mount().await;
    harness.source.emit(SessionEvent::signed_in(session("c@x.com")));

    let verdict = reconciler.settled(Duration::from_secs(1)).await;
    assert_eq!(
        verdict.identity().map(|i| i.email.as_str()),
        Some("c@x.com")
    );

    // Let the stale check for a@x.com resolve
    tokio::time::sleep(Duration::from_secs(5)).await;

    let verdict = reconciler.verdict();
    assert_eq!(
        verdict.identity().map(|i| i.email.as_str()),
        Some("c@x.com")
    );
    assert_eq!(harness.cache.current().map(|i| i.email), Some("c@x.com".to_string()));
    assert!(harness
        .allow_list
        .logins()
        .iter()
        .all(|(email, _)| email == "c@x.com"));
    reconciler.unmount().await;
}

#[tokio::test(start_paused = true)]
async fn stale_authorization_never_overrides_newer_denial() {
    let harness = Harness::new();
    harness.source.set_session(Some(session("a@x.com")));
    harness.allow_list.insert(AllowListEntry::active("a@x.com"));
    harness
        .allow_list
        .delay_for("a@x.com", Duration::from_secs(2));

    let reconciler = harness.mount().await;
    harness.source.emit(SessionEvent::signed_in(session("c@x.com")));

    assert_eq!(
        reconciler.settled(Duration::from_secs(1)).await,
        Verdict::Unauthorized
    );

    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(reconciler.verdict(), Verdict::Unauthorized);
    assert!(harness.cache.current().is_none());
    assert!(harness.allow_list.logins().is_empty());
    reconciler.unmount().await;
}

#[tokio::test(start_paused = true)]
async fn settled_verdict_follows_the_last_event() {
    let harness = Harness::new();
    for email in ["a@x.com", "b@x.com"] {
        harness.allow_list.insert(AllowListEntry::active(email));
        harness
            .allow_list
            .delay_for(email, Duration::from_millis(300));
    }

    let reconciler = harness.mount().await;
    harness.source.emit(SessionEvent::signed_in(session("a@x.com")));
    harness.source.emit(SessionEvent::signed_out());
    harness.source.emit(SessionEvent::signed_in(session("b@x.com")));

    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(
        reconciler.verdict().identity().map(|i| i.email.as_str()),
        Some("b@x.com")
    );
    assert_eq!(harness.cache.current().map(|i| i.email), Some("b@x.com".to_string()));
    reconciler.unmount().await;
}

#[tokio::test]
async fn repeated_verification_writes_cache_once() {
    let harness = Harness::new();
    harness.source.set_session(Some(session("a@x.com")));
    harness.allow_list.insert(AllowListEntry::active("a@x.com"));
    let reconciler = harness.reconciler();

    let first = reconciler.verify().await.expect("run is current");
    let second = reconciler.verify().await.expect("run is current");

    assert!(first.is_authorized());
    assert_eq!(first, second);
    assert_eq!(harness.cache.write_count(), 1);
    assert_eq!(harness.allow_list.lookups().len(), 2);
}

#[tokio::test]
async fn every_grant_records_its_own_login_time() {
    let harness = Harness::new();
    harness.source.set_session(Some(session("a@x.com")));
    harness.allow_list.insert(AllowListEntry::active("a@x.com"));
    let reconciler = harness.reconciler();

    reconciler.verify().await.expect("run is current");
    drain().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    reconciler.verify().await.expect("run is current");
    drain().await;

    // The second grant reuses the cached entry but still moves the login forward
    assert_eq!(harness.cache.write_count(), 1);
    let logins = harness.allow_list.logins();
    assert_eq!(logins.len(), 2);
    assert!(logins[1].1 > logins[0].1);
}

#[tokio::test]
async fn token_refresh_changes_nothing() {
    let harness = Harness::new();
    harness.source.set_session(Some(session("a@x.com")));
    harness.allow_list.insert(AllowListEntry::active("a@x.com"));

    let reconciler = harness.mount().await;
    let before = reconciler.settled(Duration::from_secs(1)).await;
    assert!(before.is_authorized());
    let mut watcher = reconciler.watch();
    watcher.borrow_and_update();
    let lookups = harness.allow_list.lookups().len();

    harness
        .source
        .emit(SessionEvent::token_refreshed(Some(session("a@x.com"))));
    drain().await;

    assert!(!watcher.has_changed().unwrap());
    assert_eq!(reconciler.verdict(), before);
    assert_eq!(harness.allow_list.lookups().len(), lookups);
    reconciler.unmount().await;
}

#[tokio::test]
async fn sign_out_event_denies_and_empties_cache() {
    let harness = Harness::new();
    harness.source.set_session(Some(session("a@x.com")));
    harness.allow_list.insert(AllowListEntry::active("a@x.com"));

    let reconciler = harness.mount().await;
    assert!(reconciler
        .settled(Duration::from_secs(1))
        .await
        .is_authorized());
    assert!(harness.cache.current().is_some());

    harness.source.emit(SessionEvent::signed_out());
    drain().await;

    assert_eq!(reconciler.verdict(), Verdict::Unauthorized);
    assert!(harness.cache.current().is_none());
    reconciler.unmount().await;
}

#[tokio::test(start_paused = true)]
async fn run_resolving_after_unmount_mutates_nothing() {
    let harness = Harness::new();
    harness.source.set_session(Some(session("a@x.com")));
    harness.allow_list.insert(AllowListEntry::active("a@x.com"));
    harness
        .allow_list
        .delay_for("a@x.com", Duration::from_secs(1));

    let reconciler = harness.mount().await;
    assert_eq!(harness.source.subscriber_count(), 1);
    drain().await;
    reconciler.unmount().await;

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(reconciler.verdict(), Verdict::Pending);
    assert_eq!(harness.cache.write_count(), 0);
    assert!(harness.allow_list.logins().is_empty());
    assert_eq!(harness.source.subscriber_count(), 0);

    // Events after unmount go nowhere
    assert_eq!(harness.source.emit(SessionEvent::signed_out()), 0);
    assert_eq!(harness.cache.clear_count(), 0);
}

#[tokio::test]
async fn missed_events_trigger_full_reverification() {
    let harness = Harness::new();
    harness.source.set_session(Some(session("a@x.com")));
    harness.allow_list.insert(AllowListEntry::active("a@x.com"));

    let reconciler = harness.mount().await;
    // Overflow the subscription before the listener gets to run
    for _ in 0..40 {
        harness
            .source
            .emit(SessionEvent::signed_in(session("a@x.com")));
    }

    let verdict = reconciler.settled(Duration::from_secs(1)).await;
    drain().await;

    // Initial check plus the catch-up check after the gap
    assert_eq!(harness.source.lookup_count(), 2);
    assert_eq!(
        verdict.identity().map(|i| i.email.as_str()),
        Some("a@x.com")
    );
    reconciler.unmount().await;
}
