// Invite flow end to end: submit, dispatch onto the pool, challenge, watch, disconnect.

use std::sync::Arc;
use std::time::Duration;

use showdown_host::agent::identity::{AgentKind, AgentProfile, Roster};
use showdown_host::client::mock::MockBattleClient;
use showdown_host::client::SharedClient;
use showdown_host::config::InviteConfig;
use showdown_host::error::{ClientError, InviteError};
use showdown_host::invite::{spawn_invite_worker, InviteService, InviteTimings};
use tokio::sync::watch;

fn roster() -> Roster {
    Roster::new(vec![
        AgentProfile::new("RandAgent", AgentKind::Random).with_unique_suffix()
    ])
}

fn service(workers: usize) -> InviteService {
    let config = InviteConfig {
        workers,
        limit_per_hour: 5,
        ..InviteConfig::default()
    };
    InviteService::new(roster(), "gen9randombattle", &config)
}

fn timings() -> InviteTimings {
    InviteTimings {
        connect_timeout: Duration::from_secs(1),
        challenge_timeout: Duration::from_secs(1),
        query_timeout: Duration::from_secs(1),
        disconnect_timeout: Duration::from_secs(1),
        poll_interval: Duration::from_millis(50),
        pickup_timeout: Duration::from_secs(10),
        match_timeout: Duration::from_secs(60),
    }
}

async fn wait_until_idle(svc: &InviteService) {
    while svc.pool().active_count() > 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_invite_challenges_target_and_cleans_up() {
    let mock = Arc::new(MockBattleClient::new());
    mock.start_battle_on_challenge(Some("battle-gen9randombattle-1"));
    let client: SharedClient = mock.clone();
    let svc = service(2);

    let ack = svc.submit("Random Player", "  Ash Ketchum ").unwrap();
    assert_eq!(ack, "Invite process for 'Ash Ketchum' started in background.");
    assert_eq!(svc.dispatch_pending(&client, &timings()), 1);
    assert_eq!(svc.status().queued, 0);

    while mock.challenges().is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let sent = mock.challenges()[0].clone();
    assert_eq!(sent.target, "Ash Ketchum");
    assert_eq!(sent.format, "gen9randombattle");
    let suffix: u32 = sent.from["RandAgent".len()..].parse().unwrap();
    assert!((10_000..=999_999).contains(&suffix));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(mock.live_connections(), 1);
    mock.set_match(&sent.from, "battle-gen9randombattle-1", true);

    wait_until_idle(&svc).await;
    assert_eq!(mock.live_connections(), 0);
    assert_eq!(mock.disconnect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_respects_pool_capacity() {
    let mock = Arc::new(MockBattleClient::new());
    let client: SharedClient = mock.clone();
    let svc = service(2);

    for user in ["ash", "misty", "brock"] {
        svc.submit("RandAgent", user).unwrap();
    }
    assert_eq!(svc.dispatch_pending(&client, &timings()), 2);
    let status = svc.status();
    assert_eq!(status.queued, 1);
    assert_eq!(status.active, 2);
    assert_eq!(status.capacity, 2);

    // Nobody accepts; the invites lapse after the pickup timeout and free the pool.
    wait_until_idle(&svc).await;
    assert_eq!(svc.dispatch_pending(&client, &timings()), 1);
    wait_until_idle(&svc).await;
    assert_eq!(mock.challenges().len(), 3);
    assert_eq!(mock.live_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_login_releases_slot() {
    let mock = Arc::new(MockBattleClient::new());
    mock.fail_all_connects(Some(ClientError::ConnectFailed("server down".into())));
    let client: SharedClient = mock.clone();
    let svc = service(1);

    svc.submit("RandAgent", "ash").unwrap();
    assert_eq!(svc.dispatch_pending(&client, &timings()), 1);
    wait_until_idle(&svc).await;
    assert!(mock.challenges().is_empty());
    assert!(svc.pool().has_capacity());
    // Nothing reached the target, so the invite does not count against the limit.
    assert_eq!(svc.limiter().current_count("ash"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_disconnects_running_invites() {
    let mock = Arc::new(MockBattleClient::new());
    mock.start_battle_on_challenge(Some("battle-gen9randombattle-2"));
    let client: SharedClient = mock.clone();
    let svc = service(2);

    svc.submit("RandAgent", "ash").unwrap();
    svc.submit("RandAgent", "misty").unwrap();
    assert_eq!(svc.dispatch_pending(&client, &timings()), 2);
    while mock.challenges().len() < 2 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(mock.live_connections(), 2);

    assert!(svc.shutdown(Duration::from_secs(5)).await);
    assert_eq!(svc.pool().active_count(), 0);
    assert_eq!(mock.live_connections(), 0);

    svc.submit("RandAgent", "brock").unwrap();
    assert_eq!(svc.dispatch_pending(&client, &timings()), 0);
}

#[tokio::test(start_paused = true)]
async fn test_worker_forgets_expired_rate_limits() {
    let mock = Arc::new(MockBattleClient::new());
    let client: SharedClient = mock.clone();
    let svc = service(2);
    let (stop_tx, stop_rx) = watch::channel(false);
    let worker = spawn_invite_worker(svc.clone(), client, timings(), stop_rx);

    svc.submit("RandAgent", "ash").unwrap();
    svc.submit("RandAgent", "misty").unwrap();
    assert_eq!(svc.limiter().tracked_targets(), 2);

    tokio::time::sleep(Duration::from_secs(3700)).await;
    assert_eq!(svc.limiter().tracked_targets(), 0);
    assert_eq!(mock.challenges().len(), 2);

    stop_tx.send_replace(true);
    worker.await.unwrap();
}

#[test]
fn test_rate_limit_is_per_target() {
    let svc = service(1);
    for _ in 0..5 {
        svc.submit("RandAgent", "ash").unwrap();
    }
    let err = svc.submit("RandAgent", "ASH").unwrap_err();
    assert!(matches!(err, InviteError::RateLimited(_)));
    assert!(err.to_string().starts_with("Rate limit exceeded: max 5 invites per hour"));
    assert!(svc.submit("RandAgent", "misty").is_ok());
}
