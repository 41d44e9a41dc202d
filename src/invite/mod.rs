// Background "invite" flow: a temporary agent logs in, challenges a named user,
// stays around until that battle ends, then disconnects.

pub mod pool;
pub mod queue;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::agent::identity::Roster;
use crate::agent::watcher::{BattleWatcher, MatchProgress};
use crate::client::{BattleClient, ConnectionHandle, SharedClient};
use crate::config::{InviteConfig, LifecycleConfig};
use crate::error::{ClientError, InviteError};
use crate::metrics;
use crate::rate_limit::RateLimiter;

pub use pool::InvitePool;
pub use queue::{InviteQueue, InviteRequest};

/// How often the dispatcher looks for queued invites.
const DISPATCH_INTERVAL: Duration = Duration::from_millis(500);

/// How a single invite ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InviteOutcome {
    /// The challenged user played the battle to the end.
    Completed,
    /// No battle started within the pickup timeout.
    NotPickedUp,
    /// The battle was still running when the match timeout elapsed.
    TimedOut,
    /// The battle vanished before it was seen finishing.
    Lost,
    /// Login failed or the challenge was refused; nothing reached the target.
    NotSent,
    /// The challenge may have gone out, but sending it timed out.
    Failed,
    /// The host shut down while the invite was running.
    Interrupted,
}

impl InviteOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::NotPickedUp => "not_picked_up",
            Self::TimedOut => "timed_out",
            Self::Lost => "lost",
            Self::NotSent => "not_sent",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        }
    }
}

/// Timeouts applied to every external call an invite task makes.
#[derive(Debug, Clone)]
pub struct InviteTimings {
    pub connect_timeout: Duration,
    pub challenge_timeout: Duration,
    pub query_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub poll_interval: Duration,
    pub pickup_timeout: Duration,
    pub match_timeout: Duration,
}

impl InviteTimings {
    pub fn from_config(invite: &InviteConfig, lifecycle: &LifecycleConfig) -> Self {
        Self {
            connect_timeout: lifecycle.activation_timeout,
            challenge_timeout: lifecycle.activation_timeout,
            query_timeout: lifecycle.query_timeout,
            disconnect_timeout: lifecycle.teardown_timeout,
            poll_interval: lifecycle.poll_interval,
            pickup_timeout: invite.pickup_timeout,
            match_timeout: invite.match_timeout,
        }
    }
}

/// Queue depth and running invite tasks.
#[derive(Debug, Clone, Serialize)]
pub struct InviteStatus {
    pub queued: usize,
    pub active: usize,
    pub capacity: usize,
}

/// Validates invite requests and queues them for the background worker.
#[derive(Clone)]
pub struct InviteService {
    roster: Roster,
    format: String,
    queue: InviteQueue,
    limiter: RateLimiter,
    pool: InvitePool,
    stop: Arc<watch::Sender<bool>>,
}

impl InviteService {
    pub fn new(roster: Roster, format: impl Into<String>, config: &InviteConfig) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            roster,
            format: format.into(),
            queue: InviteQueue::new(),
            limiter: RateLimiter::per_hour(config.limit_per_hour),
            pool: InvitePool::new(config.workers.max(1)),
            stop: Arc::new(stop),
        }
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn queue(&self) -> &InviteQueue {
        &self.queue
    }

    pub fn pool(&self) -> &InvitePool {
        &self.pool
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn is_stopping(&self) -> bool {
        *self.stop.borrow()
    }

    /// Stop dispatching, interrupt running invites and wait up to `grace` for them
    /// to disconnect. Returns false if some were still running when `grace` elapsed.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.stop.send_replace(true);
        let active = self.pool.active_count();
        if active > 0 {
            tracing::info!(active, "Waiting for running invites to disconnect");
        }
        match tokio::time::timeout(grace, self.pool.wait_idle()).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    active = self.pool.active_count(),
                    grace_ms = grace.as_millis() as u64,
                    "Invites still running after the shutdown grace period"
                );
                false
            }
        }
    }

    pub fn status(&self) -> InviteStatus {
        InviteStatus {
            queued: self.queue.depth(),
            active: self.pool.active_count(),
            capacity: self.pool.capacity(),
        }
    }

    /// Validate and queue an invite from `agent` (profile name or label) to `username`.
    ///
    /// Returns the acknowledgement shown to the user right away; the challenge itself
    /// is sent later by the worker.
    pub fn submit(&self, agent: &str, username: &str) -> Result<String, InviteError> {
        let request = self.validate(agent, username).inspect_err(|e| {
            metrics::INVITES_TOTAL.with_label_values(&["rejected"]).inc();
            tracing::info!(%agent, %username, "Invite rejected: {e}");
        })?;

        let ack = format!(
            "Invite process for '{}' started in background.",
            request.target
        );
        tracing::info!(
            invite = %request.id,
            agent = %request.profile.base_name,
            target = %request.target,
            format = %request.format,
            "Invite queued"
        );
        metrics::INVITES_TOTAL.with_label_values(&["queued"]).inc();
        self.queue.enqueue(request);
        Ok(ack)
    }

    fn validate(&self, agent: &str, username: &str) -> Result<InviteRequest, InviteError> {
        let target = username.trim();
        if target.is_empty() {
            return Err(InviteError::MissingUsername);
        }
        let agent = agent.trim();
        if agent.is_empty() {
            return Err(InviteError::MissingAgent);
        }
        let profile = self
            .roster
            .find(agent)
            .ok_or_else(|| InviteError::UnknownAgent(agent.to_string()))?;
        if !profile.is_available() {
            return Err(InviteError::Unavailable {
                agent: profile.kind.label().to_string(),
                env_var: profile.requires_env.clone().unwrap_or_default(),
            });
        }
        self.limiter.check_limit(target)?;
        Ok(InviteRequest::new(profile.clone(), target, &self.format))
    }

    /// Move queued invites onto the pool until it is full. Returns how many started.
    pub fn dispatch_pending(&self, client: &SharedClient, timings: &InviteTimings) -> usize {
        let mut started = 0;
        while self.pool.has_capacity() && !self.is_stopping() {
            let Some(request) = self.queue.dequeue() else {
                break;
            };
            let task_request = request.clone();
            let client = client.clone();
            let timings = timings.clone();
            let limiter = self.limiter.clone();
            let stop = self.stop.subscribe();
            let spawned = self.pool.spawn(async move {
                let outcome = run_invite(&client, &task_request, &timings, stop).await;
                if outcome == InviteOutcome::NotSent {
                    limiter.release(&task_request.target);
                }
                metrics::INVITES_TOTAL
                    .with_label_values(&[outcome.as_str()])
                    .inc();
                tracing::info!(
                    invite = %task_request.id,
                    target = %task_request.target,
                    outcome = outcome.as_str(),
                    "Invite finished"
                );
            });
            if !spawned {
                self.queue.requeue_front(request);
                break;
            }
            started += 1;
        }
        started
    }
}

/// Spawn the background task that feeds queued invites to the pool.
pub fn spawn_invite_worker(
    service: InviteService,
    client: SharedClient,
    timings: InviteTimings,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(DISPATCH_INTERVAL) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }

            service.limiter.prune();
            let started = service.dispatch_pending(&client, &timings);
            if started > 0 {
                tracing::debug!(started, queued = service.queue.depth(), "Dispatched invites");
            }
        }
        tracing::info!(
            queued = service.queue.depth(),
            active = service.pool.active_count(),
            "Invite worker stopped"
        );
    })
}

/// Log in a fresh agent, challenge the target, watch the resulting battle, then disconnect.
///
/// Watching ends early once `stop` turns true; the agent still disconnects.
pub async fn run_invite(
    client: &SharedClient,
    request: &InviteRequest,
    timings: &InviteTimings,
    stop: watch::Receiver<bool>,
) -> InviteOutcome {
    let identity = request.profile.identity();
    let agent = identity.name().to_string();

    let conn = match tokio::time::timeout(
        timings.connect_timeout,
        client.connect_and_login(&identity),
    )
    .await
    {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => {
            tracing::warn!(invite = %request.id, %agent, "Invite agent could not log in: {e}");
            return InviteOutcome::NotSent;
        }
        Err(_) => {
            tracing::warn!(invite = %request.id, %agent, "Invite agent login timed out");
            return InviteOutcome::NotSent;
        }
    };
    tracing::info!(
        invite = %request.id,
        %agent,
        target = %request.target,
        "Agent created, proceeding to challenge"
    );

    let outcome = match tokio::time::timeout(
        timings.challenge_timeout,
        client.send_challenge(&conn, &request.target, &request.format),
    )
    .await
    {
        Ok(Ok(())) => watch_invite(client.as_ref(), &conn, request, timings, stop).await,
        Ok(Err(e)) => {
            tracing::warn!(
                invite = %request.id,
                "Failed to send challenge from {agent} to {}: {e}",
                request.target
            );
            InviteOutcome::NotSent
        }
        Err(_) => {
            tracing::warn!(invite = %request.id, %agent, "Sending the challenge timed out");
            InviteOutcome::Failed
        }
    };

    match tokio::time::timeout(timings.disconnect_timeout, client.disconnect(&conn)).await {
        Ok(Ok(())) | Ok(Err(ClientError::Disconnected)) => {}
        Ok(Err(e)) => tracing::warn!(invite = %request.id, %agent, "Invite disconnect failed: {e}"),
        Err(_) => tracing::warn!(invite = %request.id, %agent, "Invite disconnect timed out"),
    }
    outcome
}

async fn watch_invite(
    client: &dyn BattleClient,
    conn: &ConnectionHandle,
    request: &InviteRequest,
    timings: &InviteTimings,
    mut stop: watch::Receiver<bool>,
) -> InviteOutcome {
    let mut watcher = BattleWatcher::new(timings.query_timeout);
    let started = Instant::now();
    let mut tracked = None;

    loop {
        if started.elapsed() >= timings.match_timeout {
            return InviteOutcome::TimedOut;
        }

        match tracked.clone() {
            None => {
                if started.elapsed() >= timings.pickup_timeout {
                    return InviteOutcome::NotPickedUp;
                }
                match watcher.poll_connection(client, conn).await {
                    Ok(Some(found)) => {
                        tracing::info!(
                            invite = %request.id,
                            tag = found.tag(),
                            target = %request.target,
                            "Invite battle started"
                        );
                        tracked = Some(found);
                    }
                    Ok(None) => {}
                    Err(e) => tracing::debug!(invite = %request.id, "Invite poll failed: {e}"),
                }
            }
            Some(found) => match watcher.observe_connection(client, conn, &found).await {
                Ok(obs) => match obs.progress {
                    MatchProgress::Ongoing => {}
                    MatchProgress::Finished => return InviteOutcome::Completed,
                    MatchProgress::Lost => return InviteOutcome::Lost,
                },
                Err(e) => tracing::debug!(invite = %request.id, "Invite status query failed: {e}"),
            },
        }

        tokio::select! {
            _ = tokio::time::sleep(timings.poll_interval) => {}
            _ = stop_requested(&mut stop) => {
                tracing::info!(invite = %request.id, "Invite interrupted by shutdown");
                return InviteOutcome::Interrupted;
            }
        }
    }
}

/// Resolves once `stop` turns true. A dropped sender never stops the invite.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::identity::{AgentKind, AgentProfile};
    use crate::client::mock::MockBattleClient;
    use std::sync::Arc;

    fn service(limit: usize) -> InviteService {
        let roster = Roster::new(vec![
            AgentProfile::new("RandAgent", AgentKind::Random).with_unique_suffix(),
            AgentProfile::new("OpenAIAgent", AgentKind::Llm)
                .requiring_env("SHOWDOWN_HOST_TEST_UNSET_KEY_2"),
        ]);
        let config = InviteConfig {
            limit_per_hour: limit,
            ..InviteConfig::default()
        };
        InviteService::new(roster, "gen9randombattle", &config)
    }

    fn timings() -> InviteTimings {
        InviteTimings {
            connect_timeout: Duration::from_secs(1),
            challenge_timeout: Duration::from_secs(1),
            query_timeout: Duration::from_secs(1),
            disconnect_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
            pickup_timeout: Duration::from_secs(5),
            match_timeout: Duration::from_secs(30),
        }
    }

    fn no_stop() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[test]
    fn test_submit_trims_and_acknowledges() {
        let svc = service(10);
        let ack = svc.submit("Random Player", "  ash  ").unwrap();
        assert_eq!(ack, "Invite process for 'ash' started in background.");
        assert_eq!(svc.queue().peek().unwrap().target, "ash");
    }

    #[test]
    fn test_submit_validation_order() {
        let svc = service(10);
        assert_eq!(svc.submit("", " "), Err(InviteError::MissingUsername));
        assert_eq!(svc.submit(" ", "ash"), Err(InviteError::MissingAgent));
        assert_eq!(
            svc.submit("Psychic", "ash"),
            Err(InviteError::UnknownAgent("Psychic".into()))
        );
        let err = svc.submit("OpenAI Agent", "ash").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot create OpenAI Agent. SHOWDOWN_HOST_TEST_UNSET_KEY_2 environment variable is missing."
        );
        assert!(svc.queue().is_empty());
    }

    #[test]
    fn test_submit_rate_limited_per_target() {
        let svc = service(2);
        svc.submit("RandAgent", "ash").unwrap();
        svc.submit("RandAgent", "ash").unwrap();
        assert!(matches!(
            svc.submit("RandAgent", "ash"),
            Err(InviteError::RateLimited(_))
        ));
        assert!(svc.submit("RandAgent", "misty").is_ok());
        assert_eq!(svc.status().queued, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_invite_completes_and_disconnects() {
        let mock = Arc::new(MockBattleClient::new());
        mock.start_battle_on_challenge(Some("battle-77"));
        let client: SharedClient = mock.clone();
        let request = InviteRequest::new(
            AgentProfile::new("Inviter", AgentKind::Random),
            "ash",
            "gen9randombattle",
        );

        let handle = tokio::spawn({
            let client = client.clone();
            let request = request.clone();
            async move { run_invite(&client, &request, &timings(), no_stop()).await }
        });
        tokio::time::sleep(Duration::from_millis(250)).await;
        mock.set_match("Inviter", "battle-77", true);

        assert_eq!(handle.await.unwrap(), InviteOutcome::Completed);
        assert_eq!(mock.challenges().len(), 1);
        assert_eq!(mock.challenges()[0].target, "ash");
        assert_eq!(mock.live_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_invite_not_picked_up() {
        let mock = Arc::new(MockBattleClient::new());
        let client: SharedClient = mock.clone();
        let request = InviteRequest::new(
            AgentProfile::new("Inviter", AgentKind::Random),
            "ash",
            "gen9randombattle",
        );
        let outcome = run_invite(&client, &request, &timings(), no_stop()).await;
        assert_eq!(outcome, InviteOutcome::NotPickedUp);
        assert_eq!(mock.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_run_invite_challenge_failure() {
        let mock = Arc::new(MockBattleClient::new());
        mock.fail_challenges(Some(ClientError::ChallengeFailed {
            target: "ash".into(),
            reason: "user not found".into(),
        }));
        let client: SharedClient = mock.clone();
        let request = InviteRequest::new(
            AgentProfile::new("Inviter", AgentKind::Random),
            "ash",
            "gen9randombattle",
        );
        assert_eq!(
            run_invite(&client, &request, &timings(), no_stop()).await,
            InviteOutcome::NotSent
        );
        assert_eq!(mock.live_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_invite_stops_watching_on_shutdown() {
        let mock = Arc::new(MockBattleClient::new());
        mock.start_battle_on_challenge(Some("battle-12"));
        let client: SharedClient = mock.clone();
        let request = InviteRequest::new(
            AgentProfile::new("Inviter", AgentKind::Random),
            "ash",
            "gen9randombattle",
        );
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn({
            let client = client.clone();
            async move { run_invite(&client, &request, &timings(), stop_rx).await }
        });
        while mock.challenges().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stop_tx.send_replace(true);

        assert_eq!(handle.await.unwrap(), InviteOutcome::Interrupted);
        assert_eq!(mock.live_connections(), 0);
    }

    #[test]
    fn test_outcome_names() {
        assert_eq!(InviteOutcome::NotPickedUp.as_str(), "not_picked_up");
        assert_eq!(InviteOutcome::NotSent.as_str(), "not_sent");
        assert_eq!(
            serde_json::to_value(InviteOutcome::TimedOut).unwrap(),
            "timed_out"
        );
    }
}
