// The sequential single-agent lifecycle: activate an agent, wait for a challenge,
// watch the battle, retire the agent, repeat.
//
// One controller owns at most one `AgentSession` at a time. Each cycle evaluates the
// current state once and makes at most one transition. Errors never leave a cycle;
// they are logged and turned into a transition or a no-op.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::agent::identity::Roster;
use crate::agent::session::{AcceptStatus, AgentSession};
use crate::agent::watcher::{BattleWatcher, MatchProgress, MatchRef};
use crate::client::SharedClient;
use crate::config::LifecycleConfig;
use crate::error::LifecycleError;
use crate::metrics;
use crate::presentation::{PresentationSink, RenderInstruction};

/// Where the controller is in the agent lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// No session.
    Idle,
    /// Session active, no match yet.
    AwaitingChallenge,
    /// Session active and tracking an unfinished match.
    InMatch,
    /// Match over or session failed; teardown pending.
    Draining,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingChallenge => "awaiting_challenge",
            Self::InMatch => "in_match",
            Self::Draining => "draining",
        }
    }

    fn gauge_value(&self) -> i64 {
        match self {
            Self::Idle => 0,
            Self::AwaitingChallenge => 1,
            Self::InMatch => 2,
            Self::Draining => 3,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn selecting_message(agent: &str) -> String {
    format!("Selecting agent {agent}...")
}

fn ready_message(agent: &str, format: &str) -> String {
    format!("{agent} is ready! Challenge {agent} to a {format} battle.")
}

const NO_AGENTS_MESSAGE: &str =
    "No battle agents are available. Check that agent credentials are configured.";
const FINISHED_MESSAGE: &str = "Battle finished. Cleaning up...";
const NEXT_AGENT_MESSAGE: &str = "Ready for the next agent.";

/// Floor for the cycle interval; `tokio::time::interval` rejects a zero period.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Drives repeated cycles of {activate agent -> wait for challenge -> watch battle -> retire agent}.
pub struct LifecycleController {
    client: SharedClient,
    roster: Roster,
    config: LifecycleConfig,
    sink: PresentationSink,
    watcher: BattleWatcher,
    state: LifecycleState,
    session: Option<AgentSession>,
    tracked: Option<MatchRef>,
    /// No activation is attempted before this instant.
    retry_at: Option<Instant>,
    /// Error shown to users while waiting out `retry_at`.
    backoff_message: Option<String>,
    query_failures: u32,
    strays_reported: HashSet<String>,
    rng: StdRng,
    state_tx: watch::Sender<LifecycleState>,
}

impl LifecycleController {
    pub fn new(
        client: SharedClient,
        roster: Roster,
        config: LifecycleConfig,
        sink: PresentationSink,
    ) -> Self {
        Self::with_rng(client, roster, config, sink, StdRng::from_entropy())
    }

    /// Same as [`LifecycleController::new`] with a deterministic agent selection order.
    pub fn with_seed(
        client: SharedClient,
        roster: Roster,
        config: LifecycleConfig,
        sink: PresentationSink,
        seed: u64,
    ) -> Self {
        Self::with_rng(client, roster, config, sink, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        client: SharedClient,
        roster: Roster,
        config: LifecycleConfig,
        sink: PresentationSink,
        rng: StdRng,
    ) -> Self {
        let (state_tx, _) = watch::channel(LifecycleState::Idle);
        let watcher = BattleWatcher::new(config.query_timeout);
        Self {
            client,
            roster,
            config,
            sink,
            watcher,
            state: LifecycleState::Idle,
            session: None,
            tracked: None,
            retry_at: None,
            backoff_message: None,
            query_failures: 0,
            strays_reported: HashSet::new(),
            rng,
            state_tx,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn session(&self) -> Option<&AgentSession> {
        self.session.as_ref()
    }

    pub fn tracked_match(&self) -> Option<&MatchRef> {
        self.tracked.as_ref()
    }

    pub fn sink(&self) -> &PresentationSink {
        &self.sink
    }

    /// Follow state changes from outside the controller task.
    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    /// Re-read the tracked match while in a match. Never switches to a different tag.
    pub async fn confirm_match(&self) -> Result<Option<MatchRef>, LifecycleError> {
        let (Some(session), Some(tracked)) = (self.session.as_ref(), self.tracked.as_ref()) else {
            return Ok(None);
        };
        let known = self.watcher.poll(session).await?;
        if let Some(other) = known.filter(|m| m.tag() != tracked.tag()) {
            tracing::debug!(tracked = tracked.tag(), other = other.tag(), "Ignoring untracked match");
        }
        Ok(Some(tracked.clone()))
    }

    /// Evaluate the current state once and make at most one transition.
    pub async fn step(&mut self) -> LifecycleState {
        let next = match self.state {
            LifecycleState::Idle => self.step_idle().await,
            LifecycleState::AwaitingChallenge => self.step_awaiting().await,
            LifecycleState::InMatch => self.step_in_match().await,
            LifecycleState::Draining => self.step_draining().await,
        };
        self.set_state(next);
        next
    }

    /// One loop iteration. A panic inside the step is contained here.
    pub async fn cycle(&mut self) -> LifecycleState {
        match AssertUnwindSafe(self.step()).catch_unwind().await {
            Ok(state) => state,
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                let err = LifecycleError::InvariantViolation(format!(
                    "lifecycle step panicked in state {}: {detail}",
                    self.state
                ));
                tracing::error!("{err}");
                metrics::INVARIANT_VIOLATIONS_TOTAL.inc();
                let next = if self.session.is_some() {
                    LifecycleState::Draining
                } else {
                    LifecycleState::Idle
                };
                self.set_state(next);
                next
            }
        }
    }

    /// Run cycles at the configured interval until `shutdown` turns true or its sender drops.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval.max(MIN_POLL_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            format = %self.config.battle_format,
            interval_ms = self.config.poll_interval.as_millis() as u64,
            agents = self.roster.profiles().len(),
            "Lifecycle controller started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.cycle().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Cancel any pending accept and release the active session within the grace period.
    pub async fn shutdown(&mut self) {
        let grace = self.config.shutdown_grace;
        let cancel_timeout = self.config.accept_cancel_timeout;
        let teardown_timeout = self.config.teardown_timeout;

        if let Some(mut session) = self.session.take() {
            let agent = session.name().to_string();
            let retire = async {
                if let Err(e) = session.cancel_accept(cancel_timeout).await {
                    tracing::warn!(%agent, "Accept cancellation during shutdown: {e}");
                }
                session.teardown(teardown_timeout).await
            };
            match tokio::time::timeout(grace, retire).await {
                Ok(Ok(())) => tracing::info!(%agent, "Agent released on shutdown"),
                Ok(Err(e)) => {
                    metrics::TEARDOWN_FAILURES_TOTAL.inc();
                    tracing::warn!(%agent, "Teardown during shutdown failed: {e}");
                }
                Err(_) => {
                    metrics::TEARDOWN_FAILURES_TOTAL.inc();
                    tracing::warn!(
                        %agent,
                        grace_ms = grace.as_millis() as u64,
                        "Shutdown grace period elapsed before the agent was released"
                    );
                }
            }
        }

        metrics::ACTIVE_SESSIONS.set(0);
        self.tracked = None;
        self.set_state(LifecycleState::Idle);
        self.sink.render(RenderInstruction::idle("Agent host stopped."));
        tracing::info!("Lifecycle controller stopped");
    }

    /// Move the controller onto its own task.
    pub fn start(self) -> ControllerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state_rx = self.subscribe_state();
        let mut controller = self;
        let task = tokio::spawn(async move {
            controller.run(shutdown_rx).await;
        });
        ControllerHandle {
            shutdown_tx,
            state_rx,
            task,
        }
    }

    fn set_state(&mut self, next: LifecycleState) {
        if next != self.state {
            tracing::debug!(from = %self.state, to = %next, "Lifecycle transition");
        }
        self.state = next;
        metrics::LIFECYCLE_STATE.set(next.gauge_value());
        self.state_tx.send_replace(next);
    }

    async fn step_idle(&mut self) -> LifecycleState {
        if self.session.is_some() {
            let err = LifecycleError::InvariantViolation(
                "idle controller still holds a session".to_string(),
            );
            tracing::error!("{err}");
            metrics::INVARIANT_VIOLATIONS_TOTAL.inc();
            return LifecycleState::Draining;
        }

        if let Some(at) = self.retry_at {
            if Instant::now() < at {
                if let Some(message) = &self.backoff_message {
                    self.sink.render(RenderInstruction::error(message.clone()));
                }
                return LifecycleState::Idle;
            }
            self.retry_at = None;
        }

        let Some(identity) = self.roster.choose(&mut self.rng).map(|p| p.identity()) else {
            tracing::warn!("No agent identity has its credentials available");
            metrics::ACTIVATIONS_TOTAL
                .with_label_values(&["unavailable"])
                .inc();
            self.sink.render(RenderInstruction::error(NO_AGENTS_MESSAGE));
            self.retry_at = Some(Instant::now() + self.config.idle_retry_delay);
            self.backoff_message = Some(NO_AGENTS_MESSAGE.to_string());
            return LifecycleState::Idle;
        };

        let agent = identity.name().to_string();
        self.sink.render(RenderInstruction::idle(selecting_message(&agent)));

        match AgentSession::activate(
            self.client.clone(),
            identity,
            &self.config.battle_format,
            self.config.activation_timeout,
        )
        .await
        {
            Ok(session) => {
                tracing::info!(
                    %agent,
                    guest = session.identity().is_guest(),
                    format = %self.config.battle_format,
                    "Agent activated, awaiting challenge"
                );
                metrics::ACTIVATIONS_TOTAL.with_label_values(&["ok"]).inc();
                metrics::ACTIVE_SESSIONS.set(1);
                self.session = Some(session);
                self.backoff_message = None;
                self.sink.render(RenderInstruction::idle(ready_message(
                    &agent,
                    &self.config.battle_format,
                )));
                LifecycleState::AwaitingChallenge
            }
            Err(e) => {
                tracing::warn!(
                    %agent,
                    retry_in_ms = self.config.activation_backoff.as_millis() as u64,
                    "{e}"
                );
                metrics::ACTIVATIONS_TOTAL
                    .with_label_values(&["failed"])
                    .inc();
                let message = e.user_message();
                self.sink.render(RenderInstruction::error(message.clone()));
                self.retry_at = Some(Instant::now() + self.config.activation_backoff);
                self.backoff_message = Some(message);
                LifecycleState::Idle
            }
        }
    }

    async fn step_awaiting(&mut self) -> LifecycleState {
        let Some(session) = self.session.as_mut() else {
            tracing::error!("Awaiting a challenge without a session");
            metrics::INVARIANT_VIOLATIONS_TOTAL.inc();
            return LifecycleState::Draining;
        };

        match self.watcher.poll(session).await {
            Ok(Some(found)) => {
                if let Err(e) = session.cancel_accept(self.config.accept_cancel_timeout).await {
                    metrics::ACCEPT_CANCEL_TIMEOUTS_TOTAL.inc();
                    tracing::warn!(agent = session.name(), "Accept cancellation unconfirmed: {e}");
                }
                tracing::info!(agent = session.name(), tag = found.tag(), "Battle started");
                self.sink.render(RenderInstruction::live(
                    &found,
                    &self.config.battle_view_base_url,
                ));
                self.tracked = Some(found);
                return LifecycleState::InMatch;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(agent = session.name(), "Match poll failed: {e}"),
        }

        match session.accept_status() {
            AcceptStatus::Pending => {
                self.sink.render(RenderInstruction::idle(ready_message(
                    session.name(),
                    &self.config.battle_format,
                )));
                LifecycleState::AwaitingChallenge
            }
            AcceptStatus::Accepted => {
                tracing::warn!(
                    agent = session.name(),
                    "Challenge accepted but no battle appeared; retiring agent"
                );
                LifecycleState::Draining
            }
            AcceptStatus::Failed(e) => {
                let err = LifecycleError::AcceptTask(e.to_string());
                tracing::warn!(agent = session.name(), "{err}");
                self.sink.render(RenderInstruction::error(err.user_message()));
                LifecycleState::Draining
            }
            AcceptStatus::Cancelled => {
                tracing::warn!(agent = session.name(), "Accept task ended without a battle");
                LifecycleState::Draining
            }
        }
    }

    async fn step_in_match(&mut self) -> LifecycleState {
        let (Some(session), Some(tracked)) = (self.session.as_ref(), self.tracked.as_mut()) else {
            tracing::error!("In a match without a session or tracked match");
            metrics::INVARIANT_VIOLATIONS_TOTAL.inc();
            return LifecycleState::Draining;
        };

        let observation = match self.watcher.observe(session, tracked).await {
            Ok(obs) => obs,
            Err(e) => {
                self.query_failures += 1;
                tracing::warn!(
                    agent = session.name(),
                    tag = tracked.tag(),
                    failures = self.query_failures,
                    "Match status query failed: {e}"
                );
                if self.query_failures < self.config.max_query_failures {
                    return LifecycleState::InMatch;
                }
                let err = LifecycleError::MatchLost {
                    tag: tracked.tag().to_string(),
                };
                tracing::error!(agent = session.name(), "{err} (status unreadable)");
                metrics::MATCHES_TOTAL.with_label_values(&["lost"]).inc();
                self.sink.render(RenderInstruction::error(err.user_message()));
                return LifecycleState::Draining;
            }
        };
        self.query_failures = 0;

        for stray in observation.strays {
            if self.strays_reported.insert(stray.clone()) {
                let err = LifecycleError::InvariantViolation(format!(
                    "match {stray} observed while tracking {}",
                    tracked.tag()
                ));
                tracing::error!(agent = session.name(), "{err}; keeping the tracked match");
                metrics::INVARIANT_VIOLATIONS_TOTAL.inc();
            }
        }

        match observation.progress {
            MatchProgress::Ongoing => LifecycleState::InMatch,
            MatchProgress::Finished => {
                tracked.mark_finished();
                let secs = tracked.age().as_secs_f64();
                tracing::info!(agent = session.name(), tag = tracked.tag(), secs, "Battle finished");
                metrics::MATCHES_TOTAL.with_label_values(&["finished"]).inc();
                metrics::MATCH_DURATION_SECONDS
                    .with_label_values(&["finished"])
                    .observe(secs);
                self.sink.render(RenderInstruction::idle(FINISHED_MESSAGE));
                LifecycleState::Draining
            }
            MatchProgress::Lost => {
                let err = LifecycleError::MatchLost {
                    tag: tracked.tag().to_string(),
                };
                tracing::error!(agent = session.name(), "{err}");
                metrics::MATCHES_TOTAL.with_label_values(&["lost"]).inc();
                metrics::MATCH_DURATION_SECONDS
                    .with_label_values(&["lost"])
                    .observe(tracked.age().as_secs_f64());
                self.sink.render(RenderInstruction::error(err.user_message()));
                LifecycleState::Draining
            }
        }
    }

    async fn step_draining(&mut self) -> LifecycleState {
        if let Some(mut session) = self.session.take() {
            let agent = session.name().to_string();
            // Cancellation first; a missing acknowledgement does not block teardown.
            if let Err(e) = session.cancel_accept(self.config.accept_cancel_timeout).await {
                metrics::ACCEPT_CANCEL_TIMEOUTS_TOTAL.inc();
                tracing::warn!(%agent, "Accept cancellation unconfirmed, tearing down anyway: {e}");
            }
            match session.teardown(self.config.teardown_timeout).await {
                Ok(()) => tracing::info!(
                    %agent,
                    uptime_secs = session.uptime().as_secs(),
                    "Agent retired"
                ),
                Err(e) => {
                    metrics::TEARDOWN_FAILURES_TOTAL.inc();
                    tracing::warn!(%agent, "{e}");
                }
            }
        }

        metrics::ACTIVE_SESSIONS.set(0);
        self.tracked = None;
        self.query_failures = 0;
        self.strays_reported.clear();
        self.watcher = BattleWatcher::new(self.config.query_timeout);
        self.sink.render(RenderInstruction::idle(NEXT_AGENT_MESSAGE));
        LifecycleState::Idle
    }
}

/// A controller running on its own task.
pub struct ControllerHandle {
    shutdown_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<LifecycleState>,
    task: JoinHandle<()>,
}

impl ControllerHandle {
    pub fn state(&self) -> LifecycleState {
        *self.state_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state_rx.clone()
    }

    /// Signal shutdown and wait for the controller to release its agent.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            tracing::error!("Lifecycle controller task ended abnormally: {e}");
        }
    }
}
