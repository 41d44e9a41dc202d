// Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use showdown_host::agent::identity::{AgentKind, AgentProfile, Roster, Secret};
use showdown_host::agent::LifecycleController;
use showdown_host::client::mock::MockBattleClient;
use showdown_host::config::LifecycleConfig;
use showdown_host::presentation::{PresentationSink, RenderInstruction, Snapshot};
use tokio::sync::broadcast;

pub const FORMAT: &str = "gen9randombattle";

/// Short timeouts, with backoffs long enough to observe in paused time.
pub fn fast_config() -> LifecycleConfig {
    LifecycleConfig {
        battle_format: FORMAT.to_string(),
        poll_interval: Duration::from_millis(20),
        activation_timeout: Duration::from_millis(500),
        accept_cancel_timeout: Duration::from_millis(100),
        teardown_timeout: Duration::from_millis(100),
        query_timeout: Duration::from_millis(100),
        activation_backoff: Duration::from_secs(10),
        idle_retry_delay: Duration::from_secs(5),
        max_query_failures: 3,
        shutdown_grace: Duration::from_millis(500),
        ..LifecycleConfig::default()
    }
}

/// One profile named exactly "A" with a credential.
pub fn roster_a() -> Roster {
    Roster::new(vec![
        AgentProfile::new("A", AgentKind::Random).with_credential(Secret::new("cred1"))
    ])
}

pub fn controller_with(
    client: &Arc<MockBattleClient>,
    roster: Roster,
) -> (LifecycleController, PresentationSink) {
    let sink = PresentationSink::new();
    let ctrl = LifecycleController::with_seed(client.clone(), roster, fast_config(), sink.clone(), 7);
    (ctrl, sink)
}

pub fn controller(client: &Arc<MockBattleClient>) -> (LifecycleController, PresentationSink) {
    controller_with(client, roster_a())
}

/// Wait until the mock has seen `n` accept tasks start.
pub async fn wait_for_accepts(client: &MockBattleClient, n: usize) {
    while client.accepts_started() < n {
        tokio::task::yield_now().await;
    }
}

/// Everything rendered since the last drain.
pub fn drain(rx: &mut broadcast::Receiver<Snapshot>) -> Vec<RenderInstruction> {
    let mut out = Vec::new();
    while let Ok(snapshot) = rx.try_recv() {
        out.push(snapshot.instruction);
    }
    out
}

pub fn is_error(instruction: &RenderInstruction) -> bool {
    matches!(instruction, RenderInstruction::Error { .. })
}
