// In-process stand-in for the battle server.
//
// Logs agents in as guests, has a simulated opponent challenge them after a random
// delay, and plays each battle out on a timer. Battles run as tokio tasks; each one
// owns a `running` flag the connection clears when it goes away.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use uuid::Uuid;

use super::{BattleClient, ConnectionHandle, KnownMatches, MatchStatus};
use crate::agent::identity::AgentIdentity;
use crate::error::ClientError;

/// Timing knobs for the simulation.
#[derive(Debug, Clone)]
pub struct SimulationParams {
    pub login_latency: Duration,
    /// Seconds before a simulated opponent challenges a waiting agent.
    pub challenge_delay_secs: Range<u64>,
    /// Number of turns a battle lasts.
    pub turns: Range<u32>,
    pub turn_interval: Duration,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            login_latency: Duration::from_millis(200),
            challenge_delay_secs: 5..20,
            turns: 8..30,
            turn_interval: Duration::from_secs(2),
        }
    }
}

struct SimConnection {
    username: String,
    battles: KnownMatches,
    running: Arc<AtomicBool>,
}

type Connections = Arc<Mutex<HashMap<Uuid, SimConnection>>>;

fn lock(connections: &Connections) -> MutexGuard<'_, HashMap<Uuid, SimConnection>> {
    connections.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Starts battles on connections and plays them out in the background.
#[derive(Clone)]
struct BattleRunner {
    connections: Connections,
    next_battle: Arc<AtomicU64>,
    turns: Range<u32>,
    turn_interval: Duration,
}

impl BattleRunner {
    /// Register a new battle on the connection and spawn the task that finishes it.
    fn start(&self, conn_id: Uuid, format: &str) -> Result<String, ClientError> {
        let tag = format!(
            "battle-{}-{}",
            format,
            self.next_battle.fetch_add(1, Ordering::Relaxed)
        );
        let running = {
            let mut conns = lock(&self.connections);
            let entry = conns.get_mut(&conn_id).ok_or(ClientError::Disconnected)?;
            entry
                .battles
                .insert(tag.clone(), MatchStatus { finished: false });
            entry.running.clone()
        };

        let turns = if self.turns.is_empty() {
            1
        } else {
            rand::thread_rng().gen_range(self.turns.clone())
        };
        let turn_interval = self.turn_interval;
        let connections = self.connections.clone();
        let battle_tag = tag.clone();

        tokio::spawn(async move {
            for _ in 0..turns {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                tokio::time::sleep(turn_interval).await;
            }
            if let Some(entry) = lock(&connections).get_mut(&conn_id) {
                entry
                    .battles
                    .insert(battle_tag.clone(), MatchStatus { finished: true });
            }
            tracing::debug!(tag = %battle_tag, turns, "Simulated battle finished");
        });

        Ok(tag)
    }
}

/// A [`BattleClient`] that simulates the remote server in memory.
pub struct SimulatedClient {
    connections: Connections,
    runner: BattleRunner,
    params: SimulationParams,
}

impl SimulatedClient {
    pub fn new(params: SimulationParams) -> Self {
        let connections: Connections = Arc::new(Mutex::new(HashMap::new()));
        let runner = BattleRunner {
            connections: connections.clone(),
            next_battle: Arc::new(AtomicU64::new(1)),
            turns: params.turns.clone(),
            turn_interval: params.turn_interval,
        };
        Self {
            connections,
            runner,
            params,
        }
    }

    fn challenge_delay(&self) -> Duration {
        let range = self.params.challenge_delay_secs.clone();
        if range.is_empty() {
            return Duration::ZERO;
        }
        Duration::from_secs(rand::thread_rng().gen_range(range))
    }

    fn is_connected(&self, conn: &ConnectionHandle) -> bool {
        lock(&self.connections).contains_key(&conn.id())
    }
}

impl Default for SimulatedClient {
    fn default() -> Self {
        Self::new(SimulationParams::default())
    }
}

#[async_trait]
impl BattleClient for SimulatedClient {
    async fn connect_and_login(
        &self,
        identity: &AgentIdentity,
    ) -> Result<ConnectionHandle, ClientError> {
        tokio::time::sleep(self.params.login_latency).await;

        if let Some(secret) = identity.credential() {
            if secret.expose().is_empty() {
                return Err(ClientError::LoginRejected {
                    username: identity.name().to_string(),
                    reason: "empty password".to_string(),
                });
            }
        }

        let mut conns = lock(&self.connections);
        if conns.values().any(|c| c.username == identity.name()) {
            return Err(ClientError::LoginRejected {
                username: identity.name().to_string(),
                reason: "name already in use".to_string(),
            });
        }
        let handle = ConnectionHandle::new(identity.name());
        conns.insert(
            handle.id(),
            SimConnection {
                username: identity.name().to_string(),
                battles: KnownMatches::new(),
                running: Arc::new(AtomicBool::new(true)),
            },
        );
        tracing::debug!(username = identity.name(), "Simulated login");
        Ok(handle)
    }

    async fn accept_one_challenge(
        &self,
        conn: &ConnectionHandle,
        format: &str,
    ) -> Result<(), ClientError> {
        let delay = self.challenge_delay();
        tokio::time::sleep(delay).await;
        if !self.is_connected(conn) {
            return Err(ClientError::Disconnected);
        }
        let tag = self.runner.start(conn.id(), format)?;
        tracing::info!(username = conn.username(), %tag, "Simulated opponent challenge accepted");
        Ok(())
    }

    async fn known_matches(&self, conn: &ConnectionHandle) -> Result<KnownMatches, ClientError> {
        lock(&self.connections)
            .get(&conn.id())
            .map(|c| c.battles.clone())
            .ok_or(ClientError::Disconnected)
    }

    async fn disconnect(&self, conn: &ConnectionHandle) -> Result<(), ClientError> {
        if let Some(entry) = lock(&self.connections).remove(&conn.id()) {
            entry.running.store(false, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn send_challenge(
        &self,
        conn: &ConnectionHandle,
        target: &str,
        format: &str,
    ) -> Result<(), ClientError> {
        if target.trim().is_empty() {
            return Err(ClientError::ChallengeFailed {
                target: target.to_string(),
                reason: "empty username".to_string(),
            });
        }
        if !self.is_connected(conn) {
            return Err(ClientError::Disconnected);
        }

        // The target "accepts" after the usual delay.
        let delay = self.challenge_delay();
        let runner = self.runner.clone();
        let conn_id = conn.id();
        let from = conn.username().to_string();
        let opponent = target.to_string();
        let format = format.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match runner.start(conn_id, &format) {
                Ok(tag) => tracing::info!(%from, %opponent, %tag, "Simulated challenge accepted"),
                Err(e) => tracing::debug!(%from, %opponent, "Challenge lapsed: {e}"),
            }
        });
        Ok(())
    }
}
