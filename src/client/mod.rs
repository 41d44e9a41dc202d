//! The battle-client boundary.
//!
//! Everything about the battle server (websocket protocol, login handshake, battle
//! state, move selection) lives behind [`BattleClient`]. The lifecycle controller and
//! the invite flow only ever talk to the server through this trait.

pub mod mock;
pub mod simulated;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::agent::identity::AgentIdentity;
use crate::error::ClientError;

/// Opaque reference to one logged-in connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    id: Uuid,
    username: String,
}

impl ConnectionHandle {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.into(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

/// Status of one match as reported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MatchStatus {
    pub finished: bool,
}

/// Matches a connection knows about, keyed by battle tag.
pub type KnownMatches = BTreeMap<String, MatchStatus>;

#[async_trait]
pub trait BattleClient: Send + Sync + 'static {
    /// Connect to the server and log in as `identity`.
    async fn connect_and_login(
        &self,
        identity: &AgentIdentity,
    ) -> Result<ConnectionHandle, ClientError>;

    /// Resolves once exactly one incoming challenge in `format` has been accepted.
    ///
    /// Callers run this as its own task and cancel it by aborting the task; an
    /// implementation must leave the connection usable when the future is dropped.
    async fn accept_one_challenge(
        &self,
        conn: &ConnectionHandle,
        format: &str,
    ) -> Result<(), ClientError>;

    /// Snapshot of the matches this connection knows about.
    async fn known_matches(&self, conn: &ConnectionHandle) -> Result<KnownMatches, ClientError>;

    /// Close the connection. Idempotent.
    async fn disconnect(&self, conn: &ConnectionHandle) -> Result<(), ClientError>;

    /// Challenge `target` to a battle in `format`.
    async fn send_challenge(
        &self,
        conn: &ConnectionHandle,
        target: &str,
        format: &str,
    ) -> Result<(), ClientError>;
}

pub type SharedClient = Arc<dyn BattleClient>;
