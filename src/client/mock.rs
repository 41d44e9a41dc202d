//! Scriptable battle client for deterministic tests.
//!
//! Implements [`BattleClient`] entirely in memory. Tests decide when an accept task
//! completes, which matches a connection sees, and which calls fail, then inspect
//! what the code under test did (logins, disconnects, cancelled accepts, challenges).
//!
//! Matches and accept outcomes are keyed by username, so use profiles without a
//! unique suffix when scripting them.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use uuid::Uuid;

use super::{BattleClient, ConnectionHandle, KnownMatches, MatchStatus};
use crate::agent::identity::AgentIdentity;
use crate::error::ClientError;

/// A challenge recorded by [`MockBattleClient::send_challenge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentChallenge {
    pub from: String,
    pub target: String,
    pub format: String,
}

#[derive(Default)]
struct MockState {
    live: HashMap<Uuid, String>,
    peak_live: usize,
    logins: Vec<String>,
    disconnects: usize,
    connect_failures: VecDeque<ClientError>,
    always_fail_connect: Option<ClientError>,
    disconnect_failure: Option<ClientError>,
    disconnect_delay: Option<Duration>,
    query_failure: Option<ClientError>,
    query_panics: bool,
    matches: HashMap<String, KnownMatches>,
    accept_results: HashMap<String, Result<(), ClientError>>,
    accepts_started: usize,
    accepts_cancelled: usize,
    challenges: Vec<SentChallenge>,
    challenge_failure: Option<ClientError>,
    battle_on_challenge: Option<String>,
}

/// In-memory [`BattleClient`] driven by the test.
#[derive(Default)]
pub struct MockBattleClient {
    state: Mutex<MockState>,
    accept_signal: Notify,
}

impl MockBattleClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Scripting ───────────────────────────────────────────────────

    /// Fail the next `connect_and_login` call with `err`.
    pub fn fail_next_connect(&self, err: ClientError) {
        self.state().connect_failures.push_back(err);
    }

    /// Fail every `connect_and_login` call until cleared with `None`.
    pub fn fail_all_connects(&self, err: Option<ClientError>) {
        self.state().always_fail_connect = err;
    }

    /// Make `disconnect` report `err`. The connection is still dropped.
    pub fn fail_disconnect(&self, err: Option<ClientError>) {
        self.state().disconnect_failure = err;
    }

    /// Make `disconnect` take `delay` before doing anything.
    pub fn delay_disconnect(&self, delay: Option<Duration>) {
        self.state().disconnect_delay = delay;
    }

    pub fn fail_queries(&self, err: Option<ClientError>) {
        self.state().query_failure = err;
    }

    /// Make `known_matches` panic, standing in for a misbehaving client.
    pub fn panic_on_queries(&self, on: bool) {
        self.state().query_panics = on;
    }

    pub fn fail_challenges(&self, err: Option<ClientError>) {
        self.state().challenge_failure = err;
    }

    /// When set, every sent challenge immediately starts an unfinished battle with this tag
    /// on the challenger's connection.
    pub fn start_battle_on_challenge(&self, tag: Option<&str>) {
        self.state().battle_on_challenge = tag.map(str::to_string);
    }

    pub fn set_match(&self, username: &str, tag: &str, finished: bool) {
        self.state()
            .matches
            .entry(username.to_string())
            .or_default()
            .insert(tag.to_string(), MatchStatus { finished });
    }

    pub fn remove_match(&self, username: &str, tag: &str) {
        if let Some(matches) = self.state().matches.get_mut(username) {
            matches.remove(tag);
        }
    }

    /// Resolve the pending (or next) accept task for `username`.
    pub fn complete_accept(&self, username: &str, result: Result<(), ClientError>) {
        self.state()
            .accept_results
            .insert(username.to_string(), result);
        self.accept_signal.notify_waiters();
    }

    // ── Inspection ──────────────────────────────────────────────────

    pub fn live_connections(&self) -> usize {
        self.state().live.len()
    }

    /// Highest number of simultaneously live connections ever observed.
    pub fn peak_live_connections(&self) -> usize {
        self.state().peak_live
    }

    /// Usernames of every successful login, in order.
    pub fn logins(&self) -> Vec<String> {
        self.state().logins.clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.state().disconnects
    }

    pub fn accepts_started(&self) -> usize {
        self.state().accepts_started
    }

    /// Accept tasks dropped before they produced a result.
    pub fn accepts_cancelled(&self) -> usize {
        self.state().accepts_cancelled
    }

    pub fn challenges(&self) -> Vec<SentChallenge> {
        self.state().challenges.clone()
    }
}

/// Counts an accept future as cancelled if it is dropped before resolving.
struct CancelGuard<'a> {
    client: &'a MockBattleClient,
    armed: bool,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.client.state().accepts_cancelled += 1;
        }
    }
}

#[async_trait]
impl BattleClient for MockBattleClient {
    async fn connect_and_login(
        &self,
        identity: &AgentIdentity,
    ) -> Result<ConnectionHandle, ClientError> {
        let mut st = self.state();
        let failure = st
            .connect_failures
            .pop_front()
            .or_else(|| st.always_fail_connect.clone());
        if let Some(err) = failure {
            return Err(err);
        }
        if st.live.values().any(|name| name == identity.name()) {
            return Err(ClientError::LoginRejected {
                username: identity.name().to_string(),
                reason: "name already in use".to_string(),
            });
        }

        let handle = ConnectionHandle::new(identity.name());
        st.live.insert(handle.id(), identity.name().to_string());
        st.peak_live = st.peak_live.max(st.live.len());
        st.logins.push(identity.name().to_string());
        Ok(handle)
    }

    async fn accept_one_challenge(
        &self,
        conn: &ConnectionHandle,
        _format: &str,
    ) -> Result<(), ClientError> {
        self.state().accepts_started += 1;
        let mut guard = CancelGuard {
            client: self,
            armed: true,
        };

        loop {
            let notified = self.accept_signal.notified();
            let ready = self.state().accept_results.remove(conn.username());
            if let Some(result) = ready {
                guard.armed = false;
                return result;
            }
            let live = self.state().live.contains_key(&conn.id());
            if !live {
                guard.armed = false;
                return Err(ClientError::Disconnected);
            }
            notified.await;
        }
    }

    async fn known_matches(&self, conn: &ConnectionHandle) -> Result<KnownMatches, ClientError> {
        if self.state().query_panics {
            panic!("known_matches blew up");
        }
        let st = self.state();
        if let Some(err) = st.query_failure.clone() {
            return Err(err);
        }
        if !st.live.contains_key(&conn.id()) {
            return Err(ClientError::Disconnected);
        }
        Ok(st.matches.get(conn.username()).cloned().unwrap_or_default())
    }

    async fn disconnect(&self, conn: &ConnectionHandle) -> Result<(), ClientError> {
        let delay = self.state().disconnect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = {
            let mut st = self.state();
            st.disconnects += 1;
            st.live.remove(&conn.id());
            st.disconnect_failure.clone()
        };
        self.accept_signal.notify_waiters();
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn send_challenge(
        &self,
        conn: &ConnectionHandle,
        target: &str,
        format: &str,
    ) -> Result<(), ClientError> {
        let mut st = self.state();
        if let Some(err) = st.challenge_failure.clone() {
            return Err(err);
        }
        if !st.live.contains_key(&conn.id()) {
            return Err(ClientError::Disconnected);
        }
        st.challenges.push(SentChallenge {
            from: conn.username().to_string(),
            target: target.to_string(),
            format: format.to_string(),
        });
        if let Some(tag) = st.battle_on_challenge.clone() {
            st.matches
                .entry(conn.username().to_string())
                .or_default()
                .insert(tag, MatchStatus { finished: false });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_connect_tracks_peak() {
        let client = MockBattleClient::new();
        let a = client
            .connect_and_login(&AgentIdentity::guest("A"))
            .await
            .unwrap();
        let b = client
            .connect_and_login(&AgentIdentity::guest("B"))
            .await
            .unwrap();
        assert_eq!(client.live_connections(), 2);
        client.disconnect(&a).await.unwrap();
        client.disconnect(&b).await.unwrap();
        assert_eq!(client.live_connections(), 0);
        assert_eq!(client.peak_live_connections(), 2);
        assert_eq!(client.logins(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let client = MockBattleClient::new();
        client
            .connect_and_login(&AgentIdentity::guest("A"))
            .await
            .unwrap();
        let err = client
            .connect_and_login(&AgentIdentity::guest("A"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::LoginRejected { .. }));
    }

    #[tokio::test]
    async fn test_scripted_connect_failure_is_consumed() {
        let client = MockBattleClient::new();
        client.fail_next_connect(ClientError::ConnectFailed("refused".into()));
        assert!(client
            .connect_and_login(&AgentIdentity::guest("A"))
            .await
            .is_err());
        assert!(client
            .connect_and_login(&AgentIdentity::guest("A"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_accept_completes_on_signal() {
        let client = Arc::new(MockBattleClient::new());
        let conn = client
            .connect_and_login(&AgentIdentity::guest("A"))
            .await
            .unwrap();

        let task = {
            let client = client.clone();
            let conn = conn.clone();
            tokio::spawn(async move { client.accept_one_challenge(&conn, "gen9randombattle").await })
        };
        tokio::task::yield_now().await;
        client.complete_accept("A", Ok(()));
        assert_eq!(task.await.unwrap(), Ok(()));
        assert_eq!(client.accepts_cancelled(), 0);
    }

    #[tokio::test]
    async fn test_aborted_accept_counts_as_cancelled() {
        let client = Arc::new(MockBattleClient::new());
        let conn = client
            .connect_and_login(&AgentIdentity::guest("A"))
            .await
            .unwrap();

        let task = {
            let client = client.clone();
            let conn = conn.clone();
            tokio::spawn(async move { client.accept_one_challenge(&conn, "gen9randombattle").await })
        };
        while client.accepts_started() == 0 {
            tokio::task::yield_now().await;
        }
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(client.accepts_started(), 1);
        assert_eq!(client.accepts_cancelled(), 1);
    }

    #[tokio::test]
    async fn test_queries_after_disconnect_fail() {
        let client = MockBattleClient::new();
        let conn = client
            .connect_and_login(&AgentIdentity::guest("A"))
            .await
            .unwrap();
        client.set_match("A", "battle-1", false);
        assert_eq!(client.known_matches(&conn).await.unwrap().len(), 1);
        client.disconnect(&conn).await.unwrap();
        assert_eq!(
            client.known_matches(&conn).await,
            Err(ClientError::Disconnected)
        );
        // Idempotent
        assert!(client.disconnect(&conn).await.is_ok());
    }
}
