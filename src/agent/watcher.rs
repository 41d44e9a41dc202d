// Detects when an agent's match starts and when it ends.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::agent::session::AgentSession;
use crate::client::{BattleClient, ConnectionHandle, KnownMatches};
use crate::error::LifecycleError;

/// A match observed on an agent's connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRef {
    tag: String,
    finished: bool,
    /// Name of the agent whose connection reported the match.
    owner: String,
    observed_at: Instant,
}

impl MatchRef {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Time since the match was first observed.
    pub fn age(&self) -> Duration {
        self.observed_at.elapsed()
    }

    pub(crate) fn mark_finished(&mut self) {
        self.finished = true;
    }
}

/// How a tracked match is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchProgress {
    Ongoing,
    Finished,
    /// The tag vanished before completion was seen.
    Lost,
}

impl MatchProgress {
    pub fn is_concluded(self) -> bool {
        self != MatchProgress::Ongoing
    }
}

/// Result of one status read for a tracked match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub progress: MatchProgress,
    /// Other unfinished matches on the same connection.
    pub strays: Vec<String>,
}

/// Polls a connection's known matches.
///
/// Conclusions are remembered per tag, so once a match reads as finished (or lost)
/// it stays that way no matter what later queries return.
#[derive(Debug)]
pub struct BattleWatcher {
    query_timeout: Duration,
    concluded: HashMap<String, MatchProgress>,
}

impl BattleWatcher {
    pub fn new(query_timeout: Duration) -> Self {
        Self {
            query_timeout,
            concluded: HashMap::new(),
        }
    }

    /// First unfinished match on the session's connection, if any. Read-only.
    pub async fn poll(&self, session: &AgentSession) -> Result<Option<MatchRef>, LifecycleError> {
        self.poll_connection(session.client().as_ref(), session.connection())
            .await
    }

    pub async fn poll_connection(
        &self,
        client: &dyn BattleClient,
        conn: &ConnectionHandle,
    ) -> Result<Option<MatchRef>, LifecycleError> {
        let known = self.query(client, conn).await?;
        let found = self.unfinished(&known).next().map(|tag| MatchRef {
            tag: tag.to_string(),
            finished: false,
            owner: conn.username().to_string(),
            observed_at: Instant::now(),
        });
        Ok(found)
    }

    /// Whether the referenced match is over, either finished or lost.
    pub async fn is_finished(
        &mut self,
        session: &AgentSession,
        match_ref: &MatchRef,
    ) -> Result<bool, LifecycleError> {
        let obs = self.observe(session, match_ref).await?;
        Ok(obs.progress.is_concluded())
    }

    pub async fn observe(
        &mut self,
        session: &AgentSession,
        match_ref: &MatchRef,
    ) -> Result<Observation, LifecycleError> {
        self.observe_connection(session.client().as_ref(), session.connection(), match_ref)
            .await
    }

    /// Re-read the freshest status of `match_ref`, and report any other unfinished matches.
    pub async fn observe_connection(
        &mut self,
        client: &dyn BattleClient,
        conn: &ConnectionHandle,
        match_ref: &MatchRef,
    ) -> Result<Observation, LifecycleError> {
        let tag = match_ref.tag();
        if let Some(&progress) = self.concluded.get(tag) {
            return Ok(Observation {
                progress,
                strays: Vec::new(),
            });
        }

        let known = self.query(client, conn).await?;
        let progress = match known.get(tag) {
            Some(status) if status.finished => MatchProgress::Finished,
            Some(_) => MatchProgress::Ongoing,
            None => MatchProgress::Lost,
        };
        if progress.is_concluded() {
            self.concluded.insert(tag.to_string(), progress);
        }
        let strays = self
            .unfinished(&known)
            .filter(|t| *t != tag)
            .map(str::to_string)
            .collect();
        Ok(Observation { progress, strays })
    }

    fn unfinished<'a>(&'a self, known: &'a KnownMatches) -> impl Iterator<Item = &'a str> + 'a {
        known
            .iter()
            .filter(|(tag, status)| !status.finished && !self.concluded.contains_key(*tag))
            .map(|(tag, _)| tag.as_str())
    }

    async fn query(
        &self,
        client: &dyn BattleClient,
        conn: &ConnectionHandle,
    ) -> Result<KnownMatches, LifecycleError> {
        match tokio::time::timeout(self.query_timeout, client.known_matches(conn)).await {
            Ok(Ok(known)) => Ok(known),
            Ok(Err(e)) => Err(LifecycleError::Query(e.to_string())),
            Err(_) => Err(LifecycleError::timeout("match query", self.query_timeout)),
        }
    }
}
