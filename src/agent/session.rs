// One live, logged-in automated player and its pending accept-one-challenge task.

use std::time::Duration;

use futures::FutureExt;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

use crate::agent::identity::AgentIdentity;
use crate::client::{ConnectionHandle, SharedClient};
use crate::error::{ClientError, LifecycleError};

/// Where the accept task stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptStatus {
    /// Still waiting for a challenge.
    Pending,
    /// A challenge was accepted.
    Accepted,
    Failed(ClientError),
    Cancelled,
}

type AcceptTask = JoinHandle<Result<(), ClientError>>;

/// A connected agent. Owned by exactly one controller for its whole life.
pub struct AgentSession {
    identity: AgentIdentity,
    connection: ConnectionHandle,
    client: SharedClient,
    accept_task: Option<AcceptTask>,
    accept_outcome: Option<AcceptStatus>,
    last_error: Option<LifecycleError>,
    activated_at: Instant,
    torn_down: bool,
    /// Set once the remote side confirmed the connection is gone.
    released: bool,
}

impl AgentSession {
    /// Connect and log in as `identity`, then start accepting one challenge in `format`.
    pub async fn activate(
        client: SharedClient,
        identity: AgentIdentity,
        format: &str,
        timeout: Duration,
    ) -> Result<Self, LifecycleError> {
        identity.validate()?;

        let connection =
            match tokio::time::timeout(timeout, client.connect_and_login(&identity)).await {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => return Err(LifecycleError::Activation(e.to_string())),
                Err(_) => {
                    return Err(LifecycleError::Activation(format!(
                        "connect and login as '{}' timed out after {}ms",
                        identity.name(),
                        timeout.as_millis()
                    )))
                }
            };

        let accept_task = {
            let client = client.clone();
            let conn = connection.clone();
            let format = format.to_string();
            tokio::spawn(async move { client.accept_one_challenge(&conn, &format).await })
        };

        Ok(Self {
            identity,
            connection,
            client,
            accept_task: Some(accept_task),
            accept_outcome: None,
            last_error: None,
            activated_at: Instant::now(),
            torn_down: false,
            released: false,
        })
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        self.identity.name()
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn client(&self) -> &SharedClient {
        &self.client
    }

    pub fn last_error(&self) -> Option<&LifecycleError> {
        self.last_error.as_ref()
    }

    pub fn uptime(&self) -> Duration {
        self.activated_at.elapsed()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Whether teardown actually closed the connection.
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Non-blocking check of the accept task. Once resolved the outcome is sticky.
    pub fn accept_status(&mut self) -> AcceptStatus {
        if let Some(outcome) = &self.accept_outcome {
            return outcome.clone();
        }
        let Some(task) = self.accept_task.as_mut() else {
            return AcceptStatus::Cancelled;
        };
        if !task.is_finished() {
            return AcceptStatus::Pending;
        }
        match task.now_or_never() {
            Some(result) => {
                self.accept_task = None;
                self.resolve(result)
            }
            None => AcceptStatus::Pending,
        }
    }

    /// Cancel the pending accept task and wait up to `timeout` for it to stop.
    ///
    /// Idempotent. A task that already finished, even one that finished while the
    /// cancellation was in flight, is not an error. Only a missing acknowledgement is.
    pub async fn cancel_accept(&mut self, timeout: Duration) -> Result<(), LifecycleError> {
        let Some(task) = self.accept_task.take() else {
            return Ok(());
        };
        task.abort();
        match tokio::time::timeout(timeout, task).await {
            Ok(result) => {
                self.resolve(result);
                Ok(())
            }
            Err(_) => {
                self.accept_outcome = Some(AcceptStatus::Cancelled);
                Err(LifecycleError::timeout("accept cancellation", timeout))
            }
        }
    }

    /// Release the connection. Safe to call repeatedly; a connection the remote
    /// side already closed counts as released. Only the first call talks to the
    /// client. If it fails, dropping the session retries the disconnect once.
    pub async fn teardown(&mut self, timeout: Duration) -> Result<(), LifecycleError> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        if let Some(task) = self.accept_task.take() {
            task.abort();
            self.accept_outcome.get_or_insert(AcceptStatus::Cancelled);
        }

        let result = match tokio::time::timeout(timeout, self.client.disconnect(&self.connection))
            .await
        {
            Ok(Ok(())) | Ok(Err(ClientError::Disconnected)) => Ok(()),
            Ok(Err(e)) => Err(LifecycleError::Teardown(e.to_string())),
            Err(_) => Err(LifecycleError::Teardown(format!(
                "disconnect timed out after {}ms",
                timeout.as_millis()
            ))),
        };
        match &result {
            Ok(()) => self.released = true,
            Err(e) => self.last_error = Some(e.clone()),
        }
        result
    }

    fn resolve(&mut self, result: Result<Result<(), ClientError>, JoinError>) -> AcceptStatus {
        let status = match result {
            Ok(Ok(())) => AcceptStatus::Accepted,
            Ok(Err(e)) => AcceptStatus::Failed(e),
            Err(e) if e.is_cancelled() => AcceptStatus::Cancelled,
            Err(e) => AcceptStatus::Failed(ClientError::Transport(format!(
                "accept task panicked: {e}"
            ))),
        };
        if let AcceptStatus::Failed(e) = &status {
            self.last_error = Some(LifecycleError::AcceptTask(e.to_string()));
        }
        self.accept_outcome = Some(status.clone());
        status
    }
}

impl Drop for AgentSession {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        if self.torn_down {
            tracing::warn!(
                agent = self.identity.name(),
                "Agent session dropped after a failed teardown; retrying disconnect in background"
            );
        } else {
            tracing::warn!(
                agent = self.identity.name(),
                "Agent session dropped without teardown; disconnecting in background"
            );
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let client = self.client.clone();
            let conn = self.connection.clone();
            handle.spawn(async move {
                if let Err(e) = client.disconnect(&conn).await {
                    tracing::warn!(username = conn.username(), "Background disconnect failed: {e}");
                }
            });
        }
    }
}
