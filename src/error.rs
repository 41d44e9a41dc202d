// Error types for the battle-client boundary, the agent lifecycle and the invite flow.

use thiserror::Error;

use crate::rate_limit::RateLimitError;

/// Failures reported by a `BattleClient` implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("connection to battle server failed: {0}")]
    ConnectFailed(String),
    #[error("login rejected for '{username}': {reason}")]
    LoginRejected { username: String, reason: String },
    #[error("connection closed by remote side")]
    Disconnected,
    #[error("challenge to '{target}' failed: {reason}")]
    ChallengeFailed { target: String, reason: String },
    #[error("transport error: {0}")]
    Transport(String),
}

/// Everything that can go wrong while driving an agent through its lifecycle.
///
/// None of these ever escape the controller loop; they are logged and mapped
/// to a state transition (or a no-op) at the cycle boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("activation failed: {0}")]
    Activation(String),
    #[error("accept task failed: {0}")]
    AcceptTask(String),
    #[error("match {tag} disappeared before it was seen finishing")]
    MatchLost { tag: String },
    #[error("match query failed: {0}")]
    Query(String),
    #[error("teardown failed: {0}")]
    Teardown(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("{operation} timed out after {millis}ms")]
    Timeout {
        operation: &'static str,
        millis: u128,
    },
}

impl LifecycleError {
    pub fn timeout(operation: &'static str, after: std::time::Duration) -> Self {
        Self::Timeout {
            operation,
            millis: after.as_millis(),
        }
    }

    /// Short text suitable for end users. Details go to the log, not the UI.
    pub fn user_message(&self) -> String {
        match self {
            Self::Activation(_) => {
                "Could not start a battle agent. Retrying shortly.".to_string()
            }
            Self::AcceptTask(_) => {
                "The agent lost its connection while waiting for a challenge.".to_string()
            }
            Self::MatchLost { tag } => format!("Battle {tag} ended unexpectedly."),
            Self::Query(_) | Self::Timeout { .. } => {
                "The battle server is not responding.".to_string()
            }
            Self::Teardown(_) => "The previous agent did not shut down cleanly.".to_string(),
            Self::InvariantViolation(_) => "Internal error in the agent host.".to_string(),
        }
    }
}

/// Rejections of an invite request. The display strings are shown to users as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InviteError {
    #[error("Please enter your Showdown username.")]
    MissingUsername,
    #[error("Please select an agent type.")]
    MissingAgent,
    #[error("Invalid agent type '{0}' requested.")]
    UnknownAgent(String),
    #[error("Cannot create {agent}. {env_var} environment variable is missing.")]
    Unavailable { agent: String, env_var: String },
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),
}
