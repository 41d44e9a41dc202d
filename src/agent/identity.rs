// Agent identities, the configured roster of agent profiles, and selection among them.

use std::fmt;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;

use crate::error::LifecycleError;

/// An opaque credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Name/credential pair an agent logs in with. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    name: String,
    credential: Option<Secret>,
}

impl AgentIdentity {
    /// An identity that logs in as a guest.
    pub fn guest(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            credential: None,
        }
    }

    pub fn with_credential(name: impl Into<String>, credential: Secret) -> Self {
        Self {
            name: name.into(),
            credential: Some(credential),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn credential(&self) -> Option<&Secret> {
        self.credential.as_ref()
    }

    pub fn is_guest(&self) -> bool {
        self.credential.is_none()
    }

    pub fn validate(&self) -> Result<(), LifecycleError> {
        if self.name.trim().is_empty() {
            return Err(LifecycleError::Activation(
                "agent identity has an empty name".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which decision function drives the agent's moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Random,
    Llm,
}

impl AgentKind {
    /// Parse a kind name as written in `AGENT_ROSTER`.
    pub fn from_str_name(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "random" => Some(Self::Random),
            "llm" | "openai" => Some(Self::Llm),
            _ => None,
        }
    }

    pub fn to_str_name(&self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::Llm => "llm",
        }
    }

    /// Label shown in the agent picker.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Random => "Random Player",
            Self::Llm => "OpenAI Agent",
        }
    }
}

/// A configured kind of agent from which concrete identities are minted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentProfile {
    pub base_name: String,
    pub kind: AgentKind,
    /// Environment variable that must be set for this profile to be usable.
    pub requires_env: Option<String>,
    pub credential: Option<Secret>,
    /// Append a random numeric suffix so concurrent logins never collide.
    pub unique_suffix: bool,
}

impl AgentProfile {
    /// A guest profile whose identity name is exactly `base_name`.
    pub fn new(base_name: impl Into<String>, kind: AgentKind) -> Self {
        Self {
            base_name: base_name.into(),
            kind,
            requires_env: None,
            credential: None,
            unique_suffix: false,
        }
    }

    pub fn with_credential(mut self, credential: Secret) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn requiring_env(mut self, var: impl Into<String>) -> Self {
        self.requires_env = Some(var.into());
        self
    }

    pub fn with_unique_suffix(mut self) -> Self {
        self.unique_suffix = true;
        self
    }

    /// Whether the credentials this profile needs are present right now.
    pub fn is_available(&self) -> bool {
        match &self.requires_env {
            Some(var) => std::env::var(var).map(|v| !v.is_empty()).unwrap_or(false),
            None => true,
        }
    }

    /// Mint a fresh identity, e.g. `RandAgent482913`.
    pub fn identity(&self) -> AgentIdentity {
        let name = if self.unique_suffix {
            let suffix = rand::thread_rng().gen_range(10_000..=999_999);
            format!("{}{}", self.base_name, suffix)
        } else {
            self.base_name.clone()
        };
        AgentIdentity {
            name,
            credential: self.credential.clone(),
        }
    }

    /// Whether `selector` names this profile, by base name or kind.
    pub fn matches(&self, selector: &str) -> bool {
        let selector = selector.trim();
        self.base_name.eq_ignore_ascii_case(selector)
            || self.kind.label().eq_ignore_ascii_case(selector)
            || self.kind.to_str_name().eq_ignore_ascii_case(selector)
    }
}

/// Availability of one profile, as listed for the presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub name: String,
    pub kind: AgentKind,
    pub label: &'static str,
    pub available: bool,
}

/// The set of agent profiles supplied by configuration.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    profiles: Vec<AgentProfile>,
}

impl Roster {
    pub fn new(profiles: Vec<AgentProfile>) -> Self {
        Self { profiles }
    }

    /// Parse `Name:kind[:PASSWORD_ENV]` entries separated by commas.
    ///
    /// `llm` profiles require `llm_key_env` to be set. A password variable that is
    /// unset at load time leaves the profile as a guest. Malformed entries are skipped.
    pub fn parse(spec: &str, llm_key_env: &str) -> Self {
        let mut profiles = Vec::new();
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let mut parts = entry.split(':').map(str::trim);
            let name = parts.next().unwrap_or_default();
            let kind = parts.next().and_then(AgentKind::from_str_name);
            let (name, kind) = match (name, kind) {
                (n, Some(k)) if !n.is_empty() => (n, k),
                _ => {
                    tracing::warn!("Skipping malformed roster entry '{entry}'");
                    continue;
                }
            };

            let mut profile = AgentProfile::new(name, kind).with_unique_suffix();
            if kind == AgentKind::Llm {
                profile = profile.requiring_env(llm_key_env);
            }
            if let Some(password_env) = parts.next().filter(|p| !p.is_empty()) {
                match std::env::var(password_env) {
                    Ok(pw) if !pw.is_empty() => profile = profile.with_credential(Secret::new(pw)),
                    _ => tracing::warn!(
                        "Password variable {password_env} for agent {name} is not set; logging in as guest"
                    ),
                }
            }
            profiles.push(profile);
        }
        Self { profiles }
    }

    pub fn profiles(&self) -> &[AgentProfile] {
        &self.profiles
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Profiles whose credentials are currently available.
    pub fn available(&self) -> Vec<&AgentProfile> {
        self.profiles.iter().filter(|p| p.is_available()).collect()
    }

    /// Pick uniformly at random among the available profiles.
    pub fn choose<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&AgentProfile> {
        self.available().choose(rng).copied()
    }

    pub fn find(&self, selector: &str) -> Option<&AgentProfile> {
        self.profiles.iter().find(|p| p.matches(selector))
    }

    pub fn describe(&self) -> Vec<AgentInfo> {
        self.profiles
            .iter()
            .map(|p| AgentInfo {
                name: p.base_name.clone(),
                kind: p.kind,
                label: p.kind.label(),
                available: p.is_available(),
            })
            .collect()
    }
}
