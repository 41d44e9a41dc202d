// Application configuration, loaded from environment variables and CLI flags.

use std::time::Duration;

use crate::agent::identity::Roster;

pub const DEFAULT_BATTLE_FORMAT: &str = "gen9randombattle";
pub const DEFAULT_ROSTER: &str = "RandAgent:random,OpenAIAgent:llm";
pub const DEFAULT_LLM_KEY_ENV: &str = "OPENAI_API_KEY";
pub const DEFAULT_BATTLE_VIEW_BASE_URL: &str =
    "https://jofthomas.com/play.pokemonshowdown.com/testclient.html";

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port to bind the HTTP server to.
    pub port: u16,
    /// Agent profiles the controller and the invite flow may pick from.
    pub roster: Roster,
    pub lifecycle: LifecycleConfig,
    pub invite: InviteConfig,
}

/// Timing and format settings for the lifecycle controller.
///
/// Every suspending call the controller makes is bounded by one of these.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub battle_format: String,
    /// Interval between controller cycles.
    pub poll_interval: Duration,
    pub activation_timeout: Duration,
    /// Bounded wait for the accept task to acknowledge cancellation.
    pub accept_cancel_timeout: Duration,
    pub teardown_timeout: Duration,
    /// Timeout for a single `known_matches` query.
    pub query_timeout: Duration,
    /// Delay before retrying after a failed activation.
    pub activation_backoff: Duration,
    /// Delay before re-checking when no agent identity is available.
    pub idle_retry_delay: Duration,
    /// Consecutive failed match queries tolerated while in a match.
    pub max_query_failures: u32,
    pub shutdown_grace: Duration,
    /// Base URL used to build the watch link of a live battle.
    pub battle_view_base_url: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            battle_format: DEFAULT_BATTLE_FORMAT.to_string(),
            poll_interval: Duration::from_millis(2000),
            activation_timeout: Duration::from_millis(15_000),
            accept_cancel_timeout: Duration::from_millis(3000),
            teardown_timeout: Duration::from_millis(5000),
            query_timeout: Duration::from_millis(2000),
            activation_backoff: Duration::from_millis(10_000),
            idle_retry_delay: Duration::from_millis(5000),
            max_query_failures: 5,
            shutdown_grace: Duration::from_millis(10_000),
            battle_view_base_url: DEFAULT_BATTLE_VIEW_BASE_URL.to_string(),
        }
    }
}

/// Settings for the background invite flow.
#[derive(Debug, Clone)]
pub struct InviteConfig {
    /// Maximum invite tasks running at once.
    pub workers: usize,
    /// Invites allowed per target username per hour.
    pub limit_per_hour: usize,
    /// How long a sent challenge may wait to be picked up.
    pub pickup_timeout: Duration,
    /// Upper bound on how long an invite connection stays alive.
    pub match_timeout: Duration,
}

impl Default for InviteConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            limit_per_hour: 10,
            pickup_timeout: Duration::from_secs(300),
            match_timeout: Duration::from_secs(1800),
        }
    }
}

impl Config {
    /// Load configuration from environment variables and CLI arguments.
    ///
    /// Environment variables:
    /// - `PORT` - HTTP server port (default: 7860)
    /// - `BATTLE_FORMAT` - battle format identifier (default: `gen9randombattle`)
    /// - `AGENT_ROSTER` - `Name:kind[:PASSWORD_ENV]` entries, comma separated
    /// - `LLM_API_KEY_ENV` - variable whose presence enables `llm` agents (default: `OPENAI_API_KEY`)
    /// - `POLL_INTERVAL_MS`, `ACTIVATION_TIMEOUT_MS`, `ACCEPT_CANCEL_TIMEOUT_MS`,
    ///   `TEARDOWN_TIMEOUT_MS`, `QUERY_TIMEOUT_MS`, `ACTIVATION_BACKOFF_MS`,
    ///   `IDLE_RETRY_MS`, `SHUTDOWN_GRACE_MS` - controller timings
    /// - `MAX_QUERY_FAILURES` - failed match queries tolerated in a match (default: 5)
    /// - `BATTLE_VIEW_BASE_URL` - base of the watch link for live battles
    /// - `INVITE_WORKERS`, `INVITE_LIMIT_PER_HOUR`, `INVITE_PICKUP_TIMEOUT_SECS`,
    ///   `INVITE_MATCH_TIMEOUT_SECS` - invite flow settings
    ///
    /// CLI flags:
    /// - `--port <PORT>` - Override the port
    /// - `--format <FORMAT>` - Override the battle format
    ///
    /// Malformed numbers fall back to their defaults. Zero counts as malformed for
    /// every timing and count, since none of them can be zero.
    pub fn load() -> Self {
        let args: Vec<String> = std::env::args().collect();

        // Port: CLI flag --port takes precedence, then env var, then default
        let port = Self::parse_cli_value(&args, "--port")
            .and_then(|v| v.parse().ok())
            .or_else(|| env_parse("PORT"))
            .unwrap_or(7860);

        let battle_format = Self::parse_cli_value(&args, "--format")
            .or_else(|| std::env::var("BATTLE_FORMAT").ok())
            .filter(|f| !f.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BATTLE_FORMAT.to_string());

        let llm_key_env =
            std::env::var("LLM_API_KEY_ENV").unwrap_or_else(|_| DEFAULT_LLM_KEY_ENV.to_string());
        let roster_entries =
            std::env::var("AGENT_ROSTER").unwrap_or_else(|_| DEFAULT_ROSTER.to_string());
        let roster = Roster::parse(&roster_entries, &llm_key_env);

        let defaults = LifecycleConfig::default();
        let lifecycle = LifecycleConfig {
            battle_format,
            poll_interval: env_millis("POLL_INTERVAL_MS", defaults.poll_interval),
            activation_timeout: env_millis("ACTIVATION_TIMEOUT_MS", defaults.activation_timeout),
            accept_cancel_timeout: env_millis(
                "ACCEPT_CANCEL_TIMEOUT_MS",
                defaults.accept_cancel_timeout,
            ),
            teardown_timeout: env_millis("TEARDOWN_TIMEOUT_MS", defaults.teardown_timeout),
            query_timeout: env_millis("QUERY_TIMEOUT_MS", defaults.query_timeout),
            activation_backoff: env_millis("ACTIVATION_BACKOFF_MS", defaults.activation_backoff),
            idle_retry_delay: env_millis("IDLE_RETRY_MS", defaults.idle_retry_delay),
            max_query_failures: env_positive("MAX_QUERY_FAILURES")
                .unwrap_or(defaults.max_query_failures),
            shutdown_grace: env_millis("SHUTDOWN_GRACE_MS", defaults.shutdown_grace),
            battle_view_base_url: std::env::var("BATTLE_VIEW_BASE_URL")
                .unwrap_or(defaults.battle_view_base_url),
        };

        let invite_defaults = InviteConfig::default();
        let invite = InviteConfig {
            workers: env_positive("INVITE_WORKERS").unwrap_or(invite_defaults.workers),
            limit_per_hour: env_positive("INVITE_LIMIT_PER_HOUR")
                .unwrap_or(invite_defaults.limit_per_hour),
            pickup_timeout: env_positive("INVITE_PICKUP_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(invite_defaults.pickup_timeout),
            match_timeout: env_positive("INVITE_MATCH_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(invite_defaults.match_timeout),
        };

        Config {
            port,
            roster,
            lifecycle,
            invite,
        }
    }

    /// Parse a CLI flag value like `--port 8080`.
    fn parse_cli_value(args: &[String], flag: &str) -> Option<String> {
        args.windows(2).find_map(|pair| {
            if pair[0] == flag {
                Some(pair[1].clone())
            } else {
                None
            }
        })
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Like `env_parse`, but rejects zero.
fn env_positive<T: std::str::FromStr + PartialOrd + Default>(name: &str) -> Option<T> {
    env_parse(name).filter(|v: &T| *v > T::default())
}

fn env_millis(name: &str, default: Duration) -> Duration {
    env_positive::<u64>(name)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cli_value() {
        let args: Vec<String> = ["showdown-host", "--port", "8080", "--format", "gen8ou"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(Config::parse_cli_value(&args, "--port").as_deref(), Some("8080"));
        assert_eq!(
            Config::parse_cli_value(&args, "--format").as_deref(),
            Some("gen8ou")
        );
        assert_eq!(Config::parse_cli_value(&args, "--missing"), None);
    }

    #[test]
    fn test_parse_cli_value_flag_without_value() {
        let args: Vec<String> = vec!["showdown-host".into(), "--port".into()];
        assert_eq!(Config::parse_cli_value(&args, "--port"), None);
    }

    #[test]
    fn test_malformed_env_falls_back() {
        std::env::set_var("SHOWDOWN_HOST_TEST_MILLIS", "soon");
        assert_eq!(
            env_millis("SHOWDOWN_HOST_TEST_MILLIS", Duration::from_millis(7)),
            Duration::from_millis(7)
        );
        std::env::set_var("SHOWDOWN_HOST_TEST_MILLIS", " 250 ");
        assert_eq!(
            env_millis("SHOWDOWN_HOST_TEST_MILLIS", Duration::from_millis(7)),
            Duration::from_millis(250)
        );
        std::env::remove_var("SHOWDOWN_HOST_TEST_MILLIS");
    }

    #[test]
    fn test_zero_env_falls_back() {
        std::env::set_var("SHOWDOWN_HOST_TEST_ZERO_MILLIS", "0");
        assert_eq!(
            env_millis("SHOWDOWN_HOST_TEST_ZERO_MILLIS", Duration::from_millis(2000)),
            Duration::from_millis(2000)
        );
        std::env::remove_var("SHOWDOWN_HOST_TEST_ZERO_MILLIS");

        std::env::set_var("SHOWDOWN_HOST_TEST_ZERO_COUNT", "0");
        assert_eq!(env_positive::<usize>("SHOWDOWN_HOST_TEST_ZERO_COUNT"), None);
        std::env::set_var("SHOWDOWN_HOST_TEST_ZERO_COUNT", "-3");
        assert_eq!(env_positive::<usize>("SHOWDOWN_HOST_TEST_ZERO_COUNT"), None);
        std::env::set_var("SHOWDOWN_HOST_TEST_ZERO_COUNT", "3");
        assert_eq!(env_positive::<usize>("SHOWDOWN_HOST_TEST_ZERO_COUNT"), Some(3));
        std::env::remove_var("SHOWDOWN_HOST_TEST_ZERO_COUNT");
    }

    #[test]
    fn test_lifecycle_defaults() {
        let cfg = LifecycleConfig::default();
        assert_eq!(cfg.battle_format, "gen9randombattle");
        assert_eq!(cfg.poll_interval, Duration::from_secs(2));
        assert!(cfg.accept_cancel_timeout < cfg.teardown_timeout);
    }
}
