//! Hosts one automated Pokémon Showdown battle agent at a time.
//!
//! A [`LifecycleController`](agent::LifecycleController) repeatedly activates an agent,
//! waits for a challenge, watches the battle and retires the agent. Status is published
//! through a [`PresentationSink`](presentation::PresentationSink) and served over HTTP.

pub mod agent;
pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod invite;
pub mod metrics;
pub mod presentation;
pub mod rate_limit;
