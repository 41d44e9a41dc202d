pub mod controller;
pub mod identity;
pub mod session;
pub mod watcher;

pub use controller::{ControllerHandle, LifecycleController, LifecycleState};
pub use identity::{AgentIdentity, AgentKind, AgentProfile, Roster};
pub use session::{AcceptStatus, AgentSession};
pub use watcher::{BattleWatcher, MatchProgress, MatchRef};
