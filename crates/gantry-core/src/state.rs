//! The plugin instance lifecycle state machine.

use serde::{Deserialize, Serialize};

/// States a plugin instance passes through from discovery to termination.
///
/// `Running` and `Monitoring` are the same execution mode; the distinction is
/// whether an enforcement cycle is currently looking at the instance, and the
/// flip between them is internal bookkeeping. The four terminal states
/// (`Rejected`, `Failed`, `Stopped`, `Blocked`) admit no outgoing
/// transitions: a blocked plugin is reloaded as a new instance, never
/// resumed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Discovered,
    Validating,
    Rejected,
    Loading,
    Starting,
    Failed,
    Running,
    Monitoring,
    Stopping,
    Stopped,
    Blocking,
    Blocked,
}

impl LifecycleState {
    /// Terminal states release all resources and admit no transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::Failed | Self::Stopped | Self::Blocked
        )
    }

    /// True while the instance has a live worker.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Running | Self::Monitoring | Self::Stopping | Self::Blocking
        )
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (Discovered, Validating) => true,
            (Validating, Rejected) | (Validating, Loading) => true,
            (Loading, Starting) | (Loading, Failed) => true,
            (Starting, Running) | (Starting, Failed) => true,
            // Running <-> Monitoring is internal bookkeeping.
            (Running, Monitoring) | (Monitoring, Running) => true,
            (Running, Stopping) | (Monitoring, Stopping) => true,
            (Running, Blocking) | (Monitoring, Blocking) => true,
            (Stopping, Stopped) => true,
            // A stop that uncovers a violation can still escalate.
            (Stopping, Blocking) => true,
            (Blocking, Blocked) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Validating => "validating",
            Self::Rejected => "rejected",
            Self::Loading => "loading",
            Self::Starting => "starting",
            Self::Failed => "failed",
            Self::Running => "running",
            Self::Monitoring => "monitoring",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Blocking => "blocking",
            Self::Blocked => "blocked",
        }
    }

    /// All states, for exhaustive checks.
    pub fn all() -> [LifecycleState; 12] {
        use LifecycleState::*;
        [
            Discovered, Validating, Rejected, Loading, Starting, Failed, Running, Monitoring,
            Stopping, Stopped, Blocking, Blocked,
        ]
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
