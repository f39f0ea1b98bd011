use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-sample state on a Tool Meister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeisterState {
    Idle,
    Starting,
    Running,
    Stopping,
    Done,
    /// The Meister could not serve the sample at all
    Failed,
}

impl fmt::Display for MeisterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}
