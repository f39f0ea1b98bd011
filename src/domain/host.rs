//! Host reachability

use serde::{Deserialize, Serialize};

/// Last known reachability of a host's Tool Meister
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Reachability {
    #[default]
    Unknown,
    Reachable,
    Unreachable,
}

impl Reachability {
    /// Reachability after a dispatch attempt
    pub fn after_dispatch(connected: bool) -> Self {
        if connected { Self::Reachable } else { Self::Unreachable }
    }
}
