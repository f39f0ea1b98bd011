//! Sample records
//!
//! A Sample is the unit over which tools run, nested inside an iteration of a
//! run. The controller owns its record; only barrier resolution writes it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::host::Reachability;
use crate::domain::invocation::ToolInvocation;
use crate::id::now_ms;
use crate::storage::HasId;

/// Run / iteration / sample coordinates
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SampleId {
    pub run: String,
    pub iteration: u32,
    pub sample: u32,
}

impl SampleId {
    pub fn new(run: impl Into<String>, iteration: u32, sample: u32) -> Self {
        Self {
            run: run.into(),
            iteration,
            sample,
        }
    }

    /// `<iteration>/<sample>` relative path
    pub fn rel_path(&self) -> std::path::PathBuf {
        std::path::PathBuf::from(self.iteration.to_string()).join(self.sample.to_string())
    }
}

impl fmt::Display for SampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.run, self.iteration, self.sample)
    }
}

/// Sample lifecycle as seen by the controller
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SampleState {
    Created,
    ToolsStarting,
    ToolsRunning,
    ToolsStopping,
    ToolsStopped,
    Collected,
}

impl SampleState {
    /// A command for this sample is awaiting its barrier
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::ToolsStarting | Self::ToolsStopping)
    }
}

impl fmt::Display for SampleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "CREATED",
            Self::ToolsStarting => "TOOLS_STARTING",
            Self::ToolsRunning => "TOOLS_RUNNING",
            Self::ToolsStopping => "TOOLS_STOPPING",
            Self::ToolsStopped => "TOOLS_STOPPED",
            Self::Collected => "COLLECTED",
        };
        f.write_str(s)
    }
}

/// What the barrier saw from one host for one command
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HostOutcome {
    Acknowledged,
    /// The Meister answered with an error
    Failed,
    Unreachable,
    TimedOut,
    /// Still pending when a stop cancelled the start barrier
    Aborted,
}

impl HostOutcome {
    /// Counts against the host for this sample
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Unreachable | Self::TimedOut)
    }
}

/// Per-host view of a sample
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HostSampleStatus {
    #[serde(default)]
    pub reachability: Reachability,
    /// Host missed or failed a command for this sample
    #[serde(default)]
    pub degraded: bool,
    #[serde(default)]
    pub start: Option<HostOutcome>,
    #[serde(default)]
    pub stop: Option<HostOutcome>,
    #[serde(default)]
    pub collect: Option<HostOutcome>,
    #[serde(default)]
    pub invocations: Vec<ToolInvocation>,
}

impl HostSampleStatus {
    /// Insert or replace the invocation for the same tool
    pub fn upsert_invocation(&mut self, invocation: ToolInvocation) {
        match self.invocations.iter_mut().find(|i| i.tool == invocation.tool) {
            Some(existing) => *existing = invocation,
            None => self.invocations.push(invocation),
        }
    }
}

/// Persistent record of a sample
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SampleRecord {
    /// `SampleId` display form, the storage key
    pub id: String,
    pub sample: SampleId,
    pub group: String,
    pub state: SampleState,
    #[serde(default)]
    pub hosts: BTreeMap<String, HostSampleStatus>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SampleRecord {
    pub fn new(sample: SampleId, group: &str, hosts: &[String]) -> Self {
        let now = now_ms();
        Self {
            id: sample.to_string(),
            sample,
            group: group.to_string(),
            state: SampleState::Created,
            hosts: hosts.iter().map(|h| (h.clone(), HostSampleStatus::default())).collect(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_state(&mut self, state: SampleState) {
        self.state = state;
        self.updated_at = now_ms();
    }

    pub fn host_mut(&mut self, host: &str) -> &mut HostSampleStatus {
        self.hosts.entry(host.to_string()).or_default()
    }

    /// Hosts marked degraded for this sample
    pub fn degraded_hosts(&self) -> Vec<&str> {
        self.hosts
            .iter()
            .filter(|(_, s)| s.degraded)
            .map(|(h, _)| h.as_str())
            .collect()
    }

    /// All invocations across hosts
    pub fn invocations(&self) -> impl Iterator<Item = &ToolInvocation> {
        self.hosts.values().flat_map(|s| s.invocations.iter())
    }
}

impl HasId for SampleRecord {
    fn id(&self) -> &str {
        &self.id
    }
}
