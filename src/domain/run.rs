//! Run records
//!
//! A Run is one benchmark execution against one tool group. Every non-fatal
//! error seen while driving it is appended here so an operator can judge how
//! complete the data is.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::host::Reachability;
use crate::domain::sample::SampleId;
use crate::id::{generate_instance_id, now_ms};
use crate::storage::HasId;

/// Run lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Active,
    Finished,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished)
    }
}

/// Class of a non-fatal error
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Install check or spawn failure of one tool
    ToolStartup,
    /// Host did not answer a command in time or could not be reached
    HostUnreachable,
    /// Host answered a command with an error
    HostFailed,
    /// Tool ignored the graceful stop and was killed
    ToolTerminationTimeout,
    /// Assembly found host or tool output missing
    PartialResult,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ToolStartup => "ToolStartupError",
            Self::HostUnreachable => "HostUnreachable",
            Self::HostFailed => "HostFailed",
            Self::ToolTerminationTimeout => "ToolTerminationTimeout",
            Self::PartialResult => "PartialResult",
        };
        f.write_str(s)
    }
}

/// One non-fatal error in the run record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordedError {
    pub kind: ErrorKind,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub sample: Option<SampleId>,
    pub message: String,
    /// Unix ms
    pub at: i64,
}

impl RecordedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            host: None,
            tool: None,
            sample: None,
            message: message.into(),
            at: now_ms(),
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn sample(mut self, sample: &SampleId) -> Self {
        self.sample = Some(sample.clone());
        self
    }
}

impl fmt::Display for RecordedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(sample) = &self.sample {
            write!(f, " [{}]", sample)?;
        }
        if let Some(host) = &self.host {
            write!(f, " {}", host)?;
        }
        if let Some(tool) = &self.tool {
            write!(f, "/{}", tool)?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Persistent record of a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    /// Run name, also the result tree directory name
    pub id: String,
    pub group: String,
    pub status: RunStatus,
    /// Controller instance that began the run
    pub instance: String,
    /// Registered hosts in start order
    pub hosts: Vec<String>,
    #[serde(default)]
    pub reachability: BTreeMap<String, Reachability>,
    #[serde(default)]
    pub errors: Vec<RecordedError>,
    /// Sysinfo items gathered at the start of the run, again at its end
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sysinfo: Vec<String>,
    pub created_at: i64,
    #[serde(default)]
    pub finished_at: Option<i64>,
}

impl RunRecord {
    pub fn new(id: &str, group: &str, hosts: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            group: group.to_string(),
            status: RunStatus::Active,
            instance: generate_instance_id(),
            reachability: hosts.iter().map(|h| (h.clone(), Reachability::Unknown)).collect(),
            hosts,
            errors: Vec::new(),
            sysinfo: Vec::new(),
            created_at: now_ms(),
            finished_at: None,
        }
    }

    pub fn record_error(&mut self, error: RecordedError) {
        log::warn!("run {}: {}", self.id, error);
        self.errors.push(error);
    }

    pub fn set_reachability(&mut self, host: &str, reachability: Reachability) {
        self.reachability.insert(host.to_string(), reachability);
    }

    pub fn mark_finished(&mut self) {
        self.status = RunStatus::Finished;
        self.finished_at = Some(now_ms());
    }

    pub fn errors_of(&self, kind: ErrorKind) -> impl Iterator<Item = &RecordedError> {
        self.errors.iter().filter(move |e| e.kind == kind)
    }
}

impl HasId for RunRecord {
    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_run_is_active() {
        let run = RunRecord::new("run-1", "default", vec!["h1".to_string(), "h2".to_string()]);
        assert_eq!(run.status, RunStatus::Active);
        assert_eq!(run.reachability.len(), 2);
        assert!(run.errors.is_empty());
        assert!(!run.instance.is_empty());
    }

    #[test]
    fn test_record_error_and_filter() {
        let mut run = RunRecord::new("run-1", "default", vec!["h1".to_string()]);
        let sample = SampleId::new("run-1", 1, 1);
        run.record_error(
            RecordedError::new(ErrorKind::PartialResult, "no output collected")
                .host("h2")
                .sample(&sample),
        );
        run.record_error(RecordedError::new(ErrorKind::ToolStartup, "not installed").host("h1").tool("iostat"));
        assert_eq!(run.errors_of(ErrorKind::PartialResult).count(), 1);
        assert_eq!(run.errors_of(ErrorKind::HostUnreachable).count(), 0);
    }

    #[test]
    fn test_recorded_error_display() {
        let err = RecordedError::new(ErrorKind::ToolStartup, "install check exited with 1")
            .host("h1")
            .tool("iostat")
            .sample(&SampleId::new("r", 1, 1));
        assert_eq!(
            err.to_string(),
            "ToolStartupError [r/1/1] h1/iostat: install check exited with 1"
        );
    }

    #[test]
    fn test_mark_finished() {
        let mut run = RunRecord::new("run-1", "default", vec![]);
        run.mark_finished();
        assert!(run.status.is_terminal());
        assert!(run.finished_at.is_some());
    }
}
