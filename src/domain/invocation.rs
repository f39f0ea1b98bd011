//! Tool invocation records
//!
//! A ToolInvocation is one (host, tool, sample) execution. The Tool Meister
//! creates it when it accepts a start and fills in the stop side; the Result
//! Assembler marks it collected once the tool's output is in the result tree.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::domain::sample::SampleId;
use crate::id::now_ms;

/// How a tool process ended
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Termination {
    /// Exited within the grace period after the graceful request
    Graceful,
    /// Killed after the grace period elapsed
    Forced,
    /// Had already exited before stop was requested
    AlreadyExited,
}

impl Termination {
    pub fn is_forced(&self) -> bool {
        matches!(self, Self::Forced)
    }
}

/// One execution of a tool for a sample on a host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolInvocation {
    pub host: String,
    pub tool: String,
    pub sample: SampleId,
    /// Directory the tool writes into, on its host
    pub output_dir: PathBuf,
    /// Unix ms
    pub started_at: i64,
    /// Unix ms
    #[serde(default)]
    pub stopped_at: Option<i64>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub termination: Option<Termination>,
    #[serde(default)]
    pub error: Option<String>,
    /// Output ends early because the tool was killed
    #[serde(default)]
    pub truncated: bool,
    /// Unix ms, set by the Result Assembler
    #[serde(default)]
    pub collected_at: Option<i64>,
}

impl ToolInvocation {
    /// Create an invocation for a tool that is being started
    pub fn new(host: &str, tool: &str, sample: &SampleId, output_dir: PathBuf) -> Self {
        Self {
            host: host.to_string(),
            tool: tool.to_string(),
            sample: sample.clone(),
            output_dir,
            started_at: now_ms(),
            stopped_at: None,
            pid: None,
            exit_code: None,
            termination: None,
            error: None,
            truncated: false,
            collected_at: None,
        }
    }

    /// Record the OS process id of a started tool
    pub fn mark_running(&mut self, pid: Option<u32>) {
        self.pid = pid;
    }

    /// Record a failed start; the invocation is finished immediately
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.stopped_at = Some(now_ms().max(self.started_at));
    }

    /// Record the final status from the supervisor
    pub fn mark_stopped(&mut self, termination: Termination, exit_code: Option<i32>) {
        self.termination = Some(termination);
        self.exit_code = exit_code;
        self.truncated = termination.is_forced();
        self.stopped_at = Some(now_ms().max(self.started_at));
    }

    pub fn mark_collected(&mut self) {
        self.collected_at = Some(now_ms());
    }

    /// Started and not yet stopped or failed
    pub fn is_active(&self) -> bool {
        self.error.is_none() && self.stopped_at.is_none()
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SampleId {
        SampleId::new("run", 1, 1)
    }

    #[test]
    fn test_new_invocation_is_active() {
        let inv = ToolInvocation::new("h1", "sar", &sample(), PathBuf::from("/tmp/sar"));
        assert!(inv.is_active());
        assert!(!inv.truncated);
        assert!(inv.stopped_at.is_none());
    }

    #[test]
    fn test_mark_stopped_graceful() {
        let mut inv = ToolInvocation::new("h1", "sar", &sample(), PathBuf::from("/tmp/sar"));
        inv.mark_running(Some(4242));
        inv.mark_stopped(Termination::Graceful, Some(0));
        assert_eq!(inv.pid, Some(4242));
        assert_eq!(inv.exit_code, Some(0));
        assert!(!inv.truncated);
        assert!(inv.started_at <= inv.stopped_at.unwrap());
    }

    #[test]
    fn test_mark_stopped_forced_is_truncated() {
        let mut inv = ToolInvocation::new("h1", "sar", &sample(), PathBuf::from("/tmp/sar"));
        inv.mark_stopped(Termination::Forced, Some(137));
        assert!(inv.truncated);
        assert!(!inv.is_active());
    }

    #[test]
    fn test_mark_failed() {
        let mut inv = ToolInvocation::new("h1", "iostat", &sample(), PathBuf::from("/tmp/iostat"));
        inv.mark_failed("Tool not installed");
        assert!(inv.is_failed());
        assert!(!inv.is_active());
    }

    #[test]
    fn test_termination_serde() {
        let json = serde_json::to_string(&Termination::AlreadyExited).unwrap();
        assert_eq!(json, "\"already-exited\"");
    }
}
