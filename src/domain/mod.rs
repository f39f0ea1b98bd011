//! Domain types for toolmeister
//!
//! - RunRecord: one benchmark execution, its hosts and recorded errors
//! - SampleRecord: per-sample controller state and per-host outcomes
//! - ToolInvocation: one (host, tool, sample) execution
//! - Reachability: last known host state

pub mod host;
pub mod invocation;
pub mod run;
pub mod sample;

pub use host::Reachability;
pub use invocation::{Termination, ToolInvocation};
pub use run::{ErrorKind, RecordedError, RunRecord, RunStatus};
pub use sample::{HostOutcome, HostSampleStatus, SampleId, SampleRecord, SampleState};
