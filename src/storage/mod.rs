//! Controller state persistence
//!
//! Run and sample records are kept as JSONL collections so a controller
//! process can be restarted between start-tools and stop-tools.

pub mod jsonl;
pub mod traits;

pub use jsonl::JsonlStorage;
pub use traits::{Filter, FilterOp, HasId, Storage};

/// Collection holding `RunRecord`s
pub const RUNS: &str = "runs";

/// Collection holding `SampleRecord`s
pub const SAMPLES: &str = "samples";
