//! ID generation utilities
//!
//! Run directory names and controller instance identifiers.

use chrono::{DateTime, Utc};
use rand::Rng;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Generate a run ID from a prefix and a point in time
///
/// Format: `{prefix}_{YYYY.MM.DD}T{HH.MM.SS}`
/// Example: `default_2026.10.15T09.30.00`
pub fn run_id_at(prefix: &str, at: DateTime<Utc>) -> String {
    format!("{}_{}", prefix, at.format("%Y.%m.%dT%H.%M.%S"))
}

/// Generate a run ID for a run starting now
pub fn generate_run_id(prefix: &str) -> String {
    run_id_at(prefix, Utc::now())
}

/// Generate a random instance identifier in UUID text form
///
/// Every controller start gets one so tool meisters can tell runs apart.
pub fn generate_instance_id() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    let hex = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}
