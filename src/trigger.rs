//! Trigger evaluation over benchmark driver output
//!
//! The evaluator holds nothing but which boundary it is armed for, so a
//! consumer can be restarted on a new stream without losing its place.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::Result;

/// How trigger patterns are matched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    #[default]
    Substring,
    Regex,
}

/// Start/stop pattern pair registered for a tool group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub start: String,
    pub stop: String,
    #[serde(default)]
    pub mode: TriggerMode,
}

impl Trigger {
    pub fn new(start: impl Into<String>, stop: impl Into<String>, mode: TriggerMode) -> Self {
        Self {
            start: start.into(),
            stop: stop.into(),
            mode,
        }
    }
}

/// A compiled pattern
#[derive(Debug, Clone)]
pub enum Pattern {
    Substring(String),
    Regex(Regex),
}

impl Pattern {
    pub fn compile(text: &str, mode: TriggerMode) -> Result<Self> {
        Ok(match mode {
            TriggerMode::Substring => Self::Substring(text.to_string()),
            TriggerMode::Regex => Self::Regex(Regex::new(text)?),
        })
    }

    pub fn is_match(&self, line: &str) -> bool {
        match self {
            Self::Substring(s) => line.contains(s.as_str()),
            Self::Regex(re) => re.is_match(line),
        }
    }
}

/// Which boundary the evaluator will act on next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Armed {
    ForStart,
    ForStop,
}

/// Command issued by a matching line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerAction {
    Start,
    Stop,
}

#[derive(Debug, Clone)]
pub struct TriggerEvaluator {
    start: Pattern,
    stop: Pattern,
    armed: Armed,
}

impl TriggerEvaluator {
    pub fn new(trigger: &Trigger) -> Result<Self> {
        Ok(Self {
            start: Pattern::compile(&trigger.start, trigger.mode)?,
            stop: Pattern::compile(&trigger.stop, trigger.mode)?,
            armed: Armed::ForStart,
        })
    }

    /// Resume in a known state, e.g. after a restart mid-sample
    pub fn with_armed(mut self, armed: Armed) -> Self {
        self.armed = armed;
        self
    }

    pub fn armed(&self) -> Armed {
        self.armed
    }

    /// Evaluate one line
    ///
    /// The start pattern is tried first; the first pattern that matches decides
    /// the line. A match only acts when the evaluator is armed for it, which
    /// collapses repeated hits into one sample boundary.
    pub fn feed(&mut self, line: &str) -> Option<TriggerAction> {
        let hit = if self.start.is_match(line) {
            TriggerAction::Start
        } else if self.stop.is_match(line) {
            TriggerAction::Stop
        } else {
            return None;
        };

        match (hit, self.armed) {
            (TriggerAction::Start, Armed::ForStart) => {
                self.armed = Armed::ForStop;
                Some(TriggerAction::Start)
            }
            (TriggerAction::Stop, Armed::ForStop) => {
                self.armed = Armed::ForStart;
                Some(TriggerAction::Stop)
            }
            _ => None,
        }
    }
}

/// Receiver of trigger commands
#[async_trait]
pub trait TriggerSink: Send {
    async fn start(&mut self, sample: u32) -> Result<()>;
    async fn stop(&mut self, sample: u32) -> Result<()>;
}

/// Where a trigger stream ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerSummary {
    pub lines: usize,
    pub started: u32,
    pub stopped: u32,
    pub armed: Armed,
    /// Next sample number that a start would use
    pub next_sample: u32,
}

/// Feed a line stream through the evaluator into a sink
///
/// Sample numbers count up from `first_sample`; a stop applies to the sample
/// most recently started.
pub async fn drive<R, S>(
    evaluator: &mut TriggerEvaluator,
    reader: R,
    sink: &mut S,
    first_sample: u32,
) -> Result<TriggerSummary>
where
    R: AsyncBufRead + Unpin,
    S: TriggerSink + ?Sized,
{
    let mut lines = reader.lines();
    let mut summary = TriggerSummary {
        lines: 0,
        started: 0,
        stopped: 0,
        armed: evaluator.armed(),
        next_sample: first_sample,
    };
    // A resumed evaluator armed for stop owns the sample before `first_sample`.
    let mut current = if evaluator.armed() == Armed::ForStop {
        first_sample.saturating_sub(1).max(1)
    } else {
        first_sample
    };

    while let Some(line) = lines.next_line().await? {
        summary.lines += 1;
        match evaluator.feed(&line) {
            Some(TriggerAction::Start) => {
                current = summary.next_sample;
                log::info!("trigger start matched, sample {}: {}", current, line.trim());
                sink.start(current).await?;
                summary.started += 1;
                summary.next_sample = current + 1;
            }
            Some(TriggerAction::Stop) => {
                log::info!("trigger stop matched, sample {}: {}", current, line.trim());
                sink.stop(current).await?;
                summary.stopped += 1;
            }
            None => {}
        }
    }

    summary.armed = evaluator.armed();
    Ok(summary)
}
