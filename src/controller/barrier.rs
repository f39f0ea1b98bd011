//! Fan-out barrier
//!
//! One task per host, joined with a deadline. The barrier releases when every
//! host has answered, when the deadline passes, or when an abort signal
//! fires; hosts still pending at that point are timed out or aborted and
//! their tasks cancelled.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::domain::{HostOutcome, Reachability, SampleId};
use crate::ipc::CommandKind;

/// What one host answered
#[derive(Debug, Clone, PartialEq)]
pub enum HostResult<T> {
    Ack(T),
    /// The Meister answered with an error, or the exchange broke
    Failed(String),
    Unreachable(String),
    TimedOut,
    Aborted,
}

impl<T> HostResult<T> {
    pub fn outcome(&self) -> HostOutcome {
        match self {
            Self::Ack(_) => HostOutcome::Acknowledged,
            Self::Failed(_) => HostOutcome::Failed,
            Self::Unreachable(_) => HostOutcome::Unreachable,
            Self::TimedOut => HostOutcome::TimedOut,
            Self::Aborted => HostOutcome::Aborted,
        }
    }

    pub fn ack(&self) -> Option<&T> {
        match self {
            Self::Ack(value) => Some(value),
            _ => None,
        }
    }

    /// Reachability learned from this dispatch, if any
    pub fn reachability(&self) -> Option<Reachability> {
        match self {
            Self::Ack(_) | Self::Failed(_) => Some(Reachability::Reachable),
            Self::Unreachable(_) | Self::TimedOut => Some(Reachability::Unreachable),
            Self::Aborted => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> HostResult<U> {
        match self {
            Self::Ack(value) => HostResult::Ack(f(value)),
            Self::Failed(e) => HostResult::Failed(e),
            Self::Unreachable(e) => HostResult::Unreachable(e),
            Self::TimedOut => HostResult::TimedOut,
            Self::Aborted => HostResult::Aborted,
        }
    }

    /// Human-readable reason for a non-ack
    pub fn reason(&self) -> Option<String> {
        match self {
            Self::Ack(_) => None,
            Self::Failed(e) => Some(format!("failed: {}", e)),
            Self::Unreachable(e) => Some(format!("unreachable: {}", e)),
            Self::TimedOut => Some("no acknowledgement before the deadline".to_string()),
            Self::Aborted => Some("aborted by stop".to_string()),
        }
    }
}

/// Identifies one barrier: a sample (or run, for run-level commands) and a command kind
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BarrierKey {
    pub scope: String,
    pub kind: CommandKind,
}

impl BarrierKey {
    pub fn for_sample(sample: &SampleId, kind: CommandKind) -> Self {
        Self {
            scope: sample.to_string(),
            kind,
        }
    }

    pub fn for_run(run: &str, kind: CommandKind) -> Self {
        Self {
            scope: run.to_string(),
            kind,
        }
    }
}

impl fmt::Display for BarrierKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.kind)
    }
}

#[derive(Debug)]
pub struct BarrierOutcome<T> {
    pub key: BarrierKey,
    pub results: BTreeMap<String, HostResult<T>>,
    pub elapsed: Duration,
}

impl<T> BarrierOutcome<T> {
    /// Hosts that count as failed, with the reason
    pub fn failures(&self) -> Vec<(String, String)> {
        self.results
            .iter()
            .filter(|(_, r)| r.outcome().is_failure())
            .filter_map(|(host, r)| r.reason().map(|reason| (host.clone(), reason)))
            .collect()
    }
}

/// Dispatch `f(host)` to every host concurrently and wait for the barrier
pub async fn fan_out<T, F, Fut>(
    key: BarrierKey,
    hosts: &[String],
    deadline: Duration,
    mut abort: Option<watch::Receiver<bool>>,
    f: F,
) -> BarrierOutcome<T>
where
    T: Send + 'static,
    F: Fn(String) -> Fut,
    Fut: Future<Output = HostResult<T>> + Send + 'static,
{
    let started = Instant::now();
    let mut tasks = JoinSet::new();
    let mut pending: BTreeSet<String> = BTreeSet::new();
    for host in hosts {
        if !pending.insert(host.clone()) {
            continue;
        }
        let fut = f(host.clone());
        let host = host.clone();
        tasks.spawn(async move { (host, fut.await) });
    }

    let mut results = BTreeMap::new();
    let mut aborted = false;
    let sleep = tokio::time::sleep(deadline);
    tokio::pin!(sleep);

    while !pending.is_empty() {
        tokio::select! {
            joined = tasks.join_next() => match joined {
                Some(Ok((host, result))) => {
                    pending.remove(&host);
                    results.insert(host, result);
                }
                Some(Err(e)) => log::error!("{}: dispatch task failed: {}", key, e),
                None => break,
            },
            _ = &mut sleep => {
                log::warn!("{}: deadline {:?} passed with {} host(s) pending", key, deadline, pending.len());
                break;
            }
            _ = wait_abort(&mut abort) => {
                log::warn!("{}: aborted with {} host(s) pending", key, pending.len());
                aborted = true;
                break;
            }
        }
    }
    tasks.abort_all();

    for host in pending {
        let result = if aborted { HostResult::Aborted } else { HostResult::TimedOut };
        results.insert(host, result);
    }

    let elapsed = started.elapsed();
    log::debug!("{}: barrier released after {:?}", key, elapsed);
    BarrierOutcome { key, results, elapsed }
}

async fn wait_abort(abort: &mut Option<watch::Receiver<bool>>) {
    let Some(rx) = abort else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone without aborting.
            return std::future::pending().await;
        }
    }
}
