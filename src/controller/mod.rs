//! Controller
//!
//! Drives a run across hosts. Every command fans out to the run's hosts and
//! waits on a barrier bounded by the command's deadline; hosts that miss it
//! are marked degraded for the sample and the run carries on without them.
//! Run and Sample records are written from barrier resolution only, apart
//! from the STARTING/STOPPING marks that let another controller process see a
//! command is in flight.

pub mod barrier;
mod sink;
pub mod transport;

pub use barrier::{BarrierKey, BarrierOutcome, HostResult, fan_out};
pub use sink::ControllerSink;
pub use transport::{InProcessTransport, MeisterTransport, TcpTransport};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, watch};

use crate::assembler::{AssemblyReport, ResultAssembler};
use crate::config::{Config, ControllerConfig};
use crate::domain::{
    ErrorKind, HostOutcome, RecordedError, RunRecord, RunStatus, SampleId, SampleRecord, SampleState,
};
use crate::error::{Result, ToolMeisterError};
use crate::ipc::{
    Acknowledgement, CollectedFiles, Command, CommandKind, OutcomeKind, StatusReport, SysinfoDump, SysinfoPhase,
};
use crate::registry::{ToolRegistry, validate_name};
use crate::storage::{Filter, JsonlStorage, RUNS, SAMPLES, Storage};
use crate::tools::{ToolCatalog, ToolSpec};
use crate::trigger::{Trigger, TriggerEvaluator};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

pub const METADATA_FILE: &str = "metadata.log";

/// Outcome of one fanned-out command
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReport {
    pub kind: CommandKind,
    /// Sample display id, or the run id for run-level commands
    pub scope: String,
    pub hosts: BTreeMap<String, HostOutcome>,
    /// Host and reason for every host that counts as failed
    pub failed_hosts: Vec<(String, String)>,
    /// Non-fatal errors recorded while resolving the barrier
    pub errors: Vec<RecordedError>,
    pub state: Option<SampleState>,
    pub elapsed: Duration,
}

impl CommandReport {
    fn empty(kind: CommandKind, scope: impl Into<String>, state: Option<SampleState>) -> Self {
        Self {
            kind,
            scope: scope.into(),
            hosts: BTreeMap::new(),
            failed_hosts: Vec::new(),
            errors: Vec::new(),
            state,
            elapsed: Duration::ZERO,
        }
    }

    fn from_outcome<T>(outcome: &BarrierOutcome<T>) -> Self {
        Self {
            kind: outcome.key.kind,
            scope: outcome.key.scope.clone(),
            hosts: outcome.results.iter().map(|(h, r)| (h.clone(), r.outcome())).collect(),
            failed_hosts: outcome.failures(),
            errors: Vec::new(),
            state: None,
            elapsed: outcome.elapsed,
        }
    }

    /// At least one host failed
    pub fn is_partial(&self) -> bool {
        !self.failed_hosts.is_empty()
    }

    /// `<N> host(s) failed: h2 (unreachable: ...), ...`
    pub fn failure_summary(&self) -> Option<String> {
        if self.failed_hosts.is_empty() {
            return None;
        }
        let details: Vec<String> = self
            .failed_hosts
            .iter()
            .map(|(host, reason)| format!("{} ({})", host, reason))
            .collect();
        Some(format!("{} host(s) failed: {}", self.failed_hosts.len(), details.join(", ")))
    }
}

impl fmt::Display for CommandReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {} host(s)", self.kind, self.scope, self.hosts.len())?;
        if let Some(state) = self.state {
            write!(f, ", sample {}", state)?;
        }
        write!(f, " in {:.1}s", self.elapsed.as_secs_f64())
    }
}

/// COLLECT fan-out followed by assembly
#[derive(Debug, Clone, PartialEq)]
pub struct CollectReport {
    pub command: CommandReport,
    pub assembly: AssemblyReport,
}

#[derive(Debug, Serialize)]
struct HostMetadata {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    tools: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Serialize)]
struct RunMetadata {
    run: String,
    group: String,
    instance: String,
    controller: String,
    created: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    benchmark: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    date: Option<String>,
    hosts: Vec<HostMetadata>,
}

struct InFlight {
    abort: watch::Sender<bool>,
    done: watch::Receiver<bool>,
}

pub struct Controller {
    registry: ToolRegistry,
    catalog: ToolCatalog,
    store: JsonlStorage,
    transport: Arc<dyn MeisterTransport>,
    assembler: ResultAssembler,
    config: ControllerConfig,
    inflight: Mutex<HashMap<SampleId, InFlight>>,
}

impl Controller {
    pub fn new(
        registry: ToolRegistry,
        catalog: ToolCatalog,
        store: JsonlStorage,
        transport: Arc<dyn MeisterTransport>,
        results_dir: impl Into<PathBuf>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            registry,
            catalog,
            store,
            transport,
            assembler: ResultAssembler::new(results_dir),
            config,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Build a TCP controller from configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut catalog = ToolCatalog::builtin();
        if let Some(path) = &config.catalog {
            catalog = catalog.merge(ToolCatalog::from_file(path)?);
        }
        fs::create_dir_all(&config.results_dir)?;
        Ok(Self::new(
            ToolRegistry::new(&config.registry_dir)?,
            catalog,
            JsonlStorage::new(config.state_dir())?,
            Arc::new(TcpTransport::new(config.controller.clone())),
            &config.results_dir,
            config.controller.clone(),
        ))
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    pub fn assembler(&self) -> &ResultAssembler {
        &self.assembler
    }

    // Registration

    /// Bind a catalog tool to a host in a group
    pub fn register_tool(
        &self,
        group: &str,
        host: &str,
        tool: &str,
        params: &BTreeMap<String, String>,
        force: bool,
        label: Option<&str>,
    ) -> Result<()> {
        if self.catalog.get(tool).is_none() {
            return Err(ToolMeisterError::NotFound(format!("tool {} is not in the catalog", tool)));
        }
        self.ensure_group_idle(group)?;
        self.registry.register(group, host, tool, params, force)?;
        if let Some(label) = label {
            self.registry.set_label(group, host, label)?;
        }
        log::info!("registered {} on {} in group {}", tool, host, group);
        Ok(())
    }

    pub fn unregister_tool(&self, group: &str, host: &str, tool: &str) -> Result<()> {
        self.ensure_group_idle(group)?;
        self.registry.unregister(group, host, tool)
    }

    /// Delete a group that no active run uses
    pub fn delete_group(&self, group: &str) -> Result<()> {
        self.ensure_group_idle(group)?;
        let active: Vec<String> = self.active_runs()?.into_iter().map(|r| r.group).collect();
        self.registry.delete_group(group, &active)
    }

    /// Store a trigger after checking that its patterns compile
    pub fn set_trigger(&self, group: &str, trigger: &Trigger) -> Result<()> {
        TriggerEvaluator::new(trigger)?;
        self.registry.set_trigger(group, trigger)
    }

    // Records

    pub fn run_record(&self, run: &str) -> Result<Option<RunRecord>> {
        self.store.reload(RUNS)?;
        self.store.get(RUNS, run)
    }

    pub fn sample_record(&self, sample: &SampleId) -> Result<Option<SampleRecord>> {
        self.store.reload(SAMPLES)?;
        self.store.get(SAMPLES, &sample.to_string())
    }

    pub fn samples_of(&self, run: &str) -> Result<Vec<SampleRecord>> {
        self.store.reload(SAMPLES)?;
        let mut samples: Vec<SampleRecord> = self.store.list(SAMPLES)?;
        samples.retain(|s| s.sample.run == run);
        samples.sort_by(|a, b| a.sample.cmp(&b.sample));
        Ok(samples)
    }

    fn active_runs(&self) -> Result<Vec<RunRecord>> {
        self.store.reload(RUNS)?;
        self.store.query(RUNS, &[Filter::eq("status", RunStatus::Active)])
    }

    fn require_run(&self, run: &str) -> Result<RunRecord> {
        self.run_record(run)?
            .ok_or_else(|| ToolMeisterError::NotFound(format!("run {}", run)))
    }

    fn require_sample(&self, sample: &SampleId) -> Result<SampleRecord> {
        self.sample_record(sample)?
            .ok_or_else(|| ToolMeisterError::NotFound(format!("sample {}", sample)))
    }

    /// `RunInProgress` when any sample of the group is starting or stopping
    fn ensure_group_idle(&self, group: &str) -> Result<()> {
        self.store.reload(SAMPLES)?;
        let samples: Vec<SampleRecord> = self.store.query(SAMPLES, &[Filter::eq("group", group)])?;
        match samples.iter().find(|s| s.state.is_in_flight()) {
            Some(s) => Err(ToolMeisterError::RunInProgress(format!(
                "sample {} of group {} is {}",
                s.sample, group, s.state
            ))),
            None => Ok(()),
        }
    }

    /// `RunInProgress` when a sample of the run other than `except` is in flight
    fn ensure_run_idle(&self, run: &str, except: Option<&SampleId>) -> Result<()> {
        let busy = self
            .samples_of(run)?
            .into_iter()
            .find(|s| s.state.is_in_flight() && Some(&s.sample) != except);
        match busy {
            Some(s) => Err(ToolMeisterError::RunInProgress(format!(
                "sample {} of run {} is {}",
                s.sample, run, s.state
            ))),
            None => Ok(()),
        }
    }

    // Run lifecycle

    /// Begin a run: register tools on every host, archive the group, write metadata
    pub async fn begin_run(&self, run: &str, group: &str) -> Result<CommandReport> {
        validate_name("run", run)?;
        if self.run_record(run)?.is_some() {
            return Err(ToolMeisterError::InvalidState(format!("run {} already exists", run)));
        }

        let bindings = self.registry.list_group(group)?;
        let hosts = self.registry.hosts(group)?;
        if hosts.is_empty() {
            return Err(ToolMeisterError::InvalidState(format!("group {} has no tools registered", group)));
        }

        let mut per_host: BTreeMap<String, Vec<ToolSpec>> = BTreeMap::new();
        for binding in &bindings {
            let spec = self.catalog.resolve(&binding.tool, &binding.params)?;
            per_host.entry(binding.host.clone()).or_default().push(spec);
        }

        let run_dir = self.assembler.run_dir(run);
        fs::create_dir_all(&run_dir)?;
        self.registry.archive(group, &run_dir)?;

        let mut record = RunRecord::new(run, group, hosts.clone());
        log::info!("beginning run {} with group {} on {} host(s)", run, group, hosts.len());

        let per_host = Arc::new(per_host);
        let transport = Arc::clone(&self.transport);
        let group_name = group.to_string();
        let outcome = fan_out(
            BarrierKey::for_run(run, CommandKind::Register),
            &hosts,
            self.config.register_timeout(),
            None,
            move |host| {
                let command = Command::Register {
                    group: group_name.clone(),
                    tools: per_host.get(&host).cloned().unwrap_or_default(),
                };
                let transport = Arc::clone(&transport);
                async move { dispatch::<Acknowledgement>(transport.as_ref(), &host, command).await }
            },
        )
        .await;

        let mut report = CommandReport::from_outcome(&outcome);
        for (host, result) in &outcome.results {
            if let Some(reachability) = result.reachability() {
                record.set_reachability(host, reachability);
            }
            match result {
                HostResult::Ack(ack) => {
                    for tool in ack.failures() {
                        let error = RecordedError::new(
                            ErrorKind::ToolStartup,
                            tool.error.clone().unwrap_or_else(|| "install check failed".to_string()),
                        )
                        .host(host)
                        .tool(&tool.tool);
                        report.errors.push(error.clone());
                        record.record_error(error);
                    }
                }
                other => {
                    let error = host_error(host, other, None);
                    report.errors.push(error.clone());
                    record.record_error(error);
                }
            }
        }

        // Only hosts that took the registration are asked for sysinfo.
        record.sysinfo = self.config.sysinfo.clone();
        let registered: Vec<String> = outcome
            .results
            .iter()
            .filter(|(_, result)| result.ack().is_some())
            .map(|(host, _)| host.clone())
            .collect();
        for error in self
            .collect_sysinfo(run, SysinfoPhase::Beg, &registered, &record.sysinfo)
            .await?
        {
            report.errors.push(error.clone());
            record.record_error(error);
        }

        self.write_metadata(&record, &bindings)?;
        self.store.create(RUNS, &record)?;
        Ok(report)
    }

    /// Gather system information from `hosts` into `<run>/sysinfo/<phase>/<host>/`
    ///
    /// Hosts that miss the deadline or fail an item are recorded as partial
    /// results and never fail the run.
    async fn collect_sysinfo(
        &self,
        run: &str,
        phase: SysinfoPhase,
        hosts: &[String],
        items: &[String],
    ) -> Result<Vec<RecordedError>> {
        if items.is_empty() || hosts.is_empty() {
            return Ok(Vec::new());
        }

        let transport = Arc::clone(&self.transport);
        let run_name = run.to_string();
        let wanted = items.to_vec();
        let outcome = fan_out(
            BarrierKey::for_run(run, CommandKind::Sysinfo),
            hosts,
            self.config.collect_timeout(),
            None,
            move |host| {
                let transport = Arc::clone(&transport);
                let command = Command::Sysinfo {
                    run: run_name.clone(),
                    phase,
                    items: wanted.clone(),
                };
                async move { dispatch::<SysinfoDump>(transport.as_ref(), &host, command).await }
            },
        )
        .await;

        let phase_dir = phase.as_str();
        let mut errors = Vec::new();
        for (host, result) in &outcome.results {
            self.assembler.clear_sysinfo(run, phase_dir, host)?;
            let dump = match result {
                HostResult::Ack(dump) => dump,
                other => {
                    errors.push(
                        RecordedError::new(
                            ErrorKind::PartialResult,
                            format!("no {} sysinfo: {}", phase_dir, other.reason().unwrap_or_default()),
                        )
                        .host(host),
                    );
                    continue;
                }
            };
            for file in &dump.files {
                let staged = STANDARD
                    .decode(&file.data)
                    .map_err(|e| format!("bad file data: {}", e))
                    .and_then(|data| {
                        self.assembler
                            .stage_sysinfo(run, phase_dir, host, &file.path, &data)
                            .map_err(|e| e.to_string())
                    });
                if let Err(reason) = staged {
                    errors.push(
                        RecordedError::new(ErrorKind::PartialResult, format!("sysinfo {}: {}", file.path, reason))
                            .host(host),
                    );
                }
            }
            for (item, reason) in &dump.failed {
                errors.push(
                    RecordedError::new(ErrorKind::PartialResult, format!("sysinfo {}: {}", item, reason)).host(host),
                );
            }
        }
        log::info!(
            "run {}: {} sysinfo from {} host(s), {} gap(s)",
            run,
            phase_dir,
            outcome.results.len(),
            errors.len()
        );
        Ok(errors)
    }

    fn write_metadata(&self, record: &RunRecord, bindings: &[crate::registry::Binding]) -> Result<()> {
        let mut hosts = Vec::new();
        for host in &record.hosts {
            let tools = bindings
                .iter()
                .filter(|b| &b.host == host)
                .map(|b| (b.tool.clone(), b.params.clone()))
                .collect();
            hosts.push(HostMetadata {
                name: host.clone(),
                label: self.registry.label(&record.group, host)?,
                tools,
            });
        }

        let controller = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        let metadata = RunMetadata {
            run: record.id.clone(),
            group: record.group.clone(),
            instance: record.instance.clone(),
            controller,
            created: chrono::Utc::now().to_rfc3339(),
            benchmark: std::env::var("benchmark").ok(),
            config: std::env::var("config").ok(),
            date: std::env::var("date").ok(),
            hosts,
        };
        let path = self.assembler.run_dir(&record.id).join(METADATA_FILE);
        fs::write(&path, serde_yaml::to_string(&metadata)?)?;
        Ok(())
    }

    /// Finish a run, stopping samples still running and optionally terminating meisters
    pub async fn end_run(&self, run: &str, terminate: bool) -> Result<CommandReport> {
        let record = self.require_run(run)?;
        self.ensure_run_idle(run, None)?;

        for sample in self.samples_of(run)? {
            if sample.state == SampleState::ToolsRunning {
                log::warn!("run {} ending with sample {} running, stopping it", run, sample.sample);
                self.stop_sample(&sample.sample).await?;
            }
        }

        let sysinfo_errors = self
            .collect_sysinfo(run, SysinfoPhase::End, &record.hosts, &record.sysinfo)
            .await?;

        let mut report = CommandReport::empty(CommandKind::Terminate, run, None);
        let mut record = record;
        if terminate {
            let outcome = self.terminate_hosts(run, &record.hosts).await;
            report = CommandReport::from_outcome(&outcome);
            for (host, result) in &outcome.results {
                if let Some(reachability) = result.reachability() {
                    record.set_reachability(host, reachability);
                }
            }
        }

        // Re-read so errors recorded by the sample stops are kept.
        let mut latest = self.require_run(run)?;
        latest.reachability = record.reachability;
        for error in sysinfo_errors {
            report.errors.push(error.clone());
            latest.record_error(error);
        }
        latest.mark_finished();
        self.store.update(RUNS, &latest)?;
        log::info!("run {} finished with {} recorded error(s)", run, latest.errors.len());
        Ok(report)
    }

    // Samples

    /// START barrier for a sample; begins the run on first use
    pub async fn start_sample(&self, group: &str, sample: &SampleId) -> Result<CommandReport> {
        let run = match self.run_record(&sample.run)? {
            Some(run) => run,
            None => {
                self.begin_run(&sample.run, group).await?;
                self.require_run(&sample.run)?
            }
        };
        if run.group != group {
            return Err(ToolMeisterError::InvalidState(format!(
                "run {} uses group {}, not {}",
                run.id, run.group, group
            )));
        }
        if run.status.is_terminal() {
            return Err(ToolMeisterError::InvalidState(format!("run {} is finished", run.id)));
        }
        self.ensure_run_idle(&run.id, None)?;
        if let Some(existing) = self.sample_record(sample)? {
            if existing.state != SampleState::Created {
                return Err(ToolMeisterError::InvalidState(format!(
                    "sample {} is already {}",
                    sample, existing.state
                )));
            }
        }

        let mut record = SampleRecord::new(sample.clone(), group, &run.hosts);
        record.set_state(SampleState::ToolsStarting);
        self.store.upsert(SAMPLES, &record)?;

        let (abort_tx, abort_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        self.inflight.lock().await.insert(
            sample.clone(),
            InFlight {
                abort: abort_tx,
                done: done_rx,
            },
        );

        let result = self.run_start_barrier(&run, sample, abort_rx).await;

        self.inflight.lock().await.remove(sample);
        let _ = done_tx.send(true);
        result
    }

    async fn run_start_barrier(
        &self,
        run: &RunRecord,
        sample: &SampleId,
        abort: watch::Receiver<bool>,
    ) -> Result<CommandReport> {
        let transport = Arc::clone(&self.transport);
        let command_sample = sample.clone();
        let group = run.group.clone();
        let outcome = fan_out(
            BarrierKey::for_sample(sample, CommandKind::Start),
            &run.hosts,
            self.config.start_timeout(),
            Some(abort),
            move |host| {
                let transport = Arc::clone(&transport);
                let command = Command::Start {
                    sample: command_sample.clone(),
                    group: group.clone(),
                };
                async move { dispatch::<Acknowledgement>(transport.as_ref(), &host, command).await }
            },
        )
        .await;

        self.resolve(sample, &outcome, |record, run, report| {
            for (host, result) in &outcome.results {
                let status = record.host_mut(host);
                status.start = Some(result.outcome());
                if result.outcome().is_failure() {
                    status.degraded = true;
                }
                if let HostResult::Ack(ack) = result {
                    for tool in &ack.tools {
                        if let Some(invocation) = &tool.invocation {
                            status.upsert_invocation(invocation.clone());
                        }
                        if tool.outcome.is_failure() {
                            let error = RecordedError::new(
                                ErrorKind::ToolStartup,
                                tool.error.clone().unwrap_or_else(|| format!("{:?}", tool.outcome)),
                            )
                            .host(host)
                            .tool(&tool.tool)
                            .sample(sample);
                            report.errors.push(error.clone());
                            run.record_error(error);
                        }
                    }
                }
            }
            // A stop from another process may already have moved the sample on.
            if record.state == SampleState::ToolsStarting {
                record.set_state(SampleState::ToolsRunning);
            }
        })
    }

    /// STOP barrier for a sample, sent to every host of the run
    ///
    /// A start still waiting on its barrier in this process is aborted first.
    pub async fn stop_sample(&self, sample: &SampleId) -> Result<CommandReport> {
        let pending = {
            let inflight = self.inflight.lock().await;
            inflight.get(sample).map(|f| {
                let _ = f.abort.send(true);
                f.done.clone()
            })
        };
        if let Some(mut done) = pending {
            log::info!("stop for {} aborts its pending start", sample);
            while !*done.borrow_and_update() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        }

        let run = self.require_run(&sample.run)?;
        let mut record = self.require_sample(sample)?;
        match record.state {
            SampleState::ToolsRunning | SampleState::Created => {}
            SampleState::ToolsStarting => {
                log::warn!("stopping {} while another controller is still starting it", sample);
            }
            SampleState::ToolsStopping => {
                return Err(ToolMeisterError::RunInProgress(format!("sample {} is already stopping", sample)));
            }
            SampleState::ToolsStopped | SampleState::Collected => {
                log::info!("sample {} already stopped", sample);
                return Ok(CommandReport::empty(CommandKind::Stop, sample.to_string(), Some(record.state)));
            }
        }
        self.ensure_run_idle(&run.id, Some(sample))?;

        record.set_state(SampleState::ToolsStopping);
        self.store.upsert(SAMPLES, &record)?;

        let transport = Arc::clone(&self.transport);
        let command_sample = sample.clone();
        let outcome = fan_out(
            BarrierKey::for_sample(sample, CommandKind::Stop),
            &run.hosts,
            self.config.stop_timeout(),
            None,
            move |host| {
                let transport = Arc::clone(&transport);
                let command = Command::Stop {
                    sample: command_sample.clone(),
                };
                async move { dispatch::<Acknowledgement>(transport.as_ref(), &host, command).await }
            },
        )
        .await;

        self.resolve(sample, &outcome, |record, run, report| {
            for (host, result) in &outcome.results {
                let status = record.host_mut(host);
                status.stop = Some(result.outcome());
                if result.outcome().is_failure() {
                    status.degraded = true;
                }
                if let HostResult::Ack(ack) = result {
                    for tool in &ack.tools {
                        if let Some(invocation) = &tool.invocation {
                            status.upsert_invocation(invocation.clone());
                        }
                        if tool.outcome == OutcomeKind::Forced {
                            let error = RecordedError::new(
                                ErrorKind::ToolTerminationTimeout,
                                "killed after the grace period, output truncated",
                            )
                            .host(host)
                            .tool(&tool.tool)
                            .sample(sample);
                            report.errors.push(error.clone());
                            run.record_error(error);
                        }
                    }
                }
            }
            record.set_state(SampleState::ToolsStopped);
        })
    }

    /// Barrier resolution: the only place sample and run records are updated
    fn resolve<T, F>(&self, sample: &SampleId, outcome: &BarrierOutcome<T>, apply: F) -> Result<CommandReport>
    where
        F: FnOnce(&mut SampleRecord, &mut RunRecord, &mut CommandReport),
    {
        let mut record = self.require_sample(sample)?;
        let mut run = self.require_run(&sample.run)?;
        let mut report = CommandReport::from_outcome(outcome);

        for (host, result) in &outcome.results {
            if let Some(reachability) = result.reachability() {
                record.host_mut(host).reachability = reachability;
                run.set_reachability(host, reachability);
            }
            if result.outcome().is_failure() {
                let error = host_error(host, result, Some(sample));
                report.errors.push(error.clone());
                run.record_error(error);
            }
        }

        apply(&mut record, &mut run, &mut report);
        report.state = Some(record.state);

        self.store.update(SAMPLES, &record)?;
        self.store.update(RUNS, &run)?;
        log::info!("{}", report);
        Ok(report)
    }

    /// COLLECT output from every host into staging, then assemble the sample
    pub async fn collect_sample(&self, sample: &SampleId) -> Result<CollectReport> {
        let run = self.require_run(&sample.run)?;
        let record = self.require_sample(sample)?;
        match record.state {
            SampleState::Collected => {
                return Ok(CollectReport {
                    command: CommandReport::empty(CommandKind::Collect, sample.to_string(), Some(record.state)),
                    assembly: AssemblyReport {
                        noop: true,
                        ..Default::default()
                    },
                });
            }
            SampleState::ToolsStopped => {}
            other => {
                return Err(ToolMeisterError::InvalidState(format!(
                    "sample {} is {}, stop it before collecting",
                    sample, other
                )));
            }
        }

        let transport = Arc::clone(&self.transport);
        let assembler = self.assembler.clone();
        let command_sample = sample.clone();
        let outcome = fan_out(
            BarrierKey::for_sample(sample, CommandKind::Collect),
            &run.hosts,
            self.config.collect_timeout(),
            None,
            move |host| collect_host(Arc::clone(&transport), assembler.clone(), host, command_sample.clone()),
        )
        .await;

        let mut gaps = Vec::new();
        for (host, result) in &outcome.results {
            match result {
                HostResult::Ack(StagedHost { gap: Some(gap), .. }) => gaps.push(
                    RecordedError::new(ErrorKind::PartialResult, gap.clone())
                        .host(host)
                        .sample(sample),
                ),
                HostResult::Ack(_) => {}
                // A cancelled transfer may have left a partial file behind.
                _ => self.assembler.clear_staged(sample, host)?,
            }
        }

        // Bindings as archived when the run began.
        let archived = ToolRegistry::new(self.assembler.run_dir(&run.id))?;
        let bindings = archived.list_group(&run.group)?;

        let mut assembly = AssemblyReport::default();
        let command = self.resolve(sample, &outcome, |record, run, report| {
            for (host, result) in &outcome.results {
                record.host_mut(host).collect = Some(result.outcome());
            }
            for gap in gaps {
                report.errors.push(gap.clone());
                run.record_error(gap);
            }
            match self.assembler.assemble(record, &bindings) {
                Ok(done) => {
                    for error in &done.partial {
                        run.record_error(error.clone());
                    }
                    report.errors.extend(done.partial.iter().cloned());
                    assembly = done;
                }
                Err(e) => {
                    log::error!("assembly of {} failed: {}", sample, e);
                    let error = RecordedError::new(ErrorKind::PartialResult, format!("assembly failed: {}", e))
                        .sample(sample);
                    report.errors.push(error.clone());
                    run.record_error(error);
                }
            }
        })?;

        Ok(CollectReport { command, assembly })
    }

    /// Assemble a stopped sample from what is already staged
    pub fn assemble_sample(&self, sample: &SampleId) -> Result<AssemblyReport> {
        let run = self.require_run(&sample.run)?;
        let mut record = self.require_sample(sample)?;
        let archived = ToolRegistry::new(self.assembler.run_dir(&run.id))?;
        let bindings = archived.list_group(&run.group)?;

        let assembly = self.assembler.assemble(&mut record, &bindings)?;
        if !assembly.noop {
            let mut run = run;
            for error in &assembly.partial {
                run.record_error(error.clone());
            }
            self.store.update(SAMPLES, &record)?;
            self.store.update(RUNS, &run)?;
        }
        Ok(assembly)
    }

    /// TERMINATE every Meister of a group outside of any run
    pub async fn terminate(&self, group: &str) -> Result<CommandReport> {
        self.ensure_group_idle(group)?;
        let hosts = self.registry.hosts(group)?;
        let outcome = self.terminate_hosts(group, &hosts).await;
        Ok(CommandReport::from_outcome(&outcome))
    }

    async fn terminate_hosts(&self, scope: &str, hosts: &[String]) -> BarrierOutcome<Acknowledgement> {
        let transport = Arc::clone(&self.transport);
        fan_out(
            BarrierKey::for_run(scope, CommandKind::Terminate),
            hosts,
            self.config.stop_timeout(),
            None,
            move |host| {
                let transport = Arc::clone(&transport);
                async move { dispatch::<Acknowledgement>(transport.as_ref(), &host, Command::Terminate).await }
            },
        )
        .await
    }

    /// STATUS fan-out to every host of a group
    pub async fn status(&self, group: &str) -> Result<BarrierOutcome<StatusReport>> {
        let hosts = self.registry.hosts(group)?;
        let transport = Arc::clone(&self.transport);
        Ok(fan_out(
            BarrierKey::for_run(group, CommandKind::Status),
            &hosts,
            self.config.status_timeout(),
            None,
            move |host| {
                let transport = Arc::clone(&transport);
                async move { dispatch::<StatusReport>(transport.as_ref(), &host, Command::Status).await }
            },
        )
        .await)
    }
}

/// What one host's COLLECT left in staging
#[derive(Debug, Default)]
struct StagedHost {
    chunks: usize,
    /// Why the host's output was dropped from staging
    gap: Option<String>,
}

/// Page through one host's output into staging
///
/// Data that cannot be decoded or staged drops the host's staging and is
/// reported as a gap so the other hosts still assemble.
async fn collect_host(
    transport: Arc<dyn MeisterTransport>,
    assembler: ResultAssembler,
    host: String,
    sample: SampleId,
) -> HostResult<StagedHost> {
    let dropped = |gap: String| {
        log::warn!("{}: dropping collected output for {}: {}", host, sample, gap);
        if let Err(e) = assembler.clear_staged(&sample, &host) {
            log::error!("{}: cannot clear staging for {}: {}", host, sample, e);
        }
        HostResult::Ack(StagedHost {
            chunks: 0,
            gap: Some(gap),
        })
    };
    if let Err(e) = assembler.clear_staged(&sample, &host) {
        return dropped(format!("cannot clear staging: {}", e));
    }

    let mut staged = StagedHost::default();
    let mut cursor = None;
    loop {
        let command = Command::Collect {
            sample: sample.clone(),
            cursor,
        };
        let page = match dispatch::<CollectedFiles>(transport.as_ref(), &host, command).await {
            HostResult::Ack(page) => page,
            other => {
                if let Err(e) = assembler.clear_staged(&sample, &host) {
                    log::error!("{}: cannot clear staging for {}: {}", host, sample, e);
                }
                return other.map(|_| StagedHost::default());
            }
        };

        for file in &page.files {
            let data = match STANDARD.decode(&file.data) {
                Ok(data) => data,
                Err(e) => return dropped(format!("bad file data for {}: {}", file.path, e)),
            };
            if let Err(e) = assembler.stage_file(&sample, &host, &file.path, file.offset, &data) {
                return dropped(e.to_string());
            }
            staged.chunks += 1;
        }

        match page.next {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    log::debug!("{}: staged {} chunk(s) for {}", host, staged.chunks, sample);
    HostResult::Ack(staged)
}

/// Send one command and classify the answer
async fn dispatch<T: DeserializeOwned>(transport: &dyn MeisterTransport, host: &str, command: Command) -> HostResult<T> {
    match transport.send(host, command).await {
        Ok(response) => match response.into_result::<T>() {
            Ok(payload) => HostResult::Ack(payload),
            Err(e) => HostResult::Failed(e.to_string()),
        },
        Err(ToolMeisterError::HostUnreachable { detail, .. }) => HostResult::Unreachable(detail),
        Err(e) => HostResult::Failed(e.to_string()),
    }
}

fn host_error<T>(host: &str, result: &HostResult<T>, sample: Option<&SampleId>) -> RecordedError {
    let kind = match result {
        HostResult::Failed(_) => ErrorKind::HostFailed,
        _ => ErrorKind::HostUnreachable,
    };
    let mut error = RecordedError::new(kind, result.reason().unwrap_or_default()).host(host);
    if let Some(sample) = sample {
        error = error.sample(sample);
    }
    error
}
