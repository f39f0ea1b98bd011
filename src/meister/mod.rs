//! Tool Meister
//!
//! Per-host agent. Translates controller commands into local tool lifecycle
//! actions and keeps one state machine per sample:
//!
//! ```text
//! IDLE -> STARTING -> RUNNING -> STOPPING -> DONE
//!             \-> FAILED
//! ```
//!
//! A sample's work lock is held for the whole of a start or stop, so a STOP
//! that races a START waits for the start to join and then stops what it
//! launched. The state itself lives outside that lock so STATUS never waits.

mod state;

pub use state::MeisterState;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, watch};
use walkdir::WalkDir;

use crate::config::{MeisterConfig, default_sysinfo};
use crate::domain::{SampleId, Termination, ToolInvocation};
use crate::error::{Result, ToolMeisterError};
use crate::ipc::messages::{
    Acknowledgement, CollectCursor, CollectedFiles, Command, MeisterError, MeisterRequest, MeisterResponse,
    OutcomeKind, StatusReport, SysinfoDump, SysinfoPhase, ToolOutcome, TransferFile,
};
use crate::ipc::server::RequestHandler;
use crate::registry::validate_name;
use crate::supervisor::{LocalToolSupervisor, ToolHandle};
use crate::tools::ToolSpec;

struct RunningTool {
    handle: ToolHandle,
    invocation: ToolInvocation,
}

enum Launch {
    Running(RunningTool),
    Failed(ToolInvocation),
}

/// Raw bytes of output per COLLECT page
pub const DEFAULT_CHUNK_BYTES: usize = 4 * 1024 * 1024;

/// Directory under a run holding `beg/` and `end/` system information
pub const SYSINFO_DIR: &str = "sysinfo";

#[derive(Default)]
struct SlotWork {
    running: Vec<RunningTool>,
    /// Invocations that never started, reported again on stop
    failed: Vec<ToolInvocation>,
    start_ack: Option<Acknowledgement>,
    stop_ack: Option<Acknowledgement>,
}

struct SampleSlot {
    /// Only written while `work` is held
    state: watch::Sender<MeisterState>,
    work: Mutex<SlotWork>,
}

impl SampleSlot {
    fn idle() -> Self {
        Self {
            state: watch::channel(MeisterState::Idle).0,
            work: Mutex::new(SlotWork::default()),
        }
    }

    fn state(&self) -> MeisterState {
        *self.state.borrow()
    }

    fn set_state(&self, state: MeisterState) {
        self.state.send_replace(state);
    }
}

pub struct ToolMeister {
    hostname: String,
    output_dir: PathBuf,
    grace: Duration,
    supervisor: LocalToolSupervisor,
    started: Instant,
    chunk_bytes: usize,
    sysinfo: BTreeMap<String, String>,
    sysinfo_timeout: Duration,
    groups: RwLock<HashMap<String, Vec<ToolSpec>>>,
    samples: Mutex<HashMap<SampleId, Arc<SampleSlot>>>,
    shutdown: watch::Sender<bool>,
}

impl ToolMeister {
    pub fn new(
        hostname: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        grace: Duration,
        supervisor: LocalToolSupervisor,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            hostname: hostname.into(),
            output_dir: output_dir.into(),
            grace,
            supervisor,
            started: Instant::now(),
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            sysinfo: default_sysinfo(),
            sysinfo_timeout: Duration::from_secs(60),
            groups: RwLock::new(HashMap::new()),
            samples: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    pub fn from_config(config: &MeisterConfig) -> Self {
        Self::new(
            config.resolved_hostname(),
            &config.output_dir,
            config.grace_timeout(),
            LocalToolSupervisor::new(&config.shell, config.install_check_timeout()),
        )
        .with_chunk_bytes(config.collect_chunk_bytes)
        .with_sysinfo(config.sysinfo.clone(), config.sysinfo_timeout())
    }

    pub fn with_chunk_bytes(mut self, chunk_bytes: usize) -> Self {
        self.chunk_bytes = chunk_bytes.max(1);
        self
    }

    /// Replace the known sysinfo items
    pub fn with_sysinfo(mut self, items: BTreeMap<String, String>, timeout: Duration) -> Self {
        self.sysinfo = items;
        self.sysinfo_timeout = timeout;
        self
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Flips to `true` once TERMINATE has been served
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// `<output_dir>/<run>/<iteration>/<sample>`
    pub fn sample_dir(&self, sample: &SampleId) -> PathBuf {
        self.output_dir.join(&sample.run).join(sample.rel_path())
    }

    async fn slot(&self, sample: &SampleId) -> Arc<SampleSlot> {
        let mut samples = self.samples.lock().await;
        Arc::clone(
            samples
                .entry(sample.clone())
                .or_insert_with(|| Arc::new(SampleSlot::idle())),
        )
    }

    /// Install a group's resolved tools and run their install checks
    pub async fn register(&self, group: &str, tools: Vec<ToolSpec>) -> Result<Acknowledgement> {
        let checks = tools.iter().map(|spec| async move {
            match self.supervisor.check_installed(spec).await {
                Ok(()) => ToolOutcome::new(&spec.name, OutcomeKind::Installed),
                Err(e) => {
                    log::warn!("{}: {}", self.hostname, e);
                    ToolOutcome::new(&spec.name, outcome_of(&e)).with_error(e.to_string())
                }
            }
        });
        let outcomes = join_all(checks).await;

        log::info!("{}: registered group {} with {} tool(s)", self.hostname, group, tools.len());
        self.groups.write().await.insert(group.to_string(), tools);

        let mut ack = Acknowledgement::new(&self.hostname, None, MeisterState::Idle);
        ack.tools = outcomes;
        Ok(ack)
    }

    /// Start every tool of `group` for a sample
    ///
    /// Tool failures are listed in the acknowledgement and do not fail the
    /// sample. Re-sending START for a running sample returns the original
    /// acknowledgement.
    pub async fn start(&self, sample: &SampleId, group: &str) -> Result<Acknowledgement> {
        let specs = self
            .groups
            .read()
            .await
            .get(group)
            .cloned()
            .ok_or_else(|| ToolMeisterError::NotFound(format!("group {} is not registered on {}", group, self.hostname)))?;

        let slot = self.slot(sample).await;
        let mut work = slot.work.lock().await;
        match slot.state() {
            MeisterState::Idle => {}
            MeisterState::Running => {
                if let Some(ack) = &work.start_ack {
                    return Ok(ack.clone());
                }
            }
            other => {
                return Err(ToolMeisterError::InvalidState(format!(
                    "cannot start sample {} on {}: {}",
                    sample, self.hostname, other
                )));
            }
        }

        slot.set_state(MeisterState::Starting);
        let sample_dir = self.sample_dir(sample);
        if let Err(e) = fs::create_dir_all(&sample_dir) {
            log::error!("{}: cannot create {}: {}", self.hostname, sample_dir.display(), e);
            slot.set_state(MeisterState::Failed);
            return Err(e.into());
        }

        let launches = specs.iter().map(|spec| self.launch(spec, sample, &sample_dir));
        let launched = join_all(launches).await;

        let mut ack = Acknowledgement::new(&self.hostname, Some(sample), MeisterState::Running);
        for (outcome, launch) in launched {
            ack.tools.push(outcome);
            match launch {
                Launch::Running(tool) => work.running.push(tool),
                Launch::Failed(invocation) => work.failed.push(invocation),
            }
        }

        slot.set_state(MeisterState::Running);
        work.start_ack = Some(ack.clone());
        log::info!(
            "{}: sample {} running ({} started, {} failed)",
            self.hostname,
            sample,
            work.running.len(),
            work.failed.len()
        );
        Ok(ack)
    }

    async fn launch(&self, spec: &ToolSpec, sample: &SampleId, sample_dir: &Path) -> (ToolOutcome, Launch) {
        let mut invocation = ToolInvocation::new(&self.hostname, &spec.name, sample, sample_dir.join(&spec.name));
        match self.supervisor.start(spec, sample_dir).await {
            Ok(handle) => {
                invocation.mark_running(handle.pid);
                let outcome = ToolOutcome::new(&spec.name, OutcomeKind::Started).with_invocation(invocation.clone());
                (outcome, Launch::Running(RunningTool { handle, invocation }))
            }
            Err(e) => {
                log::warn!("{}: sample {}: {}", self.hostname, sample, e);
                invocation.mark_failed(e.to_string());
                let outcome = ToolOutcome::new(&spec.name, outcome_of(&e)).with_invocation(invocation.clone());
                (outcome, Launch::Failed(invocation))
            }
        }
    }

    /// Stop every tool started for a sample
    ///
    /// Idempotent: a sample that was never started is acknowledged with an
    /// empty tool list and tombstoned so a late START cannot launch tools.
    pub async fn stop(&self, sample: &SampleId) -> Result<Acknowledgement> {
        let slot = self.slot(sample).await;
        let mut work = slot.work.lock().await;

        match slot.state() {
            MeisterState::Running => {}
            MeisterState::Idle => {
                log::info!("{}: stop for unstarted sample {}", self.hostname, sample);
                let ack = Acknowledgement::new(&self.hostname, Some(sample), MeisterState::Done);
                slot.set_state(MeisterState::Done);
                work.stop_ack = Some(ack.clone());
                return Ok(ack);
            }
            MeisterState::Done => {
                return Ok(work
                    .stop_ack
                    .clone()
                    .unwrap_or_else(|| Acknowledgement::new(&self.hostname, Some(sample), MeisterState::Done)));
            }
            MeisterState::Failed => {
                return Ok(Acknowledgement::new(&self.hostname, Some(sample), MeisterState::Failed));
            }
            other => {
                return Err(ToolMeisterError::InvalidState(format!(
                    "cannot stop sample {} on {}: {}",
                    sample, self.hostname, other
                )));
            }
        }

        slot.set_state(MeisterState::Stopping);
        let running = std::mem::take(&mut work.running);
        let stops = running.into_iter().map(|tool| async move {
            let report = self.supervisor.stop(tool.handle, self.grace).await;
            let mut invocation = tool.invocation;
            invocation.mark_stopped(report.termination, report.exit_code);
            invocation.truncated |= report.truncated;
            invocation
        });
        let stopped = join_all(stops).await;

        let mut ack = Acknowledgement::new(&self.hostname, Some(sample), MeisterState::Done);
        for invocation in stopped {
            let kind = match invocation.termination {
                Some(Termination::Forced) => OutcomeKind::Forced,
                Some(Termination::AlreadyExited) => OutcomeKind::AlreadyExited,
                _ => OutcomeKind::Stopped,
            };
            ack.tools.push(ToolOutcome::new(&invocation.tool, kind).with_invocation(invocation));
        }
        for invocation in &work.failed {
            ack.tools
                .push(ToolOutcome::new(&invocation.tool, OutcomeKind::NotRunning).with_invocation(invocation.clone()));
        }

        slot.set_state(MeisterState::Done);
        work.stop_ack = Some(ack.clone());
        log::info!("{}: sample {} done", self.hostname, sample);
        Ok(ack)
    }

    /// One page of a stopped sample's output, starting at `cursor`
    ///
    /// Files are listed in sorted order relative to the sample directory and
    /// cut into chunks so no page carries more than the chunk budget.
    pub async fn collect(&self, sample: &SampleId, cursor: Option<CollectCursor>) -> Result<CollectedFiles> {
        let slot = self.samples.lock().await.get(sample).cloned();
        let state = slot.map_or(MeisterState::Idle, |slot| slot.state());

        let mut collected = CollectedFiles {
            host: self.hostname.clone(),
            sample: sample.clone(),
            state,
            files: Vec::new(),
            next: None,
        };
        match state {
            MeisterState::Done => {}
            MeisterState::Failed | MeisterState::Idle => return Ok(collected),
            other => {
                return Err(ToolMeisterError::InvalidState(format!(
                    "sample {} on {} is {}, stop it before collecting",
                    sample, self.hostname, other
                )));
            }
        }

        let sample_dir = self.sample_dir(sample);
        if !sample_dir.exists() {
            return Ok(collected);
        }
        let files = list_files(&sample_dir)?;

        let mut cursor = cursor.unwrap_or_default();
        let mut budget = self.chunk_bytes as u64;
        while budget > 0 {
            let Some((rel, path)) = files.get(cursor.file) else { break };
            let mut file = fs::File::open(path)?;
            let len = file.metadata()?.len();
            let start = cursor.offset.min(len);
            let take = (len - start).min(budget);

            file.seek(SeekFrom::Start(start))?;
            let mut data = vec![0u8; take as usize];
            file.read_exact(&mut data)?;
            collected.files.push(TransferFile {
                path: rel.clone(),
                offset: start,
                data: STANDARD.encode(&data),
            });

            budget -= take;
            cursor = if start + take >= len {
                CollectCursor {
                    file: cursor.file + 1,
                    offset: 0,
                }
            } else {
                CollectCursor {
                    file: cursor.file,
                    offset: start + take,
                }
            };
        }
        if cursor.file < files.len() {
            collected.next = Some(cursor);
        }

        log::debug!(
            "{}: collect page for {} with {} chunk(s), more: {}",
            self.hostname,
            sample,
            collected.files.len(),
            collected.next.is_some()
        );
        Ok(collected)
    }

    /// Gather system information items into `<output_dir>/<run>/sysinfo/<phase>/`
    ///
    /// Items that fail or that this Meister does not know are listed in the
    /// reply; they never fail the command.
    pub async fn sysinfo(&self, run: &str, phase: SysinfoPhase, items: &[String]) -> Result<SysinfoDump> {
        validate_name("run", run)?;
        let dir = self.output_dir.join(run).join(SYSINFO_DIR).join(phase.as_str());
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;

        let wanted: BTreeSet<&String> = items.iter().collect();
        let runs = wanted.into_iter().map(|item| {
            let dir = &dir;
            async move {
                let Some(command) = self.sysinfo.get(item) else {
                    return (item.clone(), Some("unknown sysinfo item".to_string()));
                };
                let out = dir.join(format!("{}.txt", item));
                match self.supervisor.capture(item, command, &out, self.sysinfo_timeout).await {
                    Ok(capture) => (item.clone(), capture.failure()),
                    Err(e) => (item.clone(), Some(e.to_string())),
                }
            }
        });
        let results = join_all(runs).await;

        let mut dump = SysinfoDump {
            host: self.hostname.clone(),
            phase,
            files: Vec::new(),
            failed: BTreeMap::new(),
        };
        for (item, failure) in results {
            let name = format!("{}.txt", item);
            let path = dir.join(&name);
            if path.is_file() {
                dump.files.push(TransferFile {
                    path: name,
                    offset: 0,
                    data: STANDARD.encode(fs::read(&path)?),
                });
            }
            if let Some(reason) = failure {
                log::warn!("{}: sysinfo {} for {}: {}", self.hostname, item, run, reason);
                dump.failed.insert(item, reason);
            }
        }
        log::info!(
            "{}: sysinfo {} for {}: {} file(s), {} failed",
            self.hostname,
            phase.as_str(),
            run,
            dump.files.len(),
            dump.failed.len()
        );
        Ok(dump)
    }

    pub async fn status(&self) -> StatusReport {
        let mut groups: Vec<String> = self.groups.read().await.keys().cloned().collect();
        groups.sort();

        let samples = self
            .samples
            .lock()
            .await
            .iter()
            .map(|(id, slot)| (id.to_string(), slot.state()))
            .collect();

        StatusReport {
            host: self.hostname.clone(),
            groups,
            samples,
            uptime_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    /// Stop every running sample and signal the server to shut down
    pub async fn terminate(&self) -> Result<Acknowledgement> {
        let ids: Vec<SampleId> = self.samples.lock().await.keys().cloned().collect();
        let mut ack = Acknowledgement::new(&self.hostname, None, MeisterState::Done);
        for id in ids {
            let slot = self.slot(&id).await;
            if slot.state() == MeisterState::Running {
                log::warn!("{}: terminating with sample {} still running", self.hostname, id);
                ack.tools.extend(self.stop(&id).await?.tools);
            }
        }
        self.shutdown.send_replace(true);
        Ok(ack)
    }

    async fn dispatch(&self, request: MeisterRequest) -> MeisterResponse {
        let id = request.id;
        match request.command {
            Command::Register { group, tools } => respond(id, self.register(&group, tools).await),
            Command::Start { sample, group } => respond(id, self.start(&sample, &group).await),
            Command::Stop { sample } => respond(id, self.stop(&sample).await),
            Command::Status => respond(id, Ok(self.status().await)),
            Command::Collect { sample, cursor } => respond(id, self.collect(&sample, cursor).await),
            Command::Sysinfo { run, phase, items } => respond(id, self.sysinfo(&run, phase, &items).await),
            Command::Terminate => respond(id, self.terminate().await),
        }
    }
}

impl RequestHandler for ToolMeister {
    fn handle(&self, request: MeisterRequest) -> impl std::future::Future<Output = MeisterResponse> + Send {
        self.dispatch(request)
    }
}

fn respond<T: Serialize>(id: u64, result: Result<T>) -> MeisterResponse {
    match result {
        Ok(payload) => MeisterResponse::from_payload(id, &payload),
        Err(e) => MeisterResponse::error(id, MeisterError::from(&e)),
    }
}

/// Regular files under `dir` as (`/`-separated relative path, full path), sorted
fn list_files(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| ToolMeisterError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| ToolMeisterError::Storage(e.to_string()))?;
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push((rel, entry.into_path()));
    }
    Ok(files)
}

fn outcome_of(err: &ToolMeisterError) -> OutcomeKind {
    match err {
        ToolMeisterError::ToolNotInstalled { .. } => OutcomeKind::NotInstalled,
        ToolMeisterError::SpawnError { .. } => OutcomeKind::SpawnFailed,
        _ => OutcomeKind::Failed,
    }
}
