//! Result Assembler
//!
//! Sole writer of the result tree:
//!
//! ```text
//! <results>/<run>/<iteration>/<sample>/<host>/<tool>/...
//! ```
//!
//! Host output arrives in `<results>/<run>/.staging/<host>/<iteration>/<sample>/`
//! through COLLECT and is copied into place once the sample is stopped.
//! System information goes straight to `<results>/<run>/sysinfo/<phase>/<host>/`.

pub mod package;

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use crate::domain::{ErrorKind, RecordedError, SampleId, SampleRecord, SampleState};
use crate::error::{Result, ToolMeisterError};
use crate::registry::{Binding, copy_tree};

pub use package::{Package, package, sha256_file};

pub const STAGING_DIR: &str = ".staging";

pub use crate::meister::SYSINFO_DIR;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssemblyReport {
    pub copied_files: usize,
    /// Missing host or tool output, one entry per gap
    pub partial: Vec<RecordedError>,
    /// Sample was already collected; nothing was touched
    pub noop: bool,
}

#[derive(Debug, Clone)]
pub struct ResultAssembler {
    results_dir: PathBuf,
}

impl ResultAssembler {
    pub fn new(results_dir: impl Into<PathBuf>) -> Self {
        Self {
            results_dir: results_dir.into(),
        }
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    pub fn run_dir(&self, run: &str) -> PathBuf {
        self.results_dir.join(run)
    }

    pub fn staging_dir(&self, run: &str) -> PathBuf {
        self.run_dir(run).join(STAGING_DIR)
    }

    /// Staged output of one host for one sample
    pub fn staged_host_dir(&self, sample: &SampleId, host: &str) -> PathBuf {
        self.staging_dir(&sample.run).join(host).join(sample.rel_path())
    }

    /// Final location of a sample in the result tree
    pub fn sample_dir(&self, sample: &SampleId) -> PathBuf {
        self.run_dir(&sample.run).join(sample.rel_path())
    }

    /// Drop anything staged earlier for this host and sample
    pub fn clear_staged(&self, sample: &SampleId, host: &str) -> Result<()> {
        let dir = self.staged_host_dir(sample, host);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// `<results>/<run>/sysinfo/<phase>/<host>`
    pub fn sysinfo_dir(&self, run: &str, phase: &str, host: &str) -> PathBuf {
        self.run_dir(run).join(SYSINFO_DIR).join(phase).join(host)
    }

    /// Write one transferred chunk into the staging area
    ///
    /// A chunk at offset 0 replaces the file; later chunks must continue
    /// exactly where the staged file ends. `rel` must be a plain relative
    /// path; anything that could climb out of the staging directory is
    /// rejected.
    pub fn stage_file(&self, sample: &SampleId, host: &str, rel: &str, offset: u64, data: &[u8]) -> Result<PathBuf> {
        let target = self.staged_host_dir(sample, host).join(plain_path(rel, host)?);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if offset == 0 {
            fs::write(&target, data)?;
            return Ok(target);
        }

        let staged = fs::metadata(&target).map(|m| m.len()).unwrap_or(0);
        if staged != offset {
            return Err(ToolMeisterError::Assembly(format!(
                "chunk of '{}' from {} starts at {} but {} byte(s) are staged",
                rel, host, offset, staged
            )));
        }
        OpenOptions::new().append(true).open(&target)?.write_all(data)?;
        Ok(target)
    }

    /// Clear one host's sysinfo directory for a phase
    pub fn clear_sysinfo(&self, run: &str, phase: &str, host: &str) -> Result<()> {
        let dir = self.sysinfo_dir(run, phase, host);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Write one sysinfo file for a host
    pub fn stage_sysinfo(&self, run: &str, phase: &str, host: &str, rel: &str, data: &[u8]) -> Result<PathBuf> {
        let target = self.sysinfo_dir(run, phase, host).join(plain_path(rel, host)?);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, data)?;
        Ok(target)
    }

    /// Merge staged host output for a stopped sample into the result tree
    ///
    /// Re-assembly of a collected sample is a no-op. Otherwise the target is
    /// cleared first so repeated assembly produces the same tree.
    pub fn assemble(&self, record: &mut SampleRecord, bindings: &[Binding]) -> Result<AssemblyReport> {
        match record.state {
            SampleState::Collected => {
                log::info!("sample {} already collected", record.sample);
                return Ok(AssemblyReport {
                    noop: true,
                    ..Default::default()
                });
            }
            SampleState::ToolsStopped => {}
            other => {
                return Err(ToolMeisterError::InvalidState(format!(
                    "sample {} is {}, expected TOOLS_STOPPED",
                    record.sample, other
                )));
            }
        }

        let sample = record.sample.clone();
        let target = self.sample_dir(&sample);
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::create_dir_all(&target)?;

        let mut hosts: Vec<&str> = Vec::new();
        for binding in bindings {
            if !hosts.contains(&binding.host.as_str()) {
                hosts.push(&binding.host);
            }
        }

        let mut report = AssemblyReport::default();
        for host in hosts {
            let staged = self.staged_host_dir(&sample, host);
            if !staged.is_dir() {
                report.partial.push(
                    RecordedError::new(ErrorKind::PartialResult, "no output collected from host")
                        .host(host)
                        .sample(&sample),
                );
                continue;
            }

            for binding in bindings.iter().filter(|b| b.host == host) {
                let src = staged.join(&binding.tool);
                if !src.is_dir() {
                    report.partial.push(
                        RecordedError::new(ErrorKind::PartialResult, "no output for bound tool")
                            .host(host)
                            .tool(&binding.tool)
                            .sample(&sample),
                    );
                    continue;
                }
                report.copied_files += copy_tree(&src, &target.join(host).join(&binding.tool))?;

                if let Some(status) = record.hosts.get_mut(host) {
                    for invocation in status.invocations.iter_mut().filter(|i| i.tool == binding.tool) {
                        invocation.mark_collected();
                    }
                }
            }
        }

        record.set_state(SampleState::Collected);
        log::info!(
            "assembled sample {}: {} file(s), {} gap(s)",
            sample,
            report.copied_files,
            report.partial.len()
        );
        Ok(report)
    }
}

fn plain_path<'a>(rel: &'a str, host: &str) -> Result<&'a Path> {
    let rel_path = Path::new(rel);
    let plain = !rel.is_empty() && rel_path.components().all(|c| matches!(c, Component::Normal(_)));
    if !plain {
        return Err(ToolMeisterError::Assembly(format!(
            "refusing transferred path '{}' from {}",
            rel, host
        )));
    }
    Ok(rel_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use walkdir::WalkDir;

    fn binding(host: &str, tool: &str) -> Binding {
        Binding {
            host: host.to_string(),
            tool: tool.to_string(),
            params: BTreeMap::new(),
        }
    }

    fn stopped_record(sample: &SampleId, hosts: &[&str]) -> SampleRecord {
        let hosts: Vec<String> = hosts.iter().map(|h| h.to_string()).collect();
        let mut record = SampleRecord::new(sample.clone(), "default", &hosts);
        record.set_state(SampleState::ToolsStopped);
        record
    }

    fn snapshot(dir: &Path) -> Vec<(String, Vec<u8>)> {
        WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .map(|e| e.unwrap())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = e.path().strip_prefix(dir).unwrap().display().to_string();
                (rel, fs::read(e.path()).unwrap())
            })
            .collect()
    }

    #[test]
    fn test_assemble_with_missing_host() {
        let dir = TempDir::new().unwrap();
        let asm = ResultAssembler::new(dir.path());
        let sample = SampleId::new("Run", 1, 1);
        asm.stage_file(&sample, "h1", "sar/sar-stdout.txt", 0, b"cpu 1\n").unwrap();

        let mut record = stopped_record(&sample, &["h1", "h2"]);
        let report = asm
            .assemble(&mut record, &[binding("h1", "sar"), binding("h2", "sar")])
            .unwrap();

        assert_eq!(report.copied_files, 1);
        assert_eq!(report.partial.len(), 1);
        assert_eq!(report.partial[0].host.as_deref(), Some("h2"));
        assert_eq!(record.state, SampleState::Collected);
        let out = dir.path().join("Run/1/1/h1/sar/sar-stdout.txt");
        assert_eq!(fs::read_to_string(out).unwrap(), "cpu 1\n");
    }

    #[test]
    fn test_missing_tool_is_partial() {
        let dir = TempDir::new().unwrap();
        let asm = ResultAssembler::new(dir.path());
        let sample = SampleId::new("Run", 1, 2);
        asm.stage_file(&sample, "h1", "sar/sar-stdout.txt", 0, b"x").unwrap();

        let mut record = stopped_record(&sample, &["h1"]);
        let report = asm
            .assemble(&mut record, &[binding("h1", "sar"), binding("h1", "iostat")])
            .unwrap();
        assert_eq!(report.partial.len(), 1);
        assert_eq!(report.partial[0].tool.as_deref(), Some("iostat"));
    }

    #[test]
    fn test_reassembly_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let asm = ResultAssembler::new(dir.path());
        let sample = SampleId::new("Run", 1, 1);
        asm.stage_file(&sample, "h1", "sar/sar-stdout.txt", 0, b"a\nb\n").unwrap();
        asm.stage_file(&sample, "h1", "sar/nested/extra.bin", 0, &[0, 1, 2]).unwrap();
        let bindings = [binding("h1", "sar")];

        let mut record = stopped_record(&sample, &["h1"]);
        asm.assemble(&mut record, &bindings).unwrap();
        let first = snapshot(&asm.sample_dir(&sample));

        // Collected: second call touches nothing.
        assert!(asm.assemble(&mut record, &bindings).unwrap().noop);

        // A stray partial file from an interrupted attempt is cleared.
        fs::write(asm.sample_dir(&sample).join("h1/stray"), b"junk").unwrap();
        record.set_state(SampleState::ToolsStopped);
        asm.assemble(&mut record, &bindings).unwrap();
        assert_eq!(snapshot(&asm.sample_dir(&sample)), first);
    }

    #[test]
    fn test_running_sample_rejected() {
        let dir = TempDir::new().unwrap();
        let asm = ResultAssembler::new(dir.path());
        let sample = SampleId::new("Run", 1, 1);
        let mut record = stopped_record(&sample, &["h1"]);
        record.set_state(SampleState::ToolsRunning);
        assert!(matches!(
            asm.assemble(&mut record, &[]).unwrap_err(),
            ToolMeisterError::InvalidState(_)
        ));
    }

    #[test]
    fn test_stage_file_rejects_escapes() {
        let dir = TempDir::new().unwrap();
        let asm = ResultAssembler::new(dir.path());
        let sample = SampleId::new("Run", 1, 1);
        for bad in ["../x", "/etc/passwd", "sar/../../x", ""] {
            assert!(asm.stage_file(&sample, "h1", bad, 0, b"x").is_err(), "{}", bad);
            assert!(asm.stage_sysinfo("Run", "beg", "h1", bad, b"x").is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_stage_file_appends_chunks() {
        let dir = TempDir::new().unwrap();
        let asm = ResultAssembler::new(dir.path());
        let sample = SampleId::new("Run", 1, 1);
        asm.stage_file(&sample, "h1", "sar/out", 0, b"abc").unwrap();
        let path = asm.stage_file(&sample, "h1", "sar/out", 3, b"def").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"abcdef");

        // A gap or overlap is refused and leaves the file alone.
        assert!(asm.stage_file(&sample, "h1", "sar/out", 9, b"x").is_err());
        assert!(asm.stage_file(&sample, "h1", "sar/out", 2, b"x").is_err());
        assert_eq!(fs::read(&path).unwrap(), b"abcdef");

        // Offset 0 starts the file over.
        asm.stage_file(&sample, "h1", "sar/out", 0, b"z").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"z");
    }

    #[test]
    fn test_stage_sysinfo_layout() {
        let dir = TempDir::new().unwrap();
        let asm = ResultAssembler::new(dir.path());
        asm.stage_sysinfo("Run", "end", "h1", "kernel.txt", b"Linux\n").unwrap();
        let path = dir.path().join("Run/sysinfo/end/h1/kernel.txt");
        assert_eq!(fs::read(&path).unwrap(), b"Linux\n");
        asm.clear_sysinfo("Run", "end", "h1").unwrap();
        assert!(!path.exists());
    }
}
