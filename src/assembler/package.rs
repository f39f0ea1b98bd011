//! Run packaging: `<results>/<run>.tar.xz` plus a `.sha256` file

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::process::Command;

use crate::assembler::STAGING_DIR;
use crate::error::{Result, ToolMeisterError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub tarball: PathBuf,
    pub checksum_file: PathBuf,
    pub sha256: String,
}

/// Hex sha256 of a file's contents
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Tar and xz-compress a run directory with the system `tar`
///
/// The staging area is left out of the archive.
pub async fn package(results_dir: &Path, run: &str) -> Result<Package> {
    let run_dir = results_dir.join(run);
    if !run_dir.is_dir() {
        return Err(ToolMeisterError::NotFound(format!("run directory {}", run_dir.display())));
    }

    let tar_name = format!("{}.tar.xz", run);
    let tarball = results_dir.join(&tar_name);
    let output = Command::new("tar")
        .arg("-C")
        .arg(results_dir)
        .arg(format!("--exclude={}/{}", run, STAGING_DIR))
        .arg("-cJf")
        .arg(&tarball)
        .arg(run)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let _ = fs::remove_file(&tarball);
        return Err(ToolMeisterError::Assembly(format!("tar failed for {}: {}", run, stderr.trim())));
    }

    let sha256 = sha256_file(&tarball)?;
    let checksum_file = results_dir.join(format!("{}.sha256", tar_name));
    fs::write(&checksum_file, format!("{}  {}\n", sha256, tar_name))?;

    log::info!("packaged {} ({})", tarball.display(), sha256);
    Ok(Package {
        tarball,
        checksum_file,
        sha256,
    })
}
