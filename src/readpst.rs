//! External `readpst` invocation.
//!
//! PST archives are expanded to `.eml` trees by the external `readpst`
//! binary, one subprocess per archive. The caller owns the scratch
//! directory and is expected to clear it between archives.

use std::path::Path;

use anyhow::{bail, Context as _, Result};
use tokio::process::Command;

/// Worker count to pass to `readpst -j`.
///
/// Thread-safe builds take one worker per CPU; otherwise parallelism must
/// stay disabled.
pub fn job_count(parallel: bool) -> usize {
    if parallel {
        num_cpus::get()
    } else {
        0
    }
}

/// Expands one archive into `out_dir` and waits for completion.
pub async fn unpack(pst_path: &Path, out_dir: &Path, jobs: usize) -> Result<()> {
    log::info!("unpacking {}", pst_path.display());
    let status = Command::new("readpst")
        .arg("-D")
        .arg("-o")
        .arg(out_dir)
        .arg("-t")
        .arg("e")
        .arg("-e")
        .arg("-j")
        .arg(jobs.to_string())
        .arg(pst_path)
        .status()
        .await
        .context("cannot run readpst; is it installed?")?;
    if !status.success() {
        bail!("readpst failed on {}: {status}", pst_path.display());
    }
    log::info!("finished unpacking {}", pst_path.display());
    Ok(())
}

/// Removes everything below `dir` without removing `dir` itself.
pub fn clear_directory(dir: &Path) -> Result<()> {
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("cannot read unpack dir {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        }
        .with_context(|| format!("cannot clear {}", path.display()))?;
    }
    Ok(())
}
