//! Per-custodian decipher runs.
//!
//! Walks the ciphertext tree, unwraps each message with the case keyring
//! and streams deliverables plus the four report logs into the plaintext
//! tree. One message's failure never touches another: everything below
//! the fatal conditions (empty input, bad keyring, unwritable output) is
//! logged and skipped.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context as _, Result};

use crate::decrypt::unwrap_message;
use crate::keyring::Keyring;
use crate::readpst;
use crate::report::{CaseLogs, MessageLog};
use crate::tools::{files_with_extension, next_numbered_eml, set_mode, sub_directories};

/// Counters for one processed tree.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    pub deciphered: usize,
    pub plaintext: usize,
    pub failed: usize,
}

/// Deciphers every `.eml` under `in_dir` into numbered files in `out_dir`.
///
/// `out_dir/logs` receives the four report files; deliverables are
/// numbered `1.eml`, `2.eml`, ... continuing past whatever already exists.
pub fn decipher_tree(in_dir: &Path, keyring: &Keyring, out_dir: &Path) -> Result<RunStats> {
    let mut logs = CaseLogs::open(&out_dir.join("logs"))?;
    let inputs = files_with_extension(in_dir, "eml")?;
    if inputs.is_empty() {
        bail!("input dir {} is empty", in_dir.display());
    }

    let mut stats = RunStats::default();
    let mut counter = 1u32;
    for input in &inputs {
        let target = input.to_string_lossy();
        let raw = match fs::read(input) {
            Ok(raw) => raw,
            Err(err) => {
                stats.failed += 1;
                logs.corrupt.write_row(&[&target, &err.to_string()])?;
                continue;
            }
        };
        match unwrap_message(&raw, keyring) {
            Err(err) => {
                stats.failed += 1;
                logs.log_message(
                    MessageLog::DecipherException,
                    &target,
                    &raw,
                    Some(&format!("{err:#}")),
                )?;
            }
            Ok((plaintext, true)) => {
                let out_path = next_numbered_eml(out_dir, &mut counter);
                counter += 1;
                match fs::write(&out_path, &plaintext) {
                    Ok(()) => {
                        stats.deciphered += 1;
                        logs.log_message(MessageLog::Success, &target, &raw, None)?;
                    }
                    Err(err) => {
                        stats.failed += 1;
                        log::error!("cannot write {}: {err}", out_path.display());
                        logs.corrupt.write_row(&[&target, &err.to_string()])?;
                    }
                }
            }
            Ok((_, false)) => {
                // parsed fine but carried no ciphertext; not a deliverable
                stats.plaintext += 1;
                logs.log_message(
                    MessageLog::PlaintextException,
                    &target,
                    &raw,
                    Some("plaintext input"),
                )?;
            }
        }
    }
    log::info!(
        "{}: {} deciphered, {} plaintext, {} failed",
        in_dir.display(),
        stats.deciphered,
        stats.plaintext,
        stats.failed
    );
    Ok(stats)
}

/// Runs the decipher step for every custodian under `ct_dir`.
///
/// Each first-level subdirectory is one custodian; output lands in
/// `{pt_dir}/{custodian}` with logs below it. In eml mode the custodian
/// dirs hold loose `.eml` files; otherwise each `.pst` is expanded through
/// the external unpacker into `scratch_dir` first.
pub async fn decipher_case(
    ct_dir: &Path,
    pt_dir: &Path,
    keyring: &Keyring,
    eml_mode: bool,
    parallel_unpack: bool,
    scratch_dir: &Path,
) -> Result<()> {
    let custodians = sub_directories(ct_dir)?;
    if custodians.is_empty() {
        bail!("no custodian folders under {}", ct_dir.display());
    }

    for custodian in custodians {
        let name = custodian
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let out_dir = pt_dir.join(&name);
        fs::create_dir_all(&out_dir)
            .with_context(|| format!("cannot create custodian dir {}", out_dir.display()))?;
        set_mode(&out_dir, 0o755)?;
        log::info!("processing custodian {name}");

        if eml_mode {
            decipher_tree(&custodian, keyring, &out_dir)?;
            continue;
        }

        let archives = files_with_extension(&custodian, "pst")?;
        if archives.is_empty() {
            bail!("ciphertext input for {name} must be pst files");
        }
        let jobs = readpst::job_count(parallel_unpack);
        for archive in archives {
            readpst::clear_directory(scratch_dir)?;
            readpst::unpack(&archive, scratch_dir, jobs).await?;
            decipher_tree(scratch_dir, keyring, &out_dir)?;
        }
        readpst::clear_directory(scratch_dir)?;
    }
    log::info!("decipher run complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{enveloped_eml, test_identity, INNER_PLAINTEXT};

    fn ring_of(identity: &crate::test_utils::TestIdentity) -> Keyring {
        let mut ring = Keyring::new();
        ring.add(identity.pair());
        ring
    }

    #[test]
    fn test_decipher_tree_outcomes() {
        let alice = test_identity("DOE.JANE.A.11111111", 0x11);
        let bob = test_identity("ROE.RICHARD.B.22222222", 0x22);
        let ring = ring_of(&alice);

        let in_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        // one decipherable, one plaintext, one missing key
        fs::write(in_dir.path().join("a.eml"), enveloped_eml(&alice, INNER_PLAINTEXT)).unwrap();
        fs::write(
            in_dir.path().join("b.eml"),
            b"From: x@example.com\n\nplain body\n",
        )
        .unwrap();
        fs::write(in_dir.path().join("c.eml"), enveloped_eml(&bob, INNER_PLAINTEXT)).unwrap();

        let stats = decipher_tree(in_dir.path(), &ring, out_dir.path()).unwrap();
        assert_eq!(stats.deciphered, 1);
        assert_eq!(stats.plaintext, 1);
        assert_eq!(stats.failed, 1);

        let delivered = fs::read_to_string(out_dir.path().join("1.eml")).unwrap();
        assert!(delivered.contains("the quarterly numbers are attached"));

        let logs = out_dir.path().join("logs");
        let success = fs::read_to_string(logs.join("success.csv")).unwrap();
        assert!(success.contains("a.eml"));
        assert!(success.trim_end().ends_with("success"));
        let pt = fs::read_to_string(logs.join("ptExceptions.csv")).unwrap();
        assert!(pt.contains("b.eml"));
        assert!(pt.contains("plaintext input"));
        let failures = fs::read_to_string(logs.join("decipherExceptions.csv")).unwrap();
        assert!(failures.contains("c.eml"));
    }

    #[test]
    fn test_decipher_tree_never_overwrites() {
        let alice = test_identity("DOE.JANE.A.11111111", 0x11);
        let ring = ring_of(&alice);

        let in_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        fs::write(in_dir.path().join("a.eml"), enveloped_eml(&alice, INNER_PLAINTEXT)).unwrap();
        fs::write(out_dir.path().join("1.eml"), b"already here").unwrap();

        decipher_tree(in_dir.path(), &ring, out_dir.path()).unwrap();
        assert_eq!(
            fs::read(out_dir.path().join("1.eml")).unwrap(),
            b"already here"
        );
        assert!(out_dir.path().join("2.eml").exists());
    }

    #[test]
    fn test_empty_input_is_fatal() {
        let ring = Keyring::new();
        let in_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        assert!(decipher_tree(in_dir.path(), &ring, out_dir.path()).is_err());
    }

    #[tokio::test]
    async fn test_decipher_case_eml_mode() {
        let alice = test_identity("DOE.JANE.A.11111111", 0x11);
        let ring = ring_of(&alice);

        let ct = tempfile::tempdir().unwrap();
        let pt = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let custodian = ct.path().join("mulder");
        fs::create_dir_all(&custodian).unwrap();
        fs::write(custodian.join("a.eml"), enveloped_eml(&alice, INNER_PLAINTEXT)).unwrap();

        decipher_case(ct.path(), pt.path(), &ring, true, false, scratch.path())
            .await
            .unwrap();
        assert!(pt.path().join("mulder/1.eml").exists());
        assert!(pt.path().join("mulder/logs/success.csv").exists());
    }

    #[tokio::test]
    async fn test_decipher_case_requires_custodians() {
        let ring = Keyring::new();
        let ct = tempfile::tempdir().unwrap();
        let pt = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        assert!(
            decipher_case(ct.path(), pt.path(), &ring, true, false, scratch.path())
                .await
                .is_err()
        );
    }
}
