//! Small helpers shared across the pipeline.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Renders a certificate serial number the way a big integer prints in
/// hexadecimal: lowercase, no separators, no leading zeroes.
///
/// Escrow filenames are derived from this rendering, so it must stay
/// stable across materialize and load.
pub(crate) fn serial_hex(bytes: &[u8]) -> String {
    let encoded = hex::encode(bytes);
    let trimmed = encoded.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Decodes a base64 body, ignoring the line folds added by the transfer
/// encoding.
pub(crate) fn decode_base64_body(body: &[u8]) -> Result<Vec<u8>> {
    let filtered: Vec<u8> = body
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    STANDARD
        .decode(filtered)
        .context("part body is not valid base64")
}

/// Unfolds a raw header value into a single line.
pub(crate) fn unfold_header_value(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let mut out = String::with_capacity(text.len());
    for (i, line) in text.split('\n').enumerate() {
        let line = line.trim_end_matches('\r');
        if i == 0 {
            out.push_str(line);
        } else {
            out.push(' ');
            out.push_str(line.trim_start());
        }
    }
    out
}

/// Flattens a value into a single tab-separated field.
pub(crate) fn tsv_field(value: &str) -> String {
    value.replace(['\t', '\r', '\n'], " ")
}

/// The undecoded body bytes of a parsed entity, headers stripped.
pub(crate) fn raw_body<'a>(mail: &mailparse::ParsedMail<'a>) -> &'a [u8] {
    match mailparse::parse_headers(mail.raw_bytes) {
        Ok((_, offset)) => &mail.raw_bytes[offset..],
        Err(_) => mail.raw_bytes,
    }
}

/// Next free `{n}.eml` path in `dir`.
///
/// Advances the counter past any file that already exists; deliverables
/// are never overwritten.
pub(crate) fn next_numbered_eml(dir: &Path, counter: &mut u32) -> PathBuf {
    loop {
        let candidate = dir.join(format!("{counter}.eml"));
        if !candidate.exists() {
            return candidate;
        }
        *counter += 1;
    }
}

/// Recursively collects regular files under `dir` carrying `extension`,
/// sorted for a stable processing order.
pub(crate) fn files_with_extension(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    collect_files(dir, extension, &mut files)
        .with_context(|| format!("cannot walk input dir {}", dir.display()))?;
    files.sort();
    Ok(files)
}

fn collect_files(dir: &Path, extension: &str, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, extension, out)?;
        } else if path.extension().is_some_and(|ext| ext == extension) {
            out.push(path);
        }
    }
    Ok(())
}

/// First-level subdirectories of `dir`, sorted by name.
pub(crate) fn sub_directories(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("cannot read dir {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

#[cfg(unix)]
pub(crate) fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub(crate) fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
