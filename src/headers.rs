//! Header metadata extraction.
//!
//! Walks per-custodian archives and writes one `headerMetaData.tsv` per
//! custodian. Only the top level of each message is examined; messages
//! attached to other messages are not opened.

use std::path::Path;

use anyhow::{Context as _, Result};
use chrono::{TimeZone as _, Utc};

use crate::pst::{PstAttachment, PstFile, PstFolder, PstMessage, PstReader, SMIME_CLASS};
use crate::report::LogFile;
use crate::tools::{set_mode, sub_directories};

/// Columns of the per-custodian metadata report.
pub const HEADER_COLUMNS: &str = "PstFile\tFolder\tFrom\tSenderName\tTo\tCC\tBCC\tSubj\tDate\t\
                                  Message-Id\tHasAttachments\tIsEncrypted\tAttachmentFileNames";

/// Scans every custodian subdirectory of `header_in`.
///
/// `archives_for` maps a custodian directory to the archive paths the
/// reader should open (PST files for a binary backend, expanded trees for
/// the eml adapter).
pub fn scan_case<R: PstReader>(
    reader: &R,
    header_in: &Path,
    header_out: &Path,
    archives_for: impl Fn(&Path) -> Result<Vec<std::path::PathBuf>>,
) -> Result<()> {
    let custodians = sub_directories(header_in)?;
    anyhow::ensure!(
        !custodians.is_empty(),
        "no custodian folders under {}",
        header_in.display()
    );
    for custodian in custodians {
        let name = custodian
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let out_dir = header_out.join(sanitize_filename::sanitize(&name));
        std::fs::create_dir_all(&out_dir)
            .with_context(|| format!("cannot create {}", out_dir.display()))?;
        set_mode(&out_dir, 0o755)?;
        let mut log = LogFile::open(&out_dir.join("headerMetaData.tsv"), HEADER_COLUMNS)?;
        for archive in archives_for(&custodian)? {
            scan_archive(reader, &archive, &mut log)
                .with_context(|| format!("scanning {}", archive.display()))?;
        }
        log::info!("wrote header metadata for {name}");
    }
    Ok(())
}

/// Appends one row per message in `archive` to `log`.
pub fn scan_archive<R: PstReader>(reader: &R, archive: &Path, log: &mut LogFile) -> Result<()> {
    let file = reader.open(archive)?;
    let root = file.root_folder()?;
    let archive_name = archive.to_string_lossy();
    scan_folder(&root, &archive_name, log)
}

fn scan_folder<F: PstFolder>(folder: &F, archive: &str, log: &mut LogFile) -> Result<()> {
    for message in folder.messages()? {
        let envelope = message.envelope()?;
        let date = Utc
            .timestamp_nanos(envelope.date_ns)
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let encrypted = message
            .message_class()
            .is_ok_and(|class| class.starts_with(SMIME_CLASS));
        let mut filenames = Vec::new();
        for attachment in message.attachments()? {
            if let Some(filename) = attachment.long_filename()? {
                filenames.push(filename);
            }
        }
        log.write_row(&[
            archive,
            folder.display_name(),
            &envelope.from,
            &envelope.sender_name,
            &envelope.to,
            &envelope.cc,
            &envelope.bcc,
            &envelope.subject,
            &date,
            &envelope.message_id,
            if envelope.has_attachments { "true" } else { "false" },
            if encrypted { "true" } else { "false" },
            &filenames.join(";"),
        ])?;
    }
    for sub in folder.sub_folders()? {
        scan_folder(&sub, archive, log)?;
    }
    Ok(())
}
