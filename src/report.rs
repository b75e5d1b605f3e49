//! Tab-separated exception and success reports.
//!
//! Each destination directory gets four logs. They are opened with append
//! semantics so re-runs extend them; the column row is only written when a
//! file is created.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::Path;

use anyhow::{Context as _, Result};
use mailparse::MailHeaderMap as _;

use crate::tools::{set_mode, tsv_field};

/// Columns shared by the three message-level logs.
pub const MESSAGE_COLUMNS: &str =
    "Target\tFrom\tTo\tCC\tBCC\tSubj\tDate\tMessage-Id\tAttachments\tError";
/// Columns of the corrupt-input log.
pub const CORRUPT_COLUMNS: &str = "Eml File\tError";
/// Columns of the per-PST harvest log.
pub const PST_COLUMNS: &str = "PST File\tError";

/// One tab-separated log file.
pub struct LogFile {
    file: File,
}

impl LogFile {
    /// Opens `path` for appending, writing `columns` first if the file is
    /// new.
    pub fn open(path: &Path, columns: &str) -> Result<LogFile> {
        let fresh = !path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open log file {}", path.display()))?;
        if fresh {
            set_mode(path, 0o644)?;
            writeln!(file, "{columns}")
                .with_context(|| format!("cannot write log header {}", path.display()))?;
        }
        Ok(LogFile { file })
    }

    /// Appends one row; embedded tabs and newlines are flattened so the
    /// row stays a single line.
    pub fn write_row(&mut self, fields: &[&str]) -> Result<()> {
        let row: Vec<String> = fields.iter().map(|field| tsv_field(field)).collect();
        writeln!(self.file, "{}", row.join("\t")).context("cannot append log row")
    }
}

/// Flat per-message record for the message-level logs.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MessageException {
    pub target: String,
    pub from: String,
    pub to: String,
    pub cc: String,
    pub bcc: String,
    pub subject: String,
    pub date: String,
    pub message_id: String,
    pub attachments: String,
    pub error: String,
}

impl MessageException {
    /// Builds a record from the message's own headers; `error` of `None`
    /// denotes a success row.
    pub fn from_message(target: &str, raw: &[u8], error: Option<&str>) -> Result<MessageException> {
        let (headers, _) = mailparse::parse_headers(raw).context("cannot parse headers")?;
        let get = |name: &str| headers.get_first_value(name).unwrap_or_default();
        Ok(MessageException {
            target: target.to_string(),
            from: get("From"),
            to: get("To"),
            cc: get("Cc"),
            bcc: get("Bcc"),
            subject: get("Subject"),
            date: get("Date"),
            message_id: get("Message-ID"),
            attachments: get("X-MS-Has-Attach"),
            error: error.unwrap_or("success").to_string(),
        })
    }

    pub fn write_to(&self, log: &mut LogFile) -> Result<()> {
        log.write_row(&[
            &self.target,
            &self.from,
            &self.to,
            &self.cc,
            &self.bcc,
            &self.subject,
            &self.date,
            &self.message_id,
            &self.attachments,
            &self.error,
        ])
    }
}

/// Which message-level log a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLog {
    /// The walker or the decipher primitive failed.
    DecipherException,
    /// The message was deciphered and written out.
    Success,
    /// The input carried no ciphertext; nothing was emitted.
    PlaintextException,
}

/// The four logs of one output directory.
pub struct CaseLogs {
    pub corrupt: LogFile,
    pub decipher_exceptions: LogFile,
    pub success: LogFile,
    pub plaintext_exceptions: LogFile,
}

impl CaseLogs {
    /// Opens (or creates) the four logs under `log_dir`.
    pub fn open(log_dir: &Path) -> Result<CaseLogs> {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("cannot create log dir {}", log_dir.display()))?;
        Ok(CaseLogs {
            corrupt: LogFile::open(&log_dir.join("corruptExceptions.csv"), CORRUPT_COLUMNS)?,
            decipher_exceptions: LogFile::open(
                &log_dir.join("decipherExceptions.csv"),
                MESSAGE_COLUMNS,
            )?,
            success: LogFile::open(&log_dir.join("success.csv"), MESSAGE_COLUMNS)?,
            plaintext_exceptions: LogFile::open(&log_dir.join("ptExceptions.csv"), MESSAGE_COLUMNS)?,
        })
    }

    /// Logs one message outcome, falling back to the corrupt log when even
    /// the header parse fails.
    pub fn log_message(
        &mut self,
        log: MessageLog,
        target: &str,
        raw: &[u8],
        error: Option<&str>,
    ) -> Result<()> {
        match MessageException::from_message(target, raw, error) {
            Ok(record) => {
                let file = match log {
                    MessageLog::DecipherException => &mut self.decipher_exceptions,
                    MessageLog::Success => &mut self.success,
                    MessageLog::PlaintextException => &mut self.plaintext_exceptions,
                };
                record.write_to(file)
            }
            Err(parse_err) => self
                .corrupt
                .write_row(&[target, &format!("{parse_err:#}")]),
        }
    }
}
