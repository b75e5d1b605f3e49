//! Interface to the external PST reader.
//!
//! The binary PST parser is a consumed dependency: its internals are not
//! part of this crate. The traits below are the seat a backend plugs into.
//! Backends must hand out one message at a time per open archive; known
//! readers are not safe for concurrent use within a file, so parallelism
//! only happens across distinct archives.
//!
//! [`EmlReader`] adapts a directory tree of `.eml` files (as produced by
//! `readpst -t e`) to the same interface, which keeps the harvester and the
//! header scan usable without a linked binary backend.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use mailparse::MailHeaderMap as _;

/// Header-level metadata of one archived message.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    pub from: String,
    pub sender_name: String,
    pub to: String,
    pub cc: String,
    pub bcc: String,
    pub subject: String,
    /// Delivery time in nanoseconds since the Unix epoch.
    pub date_ns: i64,
    pub message_id: String,
    pub has_attachments: bool,
}

/// Opens archives. The entry point a backend implements.
pub trait PstReader: Send + Sync + 'static {
    type File: PstFile;

    fn open(&self, path: &Path) -> Result<Self::File>;
}

/// One open archive.
pub trait PstFile: Send {
    type Folder: PstFolder;

    fn root_folder(&self) -> Result<Self::Folder>;
}

/// One folder in the archive tree.
pub trait PstFolder: Sized + Send {
    type Message: PstMessage;

    fn display_name(&self) -> &str;
    fn sub_folders(&self) -> Result<Vec<Self>>;
    fn messages(&self) -> Result<Vec<Self::Message>>;
}

/// One archived message.
pub trait PstMessage: Send {
    type Attachment: PstAttachment;

    fn envelope(&self) -> Result<MessageEnvelope>;
    /// The `PidTagMessageClass` property.
    fn message_class(&self) -> Result<String>;
    /// Raw RFC 5322 transport headers, one level deep.
    fn transport_headers(&self) -> Result<String>;
    fn attachments(&self) -> Result<Vec<Self::Attachment>>;
}

/// One attachment of an archived message.
pub trait PstAttachment: Send {
    fn mime_tag(&self) -> Result<Option<String>>;
    fn long_filename(&self) -> Result<Option<String>>;
    fn identifier(&self) -> Result<u32>;
    fn write_to(&self, out: &mut dyn Write) -> Result<u64>;

    fn read_to_vec(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        Ok(buf)
    }
}

/// Message class Outlook stamps on clear-signed mail.
pub const MULTIPART_SIGNED_CLASS: &str = "IPM.Note.SMIME.MultipartSigned";
/// Message class of opaque S/MIME mail.
pub const SMIME_CLASS: &str = "IPM.Note.SMIME";
/// Message class of ordinary mail.
pub const NOTE_CLASS: &str = "IPM.Note";

/// PST interface over a `readpst -t e` directory expansion.
///
/// Folders become directories and messages become `.eml` files; MAPI
/// properties that do not survive the expansion are reconstructed from the
/// message structure.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmlReader;

impl PstReader for EmlReader {
    type File = EmlArchive;

    fn open(&self, path: &Path) -> Result<EmlArchive> {
        anyhow::ensure!(path.is_dir(), "{} is not a directory", path.display());
        Ok(EmlArchive {
            root: path.to_path_buf(),
        })
    }
}

/// An expanded archive rooted at one directory.
#[derive(Debug)]
pub struct EmlArchive {
    root: PathBuf,
}

impl PstFile for EmlArchive {
    type Folder = EmlFolder;

    fn root_folder(&self) -> Result<EmlFolder> {
        Ok(EmlFolder::at(self.root.clone()))
    }
}

#[derive(Debug)]
pub struct EmlFolder {
    path: PathBuf,
    name: String,
}

impl EmlFolder {
    fn at(path: PathBuf) -> EmlFolder {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        EmlFolder { path, name }
    }
}

impl PstFolder for EmlFolder {
    type Message = EmlMessage;

    fn display_name(&self) -> &str {
        &self.name
    }

    fn sub_folders(&self) -> Result<Vec<EmlFolder>> {
        let mut folders = Vec::new();
        for entry in fs::read_dir(&self.path)
            .with_context(|| format!("cannot read folder {}", self.path.display()))?
        {
            let path = entry?.path();
            if path.is_dir() {
                folders.push(EmlFolder::at(path));
            }
        }
        folders.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(folders)
    }

    fn messages(&self) -> Result<Vec<EmlMessage>> {
        let mut messages = Vec::new();
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.path)
            .with_context(|| format!("cannot read folder {}", self.path.display()))?
        {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "eml") {
                paths.push(path);
            }
        }
        paths.sort();
        for path in paths {
            let raw =
                fs::read(&path).with_context(|| format!("cannot read {}", path.display()))?;
            messages.push(EmlMessage { path, raw });
        }
        Ok(messages)
    }
}

#[derive(Debug)]
pub struct EmlMessage {
    path: PathBuf,
    raw: Vec<u8>,
}

impl EmlMessage {
    fn content_type(&self) -> String {
        mailparse::parse_headers(&self.raw)
            .map(|(headers, _)| headers.get_first_value("Content-Type").unwrap_or_default())
            .unwrap_or_default()
    }
}

impl PstMessage for EmlMessage {
    type Attachment = EmlAttachment;

    fn envelope(&self) -> Result<MessageEnvelope> {
        let (headers, _) = mailparse::parse_headers(&self.raw)
            .with_context(|| format!("cannot parse {}", self.path.display()))?;
        let get = |name: &str| headers.get_first_value(name).unwrap_or_default();
        let sender_name = headers
            .get_first_header("From")
            .and_then(|header| mailparse::addrparse_header(header).ok())
            .and_then(|list| list.extract_single_info())
            .and_then(|info| info.display_name)
            .unwrap_or_default();
        let date_ns = headers
            .get_first_value("Date")
            .and_then(|date| mailparse::dateparse(&date).ok())
            .map(|secs| secs.saturating_mul(1_000_000_000))
            .unwrap_or_default();
        let content_type = get("Content-Type");
        let has_attachments = get("X-MS-Has-Attach").eq_ignore_ascii_case("yes")
            || content_type.contains("multipart/mixed")
            || content_type.contains("pkcs7-mime");
        Ok(MessageEnvelope {
            from: get("From"),
            sender_name,
            to: get("To"),
            cc: get("Cc"),
            bcc: get("Bcc"),
            subject: get("Subject"),
            date_ns,
            message_id: get("Message-ID"),
            has_attachments,
        })
    }

    fn message_class(&self) -> Result<String> {
        let content_type = self.content_type();
        let class = if content_type.contains("multipart/signed") {
            MULTIPART_SIGNED_CLASS
        } else if content_type.contains("pkcs7-mime") {
            SMIME_CLASS
        } else {
            NOTE_CLASS
        };
        Ok(class.to_string())
    }

    fn transport_headers(&self) -> Result<String> {
        let (_, body_offset) = mailparse::parse_headers(&self.raw)
            .with_context(|| format!("cannot parse {}", self.path.display()))?;
        Ok(String::from_utf8_lossy(&self.raw[..body_offset]).to_string())
    }

    fn attachments(&self) -> Result<Vec<EmlAttachment>> {
        let content_type = self.content_type();
        // An S/MIME message is its own payload: Outlook stores the signed
        // or enveloped entity as the one attachment, and the expansion
        // keeps that shape.
        if content_type.contains("multipart/signed") || content_type.contains("pkcs7-mime") {
            let filename = if content_type.contains("pkcs7-mime") {
                "smime.p7m"
            } else {
                "smime.p7s"
            };
            return Ok(vec![EmlAttachment {
                raw: self.raw.clone(),
                mime_tag: mime_of(&content_type),
                filename: Some(filename.to_string()),
                identifier: 0,
            }]);
        }

        let mail = mailparse::parse_mail(&self.raw)
            .with_context(|| format!("cannot parse {}", self.path.display()))?;
        let mut attachments = Vec::new();
        for (index, part) in mail.subparts.iter().enumerate() {
            let disposition = part.get_content_disposition();
            if disposition.disposition != mailparse::DispositionType::Attachment {
                continue;
            }
            attachments.push(EmlAttachment {
                raw: part.get_body_raw().unwrap_or_default(),
                mime_tag: part.ctype.mimetype.clone(),
                filename: disposition.params.get("filename").cloned(),
                identifier: index as u32,
            });
        }
        Ok(attachments)
    }
}

fn mime_of(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

#[derive(Debug)]
pub struct EmlAttachment {
    raw: Vec<u8>,
    mime_tag: String,
    filename: Option<String>,
    identifier: u32,
}

impl PstAttachment for EmlAttachment {
    fn mime_tag(&self) -> Result<Option<String>> {
        Ok(Some(self.mime_tag.clone()))
    }

    fn long_filename(&self) -> Result<Option<String>> {
        Ok(self.filename.clone())
    }

    fn identifier(&self) -> Result<u32> {
        Ok(self.identifier)
    }

    fn write_to(&self, out: &mut dyn Write) -> Result<u64> {
        out.write_all(&self.raw)?;
        Ok(self.raw.len() as u64)
    }
}
