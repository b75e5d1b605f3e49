//! Signer-identity harvesting from signed outbound mail.
//!
//! The case team needs to know which escrowed keys to request before any
//! decryption can happen. This module walks the custodians' Sent Items,
//! pulls the signer certificate out of every clear-signed message and
//! emits a deduplicated roster of common names.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use cms::cert::CertificateChoices;
use cms::content_info::ContentInfo;
use cms::signed_data::{SignedData, SignerIdentifier};
use const_oid::db::rfc5911::ID_SIGNED_DATA;
use const_oid::AssociatedOid as _;
use der::Decode as _;
use mailparse::MailHeaderMap as _;
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::SubjectAltName;
use x509_cert::Certificate;

use crate::pst::{
    PstAttachment, PstFile, PstFolder, PstMessage, PstReader, MULTIPART_SIGNED_CLASS,
};
use crate::report::{LogFile, PST_COLUMNS};
use crate::tools::{decode_base64_body, raw_body, serial_hex};

/// Identity harvested from one signer certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerIdentity {
    /// Subject common name, `LAST.FIRST.MIDDLE.EDIPI`.
    pub common_name: String,
    pub last: String,
    pub first: String,
    pub middle: String,
    /// The personnel number trailing the common name.
    pub edipi: String,
    /// SAN rfc822 addresses.
    pub emails: Vec<String>,
    /// SAN DNS names, or `{edipi}@mil` when the cert carries none.
    pub upns: Vec<String>,
    pub serial_hex: String,
    pub issuer_dn: String,
    pub issuer_cn: String,
    /// RFC 3339 validity bounds.
    pub not_before: String,
    pub not_after: String,
}

impl SignerIdentity {
    /// Builds an identity record from a signer certificate.
    pub fn from_certificate(cert: &Certificate) -> Result<SignerIdentity> {
        let tbs = &cert.tbs_certificate;
        let common_name =
            common_name_of(&tbs.subject).context("signer certificate has no common name")?;

        let parts: Vec<&str> = common_name.split('.').collect();
        let last = parts.first().copied().unwrap_or_default().to_string();
        let first = parts.get(1).copied().unwrap_or_default().to_string();
        let middle = if parts.len() == 4 { parts[2] } else { "" }.to_string();
        let edipi = parts.last().copied().unwrap_or_default().to_string();

        let (emails, dns_names) = subject_alt_names(cert)?;
        let upns = if dns_names.is_empty() {
            vec![format!("{edipi}@mil")]
        } else {
            dns_names
        };

        Ok(SignerIdentity {
            common_name,
            last,
            first,
            middle,
            edipi,
            emails,
            upns,
            serial_hex: serial_hex(tbs.serial_number.as_bytes()),
            issuer_dn: tbs.issuer.to_string(),
            issuer_cn: common_name_of(&tbs.issuer).unwrap_or_default(),
            not_before: tbs.validity.not_before.to_date_time().to_string(),
            not_after: tbs.validity.not_after.to_date_time().to_string(),
        })
    }

    /// Deduplication key across the whole harvest.
    pub fn dedup_key(&self) -> (String, String) {
        (self.issuer_cn.clone(), self.serial_hex.clone())
    }
}

/// Harvests every archive and writes `{out_dir}/commonName.txt`.
///
/// One producer task per archive feeds a collector over an unbounded
/// channel; the channel closing when the last producer drops its sender is
/// the termination signal. Per-archive failures land in
/// `{out_dir}/corruptExceptions.csv` and do not stop the run.
pub async fn harvest_archives<R: PstReader>(
    reader: Arc<R>,
    archives: Vec<PathBuf>,
    out_dir: &Path,
) -> Result<()> {
    if archives.is_empty() {
        bail!("input dir is empty");
    }
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("cannot create output dir {}", out_dir.display()))?;

    let (tx, rx) = async_channel::unbounded::<HarvestEvent>();
    let mut producers = Vec::new();
    for archive in archives {
        let reader = Arc::clone(&reader);
        let tx = tx.clone();
        producers.push(tokio::task::spawn_blocking(move || {
            if let Err(err) = scan_archive(reader.as_ref(), &archive, &tx) {
                let _ = tx.send_blocking(HarvestEvent::ArchiveError {
                    archive: archive.to_string_lossy().to_string(),
                    error: format!("{err:#}"),
                });
            }
        }));
    }
    drop(tx);

    let mut identities: HashMap<(String, String), SignerIdentity> = HashMap::new();
    let mut corrupt_log: Option<LogFile> = None;
    while let Ok(event) = rx.recv().await {
        match event {
            HarvestEvent::Identity(identity) => {
                log::info!("found signer {}", identity.common_name);
                identities.insert(identity.dedup_key(), identity);
            }
            HarvestEvent::ArchiveError { archive, error } => {
                log::warn!("skipping archive {archive}: {error}");
                if corrupt_log.is_none() {
                    corrupt_log = Some(LogFile::open(
                        &out_dir.join("corruptExceptions.csv"),
                        PST_COLUMNS,
                    )?);
                }
                if let Some(log) = corrupt_log.as_mut() {
                    log.write_row(&[&archive, &error])?;
                }
            }
        }
    }
    for producer in producers {
        producer.await.context("harvest producer panicked")?;
    }

    let mut names: Vec<&str> = identities
        .values()
        .map(|identity| identity.common_name.as_str())
        .collect();
    names.sort_unstable();
    names.dedup();
    let out_path = out_dir.join("commonName.txt");
    std::fs::write(&out_path, names.join("\n") + "\n")
        .with_context(|| format!("cannot write {}", out_path.display()))?;
    log::info!("wrote {} unique common names", names.len());
    Ok(())
}

enum HarvestEvent {
    Identity(SignerIdentity),
    ArchiveError { archive: String, error: String },
}

fn scan_archive<R: PstReader>(
    reader: &R,
    path: &Path,
    tx: &async_channel::Sender<HarvestEvent>,
) -> Result<()> {
    let archive = reader.open(path)?;
    let root = archive.root_folder()?;
    scan_folder(&root, tx)
}

fn scan_folder<F: PstFolder>(folder: &F, tx: &async_channel::Sender<HarvestEvent>) -> Result<()> {
    if is_sent_items(folder.display_name()) {
        // one message at a time; the underlying reader is not safe for
        // concurrent use within an archive
        for message in folder.messages()? {
            if message.message_class()? != MULTIPART_SIGNED_CLASS {
                continue;
            }
            scan_message(&message, tx)?;
        }
    }
    for sub in folder.sub_folders()? {
        scan_folder(&sub, tx)?;
    }
    Ok(())
}

/// Case variants observed in legacy archives.
fn is_sent_items(display_name: &str) -> bool {
    display_name == "Sent Items" || display_name == "sent items"
}

fn scan_message<M: PstMessage>(
    message: &M,
    tx: &async_channel::Sender<HarvestEvent>,
) -> Result<()> {
    for attachment in message.attachments()? {
        let Some(tag) = attachment.mime_tag()? else {
            continue;
        };
        if !tag.contains("multipart/signed") {
            continue;
        }
        let raw = attachment.read_to_vec()?;
        for identity in identities_from_signed_entity(&raw) {
            let _ = tx.send_blocking(HarvestEvent::Identity(identity));
        }
    }
    Ok(())
}

/// Steps through the parts of a `multipart/signed` entity and extracts
/// the signer identity from every PKCS#7 signature found.
pub fn identities_from_signed_entity(raw: &[u8]) -> Vec<SignerIdentity> {
    let Ok(mail) = mailparse::parse_mail(raw) else {
        return Vec::new();
    };
    let mut identities = Vec::new();
    for part in &mail.subparts {
        let encoding = part
            .headers
            .get_first_value("Content-Transfer-Encoding")
            .unwrap_or_default();
        if !encoding.eq_ignore_ascii_case("base64") {
            continue;
        }
        match signer_from_part(raw_body(part)) {
            Ok(identity) => identities.push(identity),
            Err(err) => log::debug!("skipping part: {err:#}"),
        }
    }
    identities
}

fn signer_from_part(body: &[u8]) -> Result<SignerIdentity> {
    let der = decode_base64_body(body)?;
    let content_info = ContentInfo::from_der(&der).context("not a CMS structure")?;
    if content_info.content_type != ID_SIGNED_DATA {
        bail!("not a signed-data bag");
    }
    let signed: SignedData = content_info
        .content
        .decode_as()
        .context("malformed signed-data")?;
    SignerIdentity::from_certificate(&only_signer(&signed)?)
}

/// Resolves the signer certificate of a single-signer bag.
fn only_signer(signed: &SignedData) -> Result<Certificate> {
    let mut infos = signed.signer_infos.0.iter();
    let (Some(signer), None) = (infos.next(), infos.next()) else {
        bail!("expected exactly one signer");
    };
    let SignerIdentifier::IssuerAndSerialNumber(id) = &signer.sid else {
        bail!("signer is not identified by issuer and serial");
    };
    let certificates = signed
        .certificates
        .as_ref()
        .context("signed-data carries no certificates")?;
    for choice in certificates.0.iter() {
        if let CertificateChoices::Certificate(cert) = choice {
            if cert.tbs_certificate.issuer == id.issuer
                && cert.tbs_certificate.serial_number == id.serial_number
            {
                return Ok(cert.clone());
            }
        }
    }
    bail!("no embedded certificate matches the signer")
}

fn common_name_of(name: &x509_cert::name::Name) -> Option<String> {
    for rdn in name.0.iter() {
        for atav in rdn.0.iter() {
            if atav.oid == const_oid::db::rfc4519::CN {
                return directory_string(&atav.value);
            }
        }
    }
    None
}

fn directory_string(value: &der::Any) -> Option<String> {
    use der::asn1::{Ia5StringRef, PrintableStringRef, Utf8StringRef};
    if let Ok(s) = value.decode_as::<Utf8StringRef<'_>>() {
        return Some(s.to_string());
    }
    if let Ok(s) = value.decode_as::<PrintableStringRef<'_>>() {
        return Some(s.to_string());
    }
    if let Ok(s) = value.decode_as::<Ia5StringRef<'_>>() {
        return Some(s.to_string());
    }
    None
}

fn subject_alt_names(cert: &Certificate) -> Result<(Vec<String>, Vec<String>)> {
    let mut emails = Vec::new();
    let mut dns_names = Vec::new();
    if let Some(extensions) = &cert.tbs_certificate.extensions {
        for extension in extensions {
            if extension.extn_id != SubjectAltName::OID {
                continue;
            }
            let san = SubjectAltName::from_der(extension.extn_value.as_bytes())
                .context("malformed subjectAltName")?;
            for name in san.0 {
                match name {
                    GeneralName::Rfc822Name(addr) => emails.push(addr.to_string()),
                    GeneralName::DnsName(dns) => dns_names.push(dns.to_string()),
                    _ => {}
                }
            }
        }
    }
    Ok((emails, dns_names))
}
