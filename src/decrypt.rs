//! Recursive S/MIME envelope unwrapping.
//!
//! [`unwrap_message`] takes the raw bytes of one RFC 5322 entity and
//! rebuilds it with every CMS envelope replaced by its plaintext. Signed
//! and plaintext messages flow through byte-for-byte; `message/rfc822`
//! parts are recursed into so envelopes inside forwarded mail unwrap too.
//!
//! Classification happens on the raw bytes before any MIME parsing: some
//! malformed messages fail a strict parse but must still route correctly,
//! so the pre-parse scan is authoritative for the pass-through decision.

use anyhow::{bail, Context as _, Result};
use mailparse::MailHeader;
use once_cell::sync::Lazy;
use regex::bytes::Regex;

use crate::keyring::Keyring;
use crate::smime;
use crate::tools::{decode_base64_body, raw_body, unfold_header_value};

/// The enveloped payload always travels as an `smime.p7m` attachment,
/// quoted or not.
static SMIME_ATTACHMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"filename="?smime\.p7m"?"#).unwrap());
/// Marker of clear- and opaque-signed transport.
static SIGNED_DATA: Lazy<Regex> = Lazy::new(|| Regex::new("smime-type=signed-data").unwrap());
static RFC822_PART: Lazy<Regex> = Lazy::new(|| Regex::new("message/rfc822").unwrap());

/// Headers owned by the envelope; the decrypted inner message supplies
/// its own when a plain envelope is unwrapped.
const ENVELOPE_HEADERS: [&str; 4] = [
    "Content-Type",
    "Content-Transfer-Encoding",
    "Content-Disposition",
    "X-MS-Has-Attach",
];

/// Unwraps every envelope in `input`.
///
/// Returns the reconstructed message and whether any ciphertext was
/// traversed. When the flag is false the bytes are the input, unchanged:
/// that is the pass-through path for plaintext and signed-only messages.
pub fn unwrap_message(input: &[u8], keyring: &Keyring) -> Result<(Vec<u8>, bool)> {
    let has_smime = SMIME_ATTACHMENT.is_match(input);
    let is_signed = SIGNED_DATA.is_match(input);
    if is_signed || !has_smime {
        return Ok((input.to_vec(), false));
    }
    // A plain envelope takes its real headers and framing from the
    // decrypted inner message. A message that also nests rfc822 content
    // keeps its own structure and unwraps inside it.
    let unwrap_envelope = !RFC822_PART.is_match(input);

    let mail = mailparse::parse_mail(input).context("cannot parse message")?;
    let mut out = Vec::with_capacity(input.len());
    let mut found_ciphertext = false;

    emit_headers(&mut out, &mail.headers, unwrap_envelope);

    // A bare pkcs7 entity is itself the ciphertext leaf. This is how a
    // decrypted payload that is another envelope comes back around.
    if mail.ctype.mimetype.contains("pkcs7") {
        let plain = decipher_leaf(raw_body(&mail), keyring)?;
        let (child, _) = unwrap_message(&plain, keyring)?;
        out.extend_from_slice(&child);
        return Ok((out, true));
    }

    if !mail.ctype.mimetype.starts_with("multipart/") {
        bail!("unsupported content type {}", mail.ctype.mimetype);
    }
    let boundary = mail
        .ctype
        .params
        .get("boundary")
        .cloned()
        .unwrap_or_default();

    for part in &mail.subparts {
        if !unwrap_envelope {
            out.extend_from_slice(format!("\n--{boundary}\n").as_bytes());
        }
        let body = raw_body(part);
        if part.ctype.mimetype.contains("message/rfc822") {
            out.extend_from_slice(b"Content-Type: message/rfc822\n\n");
            let (child, child_found) = unwrap_message(body, keyring)?;
            found_ciphertext |= child_found;
            out.extend_from_slice(&child);
        } else if part.ctype.mimetype.contains("pkcs7") && !SIGNED_DATA.is_match(part.raw_bytes) {
            found_ciphertext = true;
            let plain = decipher_leaf(body, keyring)?;
            let (child, _) = unwrap_message(&plain, keyring)?;
            out.extend_from_slice(&child);
        } else {
            emit_headers(&mut out, &part.headers, false);
            out.push(b'\n');
            out.extend_from_slice(body);
        }
    }
    if !unwrap_envelope {
        out.extend_from_slice(format!("\n--{boundary}--\n").as_bytes());
    }

    Ok((out, found_ciphertext))
}

/// Base64-decodes a ciphertext body and hands it to the decipher
/// primitive.
fn decipher_leaf(body: &[u8], keyring: &Keyring) -> Result<Vec<u8>> {
    let der = decode_base64_body(body)?;
    Ok(smime::decipher(&der, keyring)?)
}

/// Emits headers in first-appearance order, repeated keys joined with
/// continuation whitespace.
fn emit_headers(out: &mut Vec<u8>, headers: &[MailHeader<'_>], filter_envelope: bool) {
    let mut ordered: Vec<(String, Vec<String>)> = Vec::new();
    for header in headers {
        let key = header.get_key();
        if filter_envelope
            && ENVELOPE_HEADERS
                .iter()
                .any(|name| name.eq_ignore_ascii_case(&key))
        {
            continue;
        }
        let value = unfold_header_value(header.get_value_raw());
        match ordered
            .iter_mut()
            .find(|(seen, _)| seen.eq_ignore_ascii_case(&key))
        {
            Some((_, values)) => values.push(value),
            None => ordered.push((key, vec![value])),
        }
    }
    for (key, values) in ordered {
        out.extend_from_slice(format!("{}: {}\n", key, values.join("\n    ")).as_bytes());
    }
}
