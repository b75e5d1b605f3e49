//! # Unseal: forensic S/MIME decryption pipeline.
//!
//! Given a corpus of encrypted S/MIME email (loose `.eml` files or the
//! contents of Outlook PST archives) and the recipients' escrowed PKCS#12
//! identities, this crate recovers the plaintext messages for e-discovery
//! delivery. Three subsystems cooperate:
//!
//! * [`keyring`] turns PKCS#12 containers into an on-disk escrow of
//!   PKCS#8-encrypted keys and DER certificates, and rehydrates them into
//!   an in-memory [`keyring::Keyring`] for a run.
//! * [`decrypt`] walks one RFC 5322 message at a time, unwrapping every
//!   CMS envelope it finds, including envelopes nested inside forwarded
//!   messages, while keeping the outer transport headers intact.
//! * [`harvest`] collects signer identities from signed outbound mail so
//!   the case team knows which escrowed keys to request.
//!
//! [`pipeline`] drives the per-custodian decipher runs and the exception
//! reports; [`pst`] holds the interface to the external PST reader.
//!
//! Nothing here re-encrypts, re-signs or verifies signatures: signed
//! messages are opaque transport and are passed through unmodified.

pub mod config;
pub mod decrypt;
pub mod harvest;
pub mod headers;
pub mod keyring;
pub mod pipeline;
pub mod pst;
pub mod readpst;
pub mod report;
pub mod smime;
pub(crate) mod tools;

#[cfg(test)]
pub(crate) mod test_utils;
