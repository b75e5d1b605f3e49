//! Keyring of recipient certificates and their RSA private keys.
//!
//! The keyring is materialized once per case: each PKCS#12 container from
//! the registration authority is opened with its issued password, the key
//! is validated and re-encrypted under the single case passphrase, and key
//! and certificate land on disk named by the certificate serial. Later
//! runs rehydrate the escrow into an in-memory [`Keyring`] that the
//! envelope walker borrows read-only.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context as _, Result};
use der::Decode;
use pkcs8::pkcs5::pbes2;
use pkcs8::{DecodePrivateKey as _, PrivateKeyInfo};
use rand::RngCore as _;
use rsa::pkcs1::DecodeRsaPublicKey as _;
use rsa::{RsaPrivateKey, RsaPublicKey};
use x509_cert::Certificate;

use crate::config::FnamePw;
use crate::tools::{serial_hex, set_mode};

/// PBKDF2 iteration count for the escrowed keys.
const PBKDF2_ITERATIONS: u32 = 600_000;

/// One recipient certificate paired with its private key.
///
/// The public key embedded in the certificate always matches the private
/// key; the constructor rejects mismatched material. The certificate
/// serial is the primary key within a case.
#[derive(Clone)]
pub struct CertKeyPair {
    cert: Certificate,
    cert_der: Vec<u8>,
    key: RsaPrivateKey,
    serial: String,
}

impl CertKeyPair {
    /// Pairs a DER certificate with a private key, verifying that they
    /// belong together.
    pub fn new(cert_der: &[u8], key: RsaPrivateKey) -> Result<CertKeyPair> {
        let cert = Certificate::from_der(cert_der).context("cannot parse certificate")?;
        let cert_public = certificate_public_key(&cert)?;
        let serial = serial_hex(cert.tbs_certificate.serial_number.as_bytes());
        if cert_public != RsaPublicKey::from(&key) {
            bail!("certificate {serial} does not match the private key");
        }
        Ok(CertKeyPair {
            cert,
            cert_der: cert_der.to_vec(),
            key,
            serial,
        })
    }

    pub fn certificate(&self) -> &Certificate {
        &self.cert
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.cert_der
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.key
    }

    /// The certificate serial as lowercase hex, as used for escrow
    /// filenames.
    pub fn serial_hex(&self) -> &str {
        &self.serial
    }
}

impl std::fmt::Debug for CertKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // key material stays out of logs
        f.debug_struct("CertKeyPair")
            .field("serial", &self.serial)
            .finish_non_exhaustive()
    }
}

/// An in-memory keyring.
///
/// Order is irrelevant for correctness but defines the try-order when an
/// envelope names several recipients.
#[derive(Debug, Default)]
pub struct Keyring {
    pairs: Vec<CertKeyPair>,
}

impl Keyring {
    /// New empty keyring.
    pub fn new() -> Keyring {
        Keyring { pairs: Vec::new() }
    }

    /// Add a pair to the keyring.
    pub fn add(&mut self, pair: CertKeyPair) {
        self.pairs.push(pair);
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// All pairs, in try-order.
    pub fn pairs(&self) -> &[CertKeyPair] {
        &self.pairs
    }

    /// Rehydrates the keyring from an escrow produced by [`materialize`].
    ///
    /// Walks `cert_dir`; for each certificate the matching
    /// `{key_dir}/{serial}.key` is decrypted with the case passphrase.
    /// Fails fast on the first unreadable, mismatched or wrongly-encrypted
    /// entry.
    pub fn load(cert_dir: &Path, key_dir: &Path, case_pw: &str) -> Result<Keyring> {
        let mut ring = Keyring::new();
        let mut cert_paths = Vec::new();
        for entry in fs::read_dir(cert_dir)
            .with_context(|| format!("cannot read cert dir {}", cert_dir.display()))?
        {
            let path = entry?.path();
            if path.is_file() {
                cert_paths.push(path);
            }
        }
        cert_paths.sort();

        for cert_path in cert_paths {
            let serial = cert_path
                .file_stem()
                .map(|stem| stem.to_string_lossy().to_string())
                .unwrap_or_default();
            let cert_der = fs::read(&cert_path)
                .with_context(|| format!("cannot read cert {}", cert_path.display()))?;
            let key_path = key_dir.join(format!("{serial}.key"));
            let key_bytes = fs::read(&key_path)
                .with_context(|| format!("no key matches cert {serial}"))?;
            let key = RsaPrivateKey::from_pkcs8_encrypted_der(&key_bytes, case_pw.as_bytes())
                .map_err(|err| {
                    anyhow!("cannot decrypt {} with the case passphrase: {err}", key_path.display())
                })?;
            let pair = CertKeyPair::new(&cert_der, key)
                .with_context(|| format!("loading escrow entry {serial}"))?;
            if pair.serial_hex() != serial {
                bail!(
                    "cert file {} carries serial {}",
                    cert_path.display(),
                    pair.serial_hex()
                );
            }
            ring.add(pair);
        }
        if ring.is_empty() {
            bail!("no certificates found in {}", cert_dir.display());
        }
        log::info!("loaded {} cert/key pairs", ring.len());
        Ok(ring)
    }
}

/// Extracts keys from PKCS#12 containers into the on-disk escrow.
///
/// Writes `{key_dir}/{serial}.key` (PKCS#8 EncryptedPrivateKeyInfo under
/// `case_pw`, PBES2 with PBKDF2-SHA256 and AES-256-CBC) and
/// `{cert_dir}/{serial}.cert` (raw DER), both mode `0o550`. Two inputs
/// resolving to the same serial abort the run.
pub fn materialize(
    inputs: &[FnamePw],
    case_pw: &str,
    key_dir: &Path,
    cert_dir: &Path,
) -> Result<()> {
    let mut seen = HashSet::new();
    for input in inputs {
        let (pair, key_der) = extract_one(Path::new(&input.filename), &input.password)
            .with_context(|| format!("extracting {}", input.filename))?;
        if !seen.insert(pair.serial_hex().to_string()) {
            bail!("serial collision across inputs: {}", pair.serial_hex());
        }
        escrow(&pair, &key_der, case_pw, key_dir, cert_dir)
            .with_context(|| format!("escrowing {}", input.filename))?;
        log::info!("escrowed key for serial {}", pair.serial_hex());
    }
    Ok(())
}

/// Opens one container and resolves its key and matching certificate.
fn extract_one(p12_path: &Path, p12_pw: &str) -> Result<(CertKeyPair, Vec<u8>)> {
    let raw = fs::read(p12_path)
        .with_context(|| format!("cannot open p12 file {}", p12_path.display()))?;
    let pfx = p12::PFX::parse(&raw).map_err(|err| anyhow!("cannot decode p12: {err:?}"))?;
    if !pfx.verify_mac(p12_pw) {
        bail!("wrong password for {}", p12_path.display());
    }

    let mut key_bags = pfx
        .key_bags(p12_pw)
        .map_err(|err| anyhow!("cannot decrypt key bags: {err:?}"))?;
    let Some(key_der) = key_bags.pop() else {
        bail!("container holds no private key");
    };
    if !key_bags.is_empty() {
        bail!("expected exactly one private key, found {}", key_bags.len() + 1);
    }
    let key = RsaPrivateKey::from_pkcs8_der(&key_der).context("key is not PKCS#8 RSA")?;
    key.validate().context("key invalid")?;
    let public = RsaPublicKey::from(&key);

    // Containers often bundle the CA chain; the recipient cert is the one
    // whose public key matches the extracted private key.
    let cert_bags = pfx
        .cert_x509_bags(p12_pw)
        .map_err(|err| anyhow!("cannot decrypt cert bags: {err:?}"))?;
    let cert_der = cert_bags
        .iter()
        .find(|der| {
            Certificate::from_der(der)
                .ok()
                .and_then(|cert| certificate_public_key(&cert).ok())
                .is_some_and(|cert_public| cert_public == public)
        })
        .context("no certificate in the container matches the private key")?;
    let pair = CertKeyPair::new(cert_der, key)?;
    Ok((pair, key_der))
}

/// Re-wraps the original private-key bytes under the case passphrase and
/// writes key and certificate next to each other, named by serial.
fn escrow(
    pair: &CertKeyPair,
    key_der: &[u8],
    case_pw: &str,
    key_dir: &Path,
    cert_dir: &Path,
) -> Result<()> {
    let mut salt = [0u8; 16];
    let mut iv = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut iv);
    let params = pbes2::Parameters::pbkdf2_sha256_aes256cbc(PBKDF2_ITERATIONS, &salt, &iv)
        .map_err(|err| anyhow!("cannot build PBES2 parameters: {err}"))?;
    let key_info = PrivateKeyInfo::try_from(key_der).context("key is not PKCS#8")?;
    let encrypted = key_info
        .encrypt_with_params(params, case_pw.as_bytes())
        .map_err(|err| anyhow!("cannot encrypt key under the case passphrase: {err}"))?;

    fs::create_dir_all(key_dir)?;
    fs::create_dir_all(cert_dir)?;
    let key_path = key_dir.join(format!("{}.key", pair.serial_hex()));
    fs::write(&key_path, encrypted.as_bytes())
        .with_context(|| format!("cannot save key to {}", key_path.display()))?;
    set_mode(&key_path, 0o550)?;
    let cert_path = cert_dir.join(format!("{}.cert", pair.serial_hex()));
    fs::write(&cert_path, pair.certificate_der())
        .with_context(|| format!("cannot save cert to {}", cert_path.display()))?;
    set_mode(&cert_path, 0o550)?;
    Ok(())
}

/// The RSA public key embedded in a certificate.
pub(crate) fn certificate_public_key(cert: &Certificate) -> Result<RsaPublicKey> {
    RsaPublicKey::from_pkcs1_der(
        cert.tbs_certificate
            .subject_public_key_info
            .subject_public_key
            .raw_bytes(),
    )
    .context("certificate does not carry an RSA public key")
}
