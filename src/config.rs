//! Case configuration.
//!
//! A case is driven by one YAML document; every path in it can also be set
//! from the command line, and flags win over the file.

use std::path::Path;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

/// The full configuration document for a case directory.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub decipher: DecipherConfig,
    pub keys: KeysConfig,
    pub signed: SignedConfig,
    pub header: HeaderConfig,
}

/// Settings for the decipher run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecipherConfig {
    /// Ciphertext input dir, one subfolder per custodian.
    pub ct: String,
    /// Plaintext output dir; a subfolder per custodian with a `logs` dir
    /// under each.
    pub pt: String,
    /// Let `readpst` use one worker per CPU when unpacking archives.
    pub parallel: bool,
    /// Input is loose `.eml` files instead of PST archives.
    pub eml: bool,
}

impl Default for DecipherConfig {
    fn default() -> Self {
        Self {
            ct: "ct".to_string(),
            pt: "pt".to_string(),
            parallel: false,
            eml: false,
        }
    }
}

/// Settings for keyring materialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Dir of PKCS#12 containers received from the RA/CA.
    #[serde(rename = "p12Dir")]
    pub p12_dir: String,
    /// Output dir for the re-encrypted PKCS#8 keys.
    #[serde(rename = "keysDir")]
    pub keys_dir: String,
    /// Output dir for the extracted DER certificates.
    #[serde(rename = "certDir")]
    pub cert_dir: String,
    /// Master passphrase protecting every escrowed key for this case.
    #[serde(rename = "casePW")]
    pub case_pw: String,
    /// Per-container passwords, as issued.
    #[serde(rename = "p12PWs")]
    pub p12_pws: Vec<FnamePw>,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            p12_dir: "p12".to_string(),
            keys_dir: "keys".to_string(),
            cert_dir: "certs".to_string(),
            case_pw: String::new(),
            p12_pws: Vec::new(),
        }
    }
}

/// Filename/password pair for one PKCS#12 container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FnamePw {
    pub filename: String,
    pub password: String,
}

/// Settings for the signer harvester.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignedConfig {
    /// Dir of PSTs holding signed mail sent by the custodians.
    #[serde(rename = "pstDir")]
    pub pst_dir: String,
    /// Output dir for `commonName.txt`.
    #[serde(rename = "custodianInfoDir")]
    pub custodian_info_dir: String,
}

impl Default for SignedConfig {
    fn default() -> Self {
        Self {
            pst_dir: "signedPSTs".to_string(),
            custodian_info_dir: "custodianInfo".to_string(),
        }
    }
}

/// Settings for header metadata extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderConfig {
    pub header_in: String,
    pub header_out: String,
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            header_in: "header_in".to_string(),
            header_out: "header_out".to_string(),
        }
    }
}

impl Config {
    /// Reads the YAML document at `path`.
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("cannot parse config {}", path.display()))
    }

    /// Reads the document at `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Config> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Config::default())
        }
    }

    /// The example document written by `init` when scaffolding a case.
    pub fn example_yaml() -> &'static str {
        EXAMPLE_CONFIG
    }
}

const EXAMPLE_CONFIG: &str = r#"decipher:
  ct: "ct" # Dir containing ciphertext emails. Make a subfolder for each custodian under this.
  pt: "pt" # Dir for output plaintext. There will be a subfolder for each custodian and a log folder under that.
  parallel: true # use multithreading in readpst when unpacking PST files
  eml: false # CT input will be loose .eml files instead of PST archives
keys:
  p12Dir: "p12" # Drop the p12 files you got from the Registration Authority here
  keysDir: "keys" # The actual keys extracted from the p12 containers.
  certDir: "certs" # Custodian public certificates extracted from the p12 containers.
  casePW: "" # Password you create to store the extracted keys. Create a *STRONG* pw and save it in a pw manager.
  p12PWs:
    - filename: "alice.p12" # 1st p12 file name
      password: "P@ssw0rd" # password for 1st p12 file
    - filename: "bob.p12" # 2nd p12 file name
      password: "S3cr3tSquirel" # password for 2nd p12 file
signed:
  pstDir: "signedPSTs" # Dir containing signed emails from custodians
  custodianInfoDir: "custodianInfo" # A txt file will be written here with custodian IDs.
header:
  header_in: "header_in" # Dir for input pst files. Make a subfolder for each custodian under this.
  header_out: "header_out" # Dir for output logs. There will be a subfolder for each custodian.
"#;
