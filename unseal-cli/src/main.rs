//! Command-line driver for the unseal pipeline.
//!
//! Subcommands map to the case workflow: `init` scaffolds a case
//! directory, `get-keys` escrows the custodian keys, `get-sigs` harvests
//! signer identities, `decipher` produces the plaintext deliverables and
//! `get-headers` extracts header metadata. Paths come from `config.yaml`
//! and can be overridden per flag; flags win.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use unseal::config::Config;
use unseal::keyring::{self, Keyring};
use unseal::pst::EmlReader;
use unseal::{harvest, headers, pipeline, readpst};

#[derive(Parser)]
#[command(name = "unseal", version, about = "Forensic S/MIME decryption pipeline")]
struct Cli {
    /// Case configuration file.
    #[arg(long, global = true, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scaffold a case directory and write an example config.
    Init,
    /// Extract encryption keys from the p12 containers.
    ///
    /// Enter filenames and passwords in the config and create one master
    /// password for the whole case; it is required again by decipher.
    /// No key is ever stored in plain text.
    GetKeys {
        #[arg(long = "p12Dir")]
        p12_dir: Option<String>,
        #[arg(long = "keysDir")]
        keys_dir: Option<String>,
        #[arg(long = "certDir")]
        cert_dir: Option<String>,
        #[arg(long = "casePW")]
        case_pw: Option<String>,
    },
    /// Decipher the ciphertext corpus into plaintext deliverables.
    Decipher {
        /// Dir of ciphertext input, one subfolder per custodian.
        #[arg(long)]
        ct: Option<String>,
        /// Dir for plaintext output, one subfolder per custodian.
        #[arg(long)]
        pt: Option<String>,
        #[arg(long = "keysDir")]
        keys_dir: Option<String>,
        #[arg(long = "certDir")]
        cert_dir: Option<String>,
        #[arg(long = "casePW")]
        case_pw: Option<String>,
        /// Treat the input as loose .eml files instead of PST archives.
        #[arg(long)]
        eml: bool,
        /// Multithreaded readpst when unpacking.
        #[arg(long)]
        parallel: bool,
    },
    /// Harvest custodian identities from signed mail in Sent Items.
    GetSigs {
        #[arg(long = "pstDir")]
        pst_dir: Option<String>,
        #[arg(long = "custodianInfoDir")]
        custodian_info_dir: Option<String>,
    },
    /// Extract header metadata, one level deep, into per-custodian reports.
    GetHeaders {
        #[arg(long)]
        header_in: Option<String>,
        #[arg(long)]
        header_out: Option<String>,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    if let Err(err) = run().await {
        log::error!("Fatal error: {err:#}.");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // configuration and usage errors exit 1, not clap's default 2
    let cli = Cli::try_parse().unwrap_or_else(|err| {
        let code = if err.use_stderr() { 1 } else { 0 };
        let _ = err.print();
        std::process::exit(code);
    });
    let mut config = Config::load_or_default(&cli.config)?;
    match cli.command {
        Command::Init => init(),
        Command::GetKeys {
            p12_dir,
            keys_dir,
            cert_dir,
            case_pw,
        } => {
            overlay(&mut config.keys.p12_dir, p12_dir);
            overlay(&mut config.keys.keys_dir, keys_dir);
            overlay(&mut config.keys.cert_dir, cert_dir);
            overlay(&mut config.keys.case_pw, case_pw);
            get_keys(&config)
        }
        Command::Decipher {
            ct,
            pt,
            keys_dir,
            cert_dir,
            case_pw,
            eml,
            parallel,
        } => {
            overlay(&mut config.decipher.ct, ct);
            overlay(&mut config.decipher.pt, pt);
            overlay(&mut config.keys.keys_dir, keys_dir);
            overlay(&mut config.keys.cert_dir, cert_dir);
            overlay(&mut config.keys.case_pw, case_pw);
            config.decipher.eml |= eml;
            config.decipher.parallel |= parallel;
            decipher(&config).await
        }
        Command::GetSigs {
            pst_dir,
            custodian_info_dir,
        } => {
            overlay(&mut config.signed.pst_dir, pst_dir);
            overlay(&mut config.signed.custodian_info_dir, custodian_info_dir);
            get_sigs(&config).await
        }
        Command::GetHeaders {
            header_in,
            header_out,
        } => {
            overlay(&mut config.header.header_in, header_in);
            overlay(&mut config.header.header_out, header_out);
            get_headers(&config).await
        }
    }
}

fn overlay(slot: &mut String, flag: Option<String>) {
    if let Some(value) = flag {
        *slot = value;
    }
}

const CASE_DIRS: [&str; 9] = [
    "p12",
    "keys",
    "certs",
    "signedPSTs",
    "custodianInfo",
    "ct",
    "pt",
    "header_in",
    "header_out",
];

fn init() -> Result<()> {
    println!("Scaffolding case folders and creating example config.");
    for dir in CASE_DIRS {
        fs::create_dir(dir).with_context(|| format!("unable to mkdir {dir}"))?;
    }
    fs::write("config.example.yaml", Config::example_yaml())
        .context("unable to create config file")?;
    Ok(())
}

fn get_keys(config: &Config) -> Result<()> {
    if config.keys.case_pw.is_empty() {
        bail!("case password not configured");
    }
    // form full p12 paths from the configured dir
    let mut inputs = config.keys.p12_pws.clone();
    for input in &mut inputs {
        input.filename = Path::new(&config.keys.p12_dir)
            .join(&input.filename)
            .to_string_lossy()
            .to_string();
    }
    keyring::materialize(
        &inputs,
        &config.keys.case_pw,
        Path::new(&config.keys.keys_dir),
        Path::new(&config.keys.cert_dir),
    )
}

async fn decipher(config: &Config) -> Result<()> {
    if config.keys.case_pw.is_empty() {
        bail!("case password not configured");
    }
    let ring = Keyring::load(
        Path::new(&config.keys.cert_dir),
        Path::new(&config.keys.keys_dir),
        &config.keys.case_pw,
    )?;
    let scratch = tempfile::tempdir().context("cannot create unpack dir")?;
    pipeline::decipher_case(
        Path::new(&config.decipher.ct),
        Path::new(&config.decipher.pt),
        &ring,
        config.decipher.eml,
        config.decipher.parallel,
        scratch.path(),
    )
    .await?;
    log::info!("DONE!");
    Ok(())
}

async fn get_sigs(config: &Config) -> Result<()> {
    let pst_dir = Path::new(&config.signed.pst_dir);
    let out_dir = Path::new(&config.signed.custodian_info_dir);
    let scratch = tempfile::tempdir().context("cannot create unpack dir")?;
    let archives = expand_archives(pst_dir, scratch.path()).await?;
    harvest::harvest_archives(Arc::new(EmlReader), archives, out_dir).await
}

async fn get_headers(config: &Config) -> Result<()> {
    let header_in = Path::new(&config.header.header_in);
    let header_out = Path::new(&config.header.header_out);
    let scratch = tempfile::tempdir().context("cannot create unpack dir")?;

    let mut expanded: HashMap<PathBuf, Vec<PathBuf>> = HashMap::new();
    for (index, custodian) in sub_directories(header_in)?.into_iter().enumerate() {
        let dest = scratch.path().join(index.to_string());
        fs::create_dir_all(&dest)?;
        expanded.insert(custodian.clone(), expand_archives(&custodian, &dest).await?);
    }
    headers::scan_case(&EmlReader, header_in, header_out, |custodian| {
        Ok(expanded.get(custodian).cloned().unwrap_or_default())
    })
}

/// Expands every archive under `input` into `scratch` and returns the
/// directories the eml reader should open. Pre-expanded trees (plain
/// subdirectories) are used as they are.
async fn expand_archives(input: &Path, scratch: &Path) -> Result<Vec<PathBuf>> {
    let mut archives = sub_directories(input)?;
    let jobs = readpst::job_count(false);
    for (index, pst) in pst_files(input)?.into_iter().enumerate() {
        let dest = scratch.join(format!("pst-{index}"));
        fs::create_dir_all(&dest)
            .with_context(|| format!("cannot create unpack dir {}", dest.display()))?;
        readpst::unpack(&pst, &dest, jobs).await?;
        archives.push(dest);
    }
    Ok(archives)
}

fn sub_directories(dir: &Path) -> Result<Vec<PathBuf>> {
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

fn pst_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("cannot read dir {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "pst") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
