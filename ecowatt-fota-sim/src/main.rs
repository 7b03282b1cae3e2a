//! Host-side EcoWatt device simulator
//!
//! Runs one FOTA cycle of the real update engine against a live server,
//! keeping the state record and the staged image in a directory so an
//! interrupted run (Ctrl-C mid-stream) resumes where it stopped.
//!
//! Usage: cargo run -p ecowatt-fota-sim -- --api-base http://127.0.0.1:5000 --state-dir /tmp/ecowatt

use anyhow::{Context, Result};
use clap::Parser;
use ecowatt_fota_lib::{Fota, FotaApi, FotaKeys, FotaOutcome};
use env_logger::Env;
use log::{error, info, warn};
use std::path::PathBuf;
use std::time::Duration;

mod flash;
mod http;
mod store;

use flash::FileFlashWriter;
use http::ReqwestClient;
use store::FileStateStore;

/// Development keys shared with the mock server.
const DEV_ENC_KEY: &str = "603deb1015ca71be2b73aef0857d7781";
const DEV_MAC_KEY: &str = "603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4";

#[derive(Parser, Debug)]
#[command(name = "ecowatt-fota-sim")]
#[command(about = "Run one EcoWatt FOTA cycle against a live server")]
struct Args {
    /// Base URL of the FOTA endpoints
    #[arg(short, long, default_value = "http://127.0.0.1:5000")]
    api_base: String,

    /// Version the simulated device is running
    #[arg(short, long, default_value = "1.0.0")]
    current_version: String,

    /// Directory holding the state record and image files
    #[arg(short, long)]
    state_dir: PathBuf,

    /// Identifier sent in reports
    #[arg(short, long, default_value = "SIM:00:00:00:00:01")]
    device_id: String,

    /// AES-128 content key (hex)
    #[arg(long, default_value = DEV_ENC_KEY)]
    enc_key: String,

    /// HMAC-SHA-256 key (hex)
    #[arg(long, default_value = DEV_MAC_KEY)]
    mac_key: String,

    /// Per-request HTTP timeout in milliseconds
    #[arg(long, default_value = "4500")]
    timeout_ms: u64,

    /// Verbose output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    let keys = FotaKeys::from_hex(&args.enc_key, &args.mac_key).context("invalid key")?;
    let client = ReqwestClient::new(Duration::from_millis(args.timeout_ms))?;
    let transport = FotaApi::new(&args.api_base, args.device_id.as_str(), client);
    let store = FileStateStore::new(&args.state_dir)
        .with_context(|| format!("opening {}", args.state_dir.display()))?;
    let flash = FileFlashWriter::new(&args.state_dir);

    info!(
        "Simulating device {} running {} against {}",
        args.device_id, args.current_version, args.api_base
    );
    let mut fota = Fota::new(transport, store, flash, keys);
    match fota.run(&args.current_version) {
        FotaOutcome::UpToDate => info!("Up to date"),
        FotaOutcome::RebootPending { version } => {
            info!("Installed {version}; rerun with --current-version {version} to confirm boot");
        }
        FotaOutcome::Aborted(e) if e.is_transient() => {
            warn!("Update interrupted: {e}; rerun to resume");
        }
        FotaOutcome::Aborted(e) => {
            error!("Update failed: {e}");
            std::process::exit(1);
        }
    }
    Ok(())
}
