//! Mock EcoWatt cloud FOTA service for exercising device update paths
//!
//! Usage: cargo run -p ecowatt-mock-fota-server -- --firmware build/app.bin --version 2.0.0
//! Then point the device (or ecowatt-fota-sim) at http://<host>:5000

use anyhow::{Context, Result};
use clap::Parser;
use ecowatt_fota_lib::FotaKeys;
use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use tiny_http::{Header, Server};

mod routes;

use routes::{Faults, FotaServer, Request, Response};

/// Development keys shared with the firmware.
const DEV_ENC_KEY: &str = "603deb1015ca71be2b73aef0857d7781";
const DEV_MAC_KEY: &str = "603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4";

/// Largest request body accepted (firmware uploads included).
const MAX_BODY_LEN: usize = 8 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "ecowatt-mock-fota")]
#[command(about = "Serve a firmware image over the EcoWatt FOTA endpoints")]
struct Args {
    /// Firmware image to publish at startup
    #[arg(short, long)]
    firmware: Option<PathBuf>,

    /// Version string of the published image
    #[arg(short, long, default_value = "2.0.0")]
    version: String,

    /// Port to listen on
    #[arg(short, long, default_value = "5000")]
    port: u16,

    /// Plaintext bytes per chunk (multiple of 16)
    #[arg(long, default_value = "1024")]
    chunk_size: u32,

    /// AES-128 content key (hex)
    #[arg(long, default_value = DEV_ENC_KEY)]
    enc_key: String,

    /// HMAC-SHA-256 key (hex)
    #[arg(long, default_value = DEV_MAC_KEY)]
    mac_key: String,

    /// Base IV (hex); derived from version and image when omitted
    #[arg(long)]
    iv: Option<String>,

    /// Flip a ciphertext bit in this chunk (once)
    #[arg(long)]
    corrupt_chunk: Option<u32>,

    /// Answer this chunk with the next chunk number (once)
    #[arg(long)]
    renumber_chunk: Option<u32>,

    /// Answer this chunk with HTTP 500 (once)
    #[arg(long)]
    fail_chunk: Option<u32>,

    /// Publish an all-zero hash in the manifest
    #[arg(long)]
    wrong_hash: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let keys = FotaKeys::from_hex(&args.enc_key, &args.mac_key).context("invalid key")?;
    let faults = Faults {
        corrupt_chunk: args.corrupt_chunk,
        renumber_chunk: args.renumber_chunk,
        fail_chunk: args.fail_chunk,
        wrong_hash: args.wrong_hash,
    };
    let mut server = FotaServer::new(keys, args.chunk_size, faults);

    if let Some(path) = &args.firmware {
        let image = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let iv = args
            .iv
            .as_deref()
            .map(|iv| {
                let mut out = [0u8; 16];
                hex::decode_to_slice(iv, &mut out).map(|()| out)
            })
            .transpose()
            .context("invalid iv")?;
        server
            .publish(&args.version, image, iv)
            .map_err(|e| anyhow::anyhow!("cannot publish {}: {e}", path.display()))?;
    }

    let addr = format!("0.0.0.0:{}", args.port);
    println!("Mock FOTA server starting on {addr}...");
    let http = Server::http(&addr).map_err(|e| anyhow::anyhow!("binding {addr}: {e}"))?;
    let json_header = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
        .map_err(|()| anyhow::anyhow!("invalid content-type header"))?;
    println!("Mock FOTA server ready - waiting for connections...");

    for mut incoming in http.incoming_requests() {
        let peer = incoming.remote_addr().map(ToString::to_string).unwrap_or_default();
        let response = match read_request(&mut incoming) {
            Ok(request) => {
                println!("RX: {} {} {:?} from {peer}", request.method, request.path, request.query);
                server.handle(&request)
            }
            Err(e) => {
                eprintln!("Bad request from {peer}: {e}");
                Response {
                    status: 400,
                    body: serde_json::json!({ "error": "bad request" }),
                }
            }
        };
        println!("TX: {}", response.status);

        // 204 carries no body on the wire
        let body = if response.status == 204 {
            Vec::new()
        } else {
            response.body.to_string().into_bytes()
        };
        let reply = tiny_http::Response::from_data(body)
            .with_status_code(response.status)
            .with_header(json_header.clone());
        if let Err(e) = incoming.respond(reply) {
            eprintln!("Write error: {e}");
        }
    }
    Ok(())
}

fn read_request(incoming: &mut tiny_http::Request) -> Result<Request> {
    let mut body = Vec::new();
    incoming
        .as_reader()
        .take(MAX_BODY_LEN as u64 + 1)
        .read_to_end(&mut body)?;
    anyhow::ensure!(body.len() <= MAX_BODY_LEN, "body larger than {MAX_BODY_LEN} bytes");

    let (path, query) = split_target(incoming.url());
    Ok(Request {
        method: incoming.method().to_string(),
        path,
        query,
        body,
    })
}

/// Split a request target into its path and decoded query parameters.
fn split_target(target: &str) -> (String, HashMap<String, String>) {
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    let query = form_urlencoded::parse(query.as_bytes()).into_owned().collect();
    (path.to_string(), query)
}
