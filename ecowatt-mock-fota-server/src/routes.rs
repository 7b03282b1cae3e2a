//! Endpoint handlers, independent of the socket layer.

use ecowatt_fota_lib::{FirmwarePackage, FotaKeys};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

pub struct Request {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub body: Vec<u8>,
}

pub struct Response {
    pub status: u16,
    pub body: Value,
}

impl Response {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            body: json!({ "error": message }),
        }
    }
}

/// Faults applied to the served image. Chunk faults fire once, so the next
/// device cycle sees a healthy server again.
#[derive(Default)]
pub struct Faults {
    pub corrupt_chunk: Option<u32>,
    pub renumber_chunk: Option<u32>,
    pub fail_chunk: Option<u32>,
    pub wrong_hash: bool,
}

pub struct FotaServer {
    keys: FotaKeys,
    chunk_size: u32,
    active: Option<FirmwarePackage>,
    faults: Faults,
}

/// Base IV for an uploaded image, unique per version and content.
fn derive_iv(version: &str, image: &[u8]) -> [u8; 16] {
    let digest = Sha256::new()
        .chain_update(b"ecowatt-fota-iv")
        .chain_update(version.as_bytes())
        .chain_update(Sha256::digest(image))
        .finalize();
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&digest[..16]);
    iv
}

impl FotaServer {
    pub fn new(keys: FotaKeys, chunk_size: u32, faults: Faults) -> Self {
        Self {
            keys,
            chunk_size,
            active: None,
            faults,
        }
    }

    /// Make `image` the published firmware.
    pub fn publish(&mut self, version: &str, image: Vec<u8>, iv: Option<[u8; 16]>) -> Result<Value, String> {
        let iv = iv.unwrap_or_else(|| derive_iv(version, &image));
        let package = FirmwarePackage::new(version, image, self.chunk_size, iv, self.keys.clone())
            .map_err(|e| e.to_string())?;
        let manifest = package.manifest();
        println!(
            "[FOTA] Active firmware {} ({} bytes, {} chunks, sha256 {})",
            manifest.version, manifest.size, manifest.total_chunks, manifest.content_hash
        );
        self.active = Some(package);
        serde_json::to_value(&manifest).map_err(|e| e.to_string())
    }

    pub fn handle(&mut self, request: &Request) -> Response {
        match (request.method.as_str(), request.path.as_str()) {
            ("GET", "/manifest") => self.manifest(),
            ("GET", "/chunk") => self.chunk(&request.query),
            ("POST", "/report") => Self::report(&request.body),
            ("POST", "/boot_ok") => self.boot_ok(&request.body),
            ("POST", "/upload_firmware") => self.upload(request),
            _ => Response::error(404, "not found"),
        }
    }

    fn manifest(&self) -> Response {
        let Some(package) = &self.active else {
            println!("[FOTA] No active firmware set.");
            return Response {
                status: 204,
                body: json!({ "status": "no_active_firmware" }),
            };
        };
        let mut manifest = package.manifest();
        if self.faults.wrong_hash {
            manifest.content_hash = "0".repeat(64);
        }
        match serde_json::to_value(&manifest) {
            Ok(body) => Response::ok(body),
            Err(e) => Response::error(500, &e.to_string()),
        }
    }

    fn chunk(&mut self, query: &HashMap<String, String>) -> Response {
        let Some(package) = &self.active else {
            return Response::error(404, "no active firmware");
        };
        let (Some(version), Some(index)) = (
            query.get("version"),
            query.get("n").and_then(|n| n.parse::<u32>().ok()),
        ) else {
            return Response::error(400, "bad request");
        };
        if version != package.version() {
            return Response::error(404, "no such chunk");
        }
        let Some(mut chunk) = package.chunk(index) else {
            return Response::error(404, "no such chunk");
        };

        if self.faults.fail_chunk == Some(index) {
            self.faults.fail_chunk = None;
            println!("[FAULT] Failing chunk {index}");
            return Response::error(500, "injected failure");
        }
        if self.faults.corrupt_chunk == Some(index) {
            self.faults.corrupt_chunk = None;
            println!("[FAULT] Flipping a bit in chunk {index}");
            chunk.ciphertext[0] ^= 0x01;
        }
        if self.faults.renumber_chunk == Some(index) {
            self.faults.renumber_chunk = None;
            println!("[FAULT] Answering chunk {index} as chunk {}", index + 1);
            chunk.index = index + 1;
        }

        match serde_json::to_value(chunk.to_response()) {
            Ok(body) => Response::ok(body),
            Err(e) => Response::error(500, &e.to_string()),
        }
    }

    fn report(body: &[u8]) -> Response {
        let report: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
        println!("REPORT: {report}");
        Response::ok(json!({ "ok": true }))
    }

    fn boot_ok(&mut self, body: &[u8]) -> Response {
        let confirm: Value = serde_json::from_slice(body).unwrap_or(Value::Null);
        println!("BOOT_OK: {confirm}");
        if self.active.take().is_some() {
            println!("[FOTA] Firmware cleared after successful update.");
        }
        Response::ok(json!({ "ok": true }))
    }

    fn upload(&mut self, request: &Request) -> Response {
        let Some(version) = request.query.get("version").filter(|v| !v.is_empty()) else {
            return Response::error(400, "missing file or version");
        };
        match self.publish(version, request.body.clone(), None) {
            Ok(manifest) => Response::ok(json!({ "status": "success", "manifest": manifest })),
            Err(e) => Response::error(400, &e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecowatt_fota_lib::{ChunkResponse, UpdateManifest};

    fn keys() -> FotaKeys {
        FotaKeys::new([7; 16], [9; 32])
    }

    fn get(path: &str, query: &[(&str, &str)]) -> Request {
        Request {
            method: "GET".to_string(),
            path: path.to_string(),
            query: query
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            body: Vec::new(),
        }
    }

    fn post(path: &str, query: &[(&str, &str)], body: &[u8]) -> Request {
        Request {
            method: "POST".to_string(),
            body: body.to_vec(),
            ..get(path, query)
        }
    }

    fn server(faults: Faults) -> FotaServer {
        let mut server = FotaServer::new(keys(), 16, faults);
        server.publish("2.0.0", (0..40u8).collect(), Some([1; 16])).unwrap();
        server
    }

    fn fetch_chunk(server: &mut FotaServer, n: &str) -> Response {
        server.handle(&get("/chunk", &[("version", "2.0.0"), ("n", n)]))
    }

    #[test]
    fn manifest_describes_active_image() {
        let mut server = server(Faults::default());
        let response = server.handle(&get("/manifest", &[]));
        assert_eq!(response.status, 200);
        let manifest: UpdateManifest = serde_json::from_value(response.body).unwrap();
        assert_eq!(manifest.version, "2.0.0");
        assert_eq!(manifest.size, 40);
        assert_eq!(manifest.total_chunks, 3);
        assert_eq!(manifest.iv, "01".repeat(16));
    }

    #[test]
    fn no_firmware_is_204() {
        let mut server = FotaServer::new(keys(), 16, Faults::default());
        assert_eq!(server.handle(&get("/manifest", &[])).status, 204);
        assert_eq!(fetch_chunk(&mut server, "0").status, 404);
    }

    #[test]
    fn chunk_lookup() {
        let mut server = server(Faults::default());
        let response = fetch_chunk(&mut server, "2");
        assert_eq!(response.status, 200);
        let chunk: ChunkResponse = serde_json::from_value(response.body).unwrap();
        let chunk = chunk.decode(2).unwrap();
        assert!(keys().verify_chunk(2, &chunk.iv, &chunk.ciphertext, &chunk.mac));

        assert_eq!(fetch_chunk(&mut server, "3").status, 404);
        assert_eq!(fetch_chunk(&mut server, "x").status, 400);
        let other_version = server.handle(&get("/chunk", &[("version", "1.0.0"), ("n", "0")]));
        assert_eq!(other_version.status, 404);
    }

    #[test]
    fn chunk_faults_fire_once() {
        let mut server = server(Faults {
            corrupt_chunk: Some(1),
            renumber_chunk: Some(0),
            fail_chunk: Some(2),
            wrong_hash: false,
        });

        let renumbered: ChunkResponse = serde_json::from_value(fetch_chunk(&mut server, "0").body).unwrap();
        assert_eq!(renumbered.chunk_number, 1);
        let healthy: ChunkResponse = serde_json::from_value(fetch_chunk(&mut server, "0").body).unwrap();
        assert_eq!(healthy.chunk_number, 0);

        let corrupt = serde_json::from_value::<ChunkResponse>(fetch_chunk(&mut server, "1").body)
            .unwrap()
            .decode(1)
            .unwrap();
        assert!(!keys().verify_chunk(1, &corrupt.iv, &corrupt.ciphertext, &corrupt.mac));

        assert_eq!(fetch_chunk(&mut server, "2").status, 500);
        assert_eq!(fetch_chunk(&mut server, "2").status, 200);
    }

    #[test]
    fn wrong_hash_fault() {
        let mut server = server(Faults {
            wrong_hash: true,
            ..Faults::default()
        });
        let manifest: UpdateManifest =
            serde_json::from_value(server.handle(&get("/manifest", &[])).body).unwrap();
        assert_eq!(manifest.content_hash, "0".repeat(64));
    }

    #[test]
    fn boot_ok_retires_image() {
        let mut server = server(Faults::default());
        let response = server.handle(&post("/boot_ok", &[], br#"{"device_id":"dev"}"#));
        assert_eq!(response.status, 200);
        assert_eq!(server.handle(&get("/manifest", &[])).status, 204);
    }

    #[test]
    fn report_is_acknowledged() {
        let mut server = server(Faults::default());
        let body = br#"{"device_id":"dev","status":"chunk_ok","chunk":0,"version":"2.0.0"}"#;
        let response = server.handle(&post("/report", &[], body));
        assert_eq!(response.status, 200);
        assert_eq!(response.body, json!({ "ok": true }));
    }

    #[test]
    fn upload_replaces_active_image() {
        let mut server = server(Faults::default());
        let response = server.handle(&post("/upload_firmware", &[("version", "2.1.0")], &[5; 100]));
        assert_eq!(response.status, 200);

        let manifest: UpdateManifest =
            serde_json::from_value(server.handle(&get("/manifest", &[])).body).unwrap();
        assert_eq!(manifest.version, "2.1.0");
        assert_eq!(manifest.size, 100);
        assert_eq!(manifest.total_chunks, 7);

        assert_eq!(server.handle(&post("/upload_firmware", &[], &[5; 100])).status, 400);
        assert_eq!(
            server.handle(&post("/upload_firmware", &[("version", "3")], &[])).status,
            400
        );
    }

    #[test]
    fn derived_iv_depends_on_version_and_content() {
        assert_ne!(derive_iv("1", b"abc"), derive_iv("2", b"abc"));
        assert_ne!(derive_iv("1", b"abc"), derive_iv("1", b"abd"));
        assert_eq!(derive_iv("1", b"abc"), derive_iv("1", b"abc"));
    }
}
