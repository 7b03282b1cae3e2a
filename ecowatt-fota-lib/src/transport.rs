//! HTTP + JSON adapters for the update server endpoints.
//!
//! | Endpoint | Method | Body |
//! |----------|--------|------|
//! | `{api}/manifest` | GET | [`UpdateManifest`] |
//! | `{api}/chunk?version={v}&n={index}` | GET | [`ChunkResponse`] |
//! | `{api}/report` | POST | [`Report`] |
//! | `{api}/boot_ok` | POST | [`BootConfirm`] |
//!
//! Each call performs exactly one request and never retries.

use crate::error::FetchError;
use crate::manifest::{BootConfirm, Chunk, ChunkResponse, Report, ReportStatus, UpdateManifest};
use log::debug;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Status and body of a completed HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Blocking HTTP client. Implementations map connection failures to
/// [`FetchError::Network`]; any status code is returned as a response.
pub trait HttpClient {
    fn get(&mut self, url: &str) -> Result<HttpResponse, FetchError>;

    fn post_json(&mut self, url: &str, body: &[u8]) -> Result<HttpResponse, FetchError>;
}

/// What the orchestrator needs from the update server.
pub trait FotaTransport {
    fn fetch_manifest(&mut self) -> Result<UpdateManifest, FetchError>;

    /// Fetch chunk `index` of `version`. A response carrying another index
    /// fails with [`FetchError::IndexMismatch`].
    fn fetch_chunk(&mut self, version: &str, index: u32) -> Result<Chunk, FetchError>;

    fn report(&mut self, status: ReportStatus, chunk: u32, version: &str) -> Result<(), FetchError>;

    /// Tell the server the freshly flashed image booted.
    fn confirm_boot(&mut self) -> Result<(), FetchError>;
}

/// [`FotaTransport`] over any [`HttpClient`].
pub struct FotaApi<C> {
    base: String,
    device_id: String,
    client: C,
}

impl<C: HttpClient> FotaApi<C> {
    pub fn new(api_base: &str, device_id: impl Into<String>, client: C) -> Self {
        Self {
            base: api_base.trim_end_matches('/').to_string(),
            device_id: device_id.into(),
            client,
        }
    }

    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    fn get_json<T: DeserializeOwned>(&mut self, url: &str) -> Result<T, FetchError> {
        debug!("FOTA: GET {url}");
        let response = self.client.get(url)?;
        if response.status != 200 {
            return Err(FetchError::Status(response.status));
        }
        serde_json::from_slice(&response.body).map_err(|e| FetchError::Malformed(e.to_string()))
    }

    fn post_json<T: Serialize>(&mut self, url: &str, body: &T) -> Result<(), FetchError> {
        debug!("FOTA: POST {url}");
        let body = serde_json::to_vec(body).map_err(|e| FetchError::Malformed(e.to_string()))?;
        let response = self.client.post_json(url, &body)?;
        if response.status != 200 {
            return Err(FetchError::Status(response.status));
        }
        Ok(())
    }
}

impl<C: HttpClient> FotaTransport for FotaApi<C> {
    fn fetch_manifest(&mut self) -> Result<UpdateManifest, FetchError> {
        let url = format!("{}/manifest", self.base);
        self.get_json(&url)
    }

    fn fetch_chunk(&mut self, version: &str, index: u32) -> Result<Chunk, FetchError> {
        let version = utf8_percent_encode(version, QUERY_VALUE);
        let url = format!("{}/chunk?version={version}&n={index}", self.base);
        let response: ChunkResponse = self.get_json(&url)?;
        response.decode(index)
    }

    fn report(&mut self, status: ReportStatus, chunk: u32, version: &str) -> Result<(), FetchError> {
        let url = format!("{}/report", self.base);
        let report = Report {
            device_id: self.device_id.clone(),
            status,
            chunk,
            version: version.to_string(),
        };
        self.post_json(&url, &report)
    }

    fn confirm_boot(&mut self) -> Result<(), FetchError> {
        let url = format!("{}/boot_ok", self.base);
        let body = BootConfirm {
            device_id: self.device_id.clone(),
        };
        self.post_json(&url, &body)
    }
}

/// Query values keep the RFC 3986 unreserved characters literal.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays canned responses and records requests.
    #[derive(Default)]
    struct ScriptedClient {
        responses: VecDeque<Result<HttpResponse, FetchError>>,
        requests: Vec<(String, Option<serde_json::Value>)>,
    }

    impl ScriptedClient {
        fn reply(mut self, status: u16, body: serde_json::Value) -> Self {
            self.responses.push_back(Ok(HttpResponse {
                status,
                body: serde_json::to_vec(&body).unwrap(),
            }));
            self
        }

        fn next(&mut self) -> Result<HttpResponse, FetchError> {
            self.responses
                .pop_front()
                .unwrap_or_else(|| Err(FetchError::Network("no scripted response".to_string())))
        }
    }

    impl HttpClient for ScriptedClient {
        fn get(&mut self, url: &str) -> Result<HttpResponse, FetchError> {
            self.requests.push((url.to_string(), None));
            self.next()
        }

        fn post_json(&mut self, url: &str, body: &[u8]) -> Result<HttpResponse, FetchError> {
            self.requests
                .push((url.to_string(), Some(serde_json::from_slice(body).unwrap())));
            self.next()
        }
    }

    fn manifest_json() -> serde_json::Value {
        serde_json::json!({
            "version": "2.0.0",
            "size": 32,
            "chunk_size": 16,
            "total_chunks": 2,
            "hash": "ab".repeat(32),
            "iv": "00".repeat(16)
        })
    }

    #[test]
    fn manifest_request() {
        let client = ScriptedClient::default().reply(200, manifest_json());
        let mut api = FotaApi::new("http://10.0.0.2:5000/", "dev", client);
        let manifest = api.fetch_manifest().unwrap();
        assert_eq!(manifest.version, "2.0.0");
        assert_eq!(api.client_mut().requests[0].0, "http://10.0.0.2:5000/manifest");
    }

    #[test]
    fn non_200_is_a_status_error() {
        let client = ScriptedClient::default()
            .reply(204, serde_json::json!({"status": "no_active_firmware"}))
            .reply(404, serde_json::json!({"error": "no such chunk"}));
        let mut api = FotaApi::new("http://h", "dev", client);
        assert_eq!(api.fetch_manifest(), Err(FetchError::Status(204)));
        assert_eq!(api.fetch_chunk("2.0.0", 0), Err(FetchError::Status(404)));
    }

    #[test]
    fn malformed_body() {
        let client = ScriptedClient::default().reply(200, serde_json::json!({"version": "2.0.0"}));
        let mut api = FotaApi::new("http://h", "dev", client);
        assert!(matches!(api.fetch_manifest(), Err(FetchError::Malformed(_))));
    }

    #[test]
    fn transport_error_passes_through() {
        let mut api = FotaApi::new("http://h", "dev", ScriptedClient::default());
        assert!(matches!(api.fetch_manifest(), Err(FetchError::Network(_))));
    }

    #[test]
    fn chunk_request_url_and_index_check() {
        let body = serde_json::json!({
            "chunk_number": 2,
            "iv": "00".repeat(16),
            "mac": "00".repeat(32),
            "data": "AAAA"
        });
        let client = ScriptedClient::default().reply(200, body);
        let mut api = FotaApi::new("http://h/api", "dev", client);
        assert_eq!(
            api.fetch_chunk("2.0.0 beta", 1),
            Err(FetchError::IndexMismatch { requested: 1, received: 2 })
        );
        assert_eq!(
            api.client_mut().requests[0].0,
            "http://h/api/chunk?version=2.0.0%20beta&n=1"
        );
    }

    #[test]
    fn report_and_boot_bodies() {
        let client = ScriptedClient::default()
            .reply(200, serde_json::json!({"ok": true}))
            .reply(200, serde_json::json!({"ok": true}));
        let mut api = FotaApi::new("http://h", "AA:BB:CC:DD:EE:FF", client);
        api.report(ReportStatus::ChunkOk, 4, "2.0.0").unwrap();
        api.confirm_boot().unwrap();

        let requests = &api.client_mut().requests;
        assert_eq!(requests[0].0, "http://h/report");
        assert_eq!(
            requests[0].1,
            Some(serde_json::json!({
                "device_id": "AA:BB:CC:DD:EE:FF",
                "status": "chunk_ok",
                "chunk": 4,
                "version": "2.0.0"
            }))
        );
        assert_eq!(requests[1].0, "http://h/boot_ok");
        assert_eq!(
            requests[1].1,
            Some(serde_json::json!({"device_id": "AA:BB:CC:DD:EE:FF"}))
        );
    }
}
