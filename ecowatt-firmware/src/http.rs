//! Blocking HTTP client on top of the ESP-IDF HTTP client.

use crate::watchdog::WatchdogHandle;
use anyhow::Result;
use ecowatt_fota_lib::{FetchError, HttpClient, HttpResponse};
use embedded_svc::http::Method;
use embedded_svc::io::{Read, Write};
use esp_idf_svc::http::client::{Configuration as HttpConfig, EspHttpConnection};
use log::debug;
use std::rc::Rc;
use std::time::Duration;

/// Largest response body accepted. A 1 KiB chunk encodes to well under this.
const MAX_BODY_LEN: usize = 16 * 1024;

/// One connection per request; the device talks to the server a few times a
/// minute at most during an update.
pub struct EspHttpClient {
    timeout: Duration,
    watchdog: Rc<WatchdogHandle>,
}

impl EspHttpClient {
    pub fn new(timeout: Duration, watchdog: Rc<WatchdogHandle>) -> Self {
        Self { timeout, watchdog }
    }

    fn request(&self, method: Method, url: &str, body: Option<&[u8]>) -> Result<HttpResponse, FetchError> {
        self.watchdog.feed();
        let result = self.exchange(method, url, body);
        self.watchdog.feed();
        result.map_err(|e| FetchError::Network(format!("{method:?} {url}: {e}")))
    }

    fn exchange(&self, method: Method, url: &str, body: Option<&[u8]>) -> Result<HttpResponse> {
        let mut conn = EspHttpConnection::new(&HttpConfig {
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            timeout: Some(self.timeout),
            buffer_size: Some(2048),
            ..Default::default()
        })?;

        let content_length = body.map_or(0, <[u8]>::len).to_string();
        let mut headers = vec![("Accept", "application/json")];
        if body.is_some() {
            headers.push(("Content-Type", "application/json"));
            headers.push(("Content-Length", content_length.as_str()));
        }

        conn.initiate_request(method, url, &headers)?;
        if let Some(body) = body {
            conn.write_all(body)?;
        }
        conn.initiate_response()?;

        let status = conn.status();
        let mut response = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = Read::read(&mut conn, &mut buf)?;
            if n == 0 {
                break;
            }
            if response.len() + n > MAX_BODY_LEN {
                anyhow::bail!("response body exceeds {MAX_BODY_LEN} bytes");
            }
            response.extend_from_slice(&buf[..n]);
            self.watchdog.feed();
        }
        debug!("HTTP: {status} ({} bytes) from {url}", response.len());

        Ok(HttpResponse {
            status,
            body: response,
        })
    }
}

impl HttpClient for EspHttpClient {
    fn get(&mut self, url: &str) -> Result<HttpResponse, FetchError> {
        self.request(Method::Get, url, None)
    }

    fn post_json(&mut self, url: &str, body: &[u8]) -> Result<HttpResponse, FetchError> {
        self.request(Method::Post, url, Some(body))
    }
}
