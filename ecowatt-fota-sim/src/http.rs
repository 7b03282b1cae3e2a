use ecowatt_fota_lib::{FetchError, HttpClient, HttpResponse};
use reqwest::blocking::{Client, Response};
use std::time::Duration;

/// [`HttpClient`] over a blocking `reqwest` client.
pub struct ReqwestClient {
    client: Client,
}

impl ReqwestClient {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

fn into_response(result: reqwest::Result<Response>) -> Result<HttpResponse, FetchError> {
    let response = result.map_err(|e| FetchError::Network(e.to_string()))?;
    let status = response.status().as_u16();
    let body = response
        .bytes()
        .map_err(|e| FetchError::Network(e.to_string()))?
        .to_vec();
    Ok(HttpResponse { status, body })
}

impl HttpClient for ReqwestClient {
    fn get(&mut self, url: &str) -> Result<HttpResponse, FetchError> {
        into_response(self.client.get(url).send())
    }

    fn post_json(&mut self, url: &str, body: &[u8]) -> Result<HttpResponse, FetchError> {
        into_response(
            self.client
                .post(url)
                .header("Content-Type", "application/json")
                .body(body.to_vec())
                .send(),
        )
    }
}
