//! Outbound calls between bootstrap nodes
//!
//! The distribution flows only talk to peers through the [`Transport`]
//! trait, so they can be driven against an in-memory peer in tests.
//! [`HttpTransport`] is the production implementation on top of `reqwest`.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use tracing::{debug, warn};

use crate::authenticator::{sign_payload, BasicCredentials, SIGNATURE_HEADER};
use crate::configs::AppConfig;
use crate::error::{BootError, Result};
use crate::key::Key;
use crate::protocol::{
    Credentials, Response, StatusResponse, ACQUIRE_CREDENTIALS_PATH, CA_PATH, CSR_PATH,
};

const GATEWAY_TIMEOUT: u16 = 504;
const BAD_GATEWAY: u16 = 502;

#[async_trait]
pub trait Transport: Send + Sync {
    /// PEM of the CA certificate served by `address`.
    async fn fetch_ca_certificate(&self, address: &str) -> Result<Vec<u8>>;

    /// Have `address` sign `csr_pem`, authenticating with a one-time token.
    async fn submit_csr(&self, address: &str, csr_pem: &[u8], token: &str) -> Result<Vec<u8>>;

    /// Ask `address` to acquire its client credentials.
    ///
    /// Never fails: transport problems are reported as a failing
    /// [`Response`] for `address`.
    async fn acquire_credentials(
        &self,
        address: &str,
        payload: &Credentials,
        auth: &BasicCredentials,
    ) -> Response;
}

/// Report `error` as the outcome of calling `target`.
///
/// Timeouts map to 504, other transport failures to 502 and anything else
/// to 500.
pub fn failure_response(target: &str, error: &BootError) -> Response {
    let status_code = match error {
        BootError::Transport { timed_out: true, .. } => GATEWAY_TIMEOUT,
        BootError::Transport { .. } => BAD_GATEWAY,
        other => other.status_code().as_u16(),
    };
    Response::new(target, status_code, error.to_string())
}

pub struct HttpTransport {
    client: reqwest::Client,
    peer_port: u16,
    signing_key: Option<Key>,
}

impl HttpTransport {
    pub fn new(peer_port: u16, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BootError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            peer_port,
            signing_key: None,
        })
    }

    /// Client for the configured peer port and timeout, signing forwarded
    /// payloads when `security.sign_key_path` is set.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let transport = Self::new(
            config.distribution.peer_port,
            config.distribution.request_timeout(),
        )?;
        match &config.security.sign_key_path {
            Some(path) => Ok(transport.with_signing_key(Key::load(path)?)),
            None => Ok(transport),
        }
    }

    /// Sign forwarded credential payloads with `key`, as peers require a
    /// signed body on the acquire endpoint.
    pub fn with_signing_key(mut self, key: Key) -> Self {
        self.signing_key = Some(key);
        self
    }

    fn url(&self, address: &str, path: &str) -> String {
        format!("http://{}{}", self.authority(address), path)
    }

    /// `host:port` for `address`, which may already carry a port.
    fn authority(&self, address: &str) -> String {
        if address.parse::<SocketAddr>().is_ok() {
            return address.to_string();
        }
        match address.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{}]:{}", ip, self.peer_port),
            _ => format!("{}:{}", address, self.peer_port),
        }
    }

    async fn read_success(&self, address: &str, response: reqwest::Response) -> Result<Vec<u8>> {
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(address, e))?;
        if status.is_success() {
            Ok(body.to_vec())
        } else {
            Err(BootError::Transport {
                target: address.to_string(),
                reason: format!("{}: {}", status, String::from_utf8_lossy(&body).trim()),
                timed_out: false,
            })
        }
    }

    async fn post_credentials(
        &self,
        address: &str,
        payload: &Credentials,
        auth: &BasicCredentials,
    ) -> Result<Response> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| BootError::InvalidRequest(format!("couldn't encode payload: {}", e)))?;
        let mut request = self
            .client
            .post(self.url(address, ACQUIRE_CREDENTIALS_PATH))
            .header(AUTHORIZATION, auth.header_value())
            .header(CONTENT_TYPE, "application/json");
        if let Some(key) = &self.signing_key {
            request = request.header(SIGNATURE_HEADER, sign_payload(key.pkey(), &body)?);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| transport_error(address, e))?;
        let status_code = response.status().as_u16();
        let raw = response
            .bytes()
            .await
            .map_err(|e| transport_error(address, e))?;
        let status = match serde_json::from_slice::<StatusResponse>(&raw) {
            Ok(parsed) => parsed.status,
            Err(_) => String::from_utf8_lossy(&raw).trim().to_string(),
        };
        Ok(Response::new(address, status_code, status))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch_ca_certificate(&self, address: &str) -> Result<Vec<u8>> {
        debug!("Fetching CA certificate from {}", address);
        let response = self
            .client
            .get(self.url(address, CA_PATH))
            .send()
            .await
            .map_err(|e| transport_error(address, e))?;
        self.read_success(address, response).await
    }

    async fn submit_csr(&self, address: &str, csr_pem: &[u8], token: &str) -> Result<Vec<u8>> {
        debug!("Submitting CSR to {}", address);
        let response = self
            .client
            .post(self.url(address, CSR_PATH))
            .header(AUTHORIZATION, format!("Token {}", token))
            .header(CONTENT_TYPE, "application/x-pem-file")
            .body(csr_pem.to_vec())
            .send()
            .await
            .map_err(|e| transport_error(address, e))?;
        self.read_success(address, response).await
    }

    async fn acquire_credentials(
        &self,
        address: &str,
        payload: &Credentials,
        auth: &BasicCredentials,
    ) -> Response {
        match self.post_credentials(address, payload, auth).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Credential request to {} failed: {}", address, e);
                failure_response(address, &e)
            }
        }
    }
}

fn transport_error(target: &str, error: reqwest::Error) -> BootError {
    BootError::Transport {
        target: target.to_string(),
        reason: error.to_string(),
        timed_out: error.is_timeout(),
    }
}
