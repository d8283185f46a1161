//! Protocol Module
//!
//! Wire types exchanged between bootstrap nodes: the `Credentials` payload
//! pushed to joining nodes and the per-target `Response` list aggregated by
//! the distribution endpoint.
//!
//! Field names are PascalCase on the wire:
//!
//! ```text
//! {"Servers":[{"Address":"10.0.0.1"}],"Clients":["10.0.0.2"],"PublicIP":"1.2.3.4","AuthToken":"..."}
//! {"Responses":[{"Target":"10.0.0.1","StatusCode":200,"Status":"OK"}]}
//! ```

use serde::{Deserialize, Serialize};

pub const CA_PATH: &str = "/certboot/ca";
pub const CSR_PATH: &str = "/certboot/csr";
pub const ACQUIRE_CREDENTIALS_PATH: &str = "/certboot/client/creds";
pub const DISTRIBUTE_CREDENTIALS_PATH: &str = "/certboot/client/distribute";
pub const HEALTH_PATH: &str = "/certboot/health";

/// A server taking part in a bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Server {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub address: String,
}

impl Server {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            name: None,
            address: address.into(),
        }
    }
}

/// Credential bootstrap payload.
///
/// The first entry of `servers` is always the node issuing or forwarding the
/// request; it hosts the certificate authority the joining nodes sign against.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Credentials {
    #[serde(default)]
    pub servers: Vec<Server>,
    #[serde(default)]
    pub clients: Vec<String>,
    #[serde(rename = "PublicIP", default)]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl Credentials {
    /// Address of the bootstrap server (`Servers[0]`).
    pub fn bootstrap_address(&self) -> Option<&str> {
        self.servers.first().map(|s| s.address.as_str())
    }
}

/// Outcome of one distribution call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Response {
    #[serde(default)]
    pub target: String,
    pub status_code: u16,
    #[serde(default)]
    pub status: String,
}

impl Response {
    pub fn new(target: impl Into<String>, status_code: u16, status: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            status_code,
            status: status.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == 200
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Responses {
    pub responses: Vec<Response>,
}

/// `{"Status": "..."}` envelope used for single-outcome replies and errors.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn ok() -> Self {
        Self {
            status: "OK".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_credentials() {
        let json = r#"{"Servers":[{"Name":"gw","Address":"10.0.0.1"}],"Clients":["10.0.0.2","10.0.0.3"],"PublicIP":"52.1.1.1"}"#;
        let credentials: Credentials = serde_json::from_str(json).unwrap();

        assert_eq!(credentials.bootstrap_address(), Some("10.0.0.1"));
        assert_eq!(credentials.clients, vec!["10.0.0.2", "10.0.0.3"]);
        assert_eq!(credentials.public_ip.as_deref(), Some("52.1.1.1"));
        assert!(credentials.auth_token.is_none());
    }

    #[test]
    fn test_serialize_credentials_uses_wire_names() {
        let credentials = Credentials {
            servers: vec![Server::new("10.0.0.1")],
            clients: vec![],
            public_ip: None,
            auth_token: Some("abc".to_string()),
        };
        let value = serde_json::to_value(&credentials).unwrap();

        assert_eq!(value["Servers"][0]["Address"], "10.0.0.1");
        assert_eq!(value["AuthToken"], "abc");
        assert!(value["PublicIP"].is_null());
    }

    #[test]
    fn test_deserialize_responses() {
        let json = r#"{"Responses":[{"Target":"a","StatusCode":200,"Status":"OK"},{"Target":"b","StatusCode":401,"Status":"401 Unauthorized"}]}"#;
        let responses: Responses = serde_json::from_str(json).unwrap();

        assert_eq!(responses.responses.len(), 2);
        assert!(responses.responses[0].is_success());
        assert!(!responses.responses[1].is_success());
    }
}
