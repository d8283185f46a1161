//! Credential distribution
//!
//! Two flows bring a set of nodes under the bootstrap CA:
//!
//! - **acquire** ([`acquire_client_credentials`]) runs on a joining node. It
//!   fetches the CA certificate from the bootstrap server, creates a client
//!   key and CSR, and trades the CSR plus a one-time token for a signed
//!   client certificate. Every step is skipped when its artifact already
//!   exists, so the flow can be re-run safely.
//! - **distribute** ([`distribute_client_credentials`]) runs on the node an
//!   operator talks to. It mints one token per target and asks every target
//!   to run the acquire flow: the bootstrap server first, then all clients
//!   concurrently. Client tokens are minted only after the bootstrap server
//!   succeeded.
//!
//! ```text
//! operator ──distribute──▶ node ──acquire──▶ Servers[0]
//!                               └─acquire──▶ Clients[..] (concurrently)
//! ```

use std::future::Future;
use std::path::Path;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::authenticator::BasicCredentials;
use crate::authority::CA_CERT_FILE;
use crate::certificate::Certificate;
use crate::certificate_request::{CertificateRequest, IdentityClaims};
use crate::error::{BootError, Result};
use crate::key::Key;
use crate::persist;
use crate::protocol::{Credentials, Response};
use crate::token::TokenStore;
use crate::transport::Transport;

pub const CLIENT_KEY_FILE: &str = "client.key";
pub const CLIENT_CSR_FILE: &str = "client.csr";
pub const CLIENT_CERT_FILE: &str = "client.crt";

/// Run `callback(index, target)` for every target concurrently.
///
/// Results come back in the order of `targets`, whatever order the calls
/// complete in.
pub async fn fan_out<T, F, Fut>(targets: &[String], callback: F) -> Vec<T>
where
    F: Fn(usize, String) -> Fut,
    Fut: Future<Output = T>,
{
    join_all(
        targets
            .iter()
            .enumerate()
            .map(|(index, target)| callback(index, target.clone())),
    )
    .await
}

/// Obtain this node's client credentials from the bootstrap server.
///
/// Artifacts are written under `crt_dir`: `ca.crt`, `client.key`,
/// `client.csr` and `client.crt`.
pub async fn acquire_client_credentials(
    request: &Credentials,
    crt_dir: &Path,
    transport: &dyn Transport,
) -> Result<()> {
    let server = request
        .bootstrap_address()
        .ok_or_else(|| BootError::InvalidRequest("no servers given".to_string()))?;
    let token = request
        .auth_token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| BootError::InvalidRequest("missing AuthToken".to_string()))?;

    persist::ensure_dir(crt_dir)?;

    let ca_path = crt_dir.join(CA_CERT_FILE);
    if ca_path.exists() {
        debug!("{} present, not fetching", ca_path.display());
    } else {
        let pem = transport.fetch_ca_certificate(server).await?;
        Certificate::from_pem(&pem)?.save(&ca_path)?;
        info!("Stored CA certificate from {}", server);
    }

    let crt_path = crt_dir.join(CLIENT_CERT_FILE);
    let key_path = crt_dir.join(CLIENT_KEY_FILE);
    let csr_path = crt_dir.join(CLIENT_CSR_FILE);
    let public_ip = request.public_ip.clone();
    let csr_pem =
        run_blocking(move || prepare_request(&key_path, &csr_path, public_ip.as_deref())).await?;

    if crt_path.exists() {
        debug!("{} present, not submitting CSR", crt_path.display());
        return Ok(());
    }
    let pem = transport.submit_csr(server, &csr_pem, token).await?;
    let certificate = Certificate::from_pem(&pem)?;
    if !certificate.allows_mutual_tls() {
        return Err(BootError::Signing(format!(
            "certificate from {} is not valid for client and server authentication",
            server
        )));
    }
    certificate.save(&crt_path)?;
    info!(
        "Stored client certificate (serial {}) signed by {}",
        certificate.serial_number()?,
        server
    );
    Ok(())
}

/// Create the client key and CSR unless present; returns the CSR PEM.
fn prepare_request(key_path: &Path, csr_path: &Path, public_ip: Option<&str>) -> Result<Vec<u8>> {
    if !key_path.exists() {
        Key::generate()?.save(key_path)?;
        info!("Generated client key {}", key_path.display());
    }
    if !csr_path.exists() {
        let key = Key::load(key_path)?;
        let claims = IdentityClaims::for_node(public_ip);
        CertificateRequest::new(&key, &claims)?.save(csr_path)?;
        info!("Created client CSR {}", csr_path.display());
    }
    CertificateRequest::load(csr_path)?.to_pem()
}

/// Run key generation, signing and file I/O off the async worker threads.
pub(crate) async fn run_blocking<T, F>(task: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| BootError::io("Blocking task failed", std::io::Error::other(e)))?
}

/// Push credential requests to the bootstrap server and every client.
///
/// The bootstrap server (`Servers[0]`) is asked first; if it does not
/// answer 200 its response is returned alone and no client is contacted.
/// Otherwise the client responses follow it, in the order of `Clients`.
pub async fn distribute_client_credentials(
    request: &Credentials,
    auth: &BasicCredentials,
    tokens: &TokenStore,
    transport: &dyn Transport,
) -> Result<Vec<Response>> {
    let first = request
        .bootstrap_address()
        .ok_or_else(|| BootError::InvalidRequest("no servers given".to_string()))?;
    let targets: Vec<String> = std::iter::once(first.to_string())
        .chain(request.clients.iter().cloned())
        .collect();
    info!("Distributing client credentials to {} target(s)", targets.len());

    let payload_for = |index: usize| -> Result<Credentials> {
        let token = tokens.mint()?;
        Ok(Credentials {
            servers: request.servers.clone(),
            clients: request.clients.clone(),
            public_ip: if index == 0 {
                request.public_ip.clone()
            } else {
                None
            },
            auth_token: Some(token.random_hash),
        })
    };

    let head = transport
        .acquire_credentials(&targets[0], &payload_for(0)?, auth)
        .await;
    if !head.is_success() {
        warn!(
            "Bootstrap server {} answered {}, not contacting clients",
            head.target, head.status_code
        );
        return Ok(vec![head]);
    }

    // Client tokens are only minted once the bootstrap server can redeem them.
    let payloads = (1..targets.len())
        .map(payload_for)
        .collect::<Result<Vec<_>>>()?;
    let payloads = &payloads;
    let clients = fan_out(&targets[1..], |index, target| async move {
        transport
            .acquire_credentials(&target, &payloads[index], auth)
            .await
    })
    .await;

    let mut responses = Vec::with_capacity(targets.len());
    responses.push(head);
    responses.extend(clients);
    Ok(responses)
}

/// Pass `responses` through if every target succeeded.
pub fn ensure_all_succeeded(responses: Vec<Response>) -> Result<Vec<Response>> {
    if responses.iter().all(Response::is_success) {
        Ok(responses)
    } else {
        Err(BootError::PartialDistribution(responses))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::CertificateAuthority;
    use crate::configs::RootCADefaults;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// In-memory peer set backed by a real CA.
    struct MockTransport {
        ca: CertificateAuthority,
        statuses: HashMap<String, u16>,
        delays: HashMap<String, Duration>,
        calls: Mutex<Vec<(String, Credentials)>>,
        ca_fetches: AtomicUsize,
        csr_submissions: AtomicUsize,
        answer_with_root: bool,
        _dir: tempfile::TempDir,
    }

    impl MockTransport {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let ca = CertificateAuthority::initialize(&dir.path().join("ca"), &RootCADefaults::default())
                .unwrap();
            Self {
                ca,
                statuses: HashMap::new(),
                delays: HashMap::new(),
                calls: Mutex::new(Vec::new()),
                ca_fetches: AtomicUsize::new(0),
                csr_submissions: AtomicUsize::new(0),
                answer_with_root: false,
                _dir: dir,
            }
        }

        fn status(mut self, target: &str, code: u16) -> Self {
            self.statuses.insert(target.to_string(), code);
            self
        }

        fn delay(mut self, target: &str, millis: u64) -> Self {
            self.delays.insert(target.to_string(), Duration::from_millis(millis));
            self
        }

        /// Answer CSRs with the CA certificate instead of a signed leaf.
        fn answering_with_root(mut self) -> Self {
            self.answer_with_root = true;
            self
        }

        fn called(&self) -> Vec<(String, Credentials)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn fetch_ca_certificate(&self, _address: &str) -> Result<Vec<u8>> {
            self.ca_fetches.fetch_add(1, Ordering::SeqCst);
            self.ca.certificate().to_pem()
        }

        async fn submit_csr(&self, _address: &str, csr_pem: &[u8], token: &str) -> Result<Vec<u8>> {
            assert!(!token.is_empty());
            self.csr_submissions.fetch_add(1, Ordering::SeqCst);
            let csr = CertificateRequest::from_pem(csr_pem)?;
            if self.answer_with_root {
                return self.ca.certificate().to_pem();
            }
            self.ca.sign_csr(&csr)?.to_pem()
        }

        async fn acquire_credentials(
            &self,
            address: &str,
            payload: &Credentials,
            _auth: &BasicCredentials,
        ) -> Response {
            if let Some(delay) = self.delays.get(address) {
                tokio::time::sleep(*delay).await;
            }
            self.calls
                .lock()
                .unwrap()
                .push((address.to_string(), payload.clone()));
            let code = self.statuses.get(address).copied().unwrap_or(200);
            Response::new(address, code, if code == 200 { "OK" } else { "failed" })
        }
    }

    fn request(clients: &[&str]) -> Credentials {
        Credentials {
            servers: vec![crate::protocol::Server::new("10.0.0.1")],
            clients: clients.iter().map(|c| c.to_string()).collect(),
            public_ip: Some("52.1.2.3".to_string()),
            auth_token: None,
        }
    }

    fn admin() -> BasicCredentials {
        BasicCredentials::new("admin", "s3cret")
    }

    fn token_store(dir: &Path) -> TokenStore {
        TokenStore::new(dir.join("tokens"), 10, 10, None)
    }

    #[tokio::test]
    async fn test_fan_out_preserves_input_order() {
        let targets: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let results = fan_out(&targets, |index, target| async move {
            // Later targets finish first.
            tokio::time::sleep(Duration::from_millis(40 - 10 * index as u64)).await;
            format!("{}{}", target, index)
        })
        .await;
        assert_eq!(results, vec!["a0", "b1", "c2", "d3"]);
    }

    #[tokio::test]
    async fn test_distribute_short_circuits_on_bootstrap_failure() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new().status("10.0.0.1", 500);

        let responses = distribute_client_credentials(
            &request(&["10.0.0.2", "10.0.0.3"]),
            &admin(),
            &token_store(dir.path()),
            &transport,
        )
        .await
        .unwrap();

        assert_eq!(responses, vec![Response::new("10.0.0.1", 500, "failed")]);
        assert_eq!(transport.called().len(), 1);
    }

    #[tokio::test]
    async fn test_aborted_distributions_leave_only_head_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = token_store(dir.path());
        let transport = MockTransport::new().status("10.0.0.1", 500);

        for _ in 0..3 {
            distribute_client_credentials(
                &request(&["10.0.0.2", "10.0.0.3"]),
                &admin(),
                &tokens,
                &transport,
            )
            .await
            .unwrap();
        }

        assert_eq!(std::fs::read_dir(tokens.dir()).unwrap().count(), 3);
    }

    #[tokio::test]
    async fn test_expired_tokens_are_swept_by_the_next_distribution() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = TokenStore::new(dir.path().join("tokens"), 10, 10, Some(Duration::from_millis(200)));
        let transport = MockTransport::new().status("10.0.0.1", 500);
        for _ in 0..3 {
            distribute_client_credentials(&request(&["10.0.0.2"]), &admin(), &tokens, &transport)
                .await
                .unwrap();
        }
        assert_eq!(std::fs::read_dir(tokens.dir()).unwrap().count(), 3);

        tokio::time::sleep(Duration::from_millis(400)).await;
        distribute_client_credentials(&request(&["10.0.0.2"]), &admin(), &tokens, &transport)
            .await
            .unwrap();

        let remaining: Vec<String> = std::fs::read_dir(tokens.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        let latest = transport.called().last().unwrap().1.auth_token.clone().unwrap();
        assert_eq!(remaining, vec![latest]);
    }

    #[tokio::test]
    async fn test_distribute_orders_responses_and_scopes_public_ip() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::new()
            .delay("10.0.0.2", 60)
            .delay("10.0.0.3", 30)
            .status("10.0.0.3", 502);

        let responses = distribute_client_credentials(
            &request(&["10.0.0.2", "10.0.0.3", "10.0.0.4"]),
            &admin(),
            &token_store(dir.path()),
            &transport,
        )
        .await
        .unwrap();

        let targets: Vec<_> = responses.iter().map(|r| r.target.as_str()).collect();
        assert_eq!(targets, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"]);
        assert_eq!(responses[2].status_code, 502);

        let calls = transport.called();
        assert_eq!(calls.len(), 4);
        for (target, payload) in &calls {
            assert_eq!(payload.servers, vec![crate::protocol::Server::new("10.0.0.1")]);
            if target == "10.0.0.1" {
                assert_eq!(payload.public_ip.as_deref(), Some("52.1.2.3"));
            } else {
                assert_eq!(payload.public_ip, None);
            }
        }
        // The bootstrap server is always asked first.
        assert_eq!(calls[0].0, "10.0.0.1");

        assert!(matches!(
            ensure_all_succeeded(responses),
            Err(BootError::PartialDistribution(r)) if r.len() == 4
        ));
    }

    #[tokio::test]
    async fn test_distribute_mints_one_stored_token_per_target() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = token_store(dir.path());
        let transport = MockTransport::new();

        let responses =
            distribute_client_credentials(&request(&["10.0.0.2"]), &admin(), &tokens, &transport)
                .await
                .unwrap();
        assert!(ensure_all_succeeded(responses).is_ok());

        let issued: Vec<String> = transport
            .called()
            .into_iter()
            .map(|(_, payload)| payload.auth_token.unwrap())
            .collect();
        assert_eq!(issued.len(), 2);
        assert_ne!(issued[0], issued[1]);
        for token in issued {
            assert!(tokens.consume(&token).unwrap());
        }
    }

    #[tokio::test]
    async fn test_distribute_requires_a_server() {
        let dir = tempfile::tempdir().unwrap();
        let result = distribute_client_credentials(
            &Credentials::default(),
            &admin(),
            &token_store(dir.path()),
            &MockTransport::new(),
        )
        .await;
        assert!(matches!(result, Err(BootError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_acquire_writes_credentials_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let crt_dir = dir.path().join("crt");
        let transport = MockTransport::new();
        let mut request = request(&[]);
        request.auth_token = Some("token0123456789".to_string());

        acquire_client_credentials(&request, &crt_dir, &transport)
            .await
            .unwrap();

        let ca = Certificate::load(&crt_dir.join(CA_CERT_FILE)).unwrap();
        let crt = Certificate::load(&crt_dir.join(CLIENT_CERT_FILE)).unwrap();
        assert!(crt.is_signed_by(&ca));
        assert!(crt.ip_addresses().contains(&"52.1.2.3".parse().unwrap()));
        let key = Key::load(&crt_dir.join(CLIENT_KEY_FILE)).unwrap();
        assert!(crt.public_key().unwrap().public_eq(key.pkey()));

        let key_before = std::fs::read(crt_dir.join(CLIENT_KEY_FILE)).unwrap();
        acquire_client_credentials(&request, &crt_dir, &transport)
            .await
            .unwrap();
        assert_eq!(transport.ca_fetches.load(Ordering::SeqCst), 1);
        assert_eq!(transport.csr_submissions.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read(crt_dir.join(CLIENT_KEY_FILE)).unwrap(), key_before);
    }

    #[tokio::test]
    async fn test_acquire_refuses_certificate_without_tls_usage() {
        let dir = tempfile::tempdir().unwrap();
        let crt_dir = dir.path().join("crt");
        let transport = MockTransport::new().answering_with_root();
        let mut request = request(&[]);
        request.auth_token = Some("token0123456789".to_string());

        let result = acquire_client_credentials(&request, &crt_dir, &transport).await;

        assert!(matches!(result, Err(BootError::Signing(_))));
        assert!(!crt_dir.join(CLIENT_CERT_FILE).exists());
        assert!(crt_dir.join(CLIENT_KEY_FILE).exists());
    }

    #[tokio::test]
    async fn test_acquire_requires_token() {
        let dir = tempfile::tempdir().unwrap();
        let result = acquire_client_credentials(&request(&[]), dir.path(), &MockTransport::new()).await;
        assert!(matches!(result, Err(BootError::InvalidRequest(_))));
    }
}
