//! certboot - Cluster Certificate Bootstrap Library
//!
//! A minimal certificate authority plus the protocol that hands every node
//! of a cluster a client certificate for mutual TLS.
//!
//! # Overview
//!
//! One node (the bootstrap server) hosts the CA. An operator asks any node to
//! *distribute* credentials; that node mints a one-time token per target and
//! asks each target to *acquire* its credentials:
//!
//! ```text
//! operator ──POST /certboot/client/distribute──▶ node
//!     node ──POST /certboot/client/creds──▶ Servers[0], then Clients[..]
//!   target ──GET  /certboot/ca──▶ Servers[0]
//!   target ──POST /certboot/csr (Token)──▶ Servers[0]
//! ```
//!
//! Privileged routes are gated by Basic credentials and, for operator
//! traffic, an RSA-PSS signature over the request body.
//!
//! # Module Overview
//!
//! ## Key material
//!
//! - [`key`]: RSA private keys
//! - [`certificate_request`]: PKCS#10 requests carrying the node's identity
//! - [`certificate`]: issued X.509 certificates
//!
//! ## Certificate authority
//!
//! - [`generate_root_ca`]: self-signed root builder
//! - [`serial`]: persistent serial number counter
//! - [`authority`]: CA initialization and CSR signing
//!
//! ```no_run
//! use std::path::Path;
//!
//! use certboot::authority::CertificateAuthority;
//! use certboot::certificate_request::{CertificateRequest, IdentityClaims};
//! use certboot::configs::RootCADefaults;
//! use certboot::key::Key;
//!
//! # fn main() -> certboot::error::Result<()> {
//! let ca = CertificateAuthority::initialize(Path::new("./ca"), &RootCADefaults::default())?;
//! let key = Key::generate()?;
//! let csr = CertificateRequest::new(&key, &IdentityClaims::for_node(Some("10.0.0.7")))?;
//! let certificate = ca.sign_csr(&csr)?;
//! println!("issued serial {}", certificate.serial_number()?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Access control
//!
//! - [`authenticator`]: Basic/token identity check and body signatures
//! - [`token`]: one-time distribution tokens
//!
//! ## Distribution
//!
//! - [`distribution`]: the acquire and distribute flows
//! - [`transport`]: outbound calls to peers
//! - [`webserver`]: the HTTP service tying everything together
//!
//! # Error Handling
//!
//! Library APIs return [`error::Result`]; [`error::BootError`] also renders
//! itself as an HTTP response with a `{"Status": "..."}` body.

pub mod authenticator;
pub mod authority;
pub mod certificate;
pub mod certificate_request;
pub mod configs;
pub mod distribution;
pub mod error;
pub mod generate_root_ca;
pub mod key;
pub mod logger;
pub mod persist;
pub mod protocol;
pub mod serial;
pub mod token;
pub mod transport;
pub mod webserver;
