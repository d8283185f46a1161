//! Certificate signing requests
//!
//! A [`CertificateRequest`] binds the public half of a [`Key`] to a set of
//! identity claims carried in the subjectAltName extension. Requests are
//! built locally by joining nodes and parsed by the certificate authority
//! from the PEM received over the wire.

use std::net::IpAddr;
use std::path::Path;

use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Public};
use openssl::stack::Stack;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509NameBuilder, X509NameRef, X509Req, X509ReqBuilder};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;

use crate::error::{BootError, Result};
use crate::key::Key;
use crate::persist;

/// DNS and IP identities a node claims for itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityClaims {
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
}

impl IdentityClaims {
    /// Loopback identities plus the optional public address of the node.
    ///
    /// An address that does not parse as an IP literal is claimed as a DNS
    /// name instead.
    pub fn for_node(public_ip: Option<&str>) -> Self {
        let mut claims = Self {
            dns_names: vec!["localhost".to_string()],
            ip_addresses: vec![IpAddr::from([127, 0, 0, 1])],
        };
        if let Some(public) = public_ip.map(str::trim).filter(|p| !p.is_empty()) {
            match public.parse::<IpAddr>() {
                Ok(ip) if !claims.ip_addresses.contains(&ip) => claims.ip_addresses.push(ip),
                Ok(_) => {}
                Err(_) => claims.dns_names.push(public.to_string()),
            }
        }
        claims
    }

    pub fn is_empty(&self) -> bool {
        self.dns_names.is_empty() && self.ip_addresses.is_empty()
    }
}

pub struct CertificateRequest {
    der: Vec<u8>,
    req: X509Req,
    identity: IdentityClaims,
}

impl CertificateRequest {
    /// Build and sign a CSR for `key` claiming `identity`.
    ///
    /// The subject common name is the first DNS claim, or the first IP claim
    /// when there are no DNS names.
    pub fn new(key: &Key, identity: &IdentityClaims) -> Result<Self> {
        let der = build_request(key, identity)
            .map_err(|e| BootError::Signing(format!("Failed to create CSR: {}", e)))?;
        Self::from_der(&der)
    }

    pub fn from_der(der: &[u8]) -> Result<Self> {
        let req = X509Req::from_der(der).map_err(|e| BootError::parse("CSR DER", e))?;
        let identity = requested_identity(der)?;
        Ok(Self {
            der: der.to_vec(),
            req,
            identity,
        })
    }

    /// Parse the first CSR PEM block in `pem`; surrounding text is ignored.
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let req = X509Req::from_pem(pem).map_err(|e| BootError::parse("CSR PEM", e))?;
        let der = req.to_der().map_err(|e| BootError::parse("CSR DER", e))?;
        let identity = requested_identity(&der)?;
        Ok(Self { der, req, identity })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let pem = persist::read(path)?;
        Self::from_pem(&pem)
    }

    pub fn to_pem(&self) -> Result<Vec<u8>> {
        self.req.to_pem().map_err(|e| BootError::parse("CSR", e))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        persist::write_owner_only(path, &self.to_pem()?)
    }

    /// Whether the request's signature verifies against its own public key.
    pub fn verify_self_signature(&self) -> bool {
        self.req
            .public_key()
            .and_then(|public_key| self.req.verify(&public_key))
            .unwrap_or(false)
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn subject_name(&self) -> &X509NameRef {
        self.req.subject_name()
    }

    pub fn public_key(&self) -> Result<PKey<Public>> {
        self.req
            .public_key()
            .map_err(|e| BootError::parse("CSR public key", e))
    }

    pub fn identity(&self) -> &IdentityClaims {
        &self.identity
    }
}

impl std::fmt::Debug for CertificateRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateRequest")
            .field("identity", &self.identity)
            .field("der_len", &self.der.len())
            .finish()
    }
}

impl PartialEq for CertificateRequest {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

fn build_request(
    key: &Key,
    identity: &IdentityClaims,
) -> std::result::Result<Vec<u8>, openssl::error::ErrorStack> {
    let mut builder = X509ReqBuilder::new()?;
    builder.set_version(0)?;
    builder.set_pubkey(key.pkey())?;

    let common_name = identity
        .dns_names
        .first()
        .cloned()
        .or_else(|| identity.ip_addresses.first().map(IpAddr::to_string));
    let mut name_builder = X509NameBuilder::new()?;
    if let Some(cn) = common_name {
        name_builder.append_entry_by_nid(Nid::COMMONNAME, &cn)?;
    }
    builder.set_subject_name(&name_builder.build())?;

    if !identity.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for dns in &identity.dns_names {
            san.dns(dns);
        }
        for ip in &identity.ip_addresses {
            san.ip(&ip.to_string());
        }
        let extension = san.build(&builder.x509v3_context(None))?;
        let mut extensions = Stack::new()?;
        extensions.push(extension)?;
        builder.add_extensions(&extensions)?;
    }

    builder.sign(key.pkey(), MessageDigest::sha256())?;
    builder.build().to_der()
}

/// Collect the subjectAltName entries a CSR asks for.
fn requested_identity(der: &[u8]) -> Result<IdentityClaims> {
    let (_, csr) =
        X509CertificationRequest::from_der(der).map_err(|e| BootError::parse("CSR DER", e))?;
    let mut identity = IdentityClaims::default();
    if let Some(extensions) = csr.requested_extensions() {
        for extension in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = extension {
                for name in &san.general_names {
                    match name {
                        GeneralName::DNSName(dns) => identity.dns_names.push(dns.to_string()),
                        GeneralName::IPAddress(bytes) => {
                            if let Some(ip) = ip_from_bytes(bytes) {
                                identity.ip_addresses.push(ip);
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }
    Ok(identity)
}

pub(crate) fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_for_node() {
        let claims = IdentityClaims::for_node(Some("52.14.3.9"));
        assert_eq!(claims.dns_names, vec!["localhost"]);
        assert_eq!(
            claims.ip_addresses,
            vec![
                "127.0.0.1".parse::<IpAddr>().unwrap(),
                "52.14.3.9".parse::<IpAddr>().unwrap()
            ]
        );

        let hostname = IdentityClaims::for_node(Some("node1.example.com"));
        assert_eq!(hostname.dns_names, vec!["localhost", "node1.example.com"]);

        let none = IdentityClaims::for_node(None);
        assert_eq!(none.ip_addresses.len(), 1);
    }

    #[test]
    fn test_new_request_carries_claims() {
        let key = Key::generate().unwrap();
        let claims = IdentityClaims::for_node(Some("10.1.2.3"));
        let csr = CertificateRequest::new(&key, &claims).unwrap();

        assert_eq!(csr.identity(), &claims);
        assert!(csr.verify_self_signature());
        assert_eq!(
            csr.public_key().unwrap().public_key_to_der().unwrap(),
            key.pkey().public_key_to_der().unwrap()
        );
    }

    #[test]
    fn test_pem_round_trip() {
        let key = Key::generate().unwrap();
        let csr = CertificateRequest::new(&key, &IdentityClaims::for_node(None)).unwrap();

        let pem = csr.to_pem().unwrap();
        let parsed = CertificateRequest::from_pem(&pem).unwrap();

        assert_eq!(parsed.der(), csr.der());
        assert_eq!(parsed.identity(), csr.identity());
    }

    #[test]
    fn test_from_pem_tolerates_surrounding_text() {
        let key = Key::generate().unwrap();
        let csr = CertificateRequest::new(&key, &IdentityClaims::for_node(None)).unwrap();
        let mut wrapped = b"leading noise\n".to_vec();
        wrapped.extend_from_slice(&csr.to_pem().unwrap());
        wrapped.extend_from_slice(b"\ntrailing noise\n");

        assert_eq!(CertificateRequest::from_pem(&wrapped).unwrap(), csr);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            CertificateRequest::from_pem(b"no pem here"),
            Err(BootError::Parse { .. })
        ));
        assert!(matches!(
            CertificateRequest::from_der(&[0x30, 0x03, 0x01, 0x02]),
            Err(BootError::Parse { .. })
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.csr");
        let key = Key::generate().unwrap();
        let csr = CertificateRequest::new(&key, &IdentityClaims::for_node(None)).unwrap();

        csr.save(&path).unwrap();
        assert_eq!(CertificateRequest::load(&path).unwrap(), csr);
    }
}
