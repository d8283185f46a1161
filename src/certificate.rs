//! Issued X.509 certificates

use std::net::IpAddr;
use std::path::Path;

use openssl::asn1::Asn1TimeRef;
use openssl::pkey::{PKey, Public};
use openssl::x509::{X509NameRef, X509};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::certificate_request::ip_from_bytes;
use crate::error::{BootError, Result};
use crate::persist;

#[derive(Clone)]
pub struct Certificate {
    der: Vec<u8>,
    x509: X509,
}

impl Certificate {
    pub fn from_x509(x509: X509) -> Result<Self> {
        let der = x509
            .to_der()
            .map_err(|e| BootError::parse("certificate", e))?;
        Ok(Self { der, x509 })
    }

    pub fn from_der(der: &[u8]) -> Result<Self> {
        let x509 = X509::from_der(der).map_err(|e| BootError::parse("certificate DER", e))?;
        Ok(Self {
            der: der.to_vec(),
            x509,
        })
    }

    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let x509 = X509::from_pem(pem).map_err(|e| BootError::parse("certificate PEM", e))?;
        Self::from_x509(x509)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let pem = persist::read(path)?;
        Self::from_pem(&pem)
    }

    pub fn to_pem(&self) -> Result<Vec<u8>> {
        self.x509
            .to_pem()
            .map_err(|e| BootError::parse("certificate", e))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        persist::write_owner_only(path, &self.to_pem()?)
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn x509(&self) -> &X509 {
        &self.x509
    }

    /// Serial number as a decimal string.
    pub fn serial_number(&self) -> Result<String> {
        self.x509
            .serial_number()
            .to_bn()
            .and_then(|bn| bn.to_dec_str())
            .map(|s| s.to_string())
            .map_err(|e| BootError::parse("certificate serial", e))
    }

    pub fn subject_name(&self) -> &X509NameRef {
        self.x509.subject_name()
    }

    pub fn issuer_name(&self) -> &X509NameRef {
        self.x509.issuer_name()
    }

    pub fn public_key(&self) -> Result<PKey<Public>> {
        self.x509
            .public_key()
            .map_err(|e| BootError::parse("certificate public key", e))
    }

    pub fn not_before(&self) -> &Asn1TimeRef {
        self.x509.not_before()
    }

    pub fn not_after(&self) -> &Asn1TimeRef {
        self.x509.not_after()
    }

    /// DNS entries of the subjectAltName extension.
    pub fn dns_names(&self) -> Vec<String> {
        self.x509
            .subject_alt_names()
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| name.dnsname().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// IP entries of the subjectAltName extension.
    pub fn ip_addresses(&self) -> Vec<IpAddr> {
        self.x509
            .subject_alt_names()
            .map(|names| {
                names
                    .iter()
                    .filter_map(|name| name.ipaddress().and_then(ip_from_bytes))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether the extendedKeyUsage extension permits both TLS client and
    /// server authentication, as required for mutual TLS between nodes.
    pub fn allows_mutual_tls(&self) -> bool {
        match X509Certificate::from_der(&self.der) {
            Ok((_, cert)) => matches!(
                cert.extended_key_usage(),
                Ok(Some(eku)) if eku.value.client_auth && eku.value.server_auth
            ),
            Err(_) => false,
        }
    }

    /// Whether `issuer` signed this certificate.
    pub fn is_signed_by(&self, issuer: &Certificate) -> bool {
        issuer
            .x509
            .public_key()
            .and_then(|key| self.x509.verify(&key))
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("serial", &self.serial_number().unwrap_or_default())
            .field("dns_names", &self.dns_names())
            .finish()
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

/// Text form of a name, e.g. `CN=localhost`, for comparisons and logs.
pub fn name_to_string(name: &X509NameRef) -> String {
    name.entries()
        .map(|entry| {
            let key = entry.object().nid().short_name().unwrap_or("?");
            let value = entry
                .data()
                .as_utf8()
                .map(|s| s.to_string())
                .unwrap_or_else(|_| "InvalidUTF8".to_string());
            format!("{}={}", key, value)
        })
        .collect::<Vec<_>>()
        .join(",")
}
