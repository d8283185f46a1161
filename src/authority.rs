//! Certificate authority
//!
//! The CA owns the root key pair under its directory and a persisted serial
//! counter:
//!
//! ```text
//! <ca_dir>/ca.key   root private key (0600)
//! <ca_dir>/ca.crt   self-signed root certificate
//! <ca_dir>/ca.srl   next serial number
//! ```
//!
//! Every certificate the CA signs, the root included, consumes one serial
//! number from the counter. Serial numbers start at 1, so the root gets 1
//! and the first issued certificate 2.

use std::path::{Path, PathBuf};

use chrono::Utc;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Public};
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
    SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::x509::X509;
use tracing::{info, warn};

use crate::certificate::{name_to_string, Certificate};
use crate::certificate_request::CertificateRequest;
use crate::configs::RootCADefaults;
use crate::error::{BootError, Result};
use crate::generate_root_ca::RsaRootCABuilder;
use crate::key::Key;
use crate::persist;
use crate::serial::{FileSerialStore, SerialStore};

pub const CA_KEY_FILE: &str = "ca.key";
pub const CA_CERT_FILE: &str = "ca.crt";
pub const CA_SERIAL_FILE: &str = "ca.srl";
/// X.509 serial numbers must be positive.
const FIRST_SERIAL: u64 = 1;

const X509_VERSION_3: i32 = 2;
/// Issued certificates are valid for one year from signing.
pub const LEAF_VALIDITY_DAYS: u32 = 365;
const SECS_PER_DAY: i64 = 24 * 60 * 60;

pub struct CertificateAuthority {
    ca_dir: PathBuf,
    key: Key,
    certificate: Certificate,
    serials: Box<dyn SerialStore>,
}

impl CertificateAuthority {
    /// Load the CA from `ca_dir`, creating the root key pair on first use.
    ///
    /// A directory holding only one of `ca.key`/`ca.crt` is treated as
    /// corrupt rather than silently regenerated.
    pub fn initialize(ca_dir: &Path, defaults: &RootCADefaults) -> Result<Self> {
        Self::initialize_impl(ca_dir, defaults)
            .map_err(|e| match e {
                BootError::CaInitialization(_) => e,
                other => BootError::CaInitialization(other.to_string()),
            })
    }

    fn initialize_impl(ca_dir: &Path, defaults: &RootCADefaults) -> Result<Self> {
        persist::ensure_dir(ca_dir)?;
        let key_path = ca_dir.join(CA_KEY_FILE);
        let cert_path = ca_dir.join(CA_CERT_FILE);
        let serial_path = ca_dir.join(CA_SERIAL_FILE);

        match (key_path.exists(), cert_path.exists()) {
            (true, true) => {
                let key = Key::load(&key_path)?;
                let certificate = Certificate::load(&cert_path)?;
                if !certificate.is_signed_by(&certificate) {
                    return Err(BootError::CaInitialization(format!(
                        "{} is not a self-signed root",
                        cert_path.display()
                    )));
                }
                let serials = FileSerialStore::open_or_init(&serial_path, next_serial_after(&certificate))?;
                info!(
                    "Loaded certificate authority {} from {}",
                    name_to_string(certificate.subject_name()),
                    ca_dir.display()
                );
                Ok(Self {
                    ca_dir: ca_dir.to_path_buf(),
                    key,
                    certificate,
                    serials: Box::new(serials),
                })
            }
            (false, false) => {
                info!("Generating certificate authority in {}", ca_dir.display());
                let serials = FileSerialStore::open_or_init(&serial_path, FIRST_SERIAL)?;
                let key = Key::generate()?;
                let certificate = RsaRootCABuilder::from_defaults(defaults)
                    .serial_number(serials.next_serial()?)
                    .build(&key)?;
                key.save(&key_path)?;
                certificate.save(&cert_path)?;
                info!(
                    "Certificate authority {} created",
                    name_to_string(certificate.subject_name())
                );
                Ok(Self {
                    ca_dir: ca_dir.to_path_buf(),
                    key,
                    certificate,
                    serials: Box::new(serials),
                })
            }
            (has_key, has_cert) => Err(BootError::CaInitialization(format!(
                "incomplete CA in {} (key present: {}, certificate present: {})",
                ca_dir.display(),
                has_key,
                has_cert
            ))),
        }
    }

    pub fn ca_dir(&self) -> &Path {
        &self.ca_dir
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// The serial number the next signed certificate will carry.
    pub fn next_serial_number(&self) -> Result<u64> {
        self.serials.peek()
    }

    /// Reserve the next serial number; returns the pre-increment value.
    pub fn get_serial_number(&self) -> Result<u64> {
        self.serials.next_serial()
    }

    /// Sign `csr` into a one-year client+server certificate.
    ///
    /// # Errors
    /// - [`BootError::Signing`] if the request's self-signature does not
    ///   verify or the certificate cannot be built or signed
    /// - [`BootError::SerialAllocation`] if no serial could be reserved
    pub fn sign_csr(&self, csr: &CertificateRequest) -> Result<Certificate> {
        if !csr.verify_self_signature() {
            warn!("Refusing to sign CSR with an invalid self-signature");
            return Err(BootError::Signing(
                "CSR signature does not match its public key".to_string(),
            ));
        }
        let public_key = csr.public_key()?;
        let serial = self.get_serial_number()?;
        let x509 = self
            .build_leaf(csr, &public_key, serial)
            .map_err(|e| BootError::Signing(format!("Failed to sign certificate: {}", e)))?;
        let certificate = Certificate::from_x509(x509)?;
        info!(
            "Signed certificate serial={} subject={} dns={:?}",
            serial,
            name_to_string(certificate.subject_name()),
            csr.identity().dns_names
        );
        Ok(certificate)
    }

    fn build_leaf(
        &self,
        csr: &CertificateRequest,
        public_key: &PKey<Public>,
        serial: u64,
    ) -> std::result::Result<X509, ErrorStack> {
        let ca_cert = self.certificate.x509();
        let mut builder = X509::builder()?;
        builder.set_version(X509_VERSION_3)?;

        let serial = BigNum::from_dec_str(&serial.to_string())?.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;

        builder.set_subject_name(csr.subject_name())?;
        builder.set_issuer_name(ca_cert.subject_name())?;

        let issued_at = Utc::now().timestamp();
        let not_before = Asn1Time::from_unix(issued_at)?;
        builder.set_not_before(&not_before)?;
        let not_after = Asn1Time::from_unix(issued_at + i64::from(LEAF_VALIDITY_DAYS) * SECS_PER_DAY)?;
        builder.set_not_after(&not_after)?;

        builder.set_pubkey(public_key)?;

        let bc = BasicConstraints::new().build()?;
        builder.append_extension(bc)?;

        let ku = KeyUsage::new()
            .critical()
            .data_encipherment()
            .digital_signature()
            .key_encipherment()
            .key_agreement()
            .build()?;
        builder.append_extension(ku)?;

        let eku = ExtendedKeyUsage::new().client_auth().server_auth().build()?;
        builder.append_extension(eku)?;

        let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(Some(ca_cert), None))?;
        builder.append_extension(ski)?;
        let aki = AuthorityKeyIdentifier::new()
            .keyid(false)
            .build(&builder.x509v3_context(Some(ca_cert), None))?;
        builder.append_extension(aki)?;

        let identity = csr.identity();
        if !identity.is_empty() {
            let mut san = SubjectAlternativeName::new();
            for dns in &identity.dns_names {
                san.dns(dns);
            }
            for ip in &identity.ip_addresses {
                san.ip(&ip.to_string());
            }
            let san = san.build(&builder.x509v3_context(Some(ca_cert), None))?;
            builder.append_extension(san)?;
        }

        builder.sign(self.key.pkey(), MessageDigest::sha256())?;
        Ok(builder.build())
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("ca_dir", &self.ca_dir)
            .field("certificate", &self.certificate)
            .finish()
    }
}

/// Serial to resume from when a CA directory lost its counter file.
fn next_serial_after(root: &Certificate) -> u64 {
    root.serial_number()
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .and_then(|s| s.checked_add(1))
        .unwrap_or(FIRST_SERIAL + 1)
}
