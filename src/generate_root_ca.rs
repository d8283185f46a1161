//! Root CA Certificate Generation Module
//!
//! Generates the self-signed root certificate that anchors the bootstrap
//! trust. There is no intermediate tier: the root signs every node
//! certificate directly.
//!
//! # Certificate Properties
//! - **Self-signed**: Issuer and subject are the same
//! - **Key Usage**: keyCertSign, cRLSign, digitalSignature
//! - **Basic Constraints**: CA=true, pathlen=0 (signs end-entity certificates only)
//! - **Serial Number**: drawn from the CA's serial counter
//! - **Version**: X.509v3 with extensions
//!
//! # Example
//! ```rust,no_run
//! # use certboot::generate_root_ca::RsaRootCABuilder;
//! # use certboot::key::Key;
//! # fn example() -> certboot::error::Result<()> {
//! let key = Key::generate()?;
//! let certificate = RsaRootCABuilder::new()
//!     .subject_common_name("Cluster Bootstrap CA".to_string())
//!     .organization("Example Corporation".to_string())
//!     .validity_days(3650)
//!     .serial_number(1)
//!     .build(&key)?;
//! # Ok(())
//! # }
//! ```

use openssl::bn::BigNum;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::x509::extension::{BasicConstraints, KeyUsage, SubjectKeyIdentifier};
use openssl::x509::{X509Name, X509};

use crate::certificate::Certificate;
use crate::configs::RootCADefaults;
use crate::error::{BootError, Result};
use crate::key::Key;

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
const ROOT_CA_PATH_LENGTH: u32 = 0;

// ================= Root CA Builder =================

/// Builder for the self-signed root CA certificate.
///
/// Only the common name is required; empty distinguished name fields are
/// left out of the subject.
pub struct RsaRootCABuilder {
    subject_common_name: String,
    organization: String,
    organizational_unit: String,
    locality: String,
    state: String,
    country: String,
    validity_days: u32,
    serial_number: u64,
}

impl RsaRootCABuilder {
    pub fn new() -> Self {
        Self {
            subject_common_name: String::new(),
            organization: String::new(),
            organizational_unit: String::new(),
            locality: String::new(),
            state: String::new(),
            country: String::new(),
            validity_days: 3650,
            serial_number: 1,
        }
    }

    /// Builder preloaded with the configured root CA subject and validity.
    pub fn from_defaults(defaults: &RootCADefaults) -> Self {
        Self::new()
            .subject_common_name(defaults.root_ca_common_name.clone())
            .organization(defaults.root_ca_organization.clone())
            .organizational_unit(defaults.root_ca_organizational_unit.clone())
            .locality(defaults.root_ca_locality.clone())
            .state(defaults.root_ca_state.clone())
            .country(defaults.root_ca_country.clone())
            .validity_days(defaults.root_ca_validity_days)
    }

    /// Set the common name (CN) for the certificate
    pub fn subject_common_name(mut self, cn: String) -> Self {
        self.subject_common_name = cn;
        self
    }

    /// Set the organization (O) for the certificate
    pub fn organization(mut self, org: String) -> Self {
        self.organization = org;
        self
    }

    /// Set the organizational unit (OU) for the certificate
    pub fn organizational_unit(mut self, ou: String) -> Self {
        self.organizational_unit = ou;
        self
    }

    /// Set the locality (L) for the certificate
    pub fn locality(mut self, locality: String) -> Self {
        self.locality = locality;
        self
    }

    /// Set the state/province (ST) for the certificate
    pub fn state(mut self, state: String) -> Self {
        self.state = state;
        self
    }

    /// Set the country (C) for the certificate (2-letter ISO code)
    pub fn country(mut self, country: String) -> Self {
        self.country = country;
        self
    }

    /// Set validity period in days
    pub fn validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    pub fn serial_number(mut self, serial: u64) -> Self {
        self.serial_number = serial;
        self
    }

    /// Self-sign a root CA certificate for `key`.
    ///
    /// # Errors
    /// Returns [`BootError::Signing`] if the common name is empty or any
    /// OpenSSL step (name, extension, signature) fails.
    pub fn build(self, key: &Key) -> Result<Certificate> {
        if self.subject_common_name.is_empty() {
            return Err(BootError::Signing(
                "root CA common name must not be empty".to_string(),
            ));
        }
        let x509 = self
            .build_x509(key)
            .map_err(|e| BootError::Signing(format!("Failed to build root CA: {}", e)))?;
        Certificate::from_x509(x509)
    }

    fn build_x509(&self, key: &Key) -> std::result::Result<X509, ErrorStack> {
        let mut builder = X509::builder()?;
        builder.set_version(X509_VERSION_3)?;

        let serial = BigNum::from_dec_str(&self.serial_number.to_string())?.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;

        let mut name_builder = X509Name::builder()?;
        name_builder.append_entry_by_nid(Nid::COMMONNAME, &self.subject_common_name)?;
        for (nid, value) in [
            (Nid::ORGANIZATIONNAME, &self.organization),
            (Nid::ORGANIZATIONALUNITNAME, &self.organizational_unit),
            (Nid::LOCALITYNAME, &self.locality),
            (Nid::STATEORPROVINCENAME, &self.state),
            (Nid::COUNTRYNAME, &self.country),
        ] {
            if !value.is_empty() {
                name_builder.append_entry_by_nid(nid, value)?;
            }
        }
        let name = name_builder.build();
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;

        let not_before = openssl::asn1::Asn1Time::days_from_now(0)?;
        builder.set_not_before(&not_before)?;
        let not_after = openssl::asn1::Asn1Time::days_from_now(self.validity_days)?;
        builder.set_not_after(&not_after)?;

        builder.set_pubkey(key.pkey())?;

        let bc = BasicConstraints::new()
            .critical()
            .ca()
            .pathlen(ROOT_CA_PATH_LENGTH)
            .build()?;
        builder.append_extension(bc)?;

        let ku = KeyUsage::new()
            .critical()
            .key_cert_sign()
            .crl_sign()
            .digital_signature()
            .build()?;
        builder.append_extension(ku)?;

        let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
        builder.append_extension(ski)?;

        builder.sign(key.pkey(), MessageDigest::sha256())?;
        Ok(builder.build())
    }
}

impl Default for RsaRootCABuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::name_to_string;

    #[test]
    fn test_build_self_signed_root() {
        let key = Key::generate().unwrap();
        let cert = RsaRootCABuilder::new()
            .subject_common_name("Test Root".to_string())
            .organization("Test Org".to_string())
            .serial_number(7)
            .build(&key)
            .unwrap();

        assert_eq!(name_to_string(cert.subject_name()), "CN=Test Root,O=Test Org");
        assert_eq!(
            name_to_string(cert.subject_name()),
            name_to_string(cert.issuer_name())
        );
        assert_eq!(cert.serial_number().unwrap(), "7");
        assert!(cert.is_signed_by(&cert));
    }

    #[test]
    fn test_requires_common_name() {
        let key = Key::generate().unwrap();
        let result = RsaRootCABuilder::new().build(&key);
        assert!(matches!(result, Err(BootError::Signing(_))));
    }
}
