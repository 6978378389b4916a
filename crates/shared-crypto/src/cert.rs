//! Self-signed signing certificates.
//!
//! Every call generates a brand-new RSA key pair; nothing is cached between
//! calls, so issuance is safe to run concurrently for different identities.

use crate::error::{CryptoError, Result};
use crate::keystore::KeyStore;
use der::asn1::ObjectIdentifier;
use der::oid::AssociatedOid;
use der::{Decode, Sequence};
use rand::RngCore;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::EncodePublicKey;
use rsa::RsaPrivateKey;
use sha2::Sha256;
use spki::SubjectPublicKeyInfoOwned;
use std::str::FromStr;
use std::time::Duration;
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::ext::pkix::{BasicConstraints, KeyUsage, KeyUsages};
use x509_cert::ext::{AsExtension, Extension};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::time::Validity;
use x509_cert::Certificate;

/// Issuer written into every certificate
pub const ISSUER_NAME: &str = "CN=Docsign Signing Authority,O=Docsign";

/// Provider class advertised to consumers that look for an enrollment CSP
pub const PROVIDER_NAME: &str = "Microsoft Enhanced RSA and AES Cryptographic Provider";

/// Smallest modulus ever generated
pub const MIN_RSA_BITS: usize = 2048;

/// szOID_ENROLLMENT_CSP_PROVIDER
const ENROLLMENT_CSP_PROVIDER: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.13.2.2");

/// AT_SIGNATURE
const KEY_SPEC_SIGNATURE: u32 = 2;

/// Vendor-compatibility extension naming the cryptographic provider class
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct CryptoProviderInfo {
    pub key_spec: u32,
    pub provider_name: String,
}

impl AssociatedOid for CryptoProviderInfo {
    const OID: ObjectIdentifier = ENROLLMENT_CSP_PROVIDER;
}

impl AsExtension for CryptoProviderInfo {
    fn critical(&self, _subject: &Name, _extensions: &[Extension]) -> bool {
        false
    }
}

/// Tunables for issuance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssuerSettings {
    /// Requested modulus size, raised to [`MIN_RSA_BITS`] when smaller
    pub rsa_bits: usize,
    pub validity_years: u32,
    /// PBKDF2 rounds protecting the packaged private key
    pub pbkdf2_iterations: u32,
}

impl Default for IssuerSettings {
    fn default() -> Self {
        Self {
            rsa_bits: MIN_RSA_BITS,
            validity_years: 5,
            pbkdf2_iterations: 100_000,
        }
    }
}

/// Generates key pairs and wraps them in self-signed certificates
#[derive(Debug, Clone, Default)]
pub struct CertificateIssuer {
    settings: IssuerSettings,
}

impl CertificateIssuer {
    pub fn new(settings: IssuerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &IssuerSettings {
        &self.settings
    }

    /// Issue a certificate for `distinguished_name` and seal it with its key.
    ///
    /// # Arguments
    /// * `distinguished_name` - RFC 4514 subject, e.g. `CN=Jane Doe,O=Acme`
    /// * `password` - Protects the private key inside the returned blob
    ///
    /// # Returns
    /// Serialized key-store blob (certificate + encrypted private key)
    pub fn issue(&self, distinguished_name: &str, password: &str) -> Result<Vec<u8>> {
        let subject = Name::from_str(distinguished_name)
            .map_err(|e| CryptoError::InvalidName(format!("{}: {}", distinguished_name, e)))?;
        let (private_key, certificate) = self.issue_certificate(subject)?;

        tracing::info!(
            "Issued certificate for {} ({} bit key, {} years)",
            distinguished_name,
            private_key_bits(&private_key),
            self.settings.validity_years
        );

        KeyStore::new(certificate, private_key, distinguished_name)
            .seal(password, self.settings.pbkdf2_iterations)
    }

    /// Generate a key pair and a certificate for it, without packaging
    pub fn issue_certificate(&self, subject: Name) -> Result<(RsaPrivateKey, Certificate)> {
        let mut rng = rand::thread_rng();
        let bits = self.settings.rsa_bits.max(MIN_RSA_BITS);

        let private_key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;

        let public_der = private_key
            .to_public_key()
            .to_public_key_der()
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        let spki = SubjectPublicKeyInfoOwned::from_der(public_der.as_bytes())?;

        let issuer = Name::from_str(ISSUER_NAME)?;
        let validity = Validity::from_now(Duration::from_secs(
            u64::from(self.settings.validity_years) * 365 * 24 * 60 * 60,
        ))?;
        let serial = random_serial(&mut rng)?;

        let signer = SigningKey::<Sha256>::new(private_key.clone());
        let mut builder = CertificateBuilder::new(
            Profile::Manual {
                issuer: Some(issuer),
            },
            serial,
            validity,
            subject,
            spki,
            &signer,
        )
        .map_err(|e| CryptoError::Signing(e.to_string()))?;

        builder
            .add_extension(&BasicConstraints {
                ca: false,
                path_len_constraint: None,
            })
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        builder
            .add_extension(&KeyUsage(KeyUsages::NonRepudiation.into()))
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        builder
            .add_extension(&CryptoProviderInfo {
                key_spec: KEY_SPEC_SIGNATURE,
                provider_name: PROVIDER_NAME.to_string(),
            })
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;

        let certificate = builder
            .build::<rsa::pkcs1v15::Signature>()
            .map_err(|e| CryptoError::Signing(e.to_string()))?;

        Ok((private_key, certificate))
    }
}

/// Positive 16-byte serial without a leading zero octet
fn random_serial(rng: &mut impl RngCore) -> Result<SerialNumber> {
    let mut bytes = [0u8; 16];
    rng.fill_bytes(&mut bytes);
    bytes[0] = (bytes[0] & 0x7F).max(1);
    Ok(SerialNumber::new(&bytes)?)
}

fn private_key_bits(key: &RsaPrivateKey) -> usize {
    use rsa::traits::PublicKeyParts;
    key.size() * 8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::certificate_public_key;
    use der::Encode;
    use x509_cert::ext::pkix::BasicConstraints;

    fn fast_issuer() -> CertificateIssuer {
        CertificateIssuer::new(IssuerSettings {
            rsa_bits: 1024,
            validity_years: 3,
            pbkdf2_iterations: 1_000,
        })
    }

    fn find_extension<'a>(cert: &'a Certificate, oid: ObjectIdentifier) -> Option<&'a Extension> {
        cert.tbs_certificate
            .extensions
            .as_ref()?
            .iter()
            .find(|ext| ext.extn_id == oid)
    }

    #[test]
    fn test_small_modulus_is_raised_to_minimum() {
        let subject = Name::from_str("CN=Jane Doe").unwrap();
        let (key, _) = fast_issuer().issue_certificate(subject).unwrap();
        assert_eq!(private_key_bits(&key), MIN_RSA_BITS);
    }

    #[test]
    fn test_certificate_shape() {
        let subject = Name::from_str("CN=Jane Doe,O=Acme").unwrap();
        let (key, cert) = fast_issuer().issue_certificate(subject.clone()).unwrap();
        let tbs = &cert.tbs_certificate;

        assert_eq!(tbs.subject, subject);
        assert_eq!(tbs.issuer, Name::from_str(ISSUER_NAME).unwrap());

        let constraints = find_extension(&cert, BasicConstraints::OID).unwrap();
        let decoded = BasicConstraints::from_der(constraints.extn_value.as_bytes()).unwrap();
        assert!(!decoded.ca);

        let usage = find_extension(&cert, KeyUsage::OID).unwrap();
        let decoded = KeyUsage::from_der(usage.extn_value.as_bytes()).unwrap();
        assert!(decoded.0.contains(KeyUsages::NonRepudiation));
        assert!(!decoded.0.contains(KeyUsages::KeyCertSign));

        let provider = find_extension(&cert, ENROLLMENT_CSP_PROVIDER).unwrap();
        let decoded = CryptoProviderInfo::from_der(provider.extn_value.as_bytes()).unwrap();
        assert_eq!(decoded.provider_name, PROVIDER_NAME);

        assert_eq!(certificate_public_key(&cert).unwrap(), key.to_public_key());
    }

    #[test]
    fn test_extensions_are_not_duplicated() {
        let subject = Name::from_str("CN=Jane Doe").unwrap();
        let (_, cert) = fast_issuer().issue_certificate(subject).unwrap();
        let extensions = cert.tbs_certificate.extensions.as_ref().unwrap();

        let mut oids: Vec<String> = extensions.iter().map(|e| e.extn_id.to_string()).collect();
        oids.sort();
        let before = oids.len();
        oids.dedup();
        assert_eq!(oids.len(), before, "duplicate extension in {:?}", oids);
        assert_eq!(extensions.len(), 3);

        let usage = find_extension(&cert, KeyUsage::OID).unwrap();
        let decoded = KeyUsage::from_der(usage.extn_value.as_bytes()).unwrap();
        assert_eq!(decoded.0, der::flagset::FlagSet::<KeyUsages>::from(KeyUsages::NonRepudiation));
    }

    #[test]
    fn test_validity_spans_configured_years() {
        let subject = Name::from_str("CN=Jane Doe").unwrap();
        let (_, cert) = fast_issuer().issue_certificate(subject).unwrap();
        let validity = &cert.tbs_certificate.validity;
        let span = validity.not_after.to_unix_duration() - validity.not_before.to_unix_duration();
        assert_eq!(span.as_secs(), 3 * 365 * 24 * 60 * 60);
    }

    #[test]
    fn test_each_issue_uses_a_fresh_key() {
        let subject = Name::from_str("CN=Jane Doe").unwrap();
        let issuer = fast_issuer();
        let (a, cert_a) = issuer.issue_certificate(subject.clone()).unwrap();
        let (b, cert_b) = issuer.issue_certificate(subject).unwrap();
        assert_ne!(a.to_public_key(), b.to_public_key());
        assert_ne!(
            cert_a.tbs_certificate.serial_number.to_der().unwrap(),
            cert_b.tbs_certificate.serial_number.to_der().unwrap()
        );
    }

    #[test]
    fn test_invalid_name_is_rejected() {
        let err = fast_issuer().issue("not a dn", "secret").unwrap_err();
        assert!(matches!(err, CryptoError::InvalidName(_)));
    }
}
