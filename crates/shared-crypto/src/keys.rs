//! Signing identities backed by RSA keys

use crate::error::{CryptoError, Result};
use crate::keystore::KeyStore;
use der::asn1::{ObjectIdentifier, PrintableStringRef, Utf8StringRef};
use der::Encode;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use x509_cert::Certificate;

const COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");

/// Trait for any identity that can sign documents
pub trait SigningIdentity {
    /// DER certificate embedded next to every signature
    fn certificate_der(&self) -> &[u8];

    /// Sign a SHA-256 digest with PKCS#1 v1.5 padding
    fn sign_prehashed(&self, hash: &[u8]) -> Result<Vec<u8>>;

    /// Get the signer name (from certificate subject or fallback)
    fn signer_name(&self) -> Option<String> {
        None
    }
}

/// Identity opened from a key store
pub struct RsaIdentity {
    private_key: RsaPrivateKey,
    certificate: Certificate,
    certificate_der: Vec<u8>,
}

impl RsaIdentity {
    pub fn from_key_store(store: KeyStore) -> Result<Self> {
        let certificate_der = store.certificate.to_der()?;
        Ok(Self {
            private_key: store.private_key,
            certificate: store.certificate,
            certificate_der,
        })
    }

    /// Open `blob` with `password` and wrap it as an identity
    pub fn open(blob: &[u8], password: &str) -> Result<Self> {
        Self::from_key_store(KeyStore::open(blob, password)?)
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.private_key.to_public_key()
    }
}

impl SigningIdentity for RsaIdentity {
    fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    fn sign_prehashed(&self, hash: &[u8]) -> Result<Vec<u8>> {
        self.private_key
            .sign(Pkcs1v15Sign::new::<Sha256>(), hash)
            .map_err(|e| CryptoError::Signing(e.to_string()))
    }

    fn signer_name(&self) -> Option<String> {
        common_name(&self.certificate)
    }
}

/// RSA public key carried by `certificate`
pub fn certificate_public_key(certificate: &Certificate) -> Result<RsaPublicKey> {
    let spki = certificate.tbs_certificate.subject_public_key_info.to_der()?;
    RsaPublicKey::from_public_key_der(&spki)
        .map_err(|e| CryptoError::Encoding(format!("certificate key is not RSA: {}", e)))
}

/// Check a PKCS#1 v1.5 signature over a SHA-256 digest.
///
/// # Arguments
/// * `certificate_der` - Certificate whose key made the signature
/// * `hash` - The 32-byte digest that was signed
/// * `signature` - Raw RSA signature bytes
pub fn verify_prehashed(certificate_der: &[u8], hash: &[u8], signature: &[u8]) -> Result<()> {
    use der::Decode;
    let certificate = Certificate::from_der(certificate_der)?;
    certificate_public_key(&certificate)?
        .verify(Pkcs1v15Sign::new::<Sha256>(), hash, signature)
        .map_err(|e| CryptoError::VerificationFailed(e.to_string()))
}

/// First CN of the certificate subject
pub fn common_name(certificate: &Certificate) -> Option<String> {
    certificate
        .tbs_certificate
        .subject
        .0
        .iter()
        .flat_map(|rdn| rdn.0.iter())
        .filter(|atv| atv.oid == COMMON_NAME)
        .find_map(|atv| {
            atv.value
                .decode_as::<Utf8StringRef<'_>>()
                .map(|s| s.as_str().to_string())
                .or_else(|_| {
                    atv.value
                        .decode_as::<PrintableStringRef<'_>>()
                        .map(|s| s.as_str().to_string())
                })
                .ok()
        })
}
