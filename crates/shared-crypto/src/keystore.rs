//! Password-protected key-store blobs.
//!
//! A blob is a DER `SEQUENCE { version, friendlyName, certificate,
//! encryptedKey }` where `encryptedKey` is a PKCS#8 `EncryptedPrivateKeyInfo`
//! (PBES2: PBKDF2-SHA256 + AES-256-CBC). The private key never appears in
//! the blob unencrypted.

use crate::error::{CryptoError, Result};
use crate::keys::certificate_public_key;
use der::asn1::OctetString;
use der::{Decode, Encode, Sequence};
use pkcs8::pkcs5::pbes2;
use pkcs8::PrivateKeyInfo;
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::RsaPrivateKey;
use x509_cert::Certificate;

const KEY_STORE_VERSION: u8 = 1;

#[derive(Clone, Debug, Sequence)]
struct KeyStoreContainer {
    version: u8,
    friendly_name: String,
    certificate: Certificate,
    encrypted_key: OctetString,
}

/// A certificate together with its private key
#[derive(Clone, Debug)]
pub struct KeyStore {
    pub certificate: Certificate,
    pub private_key: RsaPrivateKey,
    pub friendly_name: String,
}

impl KeyStore {
    pub fn new(
        certificate: Certificate,
        private_key: RsaPrivateKey,
        friendly_name: impl Into<String>,
    ) -> Self {
        Self {
            certificate,
            private_key,
            friendly_name: friendly_name.into(),
        }
    }

    /// Serialize with the private key encrypted under `password`
    pub fn seal(&self, password: &str, pbkdf2_iterations: u32) -> Result<Vec<u8>> {
        let mut rng = rand::thread_rng();
        let mut salt = [0u8; 16];
        let mut iv = [0u8; 16];
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut iv);

        let params = pbes2::Parameters::pbkdf2_sha256_aes256cbc(pbkdf2_iterations, &salt, &iv)
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;

        let plain = self
            .private_key
            .to_pkcs8_der()
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        let info = PrivateKeyInfo::from_der(plain.as_bytes())?;
        let encrypted = info
            .encrypt_with_params(params, password.as_bytes())
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;

        let container = KeyStoreContainer {
            version: KEY_STORE_VERSION,
            friendly_name: self.friendly_name.clone(),
            certificate: self.certificate.clone(),
            encrypted_key: OctetString::new(encrypted.as_bytes())?,
        };
        Ok(container.to_der()?)
    }

    /// Decrypt a blob produced by [`KeyStore::seal`]
    pub fn open(blob: &[u8], password: &str) -> Result<Self> {
        let container = KeyStoreContainer::from_der(blob)
            .map_err(|e| CryptoError::KeyStore(format!("not a key store: {}", e)))?;

        if container.version != KEY_STORE_VERSION {
            return Err(CryptoError::KeyStore(format!(
                "unsupported version {}",
                container.version
            )));
        }

        let private_key = RsaPrivateKey::from_pkcs8_encrypted_der(
            container.encrypted_key.as_bytes(),
            password.as_bytes(),
        )
        .map_err(|_| CryptoError::KeyStore("wrong password or corrupt key".to_string()))?;

        if certificate_public_key(&container.certificate)? != private_key.to_public_key() {
            return Err(CryptoError::KeyStore(
                "certificate does not match the packaged key".to_string(),
            ));
        }

        Ok(Self {
            certificate: container.certificate,
            private_key,
            friendly_name: container.friendly_name,
        })
    }

    /// DER encoding of the certificate
    pub fn certificate_der(&self) -> Result<Vec<u8>> {
        Ok(self.certificate.to_der()?)
    }
}
