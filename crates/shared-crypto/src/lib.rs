//! Shared cryptography utilities
//!
//! This crate provides certificate issuance, password-protected key stores,
//! and detached CMS signatures split into a hash step and an assembly step.

pub mod cert;
pub mod cms;
pub mod error;
pub mod keys;
pub mod keystore;

pub use cert::{CertificateIssuer, IssuerSettings};
pub use cms::{assemble, verify_detached, SignedAttributes, VerifiedSignature};
pub use error::CryptoError;
pub use keys::{verify_prehashed, RsaIdentity, SigningIdentity};
pub use keystore::KeyStore;
