//! CMS (Cryptographic Message Syntax) for detached PDF signatures
//!
//! The signing flow is split in two so the private-key operation can happen
//! elsewhere:
//! 1. [`SignedAttributes::build`] commits to the document digest and the
//!    signer certificate; [`SignedAttributes::hash`] is what gets signed.
//! 2. [`assemble`] wraps the returned signature into a `SignedData`.
//!
//! Signed attributes follow PAdES-B:
//! - content-type
//! - signing-time
//! - message-digest
//! - signing-certificate-v2 (ESS)

use crate::error::{CryptoError, Result};
use crate::keys::{certificate_public_key, common_name};
use chrono::{DateTime, Utc};
use cms::cert::{CertificateChoices, IssuerAndSerialNumber};
use cms::content_info::{CmsVersion, ContentInfo};
use cms::signed_data::{
    CertificateSet, EncapsulatedContentInfo, SignedData, SignerIdentifier, SignerInfo,
    SignerInfos,
};
use der::asn1::{ObjectIdentifier, OctetString, SetOfVec, UtcTime};
use der::{Any, Decode, Encode, Sequence, SliceReader};
use rsa::Pkcs1v15Sign;
use sha2::{Digest, Sha256};
use spki::AlgorithmIdentifierOwned;
use std::time::Duration;
use subtle::ConstantTimeEq;
use x509_cert::attr::Attribute;
use x509_cert::time::Time;
use x509_cert::Certificate;

/// id-data (PKCS#7): 1.2.840.113549.1.7.1
pub const ID_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.1");

/// id-signedData (PKCS#7): 1.2.840.113549.1.7.2
pub const ID_SIGNED_DATA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.2");

/// content-type attribute: 1.2.840.113549.1.9.3
pub const ID_CONTENT_TYPE: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.3");

/// message-digest attribute: 1.2.840.113549.1.9.4
pub const ID_MESSAGE_DIGEST: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.4");

/// signing-time attribute: 1.2.840.113549.1.9.5
pub const ID_SIGNING_TIME: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.5");

/// id-aa-signingCertificateV2: 1.2.840.113549.1.9.16.2.47
pub const ID_SIGNING_CERTIFICATE_V2: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.16.2.47");

/// SHA-256: 2.16.840.1.101.3.4.2.1
pub const ID_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");

/// sha256WithRSAEncryption: 1.2.840.113549.1.1.11
pub const ID_SHA256_WITH_RSA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");

/// ESSCertIDv2 with the default (SHA-256) hash algorithm omitted
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct EssCertIdV2 {
    cert_hash: OctetString,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct SigningCertificateV2 {
    certs: Vec<EssCertIdV2>,
}

/// The attribute set an external signer commits to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedAttributes {
    attrs: SetOfVec<Attribute>,
}

impl SignedAttributes {
    /// Build PAdES-B signed attributes.
    ///
    /// # Arguments
    /// * `document_digest` - SHA-256 of the PDF byte range
    /// * `certificate_der` - Certificate of the key that will sign
    /// * `signing_time` - Claimed signing time
    pub fn build(
        document_digest: &[u8],
        certificate_der: &[u8],
        signing_time: DateTime<Utc>,
    ) -> Result<Self> {
        let seconds = u64::try_from(signing_time.timestamp())
            .map_err(|_| CryptoError::Encoding("signing time before 1970".to_string()))?;
        let time = Time::UtcTime(UtcTime::from_unix_duration(Duration::from_secs(seconds))?);

        let ess = SigningCertificateV2 {
            certs: vec![EssCertIdV2 {
                cert_hash: OctetString::new(Sha256::digest(certificate_der).to_vec())?,
            }],
        };

        let attrs = vec![
            attribute(ID_CONTENT_TYPE, Any::encode_from(&ID_DATA)?)?,
            attribute(ID_SIGNING_TIME, Any::encode_from(&time)?)?,
            attribute(
                ID_MESSAGE_DIGEST,
                Any::encode_from(&OctetString::new(document_digest.to_vec())?)?,
            )?,
            attribute(ID_SIGNING_CERTIFICATE_V2, Any::encode_from(&ess)?)?,
        ];

        Ok(Self {
            attrs: SetOfVec::try_from(attrs)?,
        })
    }

    /// Decode the DER produced by [`SignedAttributes::to_der`]
    pub fn from_der(bytes: &[u8]) -> Result<Self> {
        Ok(Self {
            attrs: SetOfVec::<Attribute>::from_der(bytes)?,
        })
    }

    /// DER encoding as a SET OF, the form the signature covers
    pub fn to_der(&self) -> Result<Vec<u8>> {
        Ok(self.attrs.to_der()?)
    }

    /// SHA-256 of the DER encoding; this is the value to sign
    pub fn hash(&self) -> Result<Vec<u8>> {
        Ok(Sha256::digest(self.to_der()?).to_vec())
    }

    /// The message-digest attribute value
    pub fn message_digest(&self) -> Option<Vec<u8>> {
        message_digest(&self.attrs)
    }
}

fn attribute(oid: ObjectIdentifier, value: Any) -> Result<Attribute> {
    Ok(Attribute {
        oid,
        values: SetOfVec::try_from(vec![value])?,
    })
}

fn message_digest(attrs: &SetOfVec<Attribute>) -> Option<Vec<u8>> {
    attrs
        .iter()
        .find(|attr| attr.oid == ID_MESSAGE_DIGEST)?
        .values
        .iter()
        .next()?
        .decode_as::<OctetString>()
        .ok()
        .map(|digest| digest.as_bytes().to_vec())
}

fn sha256_algorithm() -> AlgorithmIdentifierOwned {
    AlgorithmIdentifierOwned {
        oid: ID_SHA256,
        parameters: None,
    }
}

/// Wrap an externally produced signature into a DER `ContentInfo`.
///
/// # Arguments
/// * `signed_attributes` - The exact attributes whose hash was signed
/// * `signature` - PKCS#1 v1.5 signature over `signed_attributes.hash()`
/// * `certificate_der` - Signer certificate, embedded in the container
pub fn assemble(
    signed_attributes: &SignedAttributes,
    signature: &[u8],
    certificate_der: &[u8],
) -> Result<Vec<u8>> {
    let certificate = Certificate::from_der(certificate_der)?;

    let signer_info = SignerInfo {
        version: CmsVersion::V1,
        sid: SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
            issuer: certificate.tbs_certificate.issuer.clone(),
            serial_number: certificate.tbs_certificate.serial_number.clone(),
        }),
        digest_alg: sha256_algorithm(),
        signed_attrs: Some(signed_attributes.attrs.clone()),
        signature_algorithm: AlgorithmIdentifierOwned {
            oid: ID_SHA256_WITH_RSA,
            parameters: Some(Any::null()),
        },
        signature: OctetString::new(signature.to_vec())?,
        unsigned_attrs: None,
    };

    let signed_data = SignedData {
        version: CmsVersion::V1,
        digest_algorithms: SetOfVec::try_from(vec![sha256_algorithm()])?,
        encap_content_info: EncapsulatedContentInfo {
            econtent_type: ID_DATA,
            econtent: None,
        },
        certificates: Some(CertificateSet(SetOfVec::try_from(vec![
            CertificateChoices::Certificate(certificate),
        ])?)),
        crls: None,
        signer_infos: SignerInfos(SetOfVec::try_from(vec![signer_info])?),
    };

    let content_info = ContentInfo {
        content_type: ID_SIGNED_DATA,
        content: Any::encode_from(&signed_data)?,
    };
    Ok(content_info.to_der()?)
}

/// What a successful verification learned about the signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSignature {
    pub signer_name: Option<String>,
    pub certificate_der: Vec<u8>,
}

/// Verify a detached signature container against the signed content digest.
///
/// Trailing zero padding after the DER structure (as left by a PDF
/// `/Contents` placeholder) is ignored.
pub fn verify_detached(cms_der: &[u8], content_digest: &[u8]) -> Result<VerifiedSignature> {
    let mut reader = SliceReader::new(cms_der)
        .map_err(|e| CryptoError::MalformedSignature(e.to_string()))?;
    let content_info = ContentInfo::decode(&mut reader)
        .map_err(|e| CryptoError::MalformedSignature(e.to_string()))?;

    if content_info.content_type != ID_SIGNED_DATA {
        return Err(CryptoError::MalformedSignature(format!(
            "unexpected content type {}",
            content_info.content_type
        )));
    }

    let signed_data: SignedData = content_info
        .content
        .decode_as()
        .map_err(|e| CryptoError::MalformedSignature(e.to_string()))?;

    let signer_info = signed_data
        .signer_infos
        .0
        .iter()
        .next()
        .ok_or_else(|| CryptoError::MalformedSignature("no signer info".to_string()))?;

    let attrs = signer_info
        .signed_attrs
        .as_ref()
        .ok_or_else(|| CryptoError::MalformedSignature("no signed attributes".to_string()))?;

    let claimed_digest = message_digest(attrs)
        .ok_or_else(|| CryptoError::MalformedSignature("no message digest".to_string()))?;
    if !bool::from(claimed_digest.ct_eq(content_digest)) {
        return Err(CryptoError::VerificationFailed(
            "message digest does not match signed content".to_string(),
        ));
    }

    let certificate = signer_certificate(&signed_data, &signer_info.sid)?;
    let attrs_hash = Sha256::digest(attrs.to_der()?);
    certificate_public_key(&certificate)?
        .verify(
            Pkcs1v15Sign::new::<Sha256>(),
            &attrs_hash,
            signer_info.signature.as_bytes(),
        )
        .map_err(|e| CryptoError::VerificationFailed(e.to_string()))?;

    Ok(VerifiedSignature {
        signer_name: common_name(&certificate),
        certificate_der: certificate.to_der()?,
    })
}

fn signer_certificate(signed_data: &SignedData, sid: &SignerIdentifier) -> Result<Certificate> {
    let SignerIdentifier::IssuerAndSerialNumber(id) = sid else {
        return Err(CryptoError::MalformedSignature(
            "subject key identifiers are not supported".to_string(),
        ));
    };

    signed_data
        .certificates
        .as_ref()
        .into_iter()
        .flat_map(|set| set.0.iter())
        .find_map(|choice| match choice {
            CertificateChoices::Certificate(cert)
                if cert.tbs_certificate.serial_number == id.serial_number
                    && cert.tbs_certificate.issuer == id.issuer =>
            {
                Some(cert.clone())
            }
            _ => None,
        })
        .ok_or_else(|| CryptoError::MalformedSignature("signer certificate missing".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::{CertificateIssuer, IssuerSettings};
    use crate::keys::{RsaIdentity, SigningIdentity};
    use pretty_assertions::assert_eq;

    fn identity() -> RsaIdentity {
        let issuer = CertificateIssuer::new(IssuerSettings {
            pbkdf2_iterations: 1_000,
            ..IssuerSettings::default()
        });
        RsaIdentity::open(&issuer.issue("CN=CMS Tester", "pw").unwrap(), "pw").unwrap()
    }

    fn signed_container(id: &RsaIdentity, content: &[u8]) -> Vec<u8> {
        let digest = Sha256::digest(content);
        let attrs = SignedAttributes::build(&digest, id.certificate_der(), Utc::now()).unwrap();
        let signature = id.sign_prehashed(&attrs.hash().unwrap()).unwrap();
        assemble(&attrs, &signature, id.certificate_der()).unwrap()
    }

    #[test]
    fn test_attributes_survive_der_round_trip() {
        let id = identity();
        let attrs = SignedAttributes::build(&[7u8; 32], id.certificate_der(), Utc::now()).unwrap();
        let decoded = SignedAttributes::from_der(&attrs.to_der().unwrap()).unwrap();

        assert_eq!(decoded, attrs);
        assert_eq!(decoded.hash().unwrap(), attrs.hash().unwrap());
        assert_eq!(decoded.message_digest(), Some(vec![7u8; 32]));
    }

    #[test]
    fn test_assembled_container_verifies() {
        let id = identity();
        let content = b"%PDF-1.7 byte range";
        let cms = signed_container(&id, content);

        let verified = verify_detached(&cms, &Sha256::digest(content)).unwrap();

        assert_eq!(verified.signer_name.as_deref(), Some("CMS Tester"));
        assert_eq!(verified.certificate_der, id.certificate_der());
    }

    #[test]
    fn test_zero_padding_is_ignored() {
        let id = identity();
        let mut cms = signed_container(&id, b"content");
        cms.extend(std::iter::repeat(0u8).take(512));
        assert!(verify_detached(&cms, &Sha256::digest(b"content")).is_ok());
    }

    #[test]
    fn test_other_content_fails_digest_check() {
        let id = identity();
        let cms = signed_container(&id, b"original");
        let err = verify_detached(&cms, &Sha256::digest(b"tampered")).unwrap_err();
        assert!(matches!(err, CryptoError::VerificationFailed(_)));
    }

    #[test]
    fn test_signature_from_wrong_key_fails() {
        let id = identity();
        let other = identity();
        let digest = Sha256::digest(b"content");
        let attrs = SignedAttributes::build(&digest, id.certificate_der(), Utc::now()).unwrap();
        let bad_signature = other.sign_prehashed(&attrs.hash().unwrap()).unwrap();
        let cms = assemble(&attrs, &bad_signature, id.certificate_der()).unwrap();

        let err = verify_detached(&cms, &digest).unwrap_err();
        assert!(matches!(err, CryptoError::VerificationFailed(_)));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let err = verify_detached(&[0x30, 0x03, 0x02, 0x01], &[0u8; 32]).unwrap_err();
        assert!(matches!(err, CryptoError::MalformedSignature(_)));
    }
}
