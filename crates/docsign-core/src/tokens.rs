//! Signer tokens and bearer credentials
//!
//! Each (collection, signer) pair gets one mapping: a session token for the
//! signing link (redeemable once), a long-lived auth token, and, after
//! redemption, an HS256 bearer JWT. The JWT is built with `hmac` and
//! `base64` directly rather than a JWT crate.

use crate::collaborators::{lock, Clock};
use crate::config::TokenSettings;
use crate::error::{Result, SigningError};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::Sha256;
use shared_types::{CollectionId, ExternalIdentity, SignerId, SignerTokenMapping};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// JWT Header for HS256
#[derive(Debug, Serialize, Deserialize)]
struct JwtHeader {
    alg: String,
    typ: String,
}

impl Default for JwtHeader {
    fn default() -> Self {
        Self {
            alg: "HS256".to_string(),
            typ: "JWT".to_string(),
        }
    }
}

/// Claims carried by a signer's bearer credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BearerClaims {
    /// Signer id
    pub sub: String,
    pub collection: String,
    /// Issued at (Unix timestamp)
    pub iat: u64,
    /// Expiration (Unix timestamp)
    pub exp: u64,
}

fn invalid(reason: &str) -> SigningError {
    SigningError::InvalidCredential(reason.to_string())
}

fn new_mac(secret: &str) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| SigningError::InvalidCredential(format!("HMAC error: {}", e)))
}

/// Encode claims to JWT using HS256
fn encode_jwt<T: Serialize>(claims: &T, secret: &str) -> Result<String> {
    let header_json =
        serde_json::to_string(&JwtHeader::default()).map_err(|e| invalid(&e.to_string()))?;
    let header_b64 = URL_SAFE_NO_PAD.encode(header_json.as_bytes());

    let payload_json = serde_json::to_string(claims).map_err(|e| invalid(&e.to_string()))?;
    let payload_b64 = URL_SAFE_NO_PAD.encode(payload_json.as_bytes());

    let signing_input = format!("{}.{}", header_b64, payload_b64);

    let mut mac = new_mac(secret)?;
    mac.update(signing_input.as_bytes());
    let signature_b64 = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{}.{}", signing_input, signature_b64))
}

/// Decode and validate JWT using HS256
fn decode_jwt<T: DeserializeOwned>(token: &str, secret: &str) -> Result<T> {
    let parts: Vec<&str> = token.split('.').collect();
    let [header_b64, payload_b64, signature_b64] = parts.as_slice() else {
        return Err(invalid("Invalid token format"));
    };

    let signing_input = format!("{}.{}", header_b64, payload_b64);
    let mut mac = new_mac(secret)?;
    mac.update(signing_input.as_bytes());

    let signature = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| invalid("Invalid signature encoding"))?;
    mac.verify_slice(&signature)
        .map_err(|_| invalid("Invalid signature"))?;

    let header_bytes = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|_| invalid("Invalid header encoding"))?;
    let header: JwtHeader =
        serde_json::from_slice(&header_bytes).map_err(|_| invalid("Invalid header format"))?;
    if header.alg != "HS256" {
        return Err(invalid("Unsupported algorithm"));
    }

    let payload_bytes = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| invalid("Invalid payload encoding"))?;
    serde_json::from_slice(&payload_bytes).map_err(|_| invalid("Invalid payload format"))
}

/// Extract the token from an `Authorization: Bearer ...` header value
pub fn extract_bearer_token(auth_header: Option<&str>) -> Option<String> {
    auth_header
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn subject_of(claims: &BearerClaims) -> Result<(CollectionId, SignerId)> {
    let collection_id = claims
        .collection
        .parse()
        .map_err(|_| invalid("Invalid collection claim"))?;
    let signer_id = claims
        .sub
        .parse()
        .map_err(|_| invalid("Invalid subject claim"))?;
    Ok((collection_id, signer_id))
}

type MappingKey = (CollectionId, SignerId);

pub struct TokenIssuer {
    settings: TokenSettings,
    clock: Arc<dyn Clock>,
    mappings: Mutex<HashMap<MappingKey, SignerTokenMapping>>,
}

impl TokenIssuer {
    pub fn new(settings: TokenSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            mappings: Mutex::new(HashMap::new()),
        }
    }

    /// Create (or replace) the mapping for a signer.
    ///
    /// # Arguments
    /// * `expires_at` - End of the signer's link validity; defaults to the session TTL
    pub fn issue(
        &self,
        collection_id: CollectionId,
        signer_id: SignerId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<SignerTokenMapping> {
        let now = self.clock.now();
        let mapping = SignerTokenMapping {
            collection_id,
            signer_id,
            session_token: Uuid::new_v4().simple().to_string(),
            auth_token: Uuid::new_v4().simple().to_string(),
            bearer: None,
            external_identity: None,
            issued_at: now,
            expires_at: expires_at
                .unwrap_or_else(|| now + Duration::hours(self.settings.session_ttl_hours)),
            session_token_used: false,
            revoked: false,
        };
        lock(&self.mappings)?.insert((collection_id, signer_id), mapping.clone());
        tracing::debug!("Issued tokens for signer {} in {}", signer_id, collection_id);
        Ok(mapping)
    }

    /// Exchange a link's session token for a bearer credential. Works once.
    pub fn redeem_session_token(&self, session_token: &str) -> Result<SignerTokenMapping> {
        let now = self.clock.now();
        let mut mappings = lock(&self.mappings)?;
        let mapping = mappings
            .values_mut()
            .find(|m| m.session_token == session_token)
            .ok_or_else(|| invalid("Unknown session token"))?;

        if mapping.revoked {
            return Err(invalid("Session has ended"));
        }
        if mapping.session_token_used {
            return Err(SigningError::Expired(
                "session token already redeemed".to_string(),
            ));
        }
        if !mapping.is_usable(now) {
            return Err(SigningError::Expired("signing link expired".to_string()));
        }

        self.mint_bearer(mapping, now)?;
        mapping.session_token_used = true;
        Ok(mapping.clone())
    }

    /// Replace the mapping's bearer with a fresh one; earlier bearers stop working
    fn mint_bearer(&self, mapping: &mut SignerTokenMapping, now: DateTime<Utc>) -> Result<()> {
        let bearer_exp = (now + Duration::hours(self.settings.bearer_ttl_hours)).min(mapping.expires_at);
        let claims = BearerClaims {
            sub: mapping.signer_id.to_string(),
            collection: mapping.collection_id.to_string(),
            iat: u64::try_from(now.timestamp()).unwrap_or(0),
            exp: u64::try_from(bearer_exp.timestamp()).unwrap_or(0),
        };
        mapping.bearer = Some(encode_jwt(&claims, &self.settings.jwt_secret)?);
        Ok(())
    }

    /// Issue a new bearer against the long-lived auth token.
    ///
    /// Only available once the signing link has been redeemed.
    pub fn refresh_bearer(&self, auth_token: &str) -> Result<SignerTokenMapping> {
        let now = self.clock.now();
        let mut mappings = lock(&self.mappings)?;
        let mapping = mappings
            .values_mut()
            .find(|m| m.auth_token == auth_token)
            .ok_or_else(|| invalid("Unknown auth token"))?;

        if mapping.revoked {
            return Err(invalid("Session has ended"));
        }
        if !mapping.session_token_used {
            return Err(invalid("Signing link has not been opened"));
        }
        if !mapping.is_usable(now) {
            return Err(SigningError::Expired("signing link expired".to_string()));
        }

        self.mint_bearer(mapping, now)?;
        tracing::debug!("Refreshed bearer for signer {}", mapping.signer_id);
        Ok(mapping.clone())
    }

    /// Whose bearer this is, checking only its signature
    pub fn bearer_subject(&self, bearer: &str) -> Result<(CollectionId, SignerId)> {
        let claims: BearerClaims = decode_jwt(bearer, &self.settings.jwt_secret)?;
        subject_of(&claims)
    }

    /// Check a bearer credential's signature, expiry and revocation
    pub fn authenticate_bearer(&self, bearer: &str) -> Result<(CollectionId, SignerId)> {
        let claims: BearerClaims = decode_jwt(bearer, &self.settings.jwt_secret)?;

        let now = u64::try_from(self.clock.now().timestamp()).unwrap_or(0);
        if claims.exp <= now {
            return Err(SigningError::Expired("bearer credential expired".to_string()));
        }

        let (collection_id, signer_id) = subject_of(&claims)?;
        let mappings = lock(&self.mappings)?;
        let mapping = mappings
            .get(&(collection_id, signer_id))
            .ok_or_else(|| invalid("No session for bearer"))?;
        if mapping.revoked || mapping.bearer.as_deref() != Some(bearer) {
            return Err(invalid("Bearer credential revoked"));
        }
        Ok((collection_id, signer_id))
    }

    /// Who a session token was issued to, without redeeming it
    pub fn peek_session_token(&self, session_token: &str) -> Option<(CollectionId, SignerId)> {
        self.mappings.lock().ok().and_then(|mappings| {
            mappings
                .values()
                .find(|m| m.session_token == session_token)
                .map(|m| (m.collection_id, m.signer_id))
        })
    }

    /// Who the long-lived auth token belongs to. Revoked tokens resolve to nothing.
    pub fn resolve_auth_token(&self, auth_token: &str) -> Result<(CollectionId, SignerId)> {
        lock(&self.mappings)?
            .values()
            .find(|m| m.auth_token == auth_token && !m.revoked)
            .map(|m| (m.collection_id, m.signer_id))
            .ok_or_else(|| invalid("Unknown auth token"))
    }

    pub fn mapping(&self, collection_id: CollectionId, signer_id: SignerId) -> Option<SignerTokenMapping> {
        self.mappings
            .lock()
            .ok()
            .and_then(|m| m.get(&(collection_id, signer_id)).cloned())
    }

    pub fn record_external_identity(
        &self,
        collection_id: CollectionId,
        signer_id: SignerId,
        identity: ExternalIdentity,
    ) -> Result<()> {
        let mut mappings = lock(&self.mappings)?;
        let mapping = mappings
            .get_mut(&(collection_id, signer_id))
            .ok_or_else(|| SigningError::NotFound(format!("tokens for signer {}", signer_id)))?;
        mapping.external_identity = Some(identity);
        Ok(())
    }

    /// Invalidate every token of one signer
    pub fn revoke(&self, collection_id: CollectionId, signer_id: SignerId) -> Result<bool> {
        let mut mappings = lock(&self.mappings)?;
        Ok(match mappings.get_mut(&(collection_id, signer_id)) {
            Some(mapping) if !mapping.revoked => {
                mapping.revoked = true;
                tracing::debug!("Revoked tokens for signer {}", signer_id);
                true
            }
            _ => false,
        })
    }

    /// Invalidate every token of a collection
    pub fn revoke_collection(&self, collection_id: CollectionId) -> Result<usize> {
        let mut mappings = lock(&self.mappings)?;
        let mut revoked = 0;
        for mapping in mappings
            .values_mut()
            .filter(|m| m.collection_id == collection_id && !m.revoked)
        {
            mapping.revoked = true;
            revoked += 1;
        }
        Ok(revoked)
    }

    /// Drop mappings that are revoked or past their expiry
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut mappings = lock(&self.mappings)?;
        let before = mappings.len();
        mappings.retain(|_, m| m.is_usable(now));
        Ok(before - mappings.len())
    }

    pub fn len(&self) -> usize {
        self.mappings.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::ManualClock;

    const TEST_SECRET: &str = "test-secret-key-at-least-32-bytes-long";

    fn issuer() -> (TokenIssuer, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let settings = TokenSettings {
            jwt_secret: TEST_SECRET.to_string(),
            ..TokenSettings::default()
        };
        (TokenIssuer::new(settings, clock.clone()), clock)
    }

    #[test]
    fn test_session_token_redeems_once() {
        let (issuer, _) = issuer();
        let mapping = issuer.issue(CollectionId::new(), SignerId::new(), None).unwrap();

        let redeemed = issuer.redeem_session_token(&mapping.session_token).unwrap();
        assert!(redeemed.bearer.is_some());

        assert!(matches!(
            issuer.redeem_session_token(&mapping.session_token),
            Err(SigningError::Expired(_))
        ));
    }

    #[test]
    fn test_bearer_identifies_signer() {
        let (issuer, _) = issuer();
        let collection = CollectionId::new();
        let signer = SignerId::new();
        let mapping = issuer.issue(collection, signer, None).unwrap();
        let bearer = issuer
            .redeem_session_token(&mapping.session_token)
            .unwrap()
            .bearer
            .unwrap();

        assert_eq!(issuer.authenticate_bearer(&bearer).unwrap(), (collection, signer));
    }

    #[test]
    fn test_revoked_bearer_is_refused() {
        let (issuer, _) = issuer();
        let collection = CollectionId::new();
        let signer = SignerId::new();
        let mapping = issuer.issue(collection, signer, None).unwrap();
        let bearer = issuer
            .redeem_session_token(&mapping.session_token)
            .unwrap()
            .bearer
            .unwrap();

        assert!(issuer.revoke(collection, signer).unwrap());
        assert!(matches!(
            issuer.authenticate_bearer(&bearer),
            Err(SigningError::InvalidCredential(_))
        ));
    }

    #[test]
    fn test_expired_link_cannot_be_redeemed() {
        let (issuer, clock) = issuer();
        let expires = clock.now() + Duration::hours(1);
        let mapping = issuer.issue(CollectionId::new(), SignerId::new(), Some(expires)).unwrap();

        clock.advance(Duration::hours(2));

        assert!(matches!(
            issuer.redeem_session_token(&mapping.session_token),
            Err(SigningError::Expired(_))
        ));
    }

    #[test]
    fn test_bearer_expires() {
        let (issuer, clock) = issuer();
        let mapping = issuer.issue(CollectionId::new(), SignerId::new(), None).unwrap();
        let bearer = issuer
            .redeem_session_token(&mapping.session_token)
            .unwrap()
            .bearer
            .unwrap();

        clock.advance(Duration::hours(25));

        assert!(matches!(
            issuer.authenticate_bearer(&bearer),
            Err(SigningError::Expired(_))
        ));
    }

    #[test]
    fn test_tampered_bearer_is_refused() {
        let (issuer, _) = issuer();
        let mapping = issuer.issue(CollectionId::new(), SignerId::new(), None).unwrap();
        let bearer = issuer
            .redeem_session_token(&mapping.session_token)
            .unwrap()
            .bearer
            .unwrap();

        let forged = encode_jwt(
            &BearerClaims {
                sub: SignerId::new().to_string(),
                collection: mapping.collection_id.to_string(),
                iat: 0,
                exp: u64::MAX,
            },
            "wrong-secret",
        )
        .unwrap();

        assert!(issuer.authenticate_bearer(&forged).is_err());
        assert!(issuer.authenticate_bearer("invalid-token").is_err());
        assert!(issuer.authenticate_bearer(&format!("{}x", bearer)).is_err());
    }

    #[test]
    fn test_auth_token_refreshes_bearer() {
        let (issuer, clock) = issuer();
        let collection = CollectionId::new();
        let signer = SignerId::new();
        let mapping = issuer.issue(collection, signer, None).unwrap();

        assert!(matches!(
            issuer.refresh_bearer(&mapping.auth_token),
            Err(SigningError::InvalidCredential(_))
        ));

        let first = issuer
            .redeem_session_token(&mapping.session_token)
            .unwrap()
            .bearer
            .unwrap();
        clock.advance(Duration::seconds(1));
        let second = issuer
            .refresh_bearer(&mapping.auth_token)
            .unwrap()
            .bearer
            .unwrap();

        assert_ne!(first, second);
        assert_eq!(issuer.authenticate_bearer(&second).unwrap(), (collection, signer));
        assert!(issuer.authenticate_bearer(&first).is_err());
    }

    #[test]
    fn test_revoked_auth_token_is_refused() {
        let (issuer, _) = issuer();
        let collection = CollectionId::new();
        let signer = SignerId::new();
        let mapping = issuer.issue(collection, signer, None).unwrap();
        issuer.redeem_session_token(&mapping.session_token).unwrap();

        assert_eq!(
            issuer.resolve_auth_token(&mapping.auth_token).unwrap(),
            (collection, signer)
        );

        issuer.revoke(collection, signer).unwrap();

        assert!(issuer.resolve_auth_token(&mapping.auth_token).is_err());
        assert!(matches!(
            issuer.refresh_bearer(&mapping.auth_token),
            Err(SigningError::InvalidCredential(_))
        ));
    }

    #[test]
    fn test_purge_drops_revoked_and_expired() {
        let (issuer, clock) = issuer();
        let collection = CollectionId::new();
        let kept = SignerId::new();
        let revoked = SignerId::new();
        issuer.issue(collection, kept, None).unwrap();
        issuer.issue(collection, revoked, None).unwrap();
        issuer
            .issue(CollectionId::new(), SignerId::new(), Some(clock.now() + Duration::minutes(5)))
            .unwrap();
        issuer.revoke(collection, revoked).unwrap();

        clock.advance(Duration::hours(1));

        assert_eq!(issuer.purge_expired(clock.now()).unwrap(), 2);
        assert!(issuer.mapping(collection, kept).is_some());
    }

    #[test]
    fn test_extract_bearer_token() {
        assert_eq!(
            extract_bearer_token(Some("Bearer abc123")),
            Some("abc123".to_string())
        );
        assert_eq!(extract_bearer_token(Some("abc123")), None);
        assert_eq!(extract_bearer_token(Some("Bearer ")), None);
        assert_eq!(extract_bearer_token(None), None);
    }

    #[test]
    fn test_jwt_format() {
        let claims = BearerClaims {
            sub: "s".to_string(),
            collection: "c".to_string(),
            iat: 1,
            exp: 2,
        };
        let token = encode_jwt(&claims, TEST_SECRET).unwrap();

        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 3);

        let header_bytes = URL_SAFE_NO_PAD.decode(parts[0]).unwrap();
        let header: JwtHeader = serde_json::from_slice(&header_bytes).unwrap();
        assert_eq!(header.alg, "HS256");
        assert_eq!(header.typ, "JWT");

        let back: BearerClaims = decode_jwt(&token, TEST_SECRET).unwrap();
        assert_eq!(back, claims);
    }
}
