//! API key checks for protected entry points

use crate::config::ApiKey;
use crate::error::{Result, SigningError};
use subtle::{Choice, ConstantTimeEq};

#[derive(Debug, Clone, Default)]
pub struct ApiCredentials {
    keys: Vec<ApiKey>,
}

impl ApiCredentials {
    pub fn new(keys: Vec<ApiKey>) -> Self {
        Self { keys }
    }

    /// Accept `key`/`secret` if it matches any configured pair.
    ///
    /// Every configured pair is compared so the time taken does not
    /// depend on which one (if any) matched.
    pub fn authorize(&self, key: &str, secret: &str) -> Result<()> {
        let mut matched = Choice::from(0u8);
        for candidate in &self.keys {
            let key_eq = candidate.key.as_bytes().ct_eq(key.as_bytes());
            let secret_eq = candidate.secret.as_bytes().ct_eq(secret.as_bytes());
            matched |= key_eq & secret_eq;
        }

        if bool::from(matched) {
            Ok(())
        } else {
            tracing::warn!("Rejected API credential for key {}", key);
            Err(SigningError::InvalidCredential(
                "unknown API key or secret".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> ApiCredentials {
        ApiCredentials::new(vec![
            ApiKey {
                key: "alpha".to_string(),
                secret: "s3cret".to_string(),
            },
            ApiKey {
                key: "beta".to_string(),
                secret: "other".to_string(),
            },
        ])
    }

    #[test]
    fn test_matching_pair_is_accepted() {
        assert!(credentials().authorize("alpha", "s3cret").is_ok());
        assert!(credentials().authorize("beta", "other").is_ok());
    }

    #[test]
    fn test_mixed_pair_is_rejected() {
        assert!(matches!(
            credentials().authorize("alpha", "other"),
            Err(SigningError::InvalidCredential(_))
        ));
        assert!(credentials().authorize("alpha", "s3cre").is_err());
    }

    #[test]
    fn test_no_keys_rejects_everything() {
        assert!(ApiCredentials::default().authorize("", "").is_err());
    }
}
