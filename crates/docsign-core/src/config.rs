//! Engine configuration
//!
//! Every section has a `Default`; [`EngineConfig::from_env`] overrides
//! individual values from `DOCSIGN_*` variables and keeps the default for
//! anything unset or unparsable.

use shared_crypto::IssuerSettings;
use shared_types::OtpMode;
use std::path::PathBuf;
use std::str::FromStr;

/// One-time code policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtpSettings {
    /// Digits in a generated code
    pub code_length: usize,
    pub expiry_minutes: i64,
    /// Wrong answers allowed before the challenge is invalidated
    pub max_attempts: u32,
    pub default_mode: OtpMode,
}

impl Default for OtpSettings {
    fn default() -> Self {
        Self {
            code_length: 6,
            expiry_minutes: 10,
            max_attempts: 3,
            default_mode: OtpMode::CodeRequired,
        }
    }
}

/// When a collection counts as complete
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionPolicy {
    /// Let independent signers continue after another signer's link expired
    pub allow_partial_completion: bool,
    /// Reach `Signed` when only optional signers declined
    pub complete_with_declined_optional_signers: bool,
}

/// Signer token lifetimes and the bearer signing secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSettings {
    pub jwt_secret: String,
    pub bearer_ttl_hours: i64,
    /// Lifetime of the link token when the signer has no link expiration
    pub session_ttl_hours: i64,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            jwt_secret: "docsign-development-secret".to_string(),
            bearer_ttl_hours: 24,
            session_ttl_hours: 72,
        }
    }
}

/// Key generation and signature container sizing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoSettings {
    pub rsa_bits: usize,
    pub validity_years: u32,
    pub pbkdf2_iterations: u32,
    /// Bytes reserved in `/Contents` for each signature
    pub contents_capacity: usize,
    /// Protects key stores provisioned for signers
    pub key_store_password: String,
}

impl Default for CryptoSettings {
    fn default() -> Self {
        let issuer = IssuerSettings::default();
        Self {
            rsa_bits: issuer.rsa_bits,
            validity_years: issuer.validity_years,
            pbkdf2_iterations: issuer.pbkdf2_iterations,
            contents_capacity: shared_pdf::DEFAULT_CONTENTS_CAPACITY,
            key_store_password: "docsign-key-store".to_string(),
        }
    }
}

impl CryptoSettings {
    pub fn issuer_settings(&self) -> IssuerSettings {
        IssuerSettings {
            rsa_bits: self.rsa_bits,
            validity_years: self.validity_years,
            pbkdf2_iterations: self.pbkdf2_iterations,
        }
    }
}

/// A key/secret pair allowed to call protected operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKey {
    pub key: String,
    pub secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub otp: OtpSettings,
    pub completion: CompletionPolicy,
    pub tokens: TokenSettings,
    pub crypto: CryptoSettings,
    /// Parent directory of per-operation scratch space
    pub scratch_root: PathBuf,
    pub api_keys: Vec<ApiKey>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            otp: OtpSettings::default(),
            completion: CompletionPolicy::default(),
            tokens: TokenSettings::default(),
            crypto: CryptoSettings::default(),
            scratch_root: std::env::temp_dir().join("docsign-scratch"),
            api_keys: Vec::new(),
        }
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn flag_or(value: Option<String>, default: bool) -> bool {
    value
        .map(|v| matches!(v.trim(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn otp_mode_or(value: Option<String>, default: OtpMode) -> OtpMode {
    match value.as_deref().map(str::trim) {
        Some("code") => OtpMode::CodeRequired,
        Some("password") => OtpMode::PasswordRequired,
        Some("both") => OtpMode::Both,
        _ => default,
    }
}

/// `key:secret` pairs separated by commas
fn parse_api_keys(value: &str) -> Vec<ApiKey> {
    value
        .split(',')
        .filter_map(|pair| pair.trim().split_once(':'))
        .filter(|(key, secret)| !key.is_empty() && !secret.is_empty())
        .map(|(key, secret)| ApiKey {
            key: key.to_string(),
            secret: secret.to_string(),
        })
        .collect()
}

impl EngineConfig {
    /// Load from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from any variable source, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |name: &str| lookup(&format!("DOCSIGN_{}", name));

        Self {
            otp: OtpSettings {
                code_length: parse_or(var("OTP_LENGTH"), defaults.otp.code_length).clamp(4, 12),
                expiry_minutes: parse_or(var("OTP_EXPIRY_MINUTES"), defaults.otp.expiry_minutes),
                max_attempts: parse_or(var("OTP_MAX_ATTEMPTS"), defaults.otp.max_attempts).max(1),
                default_mode: otp_mode_or(var("OTP_MODE"), defaults.otp.default_mode),
            },
            completion: CompletionPolicy {
                allow_partial_completion: flag_or(
                    var("ALLOW_PARTIAL_COMPLETION"),
                    defaults.completion.allow_partial_completion,
                ),
                complete_with_declined_optional_signers: flag_or(
                    var("COMPLETE_WITH_DECLINED_OPTIONAL"),
                    defaults.completion.complete_with_declined_optional_signers,
                ),
            },
            tokens: TokenSettings {
                jwt_secret: var("JWT_SECRET").unwrap_or(defaults.tokens.jwt_secret),
                bearer_ttl_hours: parse_or(var("BEARER_TTL_HOURS"), defaults.tokens.bearer_ttl_hours),
                session_ttl_hours: parse_or(
                    var("SESSION_TTL_HOURS"),
                    defaults.tokens.session_ttl_hours,
                ),
            },
            crypto: CryptoSettings {
                rsa_bits: parse_or(var("RSA_BITS"), defaults.crypto.rsa_bits),
                validity_years: parse_or(var("CERT_VALIDITY_YEARS"), defaults.crypto.validity_years),
                pbkdf2_iterations: parse_or(
                    var("PBKDF2_ITERATIONS"),
                    defaults.crypto.pbkdf2_iterations,
                ),
                contents_capacity: parse_or(
                    var("CONTENTS_CAPACITY"),
                    defaults.crypto.contents_capacity,
                ),
                key_store_password: var("KEY_STORE_PASSWORD")
                    .unwrap_or(defaults.crypto.key_store_password),
            },
            scratch_root: var("SCRATCH_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.scratch_root),
            api_keys: var("API_KEYS")
                .map(|v| parse_api_keys(&v))
                .unwrap_or(defaults.api_keys),
        }
    }
}
