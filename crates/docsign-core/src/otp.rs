//! One-time code and external identity challenges
//!
//! A signer's challenge moves `Idle -> Challenged -> Verified | Expired |
//! AttemptsExceeded`. Expiry is evaluated lazily against the injected
//! clock on every call; nothing runs in the background.

use crate::collaborators::{Clock, IdentityProvider};
use crate::config::OtpSettings;
use crate::error::{Result, SigningError};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::Duration;
use rand::Rng;
use shared_types::{
    AuthMode, ChallengeState, CollectionId, ExternalIdentity, OtpDetails, OtpMode,
    SendingMethod, Signer,
};
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Hash a password using Argon2id
///
/// # Returns
/// The hash in PHC string format
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| SigningError::Storage(format!("Failed to hash password: {}", e)))
}

/// Verify a password against a PHC hash; malformed hashes never match
pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed_hash) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_ok(),
        Err(_) => false,
    }
}

fn generate_code(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

/// Where the code goes: phone for SMS, e-mail otherwise
fn delivery_means(signer: &Signer) -> Option<String> {
    let contact = &signer.contact;
    match signer.sending_method {
        SendingMethod::Sms => contact.phone.clone().or_else(|| contact.email.clone()),
        SendingMethod::Email | SendingMethod::Tablet => {
            contact.email.clone().or_else(|| contact.phone.clone())
        }
    }
}

pub struct OtpVerifier {
    settings: OtpSettings,
    clock: Arc<dyn Clock>,
}

impl OtpVerifier {
    pub fn new(settings: OtpSettings, clock: Arc<dyn Clock>) -> Self {
        Self { settings, clock }
    }

    pub fn settings(&self) -> &OtpSettings {
        &self.settings
    }

    /// Issue a fresh challenge, replacing any previous one.
    ///
    /// # Returns
    /// The stored challenge; `code` is `None` for password-only modes
    pub fn issue_challenge(&self, signer: &mut Signer) -> Result<OtpDetails> {
        let otp_mode = match signer.authentication.mode {
            AuthMode::Otp { otp_mode } => otp_mode,
            AuthMode::None | AuthMode::ExternalIdentity { .. } => {
                return Err(SigningError::InvalidTransition(format!(
                    "signer {} does not use one-time codes",
                    signer.id
                )))
            }
        };
        if signer.authentication.state == ChallengeState::Verified {
            return Err(SigningError::InvalidTransition(format!(
                "signer {} is already verified",
                signer.id
            )));
        }
        if otp_mode.requires_password() && signer.authentication.password_hash.is_none() {
            return Err(SigningError::InvalidCredential(format!(
                "no password configured for signer {}",
                signer.id
            )));
        }
        let means = delivery_means(signer).ok_or_else(|| {
            SigningError::InvalidTransition(format!("signer {} has no contact means", signer.id))
        })?;

        let now = self.clock.now();
        let details = OtpDetails {
            means,
            code: otp_mode
                .requires_code()
                .then(|| generate_code(self.settings.code_length)),
            attempts: 0,
            issued_at: now,
            expires_at: now + Duration::minutes(self.settings.expiry_minutes),
            mode: otp_mode,
        };

        signer.authentication.otp = Some(details.clone());
        signer.authentication.state = ChallengeState::Challenged;
        signer.identification_attempts = 0;

        tracing::info!(
            "Issued {:?} challenge for signer {} (expires {})",
            otp_mode,
            signer.id,
            details.expires_at
        );
        Ok(details)
    }

    /// Check a code and/or password against the signer's open challenge.
    ///
    /// # Errors
    /// * `Expired` - the challenge timed out or was already used
    /// * `InvalidCode` - wrong answer; the last allowed miss also closes the challenge
    /// * `AttemptsExceeded` - the challenge was closed by earlier misses
    pub fn verify(
        &self,
        signer: &mut Signer,
        code: Option<&str>,
        password: Option<&str>,
    ) -> Result<()> {
        let now = self.clock.now();
        let auth = &mut signer.authentication;

        match auth.state {
            ChallengeState::Challenged => {}
            ChallengeState::Verified | ChallengeState::Expired => {
                return Err(SigningError::Expired("challenge is no longer valid".to_string()))
            }
            ChallengeState::AttemptsExceeded => return Err(SigningError::AttemptsExceeded),
            ChallengeState::Idle => {
                return Err(SigningError::InvalidTransition(
                    "no challenge has been issued".to_string(),
                ))
            }
        }

        let otp = auth.otp.as_mut().ok_or_else(|| {
            SigningError::InvalidTransition("challenge has no details".to_string())
        })?;

        if otp.is_expired(now) {
            otp.code = None;
            auth.state = ChallengeState::Expired;
            tracing::warn!("Challenge for signer {} expired", signer.id);
            return Err(SigningError::Expired("one-time code expired".to_string()));
        }

        if check_answer(otp, auth.password_hash.as_deref(), code, password).passed() {
            otp.code = None;
            auth.state = ChallengeState::Verified;
            auth.verified_at = Some(now);
            tracing::info!("Signer {} verified", signer.id);
            return Ok(());
        }

        otp.attempts += 1;
        signer.identification_attempts = otp.attempts;
        if otp.attempts >= self.settings.max_attempts {
            otp.code = None;
            auth.state = ChallengeState::AttemptsExceeded;
            tracing::warn!(
                "Signer {} reached {} failed attempts",
                signer.id,
                otp.attempts
            );
        }
        Err(SigningError::InvalidCode)
    }

    /// Hand the signer to an external identity provider.
    ///
    /// # Returns
    /// Continuation URL for the provider's flow
    pub fn begin_external(
        &self,
        collection: CollectionId,
        signer: &mut Signer,
        provider: &dyn IdentityProvider,
    ) -> Result<String> {
        if !matches!(signer.authentication.mode, AuthMode::ExternalIdentity { .. }) {
            return Err(SigningError::InvalidTransition(format!(
                "signer {} does not use an identity provider",
                signer.id
            )));
        }
        if signer.authentication.state == ChallengeState::Verified {
            return Err(SigningError::InvalidTransition(format!(
                "signer {} is already verified",
                signer.id
            )));
        }

        let url = provider.begin(collection, signer.id)?;
        signer.authentication.state = ChallengeState::Challenged;
        signer.identification_attempts = 0;
        Ok(url)
    }

    /// Record the outcome of an assertion returned by the provider
    pub fn record_assertion(
        &self,
        signer: &mut Signer,
        provider: &dyn IdentityProvider,
        assertion: &str,
    ) -> Result<ExternalIdentity> {
        match signer.authentication.state {
            ChallengeState::Challenged => {}
            ChallengeState::AttemptsExceeded => return Err(SigningError::AttemptsExceeded),
            ChallengeState::Verified | ChallengeState::Expired => {
                return Err(SigningError::Expired("challenge is no longer valid".to_string()))
            }
            ChallengeState::Idle => {
                return Err(SigningError::InvalidTransition(
                    "identity hand-off was not started".to_string(),
                ))
            }
        }

        match provider.validate(assertion) {
            Ok(identity) => {
                let auth = &mut signer.authentication;
                auth.state = ChallengeState::Verified;
                auth.verified_at = Some(self.clock.now());
                auth.external_identity = Some(identity.clone());
                tracing::info!("Signer {} verified as {}", signer.id, identity.id);
                Ok(identity)
            }
            Err(e) => {
                signer.identification_attempts += 1;
                if signer.identification_attempts >= self.settings.max_attempts {
                    signer.authentication.state = ChallengeState::AttemptsExceeded;
                }
                tracing::warn!("Assertion rejected for signer {}: {}", signer.id, e);
                Err(SigningError::InvalidCredential(e.to_string()))
            }
        }
    }
}

/// Per-factor result of one verification; both factors are always checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AnswerCheck {
    code: bool,
    password: bool,
}

impl AnswerCheck {
    fn passed(self) -> bool {
        self.code & self.password
    }
}

fn check_answer(
    otp: &OtpDetails,
    password_hash: Option<&str>,
    code: Option<&str>,
    password: Option<&str>,
) -> AnswerCheck {
    let code = code_matches(otp, code);
    let password = password_matches(otp.mode, password_hash, password);
    AnswerCheck { code, password }
}

fn code_matches(otp: &OtpDetails, given: Option<&str>) -> bool {
    if !otp.mode.requires_code() {
        return true;
    }
    match (otp.code.as_deref(), given) {
        (Some(expected), Some(given)) => expected.as_bytes().ct_eq(given.trim().as_bytes()).into(),
        _ => false,
    }
}

fn password_matches(mode: OtpMode, hash: Option<&str>, given: Option<&str>) -> bool {
    if !mode.requires_password() {
        return true;
    }
    match (hash, given) {
        (Some(hash), Some(given)) => verify_password(given, hash),
        _ => false,
    }
}
