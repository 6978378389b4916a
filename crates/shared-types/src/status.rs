//! Closed state and mode types for collections, signers and signatures.
//!
//! Every lifecycle is a tagged enum with its transition table encoded in a
//! `can_transition_to` method, so callers match exhaustively instead of
//! comparing loose strings.

use serde::{Deserialize, Serialize};

/// Lifecycle of a document collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionStatus {
    Created,
    Distributing,
    PartiallySigned,
    Signed,
    Declined,
    Canceled,
}

impl CollectionStatus {
    /// Signed, declined and canceled collections never change again
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Signed | Self::Declined | Self::Canceled)
    }

    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(self, next: CollectionStatus) -> bool {
        use CollectionStatus::*;
        match (self, next) {
            (from, Canceled) => !from.is_terminal(),
            (Created, Distributing) => true,
            (Distributing, PartiallySigned | Signed | Declined) => true,
            (PartiallySigned, Signed | Declined) => true,
            _ => false,
        }
    }
}

/// Why a signer ended up declined
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeclineReason {
    /// The signer refused, optionally with a comment
    ByUser { comment: Option<String> },
    /// The signing link expired before the signer finished
    Expired,
}

/// Lifecycle of one signer inside a collection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SignerStatus {
    Pending,
    Sent,
    Viewed,
    Authenticating,
    Signing,
    Signed,
    Declined { reason: DeclineReason },
}

impl SignerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Signed | Self::Declined { .. })
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, Self::Signed)
    }

    pub fn is_declined(&self) -> bool {
        matches!(self, Self::Declined { .. })
    }

    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(&self, next: &SignerStatus) -> bool {
        use SignerStatus::*;
        match (self, next) {
            (Pending, Sent) => true,
            (Sent, Viewed) => true,
            (Viewed, Authenticating | Signing) => true,
            (Authenticating, Signing) => true,
            (Signing, Signed) => true,
            (Sent | Viewed | Authenticating | Signing, Declined { .. }) => true,
            _ => false,
        }
    }

    /// Short label used in logs and history entries
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Viewed => "viewed",
            Self::Authenticating => "authenticating",
            Self::Signing => "signing",
            Self::Signed => "signed",
            Self::Declined { .. } => "declined",
        }
    }
}

/// What a one-time challenge asks the signer for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpMode {
    CodeRequired,
    PasswordRequired,
    Both,
}

impl OtpMode {
    pub fn requires_code(self) -> bool {
        matches!(self, Self::CodeRequired | Self::Both)
    }

    pub fn requires_password(self) -> bool {
        matches!(self, Self::PasswordRequired | Self::Both)
    }
}

/// How a signer must prove their identity before signing
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AuthMode {
    /// No identification step
    None,
    /// One-time code and/or password
    Otp { otp_mode: OtpMode },
    /// Assertion from a third-party identity provider
    ExternalIdentity { provider: String },
}

impl AuthMode {
    /// Whether the signer passes through `Authenticating`
    pub fn requires_authentication(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// State of a signer's identification challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeState {
    #[default]
    Idle,
    Challenged,
    Verified,
    Expired,
    AttemptsExceeded,
}

/// Progress of a suspended remote flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStep {
    InProgress,
    Success,
}

/// Per-field position in the split-signature cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSigningStep {
    #[default]
    Pending,
    Prepared,
    Hashed,
    AwaitingExternalSignature,
    Assembled,
    Verified,
}

impl FieldSigningStep {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Verified)
    }
}

/// Channel used to deliver the signing link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendingMethod {
    Sms,
    Email,
    Tablet,
}

/// Whether signers are invited all at once or one after another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningOrder {
    #[default]
    Parallel,
    Sequential,
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn signer_status_strategy() -> impl Strategy<Value = SignerStatus> {
        prop_oneof![
            Just(SignerStatus::Pending),
            Just(SignerStatus::Sent),
            Just(SignerStatus::Viewed),
            Just(SignerStatus::Authenticating),
            Just(SignerStatus::Signing),
            Just(SignerStatus::Signed),
            Just(SignerStatus::Declined {
                reason: DeclineReason::Expired
            }),
        ]
    }

    fn collection_status_strategy() -> impl Strategy<Value = CollectionStatus> {
        prop_oneof![
            Just(CollectionStatus::Created),
            Just(CollectionStatus::Distributing),
            Just(CollectionStatus::PartiallySigned),
            Just(CollectionStatus::Signed),
            Just(CollectionStatus::Declined),
            Just(CollectionStatus::Canceled),
        ]
    }

    proptest! {
        /// Property: terminal signer states have no successors
        #[test]
        fn terminal_signer_states_are_final(
            from in signer_status_strategy(),
            to in signer_status_strategy(),
        ) {
            if from.is_terminal() {
                prop_assert!(!from.can_transition_to(&to));
            }
        }

        /// Property: Signed is only entered from Signing
        #[test]
        fn signed_only_from_signing(from in signer_status_strategy()) {
            if from.can_transition_to(&SignerStatus::Signed) {
                prop_assert_eq!(from, SignerStatus::Signing);
            }
        }

        /// Property: terminal collection states have no successors
        #[test]
        fn terminal_collection_states_are_final(
            from in collection_status_strategy(),
            to in collection_status_strategy(),
        ) {
            if from.is_terminal() {
                prop_assert!(!from.can_transition_to(to));
            }
        }
    }
}
