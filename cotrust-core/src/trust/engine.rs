//! Signature engine trait - the narrow seam to the OpenPGP implementation
//!
//! The chain never does signature math itself. An engine signs bytes with a
//! named key and reports who signed a message. Implementations:
//! - GnuPG subprocess (`gpg` module)
//! - Mock (testing)

use crate::trust::error::CotResult;
use crate::trust::keys::TrustLevel;
use crate::trust::signer::{SignatureFormat, SignedStatement};
use async_trait::async_trait;

/// What the engine learned about a signature
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyOutcome {
    /// The signature checks out cryptographically
    pub valid: bool,

    /// Fingerprint of the signing (primary) key, when the engine could tell
    pub signer_key_id: Option<String>,

    /// The engine's own view of the signer's trust; informational only
    pub trust_level: TrustLevel,

    /// For cleartext messages: the text the engine actually verified
    pub signed_text: Option<String>,

    /// Human-readable engine detail for logs and errors
    pub detail: String,
}

impl VerifyOutcome {
    pub fn invalid(detail: impl Into<String>) -> Self {
        VerifyOutcome {
            valid: false,
            signer_key_id: None,
            trust_level: TrustLevel::None,
            signed_text: None,
            detail: detail.into(),
        }
    }
}

/// Trait for signing/verification engines
///
/// Implementations must not substitute a different key when `key_id` is
/// unavailable; they fail with `SigningKeyUnavailable` instead.
#[async_trait]
pub trait SignatureEngine: Send + Sync {
    /// Sign `payload` with `key_id`
    ///
    /// Returns the armored signature block for `Detached`, or the complete
    /// cleartext-signed message for `Cleartext`.
    async fn sign(&self, payload: &[u8], key_id: &str, format: SignatureFormat)
        -> CotResult<String>;

    /// Check a signed statement
    ///
    /// An invalid signature is reported through `VerifyOutcome::valid`;
    /// `Err` is reserved for failures of the engine itself.
    async fn verify(&self, statement: &SignedStatement) -> CotResult<VerifyOutcome>;

    /// Engine identifier for logging/debugging
    fn name(&self) -> &'static str;
}
