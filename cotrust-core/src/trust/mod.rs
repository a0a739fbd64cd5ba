//! Chain-of-trust core - statements, keys and verification
//!
//! Each task run is summarized in a canonical statement of its inputs and
//! artifact digests, signed with the key bound to its worker type.
//!
//! Design Principles:
//! - Keys are trusted by position in an explicit hierarchy, never by the engine's keyring alone
//! - Statements are signed and hashed only in canonical form
//! - Verification always recomputes artifact digests

pub mod docker;
pub mod engine;
pub mod error;
pub mod gpg;
pub mod hasher;
pub mod keys;
pub mod manifest;
pub mod signer;
pub mod verifier;

pub use engine::{SignatureEngine, VerifyOutcome};
pub use error::{CotError, CotResult, ErrorKind};
pub use gpg::GpgEngine;
pub use hasher::HashAlgorithm;
pub use keys::{KeyHierarchy, TrustLevel, TrustStore, WorkerRole};
pub use manifest::{CotStatement, ManifestBuilder};
pub use signer::{SignatureFormat, SignedStatement, Signer};
pub use verifier::{VerificationReport, VerificationState, Verifier};
