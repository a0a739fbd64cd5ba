//! Statement verification
//!
//! A signed statement moves through
//! `Unchecked -> SignatureChecked -> TrustChecked -> Accepted | Rejected`.
//! Each step must pass before the next runs, and any failure rejects the
//! statement; there is no partial acceptance.

use crate::trust::engine::SignatureEngine;
use crate::trust::error::{CotError, CotResult, ErrorKind};
use crate::trust::hasher::{hash_file, parse_digest, DEFAULT_HASH_CONCURRENCY};
use crate::trust::keys::{normalize_fingerprint, KeyHierarchy};
use crate::trust::manifest::CotStatement;
use crate::trust::signer::{SignatureFormat, SignedStatement};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::path::{Component, Path};
use std::sync::Arc;
use tracing::{debug, info};

/// Progress of a statement through verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerificationState {
    Unchecked,
    SignatureChecked,
    TrustChecked,
    Accepted,
    Rejected,
}

/// Outcome of verifying one statement
#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub source: String,
    pub accepted: bool,
    /// `Accepted` or `Rejected`
    pub state: VerificationState,
    /// Last step that passed before the verdict
    pub reached: VerificationState,
    pub reason: Option<ErrorKind>,
    pub detail: Option<String>,
    pub signer_key_id: Option<String>,
    #[serde(skip)]
    pub statement: Option<CotStatement>,
    pub checked_at: DateTime<Utc>,
}

/// Checks signed statements against the key hierarchy and the artifacts on disk
pub struct Verifier {
    hierarchy: Arc<KeyHierarchy>,
    engine: Arc<dyn SignatureEngine>,
    concurrency: usize,
}

impl Verifier {
    pub fn new(hierarchy: Arc<KeyHierarchy>, engine: Arc<dyn SignatureEngine>) -> Self {
        Verifier {
            hierarchy,
            engine,
            concurrency: DEFAULT_HASH_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Verify `signed` against the artifacts under `artifact_root`
    ///
    /// Returns the accepted statement, or the error that rejected it.
    pub async fn verify_signed(
        &self,
        signed: &SignedStatement,
        artifact_root: &Path,
    ) -> CotResult<CotStatement> {
        let mut progress = Progress::new();
        self.run(signed, artifact_root, &mut progress)
            .await
            .map(|(statement, _)| statement)
    }

    /// Parse a signed file's text and verify it
    pub async fn verify_text(
        &self,
        source_name: &str,
        text: &str,
        artifact_root: &Path,
    ) -> VerificationReport {
        match SignedStatement::parse(source_name, text) {
            Ok(signed) => self.verify(source_name, &signed, artifact_root).await,
            Err(e) => rejected(source_name, VerificationState::Unchecked, &e, None),
        }
    }

    /// Verify and summarize as a report; never fails
    pub async fn verify(
        &self,
        source_name: &str,
        signed: &SignedStatement,
        artifact_root: &Path,
    ) -> VerificationReport {
        let mut progress = Progress::new();
        match self.run(signed, artifact_root, &mut progress).await {
            Ok((statement, signer)) => VerificationReport {
                source: source_name.to_string(),
                accepted: true,
                state: VerificationState::Accepted,
                reached: progress.state,
                reason: None,
                detail: None,
                signer_key_id: Some(signer),
                statement: Some(statement),
                checked_at: Utc::now(),
            },
            Err(e) => rejected(
                source_name,
                progress.state,
                &e,
                progress.signer.or_else(|| signed.signer_key_id.clone()),
            ),
        }
    }

    async fn run(
        &self,
        signed: &SignedStatement,
        artifact_root: &Path,
        progress: &mut Progress,
    ) -> CotResult<(CotStatement, String)> {
        let result = self.check(signed, artifact_root, progress).await;
        if let Err(e) = &result {
            e.log_if_security_critical();
        }
        result
    }

    async fn check(
        &self,
        signed: &SignedStatement,
        artifact_root: &Path,
        progress: &mut Progress,
    ) -> CotResult<(CotStatement, String)> {
        let source = signed.task_id.as_str();
        if signed.signature.trim().is_empty() {
            return Err(CotError::MissingSignature {
                source_name: source.to_string(),
            });
        }

        // Signature
        let outcome = self.engine.verify(signed).await?;
        if !outcome.valid {
            return Err(CotError::InvalidSignature {
                source_name: source.to_string(),
                message: outcome.detail,
            });
        }
        let signer = outcome
            .signer_key_id
            .as_deref()
            .map(normalize_fingerprint)
            .ok_or_else(|| CotError::InvalidSignature {
                source_name: source.to_string(),
                message: "engine did not report a signing key".to_string(),
            })?;
        if signed.format == SignatureFormat::Cleartext {
            let verified = outcome.signed_text.as_deref().unwrap_or_default();
            if verified.trim_end_matches(['\r', '\n']) != signed.payload {
                return Err(CotError::InvalidSignature {
                    source_name: source.to_string(),
                    message: "signed text differs from the parsed payload".to_string(),
                });
            }
        }
        progress.state = VerificationState::SignatureChecked;
        progress.signer = Some(signer.clone());
        debug!("{}: signature by {} ({})", source, signer, outcome.detail);

        // Well-formedness and trust
        let statement = CotStatement::from_canonical(&signed.payload)?;
        let worker_type = statement
            .worker_type()
            .ok_or_else(|| CotError::malformed(format!("task {} has no workerType", statement.task_id)))?
            .to_string();
        let role = self.hierarchy.role_for_worker_type(&worker_type);
        statement.validate(role)?;

        let expected = match self.hierarchy.resolve_signing_key(&worker_type) {
            Ok(fpr) => fpr,
            Err(CotError::SigningKeyUnavailable { key, message }) => {
                return Err(CotError::UntrustedKey {
                    fingerprint: signer,
                    worker_type,
                    message: format!("configured key '{key}' is unusable: {message}"),
                });
            }
            Err(e) => return Err(e),
        };
        if signer != normalize_fingerprint(&expected) {
            return Err(CotError::UntrustedKey {
                fingerprint: signer,
                worker_type,
                message: format!("this worker type signs with {expected}"),
            });
        }
        if !self.hierarchy.is_authorized_for(&signer, role) {
            return Err(CotError::UntrustedKey {
                fingerprint: signer,
                worker_type,
                message: format!("no delegation path from a root authorizing role {role}"),
            });
        }
        progress.state = VerificationState::TrustChecked;
        debug!("{}: {} is trusted for {}", statement.task_id, signer, role);

        // Digests
        self.check_artifacts(&statement, artifact_root).await?;

        info!(
            "Accepted statement for task {} ({} artifacts, signer {})",
            statement.task_id,
            statement.artifacts.len(),
            signer
        );
        Ok((statement, signer))
    }

    async fn check_artifacts(&self, statement: &CotStatement, root: &Path) -> CotResult<()> {
        for artifact in &statement.artifacts {
            let relative = Path::new(&artifact.name);
            if !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
            {
                return Err(CotError::malformed(format!(
                    "artifact name '{}' escapes the artifact directory",
                    artifact.name
                )));
            }
        }

        // `buffered` keeps statement order, so the first reported failure is
        // the first artifact by name.
        let results: Vec<CotResult<()>> = stream::iter(&statement.artifacts)
            .map(|artifact| async move {
                let (algorithm, _) = parse_digest(&artifact.digest).ok_or_else(|| {
                    CotError::malformed(format!("bad digest for '{}'", artifact.name))
                })?;
                let actual = hash_file(&artifact.name, &root.join(&artifact.name), algorithm).await?;
                if actual != artifact.digest {
                    return Err(CotError::HashMismatch {
                        task_id: statement.task_id.clone(),
                        name: artifact.name.clone(),
                        expected: artifact.digest.clone(),
                        actual,
                    });
                }
                Ok(())
            })
            .buffered(self.concurrency)
            .collect()
            .await;
        results.into_iter().collect()
    }
}

/// Last state reached and the signer recovered so far
struct Progress {
    state: VerificationState,
    signer: Option<String>,
}

impl Progress {
    fn new() -> Self {
        Progress {
            state: VerificationState::Unchecked,
            signer: None,
        }
    }
}

fn rejected(
    source: &str,
    reached: VerificationState,
    error: &CotError,
    signer_key_id: Option<String>,
) -> VerificationReport {
    VerificationReport {
        source: source.to_string(),
        accepted: false,
        state: VerificationState::Rejected,
        reached,
        reason: Some(error.kind()),
        detail: Some(error.to_string()),
        signer_key_id,
        statement: None,
        checked_at: Utc::now(),
    }
}
