//! Signing statements with the key bound to their worker type
//!
//! A signed file holds exactly one statement in one of two layouts:
//!
//! - detached: the canonical payload, a newline, then an armored
//!   `-----BEGIN PGP SIGNATURE-----` block
//! - cleartext: an OpenPGP cleartext-signed message wrapping the payload
//!
//! Files are named `<taskId>.asc`, one per task.

use crate::trust::engine::SignatureEngine;
use crate::trust::error::{CotError, CotResult};
use crate::trust::keys::{normalize_fingerprint, KeyHierarchy};
use crate::trust::manifest::CotStatement;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

pub const SIGNED_MESSAGE_BEGIN: &str = "-----BEGIN PGP SIGNED MESSAGE-----";
pub const SIGNATURE_BEGIN: &str = "-----BEGIN PGP SIGNATURE-----";
pub const SIGNATURE_END: &str = "-----END PGP SIGNATURE-----";

/// Extension of signed statement files
pub const SIGNED_FILE_EXTENSION: &str = "asc";

/// Layout of a signed statement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureFormat {
    #[default]
    Detached,
    Cleartext,
}

impl SignatureFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureFormat::Detached => "detached",
            SignatureFormat::Cleartext => "cleartext",
        }
    }
}

impl fmt::Display for SignatureFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignatureFormat {
    type Err = CotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "detached" => Ok(SignatureFormat::Detached),
            "cleartext" | "clearsign" => Ok(SignatureFormat::Cleartext),
            other => Err(CotError::Config {
                message: format!("unknown signature format '{other}'"),
            }),
        }
    }
}

/// A statement payload together with its signature
///
/// For `Detached`, `signature` is the armored signature block. For
/// `Cleartext`, it is the whole cleartext-signed message, which embeds the
/// payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedStatement {
    pub task_id: String,
    pub payload: String,
    pub signature: String,
    /// Known after signing; filled in by verification for parsed files
    pub signer_key_id: Option<String>,
    pub format: SignatureFormat,
}

impl SignedStatement {
    /// Read a signed file back into payload and signature
    pub fn parse(source_name: &str, text: &str) -> CotResult<Self> {
        let missing = || CotError::MissingSignature {
            source_name: source_name.to_string(),
        };

        let (payload, signature, format) = if text.trim_start().starts_with(SIGNED_MESSAGE_BEGIN)
        {
            let signature = text.trim().to_string();
            let payload = cleartext_body(&signature).ok_or_else(missing)?;
            (payload, signature, SignatureFormat::Cleartext)
        } else {
            let start = find_line(text, SIGNATURE_BEGIN).ok_or_else(missing)?;
            let block = &text[start..];
            let end = block.find(SIGNATURE_END).ok_or_else(missing)?;
            let signature = format!("{}\n", &block[..end + SIGNATURE_END.len()]);
            let payload = text[..start]
                .strip_suffix('\n')
                .unwrap_or(&text[..start])
                .to_string();
            (payload, signature, SignatureFormat::Detached)
        };

        Ok(SignedStatement {
            task_id: peek_task_id(&payload).unwrap_or_default(),
            payload,
            signature,
            signer_key_id: None,
            format,
        })
    }

    /// File contents for this statement
    pub fn render(&self) -> String {
        match self.format {
            SignatureFormat::Detached => {
                let mut out = format!("{}\n{}", self.payload, self.signature);
                if !out.ends_with('\n') {
                    out.push('\n');
                }
                out
            }
            SignatureFormat::Cleartext => {
                let mut out = self.signature.clone();
                if !out.ends_with('\n') {
                    out.push('\n');
                }
                out
            }
        }
    }
}

/// Escape lines starting with '-' as cleartext signing requires
pub fn dash_escape(text: &str) -> String {
    text.split('\n')
        .map(|line| {
            if line.starts_with('-') {
                format!("- {line}")
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn dash_unescape(line: &str) -> &str {
    line.strip_prefix("- ").unwrap_or(line)
}

// Byte offset of the first line equal to `marker`
fn find_line(text: &str, marker: &str) -> Option<usize> {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if line.trim_end_matches(['\r', '\n']) == marker {
            return Some(offset);
        }
        offset += line.len();
    }
    None
}

// Signed text of a cleartext message: armor headers skipped, dash-escaping
// undone, the line break before the signature block excluded.
fn cleartext_body(message: &str) -> Option<String> {
    let mut lines = message.lines().map(|l| l.trim_end_matches('\r'));
    if lines.next()? != SIGNED_MESSAGE_BEGIN {
        return None;
    }
    // Armor headers ("Hash: SHA256") end at the first empty line.
    for line in lines.by_ref() {
        if line.is_empty() {
            break;
        }
    }

    let mut body = Vec::new();
    let mut signed = false;
    for line in lines.by_ref() {
        if line == SIGNATURE_BEGIN {
            signed = true;
            break;
        }
        body.push(dash_unescape(line));
    }
    if !signed || !lines.any(|l| l == SIGNATURE_END) {
        return None;
    }
    Some(body.join("\n"))
}

fn peek_task_id(payload: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    value.get("taskId")?.as_str().map(str::to_string)
}

/// Task ids become file names; only slug characters are allowed
fn check_task_id(task_id: &str) -> CotResult<()> {
    let valid = !task_id.is_empty()
        && task_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(CotError::malformed(format!(
            "task id '{task_id}' is not usable as a file name"
        )))
    }
}

/// Path of the signed statement for `task_id` inside `dir`
pub fn statement_path(dir: &Path, task_id: &str) -> PathBuf {
    dir.join(format!("{task_id}.{SIGNED_FILE_EXTENSION}"))
}

/// Signs statements with the key the hierarchy binds to their worker type
pub struct Signer {
    hierarchy: Arc<KeyHierarchy>,
    engine: Arc<dyn SignatureEngine>,
}

impl Signer {
    pub fn new(hierarchy: Arc<KeyHierarchy>, engine: Arc<dyn SignatureEngine>) -> Self {
        Signer { hierarchy, engine }
    }

    /// Sign the canonical form of `statement`
    ///
    /// `worker_type` must be the statement's own worker type; the key is the
    /// one configured for it, with no fallback.
    pub async fn sign(
        &self,
        statement: &CotStatement,
        worker_type: &str,
        format: SignatureFormat,
    ) -> CotResult<SignedStatement> {
        check_task_id(&statement.task_id)?;
        if statement.worker_type() != Some(worker_type) {
            return Err(CotError::malformed(format!(
                "task {} has worker type {:?}, refusing to sign it as '{}'",
                statement.task_id,
                statement.worker_type(),
                worker_type
            )));
        }

        let key = self.hierarchy.resolve_signing_key(worker_type)?;
        let payload = statement.canonical_text()?;
        debug!(
            "Signing {} ({} bytes) with {} via {} ({})",
            statement.task_id,
            payload.len(),
            key,
            self.engine.name(),
            format
        );
        let signature = self.engine.sign(payload.as_bytes(), &key, format).await?;

        Ok(SignedStatement {
            task_id: statement.task_id.clone(),
            payload,
            signature,
            signer_key_id: Some(normalize_fingerprint(&key)),
            format,
        })
    }

    /// Persist a signed statement as `<dir>/<taskId>.asc`
    ///
    /// The file is written to a temporary name first and renamed into place.
    pub fn write(&self, signed: &SignedStatement, dir: &Path) -> CotResult<PathBuf> {
        check_task_id(&signed.task_id)?;
        std::fs::create_dir_all(dir).map_err(|e| CotError::io(dir, e))?;

        let path = statement_path(dir, &signed.task_id);
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| CotError::io(dir, e))?;
        tmp.write_all(signed.render().as_bytes())
            .map_err(|e| CotError::io(tmp.path(), e))?;
        tmp.persist(&path)
            .map_err(|e| CotError::io(&path, e.error))?;

        info!("Wrote signed statement {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::engine::mock::MockEngine;
    use crate::trust::keys::{KeyEntry, KeyRole, TrustLevel, TrustStore, WorkerRole};
    use crate::trust::manifest::{StatementExtra, TaskDefinition};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::{BTreeMap, BTreeSet};
    use tempfile::TempDir;

    const DECISION_FPR: &str = "AAAA1111";

    fn hierarchy() -> Arc<KeyHierarchy> {
        let store = TrustStore::new(
            vec![KeyEntry {
                fingerprint: DECISION_FPR.to_string(),
                identities: vec!["decision1@example.com".to_string()],
                role: KeyRole::Root,
                trust: TrustLevel::Full,
                authorizes: BTreeSet::from([WorkerRole::Decision]),
            }],
            vec![],
        )
        .unwrap();
        let worker_keys = BTreeMap::from([("gecko-decision".to_string(), "decision1".to_string())]);
        Arc::new(KeyHierarchy::new(Arc::new(store), worker_keys, BTreeMap::new()))
    }

    fn statement() -> CotStatement {
        CotStatement {
            task_id: "DecisionTask01".to_string(),
            run_id: 0,
            worker_group: "us-west-2".to_string(),
            worker_id: "i-1234".to_string(),
            task: TaskDefinition(json!({"workerType": "gecko-decision"})),
            artifacts: vec![],
            extra: StatementExtra::default(),
        }
    }

    fn signer(keys: &[&str]) -> Signer {
        Signer::new(hierarchy(), Arc::new(MockEngine::new(keys)))
    }

    #[tokio::test]
    async fn test_sign_uses_configured_key() {
        let signed = signer(&[DECISION_FPR])
            .sign(&statement(), "gecko-decision", SignatureFormat::Detached)
            .await
            .unwrap();
        assert_eq!(signed.signer_key_id.as_deref(), Some(DECISION_FPR));
        assert_eq!(signed.payload, statement().canonical_text().unwrap());
        assert!(signed.signature.starts_with(SIGNATURE_BEGIN));
    }

    #[tokio::test]
    async fn test_sign_without_secret_key_fails() {
        let result = signer(&[])
            .sign(&statement(), "gecko-decision", SignatureFormat::Detached)
            .await;
        assert!(matches!(result, Err(CotError::SigningKeyUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_sign_rejects_mismatched_worker_type() {
        let result = signer(&[DECISION_FPR])
            .sign(&statement(), "opt-linux64", SignatureFormat::Detached)
            .await;
        assert!(matches!(result, Err(CotError::MalformedStatement { .. })));
    }

    #[tokio::test]
    async fn test_detached_file_round_trip() {
        let signer = signer(&[DECISION_FPR]);
        let signed = signer
            .sign(&statement(), "gecko-decision", SignatureFormat::Detached)
            .await
            .unwrap();

        let dir = TempDir::new().unwrap();
        let path = signer.write(&signed, dir.path()).unwrap();
        assert_eq!(path, dir.path().join("DecisionTask01.asc"));

        let text = std::fs::read_to_string(&path).unwrap();
        let parsed = SignedStatement::parse("DecisionTask01.asc", &text).unwrap();
        assert_eq!(parsed.payload, signed.payload);
        assert_eq!(parsed.signature, signed.signature);
        assert_eq!(parsed.task_id, "DecisionTask01");
        assert_eq!(parsed.format, SignatureFormat::Detached);
    }

    #[tokio::test]
    async fn test_cleartext_file_round_trip() {
        let signed = signer(&[DECISION_FPR])
            .sign(&statement(), "gecko-decision", SignatureFormat::Cleartext)
            .await
            .unwrap();
        let parsed = SignedStatement::parse("x.asc", &signed.render()).unwrap();
        assert_eq!(parsed.payload, signed.payload);
        assert_eq!(parsed.format, SignatureFormat::Cleartext);
    }

    #[test]
    fn test_cleartext_dash_unescaping() {
        let message = format!(
            "{SIGNED_MESSAGE_BEGIN}\nHash: SHA256\n\nfirst\n- -leading dash\nlast\n{SIGNATURE_BEGIN}\n\nabc\n{SIGNATURE_END}\n"
        );
        let parsed = SignedStatement::parse("m.asc", &message).unwrap();
        assert_eq!(parsed.payload, "first\n-leading dash\nlast");
        assert_eq!(dash_escape(&parsed.payload), "first\n- -leading dash\nlast");
    }

    #[test]
    fn test_unsigned_text_is_missing_signature() {
        let result = SignedStatement::parse("plain.json", "{\n  \"taskId\": \"x\"\n}");
        assert!(matches!(result, Err(CotError::MissingSignature { .. })));

        let truncated = format!("{{}}\n{SIGNATURE_BEGIN}\n\nabc\n");
        let result = SignedStatement::parse("cut.asc", &truncated);
        assert!(matches!(result, Err(CotError::MissingSignature { .. })));
    }

    #[test]
    fn test_write_rejects_path_like_task_ids() {
        let signed = SignedStatement {
            task_id: "../escape".to_string(),
            payload: "{}".to_string(),
            signature: String::new(),
            signer_key_id: None,
            format: SignatureFormat::Detached,
        };
        let dir = TempDir::new().unwrap();
        let result = signer(&[]).write(&signed, dir.path());
        assert!(matches!(result, Err(CotError::MalformedStatement { .. })));
    }

    #[test]
    fn test_signature_format_from_str() {
        assert_eq!("detached".parse::<SignatureFormat>().unwrap(), SignatureFormat::Detached);
        assert_eq!("CLEARTEXT".parse::<SignatureFormat>().unwrap(), SignatureFormat::Cleartext);
        assert!("pgp".parse::<SignatureFormat>().is_err());
    }
}
