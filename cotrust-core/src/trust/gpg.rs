//! GnuPG subprocess engine
//!
//! Runs `gpg` in batch mode against an explicit home directory and reads
//! machine-readable `[GNUPG:]` status lines rather than human output.

use crate::trust::engine::{SignatureEngine, VerifyOutcome};
use crate::trust::error::{CotError, CotResult};
use crate::trust::keys::{normalize_fingerprint, TrustLevel};
use crate::trust::signer::{SignatureFormat, SignedStatement};
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace, warn};

const STATUS_PREFIX: &str = "[GNUPG:] ";

fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

/// Everything the status lines of one `gpg --verify` said
#[derive(Debug, Default, Clone, PartialEq)]
pub struct GpgStatus {
    pub good: bool,
    pub bad: bool,
    pub error: bool,
    /// Primary key fingerprint from `VALIDSIG`
    pub valid_fingerprint: Option<String>,
    pub trust: Option<TrustLevel>,
    pub missing_key: Option<String>,
    /// Expired or revoked signature/key
    pub expired_or_revoked: bool,
    pub no_data: bool,
}

impl GpgStatus {
    pub fn is_valid(&self) -> bool {
        self.good
            && !self.bad
            && !self.error
            && !self.expired_or_revoked
            && self.valid_fingerprint.is_some()
    }

    fn summary(&self) -> String {
        if let Some(key) = &self.missing_key {
            return format!("no public key for {key}");
        }
        if self.no_data {
            return "no signature data".to_string();
        }
        if self.bad {
            return "BADSIG".to_string();
        }
        if self.expired_or_revoked {
            return "signature or key expired/revoked".to_string();
        }
        if self.error {
            return "ERRSIG".to_string();
        }
        if self.is_valid() {
            return "GOODSIG".to_string();
        }
        "incomplete signature status".to_string()
    }
}

/// Interpret `--status-fd` output
pub fn parse_status(output: &str) -> GpgStatus {
    let mut status = GpgStatus::default();
    for line in output.lines() {
        let Some(rest) = line.strip_prefix(STATUS_PREFIX) else {
            continue;
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        let Some(keyword) = fields.first() else {
            continue;
        };
        trace!("gpg status: {}", rest);
        match *keyword {
            "GOODSIG" => status.good = true,
            "BADSIG" => status.bad = true,
            "ERRSIG" => status.error = true,
            "NO_PUBKEY" => status.missing_key = fields.get(1).map(|s| s.to_string()),
            "NODATA" => status.no_data = true,
            "EXPSIG" | "EXPKEYSIG" | "REVKEYSIG" => status.expired_or_revoked = true,
            "VALIDSIG" => {
                // VALIDSIG <fpr> <date> <ts> <expire> <ver> <reserved> <pk> <hash> <class> <primary-fpr>
                let primary = if fields.len() >= 11 {
                    fields.last()
                } else {
                    fields.get(1)
                };
                status.valid_fingerprint = primary.map(|f| normalize_fingerprint(f));
            }
            "TRUST_UNDEFINED" | "TRUST_NEVER" => status.trust = Some(TrustLevel::None),
            "TRUST_MARGINAL" => status.trust = Some(TrustLevel::Marginal),
            "TRUST_FULLY" => status.trust = Some(TrustLevel::Full),
            "TRUST_ULTIMATE" => status.trust = Some(TrustLevel::Ultimate),
            _ => {}
        }
    }
    status
}

/// Signature engine backed by the `gpg` binary
#[derive(Debug, Clone)]
pub struct GpgEngine {
    binary: PathBuf,
    homedir: Option<PathBuf>,
    timeout: Duration,
}

impl GpgEngine {
    pub fn new(binary: impl Into<PathBuf>, homedir: Option<PathBuf>) -> Self {
        GpgEngine {
            binary: binary.into(),
            homedir,
            timeout: default_timeout(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(home) = &self.homedir {
            args.push("--homedir".to_string());
            args.push(home.display().to_string());
        }
        args.extend(["--batch", "--no-tty", "--yes"].map(String::from));
        args
    }

    async fn run(&self, args: &[String], input: &[u8]) -> CotResult<std::process::Output> {
        debug!("Running {} {}", self.binary.display(), args.join(" "));
        let mut child = tokio::process::Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CotError::Engine {
                message: format!("failed to start {}: {e}", self.binary.display()),
            })?;

        let writer = child.stdin.take().map(|mut stdin| {
            let input = input.to_vec();
            tokio::spawn(async move {
                let result = stdin.write_all(&input).await;
                drop(stdin);
                result
            })
        });

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| CotError::Engine {
                message: format!("gpg did not finish within {:?}", self.timeout),
            })?
            .map_err(|e| CotError::Engine {
                message: format!("gpg failed: {e}"),
            })?;

        if let Some(writer) = writer {
            // gpg may stop reading early when it rejects the input.
            if let Ok(Err(e)) = writer.await {
                debug!("gpg stdin closed early: {}", e);
            }
        }
        Ok(output)
    }
}

fn signing_failure(key_id: &str, stderr: &str) -> CotError {
    let unavailable = stderr.contains("[GNUPG:] INV_SGNR")
        || stderr.contains("secret key not available")
        || stderr.contains("No secret key");
    if unavailable {
        CotError::SigningKeyUnavailable {
            key: key_id.to_string(),
            message: "gpg has no usable secret key".to_string(),
        }
    } else {
        CotError::Engine {
            message: format!("gpg signing failed: {}", stderr.trim()),
        }
    }
}

fn temp_file_with(contents: &[u8]) -> CotResult<tempfile::NamedTempFile> {
    let mut file = tempfile::NamedTempFile::new().map_err(|e| CotError::Engine {
        message: format!("cannot create temporary file: {e}"),
    })?;
    file.write_all(contents)
        .and_then(|_| file.flush())
        .map_err(|e| CotError::io(file.path(), e))?;
    Ok(file)
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

#[async_trait]
impl SignatureEngine for GpgEngine {
    async fn sign(
        &self,
        payload: &[u8],
        key_id: &str,
        format: SignatureFormat,
    ) -> CotResult<String> {
        let mut args = self.base_args();
        // The trailing '!' pins the exact key; gpg must not pick another.
        args.extend([
            "--status-fd".to_string(),
            "2".to_string(),
            "--armor".to_string(),
            "--digest-algo".to_string(),
            "SHA256".to_string(),
            "--local-user".to_string(),
            format!("{}!", normalize_fingerprint(key_id)),
        ]);
        args.push(
            match format {
                SignatureFormat::Detached => "--detach-sign",
                SignatureFormat::Cleartext => "--clearsign",
            }
            .to_string(),
        );

        let output = self.run(&args, payload).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            warn!("gpg refused to sign with {}", key_id);
            return Err(signing_failure(key_id, &stderr));
        }
        String::from_utf8(output.stdout).map_err(|e| CotError::Engine {
            message: format!("gpg produced non UTF-8 output: {e}"),
        })
    }

    async fn verify(&self, statement: &SignedStatement) -> CotResult<VerifyOutcome> {
        let mut args = self.base_args();
        args.extend(["--status-fd".to_string(), "1".to_string()]);

        // Detached: signature in a temp file, payload on stdin.
        // Cleartext: message on stdin, verified text written to a temp file.
        let (_guard, signed_out, input) = match statement.format {
            SignatureFormat::Detached => {
                let sig = temp_file_with(statement.signature.as_bytes())?;
                args.extend(["--verify".to_string(), path_arg(sig.path()), "-".to_string()]);
                (sig, None, statement.payload.as_bytes().to_vec())
            }
            SignatureFormat::Cleartext => {
                let out = temp_file_with(b"")?;
                args.extend([
                    "--output".to_string(),
                    path_arg(out.path()),
                    "--decrypt".to_string(),
                ]);
                let out_path = out.path().to_path_buf();
                (out, Some(out_path), statement.signature.as_bytes().to_vec())
            }
        };

        let output = self.run(&args, &input).await?;
        let status = parse_status(&String::from_utf8_lossy(&output.stdout));
        debug!("gpg verify: {}", status.summary());

        if !status.is_valid() {
            return Ok(VerifyOutcome::invalid(status.summary()));
        }

        let signed_text = match signed_out {
            Some(path) => Some(
                tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| CotError::io(&path, e))?,
            ),
            None => None,
        };

        Ok(VerifyOutcome {
            valid: true,
            signer_key_id: status.valid_fingerprint.clone(),
            trust_level: status.trust.unwrap_or(TrustLevel::None),
            signed_text,
            detail: status.summary(),
        })
    }

    fn name(&self) -> &'static str {
        "gpg"
    }
}
