//! Configuration
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration for the stock worker types. YAML and JSON are both
//! accepted.

use crate::retry::{Backoff, RetryPolicy};
use crate::trust::error::{CotError, CotResult};
use crate::trust::hasher::{HashAlgorithm, DEFAULT_HASH_CONCURRENCY};
use crate::trust::keys::{default_worker_keys, default_worker_roles, WorkerRole};
use crate::trust::signer::SignatureFormat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace};

pub const CLIENT_ID_ENV: &str = "TASKCLUSTER_CLIENT_ID";
pub const ACCESS_TOKEN_ENV: &str = "TASKCLUSTER_ACCESS_TOKEN";

/// Project-local config file, relative to the working directory
pub const LOCAL_CONFIG_PATH: &str = ".cotrust/config.yml";

/// Queue credentials; only ever read from the environment
#[derive(Clone, Default, PartialEq, Eq)]
pub struct QueueCredentials {
    pub client_id: Option<String>,
    pub access_token: Option<String>,
}

impl QueueCredentials {
    pub fn from_env() -> Self {
        QueueCredentials {
            client_id: std::env::var(CLIENT_ID_ENV).ok().filter(|v| !v.is_empty()),
            access_token: std::env::var(ACCESS_TOKEN_ENV).ok().filter(|v| !v.is_empty()),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.client_id.is_some() && self.access_token.is_some()
    }
}

impl fmt::Debug for QueueCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueCredentials")
            .field("client_id", &self.client_id)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// A `(workerType, buildPlatform)` pair selecting build tasks to chain
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildCriterion {
    pub worker_type: String,
    pub build_platform: String,
}

impl BuildCriterion {
    pub fn new(worker_type: impl Into<String>, build_platform: impl Into<String>) -> Self {
        BuildCriterion {
            worker_type: worker_type.into(),
            build_platform: build_platform.into(),
        }
    }
}

/// Retry settings for queue fetches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            attempts: default_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.attempts,
            Backoff::new(self.base_delay_ms, self.max_delay_ms),
        )
    }
}

fn default_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CotConfig {
    #[serde(skip)]
    pub credentials: QueueCredentials,

    /// GnuPG home directory holding the imported keys; gpg's default when unset
    #[serde(default)]
    pub key_store: Option<PathBuf>,

    /// Trust store file (keys + delegation edges)
    #[serde(default)]
    pub trust_store: Option<PathBuf>,

    #[serde(default = "default_gpg_binary")]
    pub gpg_binary: PathBuf,

    /// Worker type to key identity
    #[serde(default = "default_worker_keys")]
    pub worker_keys: BTreeMap<String, String>,

    /// Worker type to role; unlisted worker types are classified by name
    #[serde(default = "default_worker_roles")]
    pub worker_roles: BTreeMap<String, WorkerRole>,

    /// Registry images whose pull digest is accepted from the log
    #[serde(default = "default_published_images")]
    pub published_images: Vec<String>,

    #[serde(default = "default_build_criteria")]
    pub build_criteria: Vec<BuildCriterion>,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,

    #[serde(default = "default_hash_concurrency")]
    pub hash_concurrency: usize,

    #[serde(default)]
    pub signature_format: SignatureFormat,

    /// Where signed statements are written, relative to the work directory
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Seconds to wait for one gpg invocation
    #[serde(default = "default_engine_timeout")]
    pub engine_timeout_seconds: u64,
}

fn default_gpg_binary() -> PathBuf {
    PathBuf::from("gpg")
}

// Registry images the decision and image-builder worker types run
fn default_published_images() -> Vec<String> {
    vec![
        "taskcluster/decision:0.1.0".to_string(),
        "taskcluster/image_builder:0.1.3".to_string(),
    ]
}

fn default_build_criteria() -> Vec<BuildCriterion> {
    vec![BuildCriterion::new("opt-linux64", "linux64")]
}

fn default_hash_concurrency() -> usize {
    DEFAULT_HASH_CONCURRENCY
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("cot")
}

fn default_engine_timeout() -> u64 {
    60
}

impl Default for CotConfig {
    fn default() -> Self {
        CotConfig {
            credentials: QueueCredentials::default(),
            key_store: None,
            trust_store: None,
            gpg_binary: default_gpg_binary(),
            worker_keys: default_worker_keys(),
            worker_roles: default_worker_roles(),
            published_images: default_published_images(),
            build_criteria: default_build_criteria(),
            retry: RetryConfig::default(),
            hash_algorithm: HashAlgorithm::default(),
            hash_concurrency: default_hash_concurrency(),
            signature_format: SignatureFormat::default(),
            output_dir: default_output_dir(),
            engine_timeout_seconds: default_engine_timeout(),
        }
    }
}

impl CotConfig {
    /// Parse configuration text (YAML, which also covers JSON)
    pub fn parse(text: &str) -> CotResult<Self> {
        if text.trim().is_empty() {
            return Ok(CotConfig::default());
        }
        let config: CotConfig = serde_yaml_ng::from_str(text).map_err(|e| CotError::Config {
            message: format!("cannot parse configuration: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file and pick up credentials from the environment
    pub fn load(path: &Path) -> CotResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| CotError::io(path, e))?;
        let mut config = Self::parse(&text).map_err(|e| match e {
            CotError::Config { message } => CotError::Config {
                message: format!("{}: {message}", path.display()),
            },
            other => other,
        })?;
        config.credentials = QueueCredentials::from_env();
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Find and load the configuration
    ///
    /// Resolution order:
    /// 1. CLI override (must exist)
    /// 2. `./.cotrust/config.yml`
    /// 3. `cotrust/config.yml` in the platform config directory
    /// 4. Built-in defaults
    pub fn discover(cli_override: Option<&Path>) -> CotResult<Self> {
        trace!("Discovering configuration");
        if let Some(path) = cli_override {
            if !path.is_file() {
                return Err(CotError::Config {
                    message: format!("config file does not exist: {}", path.display()),
                });
            }
            return Self::load(path);
        }

        let local = PathBuf::from(LOCAL_CONFIG_PATH);
        if local.is_file() {
            return Self::load(&local);
        }

        if let Some(global) = dirs::config_dir().map(|d| d.join("cotrust").join("config.yml")) {
            if global.is_file() {
                return Self::load(&global);
            }
            debug!("No global config at {}", global.display());
        }

        debug!("No configuration file found, using defaults");
        Ok(CotConfig {
            credentials: QueueCredentials::from_env(),
            ..CotConfig::default()
        })
    }

    pub fn validate(&self) -> CotResult<()> {
        if self.retry.attempts == 0 {
            return Err(CotError::Config {
                message: "retry.attempts must be at least 1".to_string(),
            });
        }
        if self.hash_concurrency == 0 {
            return Err(CotError::Config {
                message: "hash_concurrency must be at least 1".to_string(),
            });
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(CotError::Config {
                message: "retry.base_delay_ms exceeds retry.max_delay_ms".to_string(),
            });
        }
        if let Some((worker_type, _)) = self.worker_keys.iter().find(|(_, k)| k.trim().is_empty()) {
            return Err(CotError::Config {
                message: format!("worker type '{worker_type}' maps to an empty key identity"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = CotConfig::parse("").unwrap();
        assert_eq!(config.retry.attempts, 5);
        assert_eq!(config.hash_concurrency, 8);
        assert_eq!(config.output_dir, PathBuf::from("cot"));
        assert_eq!(
            config.published_images,
            vec!["taskcluster/decision:0.1.0", "taskcluster/image_builder:0.1.3"]
        );
        assert_eq!(
            config.build_criteria,
            vec![BuildCriterion::new("opt-linux64", "linux64")]
        );
        assert_eq!(config.worker_keys.get("opt-linux64").map(String::as_str), Some("docker1"));
    }

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let yaml = r#"
retry:
  attempts: 3
hash_algorithm: sha512
signature_format: cleartext
build_criteria:
  - workerType: opt-macosx64
    buildPlatform: macosx64
"#;
        let config = CotConfig::parse(yaml).unwrap();
        assert_eq!(config.retry.attempts, 3);
        assert_eq!(config.retry.max_delay_ms, 30_000);
        assert_eq!(config.hash_algorithm, HashAlgorithm::Sha512);
        assert_eq!(config.signature_format, SignatureFormat::Cleartext);
        assert_eq!(config.build_criteria[0].worker_type, "opt-macosx64");
        assert_eq!(config.gpg_binary, PathBuf::from("gpg"));
    }

    #[test]
    fn test_json_is_accepted() {
        let config = CotConfig::parse(r#"{"hash_concurrency": 2}"#).unwrap();
        assert_eq!(config.hash_concurrency, 2);
    }

    #[test]
    fn test_validation_rejects_zero_limits() {
        assert!(matches!(
            CotConfig::parse("retry:\n  attempts: 0\n"),
            Err(CotError::Config { .. })
        ));
        assert!(matches!(
            CotConfig::parse("hash_concurrency: 0\n"),
            Err(CotError::Config { .. })
        ));
    }

    #[test]
    #[serial]
    fn test_credentials_come_from_env_and_are_redacted() {
        std::env::set_var(CLIENT_ID_ENV, "project/releng");
        std::env::set_var(ACCESS_TOKEN_ENV, "super-secret");
        let creds = QueueCredentials::from_env();
        std::env::remove_var(CLIENT_ID_ENV);
        std::env::remove_var(ACCESS_TOKEN_ENV);

        assert!(creds.is_complete());
        let debug = format!("{creds:?}");
        assert!(debug.contains("project/releng"));
        assert!(!debug.contains("super-secret"));
    }

    #[test]
    #[serial]
    fn test_discover_with_override() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cot.yml");
        std::fs::write(&path, "output_dir: signed\n").unwrap();

        let config = CotConfig::discover(Some(&path)).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("signed"));

        let missing = dir.path().join("nope.yml");
        assert!(matches!(
            CotConfig::discover(Some(&missing)),
            Err(CotError::Config { .. })
        ));
    }
}
