//! Test helper functions for integration tests
//!
//! Shared across test files using the tests/common/ pattern. Provides an
//! HMAC signature engine, a fixture trust store, and a work directory laid
//! out the way the downloader leaves it.

#![allow(dead_code)]

use async_trait::async_trait;
use cotrust_core::chain::queue::{artifact_dir, STATUS_FILE, TASK_FILE};
use cotrust_core::config::CotConfig;
use cotrust_core::retry::{Backoff, RetryPolicy};
use cotrust_core::trust::engine::{SignatureEngine, VerifyOutcome};
use cotrust_core::trust::error::{CotError, CotResult};
use cotrust_core::trust::keys::{
    default_worker_keys, default_worker_roles, KeyEntry, KeyHierarchy, KeyRole, TrustEdge,
    TrustLevel, TrustStore, WorkerRole,
};
use cotrust_core::trust::signer::{
    dash_escape, SignatureFormat, SignedStatement, SIGNATURE_BEGIN, SIGNATURE_END,
    SIGNED_MESSAGE_BEGIN,
};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use tempfile::TempDir;

/// Initialize logging for tests (only once per test run)
static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_level(true),
            )
            .with(tracing_subscriber::filter::EnvFilter::from_default_env())
            .try_init();
    });
}

pub const ROOT_FPR: &str = "0A0A0A0A0A0A0A0A0A0A0A0A0A0A0A0A0A0A0A0A";
pub const DECISION_FPR: &str = "D1D1D1D1D1D1D1D1D1D1D1D1D1D1D1D1D1D1D1D1";
pub const DOCKER_FPR: &str = "B2B2B2B2B2B2B2B2B2B2B2B2B2B2B2B2B2B2B2B2";
pub const IMAGE_FPR: &str = "C3C3C3C3C3C3C3C3C3C3C3C3C3C3C3C3C3C3C3C3";
pub const ROGUE_FPR: &str = "EEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEEE";

pub const DECISION_ID: &str = "DecisionTask0";
pub const BUILD_1: &str = "BuildTask1";
pub const BUILD_2: &str = "BuildTask2";
pub const IMAGE_ID: &str = "ImageTask1";
pub const TEST_ID: &str = "TestTask9";

pub const DECISION_IMAGE: &str = "taskcluster/decision:0.1.0";
pub const BUILDER_IMAGE: &str = "taskcluster/image_builder:0.1.3";
pub const IMAGE_DIGEST: &str =
    "sha256:9c3f0e8a1b2d4c6e8f0a1b2c3d4e5f60718293a4b5c6d7e8f90a1b2c3d4e5f6a";
pub const BUILDER_DIGEST: &str =
    "sha256:77aa00bb11cc22dd33ee44ff5566778899aabbccddeeff00112233445566778a";
pub const DECISION_DIGEST: &str =
    "sha256:d0d0d0d0e1e1e1e1f2f2f2f2a3a3a3a3b4b4b4b4c5c5c5c5d6d6d6d6e7e7e7e7";

type HmacSha256 = Hmac<Sha256>;

/// Signature engine backed by per-key HMAC secrets
pub struct HmacEngine {
    secrets: BTreeMap<String, Vec<u8>>,
}

impl HmacEngine {
    pub fn new(fingerprints: &[&str]) -> Self {
        HmacEngine {
            secrets: fingerprints
                .iter()
                .map(|f| (f.to_string(), format!("hmac-secret-{f}").into_bytes()))
                .collect(),
        }
    }

    /// Engine holding every fixture key, the rogue one included
    pub fn all_keys() -> Self {
        Self::new(&[ROOT_FPR, DECISION_FPR, DOCKER_FPR, IMAGE_FPR, ROGUE_FPR])
    }

    fn mac(&self, key: &str, payload: &[u8]) -> Option<String> {
        let secret = self.secrets.get(key)?;
        let mut mac = HmacSha256::new_from_slice(secret).ok()?;
        mac.update(payload);
        Some(hex::encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl SignatureEngine for HmacEngine {
    async fn sign(&self, payload: &[u8], key_id: &str, format: SignatureFormat) -> CotResult<String> {
        let mac = self
            .mac(key_id, payload)
            .ok_or_else(|| CotError::SigningKeyUnavailable {
                key: key_id.to_string(),
                message: "no HMAC secret".to_string(),
            })?;
        let block = format!("{SIGNATURE_BEGIN}\nKey: {key_id}\n\nhmac-sha256:{mac}\n{SIGNATURE_END}\n");
        Ok(match format {
            SignatureFormat::Detached => block,
            SignatureFormat::Cleartext => format!(
                "{SIGNED_MESSAGE_BEGIN}\nHash: SHA256\n\n{}\n{block}",
                dash_escape(&String::from_utf8_lossy(payload))
            ),
        })
    }

    async fn verify(&self, statement: &SignedStatement) -> CotResult<VerifyOutcome> {
        let key = statement
            .signature
            .lines()
            .find_map(|l| l.strip_prefix("Key: "))
            .map(str::to_string);
        let mac = statement
            .signature
            .lines()
            .find_map(|l| l.strip_prefix("hmac-sha256:"))
            .map(str::to_string);
        let (Some(key), Some(mac)) = (key, mac) else {
            return Ok(VerifyOutcome::invalid("NODATA"));
        };
        if self.mac(&key, statement.payload.as_bytes()).as_deref() != Some(mac.as_str()) {
            return Ok(VerifyOutcome::invalid(format!("BADSIG {key}")));
        }
        Ok(VerifyOutcome {
            valid: true,
            signer_key_id: Some(key),
            trust_level: TrustLevel::Full,
            signed_text: (statement.format == SignatureFormat::Cleartext)
                .then(|| statement.payload.clone()),
            detail: "GOODSIG".to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "hmac"
    }
}

fn key(fpr: &str, identity: &str, role: KeyRole, trust: TrustLevel) -> KeyEntry {
    KeyEntry {
        fingerprint: fpr.to_string(),
        identities: vec![format!("{identity}@keys.example.com")],
        role,
        trust,
        authorizes: BTreeSet::new(),
    }
}

fn edge(signer: &str, signed: &str) -> TrustEdge {
    TrustEdge {
        signer: signer.to_string(),
        signed: signed.to_string(),
    }
}

/// Root authorizing all roles, delegating to the three worker keys
///
/// The rogue key is known but nobody signed it.
pub fn fixture_store() -> TrustStore {
    let mut root = key(ROOT_FPR, "root", KeyRole::Root, TrustLevel::Ultimate);
    root.authorizes = BTreeSet::from([
        WorkerRole::Decision,
        WorkerRole::Build,
        WorkerRole::DockerImageBuilder,
    ]);
    TrustStore::new(
        vec![
            root,
            key(DECISION_FPR, "decision1", KeyRole::Embedded, TrustLevel::Marginal),
            key(DOCKER_FPR, "docker1", KeyRole::Embedded, TrustLevel::Marginal),
            key(IMAGE_FPR, "DockerImageBuilder", KeyRole::Embedded, TrustLevel::Marginal),
            key(ROGUE_FPR, "rogue", KeyRole::Embedded, TrustLevel::Marginal),
        ],
        vec![
            edge(ROOT_FPR, DECISION_FPR),
            edge(ROOT_FPR, DOCKER_FPR),
            edge(ROOT_FPR, IMAGE_FPR),
        ],
    )
    .expect("fixture trust store is valid")
}

pub fn fixture_hierarchy() -> Arc<KeyHierarchy> {
    Arc::new(KeyHierarchy::new(
        Arc::new(fixture_store()),
        default_worker_keys(),
        default_worker_roles(),
    ))
}

pub fn test_config() -> CotConfig {
    CotConfig::default()
}

/// Retries without sleeping
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Backoff::new(0, 0))
}

/// Work directory with one decision task, two builds, their image builder
/// and an unrelated test task
pub struct ChainFixture {
    pub dir: TempDir,
}

impl ChainFixture {
    pub fn new() -> Self {
        let fixture = ChainFixture {
            dir: TempDir::new().expect("temp dir"),
        };
        fixture.populate();
        fixture
    }

    pub fn work_dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn cot_dir(&self) -> PathBuf {
        self.dir.path().join("cot")
    }

    pub fn artifact_path(&self, task_id: &str, name: &str) -> PathBuf {
        artifact_dir(self.work_dir(), task_id).join(name)
    }

    pub fn write_artifact(&self, task_id: &str, name: &str, contents: &[u8]) {
        let path = self.artifact_path(task_id, name);
        fs::create_dir_all(path.parent().expect("artifact has a parent")).expect("mkdir");
        fs::write(path, contents).expect("write artifact");
    }

    pub fn write_task(&self, task_id: &str, task: &Value) {
        let dir = self.work_dir().join(task_id);
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join(TASK_FILE), task.to_string()).expect("write task");
    }

    pub fn write_status(&self, task_id: &str, state: &str, run_state: &str, run_id: u32) {
        let dir = self.work_dir().join(task_id);
        fs::create_dir_all(&dir).expect("mkdir");
        let runs: Vec<Value> = (0..=run_id)
            .map(|id| {
                json!({
                    "runId": id,
                    "state": if id == run_id { run_state } else { "exception" },
                    "workerGroup": "us-west-2",
                    "workerId": format!("i-{task_id}-{id}"),
                })
            })
            .collect();
        let status = json!({"status": {"taskId": task_id, "state": state, "runs": runs}});
        fs::write(dir.join(STATUS_FILE), status.to_string()).expect("write status");
    }

    fn build_task() -> Value {
        json!({
            "workerType": "opt-linux64",
            "provisionerId": "aws-provisioner-v1",
            "payload": {
                "image": {"type": "task-image", "path": "public/image.tar", "taskId": IMAGE_ID},
                "command": ["/home/worker/bin/build.sh"]
            },
            "metadata": {"name": "linux64 opt build", "description": "Build \u{2013} linux64"}
        })
    }

    pub fn task_graph() -> Value {
        json!({
            BUILD_1: {"task": Self::build_task(), "attributes": {"build_platform": "linux64"}},
            BUILD_2: {"task": Self::build_task(), "attributes": {"build_platform": "linux64"}},
            TEST_ID: {
                "task": {"workerType": "test-linux64", "payload": {}},
                "attributes": {"build_platform": "linux64"}
            }
        })
    }

    fn populate(&self) {
        self.write_task(
            DECISION_ID,
            &json!({"workerType": "gecko-decision", "payload": {"image": DECISION_IMAGE}}),
        );
        self.write_status(DECISION_ID, "completed", "completed", 0);
        self.write_artifact(
            DECISION_ID,
            "public/task-graph.json",
            serde_json::to_string_pretty(&Self::task_graph())
                .expect("graph json")
                .as_bytes(),
        );
        self.write_artifact(
            DECISION_ID,
            "public/logs/live.log",
            format!("Pulling {DECISION_IMAGE}\nDigest: {DECISION_DIGEST}\ndecision task ran\n").as_bytes(),
        );

        for build in [BUILD_1, BUILD_2] {
            self.write_task(build, &Self::build_task());
            self.write_status(build, "completed", "completed", 0);
            self.write_artifact(build, "public/build/target.tar.gz", format!("binary of {build}").as_bytes());
            self.write_artifact(
                build,
                "public/logs/live.log",
                format!(
                    "[taskcluster 2016-11-01 18:29:04.592Z] Image 'public/image.tar' from task '{IMAGE_ID}' loaded.  Using image ID {IMAGE_DIGEST}.\nbuilding...\n"
                )
                .as_bytes(),
            );
        }

        self.write_task(
            IMAGE_ID,
            &json!({"workerType": "image-builder", "payload": {"image": BUILDER_IMAGE}}),
        );
        self.write_status(IMAGE_ID, "completed", "completed", 1);
        self.write_artifact(IMAGE_ID, "public/image.tar", b"docker image layers");
        self.write_artifact(
            IMAGE_ID,
            "public/logs/live.log",
            format!("Pulling {BUILDER_IMAGE}\nDigest: {BUILDER_DIGEST}\nStatus: done\n").as_bytes(),
        );
    }
}
