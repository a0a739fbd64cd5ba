//! Key hierarchy - who may sign for which worker role
//!
//! Root keys are trusted by configuration. They delegate to embedded keys by
//! signing them, and an embedded key is valid for a worker role only when a
//! chain of such delegations leads back to a root configured for that role.
//!
//! The store is loaded once at startup and never mutated afterwards; it is
//! shared behind an `Arc` by the signer, the verifier and the walker.

use crate::trust::error::{CotError, CotResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Role a key plays in the hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyRole {
    Root,
    Embedded,
    Signing,
    Unknown,
}

impl Default for KeyRole {
    fn default() -> Self {
        KeyRole::Unknown
    }
}

/// Ownertrust assigned to a key, ordered from weakest to strongest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    None,
    Marginal,
    Full,
    Ultimate,
}

impl Default for TrustLevel {
    fn default() -> Self {
        TrustLevel::None
    }
}

impl TrustLevel {
    /// Whether signatures made by a key at this level delegate trust
    pub fn can_delegate(self) -> bool {
        self >= TrustLevel::Full
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrustLevel::None => "none",
            TrustLevel::Marginal => "marginal",
            TrustLevel::Full => "full",
            TrustLevel::Ultimate => "ultimate",
        };
        f.write_str(s)
    }
}

/// Category of execution environment a task runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerRole {
    Decision,
    Build,
    DockerImageBuilder,
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerRole::Decision => "decision",
            WorkerRole::Build => "build",
            WorkerRole::DockerImageBuilder => "docker-image-builder",
        };
        f.write_str(s)
    }
}

/// Normalize a fingerprint: upper-case hex, no whitespace, no `0x` prefix
pub fn normalize_fingerprint(fingerprint: &str) -> String {
    let trimmed = fingerprint.trim();
    let trimmed = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    trimmed
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase()
}

/// A key known to the trust store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeyEntry {
    pub fingerprint: String,

    /// Email-like labels the key is known by
    #[serde(default)]
    pub identities: Vec<String>,

    #[serde(default)]
    pub role: KeyRole,

    #[serde(default)]
    pub trust: TrustLevel,

    /// Worker roles this root key may delegate (root keys only)
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub authorizes: BTreeSet<WorkerRole>,
}

impl KeyEntry {
    /// Whether `label` names this key (full identity, its local part, or the fingerprint)
    pub fn matches_identity(&self, label: &str) -> bool {
        let label = label.trim();
        if normalize_fingerprint(label) == self.fingerprint {
            return true;
        }
        self.identities.iter().any(|identity| {
            identity.eq_ignore_ascii_case(label)
                || identity
                    .split('@')
                    .next()
                    .is_some_and(|local| local.eq_ignore_ascii_case(label))
        })
    }
}

/// A delegation: `signer` has signed `signed`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct TrustEdge {
    pub signer: String,
    pub signed: String,
}

#[derive(Debug, Default, Deserialize)]
struct TrustStoreFile {
    #[serde(default)]
    keys: Vec<KeyEntry>,
    #[serde(default)]
    edges: Vec<TrustEdge>,
}

/// Validated set of keys and delegations
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    keys: BTreeMap<String, KeyEntry>,
    edges: BTreeSet<TrustEdge>,
}

impl TrustStore {
    /// Build and validate a store from keys and delegation edges
    pub fn new(keys: Vec<KeyEntry>, edges: Vec<TrustEdge>) -> CotResult<Self> {
        let mut by_fpr = BTreeMap::new();
        for mut key in keys {
            key.fingerprint = normalize_fingerprint(&key.fingerprint);
            if key.fingerprint.is_empty() {
                return Err(invalid("key with an empty fingerprint"));
            }
            if key.role == KeyRole::Root {
                // Roots are trusted by configuration.
                key.trust = key.trust.max(TrustLevel::Full);
            } else if !key.authorizes.is_empty() {
                return Err(invalid(format!(
                    "key {} is not a root key but authorizes roles",
                    key.fingerprint
                )));
            }
            if let Some(prev) = by_fpr.insert(key.fingerprint.clone(), key) {
                return Err(invalid(format!("duplicate key {}", prev.fingerprint)));
            }
        }

        let ultimate: Vec<&str> = by_fpr
            .values()
            .filter(|k| k.trust == TrustLevel::Ultimate)
            .map(|k| k.fingerprint.as_str())
            .collect();
        if ultimate.len() > 1 {
            return Err(invalid(format!(
                "only one key may hold ultimate trust, found {}",
                ultimate.join(", ")
            )));
        }

        let mut normalized = BTreeSet::new();
        for edge in edges {
            let edge = TrustEdge {
                signer: normalize_fingerprint(&edge.signer),
                signed: normalize_fingerprint(&edge.signed),
            };
            if !by_fpr.contains_key(&edge.signer) || !by_fpr.contains_key(&edge.signed) {
                warn!(
                    "Delegation {} -> {} references an unknown key",
                    edge.signer, edge.signed
                );
            }
            normalized.insert(edge);
        }

        let store = TrustStore {
            keys: by_fpr,
            edges: normalized,
        };
        store.check_acyclic()?;
        Ok(store)
    }

    /// Load a store from a YAML or JSON file
    pub fn load(path: &Path) -> CotResult<Self> {
        info!("Loading trust store from: {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|e| CotError::io(path, e))?;
        let file: TrustStoreFile =
            serde_yaml_ng::from_str(&content).map_err(|e| CotError::TrustStoreInvalid {
                message: format!("{}: {}", path.display(), e),
            })?;
        let store = Self::new(file.keys, file.edges)?;
        debug!(
            "Trust store loaded: {} keys, {} delegations",
            store.keys.len(),
            store.edges.len()
        );
        Ok(store)
    }

    pub fn key(&self, fingerprint: &str) -> Option<&KeyEntry> {
        self.keys.get(&normalize_fingerprint(fingerprint))
    }

    pub fn keys(&self) -> impl Iterator<Item = &KeyEntry> {
        self.keys.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &TrustEdge> {
        self.edges.iter()
    }

    fn trust_of(&self, fingerprint: &str) -> TrustLevel {
        self.keys
            .get(fingerprint)
            .map_or(TrustLevel::None, |k| k.trust)
    }

    /// Edges whose signer is trusted enough to delegate, self-edges removed
    fn delegating_edges(&self) -> impl Iterator<Item = &TrustEdge> {
        self.edges
            .iter()
            .filter(|e| e.signer != e.signed && self.trust_of(&e.signer).can_delegate())
    }

    fn check_acyclic(&self) -> CotResult<()> {
        let mut adjacency: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        for edge in self.delegating_edges() {
            adjacency.entry(&edge.signer).or_default().push(&edge.signed);
            in_degree.entry(&edge.signer).or_insert(0);
            *in_degree.entry(&edge.signed).or_insert(0) += 1;
        }

        // Kahn's algorithm: whatever cannot be peeled off sits on a cycle.
        let mut ready: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut visited = 0;
        while let Some(node) = ready.pop_front() {
            visited += 1;
            for next in adjacency.get(node).into_iter().flatten() {
                if let Some(d) = in_degree.get_mut(*next) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push_back(*next);
                    }
                }
            }
        }

        if visited != in_degree.len() {
            let on_cycle: Vec<&str> = in_degree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(n, _)| *n)
                .collect();
            return Err(invalid(format!(
                "delegation cycle between trusted keys: {}",
                on_cycle.join(", ")
            )));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> CotError {
    CotError::TrustStoreInvalid {
        message: message.into(),
    }
}

/// Default worker type to key identity table
pub fn default_worker_keys() -> BTreeMap<String, String> {
    [
        ("gecko-decision", "decision1"),
        ("opt-linux64", "docker1"),
        ("image-builder", "DockerImageBuilder"),
    ]
    .into_iter()
    .map(|(w, k)| (w.to_string(), k.to_string()))
    .collect()
}

/// Default worker type to role table
pub fn default_worker_roles() -> BTreeMap<String, WorkerRole> {
    [
        ("gecko-decision", WorkerRole::Decision),
        ("opt-linux64", WorkerRole::Build),
        ("image-builder", WorkerRole::DockerImageBuilder),
    ]
    .into_iter()
    .map(|(w, r)| (w.to_string(), r))
    .collect()
}

/// Authoritative view over a trust store and the worker-type tables
#[derive(Debug, Clone)]
pub struct KeyHierarchy {
    store: Arc<TrustStore>,
    worker_keys: BTreeMap<String, String>,
    worker_roles: BTreeMap<String, WorkerRole>,
}

impl KeyHierarchy {
    pub fn new(
        store: Arc<TrustStore>,
        worker_keys: BTreeMap<String, String>,
        worker_roles: BTreeMap<String, WorkerRole>,
    ) -> Self {
        KeyHierarchy {
            store,
            worker_keys,
            worker_roles,
        }
    }

    pub fn store(&self) -> &TrustStore {
        &self.store
    }

    pub fn worker_keys(&self) -> &BTreeMap<String, String> {
        &self.worker_keys
    }

    /// Trust level of a key; `None` when the key is unknown
    pub fn trust_level_of(&self, fingerprint: &str) -> TrustLevel {
        self.store.trust_of(&normalize_fingerprint(fingerprint))
    }

    /// Whether a delegation path from a root configured for `role` reaches `fingerprint`
    ///
    /// Only edges whose signer holds full or ultimate trust are followed, so
    /// a key signed by an untrusted or unrelated key is never authorized.
    pub fn is_authorized_for(&self, fingerprint: &str, role: WorkerRole) -> bool {
        let target = normalize_fingerprint(fingerprint);
        let mut queue: VecDeque<&str> = self
            .store
            .keys
            .values()
            .filter(|k| k.role == KeyRole::Root && k.authorizes.contains(&role))
            .map(|k| k.fingerprint.as_str())
            .collect();
        let mut seen: BTreeSet<&str> = queue.iter().copied().collect();

        while let Some(current) = queue.pop_front() {
            if current == target {
                return true;
            }
            if !self.store.trust_of(current).can_delegate() {
                continue;
            }
            for edge in self.store.delegating_edges().filter(|e| e.signer == current) {
                if seen.insert(&edge.signed) {
                    queue.push_back(&edge.signed);
                }
            }
        }
        debug!("Key {} has no delegation path for role {}", target, role);
        false
    }

    /// Look up the single key known by `label`
    pub fn key_by_identity(&self, label: &str) -> CotResult<&KeyEntry> {
        let mut matches = self.store.keys().filter(|k| k.matches_identity(label));
        let first = matches.next().ok_or_else(|| CotError::SigningKeyUnavailable {
            key: label.to_string(),
            message: "no key with this identity in the trust store".to_string(),
        })?;
        if let Some(second) = matches.next() {
            return Err(CotError::SigningKeyUnavailable {
                key: label.to_string(),
                message: format!(
                    "identity is ambiguous ({} and {})",
                    first.fingerprint, second.fingerprint
                ),
            });
        }
        Ok(first)
    }

    /// Fingerprint of the key configured for `worker_type`
    pub fn resolve_signing_key(&self, worker_type: &str) -> CotResult<String> {
        let label = self
            .worker_keys
            .get(worker_type)
            .ok_or_else(|| CotError::UnknownWorkerType {
                worker_type: worker_type.to_string(),
            })?;
        let key = self.key_by_identity(label)?;
        debug!(
            "Worker type '{}' signs with '{}' ({})",
            worker_type, label, key.fingerprint
        );
        Ok(key.fingerprint.clone())
    }

    /// Role of a worker type: the configured role, else inferred from its name
    pub fn role_for_worker_type(&self, worker_type: &str) -> WorkerRole {
        if let Some(role) = self.worker_roles.get(worker_type) {
            return *role;
        }
        if worker_type.contains("decision") {
            WorkerRole::Decision
        } else if worker_type.contains("image-builder") {
            WorkerRole::DockerImageBuilder
        } else {
            WorkerRole::Build
        }
    }
}
