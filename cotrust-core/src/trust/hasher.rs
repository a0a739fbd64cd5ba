//! Artifact digests
//!
//! Digests are written as `<algorithm>:<hex>`. Files are streamed in fixed
//! chunks and hashed concurrently; results are keyed by artifact name so the
//! mapping never depends on completion order.

use crate::trust::error::{CotError, CotResult};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::io::AsyncReadExt;
use tracing::debug;

const CHUNK_SIZE: usize = 64 * 1024;

/// Default number of files hashed at once
pub const DEFAULT_HASH_CONCURRENCY: usize = 8;

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    fn hasher(&self) -> Hasher {
        match self {
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            HashAlgorithm::Sha384 => Hasher::Sha384(Sha384::new()),
            HashAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = CotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha384" => Ok(HashAlgorithm::Sha384),
            "sha512" => Ok(HashAlgorithm::Sha512),
            other => Err(CotError::Config {
                message: format!("unsupported hash algorithm '{other}'"),
            }),
        }
    }
}

enum Hasher {
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Hasher {
    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha384(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    fn finish(self, algorithm: HashAlgorithm) -> String {
        let hex = match self {
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha384(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
        };
        format!("{}:{}", algorithm, hex)
    }
}

/// An artifact to hash: its name within the task and where it lives on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFile {
    pub name: String,
    pub path: PathBuf,
}

impl ArtifactFile {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        ArtifactFile {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// Split `<algorithm>:<hex>` into its parts
pub fn parse_digest(digest: &str) -> Option<(HashAlgorithm, &str)> {
    let (alg, hex) = digest.split_once(':')?;
    let alg = alg.parse().ok()?;
    if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some((alg, hex))
}

/// Hash an in-memory buffer
pub fn hash_bytes(data: &[u8], algorithm: HashAlgorithm) -> String {
    let mut hasher = algorithm.hasher();
    hasher.update(data);
    hasher.finish(algorithm)
}

/// Hash a file's contents, streaming it in fixed-size chunks
pub async fn hash_file(name: &str, path: &Path, algorithm: HashAlgorithm) -> CotResult<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| open_error(name, path, e))?;

    let mut hasher = algorithm.hasher();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let bytes_read = file
            .read(&mut buffer)
            .await
            .map_err(|e| CotError::io(path, e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(hasher.finish(algorithm))
}

/// Hash a file synchronously (for non-async contexts)
pub fn hash_file_sync(name: &str, path: &Path, algorithm: HashAlgorithm) -> CotResult<String> {
    let mut file = std::fs::File::open(path).map_err(|e| open_error(name, path, e))?;

    let mut hasher = algorithm.hasher();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let bytes_read = file.read(&mut buffer).map_err(|e| CotError::io(path, e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(hasher.finish(algorithm))
}

fn open_error(name: &str, path: &Path, e: std::io::Error) -> CotError {
    if e.kind() == std::io::ErrorKind::NotFound {
        CotError::MissingArtifact {
            name: name.to_string(),
            path: path.to_path_buf(),
        }
    } else {
        CotError::io(path, e)
    }
}

/// Digest every listed file, at most `concurrency` at a time
///
/// The first failure aborts the whole set: a task's artifacts are either all
/// digested or none are.
pub async fn digest_all(
    files: &[ArtifactFile],
    algorithm: HashAlgorithm,
    concurrency: usize,
) -> CotResult<BTreeMap<String, String>> {
    let mut names = BTreeSet::new();
    for file in files {
        if !names.insert(file.name.as_str()) {
            return Err(CotError::DuplicateArtifact {
                name: file.name.clone(),
            });
        }
    }

    debug!(
        "Hashing {} artifacts with {} (concurrency {})",
        files.len(),
        algorithm,
        concurrency
    );

    stream::iter(files)
        .map(|file| async move {
            let digest = hash_file(&file.name, &file.path, algorithm).await?;
            debug!("{} -> {}", file.name, digest);
            Ok::<_, CotError>((file.name.clone(), digest))
        })
        .buffer_unordered(concurrency.max(1))
        .try_collect()
        .await
}

/// Enumerate regular files under `root` as artifacts named by relative `/` path
///
/// Symlinks are not followed; the listing is sorted by name.
pub fn list_artifacts(root: &Path) -> CotResult<Vec<ArtifactFile>> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            let source = e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("filesystem loop"));
            CotError::io(path, source)
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push(ArtifactFile::new(name, entry.path()));
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}
