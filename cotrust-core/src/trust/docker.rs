//! Docker image digest recovery from task logs
//!
//! Workers do not report the digest of the image a task ran in, so it is
//! scraped from the task's live log. The image reference decides which line
//! format is accepted:
//!
//! - a published image on the allow-list: the registry pull line
//!   `Digest: sha256:<hex>`
//! - an image built by another task: the worker's load confirmation naming
//!   that task and image path, ending in `Using image ID sha256:<hex>.`
//!
//! Anything else is refused. The result is recorded in the statement as an
//! unverified signal; the chain link to the image-builder task is what the
//! verifier actually checks.

use crate::trust::error::{CotError, CotResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::path::Path;
use tokio::io::AsyncBufReadExt;
use tracing::{debug, warn};

/// Relative path of a task's live log inside its artifact directory
pub const LIVE_LOG_PATH: &str = "public/logs/live.log";

static REGISTRY_DIGEST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Digest: (sha256:[0-9a-f]+)$").expect("registry digest regex is valid")
});

/// Where a task's docker image came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageReference {
    /// A registry image referenced by name, e.g. `taskcluster/decision:0.1.0`
    Published(String),
    /// An image artifact produced by another task
    Task { path: String, task_id: String },
}

impl ImageReference {
    /// Interpret a task payload's `image` value
    pub fn from_payload_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(name) => Some(ImageReference::Published(name.clone())),
            Value::Object(map) => {
                if let (Some(path), Some(task_id)) = (
                    map.get("path").and_then(Value::as_str),
                    map.get("taskId").and_then(Value::as_str),
                ) {
                    return Some(ImageReference::Task {
                        path: path.to_string(),
                        task_id: task_id.to_string(),
                    });
                }
                map.get("name")
                    .and_then(Value::as_str)
                    .map(|name| ImageReference::Published(name.to_string()))
            }
            _ => None,
        }
    }
}

/// Line pattern accepted for a given image
#[derive(Debug)]
pub enum DigestPattern {
    Registry,
    LoadConfirmation(Regex),
}

impl DigestPattern {
    /// Pick the pattern for `image`, or `None` if the image may not be trusted at all
    pub fn for_image(image: &ImageReference, published_images: &[String]) -> Option<Self> {
        match image {
            ImageReference::Published(name) => {
                if published_images.iter().any(|p| p == name) {
                    Some(DigestPattern::Registry)
                } else {
                    None
                }
            }
            ImageReference::Task { path, task_id } => {
                let pattern = format!(
                    r"^\[taskcluster [-0-9:Z. ]+\] Image '{}' from task '{}' loaded\.  Using image ID (sha256:[0-9a-f]+)\.$",
                    regex::escape(path),
                    regex::escape(task_id)
                );
                // Both inputs are escaped, so the pattern always compiles.
                Regex::new(&pattern).ok().map(DigestPattern::LoadConfirmation)
            }
        }
    }

    fn regex(&self) -> &Regex {
        match self {
            DigestPattern::Registry => &REGISTRY_DIGEST,
            DigestPattern::LoadConfirmation(re) => re,
        }
    }

    /// Digest captured from `line`, if it matches
    pub fn capture(&self, line: &str) -> Option<String> {
        self.regex()
            .captures(line.trim_end_matches(['\r', '\n']))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }
}

/// First digest in `log` matching `pattern`
pub fn find_image_digest(log: &str, pattern: &DigestPattern) -> Option<String> {
    log.lines().find_map(|line| pattern.capture(line))
}

/// Scan a task's live log for the digest of the image it ran in
pub async fn extract_image_digest(
    task_id: &str,
    log_path: &Path,
    image: &ImageReference,
    published_images: &[String],
) -> CotResult<String> {
    let not_found = || CotError::ImageDigestNotFound {
        task_id: task_id.to_string(),
        log_path: log_path.to_path_buf(),
    };

    let Some(pattern) = DigestPattern::for_image(image, published_images) else {
        warn!(
            "Task {} runs in image {:?}, which is neither task-built nor an allowed published image",
            task_id, image
        );
        return Err(not_found());
    };

    let file = match tokio::fs::File::open(log_path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
        Err(e) => return Err(CotError::io(log_path, e)),
    };
    let mut lines = tokio::io::BufReader::new(file).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| CotError::io(log_path, e))?
    {
        if let Some(digest) = pattern.capture(&line) {
            debug!("Task {} image digest {}", task_id, digest);
            return Ok(digest);
        }
    }
    Err(not_found())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const HEX: &str = "4a1b2c3d4e5f60718293a4b5c6d7e8f90a1b2c3d4e5f60718293a4b5c6d7e8f9";

    fn published() -> Vec<String> {
        vec!["taskcluster/decision:0.1.0".to_string()]
    }

    fn task_image() -> ImageReference {
        ImageReference::Task {
            path: "public/image.tar".to_string(),
            task_id: "BZpO3hsUQvyXH6On1wnfRw".to_string(),
        }
    }

    #[test]
    fn test_image_reference_from_payload() {
        assert_eq!(
            ImageReference::from_payload_value(&json!("taskcluster/decision:0.1.0")),
            Some(ImageReference::Published("taskcluster/decision:0.1.0".to_string()))
        );
        assert_eq!(
            ImageReference::from_payload_value(&json!({
                "path": "public/image.tar", "taskId": "BZpO3hsUQvyXH6On1wnfRw", "type": "task-image"
            })),
            Some(task_image())
        );
        assert_eq!(
            ImageReference::from_payload_value(&json!({"name": "ubuntu:16.04", "type": "docker-image"})),
            Some(ImageReference::Published("ubuntu:16.04".to_string()))
        );
        assert_eq!(ImageReference::from_payload_value(&json!(42)), None);
    }

    #[test]
    fn test_registry_digest_line() {
        let log = format!(
            "[taskcluster 2016-11-01 00:00:00.000Z] Pulling image\nStatus: Downloaded\nDigest: sha256:{HEX}\nmore output\n"
        );
        let pattern = DigestPattern::for_image(
            &ImageReference::Published("taskcluster/decision:0.1.0".to_string()),
            &published(),
        )
        .unwrap();
        assert_eq!(find_image_digest(&log, &pattern), Some(format!("sha256:{HEX}")));
    }

    #[test]
    fn test_registry_digest_must_start_line() {
        let log = format!("prefix Digest: sha256:{HEX}\n");
        let pattern = DigestPattern::Registry;
        assert_eq!(find_image_digest(&log, &pattern), None);
    }

    #[test]
    fn test_load_confirmation_line() {
        let log = format!(
            "[taskcluster 2016-11-01 18:29:04.592Z] Image 'public/image.tar' from task 'BZpO3hsUQvyXH6On1wnfRw' loaded.  Using image ID sha256:{HEX}.\r\n"
        );
        let pattern = DigestPattern::for_image(&task_image(), &published()).unwrap();
        assert_eq!(find_image_digest(&log, &pattern), Some(format!("sha256:{HEX}")));
    }

    #[test]
    fn test_load_confirmation_escapes_path() {
        // A '.' in the path must not match arbitrary characters.
        let log = format!(
            "[taskcluster 2016-11-01 18:29:04.592Z] Image 'public/imageXtar' from task 'BZpO3hsUQvyXH6On1wnfRw' loaded.  Using image ID sha256:{HEX}.\n"
        );
        let pattern = DigestPattern::for_image(&task_image(), &published()).unwrap();
        assert_eq!(find_image_digest(&log, &pattern), None);
    }

    #[test]
    fn test_load_confirmation_ignores_other_tasks() {
        let log = format!(
            "[taskcluster 2016-11-01 18:29:04.592Z] Image 'public/image.tar' from task 'SomeOtherTask' loaded.  Using image ID sha256:{HEX}.\n"
        );
        let pattern = DigestPattern::for_image(&task_image(), &published()).unwrap();
        assert_eq!(find_image_digest(&log, &pattern), None);
    }

    #[test]
    fn test_unlisted_published_image_is_refused() {
        let image = ImageReference::Published("evil/image:latest".to_string());
        assert!(DigestPattern::for_image(&image, &published()).is_none());
    }

    #[tokio::test]
    async fn test_extract_image_digest_from_file() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("live.log");
        std::fs::write(&log_path, format!("noise\nDigest: sha256:{HEX}\n")).unwrap();

        let digest = extract_image_digest(
            "T1",
            &log_path,
            &ImageReference::Published("taskcluster/decision:0.1.0".to_string()),
            &published(),
        )
        .await
        .unwrap();
        assert_eq!(digest, format!("sha256:{HEX}"));
    }

    #[tokio::test]
    async fn test_extract_image_digest_not_found() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("live.log");
        std::fs::write(&log_path, "nothing useful\n").unwrap();

        let result = extract_image_digest("T1", &log_path, &task_image(), &published()).await;
        assert!(matches!(result, Err(CotError::ImageDigestNotFound { .. })));

        let missing = dir.path().join("absent.log");
        let result = extract_image_digest("T1", &missing, &task_image(), &published()).await;
        assert!(matches!(result, Err(CotError::ImageDigestNotFound { .. })));
    }
}
