//! Chain-of-trust statements and their canonical text form
//!
//! A statement is only ever signed or hashed in its canonical form: object
//! keys sorted at every depth, two-space indentation, `": "` between key and
//! value, non-ASCII escaped as `\uXXXX`, no trailing newline. This is the
//! same text `json.dumps(obj, indent=2, sort_keys=True)` produces, so
//! statements from other producers verify byte for byte.

use crate::trust::docker::ImageReference;
use crate::trust::error::{CotError, CotResult};
use crate::trust::hasher::parse_digest;
use crate::trust::keys::{KeyHierarchy, WorkerRole};
use serde::{Deserialize, Serialize};
use serde_json::ser::{Formatter, PrettyFormatter};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io;
use tracing::debug;

/// One digested output file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Path relative to the task's artifact root
    pub name: String,
    /// `<algorithm>:<hex>`
    pub digest: String,
}

/// Snapshot of a task definition as returned by the queue
///
/// Kept opaque; only the fields the chain needs have accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskDefinition(pub Value);

impl TaskDefinition {
    pub fn worker_type(&self) -> Option<&str> {
        self.0.get("workerType").and_then(Value::as_str)
    }

    pub fn payload(&self) -> Option<&Value> {
        self.0.get("payload")
    }

    /// Docker image the task ran in, from `payload.image`
    pub fn image(&self) -> Option<ImageReference> {
        ImageReference::from_payload_value(self.payload()?.get("image")?)
    }

    /// Task id of the upstream image builder, if the image is task-built
    pub fn image_builder_task_id(&self) -> Option<String> {
        match self.image()? {
            ImageReference::Task { task_id, .. } => Some(task_id),
            ImageReference::Published(_) => None,
        }
    }
}

/// Reference to the docker-image-builder task a statement depends on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageBuilderRef {
    pub task_id: String,
    pub run_id: u32,
}

/// Auxiliary attestations carried next to the artifacts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementExtra {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image_builder: Option<ImageBuilderRef>,

    /// Image digest scraped from the task log; an unverified signal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image_digest: Option<String>,

    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

/// The trust statement for one task run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CotStatement {
    pub task_id: String,
    pub run_id: u32,
    pub worker_group: String,
    pub worker_id: String,
    pub task: TaskDefinition,
    /// Sorted by name
    pub artifacts: Vec<Artifact>,
    pub extra: StatementExtra,
}

impl CotStatement {
    /// Canonical text of this statement
    pub fn canonical_text(&self) -> CotResult<String> {
        canonical_json(self)
    }

    /// Parse a payload, insisting that it is already in canonical form
    pub fn from_canonical(payload: &str) -> CotResult<Self> {
        let statement: CotStatement = serde_json::from_str(payload)
            .map_err(|e| CotError::malformed(format!("payload is not a statement: {e}")))?;
        if statement.canonical_text()? != payload {
            return Err(CotError::malformed(format!(
                "payload for task {} is not in canonical form",
                statement.task_id
            )));
        }
        Ok(statement)
    }

    pub fn worker_type(&self) -> Option<&str> {
        self.task.worker_type()
    }

    pub fn artifact(&self, name: &str) -> Option<&Artifact> {
        self.artifacts
            .binary_search_by(|a| a.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.artifacts[i])
    }

    /// Check the structural invariants for a task of `role`
    pub fn validate(&self, role: WorkerRole) -> CotResult<()> {
        if self.task_id.is_empty() {
            return Err(CotError::malformed("empty taskId"));
        }
        if self.worker_type().is_none() {
            return Err(CotError::malformed(format!(
                "task {} has no task.workerType",
                self.task_id
            )));
        }
        for pair in self.artifacts.windows(2) {
            if pair[0].name >= pair[1].name {
                return Err(CotError::malformed(format!(
                    "artifacts of task {} are not sorted and unique at '{}'",
                    self.task_id, pair[1].name
                )));
            }
        }
        if let Some(bad) = self.artifacts.iter().find(|a| parse_digest(&a.digest).is_none()) {
            return Err(CotError::malformed(format!(
                "artifact '{}' has an unrecognised digest '{}'",
                bad.name, bad.digest
            )));
        }

        let has_builder = self.extra.docker_image_builder.is_some();
        match role {
            WorkerRole::Decision if has_builder => Err(CotError::malformed(format!(
                "decision task {} must not reference an image builder",
                self.task_id
            ))),
            WorkerRole::Build | WorkerRole::DockerImageBuilder if !has_builder => {
                Err(CotError::malformed(format!(
                    "{} task {} does not reference its docker image builder",
                    role, self.task_id
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Assembles statements from task metadata and digests
pub struct ManifestBuilder<'a> {
    hierarchy: &'a KeyHierarchy,
}

impl<'a> ManifestBuilder<'a> {
    pub fn new(hierarchy: &'a KeyHierarchy) -> Self {
        ManifestBuilder { hierarchy }
    }

    /// Build a statement; artifacts come out sorted by name
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        &self,
        task_id: &str,
        run_id: u32,
        worker_group: &str,
        worker_id: &str,
        task: TaskDefinition,
        digests: BTreeMap<String, String>,
        extra: StatementExtra,
    ) -> CotResult<CotStatement> {
        let worker_type = task
            .worker_type()
            .ok_or_else(|| CotError::malformed(format!("task {task_id} has no workerType")))?
            .to_string();
        let role = self.hierarchy.role_for_worker_type(&worker_type);

        // BTreeMap iteration is already name-ordered.
        let artifacts = digests
            .into_iter()
            .map(|(name, digest)| Artifact { name, digest })
            .collect();

        let statement = CotStatement {
            task_id: task_id.to_string(),
            run_id,
            worker_group: worker_group.to_string(),
            worker_id: worker_id.to_string(),
            task,
            artifacts,
            extra,
        };
        statement.validate(role)?;

        debug!(
            "Built statement for {} ({} as {}): {} artifacts",
            task_id,
            worker_type,
            role,
            statement.artifacts.len()
        );
        Ok(statement)
    }
}

/// Serialize any value in canonical form
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> CotResult<String> {
    let value = serde_json::to_value(value).map_err(|e| CotError::json("statement", e))?;
    let sorted = sort_keys(value);

    let mut out = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, CanonicalFormatter::new());
    sorted
        .serialize(&mut serializer)
        .map_err(|e| CotError::json("statement", e))?;
    String::from_utf8(out).map_err(|e| CotError::malformed(format!("non UTF-8 output: {e}")))
}

// Rebuild objects in key order so the output is sorted even when serde_json
// keeps insertion order.
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> =
                map.into_iter().map(|(k, v)| (k, sort_keys(v))).collect();
            Value::Object(sorted.into_iter().collect::<Map<String, Value>>())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// Two-space pretty printer that escapes everything outside printable ASCII
struct CanonicalFormatter<'a> {
    pretty: PrettyFormatter<'a>,
}

impl<'a> CanonicalFormatter<'a> {
    fn new() -> Self {
        CanonicalFormatter {
            pretty: PrettyFormatter::with_indent(b"  "),
        }
    }
}

impl Formatter for CanonicalFormatter<'_> {
    fn begin_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.pretty.begin_array(writer)
    }

    fn end_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.pretty.end_array(writer)
    }

    fn begin_array_value<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        self.pretty.begin_array_value(writer, first)
    }

    fn end_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.pretty.end_array_value(writer)
    }

    fn begin_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.pretty.begin_object(writer)
    }

    fn end_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.pretty.end_object(writer)
    }

    fn begin_object_key<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        self.pretty.begin_object_key(writer, first)
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.pretty.begin_object_value(writer)
    }

    fn end_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.pretty.end_object_value(writer)
    }

    fn write_string_fragment<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        fragment: &str,
    ) -> io::Result<()> {
        for c in fragment.chars() {
            if c.is_ascii() && c != '\x7f' {
                writer.write_all(&[c as u8])?;
            } else {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    write!(writer, "\\u{:04x}", unit)?;
                }
            }
        }
        Ok(())
    }
}
