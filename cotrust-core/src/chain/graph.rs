//! The decision task's task graph
//!
//! `public/task-graph.json` maps task ids to `{ "task": ..., "attributes": ... }`.
//! Only the worker type, the build platform attribute and the docker image
//! reference are used here.

use crate::config::BuildCriterion;
use crate::trust::error::{CotError, CotResult};
use crate::trust::manifest::TaskDefinition;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::debug;

/// Relative path of the task graph inside the decision task's artifacts
pub const TASK_GRAPH_PATH: &str = "public/task-graph.json";

/// One entry of the task graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphTask {
    pub task: TaskDefinition,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl GraphTask {
    pub fn build_platform(&self) -> Option<&str> {
        self.attributes
            .get("build_platform")
            .or_else(|| self.attributes.get("buildPlatform"))
            .and_then(Value::as_str)
    }

    fn matches(&self, criteria: &BTreeSet<BuildCriterion>) -> bool {
        match (self.task.worker_type(), self.build_platform()) {
            (Some(worker_type), Some(platform)) => criteria
                .iter()
                .any(|c| c.worker_type == worker_type && c.build_platform == platform),
            _ => false,
        }
    }
}

/// Tasks scheduled by a decision task, keyed by task id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskGraph {
    pub tasks: BTreeMap<String, GraphTask>,
}

impl TaskGraph {
    pub fn from_json(text: &str) -> CotResult<Self> {
        serde_json::from_str(text).map_err(|e| CotError::json("task graph", e))
    }

    pub fn load(path: &Path) -> CotResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| CotError::io(path, e))?;
        let graph = Self::from_json(&text)?;
        debug!("Loaded task graph with {} tasks from {}", graph.tasks.len(), path.display());
        Ok(graph)
    }

    pub fn get(&self, task_id: &str) -> Option<&GraphTask> {
        self.tasks.get(task_id)
    }

    /// Builds matching `criteria`, each with the image builder it references
    pub fn qualifying_builds(
        &self,
        criteria: &BTreeSet<BuildCriterion>,
    ) -> BTreeMap<String, Option<String>> {
        self.tasks
            .iter()
            .filter(|(_, entry)| entry.matches(criteria))
            .map(|(id, entry)| (id.clone(), entry.task.image_builder_task_id()))
            .collect()
    }
}

/// Qualifying builds plus the image builders they reference, deduplicated and sorted
pub fn find_dependent_builds(
    graph: &TaskGraph,
    criteria: &BTreeSet<BuildCriterion>,
) -> BTreeSet<String> {
    let mut ids = BTreeSet::new();
    for (build, builder) in graph.qualifying_builds(criteria) {
        debug!("Build {} qualifies (image builder {:?})", build, builder);
        ids.insert(build);
        ids.extend(builder);
    }
    ids
}
