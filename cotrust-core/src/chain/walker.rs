//! Chain discovery, generation and verification
//!
//! A chain starts at a decision task. Its task graph names the builds that
//! matter (by worker type and build platform) and each build names the task
//! that built its docker image. Every node gets a statement; nothing is
//! signed until every node has been built, and nothing is written until
//! every node has been signed.

use crate::chain::graph::{find_dependent_builds, TaskGraph, TASK_GRAPH_PATH};
use crate::chain::queue::{artifact_dir, TaskQueue, TaskStatus};
use crate::config::{BuildCriterion, CotConfig};
use crate::retry::{retry_async, RetryPolicy};
use crate::trust::docker::{extract_image_digest, LIVE_LOG_PATH};
use crate::trust::error::{CotError, CotResult};
use crate::trust::hasher::{digest_all, hash_bytes, list_artifacts, parse_digest, HashAlgorithm};
use crate::trust::keys::{KeyHierarchy, WorkerRole};
use crate::trust::manifest::{CotStatement, ImageBuilderRef, ManifestBuilder, StatementExtra};
use crate::trust::signer::{statement_path, SignatureFormat, SignedStatement, Signer};
use crate::trust::verifier::Verifier;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// One task in a chain with its statement
#[derive(Debug, Clone, PartialEq)]
pub struct ChainNode {
    pub task_id: String,
    pub worker_type: String,
    pub role: WorkerRole,
    pub statement: CotStatement,
    /// Task ids this node vouches for
    pub children: BTreeSet<String>,
}

/// Walks a decision task's graph into chain nodes
pub struct ChainWalker {
    hierarchy: Arc<KeyHierarchy>,
    queue: Arc<dyn TaskQueue>,
    work_dir: PathBuf,
    criteria: BTreeSet<BuildCriterion>,
    published_images: Vec<String>,
    retry: RetryPolicy,
    algorithm: HashAlgorithm,
    concurrency: usize,
}

impl ChainWalker {
    pub fn new(
        config: &CotConfig,
        hierarchy: Arc<KeyHierarchy>,
        queue: Arc<dyn TaskQueue>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        ChainWalker {
            hierarchy,
            queue,
            work_dir: work_dir.into(),
            criteria: config.build_criteria.iter().cloned().collect(),
            published_images: config.published_images.clone(),
            retry: config.retry.policy(),
            algorithm: config.hash_algorithm,
            concurrency: config.hash_concurrency.max(1),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn criteria(&self) -> &BTreeSet<BuildCriterion> {
        &self.criteria
    }

    /// The task graph published by `decision_task_id`
    pub fn load_graph(&self, decision_task_id: &str) -> CotResult<TaskGraph> {
        TaskGraph::load(&artifact_dir(&self.work_dir, decision_task_id).join(TASK_GRAPH_PATH))
    }

    /// Build a node for the decision task and every dependent build
    ///
    /// Every task must be completed before any artifact is hashed.
    pub async fn walk(&self, decision_task_id: &str, graph: &TaskGraph) -> CotResult<Vec<ChainNode>> {
        let builds = graph.qualifying_builds(&self.criteria);
        let mut order = vec![decision_task_id.to_string()];
        order.extend(
            find_dependent_builds(graph, &self.criteria)
                .into_iter()
                .filter(|id| id != decision_task_id),
        );
        info!(
            "Walking chain of trust from {} ({} dependent tasks)",
            decision_task_id,
            order.len() - 1
        );

        let mut statuses = BTreeMap::new();
        for task_id in &order {
            let status = self.fetch_status(task_id).await?;
            status.ensure_completed()?;
            statuses.insert(task_id.clone(), status);
        }

        let mut nodes = Vec::with_capacity(order.len());
        for task_id in &order {
            let children: BTreeSet<String> = if task_id == decision_task_id {
                builds.keys().cloned().collect()
            } else {
                builds.get(task_id).cloned().flatten().into_iter().collect()
            };
            let node = self
                .build_node(task_id, &statuses, children)
                .await
                .map_err(|e| e.in_task(task_id))?;
            nodes.push(node);
        }
        Ok(nodes)
    }

    /// Walk, sign every node, then write every signed statement
    pub async fn generate(
        &self,
        decision_task_id: &str,
        graph: &TaskGraph,
        signer: &Signer,
        format: SignatureFormat,
        out_dir: &Path,
    ) -> CotResult<Vec<PathBuf>> {
        let nodes = self.walk(decision_task_id, graph).await?;

        let mut signed = Vec::with_capacity(nodes.len());
        for node in &nodes {
            signed.push(signer.sign(&node.statement, &node.worker_type, format).await?);
        }
        info!("Signed {} statements", signed.len());

        signed
            .iter()
            .map(|statement| signer.write(statement, out_dir))
            .collect()
    }

    /// Verify a whole chain from its signed statements in `cot_dir`
    ///
    /// The task graph is trusted only once the decision statement vouching
    /// for it is accepted. Every statement for a task in that graph must sign
    /// the task definition the graph holds. Returns the accepted statements,
    /// decision first.
    pub async fn verify_chain(
        &self,
        decision_task_id: &str,
        verifier: &Verifier,
        cot_dir: &Path,
    ) -> CotResult<Vec<CotStatement>> {
        let decision = self.verify_node(decision_task_id, verifier, cot_dir).await?;
        let worker_type = decision.worker_type().unwrap_or_default();
        if self.hierarchy.role_for_worker_type(worker_type) != WorkerRole::Decision {
            return Err(CotError::TaskGraph {
                task_id: decision_task_id.to_string(),
                message: format!("worker type '{worker_type}' is not a decision worker type"),
            });
        }
        let graph = self
            .load_attested_graph(&decision)
            .map_err(|e| e.in_task(decision_task_id))?;

        let ids = find_dependent_builds(&graph, &self.criteria);
        let mut accepted = BTreeMap::new();
        for task_id in ids.iter().filter(|id| id.as_str() != decision_task_id) {
            let statement = self.verify_node(task_id, verifier, cot_dir).await?;
            check_against_graph(task_id, &statement, &graph)?;
            accepted.insert(task_id.clone(), statement);
        }

        for (task_id, statement) in &accepted {
            self.check_builder_link(task_id, statement, &accepted)?;
        }

        info!(
            "Chain of trust from {} verified ({} statements)",
            decision_task_id,
            accepted.len() + 1
        );
        let mut chain = vec![decision];
        chain.extend(accepted.into_values());
        Ok(chain)
    }

    async fn fetch_status(&self, task_id: &str) -> CotResult<TaskStatus> {
        retry_async(&self.retry, &format!("status of {task_id}"), || {
            self.queue.status(task_id)
        })
        .await
    }

    async fn build_node(
        &self,
        task_id: &str,
        statuses: &BTreeMap<String, TaskStatus>,
        children: BTreeSet<String>,
    ) -> CotResult<ChainNode> {
        let run = match statuses.get(task_id) {
            Some(status) => status.ensure_completed()?.clone(),
            None => self.fetch_status(task_id).await?.ensure_completed()?.clone(),
        };
        let task = retry_async(&self.retry, &format!("definition of {task_id}"), || {
            self.queue.task(task_id)
        })
        .await?;
        let worker_type = task
            .worker_type()
            .ok_or_else(|| CotError::TaskGraph {
                task_id: task_id.to_string(),
                message: "task definition has no workerType".to_string(),
            })?
            .to_string();
        let role = self.hierarchy.role_for_worker_type(&worker_type);

        let root = artifact_dir(&self.work_dir, task_id);
        let files = if root.is_dir() {
            list_artifacts(&root)?
        } else {
            debug!("Task {} has no artifact directory", task_id);
            Vec::new()
        };
        let digests = digest_all(&files, self.algorithm, self.concurrency).await?;

        let mut extra = StatementExtra::default();
        if let Some(image) = task.image() {
            let digest = extract_image_digest(
                task_id,
                &root.join(LIVE_LOG_PATH),
                &image,
                &self.published_images,
            )
            .await?;
            extra.docker_image_digest = Some(digest);
        }
        match (role, task.image_builder_task_id()) {
            (WorkerRole::Decision, _) => {}
            (_, Some(builder)) => {
                let run_id = match statuses.get(&builder) {
                    Some(status) => status.ensure_completed()?.run_id,
                    None => self.fetch_status(&builder).await?.ensure_completed()?.run_id,
                };
                extra.docker_image_builder = Some(ImageBuilderRef {
                    task_id: builder,
                    run_id,
                });
            }
            // An image builder running a published image is its own link.
            (WorkerRole::DockerImageBuilder, None) => {
                extra.docker_image_builder = Some(ImageBuilderRef {
                    task_id: task_id.to_string(),
                    run_id: run.run_id,
                });
            }
            (WorkerRole::Build, None) => {}
        }

        let statement = ManifestBuilder::new(&self.hierarchy).build(
            task_id,
            run.run_id,
            &run.worker_group,
            &run.worker_id,
            task,
            digests,
            extra,
        )?;
        debug!(
            "Node {} ({}, {}) vouches for {:?}",
            task_id, worker_type, role, children
        );

        Ok(ChainNode {
            task_id: task_id.to_string(),
            worker_type,
            role,
            statement,
            children,
        })
    }

    async fn verify_node(
        &self,
        task_id: &str,
        verifier: &Verifier,
        cot_dir: &Path,
    ) -> CotResult<CotStatement> {
        self.verify_statement_file(task_id, verifier, cot_dir)
            .await
            .map_err(|e| e.in_task(task_id))
    }

    async fn verify_statement_file(
        &self,
        task_id: &str,
        verifier: &Verifier,
        cot_dir: &Path,
    ) -> CotResult<CotStatement> {
        let path = statement_path(cot_dir, task_id);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CotError::MissingSignature {
                    source_name: path.display().to_string(),
                });
            }
            Err(e) => return Err(CotError::io(&path, e)),
        };
        let signed = SignedStatement::parse(&path.display().to_string(), &text)?;
        let statement = verifier
            .verify_signed(&signed, &artifact_dir(&self.work_dir, task_id))
            .await?;
        if statement.task_id != task_id {
            return Err(CotError::malformed(format!(
                "{} holds the statement for task {}",
                path.display(),
                statement.task_id
            )));
        }
        Ok(statement)
    }

    // Re-hash the graph bytes actually parsed so they are the attested ones.
    fn load_attested_graph(&self, decision: &CotStatement) -> CotResult<TaskGraph> {
        let artifact = decision.artifact(TASK_GRAPH_PATH).ok_or_else(|| {
            CotError::malformed(format!(
                "decision statement {} does not cover {}",
                decision.task_id, TASK_GRAPH_PATH
            ))
        })?;
        let (algorithm, _) = parse_digest(&artifact.digest)
            .ok_or_else(|| CotError::malformed(format!("bad digest for {TASK_GRAPH_PATH}")))?;

        let path = artifact_dir(&self.work_dir, &decision.task_id).join(TASK_GRAPH_PATH);
        let bytes = std::fs::read(&path).map_err(|e| CotError::io(&path, e))?;
        let actual = hash_bytes(&bytes, algorithm);
        if actual != artifact.digest {
            let err = CotError::HashMismatch {
                task_id: decision.task_id.clone(),
                name: TASK_GRAPH_PATH.to_string(),
                expected: artifact.digest.clone(),
                actual,
            };
            err.log_if_security_critical();
            return Err(err);
        }
        let text = String::from_utf8(bytes)
            .map_err(|e| CotError::malformed(format!("task graph is not UTF-8: {e}")))?;
        TaskGraph::from_json(&text)
    }

    // The linked builder must be a verified image builder at the linked run.
    // Only an image builder running a published image may link to itself.
    fn check_builder_link(
        &self,
        task_id: &str,
        statement: &CotStatement,
        accepted: &BTreeMap<String, CotStatement>,
    ) -> CotResult<()> {
        let Some(link) = &statement.extra.docker_image_builder else {
            return Ok(());
        };
        let role = self
            .hierarchy
            .role_for_worker_type(statement.worker_type().unwrap_or_default());
        let declared = statement.task.image_builder_task_id();

        if link.task_id == task_id {
            if role != WorkerRole::DockerImageBuilder || declared.is_some() {
                return Err(CotError::TaskGraph {
                    task_id: task_id.to_string(),
                    message: format!("a {role} task cannot be its own image builder"),
                });
            }
            if link.run_id != statement.run_id {
                return Err(CotError::TaskGraph {
                    task_id: task_id.to_string(),
                    message: format!(
                        "links its own run {} but attests run {}",
                        link.run_id, statement.run_id
                    ),
                });
            }
            return Ok(());
        }

        if declared.as_deref() != Some(link.task_id.as_str()) {
            return Err(CotError::malformed(format!(
                "task {task_id} links image builder {} but its payload names {:?}",
                link.task_id, declared
            ))
            .in_task(task_id));
        }
        let Some(builder) = accepted.get(&link.task_id) else {
            return Err(CotError::TaskGraph {
                task_id: task_id.to_string(),
                message: format!("image builder {} is not part of the verified chain", link.task_id),
            });
        };
        if builder.run_id != link.run_id {
            return Err(CotError::TaskGraph {
                task_id: task_id.to_string(),
                message: format!(
                    "links run {} of image builder {}, but run {} was verified",
                    link.run_id, link.task_id, builder.run_id
                ),
            });
        }
        let builder_role = self
            .hierarchy
            .role_for_worker_type(builder.worker_type().unwrap_or_default());
        if builder_role != WorkerRole::DockerImageBuilder {
            return Err(CotError::TaskGraph {
                task_id: task_id.to_string(),
                message: format!(
                    "image builder {} attests as a {builder_role} task",
                    link.task_id
                ),
            });
        }
        Ok(())
    }
}

fn check_against_graph(task_id: &str, statement: &CotStatement, graph: &TaskGraph) -> CotResult<()> {
    match graph.get(task_id) {
        Some(entry) if entry.task != statement.task => Err(CotError::TaskGraph {
            task_id: task_id.to_string(),
            message: "signed task definition differs from the attested task graph".to_string(),
        }),
        _ => Ok(()),
    }
}
