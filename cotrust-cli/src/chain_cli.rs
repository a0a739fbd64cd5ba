//! Chain-of-trust CLI commands
//!
//! generate, verify, verify-file, keys

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

use cotrust_core::chain::{ChainWalker, DirectoryQueue};
use cotrust_core::config::CotConfig;
use cotrust_core::trust::{
    GpgEngine, KeyHierarchy, SignatureEngine, SignatureFormat, Signer, TrustStore, Verifier,
};

#[derive(Parser, Debug)]
pub enum ChainCommand {
    /// Build, sign and write statements for a decision task and its builds
    Generate {
        /// Decision task id
        #[clap(long)]
        decision_task: String,

        /// Work directory populated by the downloader
        #[clap(long, default_value = ".")]
        work_dir: PathBuf,

        /// Where to write signed statements (default: <work-dir>/<output_dir>)
        #[clap(long)]
        out_dir: Option<PathBuf>,

        /// Signature layout (overrides the configuration)
        #[clap(long)]
        format: Option<SignatureFormat>,
    },

    /// Verify a whole chain from its signed statements
    Verify {
        /// Decision task id
        #[clap(long)]
        decision_task: String,

        /// Work directory holding each task's artifacts
        #[clap(long, default_value = ".")]
        work_dir: PathBuf,

        /// Directory of signed statements (default: <work-dir>/<output_dir>)
        #[clap(long)]
        cot_dir: Option<PathBuf>,
    },

    /// Verify a single signed statement file
    VerifyFile {
        /// Signed statement (.asc)
        file: PathBuf,

        /// Directory holding the task's artifacts
        #[clap(long)]
        artifacts: PathBuf,

        /// Print the report as JSON
        #[clap(long)]
        json: bool,
    },

    /// List trust store keys and worker type bindings
    Keys,
}

impl ChainCommand {
    pub async fn execute(self, config_path: Option<&Path>) -> Result<()> {
        let config = CotConfig::discover(config_path).context("Failed to load configuration")?;
        match self {
            ChainCommand::Generate {
                decision_task,
                work_dir,
                out_dir,
                format,
            } => generate(&config, &decision_task, &work_dir, out_dir, format).await,
            ChainCommand::Verify {
                decision_task,
                work_dir,
                cot_dir,
            } => verify(&config, &decision_task, &work_dir, cot_dir).await,
            ChainCommand::VerifyFile {
                file,
                artifacts,
                json,
            } => verify_file(&config, &file, &artifacts, json).await,
            ChainCommand::Keys => list_keys(&config),
        }
    }
}

fn load_hierarchy(config: &CotConfig) -> Result<Arc<KeyHierarchy>> {
    let path = config
        .trust_store
        .as_ref()
        .context("No trust_store configured")?;
    let store = TrustStore::load(path)
        .with_context(|| format!("Failed to load trust store {}", path.display()))?;
    Ok(Arc::new(KeyHierarchy::new(
        Arc::new(store),
        config.worker_keys.clone(),
        config.worker_roles.clone(),
    )))
}

fn engine(config: &CotConfig) -> Arc<dyn SignatureEngine> {
    Arc::new(
        GpgEngine::new(&config.gpg_binary, config.key_store.clone())
            .with_timeout(Duration::from_secs(config.engine_timeout_seconds)),
    )
}

fn default_cot_dir(config: &CotConfig, work_dir: &Path) -> PathBuf {
    if config.output_dir.is_absolute() {
        config.output_dir.clone()
    } else {
        work_dir.join(&config.output_dir)
    }
}

fn walker(config: &CotConfig, hierarchy: Arc<KeyHierarchy>, work_dir: &Path) -> ChainWalker {
    ChainWalker::new(
        config,
        hierarchy,
        Arc::new(DirectoryQueue::new(work_dir)),
        work_dir,
    )
}

async fn generate(
    config: &CotConfig,
    decision_task: &str,
    work_dir: &Path,
    out_dir: Option<PathBuf>,
    format: Option<SignatureFormat>,
) -> Result<()> {
    if !config.credentials.is_complete() {
        tracing::debug!("No queue credentials in the environment");
    }
    let hierarchy = load_hierarchy(config)?;
    let walker = walker(config, hierarchy.clone(), work_dir);
    let graph = walker
        .load_graph(decision_task)
        .with_context(|| format!("Failed to load task graph of {decision_task}"))?;
    let signer = Signer::new(hierarchy, engine(config));
    let out_dir = out_dir.unwrap_or_else(|| default_cot_dir(config, work_dir));

    let paths = walker
        .generate(
            decision_task,
            &graph,
            &signer,
            format.unwrap_or(config.signature_format),
            &out_dir,
        )
        .await?;

    println!("✅ Wrote {} signed statements:", paths.len());
    for path in paths {
        println!("  {}", path.display());
    }
    Ok(())
}

#[derive(Tabled)]
struct StatementRow {
    #[tabled(rename = "Task")]
    task_id: String,
    #[tabled(rename = "Run")]
    run_id: u32,
    #[tabled(rename = "Worker Type")]
    worker_type: String,
    #[tabled(rename = "Artifacts")]
    artifacts: usize,
    #[tabled(rename = "Image Builder")]
    image_builder: String,
}

async fn verify(
    config: &CotConfig,
    decision_task: &str,
    work_dir: &Path,
    cot_dir: Option<PathBuf>,
) -> Result<()> {
    let hierarchy = load_hierarchy(config)?;
    let verifier =
        Verifier::new(hierarchy.clone(), engine(config)).with_concurrency(config.hash_concurrency);
    let cot_dir = cot_dir.unwrap_or_else(|| default_cot_dir(config, work_dir));

    let chain = walker(config, hierarchy, work_dir)
        .verify_chain(decision_task, &verifier, &cot_dir)
        .await?;

    let rows: Vec<StatementRow> = chain
        .iter()
        .map(|s| StatementRow {
            task_id: s.task_id.clone(),
            run_id: s.run_id,
            worker_type: s.worker_type().unwrap_or("-").to_string(),
            artifacts: s.artifacts.len(),
            image_builder: s
                .extra
                .docker_image_builder
                .as_ref()
                .map_or_else(|| "-".to_string(), |b| format!("{} (run {})", b.task_id, b.run_id)),
        })
        .collect();
    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()))
        .to_string();

    println!("{table}");
    println!("✅ Chain of trust from {decision_task} verified");
    Ok(())
}

async fn verify_file(config: &CotConfig, file: &Path, artifacts: &Path, json: bool) -> Result<()> {
    let hierarchy = load_hierarchy(config)?;
    let verifier =
        Verifier::new(hierarchy, engine(config)).with_concurrency(config.hash_concurrency);
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let report = verifier
        .verify_text(&file.display().to_string(), &text, artifacts)
        .await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if report.accepted {
        println!(
            "✅ {} accepted (signer {})",
            file.display(),
            report.signer_key_id.as_deref().unwrap_or("-")
        );
    } else {
        println!(
            "❌ {} rejected after {:?}: {}",
            file.display(),
            report.reached,
            report.detail.as_deref().unwrap_or("")
        );
    }

    if !report.accepted {
        anyhow::bail!(
            "{} was rejected ({})",
            file.display(),
            report.reason.map_or("unknown", |k| k.as_str())
        );
    }
    Ok(())
}

#[derive(Tabled)]
struct KeyRow {
    #[tabled(rename = "Fingerprint")]
    fingerprint: String,
    #[tabled(rename = "Identities")]
    identities: String,
    #[tabled(rename = "Role")]
    role: String,
    #[tabled(rename = "Trust")]
    trust: String,
    #[tabled(rename = "Authorizes")]
    authorizes: String,
}

#[derive(Tabled)]
struct BindingRow {
    #[tabled(rename = "Worker Type")]
    worker_type: String,
    #[tabled(rename = "Role")]
    role: String,
    #[tabled(rename = "Key")]
    key: String,
}

fn list_keys(config: &CotConfig) -> Result<()> {
    let hierarchy = load_hierarchy(config)?;

    let keys: Vec<KeyRow> = hierarchy
        .store()
        .keys()
        .map(|k| KeyRow {
            fingerprint: k.fingerprint.clone(),
            identities: k.identities.join(", "),
            role: format!("{:?}", k.role),
            trust: k.trust.to_string(),
            authorizes: k
                .authorizes
                .iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        })
        .collect();
    println!("{}", Table::new(&keys).with(Style::rounded()));

    let bindings: Vec<BindingRow> = hierarchy
        .worker_keys()
        .keys()
        .map(|worker_type| BindingRow {
            worker_type: worker_type.clone(),
            role: hierarchy.role_for_worker_type(worker_type).to_string(),
            key: match hierarchy.resolve_signing_key(worker_type) {
                Ok(fpr) => fpr,
                Err(e) => format!("⚠️  {e}"),
            },
        })
        .collect();
    println!("{}", Table::new(&bindings).with(Style::rounded()));
    Ok(())
}
