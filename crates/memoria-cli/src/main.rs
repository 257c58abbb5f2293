mod input;
mod review;

use clap::{Parser, Subcommand};
use memoria_core::{MemoriaConfig, MemoriaError, ReviewDecision};
use memoria_memory::{
    negotiate_embedder, CancellationToken, HybridRetriever, IngestionPipeline, RetentionPolicy,
    RetrievalWeights, SearchRequest, SimilarityIndex, Store,
};
use memoria_proposals::{Issue, MaintenanceExecutor, ProposalEngine, ProposalStatus};
use review::StdinReviewChannel;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "memoria", about = "Semantic memory engine with reviewed self-maintenance")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "memoria.toml")]
    config: PathBuf,

    /// Store directory (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest plain-text or .jsonl files
    Ingest {
        /// Files to ingest
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Source type for plain-text files and lines without one
        #[arg(long, default_value = "report")]
        source_type: String,
    },
    /// Run a hybrid search
    Query {
        /// Query text
        text: String,
        /// Number of results
        #[arg(short, long)]
        k: Option<usize>,
        /// Weight of vector similarity (overrides config)
        #[arg(long)]
        vector_weight: Option<f32>,
        /// Weight of lexical relevance (overrides config)
        #[arg(long)]
        lexical_weight: Option<f32>,
        /// Only consider documents of this source type
        #[arg(long)]
        source_type: Option<String>,
    },
    /// Verify the indexes against the store and rebuild on divergence
    Rebuild {
        /// Rebuild even if the indexes look healthy
        #[arg(long)]
        force: bool,
    },
    /// Remove documents past their retention age
    Prune {
        /// Maximum document age in days
        #[arg(long)]
        max_age_days: i64,
        /// Restrict to these source types (repeatable)
        #[arg(long = "source-type")]
        source_types: Vec<String>,
    },
    /// Re-encode vectors written by another embedder version
    Reencode,
    /// Raise an issue from a JSON file and run the resulting proposal
    Issue {
        /// Issue JSON file
        file: PathBuf,
        /// Prompt for review on the terminal when approval is needed
        #[arg(long)]
        interactive: bool,
    },
    /// Record a reviewer decision for a pending proposal
    Review {
        /// Proposal id
        id: Uuid,
        /// Approve the proposal
        #[arg(long, conflicts_with = "reject")]
        approve: bool,
        /// Reject with a reason
        #[arg(long)]
        reject: Option<String>,
    },
    /// Restore the pre snapshot of a failed proposal
    Rollback {
        /// Proposal id
        id: Uuid,
    },
    /// Show store, index and proposal status
    Status,
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli.config).await?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    let code = match run(cli.command, config).await {
        Ok(code) => code,
        Err(e) => {
            let code = exit_code_for(&e);
            error!(error = %format!("{e:#}"), exit_code = code, "Command failed");
            eprintln!("Error: {e:#}");
            code
        }
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

/// Exit code for fatal persistence errors; nothing was committed.
const EXIT_FATAL: i32 = 2;

/// The store could not be opened or its layout is unusable.
#[derive(Debug, thiserror::Error)]
#[error("Failed to open store at '{}'", path.display())]
struct StoreOpenError {
    path: PathBuf,
    #[source]
    source: MemoriaError,
}

/// `2` for anything that failed at the persistence layer, `1` otherwise.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    let fatal = err.chain().any(|cause| {
        cause.is::<StoreOpenError>()
            || matches!(
                cause.downcast_ref::<MemoriaError>(),
                Some(MemoriaError::PersistenceWrite(_) | MemoriaError::PersistenceRead(_))
            )
    });
    if fatal {
        EXIT_FATAL
    } else {
        1
    }
}

/// Read `path`, or fall back to defaults when it does not exist.
async fn load_config(path: &Path) -> anyhow::Result<MemoriaConfig> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(MemoriaConfig::from_toml_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "Config file not found, using defaults");
            Ok(MemoriaConfig::default())
        }
        Err(e) => Err(anyhow::anyhow!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        )),
    }
}

async fn open_pipeline(config: &MemoriaConfig) -> anyhow::Result<Arc<IngestionPipeline>> {
    let store = Store::open_dir(&config.data_dir)
        .await
        .map_err(|source| StoreOpenError {
            path: config.data_dir.clone(),
            source,
        })?;
    let store = Arc::new(store);
    let embedder = negotiate_embedder(&config.embedder).await;
    let index = Arc::new(SimilarityIndex::new(config.index.clone()));
    let retriever = Arc::new(HybridRetriever::new(
        store,
        embedder,
        index,
        config.retrieval.clone(),
    ));
    let report = retriever.load(&CancellationToken::new()).await?;
    info!(
        data_dir = %config.data_dir.display(),
        lexical = report.lexical,
        vectors = report.vectors,
        skipped = report.skipped,
        "Memory loaded"
    );
    Ok(Arc::new(IngestionPipeline::new(retriever)))
}

async fn open_engine(
    pipeline: Arc<IngestionPipeline>,
    config: &MemoriaConfig,
) -> anyhow::Result<ProposalEngine> {
    let executor = Arc::new(MaintenanceExecutor::new(Arc::clone(&pipeline)));
    Ok(ProposalEngine::open(pipeline, executor, config.proposals.clone()).await?)
}

/// Token cancelled on Ctrl-C.
fn ctrl_c_token() -> CancellationToken {
    let token = CancellationToken::new();
    let handle = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            handle.cancel();
        }
    });
    token
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(command: Commands, mut config: MemoriaConfig) -> anyhow::Result<i32> {
    match command {
        Commands::Ingest { files, source_type } => {
            let docs = input::load_documents(&files, &source_type).await?;
            let pipeline = open_pipeline(&config).await?;
            let summary = pipeline.ingest_batch(docs).await;
            print_json(&summary)?;
            Ok(summary.exit_code())
        }
        Commands::Query {
            text,
            k,
            vector_weight,
            lexical_weight,
            source_type,
        } => {
            let pipeline = open_pipeline(&config).await?;
            let defaults = RetrievalWeights::from(&config.retrieval);
            let weights = RetrievalWeights::new(
                vector_weight.unwrap_or(defaults.vector),
                lexical_weight.unwrap_or(defaults.lexical),
            );
            let mut request = SearchRequest::new(text, k.unwrap_or(config.retrieval.default_k))
                .with_weights(weights);
            if let Some(st) = source_type {
                request = request.with_source_type(st);
            }
            let response = pipeline.retriever().search(request).await?;
            let hits: Vec<_> = response
                .hits
                .iter()
                .map(|h| {
                    json!({
                        "id": h.document.id,
                        "score": h.score,
                        "vector_score": h.vector_score,
                        "lexical_score": h.lexical_score,
                        "source_type": h.document.source_type,
                        "ingested_at": h.document.ingested_at,
                        "text": h.document.raw_text,
                    })
                })
                .collect();
            print_json(&json!({
                "mode": response.mode,
                "degraded": response.degraded,
                "hits": hits,
            }))?;
            Ok(0)
        }
        Commands::Rebuild { force } => {
            let pipeline = open_pipeline(&config).await?;
            let cancel = ctrl_c_token();
            if force {
                let retriever = pipeline.retriever();
                let lexical = retriever.rebuild_lexical().await;
                let (vectors, skipped) = retriever.rebuild_vectors(&cancel).await?;
                print_json(&json!({
                    "lexical": lexical,
                    "vectors": vectors,
                    "skipped": skipped,
                }))?;
            } else {
                let health = pipeline.check_index(&cancel).await?;
                print_json(&health)?;
            }
            Ok(0)
        }
        Commands::Prune {
            max_age_days,
            source_types,
        } => {
            let pipeline = open_pipeline(&config).await?;
            let policy = RetentionPolicy {
                max_age_days: Some(max_age_days),
                source_types,
            };
            let report = pipeline.prune(&policy, chrono::Utc::now()).await?;
            print_json(&report)?;
            Ok(0)
        }
        Commands::Reencode => {
            let pipeline = open_pipeline(&config).await?;
            let report = pipeline.reencode_stale(&ctrl_c_token()).await?;
            print_json(&report)?;
            Ok(if report.failed > 0 { 1 } else { 0 })
        }
        Commands::Issue { file, interactive } => {
            let content = tokio::fs::read_to_string(&file).await.map_err(|e| {
                anyhow::anyhow!("Failed to read issue file '{}': {}", file.display(), e)
            })?;
            let issue: Issue = serde_json::from_str(&content)?;

            let channel = StdinReviewChannel::new(Duration::from_secs(300));
            if interactive {
                // The terminal prompt times out on its own and cannot be re-asked.
                config.proposals.review_timeout_ms = channel.timeout().as_millis() as u64 + 5_000;
                config.proposals.retry.max_retries = 0;
            }

            let pipeline = open_pipeline(&config).await?;
            let mut engine = open_engine(pipeline, &config).await?;
            if interactive {
                engine = engine.with_reviewer(Arc::new(channel));
            }

            let mut proposal = engine.submit(issue).await?;
            if interactive && proposal.status == ProposalStatus::PendingReview {
                proposal = engine.solicit_review(proposal.id).await?;
            }
            engine.drive().await?;
            if let Some(latest) = engine.get(proposal.id).await {
                proposal = latest;
            }
            print_json(&proposal)?;
            Ok(if proposal.status == ProposalStatus::Completed { 0 } else { 1 })
        }
        Commands::Review {
            id,
            approve,
            reject,
        } => {
            let reviewer = std::env::var("USER").unwrap_or_else(|_| "cli-user".to_string());
            let decision = match (approve, reject) {
                (true, _) => ReviewDecision::approve(reviewer),
                (false, Some(reason)) => ReviewDecision::reject(reviewer, reason),
                (false, None) => anyhow::bail!("pass --approve or --reject <REASON>"),
            };
            let pipeline = open_pipeline(&config).await?;
            let engine = open_engine(pipeline, &config).await?;
            engine.review(id, decision).await?;
            engine.drive().await?;
            let proposal = engine
                .get(id)
                .await
                .ok_or_else(|| anyhow::anyhow!("proposal {id} disappeared"))?;
            print_json(&proposal)?;
            Ok(0)
        }
        Commands::Rollback { id } => {
            let pipeline = open_pipeline(&config).await?;
            let engine = open_engine(pipeline, &config).await?;
            let proposal = engine.rollback(id).await?;
            print_json(&proposal)?;
            Ok(0)
        }
        Commands::Status => {
            let pipeline = open_pipeline(&config).await?;
            let retriever = Arc::clone(pipeline.retriever());
            let engine = open_engine(pipeline, &config).await?;

            let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
            for p in engine.list().await {
                *by_status.entry(p.status.to_string()).or_default() += 1;
            }
            let index = retriever.index();
            print_json(&json!({
                "data_dir": config.data_dir,
                "embedder": retriever.embedder().version(),
                "documents": retriever.store().document_count().await,
                "lexical_index": retriever.lexical_count().await,
                "vector_index": {
                    "kind": index.kind(),
                    "len": index.len(),
                    "tombstones": index.tombstones(),
                    "corrupted": index.is_corrupted(),
                },
                "proposals": by_status,
                "queued": engine.queued(),
                "audit_entries": engine.audit().len(),
            }))?;
            Ok(0)
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(0)
        }
    }
}
