use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use reqwest::Url;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use arbor::sync::resolve_session;
use arbor::{
    logging, EngineConfig, EngineError, HttpClient, OfflineCoverage, Result, Store, SyncEngine,
    SyncScheduler,
};

#[derive(Parser)]
#[command(name = "arbor", version, about = "Offline outline-notes sync engine")]
struct Cli {
    /// Server base URL.
    #[arg(long, env = "ARBOR_SERVER", default_value = "http://localhost:8000")]
    server: String,
    /// Data directory holding the per-user databases.
    #[arg(long, env = "ARBOR_DATA_DIR")]
    data_dir: Option<PathBuf>,
    /// Log filter, e.g. `info` or `arbor=debug`.
    #[arg(long, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Offline-readiness summary of the local store.
    Status,
    /// List pending outbox operations.
    Outbox,
    /// Run one flush pass.
    Flush,
    /// Run a full reconciliation sweep.
    Pull {
        #[arg(long)]
        force: bool,
    },
    /// Semantic search over locally cached embeddings.
    Search {
        query: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Run the background sync loops until interrupted.
    Run,
}

fn fmt_ms(ms: u64) -> String {
    OffsetDateTime::from_unix_timestamp((ms / 1000) as i64)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| ms.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(&cli.log)?;

    let config = EngineConfig::default();
    let data_dir = cli
        .data_dir
        .or_else(|| dirs::data_dir().map(|d| d.join("arbor")))
        .unwrap_or_else(|| PathBuf::from(".arbor"));
    let base: Url = cli
        .server
        .parse()
        .map_err(|e| EngineError::InvalidArgument(format!("bad server url: {e}")))?;

    let api = Arc::new(HttpClient::new(base)?);
    let session = resolve_session(api.as_ref(), &data_dir, config.auth_probe_timeout_ms).await;
    let store = Arc::new(Store::open(&data_dir, session.store_key(), &config)?);
    let engine = Arc::new(SyncEngine::new(store.clone(), api, config));

    match cli.command {
        Command::Status => {
            let coverage = OfflineCoverage::compute(&store)?;
            println!("{}", serde_json::to_string_pretty(&coverage)?);
        }
        Command::Outbox => {
            let ops = store.read_ops(500)?;
            if ops.is_empty() {
                println!("outbox empty");
            }
            for op in ops {
                println!(
                    "{}  {:<24} {:<12} queued={} attempts={} {}",
                    op.id,
                    op.op_type.as_str(),
                    op.article_id,
                    fmt_ms(op.created_at_ms),
                    op.attempts,
                    op.last_error.as_deref().unwrap_or("")
                );
            }
        }
        Command::Flush => {
            let report = engine.flush_outbox_once().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Pull { force } => match engine.full_pull(force).await? {
            Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
            None => println!("a sweep is already running"),
        },
        Command::Search { query, limit } => {
            for hit in engine.semantic_search(&query, limit).await? {
                println!("{:.4}  {}  {}", hit.score, hit.article_id, hit.title);
            }
        }
        Command::Run => {
            engine.recover_outline_queue()?;
            let scheduler = SyncScheduler::new(engine.clone());
            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            let runner = tokio::spawn(async move { scheduler.run(shutdown_rx).await });
            tokio::signal::ctrl_c()
                .await
                .map_err(|e| EngineError::InvalidArgument(format!("signal handler: {e}")))?;
            let _ = shutdown_tx.send(true);
            let _ = runner.await;
            engine.ship_client_log().await;
        }
    }
    Ok(())
}
