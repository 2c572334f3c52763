use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

use depscope::config::{self, Config};
use depscope::engine::cache::Cache;
use depscope::engine::context::{Resolution, ResolutionContext};
use depscope::engine::error::ResolveError;
use depscope::engine::feed::SnykFeed;
use depscope::engine::registries::NpmRegistry;
use depscope::engine::types::ResolvedTree;

#[derive(Parser)]
#[command(name = "depscope")]
#[command(version, about = "Resolve npm dependency trees and their known vulnerabilities")]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database file (defaults to the XDG data directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Write log lines as JSON
    #[arg(long, global = true)]
    log_json: bool,

    /// Give up polling for a result after this many seconds
    #[arg(long, global = true, default_value_t = 120)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve a published package (latest version unless one is given)
    Resolve {
        name: String,
        version: Option<String>,
    },
    /// Upload a package.json and resolve it including dev-dependencies
    Upload { path: PathBuf },
    /// Print the resolution of a previously uploaded manifest
    File { id: String },
    /// Import new records from the vulnerability feed
    SyncVulnerabilities,
    /// Delete expired cache rows
    Expire,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse config {}", path.display()))
}

fn init_logging(json: bool) -> anyhow::Result<WorkerGuard> {
    let log_path = config::log_path();
    let log_dir = log_path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create {}", log_dir.display()))?;

    let file_name = log_path.file_name().unwrap_or("depscope.log".as_ref());
    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, file_name));

    let filter = EnvFilter::try_from_env("DEPSCOPE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
            .boxed()
    };
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(file_layer.with_filter(filter))
        .with(stderr_layer)
        .try_init()?;

    Ok(guard)
}

/// Polls `request` until the tree is ready or `timeout` passes
async fn poll<F, Fut>(timeout: Duration, mut request: F) -> anyhow::Result<Arc<ResolvedTree>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Resolution, ResolveError>>,
{
    let started = Instant::now();
    loop {
        match request().await? {
            Resolution::Ready(tree) => return Ok(tree),
            Resolution::Pending if started.elapsed() >= timeout => {
                bail!("Resolution still pending after {}s", timeout.as_secs())
            }
            Resolution::Pending => info!("Resolution pending, polling again"),
        }
    }
}

fn print_tree(tree: &ResolvedTree) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(tree)?);
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let db_path = cli.db.unwrap_or_else(config::db_path);
    if let Some(dir) = db_path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let store = Arc::new(Cache::new(&db_path)?);
    let registry = Arc::new(NpmRegistry::new(&config.registry_url)?);
    let feed = Arc::new(SnykFeed::new(&config.feed_url)?);
    let context = Arc::new(ResolutionContext::new(&config, store, registry, feed));
    let timeout = Duration::from_secs(cli.timeout);

    match cli.command {
        Command::Resolve { name, version } => {
            let tree = match &version {
                Some(version) => {
                    poll(timeout, || context.resolve_package_version(&name, version)).await?
                }
                None => poll(timeout, || context.resolve_package_latest(&name)).await?,
            };
            print_tree(&tree)
        }
        Command::Upload { path } => {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let id = context.upload_manifest(&bytes)?;
            eprintln!("Uploaded as {}", id);
            let tree = poll(timeout, || context.resolve_uploaded_file(&id)).await?;
            print_tree(&tree)
        }
        Command::File { id } => {
            let tree = poll(timeout, || context.resolve_uploaded_file(&id)).await?;
            print_tree(&tree)
        }
        Command::SyncVulnerabilities => {
            let imported = context.sync_vulnerabilities().await?;
            println!("Imported {} vulnerabilities", imported);
            Ok(())
        }
        Command::Expire => {
            let expired = context.expire_now()?;
            println!(
                "Expired {} packages and {} resolved versions",
                expired.packages, expired.resolved_versions
            );
            Ok(())
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(cli.log_json)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(cli))
}
