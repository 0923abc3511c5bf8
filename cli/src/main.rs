//! chainetl CLI — inspect indexer state and configuration.
//!
//! Usage:
//! ```bash
//! chainetl info
//! chainetl config   --config ./chainetl.json
//! chainetl status   --snapshot ./snapshots/snapshot-1000.json
//! chainetl status   --db ./index.db            # feature: sqlite
//! ```

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;

use chainetl_core::config::CrawlerConfig;
use chainetl_core::store::TableStore;
use chainetl_storage::MemoryStore;
use chainetl_tezos::Indexer;

/// Log output settings, read from the `log` section of the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LogConfig {
    /// Default level for every target.
    level: String,
    /// Per-component overrides: component name → level.
    components: HashMap<String, String>,
    json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            components: HashMap::new(),
            json: false,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct FileConfig {
    crawler: CrawlerConfig,
    log: LogConfig,
}

impl FileConfig {
    fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.crawler.check()?;
        Ok(config)
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the config file.
fn init_tracing(log: &LogConfig) -> anyhow::Result<()> {
    let default = log.level.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO);
    let mut filter = EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy();
    for (component, level) in &log.components {
        let directive = format!("{}={}", component.replace('-', "_"), level);
        filter = filter.add_directive(
            directive
                .parse()
                .with_context(|| format!("bad log directive {directive:?}"))?,
        );
    }

    let registry = tracing_subscriber::registry().with(filter);
    if log.json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }
    Ok(())
}

struct Args {
    command: String,
    config: Option<PathBuf>,
    db: Option<String>,
    snapshot: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut raw = env::args().skip(1);
    let command = raw.next().unwrap_or_default();
    let mut args = Args {
        command,
        config: None,
        db: None,
        snapshot: None,
    };
    while let Some(flag) = raw.next() {
        let mut value = || raw.next().with_context(|| format!("{flag} needs a value"));
        match flag.as_str() {
            "--config" | "-c" => args.config = Some(value()?.into()),
            "--db" => args.db = Some(value()?),
            "--snapshot" => args.snapshot = Some(value()?.into()),
            other => bail!("unknown option: {other}"),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;
    match args.command.as_str() {
        "" | "help" | "--help" | "-h" => {
            print_usage();
            return Ok(());
        }
        "version" | "--version" | "-V" => {
            println!("chainetl {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    let config = FileConfig::load(args.config.as_deref())?;
    init_tracing(&config.log)?;
    debug!(config = ?args.config, "configuration loaded");

    match args.command.as_str() {
        "info" => cmd_info(&config.crawler),
        "config" => println!("{}", serde_json::to_string_pretty(&config)?),
        "status" => cmd_status(&args).await?,
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    }
    Ok(())
}

fn print_usage() {
    println!("chainetl {}", env!("CARGO_PKG_VERSION"));
    println!("Reorg-safe Tezos indexer core\n");
    println!("USAGE:");
    println!("    chainetl <COMMAND> [--config <file>]\n");
    println!("COMMANDS:");
    println!("    info     Show effective crawler settings");
    println!("    config   Print the merged configuration as JSON");
    println!("    status   Show the indexed head (--snapshot <file> | --db <file>)");
    println!("    version  Print version");
    println!("    help     Print this help");
}

fn cmd_info(config: &CrawlerConfig) {
    println!("ChainETL v{}", env!("CARGO_PKG_VERSION"));
    println!("  Crawler id:        {}", config.id);
    println!("  Start height:      {}", config.start_height);
    match config.stop_height {
        Some(h) => println!("  Stop height:       {h}"),
        None => println!("  Stop height:       follow head"),
    }
    println!("  Poll interval:     {} ms", config.poll_interval_ms);
    println!("  Max reorg depth:   {} blocks", config.max_reorg_depth);
    println!("  Block validation:  {}", if config.validate { "on" } else { "off" });
    match &config.snapshot.path {
        Some(path) => println!(
            "  Snapshots:         {} (every {} blocks, {} fixed heights)",
            path.display(),
            config.snapshot.block_interval,
            config.snapshot.blocks.len()
        ),
        None => println!("  Snapshots:         off"),
    }
    println!("  Storage backends:  memory, SQLite (feature: sqlite)");
}

async fn cmd_status(args: &Args) -> anyhow::Result<()> {
    if let Some(path) = &args.snapshot {
        let store = MemoryStore::from_snapshot(path)
            .await
            .with_context(|| format!("loading snapshot {}", path.display()))?;
        return print_status(Arc::new(store)).await;
    }
    if let Some(db) = &args.db {
        return open_db(db).await;
    }
    bail!("status needs --snapshot <file> or --db <file>")
}

#[cfg(feature = "sqlite")]
async fn open_db(path: &str) -> anyhow::Result<()> {
    let store = chainetl_storage::SqliteStore::open(path)
        .await
        .with_context(|| format!("opening {path}"))?;
    print_status(Arc::new(store)).await
}

#[cfg(not(feature = "sqlite"))]
async fn open_db(_path: &str) -> anyhow::Result<()> {
    bail!("built without SQLite support (enable feature `sqlite`)")
}

async fn print_status<S: TableStore + 'static>(store: Arc<S>) -> anyhow::Result<()> {
    let indexer = Indexer::new(store);
    let Some(head) = indexer.head().await? else {
        println!("index is empty");
        return Ok(());
    };
    info!(height = head.height, hash = %head.hash, "indexed head");
    let block = indexer
        .block(head.height)
        .await?
        .with_context(|| format!("head block {} missing", head.height))?;
    let out = serde_json::json!({
        "head": head,
        "block": block,
        "ops": indexer.ops(head.height).await?.len(),
        "flows": indexer.flows(head.height).await?.len(),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
