//! chaintrack CLI: inspect tracker databases and confirmation policies.
//!
//! Usage:
//! ```bash
//! chaintrack tiers   [--chain-id 1] [--policy policy.json] [--json]
//! chaintrack inspect --db ./track.db --chain-id 1 [--state confirmed] [--limit 20] [--json]
//! chaintrack info
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use chaintrack_core::confirmation::chain_name;
use chaintrack_core::{
    BlockRecord, BlockState, ConfirmationPolicy, ConfirmationTier, EventQuery, HeadQuery, Store,
    Tiers, TrackerConfig,
};
use chaintrack_storage::SqliteStore;

#[derive(Parser)]
#[command(
    name = "chaintrack",
    about = "Block/event tracker: inspect stored state and confirmation policies",
    version
)]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show confirmation thresholds per chain
    Tiers {
        /// Show one chain only
        #[arg(long)]
        chain_id: Option<u64>,
        /// Load the policy from a JSON file instead of the built-in table
        #[arg(long)]
        policy: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Summarise a SQLite tracker database
    Inspect {
        /// Path to the database file
        #[arg(long)]
        db: String,
        #[arg(long)]
        chain_id: u64,
        /// Only list blocks in this state
        #[arg(long)]
        state: Option<BlockState>,
        /// Number of most recent blocks to list
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show build and default configuration info
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    match cli.command {
        Commands::Tiers {
            chain_id,
            policy,
            json,
        } => cmd_tiers(chain_id, policy.as_deref(), json),
        Commands::Inspect {
            db,
            chain_id,
            state,
            limit,
            json,
        } => cmd_inspect(&db, chain_id, state, limit, json).await,
        Commands::Info => cmd_info(),
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn cmd_tiers(chain_id: Option<u64>, policy_path: Option<&str>, json: bool) -> Result<()> {
    let policy = match policy_path {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
            ConfirmationPolicy::from_json(&text).with_context(|| format!("parsing {path}"))?
        }
        None => ConfirmationPolicy::default(),
    };

    let rows: Vec<(Option<u64>, Tiers)> = match chain_id {
        Some(id) => vec![(Some(id), policy.tiers(id))],
        None => policy
            .entries()
            .into_iter()
            .map(|(id, t)| (Some(id), t))
            .chain(std::iter::once((None, policy.default_tiers())))
            .collect(),
    };

    if json {
        let out: Vec<_> = rows
            .iter()
            .map(|(id, t)| {
                serde_json::json!({
                    "chain_id": id,
                    "name": id.and_then(chain_name),
                    "instant": t.instant,
                    "fast": t.fast,
                    "safe": t.safe,
                    "finalized": t.finalized,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!(
        "{:<10} {:<10} {:>8} {:>8} {:>8} {:>10}",
        "CHAIN ID", "NAME", "INSTANT", "FAST", "SAFE", "FINALIZED"
    );
    for (id, t) in &rows {
        let (id_col, name) = match id {
            Some(id) => (
                id.to_string(),
                chain_name(*id).unwrap_or(if policy.is_known(*id) { "custom" } else { "default" }),
            ),
            None => ("*".to_string(), "default"),
        };
        println!(
            "{:<10} {:<10} {:>8} {:>8} {:>8} {:>10}",
            id_col, name, t.instant, t.fast, t.safe, t.finalized
        );
    }
    Ok(())
}

async fn cmd_inspect(
    db: &str,
    chain_id: u64,
    state: Option<BlockState>,
    limit: usize,
    json: bool,
) -> Result<()> {
    if !std::path::Path::new(db).exists() {
        anyhow::bail!("database {db} does not exist");
    }
    let store = SqliteStore::open(db)
        .await
        .with_context(|| format!("opening {db}"))?;
    tracing::debug!(db, chain_id, "inspecting tracker database");

    let height = store.get_height(chain_id).await?;
    let mut counts = Vec::new();
    for s in [
        BlockState::Skipped,
        BlockState::Seen,
        BlockState::Confirmed,
        BlockState::Removed,
    ] {
        counts.push((s, store.count_heads(&HeadQuery::chain(chain_id).state(s)).await?));
    }
    let events = store.count_events(&EventQuery::chain(chain_id)).await?;

    let mut query = HeadQuery::chain(chain_id);
    if let Some(s) = state {
        query = query.state(s);
    }
    let heads = store.query_heads(&query).await?;
    let recent: Vec<&BlockRecord> = heads.iter().rev().take(limit).collect();

    if json {
        let out = serde_json::json!({
            "chain_id": chain_id,
            "height": height,
            "blocks": counts
                .iter()
                .map(|(s, n)| (s.to_string(), serde_json::json!(n)))
                .collect::<serde_json::Map<_, _>>(),
            "events": events,
            "recent": recent,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let name = chain_name(chain_id).unwrap_or("unknown");
    println!("Chain {chain_id} ({name})");
    println!("  Confirmed height: {height}");
    for (s, n) in &counts {
        println!("  {:<10} {n} blocks", format!("{s}:"));
    }
    println!("  Events:    {events}");
    if recent.is_empty() {
        return Ok(());
    }
    println!();
    println!("{:>12}  {:<10}  {:<20}  HASH", "NUMBER", "STATE", "TIME (UTC)");
    for head in recent {
        let time = chrono::DateTime::from_timestamp(head.timestamp as i64, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "{:>12}  {:<10}  {:<20}  {}",
            head.number,
            head.state.to_string(),
            time,
            head.hash
        );
    }
    Ok(())
}

fn cmd_info() -> Result<()> {
    let cfg = TrackerConfig::default();
    println!("chaintrack v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Defaults:");
    println!("  Confirmation tier:     {:?}", cfg.tier);
    println!("  Start height:          {}", cfg.start_height);
    println!("  Subscriber queue:      {} notices", cfg.queue_capacity);
    println!("  Subscriber error queue: {} notices", cfg.error_queue_capacity);
    println!(
        "  Fast threshold (eth):  {} blocks",
        cfg.policy.threshold(1, ConfirmationTier::Fast)
    );
    println!();
    println!("Storage backends: memory (core), SQLite (chaintrack-storage)");
    println!("Chain sources:    EVM JSON-RPC polling (chaintrack-evm)");
    Ok(())
}
