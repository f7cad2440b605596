mod follow;
mod rpc;

use std::path::Path;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};
use color_eyre::eyre::{eyre, Context, Result};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use projection_data::{Store, StoreConfig, SCHEMA_VERSION};
use projection_engine::{ProjectionConfig, ProjectionEngine};
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use crate::follow::FollowOptions;
use crate::rpc::RpcChain;

#[derive(Debug, Clone)]
struct AppContext {
    db_path: String,
    rpc_url: Option<String>,
}

#[derive(Parser, Debug)]
#[command(name = "chain-projection")]
#[command(about = "Reorg-aware projection of an Ethereum chain into SQLite")]
#[command(version)]
struct Cli {
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    #[arg(long, global = true, default_value = "data/projection.sqlite")]
    db_path: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the database or upgrade it to the current schema.
    Migrate,
    Status(StatusArgs),
    /// Show one projected block with its transactions.
    Block(BlockArgs),
    /// Verify referential integrity of the projection.
    Check,
    /// Follow the node at PROJECTION_RPC_URL until interrupted.
    Follow(FollowArgs),
}

#[derive(Args, Debug)]
struct StatusArgs {
    /// Output format: table (default) or json.
    #[arg(long, default_value = "table")]
    output: String,
}

#[derive(Args, Debug)]
struct BlockArgs {
    #[arg(long)]
    number: u64,
}

#[derive(Args, Debug)]
struct FollowArgs {
    /// Poll interval in milliseconds.
    #[arg(long, default_value_t = 2000)]
    poll_interval_ms: u64,

    /// First block to project into an empty database (default: node's latest).
    #[arg(long)]
    from: Option<u64>,

    /// Deepest reorg to follow before stopping.
    #[arg(long, default_value_t = 64)]
    max_reorg_depth: usize,

    /// Number of recent blocks whose receipts are kept in memory.
    #[arg(long)]
    receipt_cache: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet)?;

    let ctx = AppContext {
        db_path: cli.db_path,
        rpc_url: std::env::var("PROJECTION_RPC_URL").ok(),
    };

    match cli.command {
        Commands::Migrate => handle_migrate(&ctx),
        Commands::Status(args) => handle_status(&ctx, args),
        Commands::Block(args) => handle_block(&ctx, args),
        Commands::Check => handle_check(&ctx),
        Commands::Follow(args) => handle_follow(&ctx, args).await,
    }
}

fn init_tracing(verbose: u8, quiet: bool) -> Result<()> {
    let level = if quiet {
        Level::WARN
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.as_str()))
        .wrap_err("failed to initialize tracing filter")?;

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn open_store(ctx: &AppContext) -> Result<Store> {
    Store::open(&ctx.db_path, &StoreConfig::default()).wrap_err("failed to open SQLite store")
}

fn handle_migrate(ctx: &AppContext) -> Result<()> {
    if let Some(parent) = Path::new(&ctx.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }

    let mut store = open_store(ctx)?;
    let applied = store.migrate().wrap_err("failed to migrate schema")?;
    store.close()?;

    info!(
        applied,
        schema_version = SCHEMA_VERSION,
        db_path = %ctx.db_path,
        "migrate command finished"
    );
    println!("schema at version {SCHEMA_VERSION} ({applied} migrations applied)");
    Ok(())
}

#[derive(Serialize)]
struct StatusReport {
    db_path: String,
    schema_version: u32,
    latest_block: Option<u64>,
    latest_block_time: Option<String>,
    latest_finalized: Option<u64>,
    blocks: u64,
    transactions: u64,
    receipts: u64,
    logs: u64,
    state_changes: u64,
    access_lists: u64,
    accounts: u64,
}

fn handle_status(ctx: &AppContext, args: StatusArgs) -> Result<()> {
    let store = open_store(ctx)?;
    let schema_version = store.schema_version()?;
    if schema_version != SCHEMA_VERSION {
        return Err(eyre!(
            "schema version {schema_version} does not match {SCHEMA_VERSION}; run `migrate`"
        ));
    }

    let counts = store.table_counts().wrap_err("failed to count rows")?;
    let latest_block = store.latest_block()?;
    let latest_block_time = match latest_block {
        Some(number) => store
            .block_by_number(number)?
            .and_then(|block| chrono::DateTime::from_timestamp(block.timestamp as i64, 0))
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string()),
        None => None,
    };

    let report = StatusReport {
        db_path: ctx.db_path.clone(),
        schema_version,
        latest_block,
        latest_block_time,
        latest_finalized: store.latest_finalized()?,
        blocks: counts.blocks,
        transactions: counts.transactions,
        receipts: counts.receipts,
        logs: counts.logs,
        state_changes: counts.state_changes,
        access_lists: counts.access_lists,
        accounts: counts.accounts,
    };

    match args.output.as_str() {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        "table" => print_status_table(&report),
        other => return Err(eyre!("unsupported output format: {other}")),
    }

    info!(
        blocks = report.blocks,
        latest_block = ?report.latest_block,
        db_path = %ctx.db_path,
        "status command completed"
    );
    Ok(())
}

fn print_status_table(report: &StatusReport) {
    let db_size = match std::fs::metadata(&report.db_path) {
        Ok(metadata) => format!("{} MB", metadata.len() / 1_000_000),
        Err(_) => "N/A (file not found)".to_string(),
    };

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Metric", "Value"]);

    table.add_row(vec!["Database Path", report.db_path.as_str()]);
    table.add_row(vec!["DB Size", &db_size]);
    table.add_row(vec!["Schema Version", &report.schema_version.to_string()]);
    match report.latest_block {
        Some(number) => {
            table.add_row(vec!["Latest Block", &number.to_string()]);
            table.add_row(vec![
                "Latest Block Time",
                report.latest_block_time.as_deref().unwrap_or("N/A"),
            ]);
        }
        None => {
            table.add_row(vec!["Latest Block", "No blocks in database"]);
        }
    }
    table.add_row(vec![
        "Latest Finalized",
        &report
            .latest_finalized
            .map_or_else(|| "none".to_string(), |n| n.to_string()),
    ]);
    table.add_row(vec!["Blocks", &report.blocks.to_string()]);
    table.add_row(vec!["Transactions", &report.transactions.to_string()]);
    table.add_row(vec!["Receipts", &report.receipts.to_string()]);
    table.add_row(vec!["Logs", &report.logs.to_string()]);
    table.add_row(vec!["State Changes", &report.state_changes.to_string()]);
    table.add_row(vec!["Access List Entries", &report.access_lists.to_string()]);
    table.add_row(vec!["Accounts", &report.accounts.to_string()]);

    println!("\n{}\n", table);
}

fn handle_block(ctx: &AppContext, args: BlockArgs) -> Result<()> {
    let store = open_store(ctx)?;
    store.ensure_schema_current()?;

    let block = store
        .block_by_number(args.number)?
        .ok_or_else(|| eyre!("block {} is not in the projection", args.number))?;
    let transactions = store.transactions_by_block(args.number)?;
    let logs = store.logs_by_block(args.number)?;

    let mut summary = Table::new();
    summary.load_preset(UTF8_BORDERS_ONLY);
    summary.set_header(vec!["Field", "Value"]);
    summary.add_row(vec!["Number", &block.number.to_string()]);
    summary.add_row(vec!["Hash", block.hash.as_str()]);
    summary.add_row(vec!["Parent", block.parent_hash.as_str()]);
    summary.add_row(vec!["Miner", block.miner.as_str()]);
    summary.add_row(vec![
        "Gas Used / Limit",
        &format!("{} / {}", block.gas_used, block.gas_limit),
    ]);
    summary.add_row(vec![
        "Base Fee",
        block.base_fee_per_gas.as_deref().unwrap_or("none (pre-London)"),
    ]);
    summary.add_row(vec!["Finalized", if block.finalized { "yes" } else { "no" }]);
    summary.add_row(vec!["Logs", &logs.len().to_string()]);
    println!("\n{}", summary);

    if !transactions.is_empty() {
        let mut table = Table::new();
        table.load_preset(UTF8_BORDERS_ONLY);
        table.set_header(vec!["#", "Hash", "From", "To", "Gas Used", "Status"]);
        for tx in &transactions {
            table.add_row(vec![
                tx.transaction_index.to_string(),
                truncate_hash(&tx.hash),
                truncate_hash(&tx.from_address),
                tx.to_address
                    .as_deref()
                    .map_or_else(|| "(create)".to_string(), truncate_hash),
                tx.gas_used.to_string(),
                if tx.status == 1 { "ok" } else { "reverted" }.to_string(),
            ]);
        }
        println!("{}", table);
    }
    println!();
    Ok(())
}

fn handle_check(ctx: &AppContext) -> Result<()> {
    let store = open_store(ctx)?;
    store.ensure_schema_current()?;

    let violations = store
        .foreign_key_violations()
        .wrap_err("failed to run foreign key check")?;
    if violations > 0 {
        return Err(eyre!("{violations} rows reference missing parents"));
    }

    info!(db_path = %ctx.db_path, "projection is consistent");
    println!("ok: no foreign key violations");
    Ok(())
}

async fn handle_follow(ctx: &AppContext, args: FollowArgs) -> Result<()> {
    let rpc_url = ctx
        .rpc_url
        .as_deref()
        .ok_or_else(|| eyre!("PROJECTION_RPC_URL is required for follow command"))?;

    let mut config = ProjectionConfig::default();
    if let Some(capacity) = args.receipt_cache {
        config.receipt_cache_capacity = capacity
            .try_into()
            .map_err(|_| eyre!("--receipt-cache must be at least 1"))?;
    }

    let mut engine =
        ProjectionEngine::open(&ctx.db_path, config).wrap_err("failed to open projection")?;
    let chain = RpcChain::connect(rpc_url).await?;
    engine.on_init(chain.clone())?;

    let opts = FollowOptions {
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        from: args.from,
        max_reorg_depth: args.max_reorg_depth.max(1),
    };
    follow::run(&mut engine, &chain, &opts).await?;

    info!(db_path = %ctx.db_path, "follow command finished");
    Ok(())
}

fn truncate_hash(hash: &str) -> String {
    if hash.len() > 14 {
        format!("{}…{}", &hash[..8], &hash[hash.len() - 4..])
    } else {
        hash.to_string()
    }
}

fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .wrap_err_with(|| format!("failed to create data directory {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_hash_keeps_short_values() {
        assert_eq!(truncate_hash("0xabc"), "0xabc");
        assert_eq!(
            truncate_hash("0x88e96d4537bea4d9c05d12549907b32561d3bf31f45aae734cdc119f13406cb6"),
            "0x88e96d…6cb6"
        );
    }

    #[test]
    fn cli_parses_follow_options() {
        let cli = Cli::try_parse_from([
            "chain-projection",
            "-vv",
            "--db-path",
            "/tmp/p.sqlite",
            "follow",
            "--from",
            "100",
            "--poll-interval-ms",
            "500",
        ])
        .expect("arguments should parse");

        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.db_path, "/tmp/p.sqlite");
        match cli.command {
            Commands::Follow(args) => {
                assert_eq!(args.from, Some(100));
                assert_eq!(args.poll_interval_ms, 500);
                assert_eq!(args.max_reorg_depth, 64);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
