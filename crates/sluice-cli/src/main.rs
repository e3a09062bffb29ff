use alloy::primitives::{Address, B256};
use clap::{ArgAction, Args, Parser, Subcommand};
use color_eyre::eyre::{eyre, Context, Result};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use indicatif::{ProgressBar, ProgressStyle};
use sluice_data::plan::{BlockRange, Sighash};
use sluice_data::types::{format_item_id, BlockItem};
use sluice_engine::{
    BatchContext, BatchHandler, DataSourceSettings, LogOptions, Pipeline, TxOptions,
};
use sluice_store::{Database, Row};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sluice")]
#[command(about = "EVM blockchain indexer: archive + node RPC ingestion into SQLite")]
#[command(version)]
struct Cli {
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    #[arg(long, global = true, default_value = "data/sluice.sqlite")]
    db_path: String,

    /// Name prefix for the pipeline's own status tables.
    #[arg(long, global = true, default_value = "sluice")]
    schema: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ingest blocks, transactions, and logs into raw tables.
    Run(RunArgs),
    /// Summarize the store: committed position, hot depth, row counts.
    Status,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Archive service base URL (bulk finalized history). Falls back to
    /// SLUICE_ARCHIVE_URL.
    #[arg(long)]
    archive_url: Option<String>,

    /// Node JSON-RPC URL (unfinalized head). Falls back to SLUICE_RPC_URL.
    #[arg(long)]
    rpc_url: Option<String>,

    #[arg(long, default_value_t = 0)]
    from: u64,

    /// Inclusive upper bound; the run exits once it is reached.
    #[arg(long)]
    to: Option<u64>,

    /// Log filter: contract address (repeatable).
    #[arg(long)]
    address: Vec<String>,

    /// Log filter: topic0 / event signature hash (repeatable).
    #[arg(long)]
    topic0: Vec<String>,

    /// Transaction filter: recipient address (repeatable).
    #[arg(long)]
    tx_to: Vec<String>,

    /// Transaction filter: sender address (repeatable).
    #[arg(long)]
    tx_from: Vec<String>,

    /// Transaction filter: 4-byte function selector (repeatable).
    #[arg(long)]
    sighash: Vec<String>,

    /// Deliver every block in range even when no filter matches it.
    #[arg(long)]
    include_all_blocks: bool,

    /// Join each selected log with its transaction.
    #[arg(long)]
    log_transactions: bool,

    /// Blocks below the archive head by at least this much are treated as
    /// finalized.
    #[arg(long, default_value_t = 10)]
    safety_depth: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet)?;

    match cli.command {
        Commands::Run(args) => handle_run(&cli.db_path, &cli.schema, args).await,
        Commands::Status => handle_status(&cli.db_path, &cli.schema),
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

fn parse_addresses(values: &[String], flag: &str) -> Result<Vec<Address>> {
    values
        .iter()
        .map(|value| {
            value
                .parse::<Address>()
                .wrap_err_with(|| format!("invalid {flag} address {value:?}"))
        })
        .collect()
}

const RAW_TABLE_MIGRATIONS: &str = "
    CREATE TABLE IF NOT EXISTS blocks (
        id TEXT PRIMARY KEY,
        height INTEGER NOT NULL,
        hash TEXT NOT NULL,
        parent_hash TEXT,
        timestamp INTEGER
    );

    CREATE TABLE IF NOT EXISTS transactions (
        id TEXT PRIMARY KEY,
        block_height INTEGER NOT NULL,
        tx_index INTEGER NOT NULL,
        hash TEXT NOT NULL,
        from_address TEXT,
        to_address TEXT,
        input TEXT
    );

    CREATE TABLE IF NOT EXISTS logs (
        id TEXT PRIMARY KEY,
        block_height INTEGER NOT NULL,
        log_index INTEGER NOT NULL,
        tx_index INTEGER NOT NULL,
        address TEXT,
        topic0 TEXT,
        data TEXT
    );
";

/// Persists every delivered block, transaction, and log through the tracked
/// row-ops interface, so hot writes are covered by rollback.
struct RawIngestHandler {
    progress: ProgressBar,
}

impl BatchHandler for RawIngestHandler {
    fn process(&mut self, ctx: &mut BatchContext<'_, '_>) -> Result<()> {
        let mut block_rows = Vec::new();
        let mut tx_rows = Vec::new();
        let mut log_rows = Vec::new();

        for block in ctx.blocks {
            let header = &block.header;
            block_rows.push(
                Row::new(header.id())
                    .set("height", serde_json::json!(header.height))
                    .set("hash", serde_json::json!(format!("{:#x}", header.hash)))
                    .set(
                        "parent_hash",
                        serde_json::json!(format!("{:#x}", header.parent_hash)),
                    )
                    .set("timestamp", serde_json::json!(header.timestamp)),
            );

            for item in &block.items {
                match item {
                    BlockItem::Transaction(tx) => {
                        tx_rows.push(
                            Row::new(format_item_id(header.height, &header.hash, tx.index))
                                .set("block_height", serde_json::json!(header.height))
                                .set("tx_index", serde_json::json!(tx.index))
                                .set("hash", serde_json::json!(format!("{:#x}", tx.hash)))
                                .set(
                                    "from_address",
                                    tx.from
                                        .map(|a| serde_json::json!(format!("{a:#x}")))
                                        .unwrap_or(serde_json::Value::Null),
                                )
                                .set(
                                    "to_address",
                                    tx.to
                                        .map(|a| serde_json::json!(format!("{a:#x}")))
                                        .unwrap_or(serde_json::Value::Null),
                                )
                                .set(
                                    "input",
                                    tx.input
                                        .as_ref()
                                        .map(|b| serde_json::json!(b.to_string()))
                                        .unwrap_or(serde_json::Value::Null),
                                ),
                        );
                    }
                    BlockItem::Log(log_item) => {
                        let log = &log_item.log;
                        log_rows.push(
                            Row::new(format_item_id(header.height, &header.hash, log.index))
                                .set("block_height", serde_json::json!(header.height))
                                .set("log_index", serde_json::json!(log.index))
                                .set("tx_index", serde_json::json!(log.transaction_index))
                                .set(
                                    "address",
                                    serde_json::json!(format!("{:#x}", log.address)),
                                )
                                .set(
                                    "topic0",
                                    log.topics
                                        .first()
                                        .map(|t| serde_json::json!(format!("{t:#x}")))
                                        .unwrap_or(serde_json::Value::Null),
                                )
                                .set("data", serde_json::json!(log.data.to_string())),
                        );
                    }
                }
            }
        }

        ctx.store.insert("blocks", &block_rows)?;
        ctx.store.insert("transactions", &tx_rows)?;
        ctx.store.insert("logs", &log_rows)?;

        if let Some(tip) = ctx.blocks.last() {
            self.progress.set_message(format!(
                "block {}{}",
                tip.header.height,
                if ctx.is_head { " (head)" } else { "" }
            ));
        }
        Ok(())
    }
}

async fn handle_run(db_path: &str, schema: &str, mut args: RunArgs) -> Result<()> {
    if args.archive_url.is_none() {
        args.archive_url = std::env::var("SLUICE_ARCHIVE_URL").ok();
    }
    if args.rpc_url.is_none() {
        args.rpc_url = std::env::var("SLUICE_RPC_URL").ok();
    }
    if args.archive_url.is_none() && args.rpc_url.is_none() {
        return Err(eyre!(
            "at least one of --archive-url or --rpc-url is required"
        ));
    }

    if let Some(parent) = std::path::Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .wrap_err_with(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let db = Database::new(db_path, schema).wrap_err("failed to open SQLite store")?;
    db.execute_batch(RAW_TABLE_MIGRATIONS)
        .wrap_err("failed to create raw ingest tables")?;

    let range = Some(BlockRange::new(args.from, args.to));
    let mut pipeline = Pipeline::new()
        .set_data_source(DataSourceSettings {
            archive: args.archive_url.clone(),
            chain: args.rpc_url.clone(),
        })
        .set_block_range(range)
        .set_safety_depth(args.safety_depth);

    let log_addresses = parse_addresses(&args.address, "--address")?;
    let topic0: Vec<B256> = args
        .topic0
        .iter()
        .map(|value| {
            value
                .parse::<B256>()
                .wrap_err_with(|| format!("invalid --topic0 value {value:?}"))
        })
        .collect::<Result<_>>()?;
    if !log_addresses.is_empty() || !topic0.is_empty() {
        pipeline = pipeline.add_log(LogOptions {
            address: log_addresses,
            filter: if topic0.is_empty() {
                Vec::new()
            } else {
                vec![topic0]
            },
            range,
        });
    }

    let tx_to = parse_addresses(&args.tx_to, "--tx-to")?;
    let tx_from = parse_addresses(&args.tx_from, "--tx-from")?;
    let sighash: Vec<Sighash> = args
        .sighash
        .iter()
        .map(|value| {
            value
                .parse::<Sighash>()
                .wrap_err_with(|| format!("invalid --sighash selector {value:?}"))
        })
        .collect::<Result<_>>()?;
    if !tx_to.is_empty() || !tx_from.is_empty() || !sighash.is_empty() {
        pipeline = pipeline.add_transaction(TxOptions {
            to: tx_to,
            from: tx_from,
            sighash,
            range,
        });
    }

    let no_filters = args.address.is_empty()
        && args.topic0.is_empty()
        && args.tx_to.is_empty()
        && args.tx_from.is_empty()
        && args.sighash.is_empty();
    if args.include_all_blocks || no_filters {
        pipeline = pipeline.include_all_blocks(range);
    }

    if args.log_transactions {
        let mut fields = sluice_data::FieldSelection::default();
        fields.log.insert("transaction".to_string(), true);
        pipeline = pipeline.set_fields(fields);
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing the current batch");
            flag.store(true, Ordering::Relaxed);
        }
    });
    pipeline = pipeline.with_shutdown(shutdown);

    let progress = ProgressBar::new_spinner();
    progress.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg}")
            .wrap_err("failed to create progress style")?,
    );
    progress.set_message("starting ingestion");
    progress.enable_steady_tick(std::time::Duration::from_millis(100));

    let result = pipeline
        .run(
            &db,
            RawIngestHandler {
                progress: progress.clone(),
            },
        )
        .await;
    progress.finish_and_clear();
    result?;

    info!(
        db_path,
        committed = db.last_committed()?.map(|(height, _)| height),
        "run finished"
    );
    Ok(())
}

fn handle_status(db_path: &str, schema: &str) -> Result<()> {
    let db = Database::new(db_path, schema).wrap_err("failed to open SQLite store")?;

    let committed = db.last_committed()?;
    let hot_depth = db.hot_depth()?;
    let change_rows = db.change_log_len()?;

    let count = |table: &str| db.table_count(table).unwrap_or(0);
    let (blocks, transactions, logs) = (count("blocks"), count("transactions"), count("logs"));

    let last_block_time: Option<i64> = db
        .with_transaction(|tx| {
            let time: Option<i64> = tx
                .query_row("SELECT MAX(timestamp) FROM blocks", [], |row| row.get(0))
                .unwrap_or(None);
            Ok(time)
        })
        .unwrap_or(None);
    let last_block_time = last_block_time
        .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "N/A".to_string());

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Metric", "Value"]);
    table.add_row(vec!["Database Path", db_path]);
    match &committed {
        Some((height, hash)) => {
            table.add_row(vec!["Committed Height", &height.to_string()]);
            table.add_row(vec!["Committed Hash", hash]);
        }
        None => {
            table.add_row(vec!["Committed Height", "none"]);
        }
    }
    table.add_row(vec!["Hot (unfinalized) Blocks", &hot_depth.to_string()]);
    table.add_row(vec!["Pending Change Records", &change_rows.to_string()]);
    table.add_row(vec!["Blocks", &blocks.to_string()]);
    table.add_row(vec!["Transactions", &transactions.to_string()]);
    table.add_row(vec!["Logs", &logs.to_string()]);
    table.add_row(vec!["Last Block Time", &last_block_time]);

    println!("\n{table}\n");

    info!(
        committed = committed.map(|(height, _)| height),
        hot_depth,
        change_rows,
        "status command completed"
    );
    Ok(())
}
