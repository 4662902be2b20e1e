//! Command-line front end: configure folders, run scans, and report
//! duplicate groups.

mod config;

use anyhow::bail;
use clap::{Parser, Subcommand};
use config::Config;
use ditto_engine::cancel::CancelSource;
use ditto_engine::hash::{DispatchMode, HashOptions};
use ditto_engine::orchestrator::{OrchestratorOptions, ScanQueue};
use ditto_engine::scan::PipelineConfig;
use ditto_store::{Database, Store};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ditto", version, about = "Find duplicate files across configured folders")]
struct Cli {
    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Less logging (-q warnings only)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    quiet: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage scan root folders
    Folder {
        #[command(subcommand)]
        action: FolderAction,
    },
    /// Scan roots and hash their candidate files
    Scan {
        /// Root directories to scan (created as folders if new)
        paths: Vec<PathBuf>,
        /// Scan every configured folder
        #[arg(long)]
        all: bool,
        /// Hash workers per scan
        #[arg(long, default_value_t = 6)]
        hash_workers: usize,
        /// Walker throttle in files per second (0 = full speed)
        #[arg(long, default_value_t = 0)]
        max_files_per_second: u32,
        /// Hash throttle in hashes per second (0 = full speed)
        #[arg(long, default_value_t = 0)]
        max_hashes_per_second: u32,
        /// Dispatch hash jobs via per-row atomic claims instead of one
        /// streaming producer
        #[arg(long)]
        claim: bool,
    },
    /// Resume a scan that never finished its walk or hash phase
    Continue {
        scan_id: i64,
    },
    /// Report duplicate groups (latest scan per folder unless --scan)
    Duplicates {
        /// Restrict to one scan
        #[arg(long)]
        scan: Option<i64>,
        #[arg(long, default_value_t = 1)]
        page: i64,
        #[arg(long, default_value_t = 20)]
        per_page: i64,
    },
    /// Print the resolved configuration
    Config,
}

#[derive(Subcommand)]
enum FolderAction {
    /// Register a directory as a scan root
    Add { path: PathBuf },
    /// List configured scan roots
    List,
    /// Remove a scan root by id
    Remove { id: i64 },
}

fn init_tracing(verbose: u8, quiet: u8) {
    let level = match i16::from(verbose) - i16::from(quiet) {
        i16::MIN..=-2 => Level::ERROR,
        -1 => Level::WARN,
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let env_filter = EnvFilter::from_default_env().add_directive(level.into());
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    if let Err(err) = run(cli).await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;
    std::fs::create_dir_all(&config.data_dir)?;
    let db = Database::connect(&config.database_url).await?;
    let store = Store::from(&db);

    match cli.command {
        Command::Folder { action } => run_folder(&store, action).await,
        Command::Scan { paths, all, hash_workers, max_files_per_second, max_hashes_per_second, claim } => {
            let options = OrchestratorOptions {
                max_files_per_second,
                hash: HashOptions {
                    workers: hash_workers,
                    max_hashes_per_second,
                    mode: if claim { DispatchMode::Claim } else { DispatchMode::Stream },
                },
                pipeline: PipelineConfig::from_env(),
            };
            run_scan_command(&store, paths, all, options).await
        }
        Command::Continue { scan_id } => run_continue(&store, scan_id).await,
        Command::Duplicates { scan, page, per_page } => {
            let scan_ids = match scan {
                Some(id) => vec![id],
                None => store.latest_scan_per_folder().await?,
            };
            print_duplicate_report(&store, &scan_ids, page, per_page).await
        }
        Command::Config => {
            println!("database_url: {}", config.database_url);
            println!("data_dir: {}", config.data_dir.display());
            println!("port: {}", config.port);
            println!("pipeline: {:?}", PipelineConfig::from_env());
            Ok(())
        }
    }
}

async fn run_folder(store: &Store, action: FolderAction) -> anyhow::Result<()> {
    match action {
        FolderAction::Add { path } => {
            let id = store.get_or_create_folder_by_path(&path).await?;
            let folder = store.get_folder(id).await?;
            println!("folder {} -> {}", folder.id, folder.path);
        }
        FolderAction::List => {
            for folder in store.list_folders().await? {
                println!("{}\t{}\t{}", folder.id, folder.path, folder.created_at);
            }
        }
        FolderAction::Remove { id } => {
            if store.delete_folder(id).await? {
                println!("folder {id} removed");
            } else {
                bail!("folder {id} not found");
            }
        }
    }
    Ok(())
}

/// Enqueue one scan per root onto the orchestrator queue (the same contract
/// the scheduler uses) and drain it serially.
async fn run_scan_command(
    store: &Store,
    paths: Vec<PathBuf>,
    all: bool,
    options: OrchestratorOptions,
) -> anyhow::Result<()> {
    let mut roots = paths;
    if all {
        roots.extend(store.list_folders().await?.into_iter().map(|f| PathBuf::from(f.path)));
    }
    if roots.is_empty() {
        bail!("nothing to scan: pass one or more paths, or --all");
    }

    let queue = ScanQueue::new();
    let mut scan_ids = Vec::new();
    for root in &roots {
        let folder_id = store.get_or_create_folder_by_path(root).await?;
        let scan = store.create_scan(folder_id).await?;
        queue.enqueue(scan.id)?;
        scan_ids.push(scan.id);
    }

    let token = drain_with_ctrl_c(&queue, store, &options).await;
    if token.is_cancelled() {
        println!("interrupted; rerun `ditto continue <scan-id>` to resume");
    }
    for scan_id in &scan_ids {
        print_scan_summary(store, *scan_id).await?;
    }
    print_duplicate_report(store, &scan_ids, 1, 20).await
}

async fn run_continue(store: &Store, scan_id: i64) -> anyhow::Result<()> {
    let scan = store.get_scan(scan_id).await?;
    if scan.is_complete() {
        println!("scan {scan_id} is already complete");
        return print_scan_summary(store, scan_id).await;
    }
    // Return any files stuck in `hashing` from a cancelled run to the queue.
    store.reset_hash_status_hashing_to_pending(scan_id).await?;

    let queue = ScanQueue::new();
    queue.enqueue(scan_id)?;
    drain_with_ctrl_c(&queue, store, &OrchestratorOptions::default()).await;
    print_scan_summary(store, scan_id).await
}

/// Drain the queue while a Ctrl-C handler feeds the cancellation token.
async fn drain_with_ctrl_c(
    queue: &ScanQueue,
    store: &Store,
    options: &OrchestratorOptions,
) -> ditto_engine::cancel::CancelToken {
    let source = CancelSource::new();
    let token = source.token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after the current operation");
            source.cancel();
        }
    });
    queue.run_until_drained(&token, store, options).await;
    token
}

async fn print_scan_summary(store: &Store, scan_id: i64) -> anyhow::Result<()> {
    let scan = store.get_scan(scan_id).await?;
    println!("scan {} of {}", scan.id, scan.root_path);
    match scan.completed_at {
        Some(completed) => println!(
            "  walk: {} files, {} skipped (finished {})",
            scan.file_count.unwrap_or(0),
            scan.scan_skipped_count.unwrap_or(0),
            completed,
        ),
        None => println!("  walk: incomplete"),
    }
    match scan.hash_completed_at {
        Some(_) => println!(
            "  hash: {} files, {} ({} reused, {} errors)",
            scan.hashed_file_count.unwrap_or(0),
            format_bytes(scan.hashed_byte_count.unwrap_or(0)),
            scan.hash_reused_count.unwrap_or(0),
            scan.hash_error_count.unwrap_or(0),
        ),
        None => println!("  hash: incomplete"),
    }
    Ok(())
}

async fn print_duplicate_report(
    store: &Store,
    scan_ids: &[i64],
    page: i64,
    per_page: i64,
) -> anyhow::Result<()> {
    if scan_ids.is_empty() {
        println!("no scans to report on");
        return Ok(());
    }
    let total = store.duplicate_groups_by_hash_count_across_scans(scan_ids).await?;
    println!("{total} duplicate group(s)");
    let offset = (page.max(1) - 1) * per_page;
    let groups = store.duplicate_groups_by_hash_across_scans(scan_ids, per_page, offset).await?;
    for group in groups {
        println!(
            "{}  {} files  {}",
            &group.hash[..group.hash.len().min(12)],
            group.count,
            format_bytes(group.size),
        );
        for file in store.files_in_hash_group_across_scans(scan_ids, &group.hash, 0).await? {
            println!("  {}", file.path);
        }
    }
    Ok(())
}

fn format_bytes(n: i64) -> String {
    const UNIT: f64 = 1024.0;
    if n < 1024 {
        return format!("{n} B");
    }
    let mut value = n as f64 / UNIT;
    for unit in ["KB", "MB", "GB"] {
        if value < UNIT {
            return format!("{value:.1} {unit}");
        }
        value /= UNIT;
    }
    format!("{value:.1} TB")
}
