mod output;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use output::{
    DumpOutput, InitOutput, MaintenanceOutput, OutputWriter, PopulateOutput, PurgeOutput,
    StatsOutput, StatusOutput, SyncOutput, format_bytes,
};
use stash_core::{LocalDepot, PopulateRequest, Repository, RepositoryConfig, SyncRequest};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Stash - A content-addressed workspace cache
#[derive(Parser)]
#[command(name = "stash")]
#[command(about = "Workspace cache and incremental sync for version control streams", long_about = None)]
#[command(version)]
struct Cli {
    /// Repository directory (defaults to STASH_ROOT env var or ./stash-repo)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Depot directory served to the repository (defaults to STASH_DEPOT env var)
    #[arg(short, long, global = true)]
    depot: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Client workspace name used against the depot
    #[arg(short, long, global = true, default_value = "stash")]
    client: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new repository, replacing anything in the directory
    Init {
        /// Recreate the repository if one already exists
        #[arg(long)]
        force: bool,

        /// Number of concurrent fetch workers
        #[arg(long)]
        sync_threads: Option<usize>,

        /// Maximum size of one fetch batch (e.g. 256M)
        #[arg(long, value_parser = parse_size)]
        max_batch_bytes: Option<u64>,

        /// Free space to keep on the workspace volume (e.g. 50G)
        #[arg(long, value_parser = parse_size)]
        min_scratch_space: Option<u64>,

        /// Seconds between state checkpoints while fetching
        #[arg(long)]
        checkpoint_interval: Option<u64>,

        /// Keep synced stream snapshots in the repository
        #[arg(long)]
        persist_snapshots: bool,
    },

    /// Switch the workspace to a stream
    Sync {
        /// Stream to sync, such as //main
        stream: String,

        /// Change number (defaults to the latest change)
        #[arg(long)]
        change: Option<u32>,

        /// View entry; prefix with '-' to exclude (repeatable)
        #[arg(long = "view", allow_hyphen_values = true)]
        view: Vec<String>,

        /// Delete files in the workspace that the repository does not track
        #[arg(long)]
        remove_untracked: bool,

        /// Snapshot file shared with other machines syncing the same stream
        #[arg(long)]
        snapshot_cache: Option<PathBuf>,
    },

    /// Restore modified workspace files to their tracked state
    Clean {
        /// Also delete untracked files
        #[arg(long)]
        remove_untracked: bool,
    },

    /// Move every workspace file into the cache
    Clear,

    /// Evict the oldest cached files until the cache fits a budget
    Purge {
        /// Size budget for the cache (e.g. 0, 500M, 20G)
        #[arg(value_parser = parse_size)]
        max_bytes: u64,
    },

    /// Verify the cache and workspace against the disk
    Repair,

    /// Show cache and workspace sizes and local modifications
    Status,

    /// Fill the cache with the content of several streams
    Populate {
        /// Streams to populate from
        #[arg(required = true)]
        streams: Vec<String>,

        /// View entry applied to every stream (repeatable)
        #[arg(long = "view", allow_hyphen_values = true)]
        view: Vec<String>,
    },

    /// Print the cache and workspace contents
    Dump,

    /// Compare the content of several streams
    Stats {
        /// Streams to compare
        #[arg(required = true)]
        streams: Vec<String>,

        /// View entry applied to every stream (repeatable)
        #[arg(long = "view", allow_hyphen_values = true)]
        view: Vec<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let writer = OutputWriter::new(cli.json);

    // Determine repository root: CLI arg > STASH_ROOT env var > ./stash-repo default
    let root = cli
        .root
        .clone()
        .or_else(|| std::env::var("STASH_ROOT").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./stash-repo"));
    let depot = cli
        .depot
        .clone()
        .or_else(|| std::env::var("STASH_DEPOT").ok().map(PathBuf::from));
    debug!(
        "Repository {}, depot {}",
        root.display(),
        depot
            .as_deref()
            .map_or_else(|| "<none>".to_string(), |path| path.display().to_string())
    );

    let result = match cli.command {
        Commands::Init {
            force,
            sync_threads,
            max_batch_bytes,
            min_scratch_space,
            checkpoint_interval,
            persist_snapshots,
        } => {
            let defaults = RepositoryConfig::default();
            let config = RepositoryConfig {
                sync_threads: sync_threads.unwrap_or(defaults.sync_threads),
                max_batch_bytes: max_batch_bytes.unwrap_or(defaults.max_batch_bytes),
                min_scratch_space: min_scratch_space.unwrap_or(defaults.min_scratch_space),
                checkpoint_interval: checkpoint_interval
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.checkpoint_interval),
                persist_snapshots,
            };
            cmd_init(&root, config, force, &writer)
        }
        Commands::Sync {
            stream,
            change,
            view,
            remove_untracked,
            snapshot_cache,
        } => {
            let request = SyncRequest {
                client: cli.client,
                stream,
                change,
                view,
                remove_untracked,
                snapshot_cache,
            };
            cmd_sync(&root, depot.as_deref(), &request, &writer)
        }
        Commands::Clean { remove_untracked } => cmd_clean(&root, remove_untracked, &writer),
        Commands::Clear => cmd_clear(&root, &writer),
        Commands::Purge { max_bytes } => cmd_purge(&root, max_bytes, &writer),
        Commands::Repair => cmd_repair(&root, &writer),
        Commands::Status => cmd_status(&root, &writer),
        Commands::Populate { streams, view } => {
            let requests: Vec<PopulateRequest> = streams
                .into_iter()
                .map(|stream| PopulateRequest {
                    client: cli.client.clone(),
                    stream,
                    view: view.clone(),
                })
                .collect();
            cmd_populate(&root, depot.as_deref(), &requests, &writer)
        }
        Commands::Dump => cmd_dump(&root, &writer),
        Commands::Stats { streams, view } => {
            cmd_stats(&root, depot.as_deref(), &cli.client, &streams, &view, &writer)
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = result_code(&e);
            writer.write_error(&e, code);
            ExitCode::from(code)
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("STASH_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Exit code for a failed command, distinguishing the failures scripts
/// usually react to.
fn result_code(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<stash_core::Error>() {
        Some(stash_core::Error::RepositoryLocked { .. }) => 2,
        Some(stash_core::Error::InsufficientSpace { .. }) => 3,
        Some(stash_core::Error::Cancelled) => 4,
        _ => 1,
    }
}

/// Parse a byte count with an optional K, M, G or T suffix (powers of 1024).
fn parse_size(value: &str) -> std::result::Result<u64, String> {
    let value = value.trim();
    let (digits, multiplier) = match value.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => {
            let multiplier: u64 = match c.to_ascii_uppercase() {
                'K' => 1 << 10,
                'M' => 1 << 20,
                'G' => 1 << 30,
                'T' => 1 << 40,
                _ => return Err(format!("unknown size suffix '{}'", c)),
            };
            (&value[..i], multiplier)
        }
        _ => (value, 1),
    };
    let number: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid size '{}'", value))?;
    number
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size '{}' is too large", value))
}

fn open_depot(depot: Option<&Path>) -> Result<LocalDepot> {
    let depot = depot.context("No depot given (use --depot or STASH_DEPOT)")?;
    if !depot.is_dir() {
        anyhow::bail!("Depot not found: {}", depot.display());
    }
    Ok(LocalDepot::new(depot))
}

fn open_repository(root: &Path) -> Result<Repository> {
    Repository::load(root)
        .with_context(|| format!("Failed to open repository at {}", root.display()))
}

fn cmd_init(root: &Path, config: RepositoryConfig, force: bool, writer: &OutputWriter) -> Result<()> {
    if Repository::exists(root) && !force {
        anyhow::bail!(
            "A repository already exists at {} (use --force to recreate it)",
            root.display()
        );
    }
    if force && Repository::exists(root) {
        warn!("Recreating repository at {}", root.display());
    }
    let repo = Repository::create(root, config)
        .with_context(|| format!("Failed to create repository at {}", root.display()))?;

    let output = InitOutput {
        success: true,
        result_code: 0,
        root: root.display().to_string(),
        workspace: repo.workspace_dir().display().to_string(),
    };
    writer.write(&output, || {
        format!(
            "Initialized stash repository at {}\nWorkspace: {}\n",
            root.display(),
            repo.workspace_dir().display()
        )
    })
}

fn cmd_sync(
    root: &Path,
    depot: Option<&Path>,
    request: &SyncRequest,
    writer: &OutputWriter,
) -> Result<()> {
    let depot = open_depot(depot)?;
    let mut repo = Repository::load_or_create(root, false)
        .with_context(|| format!("Failed to open repository at {}", root.display()))?;

    let stats = repo
        .sync(&depot, request)
        .with_context(|| format!("Failed to sync {}", request.stream))?;
    if repo.requires_repair() {
        warn!("Some files could not be staged; the repository will be repaired on next use");
    }

    let text = format!(
        "Synced {} at change {} ({} files)\n\
         Removed: {} deleted, {} moved to cache, {} directories, {} failed\n\
         Added: {} from cache, {} copied, {} fetched ({}) in {} batches\n\
         Completed in {:.1}s\n",
        stats.stream,
        stats.change,
        stats.files_in_snapshot,
        stats.removed.files_deleted,
        stats.removed.files_moved_to_cache,
        stats.removed.directories_deleted,
        stats.removed.delete_failures,
        stats.added.files_moved_from_cache,
        stats.added.files_copied,
        stats.added.files_fetched,
        format_bytes(stats.added.bytes_fetched),
        stats.added.fetch_batches,
        stats.elapsed_secs,
    );
    let output = SyncOutput {
        success: true,
        result_code: 0,
        completed_at: Utc::now(),
        workspace: repo.workspace_dir().display().to_string(),
        stats,
    };
    writer.write(&output, || text)
}

fn write_maintenance(writer: &OutputWriter, operation: &str, text: String) -> Result<()> {
    let output = MaintenanceOutput {
        success: true,
        result_code: 0,
        operation: operation.to_string(),
        completed_at: Utc::now(),
    };
    writer.write(&output, || text)
}

fn cmd_clean(root: &Path, remove_untracked: bool, writer: &OutputWriter) -> Result<()> {
    let mut repo = open_repository(root)?;
    repo.clean(remove_untracked)
        .with_context(|| format!("Failed to clean workspace {}", repo.workspace_dir().display()))?;
    write_maintenance(writer, "clean", "Workspace cleaned\n".to_string())
}

fn cmd_clear(root: &Path, writer: &OutputWriter) -> Result<()> {
    let mut repo = open_repository(root)?;
    repo.clear()
        .with_context(|| format!("Failed to clear workspace {}", repo.workspace_dir().display()))?;
    write_maintenance(
        writer,
        "clear",
        format!("Workspace cleared; {} files cached\n", repo.cache().len()),
    )
}

fn cmd_purge(root: &Path, max_bytes: u64, writer: &OutputWriter) -> Result<()> {
    let mut repo = open_repository(root)?;
    let stats = repo
        .purge(max_bytes)
        .with_context(|| "Failed to purge cache")?;

    let text = format!(
        "Removed {} files ({}), {} remaining\nCache size: {}\n",
        stats.files_removed,
        format_bytes(stats.bytes_freed),
        stats.files_remaining,
        format_bytes(stats.new_size),
    );
    let output = PurgeOutput {
        success: true,
        result_code: 0,
        max_bytes,
        stats,
    };
    writer.write(&output, || text)
}

fn cmd_repair(root: &Path, writer: &OutputWriter) -> Result<()> {
    let mut repo = open_repository(root)?;
    repo.repair().with_context(|| "Failed to repair repository")?;
    write_maintenance(writer, "repair", "Repository repaired\n".to_string())
}

fn cmd_status(root: &Path, writer: &OutputWriter) -> Result<()> {
    let repo = open_repository(root)?;
    let status = repo
        .status()
        .with_context(|| "Failed to read repository status")?;

    let mut text = format!(
        "Repository: {}\nCache: {} files, {}\nWorkspace: {} files, {}\n",
        root.display(),
        status.cache_files,
        format_bytes(status.cache_size),
        status.workspace_files,
        format_bytes(status.workspace_size),
    );
    if status.requires_repair {
        text.push_str("Repair required\n");
    }
    if status.differences.is_empty() {
        text.push_str("No local modifications\n");
    } else {
        for difference in &status.differences {
            text.push_str(difference);
            text.push('\n');
        }
    }
    let output = StatusOutput {
        success: true,
        result_code: 0,
        root: root.display().to_string(),
        status,
    };
    writer.write(&output, || text)
}

fn cmd_populate(
    root: &Path,
    depot: Option<&Path>,
    requests: &[PopulateRequest],
    writer: &OutputWriter,
) -> Result<()> {
    let depot = open_depot(depot)?;
    let mut repo = Repository::load_or_create(root, false)
        .with_context(|| format!("Failed to open repository at {}", root.display()))?;
    let stats = repo
        .populate(&depot, requests)
        .with_context(|| "Failed to populate cache")?;

    let mut text = String::new();
    for stream in &stats.streams {
        text.push_str(&format!(
            "{} at change {}: {} fetched ({}), {} from cache\n",
            stream.stream,
            stream.change,
            stream.added.files_fetched,
            format_bytes(stream.added.bytes_fetched),
            stream.added.files_moved_from_cache,
        ));
    }
    text.push_str(&format!(
        "Total content: {}, shared by all streams: {}\n",
        format_bytes(stats.total_bytes),
        format_bytes(stats.shared_bytes),
    ));
    let output = PopulateOutput {
        success: true,
        result_code: 0,
        completed_at: Utc::now(),
        stats,
    };
    writer.write(&output, || text)
}

fn cmd_dump(root: &Path, writer: &OutputWriter) -> Result<()> {
    let repo = open_repository(root)?;
    let lines = repo.dump();
    let text: String = lines.iter().map(|line| format!("{}\n", line)).collect();
    let output = DumpOutput {
        success: true,
        result_code: 0,
        lines,
    };
    writer.write(&output, || text)
}

fn cmd_stats(
    root: &Path,
    depot: Option<&Path>,
    client: &str,
    streams: &[String],
    view: &[String],
    writer: &OutputWriter,
) -> Result<()> {
    let depot = open_depot(depot)?;
    let mut repo = open_repository(root)?;
    let stats = repo
        .stats(&depot, client, streams, view)
        .with_context(|| "Failed to compute stream stats")?;

    let text: String = stats.to_table().iter().map(|line| format!("{}\n", line)).collect();
    let output = StatsOutput {
        success: true,
        result_code: 0,
        stats,
    };
    writer.write(&output, || text)
}
