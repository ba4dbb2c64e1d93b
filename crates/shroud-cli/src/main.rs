//! shroud: encrypted, deduplicating directory mirror for S3 buckets
//!
//! Commands:
//!   sync <path>                      - mirror a local tree into the bucket
//!   restore --filter <glob> --dest   - restore matching files into a directory
//!   restore-file <name> <out>        - restore a single file
//!   purge --yes                      - delete every object in the bucket
//!   config show                      - display current configuration

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::{ExposeSecret, SecretString};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use shroud_core::ShroudConfig;
use shroud_crypto::KdfParams;
use shroud_storage::{ObjectStore, OpendalStore};
use shroud_sync::{ProgressFn, RemoteRecord, Restorer, SyncEngine, SyncOptions, SyncPhase, SyncReport};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "shroud",
    version,
    about = "Encrypted directory mirror for S3 buckets",
    long_about = "shroud: mirror a local tree into an S3 bucket with client-side encryption, \
                  content deduplication and rename detection"
)]
struct Cli {
    /// Path to config.toml
    #[arg(
        long,
        short = 'c',
        env = "SHROUD_CONFIG",
        default_value = "~/.config/shroud/config.toml"
    )]
    config: PathBuf,

    /// Log level or filter directive (default: config log.level)
    #[arg(long, env = "SHROUD_LOG")]
    log: Option<String>,

    /// Log format (default: config log.format)
    #[arg(long, env = "SHROUD_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Bucket to use (overrides config storage.bucket)
    #[arg(long, short = 'b', global = true)]
    bucket: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Mirror a local directory tree into the bucket
    ///
    /// Credentials are read from AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY
    /// (or SHROUD_ACCESS_KEY_ID / SHROUD_SECRET_ACCESS_KEY). The passphrase
    /// comes from SHROUD_PASSPHRASE or an interactive prompt.
    Sync(SyncArgs),

    /// Restore every remote file whose name matches a glob
    Restore {
        /// Glob over remote file names (e.g. "docs/**")
        #[arg(long, short = 'f', default_value = "*")]
        filter: String,
        /// Directory to restore into
        #[arg(long, short = 'd')]
        dest: Option<PathBuf>,
        /// Only list matching files
        #[arg(long)]
        list: bool,
    },

    /// Restore a single remote file to a local path
    #[command(name = "restore-file")]
    RestoreFile {
        /// Remote file name (path relative to the synced root)
        name: String,
        /// Output path; must not exist
        out: PathBuf,
    },

    /// Delete every object in the bucket, keyfile included
    Purge {
        /// Confirm the purge
        #[arg(long)]
        yes: bool,
        /// Deletes in flight
        #[arg(long, default_value_t = 16)]
        concurrency: usize,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args, Debug)]
struct SyncArgs {
    /// Local directory (default: config sync.root)
    path: Option<PathBuf>,
    /// Delete remote objects with no live local counterpart
    #[arg(long)]
    delete: bool,
    /// Upload workers (overrides config sync.workers)
    #[arg(long, short = 'w')]
    workers: Option<usize>,
    /// Do not upload renames and touches
    #[arg(long)]
    skip_renames: bool,
    /// Re-seal the master key under a new passphrase before syncing
    ///
    /// The new passphrase comes from SHROUD_NEW_PASSPHRASE or a prompt.
    #[arg(long)]
    rotate_passphrase: bool,
    /// Print the run report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let mut config = ShroudConfig::load(&config_path)
        .with_context(|| format!("loading config: {}", config_path.display()))?;
    if let Some(bucket) = &cli.bucket {
        config.storage.bucket = bucket.clone();
    }

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.clone().unwrap_or(match config.log.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, &format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        bucket = %config.storage.bucket,
        "shroud starting"
    );

    match cli.command {
        Commands::Sync(args) => cmd_sync(&config, args).await,
        Commands::Restore { filter, dest, list } => {
            cmd_restore(&config, &filter, dest.as_deref(), list).await
        }
        Commands::RestoreFile { name, out } => cmd_restore_file(&config, &name, &out).await,
        Commands::Purge { yes, concurrency } => cmd_purge(&config, yes, concurrency).await,
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &config_path),
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

// ── Store and secrets from the environment ────────────────────────────────────

fn open_store(config: &ShroudConfig) -> Result<Arc<dyn ObjectStore>> {
    let access_key = std::env::var("AWS_ACCESS_KEY_ID")
        .or_else(|_| std::env::var("SHROUD_ACCESS_KEY_ID"))
        .context(
            "S3 credentials not set\n\
             Set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY environment variables.\n\
             Example:\n\
             \texport AWS_ACCESS_KEY_ID=your-key\n\
             \texport AWS_SECRET_ACCESS_KEY=your-secret",
        )?;
    let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY")
        .or_else(|_| std::env::var("SHROUD_SECRET_ACCESS_KEY"))
        .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;

    let store = OpendalStore::connect(&config.storage, &access_key, &secret_key)
        .context("building storage operator")?;
    Ok(Arc::new(store))
}

fn read_passphrase(env_var: &str, prompt: &str) -> Result<SecretString> {
    if let Ok(value) = std::env::var(env_var) {
        return Ok(SecretString::from(value));
    }
    let value = rpassword::prompt_password(prompt).context("reading passphrase")?;
    if value.is_empty() {
        anyhow::bail!("empty passphrase");
    }
    Ok(SecretString::from(value))
}

fn read_new_passphrase() -> Result<SecretString> {
    if let Ok(value) = std::env::var("SHROUD_NEW_PASSPHRASE") {
        return Ok(SecretString::from(value));
    }
    let first = SecretString::from(
        rpassword::prompt_password("New passphrase: ").context("reading passphrase")?,
    );
    if first.expose_secret().is_empty() {
        anyhow::bail!("empty passphrase");
    }
    let second = rpassword::prompt_password("Repeat new passphrase: ")
        .context("reading passphrase")?;
    if first.expose_secret() != second.as_str() {
        anyhow::bail!("passphrases do not match");
    }
    Ok(first)
}

// ── Progress display ──────────────────────────────────────────────────────────

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}") {
        pb.set_style(style);
    }
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn spinner_progress(pb: &ProgressBar) -> ProgressFn {
    let pb = pb.clone();
    Arc::new(move |phase, n, msg| {
        let label = match phase {
            SyncPhase::Indexing => "indexing",
            SyncPhase::Scanning => "scanned",
            SyncPhase::Uploading => "uploaded",
            SyncPhase::Deleting => "deleted",
        };
        pb.set_message(format!("{label} {n}: {msg}"));
    })
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

// ── `shroud sync` ─────────────────────────────────────────────────────────────

async fn cmd_sync(config: &ShroudConfig, args: SyncArgs) -> Result<()> {
    let root = args
        .path
        .or_else(|| config.sync.root.clone())
        .context("no directory to sync: pass a path or set sync.root in the config")?;
    let root = expand_tilde(&root);

    let mut opts = SyncOptions::from_config(config);
    opts.delete_orphans |= args.delete;
    opts.skip_renames |= args.skip_renames;
    if let Some(workers) = args.workers {
        opts.workers = workers;
    }

    let store = open_store(config)?;
    let passphrase = read_passphrase("SHROUD_PASSPHRASE", "Passphrase: ")?;

    eprintln!(
        "Syncing {} → {} (endpoint: {})",
        root.display(),
        config.storage.bucket,
        config.storage.endpoint,
    );

    let pb = make_spinner("sync");
    pb.set_message("opening keyfile...");
    let engine = SyncEngine::open(store, &passphrase, opts)
        .await
        .context("opening keyfile")?
        .with_progress(spinner_progress(&pb));
    if engine.created_keyfile() {
        pb.println(format!("Created a new keyfile in bucket {}", config.storage.bucket));
    }

    if args.rotate_passphrase {
        let new_passphrase = pb.suspend(read_new_passphrase)?;
        engine
            .rotate_passphrase(&new_passphrase)
            .await
            .context("rotating passphrase")?;
        pb.println("Passphrase rotated");
    }

    let report = engine
        .run(&root)
        .await
        .with_context(|| format!("syncing {}", root.display()))?;
    pb.finish_and_clear();

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serializing report")?
        );
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &SyncReport) {
    println!("Sync complete:");
    println!("  scanned:    {} files", report.scanned);
    println!("  unchanged:  {} files", report.identity_matches);
    println!(
        "  renamed:    {} files (matched existing content)",
        report.content_matches
    );
    println!(
        "  uploaded:   {} bodies, {} names ({})",
        report.uploaded_bodies,
        report.uploaded_namefiles,
        fmt_bytes(report.bytes_uploaded)
    );
    if report.deduplicated > 0 {
        println!("  dedup:      {} files shared a body", report.deduplicated);
    }
    if report.skipped_renames > 0 {
        println!("  skipped:    {} renames", report.skipped_renames);
    }
    println!("  deleted:    {} objects", report.deleted);
    if report.local_errors > 0 {
        println!("  unreadable: {} files (see log)", report.local_errors);
    }
}

// ── `shroud restore` / `shroud restore-file` ──────────────────────────────────

async fn open_restorer(config: &ShroudConfig) -> Result<Restorer> {
    let store = open_store(config)?;
    let passphrase = read_passphrase("SHROUD_PASSPHRASE", "Passphrase: ")?;
    let restorer = Restorer::open(
        store,
        &passphrase,
        &KdfParams::from(&config.crypto),
        config.sync.stream_chunk_size,
    )
    .await
    .with_context(|| format!("opening bucket {}", config.storage.bucket))?;
    Ok(restorer.with_staging_dir(config.sync.staging_dir.clone()))
}

/// Whether a remote name can be joined under a destination directory
/// without escaping it.
fn is_contained(local_name: &str) -> bool {
    let path = Path::new(local_name);
    !local_name.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)))
}

async fn cmd_restore(
    config: &ShroudConfig,
    filter: &str,
    dest: Option<&Path>,
    list: bool,
) -> Result<()> {
    let pattern =
        glob::Pattern::new(filter).with_context(|| format!("invalid filter glob: {filter}"))?;
    let restorer = open_restorer(config).await?;
    let selected = |r: &RemoteRecord| pattern.matches(r.local_name());

    if list {
        for record in restorer.records().filter(|r| selected(*r)) {
            println!("{:>10}  {}", fmt_bytes(record.size()), record.local_name());
        }
        return Ok(());
    }

    let dest = dest.context("--dest is required unless --list is given")?;
    let unsafe_names: Vec<&str> = restorer
        .records()
        .filter(|r| selected(*r) && !is_contained(r.local_name()))
        .map(RemoteRecord::local_name)
        .collect();
    for name in &unsafe_names {
        tracing::warn!(name = %name, "skipping remote name that escapes the destination");
    }

    let pb = make_spinner("restore");
    let report = restorer
        .restore_by_filter(
            |r| selected(r) && is_contained(r.local_name()),
            |r| {
                pb.set_message(r.local_name().to_string());
                dest.join(r.local_name())
            },
        )
        .await
        .context("restore failed")?;
    pb.finish_and_clear();

    println!("Restore complete:");
    println!("  restored: {} files ({})", report.restored, fmt_bytes(report.bytes));
    println!("  into:     {}", dest.display());
    Ok(())
}

async fn cmd_restore_file(config: &ShroudConfig, name: &str, out: &Path) -> Result<()> {
    let restorer = open_restorer(config).await?;
    let bytes = restorer
        .restore_single(name, out)
        .await
        .with_context(|| format!("restoring {name}"))?;
    println!("Restored {name} → {} ({})", out.display(), fmt_bytes(bytes));
    Ok(())
}

// ── `shroud purge` ────────────────────────────────────────────────────────────

async fn cmd_purge(config: &ShroudConfig, yes: bool, concurrency: usize) -> Result<()> {
    if !yes {
        anyhow::bail!(
            "purge deletes every object in bucket {} including the keyfile; re-run with --yes",
            config.storage.bucket
        );
    }
    let store = open_store(config)?;
    let pb = make_spinner("purge");
    let deleted = shroud_sync::purge_bucket(store, concurrency, Some(spinner_progress(&pb)))
        .await
        .context("purging bucket")?;
    pb.finish_and_clear();
    println!("Deleted {deleted} objects from {}", config.storage.bucket);
    Ok(())
}

// ── `shroud config show` ──────────────────────────────────────────────────────

fn cmd_config_show(config: &ShroudConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}
