//! ferry: resumable, verified chunked file transfers
//!
//! Commands:
//!   start <source> <dest>   - start a transfer and follow it (Ctrl-C pauses)
//!   resume <id>             - resume a paused or failed transfer
//!   cancel <id>             - stop a transfer and delete its output and state
//!   list                    - list known transfers
//!   status <id>             - show progress of one transfer
//!   cleanup                 - forget completed transfers past retention
//!   unpack <id> <output>    - decode a compressed/encrypted destination
//!   keygen <path>           - write a new random transfer key file
//!   config show             - display current configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use ferry_core::config::{expand_tilde, FerryConfig};
use ferry_core::{TransferOptions, TransferStatus};
use ferry_crypto::{generate_transfer_key, KdfParams, TransferKey};
use ferry_transfer::{
    JsonSessionStore, KeySource, ManagerSettings, SessionStateStore, TransferManager,
    TransferProgress, TransferSession,
};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "ferry",
    version,
    about = "Resumable chunked file transfers",
    long_about = "ferry: copy large files in verified chunks that survive interruption"
)]
struct Cli {
    /// Path to ferry.toml configuration file
    #[arg(long, short = 'c', env = "FERRY_CONFIG", default_value = "~/.config/ferry/ferry.toml")]
    config: PathBuf,

    /// Override the state directory from the config file
    #[arg(long, env = "FERRY_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a transfer and follow its progress
    ///
    /// Press Ctrl-C to pause; the transfer can be resumed later with
    /// `ferry resume <id>`.
    Start {
        source: PathBuf,
        destination: PathBuf,
        #[command(flatten)]
        opts: StartArgs,
    },

    /// Resume a paused or failed transfer
    Resume { transfer_id: String },

    /// Cancel a transfer, deleting its destination and state record
    Cancel { transfer_id: String },

    /// List known transfers
    List,

    /// Show progress of one transfer
    Status {
        transfer_id: String,
        /// Print the progress snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Forget completed transfers older than the retention period
    Cleanup {
        /// Retention in hours (default: cleanup.retention_hours from config)
        #[arg(long)]
        older_than_hours: Option<u64>,
    },

    /// Decode the destination of a compressed or encrypted transfer
    Unpack {
        transfer_id: String,
        output: PathBuf,
    },

    /// Generate a random transfer key and write it (base64) to a file
    Keygen {
        path: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args, Debug)]
struct StartArgs {
    /// Explicit transfer id (default: random UUID)
    #[arg(long)]
    id: Option<String>,
    /// Chunk size in bytes
    #[arg(long)]
    chunk_size: Option<u64>,
    /// Chunks transferred in parallel
    #[arg(long, short = 'j')]
    concurrency: Option<usize>,
    /// Retry budget per chunk
    #[arg(long)]
    retries: Option<u32>,
    /// Compress chunks with zstd
    #[arg(long)]
    compress: bool,
    /// zstd level
    #[arg(long)]
    level: Option<i32>,
    /// Encrypt chunks (needs crypto.key_file or a passphrase)
    #[arg(long)]
    encrypt: bool,
    /// Skip chunk and file digests
    #[arg(long)]
    no_verify: bool,
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
    let mut config = load_config(&config_path).await?;
    if let Some(dir) = &cli.state_dir {
        config.manager.state_dir = dir.clone();
    }
    init_logging(&config.logging.log_level, &config.logging.log_format);
    if !config_path.exists() {
        debug!(path = %config_path.display(), "no config file, using defaults");
    }

    match cli.command {
        Commands::Start {
            source,
            destination,
            opts,
        } => cmd_start(&config, &source, &destination, opts).await,
        Commands::Resume { transfer_id } => cmd_resume(&config, &transfer_id).await,
        Commands::Cancel { transfer_id } => cmd_cancel(&config, &transfer_id).await,
        Commands::List => cmd_list(&config).await,
        Commands::Status { transfer_id, json } => cmd_status(&config, &transfer_id, json).await,
        Commands::Cleanup { older_than_hours } => cmd_cleanup(&config, older_than_hours).await,
        Commands::Unpack {
            transfer_id,
            output,
        } => cmd_unpack(&config, &transfer_id, &output).await,
        Commands::Keygen { path, force } => cmd_keygen(&path, force),
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path),
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

async fn load_config(path: &Path) -> Result<FerryConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))
    } else {
        Ok(FerryConfig::default())
    }
}

fn init_logging(level: &str, format: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout belongs to progress bars and command output
    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn state_store(config: &FerryConfig) -> Result<JsonSessionStore> {
    let dir = expand_tilde(&config.manager.state_dir);
    JsonSessionStore::open(&dir).with_context(|| format!("opening state dir: {}", dir.display()))
}

/// Key material for this invocation. `needed` is false when no session
/// involved is encrypted, in which case no passphrase is asked for.
fn resolve_key_source(config: &FerryConfig, needed: bool) -> Result<KeySource> {
    if !needed {
        return Ok(KeySource::None);
    }

    if let Some(key_file) = &config.crypto.key_file {
        let path = expand_tilde(key_file);
        let encoded = std::fs::read_to_string(&path)
            .with_context(|| format!("reading key file: {}", path.display()))?;
        let key = TransferKey::from_base64(&encoded)
            .with_context(|| format!("parsing key file: {}", path.display()))?;
        debug!(key_file = %path.display(), fingerprint = %key.fingerprint(), "using key file");
        return Ok(KeySource::Key(key));
    }

    let params = KdfParams {
        mem_cost_kib: config.crypto.argon2_mem_cost_kib,
        time_cost: config.crypto.argon2_time_cost,
        parallelism: config.crypto.argon2_parallelism,
    };
    let passphrase = match std::env::var("FERRY_PASSPHRASE") {
        Ok(p) if !p.is_empty() => {
            debug!("using passphrase from FERRY_PASSPHRASE");
            p
        }
        _ => rpassword::prompt_password("Transfer passphrase: ")
            .context("reading passphrase")?,
    };
    Ok(KeySource::passphrase(SecretString::from(passphrase), params))
}

fn build_manager(config: &FerryConfig, keys: KeySource) -> Result<TransferManager> {
    let settings = ManagerSettings::from(&config.manager);
    let manager = TransferManager::builder(settings)
        .key_source(keys)
        .build()
        .context("creating transfer manager")?;
    Ok(manager)
}

/// Whether the persisted session `transfer_id` is encrypted.
fn session_is_encrypted(config: &FerryConfig, transfer_id: &str) -> Result<bool> {
    Ok(state_store(config)?
        .load(transfer_id)
        .is_some_and(|s| s.enable_encryption))
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .with_context(|| format!("path is not valid UTF-8: {}", path.display()))
}

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn progress_message(p: &TransferProgress) -> String {
    let eta = match p.estimated_time_remaining {
        Some(secs) => format!("eta {:.0}s", secs),
        None => "eta --".to_string(),
    };
    format!(
        "{}/{} chunks, {}/s, {}",
        p.completed_chunks,
        p.chunk_count,
        fmt_bytes(p.current_speed as u64),
        eta
    )
}

/// Follow a running transfer until it ends. Ctrl-C pauses it.
async fn follow(manager: &TransferManager, transfer_id: &str) -> Result<()> {
    let total = manager
        .get_progress(transfer_id)
        .map(|p| p.total_size)
        .unwrap_or(0);
    let pb = make_progress_bar(total, "ferry");

    let pb_observer = pb.clone();
    let watched = transfer_id.to_string();
    manager.add_progress_observer(Arc::new(move |id: &str, p: &TransferProgress| {
        if id == watched {
            pb_observer.set_position(p.transferred_size);
            pb_observer.set_message(progress_message(p));
        }
    }));

    let session = tokio::select! {
        session = manager.wait_for(transfer_id) => session,
        _ = tokio::signal::ctrl_c() => {
            pb.set_message("pausing (waiting for in-flight chunks)...");
            if manager.pause_transfer(transfer_id).await {
                pb.abandon_with_message("paused");
                println!("Paused. Resume with: ferry resume {transfer_id}");
                return Ok(());
            }
            manager.wait_for(transfer_id).await
        }
    };
    let session = session.with_context(|| format!("unknown transfer: {transfer_id}"))?;

    match session.status {
        TransferStatus::Completed => {
            pb.finish_with_message("done");
            print_summary(&session);
            Ok(())
        }
        status => {
            pb.abandon_with_message(status.to_string());
            print_summary(&session);
            anyhow::bail!(
                "transfer {} {}: {}",
                session.transfer_id,
                status,
                session.error_message.as_deref().unwrap_or("unknown error")
            )
        }
    }
}

fn print_summary(session: &TransferSession) {
    println!("  id:       {}", session.transfer_id);
    println!("  status:   {}", session.status);
    println!("  bytes:    {}", fmt_bytes(session.total_size));
    println!(
        "  chunks:   {}/{}",
        session.completed_chunks(),
        session.chunks.len()
    );
    let retries: u32 = session.chunks.iter().map(|c| c.retry_count).sum();
    if retries > 0 {
        println!("  retries:  {retries}");
    }
    if let Some(hash) = &session.actual_file_hash {
        println!("  blake3:   {}", &hash[..16.min(hash.len())]);
    }
    if session.transforms_enabled() {
        println!("  note:     destination is packed; restore with `ferry unpack`");
    }
}

// ── Commands ─────────────────────────────────────────────────────────────────

async fn cmd_start(
    config: &FerryConfig,
    source: &Path,
    destination: &Path,
    args: StartArgs,
) -> Result<()> {
    let defaults = &config.transfer;
    let options = TransferOptions {
        transfer_id: args.id,
        chunk_size: args.chunk_size.unwrap_or(defaults.chunk_size),
        max_concurrent_chunks: args.concurrency.unwrap_or(defaults.max_concurrent_chunks),
        max_retry_attempts: args.retries.unwrap_or(defaults.max_retry_attempts),
        enable_compression: args.compress || defaults.enable_compression,
        enable_encryption: args.encrypt || defaults.enable_encryption,
        verify_integrity: !args.no_verify && defaults.verify_integrity,
        compression_level: args.level.unwrap_or(defaults.compression_level),
        metadata: defaults.metadata.clone(),
    };

    let keys = resolve_key_source(config, options.enable_encryption)?;
    let manager = build_manager(config, keys)?;

    println!("Transferring {} → {}", source.display(), destination.display());
    let id = manager
        .start_transfer(path_str(source)?, path_str(destination)?, options)
        .await
        .with_context(|| format!("starting transfer of {}", source.display()))?;
    println!("  id: {id}");

    follow(&manager, &id).await
}

async fn cmd_resume(config: &FerryConfig, transfer_id: &str) -> Result<()> {
    let keys = resolve_key_source(config, session_is_encrypted(config, transfer_id)?)?;
    let manager = build_manager(config, keys)?;
    manager.recover().await?;

    manager
        .try_resume_transfer(transfer_id)
        .await
        .with_context(|| format!("resuming {transfer_id}"))?;
    println!("Resuming {transfer_id}");

    follow(&manager, transfer_id).await
}

async fn cmd_cancel(config: &FerryConfig, transfer_id: &str) -> Result<()> {
    let manager = build_manager(config, KeySource::None)?;
    if manager.cancel_transfer(transfer_id).await {
        println!("Cancelled {transfer_id}");
        Ok(())
    } else {
        anyhow::bail!("{transfer_id} is unknown or already completed")
    }
}

async fn cmd_list(config: &FerryConfig) -> Result<()> {
    let manager = build_manager(config, KeySource::None)?;
    let sessions = manager.inspect_transfers().await?;
    if sessions.is_empty() {
        println!("No transfers.");
        return Ok(());
    }

    println!(
        "{:<38} {:<13} {:>10} {:>8}  SOURCE",
        "ID", "STATUS", "SIZE", "DONE"
    );
    for s in &sessions {
        println!(
            "{:<38} {:<13} {:>10} {:>7.1}%  {}",
            s.transfer_id,
            s.status,
            fmt_bytes(s.total_size),
            manager.progress_for(s).percent,
            s.source_path
        );
    }
    Ok(())
}

async fn cmd_status(config: &FerryConfig, transfer_id: &str, json: bool) -> Result<()> {
    let manager = build_manager(config, KeySource::None)?;
    let session = manager
        .inspect_transfer(transfer_id)
        .await
        .with_context(|| format!("unknown transfer: {transfer_id}"))?;
    let progress = manager.progress_for(&session);

    if json {
        println!("{}", serde_json::to_string_pretty(&progress)?);
        return Ok(());
    }

    println!("Transfer {transfer_id}");
    println!("  status:      {}", progress.status);
    println!("  source:      {}", session.source_path);
    println!("  destination: {}", session.destination_path);
    println!(
        "  progress:    {:.1}% ({} / {})",
        progress.percent,
        fmt_bytes(progress.transferred_size),
        fmt_bytes(progress.total_size)
    );
    println!(
        "  chunks:      {} done, {} failed, {} total",
        progress.completed_chunks, progress.failed_chunks, progress.chunk_count
    );
    if let Some(reason) = &session.error_message {
        println!("  error:       {reason}");
    }
    Ok(())
}

async fn cmd_cleanup(config: &FerryConfig, older_than_hours: Option<u64>) -> Result<()> {
    let manager = build_manager(config, KeySource::None)?;
    let hours = older_than_hours.unwrap_or(config.cleanup.retention_hours);
    let removed = manager
        .cleanup_completed(Duration::from_secs(hours * 3600))
        .await?;
    info!(removed, hours, "cleanup finished");
    println!("Removed {removed} completed transfer(s) older than {hours}h");
    Ok(())
}

async fn cmd_unpack(config: &FerryConfig, transfer_id: &str, output: &Path) -> Result<()> {
    let keys = resolve_key_source(config, session_is_encrypted(config, transfer_id)?)?;
    let manager = build_manager(config, keys)?;

    let bytes = manager
        .unpack(transfer_id, path_str(output)?)
        .await
        .with_context(|| format!("unpacking {transfer_id}"))?;
    println!("Wrote {} to {}", fmt_bytes(bytes), output.display());
    Ok(())
}

fn cmd_keygen(path: &Path, force: bool) -> Result<()> {
    let path = expand_tilde(path);
    if path.exists() && !force {
        anyhow::bail!("{} exists (use --force to overwrite)", path.display());
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    let key = generate_transfer_key();
    std::fs::write(&path, format!("{}\n", key.to_base64()))
        .with_context(|| format!("writing key file: {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("restricting permissions: {}", path.display()))?;
    }
    println!("Wrote transfer key to {}", path.display());
    println!("  fingerprint: {}", key.fingerprint());
    println!("Set crypto.key_file in ferry.toml to use it.");
    Ok(())
}

fn cmd_config_show(config: &FerryConfig, config_path: &Path) -> Result<()> {
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
        format!("{} B", bytes)
    }
}
