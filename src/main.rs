use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use futures_util::{stream, StreamExt, TryStreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use snapvault::{
    compute_file_sha256, extract, file_body, ArchiveFormat, BackendConfig, ManifestEntry,
    RetryPolicy, S3Settings, SnapshotError, SnapshotManager, UploadStatus, VaultConfig,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "snapvault")]
#[command(about = "Store and restore deduplicated experiment snapshots", long_about = None)]
#[command(version)]
struct Cli {
    #[command(flatten)]
    store: StoreArgs,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct StoreArgs {
    /// SQLite ledger location
    #[arg(long, env = "SNAPVAULT_DATABASE_URL", default_value = "sqlite://snapvault.db")]
    database_url: String,

    /// Object store holding blob bytes
    #[arg(long, value_enum, env = "SNAPVAULT_BACKEND", default_value_t = BackendKind::Local)]
    backend: BackendKind,

    /// Bucket name (s3 and minio)
    #[arg(long, env = "SNAPVAULT_BUCKET")]
    bucket: Option<String>,

    /// Region (s3 and minio)
    #[arg(long, env = "AWS_REGION", default_value = "us-east-1")]
    region: String,

    /// Custom endpoint, required for minio
    #[arg(long, env = "SNAPVAULT_ENDPOINT")]
    endpoint: Option<String>,

    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    access_key_id: Option<String>,

    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    secret_access_key: Option<String>,

    /// Key prefix inside the bucket
    #[arg(long, env = "SNAPVAULT_KEY_PREFIX", default_value = "")]
    key_prefix: String,

    /// Blob directory for the local backend
    #[arg(long, env = "SNAPVAULT_LOCAL_ROOT", default_value = ".snapvault-blobs")]
    local_root: PathBuf,

    /// Archive encoding for downloads
    #[arg(long, value_enum, env = "SNAPVAULT_ARCHIVE_FORMAT", default_value_t = ArchiveFormat::Tar)]
    archive_format: ArchiveFormat,

    /// Recompute SHA-256 on upload and reject mismatching hashes
    #[arg(long, env = "SNAPVAULT_VERIFY_UPLOADS")]
    verify_uploads: bool,

    /// Retries for transient object store failures
    #[arg(long, default_value_t = 3)]
    max_retries: usize,

    /// Delay between retries in milliseconds
    #[arg(long, default_value_t = 500)]
    retry_interval_ms: u64,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BackendKind {
    S3,
    Minio,
    Local,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the ledger schema and the bucket
    Init,

    /// Print the hashes that are not stored yet
    Check {
        /// SHA-256 hashes (64 hex characters)
        #[arg(required = true)]
        hashes: Vec<String>,
    },

    /// Upload one file as a blob
    Upload {
        file: PathBuf,

        /// Claimed hash; computed from the file when omitted
        #[arg(long)]
        hash: Option<String>,
    },

    /// Hash a directory, upload missing blobs and commit a snapshot
    Push {
        /// Experiment name
        experiment: String,

        /// Directory to snapshot
        dir: PathBuf,

        /// Maximum concurrent uploads
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },

    /// Commit a snapshot from a JSON manifest file
    Create {
        /// Experiment name
        experiment: String,

        /// JSON array of {"path", "hash", "size"} objects
        manifest: PathBuf,
    },

    /// Print a snapshot and its manifest as JSON
    Show { id: Uuid },

    /// List the snapshots of an experiment, newest first
    List { experiment: String },

    /// Rebuild a snapshot archive
    Download {
        id: Uuid,

        /// Output file (defaults to the suggested archive name)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also unpack the archive into this directory
        #[arg(long)]
        extract: Option<PathBuf>,
    },
}

impl StoreArgs {
    fn into_config(self) -> anyhow::Result<VaultConfig> {
        let backend = match self.backend {
            BackendKind::Local => BackendConfig::Local {
                root: self.local_root,
            },
            kind => {
                let bucket = self
                    .bucket
                    .context("--bucket is required for the s3 and minio backends")?;
                let settings = S3Settings {
                    bucket,
                    region: self.region,
                    endpoint: self.endpoint,
                    access_key_id: self.access_key_id,
                    secret_access_key: self.secret_access_key,
                    key_prefix: self.key_prefix,
                };
                match kind {
                    BackendKind::Minio => BackendConfig::Minio(settings),
                    _ => BackendConfig::S3(settings),
                }
            }
        };

        Ok(VaultConfig {
            database_url: self.database_url,
            backend,
            retry: RetryPolicy {
                interval_ms: self.retry_interval_ms,
                max_retries: self.max_retries,
            },
            verify_uploads: self.verify_uploads,
            archive_format: self.archive_format,
            ..VaultConfig::default()
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("snapvault={}", log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = cli.store.into_config()?;
    let started = Instant::now();

    match run(cli.command, &config).await {
        Ok(()) => {
            info!(
                "✅ Done in {}",
                humantime::format_duration(round_secs(started.elapsed()))
            );
            Ok(())
        }
        Err(e) => {
            match e.downcast_ref::<SnapshotError>() {
                Some(SnapshotError::MissingBlobs(hashes)) => {
                    eprintln!("❌ Error: {} blob(s) are not stored:", hashes.len());
                    for hash in hashes {
                        eprintln!("  {}", hash);
                    }
                }
                _ => eprintln!("❌ Error: {:#}", e),
            }
            std::process::exit(1);
        }
    }
}

async fn run(command: Command, config: &VaultConfig) -> anyhow::Result<()> {
    let manager = SnapshotManager::connect(config).await?;

    match command {
        Command::Init => {
            info!("🚀 Ledger and object store are ready");
        }
        Command::Check { hashes } => {
            for hash in manager.check_blobs(&hashes).await? {
                println!("{}", hash);
            }
        }
        Command::Upload { file, hash } => {
            let (status, hash) = upload_file(&manager, &file, hash).await?;
            println!("{} {}", hash, status_label(status));
        }
        Command::Push {
            experiment,
            dir,
            concurrency,
        } => {
            let id = push_directory(&manager, &experiment, &dir, concurrency.max(1)).await?;
            println!("{}", id);
        }
        Command::Create {
            experiment,
            manifest,
        } => {
            let raw = tokio::fs::read(&manifest)
                .await
                .with_context(|| format!("reading {}", manifest.display()))?;
            let entries: Vec<ManifestEntry> = serde_json::from_slice(&raw)
                .with_context(|| format!("parsing {}", manifest.display()))?;
            let id = manager.create_snapshot(&experiment, entries).await?;
            println!("{}", id);
        }
        Command::Show { id } => {
            let snapshot = manager.get_snapshot(id).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Command::List { experiment } => {
            let (experiment, snapshots) = manager.list_snapshots(&experiment).await?;
            info!("Experiment {} ({})", experiment.name, experiment.id);
            for snapshot in snapshots {
                println!(
                    "{}  {}  {} files  {} bytes",
                    snapshot.id,
                    humantime::format_rfc3339_seconds(snapshot.created_at.into()),
                    snapshot.manifest.len(),
                    snapshot.total_size()
                );
            }
        }
        Command::Download {
            id,
            output,
            extract,
        } => {
            let path = download(&manager, id, output).await?;
            if let Some(target) = extract {
                extract_to(path, target).await?;
            }
        }
    }
    Ok(())
}

async fn upload_file(
    manager: &SnapshotManager,
    path: &Path,
    claimed: Option<String>,
) -> anyhow::Result<(UploadStatus, String)> {
    let (hash, size) = match claimed {
        Some(hash) => {
            let size = tokio::fs::metadata(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?
                .len();
            (hash, size)
        }
        None => {
            let (hash, size) = compute_file_sha256(path).await?;
            (hash.to_string(), size)
        }
    };

    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    let size = i64::try_from(size).context("file too large")?;
    let status = manager.upload_blob(&hash, file_body(file), size).await?;
    Ok((status, hash))
}

async fn push_directory(
    manager: &SnapshotManager,
    experiment: &str,
    dir: &Path,
    concurrency: usize,
) -> anyhow::Result<Uuid> {
    let files = collect_files(dir).with_context(|| format!("walking {}", dir.display()))?;
    if files.is_empty() {
        bail!("{} contains no files", dir.display());
    }

    let hash_pb = bar(files.len() as u64)?;
    hash_pb.set_message(format!("🔎 Hashing {} files", files.len()));
    let mut manifest = Vec::with_capacity(files.len());
    for (absolute, relative) in &files {
        let (hash, size) = compute_file_sha256(absolute).await?;
        manifest.push(ManifestEntry {
            path: relative.clone(),
            hash: hash.to_string(),
            size: i64::try_from(size).context("file too large")?,
        });
        hash_pb.inc(1);
    }
    hash_pb.finish_with_message(format!("✅ Hashed {} files", files.len()));

    let hashes: Vec<String> = manifest.iter().map(|e| e.hash.clone()).collect();
    let missing: HashSet<String> = manager.check_blobs(&hashes).await?.into_iter().collect();
    info!(
        "{} of {} blobs already stored",
        hashes.len() - missing.len().min(hashes.len()),
        hashes.len()
    );

    // One upload per missing hash, even when several paths share it.
    let mut pending = Vec::new();
    let mut queued = HashSet::new();
    for ((absolute, _), entry) in files.iter().zip(&manifest) {
        if missing.contains(&entry.hash) && queued.insert(entry.hash.clone()) {
            pending.push((absolute.clone(), entry.hash.clone()));
        }
    }

    if !pending.is_empty() {
        let upload_pb = bar(pending.len() as u64)?;
        upload_pb.set_message(format!("📤 Uploading {} blobs", pending.len()));
        stream::iter(pending)
            .map(|(path, hash)| {
                let upload_pb = upload_pb.clone();
                async move {
                    let result = upload_file(manager, &path, Some(hash)).await;
                    upload_pb.inc(1);
                    result
                }
            })
            .buffer_unordered(concurrency)
            .try_for_each(|(status, hash)| async move {
                if status == UploadStatus::AlreadyPresent {
                    warn!("blob {} was uploaded concurrently", hash);
                }
                Ok(())
            })
            .await?;
        upload_pb.finish_with_message("✅ Uploads complete");
    }

    Ok(manager.create_snapshot(experiment, manifest).await?)
}

/// Regular files under `root`, sorted, paired with their `/`-separated relative path.
fn collect_files(root: &Path) -> anyhow::Result<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.into_path();
        let relative = path
            .strip_prefix(root)?
            .components()
            .map(|c| {
                c.as_os_str()
                    .to_str()
                    .map(str::to_string)
                    .with_context(|| format!("{} is not valid UTF-8", path.display()))
            })
            .collect::<anyhow::Result<Vec<_>>>()?
            .join("/");
        files.push((path, relative));
    }
    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}

async fn download(
    manager: &SnapshotManager,
    id: Uuid,
    output: Option<PathBuf>,
) -> anyhow::Result<PathBuf> {
    let handle = manager.prepare_download(id).await?;
    let path = output.unwrap_or_else(|| PathBuf::from(&handle.filename));

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template(
                "{spinner:.cyan} {msg} {bytes} ({bytes_per_sec}) | {elapsed_precise} elapsed",
            )?,
    );
    pb.set_message(format!("📦 Rebuilding snapshot {}", id));

    let mut archive = handle.archive;
    let mut file = tokio::io::BufWriter::new(
        tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("creating {}", path.display()))?,
    );
    while let Some(chunk) = archive.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        pb.inc(chunk.len() as u64);
    }
    file.flush().await?;

    pb.finish_with_message(format!("✅ Wrote {}", path.display()));
    Ok(path)
}

async fn extract_to(archive: PathBuf, target: PathBuf) -> anyhow::Result<()> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg} | {elapsed_precise} elapsed")?,
    );
    tokio::task::spawn_blocking(move || extract::extract_archive(&archive, &target, &pb))
        .await??;
    Ok(())
}

fn bar(len: u64) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(concat!(
                "{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg} ",
                "| {elapsed_precise} elapsed, ETA {eta_precise}"
            ))?
            .progress_chars("█▓▒░ "),
    );
    Ok(pb)
}

fn status_label(status: UploadStatus) -> &'static str {
    match status {
        UploadStatus::Stored => "stored",
        UploadStatus::AlreadyPresent => "already present",
    }
}

fn round_secs(elapsed: std::time::Duration) -> std::time::Duration {
    std::time::Duration::from_secs(elapsed.as_secs())
}
