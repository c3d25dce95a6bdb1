//! s3fs CLI: maintenance commands for an S3-backed file system
//!
//! Usage:
//!   s3fs-cli refresh-cache                         Rebuild the metadata cache
//!   s3fs-cli copy-local --scheme all               Upload local files to the bucket
//!   s3fs-cli validate-config                       Check config and bucket access
//!   s3fs-cli stat <uri>                            Show cached metadata
//!   s3fs-cli url <uri>                             Print the external URL

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;

use s3fs::batch::{run_to_completion, BatchJob, CursorFile, Progress};
use s3fs::config::{default_config_path, S3fsConfig};
use s3fs::migrate::{MigrateScheme, UploadCondition};
use s3fs::S3fs;

#[derive(Parser)]
#[command(
    name = "s3fs-cli",
    about = "s3fs CLI: S3-backed file system maintenance",
    version,
    long_about = "Maintains the metadata cache of an S3-backed file system and migrates local files to the bucket.\nURIs use the form scheme://path (s3, public, private, temporary)."
)]
struct Cli {
    /// Config file (default: <config dir>/s3fs/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Save batch progress here so an interrupted run can resume
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild the metadata cache from the bucket listing
    RefreshCache,
    /// Copy local public/private files to the bucket
    CopyLocal {
        /// Which local directories to copy
        #[arg(long, value_enum, default_value = "all")]
        scheme: MigrateScheme,
        /// When to upload files that are already cached
        #[arg(long, value_enum, default_value = "always")]
        condition: UploadCondition,
    },
    /// Validate the configuration and test bucket access
    ValidateConfig,
    /// Show metadata of a file or directory
    Stat {
        /// File URI (e.g., public://images/logo.png)
        uri: String,
    },
    /// Print the external URL of a remote file
    Url {
        /// File URI
        uri: String,
    },
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(path: Option<PathBuf>) -> Result<S3fsConfig> {
    let path = path.unwrap_or_else(default_config_path);
    S3fsConfig::load(&path).with_context(|| format!("Invalid configuration in {:?}", path))
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] [{bar:40}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    bar
}

/// Run a batch job with a progress bar
async fn run_job<J: BatchJob>(job: &J, state: Option<&CursorFile>) -> Result<J::Report, J::Error> {
    let bar = progress_bar();
    let result = run_to_completion(job, state, |p: &Progress| {
        bar.set_position(p.percent as u64);
        bar.set_message(p.message.clone());
    })
    .await;
    match &result {
        Ok(_) => bar.finish_with_message("done"),
        Err(_) => bar.abandon_with_message("failed"),
    }
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(cli.config)?;
    let state = cli.state.map(CursorFile::new);

    match cli.command {
        Commands::ValidateConfig => {
            println!("Configuration OK: bucket '{}' in {}", config.bucket, config.region);
            let fs = S3fs::connect(config).await?;
            fs.check_access().await.context("Bucket is not accessible")?;
            println!("Bucket access: OK ({})", fs.store().display_name());
        }
        Commands::RefreshCache => {
            let fs = S3fs::connect(config).await?;
            let report = run_job(&fs.refresher(), state.as_ref())
                .await
                .context("Cache refresh failed; the previous cache is still in place")?;
            println!(
                "Cached {} files and {} folders ({} skipped) in {:.1}s",
                report.files,
                report.folders,
                report.skipped,
                report.elapsed.as_secs_f64()
            );
        }
        Commands::CopyLocal { scheme, condition } => {
            let fs = S3fs::connect(config).await?;
            let report = run_job(&fs.migrator(scheme, condition), state.as_ref())
                .await
                .context("Copy failed")?;
            println!(
                "Uploaded {}, skipped {}, failed {} in {:.1}s",
                report.uploaded,
                report.skipped,
                report.failed,
                report.elapsed.as_secs_f64()
            );
            for failure in &report.errors {
                eprintln!("  {}: {}", failure.path, failure.reason);
            }
            if report.failed > 0 {
                std::process::exit(1);
            }
        }
        Commands::Stat { uri } => {
            let fs = S3fs::connect(config).await?;
            match fs.files().stat(&uri).await? {
                Some(record) => {
                    let kind = if record.is_directory { "directory" } else { "file" };
                    println!("{} ({})", uri, kind);
                    println!("  cache uri: {}", record.uri);
                    println!("  size:      {}", record.filesize);
                    if let Some(modified) = chrono::DateTime::from_timestamp(record.timestamp, 0) {
                        println!("  modified:  {}", modified.to_rfc3339());
                    }
                    if let Some(version) = record.version {
                        println!("  version:   {}", version);
                    }
                }
                None => {
                    eprintln!("Not found: {}", uri);
                    std::process::exit(1);
                }
            }
        }
        Commands::Url { uri } => {
            let fs = S3fs::connect(config).await?;
            println!("{}", fs.files().external_url(&uri)?);
        }
    }

    Ok(())
}
