use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use cif_batch::{FinderConfig, DEFAULT_CONFIG_FILE};
use cif_storage::{CheckpointStore, JsonlCheckpointStore};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "cif")]
#[command(about = "Find and download a product image for every catalog row")]
struct Cli {
    /// YAML config file (defaults to $CIF_CONFIG, then ./cif.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Process the catalog, resuming from the checkpoint log
    Run {
        input: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
        /// Only process the first N rows
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        images_folder: Option<PathBuf>,
        /// Record image URLs without downloading
        #[arg(long)]
        no_download: bool,
        #[arg(long)]
        no_backup: bool,
    },
    /// Show checkpoint progress for a catalog
    Status { input: PathBuf },
    /// Write a config file with every default spelled out
    InitConfig {
        #[arg(default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
}

fn init_telemetry(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,cif=debug".into());
    let (plain, json) = if json {
        (None, Some(tracing_subscriber::fmt::layer().json()))
    } else {
        (Some(tracing_subscriber::fmt::layer()), None)
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(json)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<FinderConfig> {
    FinderConfig::load(path).context("loading configuration")
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_telemetry(cli.log_json);

    match cli.command {
        Commands::Run {
            input,
            output,
            limit,
            images_folder,
            no_download,
            no_backup,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if output.is_some() {
                config.output_file = output;
            }
            if limit.is_some() {
                config.limit = limit;
            }
            if let Some(folder) = images_folder {
                config.images_folder = folder;
            }
            if no_download {
                config.save_images_locally = false;
            }
            if no_backup {
                config.backup_original_csv = false;
            }

            let summary = match cif_batch::run_from_config(config, &input).await {
                Ok(summary) => summary,
                Err(err) => {
                    error!(input = %input.display(), error = %format!("{err:#}"), "run halted");
                    return Err(err);
                }
            };
            info!(run_id = %summary.run_id, flushes = summary.flushes, "run summary");
            println!(
                "run complete: run_id={} rows={} processed={} done={} failed={} skipped={} output={}",
                summary.run_id,
                summary.total_rows,
                summary.processed,
                summary.done,
                summary.failed,
                summary.skipped,
                summary.output_file
            );
        }
        Commands::Status { input } => {
            let config = load_config(cli.config.as_deref())?;
            let path = config.checkpoint_path_for(&input);
            if !path.exists() {
                println!("no checkpoint log at {}", path.display());
                return Ok(());
            }
            let store = JsonlCheckpointStore::open(path.clone())
                .with_context(|| format!("opening checkpoint log {}", path.display()))?;
            let summary = store.summary();
            println!(
                "{}: done={} failed={} pending={} terminal={}",
                path.display(),
                summary.done,
                summary.failed,
                summary.pending,
                summary.terminal()
            );
        }
        Commands::InitConfig { path, force } => {
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            let yaml = FinderConfig::default().to_yaml()?;
            std::fs::write(&path, yaml)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("wrote {}", path.display());
        }
    }

    Ok(())
}
