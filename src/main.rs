//! # Node Image Maker CLI (`nim`)
//!
//! ## Usage
//!
//! ```bash
//! nim --config ./config/nim.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `nim images` | List images in the source (or `--dest`) repository |
//! | `nim create <base>` | Customize a base image and publish the result |
//! | `nim fetch <id>` | Write an image to a local file |
//! | `nim delete <id>` | Delete an image from the destination repository |
//!
//! ## Examples
//!
//! ```bash
//! # Customize a base image with a guestfish script and a payload
//! nim create solarnode-deb11 --resource setup.fish --resource node.conf \
//!     --env NODE_NAME=solar-1 --param format=raw
//!
//! # Download the result, decompressed
//! nim fetch 4c1f5d0e-… --dest --out solar-1.img
//! ```
//!
//! Repository, HTTP, and customization calls block, so each command runs on
//! a blocking thread of the Tokio runtime.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use node_image_maker::config::{self, Config};
use node_image_maker::models::{compare_by_id, ImageOptions, ImageResource};
use node_image_maker::progress::ProgressMode;
use node_image_maker::receipt::TaskState;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Node Image Maker: customize disk images with guestfish and publish them
/// to a filesystem or S3 image repository.
#[derive(Parser)]
#[command(
    name = "nim",
    about = "Node Image Maker: customize and publish disk images",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/nim.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List image metadata, sorted by id.
    Images {
        /// List the destination repository instead of the source.
        #[arg(long)]
        dest: bool,
    },

    /// Customize a base image.
    ///
    /// Stages the resources, runs the customization script (the first
    /// `.fish` resource) against the decompressed base image, and publishes
    /// the result. Prints the final receipt status as JSON.
    Create {
        /// Id of the base image in the source repository.
        base_id: String,

        /// Resource file to stage next to the image. Repeatable.
        #[arg(long = "resource", required = true)]
        resources: Vec<PathBuf>,

        /// Environment variable for the customization tool, `KEY=VALUE`.
        #[arg(long = "env", value_parser = parse_key_val)]
        env: Vec<(String, String)>,

        /// Task parameter, `KEY=VALUE`. JSON values are parsed.
        #[arg(long = "param", value_parser = parse_key_val)]
        params: Vec<(String, String)>,

        /// Enable customization tool tracing.
        #[arg(long)]
        verbose: bool,

        /// Signed authorization header, required when `[auth]` is configured.
        #[arg(long)]
        authorization: Option<String>,

        /// Progress output: `human`, `json`, or `off`. Default: human on a TTY.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Write an image to a local file.
    Fetch {
        /// Image id.
        id: String,

        /// Output file.
        #[arg(long)]
        out: PathBuf,

        /// Read from the destination repository instead of the source.
        #[arg(long)]
        dest: bool,

        /// Write the stored (compressed) bytes instead of decompressing.
        #[arg(long)]
        compressed: bool,
    },

    /// Delete an image from the destination repository.
    Delete {
        /// Image id.
        id: String,
    },
}

/// Parse a `key=value` pair.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    tokio::task::spawn_blocking(move || run_command(&cfg, cli.command))
        .await
        .context("Command thread panicked")?
}

fn run_command(cfg: &Config, command: Commands) -> Result<()> {
    match command {
        Commands::Images { dest } => list_images(cfg, dest),
        Commands::Create {
            base_id,
            resources,
            env,
            params,
            verbose,
            authorization,
            progress,
        } => {
            let mode = ProgressMode::from_flag(progress.as_deref()).map_err(anyhow::Error::msg)?;
            let options = ImageOptions {
                environment: env.into_iter().collect(),
                parameters: params
                    .into_iter()
                    .map(|(k, v)| {
                        let value = serde_json::from_str(&v)
                            .unwrap_or(serde_json::Value::String(v));
                        (k, value)
                    })
                    .collect(),
                verbose,
            };
            create_image(cfg, &base_id, &resources, options, authorization, mode)
        }
        Commands::Fetch {
            id,
            out,
            dest,
            compressed,
        } => fetch_image(cfg, &id, &out, dest, compressed),
        Commands::Delete { id } => {
            cfg.repo.dest.build()?.delete(&id)?;
            println!("Deleted image {}", id);
            Ok(())
        }
    }
}

fn list_images(cfg: &Config, dest: bool) -> Result<()> {
    let repo = if dest { &cfg.repo.dest } else { &cfg.repo.source };
    let mut infos = repo.build()?.find_all()?;
    infos.sort_by(compare_by_id);

    if infos.is_empty() {
        println!("No images found.");
        return Ok(());
    }
    println!("{:<40} {:>14} {:>14}  UNCOMPRESSED SHA-256", "ID", "SIZE", "UNCOMPRESSED");
    for info in &infos {
        println!(
            "{:<40} {:>14} {:>14}  {}",
            info.id,
            info.compressed_length,
            info.uncompressed_length,
            info.uncompressed_sha256.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn create_image(
    cfg: &Config,
    base_id: &str,
    resources: &[PathBuf],
    options: ImageOptions,
    authorization: Option<String>,
    mode: ProgressMode,
) -> Result<()> {
    let service = Arc::new(cfg.build_service()?);
    let _sweeper = service.spawn_sweeper(cfg.sweep_interval());

    let key = match (&cfg.auth, authorization) {
        (Some(_), None) => anyhow::bail!("--authorization is required when [auth] is configured"),
        (_, authorization) => service
            .authorize(authorization.as_deref().unwrap_or_default(), chrono::Utc::now())
            .context("Authorization failed")?,
    };

    let resources: Vec<ImageResource> = resources
        .iter()
        .map(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .with_context(|| format!("Resource path has no file name: {}", path.display()))?;
            Ok(ImageResource::from_file(name, path))
        })
        .collect::<Result<_>>()?;

    let receipt = service.create_image(&key, base_id, &resources, options)?;
    let reporter = mode.reporter();
    loop {
        reporter.report(&receipt.status());
        if receipt.is_done() {
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    let status = service.receipt_status(&receipt)?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    if let Some(url) = &status.download_url {
        println!("Download: {}", url);
    }

    match receipt.state() {
        TaskState::Succeeded { .. } => Ok(()),
        TaskState::Cancelled => anyhow::bail!("Task {} was cancelled", receipt.id()),
        state => anyhow::bail!(
            "Task {} {}: {}",
            receipt.id(),
            state.name(),
            receipt.message().unwrap_or_default()
        ),
    }
}

fn fetch_image(cfg: &Config, id: &str, out: &Path, dest: bool, compressed: bool) -> Result<()> {
    let repo = if dest { &cfg.repo.dest } else { &cfg.repo.source };
    let repo = repo.build()?;
    let image = if compressed {
        repo.find_one_compressed(id)?
    } else {
        repo.find_one(id)?
    }
    .with_context(|| format!("Image not found: {}", id))?;

    let mut reader = image.open()?;
    let mut writer = BufWriter::new(
        File::create(out).with_context(|| format!("Failed to create {}", out.display()))?,
    );
    let bytes = std::io::copy(&mut reader, &mut writer)?;
    writer.flush()?;
    println!("Wrote {} ({} bytes) to {}", image.filename(), bytes, out.display());
    Ok(())
}
