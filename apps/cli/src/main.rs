use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lai_models::{DownloadError, DownloadManager, ModelArtifact};
use lai_runtime::{GenerationRequest, InferenceConfig, TokenFilter};
use serde::Serialize;
use std::io::Read;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// lai - on-device vision-language model manager
#[derive(Parser)]
#[command(name = "lai")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Directory holding model artifacts
    #[arg(long, global = true, env = "LAI_MODELS_DIR")]
    models_dir: Option<PathBuf>,

    /// Model artifact URL
    #[arg(long, global = true, env = "LAI_MODEL_URL")]
    url: Option<String>,

    /// Bearer token for the model host
    #[arg(long, global = true, env = "LAI_AUTH_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show where the model lives and whether it is usable
    Status,

    /// Download the model artifact if it is not present
    Fetch {
        /// Download again even if the artifact exists
        #[arg(long)]
        force: bool,
    },

    /// Delete the local model artifact
    Remove,

    /// Strip control tokens from text read on stdin
    Filter,

    /// Validate a prompt and optional image the way a generation would
    Check {
        prompt: String,

        /// Local image path or file:// URI
        #[arg(long, short)]
        image: Option<String>,
    },
}

#[derive(Serialize)]
struct Status {
    path: PathBuf,
    url: String,
    present: bool,
    size_bytes: Option<u64>,
    usable: bool,
    authenticated: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,lai=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config(&cli);
    let artifact = config.artifact();

    match cli.command {
        Commands::Status => status(&artifact),
        Commands::Fetch { force } => fetch(&artifact, force).await,
        Commands::Remove => remove(&artifact),
        Commands::Filter => filter(&config),
        Commands::Check { prompt, image } => check(prompt, image),
    }
}

fn config(cli: &Cli) -> InferenceConfig {
    let mut config = InferenceConfig::from_env();
    if let Some(dir) = &cli.models_dir {
        config.models_dir = dir.clone();
    }
    if let Some(url) = &cli.url {
        config.model_url = url.clone();
    }
    if let Some(token) = &cli.token {
        config.auth_token = Some(token.clone());
    }
    config
}

fn status(artifact: &ModelArtifact) -> Result<()> {
    let size = artifact.local_len();
    let status = Status {
        path: artifact.path.clone(),
        url: artifact.url.clone(),
        present: size.is_some(),
        size_bytes: size,
        usable: size.is_some_and(|len| len > 0),
        authenticated: artifact.auth_token.is_some(),
    };
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn fetch(artifact: &ModelArtifact, force: bool) -> Result<()> {
    let downloads = DownloadManager::new();
    if downloads.exists(&artifact.path) && !force {
        tracing::info!("Model already present at {:?}", artifact.path);
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling download");
            on_ctrl_c.cancel();
        }
    });

    let mut last_percent = -1.0;
    let result = downloads
        .download_cancellable(
            &artifact.url,
            &artifact.path,
            artifact.auth_token.as_deref(),
            &cancel,
            |progress| {
                if progress.percent.floor() > last_percent {
                    last_percent = progress.percent.floor();
                    eprint!(
                        "\r{:>5.1}%  {} / {} bytes",
                        progress.percent, progress.bytes_written, progress.total_bytes
                    );
                }
            },
        )
        .await;
    eprintln!();

    match result {
        Ok(bytes) => {
            println!("{} ({} bytes)", artifact.path.display(), bytes);
            Ok(())
        }
        Err(e @ DownloadError::Network { .. }) => {
            anyhow::bail!("{} ({})", e.user_message(), e)
        }
        Err(e) => Err(e).context("model download failed"),
    }
}

fn remove(artifact: &ModelArtifact) -> Result<()> {
    match std::fs::remove_file(&artifact.path) {
        Ok(()) => {
            tracing::info!("Removed {:?}", artifact.path);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("Nothing to remove at {:?}", artifact.path);
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("failed to remove {:?}", artifact.path)),
    }
}

fn filter(config: &InferenceConfig) -> Result<()> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("failed to read stdin")?;
    let filter = TokenFilter::new(config.filter_tokens.iter().cloned());
    print!("{}", filter.apply(&input));
    Ok(())
}

fn check(prompt: String, image: Option<String>) -> Result<()> {
    let mut request = GenerationRequest::new(prompt);
    if let Some(image) = image {
        request = request.with_image(image);
    }
    let validated = request.validate()?;
    match validated.image {
        Some(path) => println!("ok: prompt with image {}", path.display()),
        None => println!("ok: text-only prompt"),
    }
    Ok(())
}
