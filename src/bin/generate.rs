//! Submit one prompt and block until the image is ready.
//!
//! Usage:
//!   cargo run --bin generate -- "a lighthouse at dusk" --output lighthouse.png
//!
//! Without `--output` the base64 payload is written to stdout.

use anyhow::{anyhow, bail, Context};
use base64::Engine;
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use image_gen_queue::{
    config::AppConfig,
    services::{
        generation::{wait_for_generation, FusionBrainClient, GenerationClient, SubmitOutcome},
        prompt::{normalize_prompt, MAX_PROMPT_CHARS},
    },
    telemetry,
};

#[derive(Parser)]
#[command(name = "generate")]
#[command(about = "Generate a single image and wait for the result")]
struct Cli {
    /// Prompt text
    prompt: String,

    /// Write the decoded image here instead of printing base64
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.verbose);

    let config = AppConfig::from_env().context("Failed to load configuration")?;
    let client =
        FusionBrainClient::from_config(&config).context("Failed to initialize FusionBrain client")?;

    let prompt = normalize_prompt(&cli.prompt, MAX_PROMPT_CHARS);
    if prompt.trim().is_empty() {
        bail!("Prompt must not be empty");
    }
    let request = config.generation_defaults().request_for(prompt);

    let correlation_id = match client.submit(&request).await {
        SubmitOutcome::Accepted { correlation_id, .. } => correlation_id,
        SubmitOutcome::Rejected { cause } => {
            return Err(anyhow!(cause).context("Generation request rejected"))
        }
    };
    tracing::info!(correlation_id = %correlation_id, "Generation initiated");

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    let response = wait_for_generation(
        &client,
        &correlation_id,
        config.check_interval(),
        config.default_max_attempts,
        &cancel,
    )
    .await
    .context("Failed waiting for generation")?;

    if response.censored {
        tracing::warn!(correlation_id = %correlation_id, "Generated image was censored");
    }
    let payload = response
        .first_file()
        .ok_or_else(|| anyhow!("Generation finished without images"))?;

    match cli.output {
        Some(path) => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(payload)
                .context("Result is not valid base64")?;
            let format = image::guess_format(&bytes).context("Result is not a known image format")?;
            std::fs::write(&path, &bytes)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            tracing::info!(
                path = %path.display(),
                format = ?format,
                bytes = bytes.len(),
                "Image saved"
            );
        }
        None => println!("{payload}"),
    }

    Ok(())
}
