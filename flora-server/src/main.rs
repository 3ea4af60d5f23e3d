mod api;
mod form;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use flora_core::{load_model, DeviceMap, ExampleConfig, LoraSource, RequestBuilder};
use hf_hub::api::tokio::ApiBuilder;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Flux + LoRA image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// GPU to run on when more than one is available
    #[arg(long, default_value_t = 0)]
    device_ordinal: usize,

    /// Base model repository
    #[arg(long, default_value = "black-forest-labs/FLUX.1-dev")]
    model: String,

    /// LoRA adapter repository
    #[arg(long, default_value = "parth29vc/shm-v2")]
    lora: String,

    /// Adapter weight file inside the LoRA repository. Defaults to the
    /// repository's only `.safetensors` file.
    #[arg(long)]
    lora_weight_name: Option<String>,

    /// Run the base model without any adapter
    #[arg(long, conflicts_with_all = ["lora", "lora_weight_name"])]
    no_lora: bool,

    /// Word appended to every prompt to activate the adapter
    #[arg(long, default_value = flora_core::DEFAULT_TRIGGER_TOKEN)]
    trigger_word: String,

    /// Host address to bind the server to
    #[arg(long, env = "FLORA_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the server to
    #[arg(long, env = "FLORA_PORT", default_value_t = 7860)]
    port: u16,

    /// Pre-rendered image shown on first load
    #[arg(long, default_value = flora_core::example::EXAMPLE_IMAGE_PATH)]
    example_image: PathBuf,

    /// Hugging Face token, needed for gated repositories. Falls back to the
    /// cached token.
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    hf_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // A missing example is a deployment error; fail before loading any weights.
    let example = ExampleConfig::default().with_image_path(&args.example_image);
    let example_image = example.load_image()?;

    let mut hub = ApiBuilder::new();
    if let Some(token) = args.hf_token {
        hub = hub.with_token(Some(token));
    }
    let hub = hub.build().context("failed to build hub client")?;

    let lora = (!args.no_lora).then(|| LoraSource {
        repo: args.lora.clone(),
        weight_name: args.lora_weight_name.clone(),
    });
    let generator = load_model(
        &args.model,
        lora,
        example.fields.adapter_scale,
        hub,
        DeviceMap::new(args.cpu, args.device_ordinal),
    )
    .await?;

    let state = api::AppState::new(
        generator,
        RequestBuilder::new(args.trigger_word),
        example.fields,
        &example_image,
    )?;
    let app = api::router(Arc::new(state));

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("Started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
