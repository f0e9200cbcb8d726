//! CLI for FluxView - Flux image generation.

use clap::{Args, Parser, Subcommand, ValueEnum};
use fluxview::{
    AspectRatio, ArtifactStore, Credential, CredentialStore, FluxClient, FluxEngine,
    GenerationRequest, JobPipeline, PipelineEvent, PipelineState, PromptHistory, Settings,
};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fluxview")]
#[command(about = "Generate images from text prompts with the Black Forest Labs Flux API")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an image from a text prompt
    Generate(GenerateArgs),

    /// Manage the stored API key
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },

    /// Check that the API key is accepted
    Health,
}

#[derive(Subcommand)]
enum KeyAction {
    /// Store a new API key
    Set {
        /// The Black Forest Labs API key
        value: String,
    },
    /// Show where the key is read from
    Show,
}

#[derive(Args)]
struct GenerateArgs {
    /// The text prompt describing the image (defaults to the last prompt)
    prompt: Option<String>,

    /// Copy the image to this path as well
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Aspect ratio
    #[arg(long, value_enum)]
    aspect_ratio: Option<AspectRatioArg>,

    /// Less processed, more natural looking output
    #[arg(long)]
    raw: bool,

    /// Image width in pixels
    #[arg(long, requires = "height")]
    width: Option<u32>,

    /// Image height in pixels
    #[arg(long, requires = "width")]
    height: Option<u32>,

    /// Let the service expand the prompt
    #[arg(long)]
    prompt_upsampling: bool,

    /// Engine endpoint (e.g. flux-pro-1.1-ultra, flux-dev)
    #[arg(short, long)]
    engine: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AspectRatioArg {
    #[value(name = "1:1")]
    Square,
    #[value(name = "4:3")]
    Standard,
    #[value(name = "16:9")]
    Landscape,
    #[value(name = "21:9")]
    Ultrawide,
    #[value(name = "3:4")]
    StandardPortrait,
}

impl From<AspectRatioArg> for AspectRatio {
    fn from(arg: AspectRatioArg) -> Self {
        match arg {
            AspectRatioArg::Square => AspectRatio::Square,
            AspectRatioArg::Standard => AspectRatio::Standard,
            AspectRatioArg::Landscape => AspectRatio::Landscape,
            AspectRatioArg::Ultrawide => AspectRatio::Ultrawide,
            AspectRatioArg::StandardPortrait => AspectRatio::StandardPortrait,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fluxview=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env()?;

    match cli.command {
        Commands::Generate(args) => {
            generate(args, &settings, cli.json).await?;
        }
        Commands::Key { action } => {
            manage_key(action, &settings, cli.json)?;
        }
        Commands::Health => {
            health(&settings, cli.json).await?;
        }
    }

    Ok(())
}

/// Returns the stored or environment key, asking on stdin if neither exists.
fn require_credential(settings: &Settings) -> anyhow::Result<Credential> {
    let store = CredentialStore::new(settings.credential_path());
    if let Some(credential) = store.resolve()? {
        return Ok(credential);
    }

    eprint!("Enter your Black Forest Labs API key: ");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;

    let credential = store.provision(&line)?;
    eprintln!("API key saved to {}", store.path().display());
    Ok(credential)
}

fn build_client(settings: &Settings, engine: Option<&str>) -> anyhow::Result<FluxClient> {
    let engine = engine
        .map(FluxEngine::from_name)
        .unwrap_or_else(|| settings.engine.clone());

    let client = FluxClient::builder()
        .credential(require_credential(settings)?)
        .engine(engine)
        .base_url(&settings.api_base)
        .build()?;
    Ok(client)
}

/// Turns CLI flags into a request. Without an explicit size or ratio the
/// image is 4:3.
fn build_request(args: &GenerateArgs, prompt: &str) -> GenerationRequest {
    let mut request = GenerationRequest::new(prompt)
        .with_raw(args.raw)
        .with_prompt_upsampling(args.prompt_upsampling);

    match (args.aspect_ratio, args.width, args.height) {
        (Some(ar), _, _) => request = request.with_aspect_ratio(ar.into()),
        (None, None, None) => request = request.with_aspect_ratio(AspectRatio::Standard),
        _ => {}
    }
    if let (Some(w), Some(h)) = (args.width, args.height) {
        request = request.with_size(w, h);
    }
    request
}

async fn generate(args: GenerateArgs, settings: &Settings, json_output: bool) -> anyhow::Result<()> {
    let history = PromptHistory::new(settings.last_prompt_path());
    let prompt = match args.prompt.clone() {
        Some(prompt) => prompt,
        None => match history.last()? {
            Some(prompt) => prompt,
            None => anyhow::bail!("no prompt given and no previous prompt stored"),
        },
    };

    let request = build_request(&args, &prompt);
    let client = build_client(settings, args.engine.as_deref())?;
    let engine = client.engine().clone();
    let (pipeline, mut events) = JobPipeline::builder(client)
        .config(settings.pipeline_config())
        .artifact_store(ArtifactStore::new(&settings.home))
        .build()?;

    let run = pipeline.submit(request)?;
    history.remember(&prompt)?;

    let artifact = loop {
        let Some(event) = events.recv().await else {
            anyhow::bail!("pipeline stopped before the image was ready");
        };
        match event {
            PipelineEvent::StateChanged { state, .. } => match state {
                PipelineState::Failed { kind, message, .. } => {
                    anyhow::bail!("generation failed ({kind}): {message}");
                }
                PipelineState::Polling { job_id } if !json_output => {
                    eprintln!("Job {job_id} accepted, waiting for result...");
                }
                _ => {}
            },
            PipelineEvent::Error { kind, message, .. } => {
                // run failures end the loop at Failed, so only save errors get here
                tracing::warn!(%kind, "{message}");
            }
            PipelineEvent::ImageReady { run: r, artifact } if r == run => break artifact,
            PipelineEvent::ImageReady { .. } => {}
        }
    };

    let copied = match &args.output {
        Some(path) => Some(pipeline.save(Some(path.as_path()))?),
        None => None,
    };

    if json_output {
        let result = serde_json::json!({
            "type": "image",
            "success": true,
            "run": run.to_string(),
            "engine": engine.as_str(),
            "source_url": artifact.source_url,
            "saved_path": artifact.saved_path.as_ref().map(|p| p.display().to_string()),
            "output": copied.as_ref().map(|p| p.display().to_string()),
            "size_bytes": artifact.size(),
            "format": artifact.detected_format().map(|f| f.extension()),
        });
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!(
            "Generated image ({} bytes) via {}",
            artifact.size(),
            engine.as_str()
        );
        if let Some(path) = &artifact.saved_path {
            println!("Saved: {}", path.display());
        }
        if let Some(path) = &copied {
            println!("Copied: {}", path.display());
        }
    }

    Ok(())
}

fn manage_key(action: KeyAction, settings: &Settings, json_output: bool) -> anyhow::Result<()> {
    let store = CredentialStore::new(settings.credential_path());
    match action {
        KeyAction::Set { value } => {
            store.provision(&value)?;
            if json_output {
                let result = serde_json::json!({
                    "success": true,
                    "path": store.path().display().to_string(),
                });
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("API key saved to {}", store.path().display());
            }
        }
        KeyAction::Show => {
            let source = if store.load()?.is_some() {
                Some(store.path().display().to_string())
            } else if std::env::var(fluxview::store::credential::API_KEY_ENV).is_ok() {
                Some(format!("${}", fluxview::store::credential::API_KEY_ENV))
            } else {
                None
            };
            if json_output {
                println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "source": source }))?);
            } else {
                match source {
                    Some(source) => println!("API key from {source}"),
                    None => println!("No API key configured"),
                }
            }
        }
    }
    Ok(())
}

async fn health(settings: &Settings, json_output: bool) -> anyhow::Result<()> {
    let client = build_client(settings, None)?;
    client.health_check().await?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "healthy": true }))?);
    } else {
        println!("API key accepted by {}", settings.api_base);
    }
    Ok(())
}
