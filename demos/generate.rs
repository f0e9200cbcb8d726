//! Pipeline example - submits one prompt and prints progress until the image lands.
//!
//! Run with: `cargo run --example generate -- "A lighthouse at dusk"`
//!
//! Requires `BFL_API_KEY` environment variable (or an `api_key.txt` file).

use fluxview::{
    AspectRatio, ArtifactStore, CredentialStore, FluxClient, GenerationRequest, JobPipeline,
    PipelineEvent, PipelineState,
};

#[tokio::main]
async fn main() -> fluxview::Result<()> {
    let prompt = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "A red fox in fresh snow, golden hour".to_string());

    let credential = CredentialStore::new("api_key.txt")
        .resolve()?
        .expect("set BFL_API_KEY or write api_key.txt");
    let client = FluxClient::builder().credential(credential).build()?;

    let (pipeline, mut events) = JobPipeline::builder(client)
        .artifact_store(ArtifactStore::new("."))
        .build()?;

    let request = GenerationRequest::new(prompt).with_aspect_ratio(AspectRatio::Standard);
    let run = pipeline.submit(request)?;

    while let Some(event) = events.recv().await {
        match event {
            PipelineEvent::StateChanged { state, .. } => {
                println!("[{run}] {}", state.label());
                if let PipelineState::Failed { message, status, .. } = state {
                    eprintln!("failed ({status:?}): {message}");
                    break;
                }
            }
            PipelineEvent::Error { message, .. } => eprintln!("error: {message}"),
            PipelineEvent::ImageReady { artifact, .. } => {
                match &artifact.saved_path {
                    Some(path) => println!("Saved to {} ({} bytes)", path.display(), artifact.size()),
                    None => println!("Received {} bytes", artifact.size()),
                }
                break;
            }
        }
    }

    Ok(())
}
