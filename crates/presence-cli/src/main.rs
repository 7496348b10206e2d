use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use presence_core::detector::{FaceDetector, ReplayDetector};
use presence_core::types::EmbeddingVector;
use presence_engine::{Config, Engine, SessionOutcome};
use presence_frame::{DirectoryFrameSource, FrameSource, Rotation};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "presence", about = "Presence face verification CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a face embedding from a cropped face image (file or HTTPS URL)
    Embed {
        /// Image path or URL
        input: String,
        /// Write the 512-byte encoding here instead of printing hex
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// Embedding model file (overrides PRESENCE_MODEL_DIR/PRESENCE_EMBEDDING_MODEL)
        #[arg(long)]
        model: Option<PathBuf>,
    },
    /// Compare two encoded embeddings
    Compare { a: PathBuf, b: PathBuf },
    /// Run a verification session over recorded frames and detections
    Replay {
        /// Directory of frame images, processed in file-name order
        frames: PathBuf,
        /// JSON-lines detections keyed by frame sequence
        detections: PathBuf,
        #[arg(long)]
        model: Option<PathBuf>,
        /// Sensor rotation in degrees (0, 90, 180, 270)
        #[arg(long, default_value_t = 0)]
        rotation: u32,
        /// Playback rate in frames per second
        #[arg(long, default_value_t = 10)]
        fps: u32,
    },
    /// Show effective configuration
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Embed { input, out, model } => embed(&input, out, model).await,
        Commands::Compare { a, b } => compare(&a, &b),
        Commands::Replay {
            frames,
            detections,
            model,
            rotation,
            fps,
        } => replay(&frames, &detections, model, rotation, fps).await,
        Commands::Status => status(),
    }
}

fn load_config(model: Option<PathBuf>) -> Result<Config> {
    let mut config = Config::from_env();
    if let Some(path) = model {
        let file = path
            .file_name()
            .and_then(|f| f.to_str())
            .with_context(|| format!("invalid model path {}", path.display()))?;
        config.embedding_model = file.to_string();
        config.model_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
    }
    Ok(config)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

async fn embed(input: &str, out: Option<PathBuf>, model: Option<PathBuf>) -> Result<()> {
    let engine = Engine::from_config(load_config(model)?)?;

    let embedding = if input.starts_with("https://") || input.starts_with("http://") {
        engine.embed_reference(input).await?
    } else {
        let generator = engine.generator().clone();
        let path = PathBuf::from(input);
        tokio::task::spawn_blocking(move || generator.generate_from_path(&path)).await??
    };

    let bytes = embedding.encode();
    match out {
        Some(path) => {
            std::fs::write(&path, &bytes)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("wrote {} bytes to {}", bytes.len(), path.display());
        }
        None => println!("{}", hex(&bytes)),
    }
    Ok(())
}

fn read_embedding(path: &Path) -> Result<EmbeddingVector> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    EmbeddingVector::decode(&bytes).with_context(|| format!("invalid embedding {}", path.display()))
}

fn compare(a: &Path, b: &Path) -> Result<()> {
    let a = read_embedding(a)?;
    let b = read_embedding(b)?;
    let report = serde_json::json!({
        "similarity": a.similarity(&b),
        "distance": a.euclidean_distance(&b),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn replay(
    frames_dir: &Path,
    detections: &Path,
    model: Option<PathBuf>,
    rotation: u32,
    fps: u32,
) -> Result<()> {
    let Some(rotation) = Rotation::from_degrees(rotation) else {
        bail!("rotation must be a multiple of 90, got {rotation}");
    };
    let engine = Engine::from_config(load_config(model)?)?;
    let pool = engine.frame_pool();

    let mut source = DirectoryFrameSource::open(frames_dir, rotation)?;
    let replay = ReplayDetector::open(detections)
        .with_context(|| format!("failed to load detections from {}", detections.display()))?;
    tracing::info!(frames = source.len(), records = replay.len(), "replay loaded");

    let handle = engine.start_session(Arc::new(FaceDetector::new(replay)));

    let mut updates = handle.updates();
    let printer = tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let update = updates.borrow_and_update().clone();
            if let Ok(line) = serde_json::to_string(&update) {
                println!("{line}");
            }
        }
    });

    let frame_interval = Duration::from_millis(1000 / u64::from(fps.max(1)));
    while let Some(frame) = source.next_frame(&pool) {
        let lease = frame?;
        if handle.updates().borrow().state.is_terminal() {
            break;
        }
        while handle.is_busy() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        if !handle.offer(lease) {
            break;
        }
        tokio::time::sleep(frame_interval).await;
    }

    let outcome = handle.outcome().await;
    let _ = printer.await;

    let report = match &outcome {
        SessionOutcome::Success(embedding) => serde_json::json!({
            "outcome": "success",
            "embedding": hex(&embedding.encode()),
        }),
        SessionOutcome::Failure(cause) => serde_json::json!({
            "outcome": "failure",
            "kind": cause.kind(),
            "reason": cause.to_string(),
        }),
        SessionOutcome::Timeout => serde_json::json!({ "outcome": "timeout" }),
        SessionOutcome::Cancelled => serde_json::json!({ "outcome": "cancelled" }),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn status() -> Result<()> {
    let config = Config::from_env();
    let model_path = config.model_path();
    let report = serde_json::json!({
        "config": config,
        "model_path": model_path,
        "model_exists": model_path.exists(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
