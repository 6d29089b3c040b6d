use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use staffid_core::{
    AggregationPolicy, EnrollmentService, GalleryStore, MatchPolicy, OnnxPipeline, RawImage,
    Recognition, RecognitionService,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "staffid", about = "StaffID face enrollment and recognition CLI")]
struct Cli {
    /// Gallery file holding enrolled embeddings
    #[arg(long, global = true, default_value_os_t = staffid_core::default_gallery_path())]
    gallery: PathBuf,

    /// Directory containing the SCRFD and ArcFace ONNX models
    #[arg(long, global = true, default_value_os_t = staffid_core::default_model_dir())]
    model_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll (or re-enroll) a staff member from one or more photos
    Enroll {
        /// Staff identifier to store the reference under
        #[arg(short, long)]
        staff_id: String,
        /// How per-image embeddings are combined ("renormalize" or "raw-mean")
        #[arg(long, default_value_t = AggregationPolicy::default())]
        aggregation: AggregationPolicy,
        /// Photos of the staff member
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Identify the face in a photo against the gallery
    Recognize {
        /// Photo to identify
        image: PathBuf,
        /// Minimum similarity for a match
        #[arg(long, default_value_t = staffid_core::recognition::DEFAULT_MATCH_THRESHOLD)]
        threshold: f32,
    },
    /// List enrolled staff identifiers
    List,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let store = Arc::new(
        GalleryStore::open(&cli.gallery).with_context(|| format!("opening gallery {}", cli.gallery.display()))?,
    );

    match cli.command {
        Commands::Enroll {
            staff_id,
            aggregation,
            images,
        } => {
            let images = images.iter().map(|p| read_image(p)).collect::<Result<Vec<_>>>()?;
            let mut pipeline = load_pipeline(&cli.model_dir)?;
            let service = EnrollmentService::new(store, aggregation);

            let output = match service.enroll(&mut pipeline, &staff_id, &images) {
                Ok(outcome) => json!({
                    "success": true,
                    "staffId": outcome.identity,
                    "images": outcome.images_used,
                    "replaced": outcome.replaced,
                }),
                Err(e) if e.is_rejection() => json!({ "success": false, "error": e.to_string() }),
                Err(e) => return Err(e).context("enrollment failed"),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Recognize { image, threshold } => {
            let image = read_image(&image)?;
            let mut pipeline = load_pipeline(&cli.model_dir)?;
            let policy = MatchPolicy {
                threshold,
                ..MatchPolicy::default()
            };
            let service = RecognitionService::new(store, policy);

            let recognition = service.recognize(&mut pipeline, &image).context("recognition failed")?;
            let score = recognition.reported_score();
            let output = match recognition {
                Recognition::NoFace => json!({ "success": false, "msg": "No face detected" }),
                Recognition::Unknown { .. } => json!({ "success": false, "msg": "Unknown face", "score": score }),
                Recognition::Match { identity, .. } => {
                    json!({ "success": true, "staffId": identity, "score": score })
                }
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::List => {
            let gallery = store.snapshot();
            let staff_ids: Vec<&str> = gallery.identities().collect();
            let output = json!({ "staffIds": staff_ids, "count": staff_ids.len() });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

fn read_image(path: &Path) -> Result<RawImage> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok(RawImage::new(name, bytes))
}

fn load_pipeline(model_dir: &Path) -> Result<OnnxPipeline> {
    let detector = model_dir.join(staffid_core::DETECTOR_MODEL_FILE);
    let recognizer = model_dir.join(staffid_core::RECOGNIZER_MODEL_FILE);
    OnnxPipeline::load(&detector.to_string_lossy(), &recognizer.to_string_lossy())
        .with_context(|| format!("loading models from {}", model_dir.display()))
}
