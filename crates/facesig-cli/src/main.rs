use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facesig_core::{
    compare_signatures, localizer, ComparisonReport, EnrolledSignature, FaceEncoder, FaceLocator, ImageSource,
    ProcessResponse, SimilarityScorer, ThumbnailEncoder,
};
use facesig_io::{FsImageLoader, PngThumbnailEncoder};
use serde::Serialize;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "facesig", about = "Face signature extraction and comparison")]
struct Cli {
    /// TOML configuration file (defaults to $FACESIG_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory containing the OpenCV haarcascade_*.xml files
    #[arg(long, global = true)]
    cascade_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract the signature of the dominant face in an image.
    /// With no arguments, reads `{"image_path", "student_id"}` or
    /// `<path> <id>` from one line of stdin.
    Encode {
        image: Option<PathBuf>,
        subject_id: Option<String>,
        /// Omit the base64 face thumbnail
        #[arg(long)]
        no_thumbnail: bool,
    },
    /// Compare two signatures (JSON array literals or files containing one)
    Compare {
        a: String,
        b: String,
        #[arg(short, long)]
        threshold: Option<f64>,
    },
    /// Match the face in an image against a gallery of enrolled signatures
    Identify {
        image: PathBuf,
        /// JSON array of {"subject_id", "features"} entries
        gallery: PathBuf,
        #[arg(short, long)]
        threshold: Option<f64>,
    },
    /// Show the face regions found in an image
    Detect { image: PathBuf },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("facesig: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config_path = cli
        .config
        .or_else(|| std::env::var_os("FACESIG_CONFIG").map(PathBuf::from));
    let mut config = Config::load(config_path.as_deref())?;
    if let Some(dir) = cli.cascade_dir {
        config.cascade_dir = dir;
    }

    match cli.command {
        Commands::Encode {
            image,
            subject_id,
            no_thumbnail,
        } => {
            if no_thumbnail {
                config.thumbnails = false;
            }
            encode(&config, image, subject_id)
        }
        Commands::Compare { a, b, threshold } => compare(&config, &a, &b, threshold),
        Commands::Identify {
            image,
            gallery,
            threshold,
        } => identify(&config, &image, &gallery, threshold),
        Commands::Detect { image } => detect(&config, &image),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn build_encoder(config: &Config) -> Result<FaceEncoder> {
    FaceEncoder::from_cascade_dir(&config.cascade_dir, config.detection.clone())
        .with_context(|| format!("loading cascades from {}", config.cascade_dir.display()))
}

fn encode(config: &Config, image: Option<PathBuf>, subject_id: Option<String>) -> Result<ExitCode> {
    let (image, subject_id) = match (image, subject_id) {
        (Some(image), Some(id)) => (Some(image), Some(id)),
        (Some(_), None) => {
            print_json(&ProcessResponse::failure(
                "Usage: facesig encode <image_path> <student_id>",
            ))?;
            return Ok(ExitCode::FAILURE);
        }
        (None, _) => {
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            let (image, id) = parse_request(&line);
            (image.map(PathBuf::from), id)
        }
    };

    let (Some(image), Some(subject_id)) = (image, subject_id) else {
        print_json(&ProcessResponse::failure(
            "Error: Both image_path and student_id are required",
        ))?;
        return Ok(ExitCode::FAILURE);
    };

    let encoder = match build_encoder(config) {
        Ok(encoder) => encoder,
        Err(e) => {
            print_json(&ProcessResponse::failure(format!("Critical error: {e:#}")))?;
            return Ok(ExitCode::FAILURE);
        }
    };
    let thumbnails: Option<&dyn ThumbnailEncoder> = if config.thumbnails {
        Some(&PngThumbnailEncoder)
    } else {
        None
    };
    let response = encoder.process(&FsImageLoader::default(), &image, &subject_id, thumbnails);
    print_json(&response)?;
    Ok(ExitCode::SUCCESS)
}

/// Parse one request line: a JSON object with `image_path` and `student_id`,
/// or `<path> <id>` separated by the first space.
fn parse_request(line: &str) -> (Option<String>, Option<String>) {
    let line = line.trim();
    if line.is_empty() {
        return (None, None);
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
        if value.is_object() {
            let field = |name: &str| {
                value
                    .get(name)
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            };
            return (field("image_path"), field("student_id"));
        }
    }
    match line.split_once(' ') {
        Some((path, id)) => (Some(path.to_string()), Some(id.to_string())),
        None => (Some(line.to_string()), None),
    }
}

/// A signature given inline as a JSON array, or as a file holding one.
fn load_signature(arg: &str) -> Result<Vec<f32>> {
    let text = if arg.trim_start().starts_with('[') {
        arg.to_string()
    } else {
        std::fs::read_to_string(arg).with_context(|| format!("reading signature {arg}"))?
    };
    serde_json::from_str(&text).with_context(|| format!("parsing signature {arg}"))
}

fn compare(config: &Config, a: &str, b: &str, threshold: Option<f64>) -> Result<ExitCode> {
    let report = compare_report(config, a, b, threshold);
    print_json(&report)?;
    Ok(match report {
        ComparisonReport::Scored(_) => ExitCode::SUCCESS,
        ComparisonReport::Failed { .. } => ExitCode::FAILURE,
    })
}

/// Every failure, including unreadable or malformed signatures, is
/// reported in the comparison report itself.
fn compare_report(config: &Config, a: &str, b: &str, threshold: Option<f64>) -> ComparisonReport {
    let loaded = load_signature(a).and_then(|a| Ok((a, load_signature(b)?)));
    let scorer = SimilarityScorer::new(config.scoring.weights).map_err(anyhow::Error::from);
    match (loaded, scorer) {
        (Ok((a, b)), Ok(scorer)) => {
            let threshold = threshold.unwrap_or(config.scoring.threshold);
            compare_signatures(&scorer, &a, &b, Some(threshold))
        }
        (Err(e), _) | (_, Err(e)) => ComparisonReport::failed(format!("Comparison error: {e:#}")),
    }
}

fn identify(config: &Config, image: &Path, gallery: &Path, threshold: Option<f64>) -> Result<ExitCode> {
    let report = match identify_report(config, image, gallery, threshold) {
        Ok(report) => report,
        Err(e) => serde_json::json!({ "matched": false, "message": format!("Critical error: {e:#}") }),
    };
    print_json(&report)?;
    let failed = report.get("message").is_some();
    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

fn identify_report(
    config: &Config,
    image: &Path,
    gallery: &Path,
    threshold: Option<f64>,
) -> Result<serde_json::Value> {
    let text = std::fs::read_to_string(gallery)
        .with_context(|| format!("reading gallery {}", gallery.display()))?;
    let gallery: Vec<EnrolledSignature> = serde_json::from_str(&text)
        .with_context(|| format!("parsing gallery {}", gallery.display()))?;
    let scorer = SimilarityScorer::new(config.scoring.weights)?;
    let threshold = threshold.unwrap_or(config.scoring.threshold);
    let encoder = build_encoder(config)?;

    let gray = FsImageLoader::default().load_gray(image)?;
    let encoding = match encoder.encode(&gray) {
        Ok(encoding) => encoding,
        Err(e) => return Ok(serde_json::json!({ "matched": false, "message": e.to_string() })),
    };

    let best = scorer.identify(encoding.features.as_slice(), &gallery, threshold);
    tracing::info!(
        gallery = gallery.len(),
        matched = best.as_ref().map(|m| m.subject_id.as_str()),
        "identification complete"
    );
    Ok(serde_json::json!({
        "matched": best.is_some(),
        "face_region": encoding.face_region,
        "total_faces_detected": encoding.total_faces_detected,
        "match": best,
    }))
}

fn detect(config: &Config, image: &Path) -> Result<ExitCode> {
    let encoder = build_encoder(config)?;
    let gray = FsImageLoader::default().load_gray(image)?;
    let locator = encoder.locator();
    let candidates = locator.candidates(&gray);
    let faces = locator.locate(&gray);
    print_json(&serde_json::json!({
        "width": gray.width(),
        "height": gray.height(),
        "candidates": candidates.len(),
        "faces": faces,
        "dominant": localizer::select_dominant(&faces),
    }))?;
    Ok(ExitCode::SUCCESS)
}
