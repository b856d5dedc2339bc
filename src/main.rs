use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facegate::{config, FaceGate, SampleSet, TrainingRequest};
use log::{info, warn};

#[derive(Parser)]
#[command(name = "facegate")]
#[command(version, about = "Face verification engine for ballot access")]
struct Cli {
    /// Config file (defaults to the compiled-in path)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll one or more face images for an identity
    Enroll {
        #[arg(short, long)]
        user: String,
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Verify a face image against a claimed identity
    Verify {
        #[arg(short, long)]
        user: String,
        image: PathBuf,
    },
    /// Retrain the classifier from enrolled samples
    Train {
        #[arg(long)]
        epochs: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
        /// Restrict training to these identities (repeatable)
        #[arg(short, long)]
        user: Vec<String>,
    },
    /// Show the loaded model and enrollment counts
    Status,
    /// List persisted model artifacts
    History,
    /// Make a persisted model artifact current
    Activate { key: String },
    /// Exclude a sample from future retraining
    Exclude { sample: String },
    /// Include a previously excluded sample again
    Include { sample: String },
    /// Remove all enrolled samples for an identity
    Purge {
        #[arg(short, long)]
        user: String,
    },
    /// Open config file in editor
    Config,
}

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .format_timestamp(None)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    if let Commands::Config = cli.command {
        return open_config(cli.config);
    }

    let cfg = config::load_config(cli.config.as_deref())?;
    let gate = FaceGate::open_fs(cfg).context("Failed to open face verification engine")?;

    match cli.command {
        Commands::Enroll { user, images } => enroll(&gate, &user, &images),
        Commands::Verify { user, image } => verify(&gate, &user, &image),
        Commands::Train {
            epochs,
            batch_size,
            user,
        } => train(&gate, epochs, batch_size, user),
        Commands::Status => status(&gate),
        Commands::History => history(&gate),
        Commands::Activate { key } => {
            gate.activate_model(&key)?;
            info!("✓ Model {} is now current", key);
            Ok(())
        }
        Commands::Exclude { sample } => {
            gate.set_training_sample(&sample, false)?;
            info!("Sample {} excluded from training", sample);
            Ok(())
        }
        Commands::Include { sample } => {
            gate.set_training_sample(&sample, true)?;
            info!("Sample {} included in training", sample);
            Ok(())
        }
        Commands::Purge { user } => {
            let removed = gate.purge_identity(&user)?;
            info!("✓ {} sample(s) purged for user: {}", removed, user);
            Ok(())
        }
        Commands::Config => unreachable!("handled before the engine is opened"),
    }
}

fn enroll(gate: &FaceGate, user_id: &str, images: &[PathBuf]) -> Result<()> {
    info!("Enrolling user: {}", user_id);
    let bytes = images
        .iter()
        .map(|path| std::fs::read(path).with_context(|| format!("reading {}", path.display())))
        .collect::<Result<Vec<_>>>()?;

    let outcomes = gate.enroll_batch(user_id, &bytes)?;
    let mut accepted = 0;
    for (path, outcome) in images.iter().zip(outcomes) {
        match outcome {
            Ok(enrollment) => {
                accepted += 1;
                info!(
                    "{}: sample {} (quality {:.3}, face {})",
                    path.display(),
                    enrollment.sample_id,
                    enrollment.quality_score,
                    if enrollment.face_detected {
                        "detected"
                    } else {
                        "center crop"
                    }
                );
            }
            Err(e) => warn!("{}: {}", path.display(), e),
        }
    }

    if accepted == 0 {
        anyhow::bail!("No usable face images. Please ensure the face is visible and well-lit.");
    }
    info!(
        "✓ {} of {} image(s) enrolled for user: {}. Run 'train' to make them verifiable.",
        accepted,
        images.len(),
        user_id
    );
    Ok(())
}

fn verify(gate: &FaceGate, user_id: &str, image: &Path) -> Result<()> {
    info!("Verifying user: {}", user_id);
    let bytes = std::fs::read(image).with_context(|| format!("reading {}", image.display()))?;
    let result = gate.verify(user_id, &bytes)?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    if result.accepted {
        info!("✓ Verification successful!");
        Ok(())
    } else {
        anyhow::bail!(
            "Verification rejected: confidence {:.3} (threshold {:.3})",
            result.confidence,
            result.threshold_used
        )
    }
}

fn train(
    gate: &FaceGate,
    epochs: Option<usize>,
    batch_size: Option<usize>,
    users: Vec<String>,
) -> Result<()> {
    let samples = if users.is_empty() {
        SampleSet::All
    } else {
        SampleSet::Identities(users)
    };
    let report = gate.retrain(&TrainingRequest {
        samples,
        epochs,
        batch_size,
    })?;
    println!(
        "{}",
        serde_json::json!({
            "accuracy": report.accuracy,
            "heldOutAccuracy": report.held_out_accuracy,
            "sampleCount": report.sample_count,
        })
    );
    info!("✓ Model trained on {} classes", report.class_count);
    Ok(())
}

fn status(gate: &FaceGate) -> Result<()> {
    let status = gate.model_status()?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn history(gate: &FaceGate) -> Result<()> {
    for key in gate.model_history()? {
        match gate.training_report(&key)? {
            Some(report) => println!(
                "{}  classes={} samples={} held_out={}",
                key,
                report.class_count,
                report.sample_count,
                report
                    .held_out_accuracy
                    .map(|a| format!("{a:.3}"))
                    .unwrap_or_else(|| "n/a".to_string())
            ),
            None => println!("{}", key),
        }
    }
    Ok(())
}

fn open_config(path: Option<PathBuf>) -> Result<()> {
    let config_path = path.unwrap_or_else(|| config::CONFIG_PATH.to_path_buf());
    let editor = env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());

    info!("Opening config file: {:?}", config_path);

    let status = std::process::Command::new(editor)
        .arg(&config_path)
        .status()
        .context("Failed to open editor")?;

    if !status.success() {
        anyhow::bail!("Editor exited with non-zero status");
    }

    Ok(())
}
