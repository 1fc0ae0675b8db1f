//! latent-lens CLI: interpretability analyses for diffusion sequences.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use latent_lens::artifact::ArtifactStore;
use latent_lens::attribution::CancelToken;
use latent_lens::config::{AnalysisConfig, ConfigError};
use latent_lens::emergence::ScoringSource;
use latent_lens::pipeline::{Collaborators, Pipeline, StageOutcome};
use latent_lens::simd;

#[derive(Parser)]
#[command(
    name = "latent-lens",
    version,
    about = "Trajectory analysis for diffusion sequences"
)]
struct Cli {
    /// TOML config file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Change magnitudes, critical steps and 2-D projection of the latents.
    Noise {
        /// Sequence directory.
        dir: PathBuf,

        /// Override the critical-step percentile.
        #[arg(long)]
        percentile: Option<f64>,
    },

    /// Concept similarity timeline and emergence points.
    Emergence {
        /// Sequence directory.
        dir: PathBuf,

        /// Concept to track (repeatable). Defaults to the prompt-derived set.
        #[arg(long = "concept")]
        concepts: Vec<String>,

        /// Override the emergence threshold.
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Token ablation study. Requires `[generation] command` in the config.
    Attribution {
        /// Sequence directory.
        dir: PathBuf,
    },

    /// Run every analysis; stages without a configured collaborator are skipped.
    All {
        /// Sequence directory.
        dir: PathBuf,
    },

    /// Show what a sequence directory contains.
    Info {
        /// Sequence directory.
        dir: PathBuf,
    },

    /// Write a config file with every default spelled out.
    InitConfig {
        /// Where to write the config.
        path: PathBuf,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config_path = cli.config.as_deref();
    let load_config = || {
        let config = AnalysisConfig::load_or_default(config_path)?;
        config.validate()?;
        Ok::<_, ConfigError>(config)
    };

    match cli.command {
        Commands::Noise { dir, percentile } => {
            let mut config = load_config()?;
            if let Some(p) = percentile {
                config.noise.percentile = p;
            }
            config.validate()?;
            let store = ArtifactStore::load(&dir)?;
            let summary = Pipeline::new(config).noise_decomposition(&store)?;

            println!("Prompt: {}", summary.prompt);
            println!("Transitions: {}", summary.step_changes.len());
            if let Some((step, magnitude)) = summary.step_changes.peak() {
                println!("Largest change: step {step} -> {} ({magnitude:.4})", step + 1);
            }
            match summary.critical_threshold {
                Some(t) => println!(
                    "Critical steps (> p{} = {t:.4}): {:?}",
                    summary.critical_percentile, summary.critical_steps
                ),
                None => println!("Critical steps: none (no transitions)"),
            }
            if let Some(projection) = &summary.projection {
                println!(
                    "Projection: {} samples, explained variance {:.1}% / {:.1}%",
                    projection.points.len(),
                    projection.explained_variance[0] * 100.0,
                    projection.explained_variance[1] * 100.0
                );
            }
            println!("Wrote {}", store.layout().noise_summary().display());
        }

        Commands::Emergence {
            dir,
            concepts,
            threshold,
        } => {
            let mut config = load_config()?;
            if !concepts.is_empty() {
                config.emergence.concepts = concepts;
            }
            if let Some(t) = threshold {
                config.emergence.threshold = t;
            }
            config.validate()?;
            let store = ArtifactStore::load(&dir)?;
            let collaborators = Collaborators::from_config(&config)?;
            let (summary, points) = Pipeline::new(config).semantic_emergence(
                &store,
                collaborators.similarity,
                collaborators.fallback,
            )?;

            if let ScoringSource::Fallback(name) = &points.scorer {
                println!(
                    "WARNING: scores come from fallback scorer {name}; they carry no semantic signal"
                );
            }
            println!("Concepts tracked: {}", summary.concepts.len());
            if !points.skipped_steps.is_empty() {
                println!("Steps without images (skipped): {:?}", points.skipped_steps);
            }
            for point in &points.points {
                match (point.step, point.similarity) {
                    (Some(step), Some(s)) => {
                        println!("  {:<40} emerged at step {step} ({s:.3})", point.concept)
                    }
                    _ => println!(
                        "  {:<40} never emerged (threshold {})",
                        point.concept, points.threshold
                    ),
                }
            }
        }

        Commands::Attribution { dir } => {
            let config = load_config()?;
            let store = ArtifactStore::load(&dir)?;
            let Some(mut generator) = config.generation.generator()? else {
                miette::bail!(
                    help = "Set `[generation] command = [\"program\", ...]` in the config file.",
                    "no generation command configured"
                );
            };
            let cancel = cancel_on_ctrl_c()?;
            let summary =
                Pipeline::new(config).token_attribution(&store, &mut generator, &cancel)?;

            println!("Tokens: {}", summary.tokens.len());
            println!("Succeeded: {}  Failed: {}", summary.succeeded, summary.failed);
            if summary.cancelled {
                println!("Cancelled: partial results were kept");
            }
            for (rank, idx) in summary.ranking.iter().enumerate() {
                if let Some(score) = summary.attribution_scores.get(idx) {
                    println!("  {:>2}. {:<20} {:.2}", rank + 1, score.token, score.divergence);
                }
            }
            for (idx, failure) in &summary.failures {
                println!("  token {idx} ({}) failed: {}", failure.token, failure.error);
            }
            println!("Wrote {}", store.layout().attribution_summary().display());
        }

        Commands::All { dir } => {
            let config = load_config()?;
            let mut collaborators = Collaborators::from_config(&config)?;
            collaborators.cancel = cancel_on_ctrl_c()?;
            let report = Pipeline::new(config).run(&dir, collaborators)?;

            println!("Sequence: {}", report.sequence_dir.display());
            for stage in &report.stages {
                match &stage.outcome {
                    StageOutcome::Succeeded { duration } => {
                        println!("  {:<20} ok ({:.1}s)", stage.kind.name(), duration.as_secs_f64())
                    }
                    StageOutcome::Skipped { reason } => {
                        println!("  {:<20} skipped: {reason}", stage.kind.name())
                    }
                    StageOutcome::Failed { error } => {
                        println!("  {:<20} FAILED: {error}", stage.kind.name())
                    }
                }
            }
            if !report.is_clean() {
                miette::bail!("one or more analyses failed");
            }
        }

        Commands::Info { dir } => {
            let store = ArtifactStore::load(&dir)?;
            let seq = store.sequence();
            println!("Directory: {}", store.root().display());
            println!("Prompt: {}", seq.prompt);
            if !seq.negative_prompt.is_empty() {
                println!("Negative prompt: {}", seq.negative_prompt);
            }
            println!("Steps: {}", seq.num_steps);
            println!("Guidance scale: {}", seq.guidance_scale);
            println!("Seed: {}", seq.seed);
            println!("Size: {}x{}", seq.width, seq.height);
            if let Some(at) = seq.created_at {
                println!("Generated at: {at}");
            }
            println!("Latent state shape: {:?}", seq.latents().state_shape());
            println!("Tokens: {:?}", seq.tokens());
            let missing = store.missing_step_images();
            if missing.is_empty() {
                println!("Step images: all present");
            } else {
                println!("Step images missing: {missing:?}");
            }
            println!("Distance kernel: {}", simd::detect_isa());
        }

        Commands::InitConfig { path, force } => init_config(&path, force)?,
    }

    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        miette::bail!(
            help = "Pass --force to overwrite it.",
            "{} already exists",
            path.display()
        );
    }
    AnalysisConfig::default().save(path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

/// A cancel token that Ctrl-C sets. The ablation study stops before its next token.
fn cancel_on_ctrl_c() -> Result<CancelToken> {
    let cancel = CancelToken::new();
    signal_hook::flag::register(signal_hook::consts::SIGINT, cancel.flag()).into_diagnostic()?;
    Ok(cancel)
}
