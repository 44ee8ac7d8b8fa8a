/*
 * Council Analyzer CLI - Rust Edition
 * Copyright (c) 2025 Council Analyzer Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

mod analyzer;
mod capabilities;
mod config;
mod diarization;
mod discovery;
mod downloader;
mod error;
mod ledger;
mod ollama;
mod pipeline;
mod segmenter;
mod transcriber;
#[cfg(test)]
mod test_support;
mod types;
mod utils;
mod validator;

use config::Config;
use diarization::HostedDiarizer;
use discovery::HttpClipFetcher;
use downloader::FfmpegExtractor;
use error::PipelineError;
use ledger::Ledger;
use ollama::OllamaClient;
use pipeline::{Pipeline, PipelineOptions};
use transcriber::AsrServer;

const EXIT_OK: i32 = 0;
const EXIT_MISSING_PREREQUISITE: i32 = 1;
const EXIT_FATAL: i32 = 2;

/// Council Analyzer CLI - durable batch pipeline for council meeting recordings
#[derive(Parser)]
#[command(name = "council-analyzer")]
#[command(version = "0.1.0")]
#[command(about = "Convert streamed council meetings into transcripts, speaker maps, and analyses")]
#[command(long_about = "
Council Analyzer CLI - Rust Edition

A resumable batch pipeline that converts publicly streamed council meeting
recordings into structured artifacts:
  - per-meeting transcripts with word timing (dual ASR engines)
  - model-agreement quality scores and review flags
  - speaker-attributed segments
  - LLM-extracted summaries, vote records, topic alerts, and positions

Meetings advance through a strict status sequence recorded in a durable
ledger; every stage is safe to interrupt and re-run.
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the data directories and the meeting ledger
    Setup,

    /// Probe a clip ID range for new meetings
    Discover {
        /// First clip ID to probe (defaults to the configured range)
        #[arg(long)]
        start: Option<i64>,

        /// Last clip ID to probe, inclusive
        #[arg(long)]
        end: Option<i64>,
    },

    /// Download pending meeting audio
    Download {
        /// Maximum meetings to process
        #[arg(long, default_value = "10")]
        batch: usize,
    },

    /// Transcribe downloaded meetings with both ASR engines
    Transcribe {
        /// Maximum meetings to process
        #[arg(long, default_value = "3")]
        batch: usize,

        /// Run only the primary engine
        #[arg(long)]
        single_model: bool,
    },

    /// Validate transcribed meetings (model agreement + coherence)
    Validate {
        /// Maximum meetings to process
        #[arg(long, default_value = "5")]
        batch: usize,
    },

    /// Produce speaker turns and identities
    Diarize {
        /// Diarize one specific meeting
        clip_id: Option<i64>,

        /// Maximum meetings to process in batch mode
        #[arg(long, default_value = "5")]
        batch: usize,

        /// Keep draining and rechecking until interrupted
        #[arg(long)]
        continuous: bool,

        /// Per-meeting failure limit in continuous mode
        #[arg(long)]
        max_retries: Option<u32>,

        /// Seconds to back off after a failure in continuous mode
        #[arg(long)]
        retry_delay: Option<u64>,
    },

    /// Run LLM analysis over validated meetings
    Analyze {
        /// Maximum meetings to process
        #[arg(long, default_value = "1")]
        batch: usize,
    },

    /// Show pipeline status and recent failures
    Status,

    /// Run the full stage sequence
    Pipeline {
        #[arg(long)]
        skip_discovery: bool,
        #[arg(long)]
        skip_download: bool,
        #[arg(long)]
        skip_transcribe: bool,
        #[arg(long)]
        skip_diarize: bool,
        #[arg(long)]
        skip_validate: bool,
        #[arg(long)]
        skip_analyze: bool,

        /// Process pending items only (implies --skip-discovery)
        #[arg(long)]
        incremental: bool,

        /// Print status instead of running
        #[arg(long)]
        status: bool,
    },
}

fn setup_logging(config: &Config) -> Result<()> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    std::fs::create_dir_all(&config.log_dir).context("Failed to create log directory")?;

    let file_appender =
        RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "council-analyzer.log");

    // File: everything from debug up. Stderr: errors only; normal progress
    // goes through println.
    let subscriber = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_filter(
                    EnvFilter::from_default_env()
                        .add_directive("council_analyzer=debug".parse()?)
                        .add_directive("info".parse()?),
                ),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true)
                .with_target(false)
                .compact()
                .with_filter(
                    EnvFilter::from_default_env().add_directive("error".parse()?),
                ),
        );

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    Ok(())
}

fn install_shutdown_handler() -> Result<Arc<AtomicBool>> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);

    ctrlc::set_handler(move || {
        println!("\n{}", "Interrupt received - finishing the current meeting...".yellow());
        flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to install interrupt handler")?;

    Ok(shutdown)
}

async fn build_pipeline(
    config: &Config,
    ledger: Ledger,
    shutdown: Arc<AtomicBool>,
) -> Result<Pipeline> {
    let fetcher = Arc::new(HttpClipFetcher::new(config)?);
    let extractor = Arc::new(FfmpegExtractor::new(config));
    let transcriber = Arc::new(AsrServer::new(config)?);
    let diarizer = Arc::new(HostedDiarizer::new(config)?);
    let chat = Arc::new(OllamaClient::new(
        &config.ollama_base_url,
        config.analysis_timeout_sec,
    )?);

    Ok(Pipeline::new(
        ledger,
        config.clone(),
        fetcher,
        extractor,
        transcriber,
        diarizer,
        chat,
        shutdown,
    ))
}

/// Open the ledger for a stage command. A missing database means setup has
/// not been run: exit code 1.
async fn open_existing_ledger(config: &Config) -> Result<Ledger, i32> {
    if !config.db_path.exists() {
        eprintln!(
            "{}",
            format!(
                "Ledger not found at {} - run `council-analyzer setup` first",
                config.db_path.display()
            )
            .red()
        );
        return Err(EXIT_MISSING_PREREQUISITE);
    }

    match Ledger::open(&config.db_path).await {
        Ok(ledger) => Ok(ledger),
        Err(e) => {
            eprintln!("{}", format!("Cannot open ledger: {:#}", e).red());
            Err(EXIT_FATAL)
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let config = Config::load()?;
    setup_logging(&config)?;

    if let Commands::Setup = cli.command {
        println!("{}", "Setting up pipeline...".bold());
        config.ensure_directories()?;
        Ledger::open(&config.db_path).await?;
        println!("Ledger initialized at {}", config.db_path.display());
        println!("Audio directory: {}", config.audio_dir.display());
        println!("Transcript directory: {}", config.transcript_dir.display());
        println!("{}", "Pipeline setup complete".green());
        return Ok(EXIT_OK);
    }

    let shutdown = install_shutdown_handler()?;

    match cli.command {
        Commands::Setup => unreachable!("handled above"),

        Commands::Discover { start, end } => {
            let ledger = match open_existing_ledger(&config).await {
                Ok(ledger) => ledger,
                Err(code) => return Ok(code),
            };
            let pipeline = build_pipeline(&config, ledger, shutdown).await?;

            let start_id = start.unwrap_or(config.clip_id_start);
            let end_id = end.unwrap_or(config.clip_id_end);
            println!(
                "{}",
                format!("Starting discovery for clips {} to {}", start_id, end_id).bold()
            );

            let stats = pipeline.run_discovery(start_id, end_id).await?;
            println!("{}", "Discovery complete!".bold().green());
            println!("  New meetings: {}", stats.new);
            println!("  Already known: {}", stats.existing);
            println!("  Updated: {}", stats.updated);
        }

        Commands::Download { batch } => {
            let ledger = match open_existing_ledger(&config).await {
                Ok(ledger) => ledger,
                Err(code) => return Ok(code),
            };
            let pipeline = build_pipeline(&config, ledger, shutdown).await?;

            let stats = pipeline.download_batch(batch).await?;
            println!("{}", "Download batch complete!".bold().green());
            println!("  {}", stats);
        }

        Commands::Transcribe { batch, single_model } => {
            let ledger = match open_existing_ledger(&config).await {
                Ok(ledger) => ledger,
                Err(code) => return Ok(code),
            };
            let pipeline = build_pipeline(&config, ledger, shutdown).await?;

            let stats = pipeline.transcribe_batch(batch, !single_model).await?;
            println!("{}", "Transcription batch complete!".bold().green());
            println!("  {}", stats);
        }

        Commands::Validate { batch } => {
            let ledger = match open_existing_ledger(&config).await {
                Ok(ledger) => ledger,
                Err(code) => return Ok(code),
            };
            let pipeline = build_pipeline(&config, ledger, shutdown).await?;

            let stats = pipeline.validate_batch(batch).await?;
            println!("{}", "Validation batch complete!".bold().green());
            println!("  {}", stats);
        }

        Commands::Diarize { clip_id, batch, continuous, max_retries, retry_delay } => {
            let ledger = match open_existing_ledger(&config).await {
                Ok(ledger) => ledger,
                Err(code) => return Ok(code),
            };
            let pipeline = build_pipeline(&config, ledger, shutdown).await?;

            if let Some(clip_id) = clip_id {
                let outcome = pipeline.diarize_one(clip_id).await?;
                println!("Diarization of {}: {:?}", clip_id, outcome);
            } else if continuous {
                pipeline
                    .run_continuous_diarization(
                        max_retries.unwrap_or(config.diarize_max_retries),
                        Duration::from_secs(retry_delay.unwrap_or(config.diarize_retry_delay_sec)),
                        Duration::from_secs(config.diarize_poll_interval_sec),
                    )
                    .await?;
            } else {
                let stats = pipeline.diarize_batch(batch).await?;
                println!("{}", "Diarization batch complete!".bold().green());
                println!("  {}", stats);
            }
        }

        Commands::Analyze { batch } => {
            let ledger = match open_existing_ledger(&config).await {
                Ok(ledger) => ledger,
                Err(code) => return Ok(code),
            };
            let pipeline = build_pipeline(&config, ledger, shutdown).await?;

            let stats = pipeline.analyze_batch(batch).await?;
            println!("{}", "Analysis batch complete!".bold().green());
            println!("  {}", stats);
        }

        Commands::Status => {
            let ledger = match open_existing_ledger(&config).await {
                Ok(ledger) => ledger,
                Err(code) => return Ok(code),
            };
            let pipeline = build_pipeline(&config, ledger, shutdown).await?;
            pipeline.print_status().await?;

            let chat = OllamaClient::new(&config.ollama_base_url, config.analysis_timeout_sec)?;
            match chat.health_check().await {
                Ok(()) => println!("\n  LLM endpoint:  {}", "ok".green()),
                Err(e) => {
                    println!("\n  LLM endpoint:  {}", format!("unreachable ({})", e).yellow())
                }
            }
        }

        Commands::Pipeline {
            skip_discovery,
            skip_download,
            skip_transcribe,
            skip_diarize,
            skip_validate,
            skip_analyze,
            incremental,
            status,
        } => {
            // The composite command bootstraps its own prerequisites.
            config.ensure_directories()?;
            let ledger = match Ledger::open(&config.db_path).await {
                Ok(ledger) => ledger,
                Err(e) => {
                    eprintln!("{}", format!("Cannot open ledger: {:#}", e).red());
                    return Ok(EXIT_FATAL);
                }
            };
            let pipeline = build_pipeline(&config, ledger, shutdown).await?;

            if status {
                pipeline.print_status().await?;
            } else if incremental {
                pipeline.run_incremental().await;
            } else {
                let options = PipelineOptions {
                    skip_discovery,
                    skip_download,
                    skip_transcribe,
                    skip_diarize,
                    skip_validate,
                    skip_analyze,
                    ..PipelineOptions::default()
                };
                pipeline.run_full_pipeline(&options).await;
            }
        }
    }

    Ok(EXIT_OK)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            if let Some(pipeline_error) = e.downcast_ref::<PipelineError>() {
                if pipeline_error.is_fatal() {
                    eprintln!("{}", format!("Fatal: {:#}", e).red());
                    std::process::exit(EXIT_FATAL);
                }
            }
            eprintln!("{}", format!("Error: {:#}", e).red());
            EXIT_MISSING_PREREQUISITE
        }
    };

    std::process::exit(code);
}
