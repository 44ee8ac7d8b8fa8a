/*
 * Council Analyzer CLI - Dual-Model Transcription
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
use async_trait::async_trait;
use reqwest::Client;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;

use crate::capabilities::Transcriber;
use crate::config::Config;
use crate::error::PipelineError;
use crate::ledger::Ledger;
use crate::types::{EventStatus, MeetingStatus, Stage, StageOutcome, TranscriptFile};

/// Speech-to-text over a local model-serving endpoint. The server accepts a
/// multipart upload and returns verbose JSON with segment and word timing.
pub struct AsrServer {
    client: Client,
    base_url: String,
}

impl AsrServer {
    pub fn new(config: &Config) -> Result<Self> {
        // Transcription runs for a long time; the wall-clock bound is
        // enforced by the stage worker, not the socket timeout.
        let client = Client::builder()
            .timeout(Duration::from_secs(config.transcribe_timeout_sec.max(1)))
            .build()
            .context("Failed to create HTTP client for ASR")?;

        Ok(Self {
            client,
            base_url: config.asr_base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Transcriber for AsrServer {
    async fn transcribe(&self, audio: &Path, model: &str) -> Result<TranscriptFile> {
        let started = Instant::now();

        let file_data = tokio::fs::read(audio)
            .await
            .with_context(|| format!("Failed to read audio file {}", audio.display()))?;

        let file_name = audio
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio.mp3")
            .to_string();

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(file_data)
                    .file_name(file_name)
                    .mime_str("audio/mpeg")?,
            )
            .text("model", model.to_string())
            .text("language", "en")
            .text("response_format", "verbose_json")
            .text("timestamp_granularities[]", "word");

        let response = self
            .client
            .post(format!("{}/v1/audio/transcriptions", self.base_url))
            .multipart(form)
            .send()
            .await
            .context("Failed to send audio to ASR server")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_else(|_| "<no body>".to_string());
            return Err(anyhow::anyhow!("ASR server error ({}): {}", status, body));
        }

        let mut transcript: TranscriptFile = response
            .json()
            .await
            .map_err(|e| PipelineError::ParseError(format!("ASR response: {}", e)))?;

        transcript.model = model.to_string();
        transcript.processing_time_seconds = started.elapsed().as_secs_f64();
        if transcript.language.is_empty() {
            transcript.language = "en".to_string();
        }

        Ok(transcript)
    }
}

/// Transcription stage worker: runs the primary engine and, in dual mode,
/// the secondary engine on the same audio, persisting both artifacts.
pub struct TranscriptionWorker {
    ledger: Ledger,
    transcriber: Arc<dyn Transcriber>,
    config: Config,
}

impl TranscriptionWorker {
    pub fn new(ledger: Ledger, transcriber: Arc<dyn Transcriber>, config: Config) -> Self {
        Self {
            ledger,
            transcriber,
            config,
        }
    }

    async fn run_engine(&self, audio: &Path, model: &str) -> Result<TranscriptFile> {
        let wall_clock = Duration::from_secs(self.config.transcribe_timeout_sec.max(1));

        let transcript = timeout(wall_clock, self.transcriber.transcribe(audio, model))
            .await
            .map_err(|_| anyhow::anyhow!("transcription timeout for model {}", model))??;

        if transcript.text.trim().is_empty() {
            return Err(anyhow::anyhow!("engine {} produced empty text", model));
        }

        Ok(transcript)
    }

    fn write_artifact(&self, clip_id: i64, transcript: &TranscriptFile) -> Result<()> {
        let path = self.config.transcript_path(clip_id, &transcript.model);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create transcript directory")?;
        }

        let json = serde_json::to_string_pretty(transcript)
            .context("Failed to serialize transcript")?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write transcript {}", path.display()))?;

        Ok(())
    }

    /// Transcribe one meeting. A retry re-runs both engines and overwrites
    /// the artifacts.
    pub async fn transcribe_meeting(&self, clip_id: i64, dual_model: bool) -> Result<StageOutcome> {
        let Some(meeting) = self.ledger.get_meeting(clip_id).await? else {
            tracing::error!("Meeting {} not found", clip_id);
            self.ledger
                .log_event(clip_id, Stage::Transcribe, EventStatus::Failed, "Meeting not found")
                .await?;
            return Ok(StageOutcome::Failed);
        };

        match meeting.status {
            MeetingStatus::Downloaded => {
                if !self
                    .ledger
                    .try_advance(clip_id, MeetingStatus::Downloaded, MeetingStatus::Transcribing)
                    .await?
                {
                    return Ok(StageOutcome::Skipped);
                }
            }
            MeetingStatus::Transcribing => {}
            _ => return Ok(StageOutcome::Skipped),
        }

        let audio_path = self.config.audio_path(clip_id);
        if !audio_path.exists() {
            tracing::error!("Audio file not found for meeting {}", clip_id);
            self.ledger.update_status(clip_id, MeetingStatus::Failed).await?;
            self.ledger
                .log_event(clip_id, Stage::Transcribe, EventStatus::Failed, "Audio file not found")
                .await?;
            return Ok(StageOutcome::Failed);
        }

        self.ledger
            .log_event(
                clip_id,
                Stage::Transcribe,
                EventStatus::Started,
                &format!("Starting transcription: {}", meeting.title),
            )
            .await?;

        let primary_model = self.config.whisper_model_primary.clone();
        let primary = match self.run_engine(&audio_path, &primary_model).await {
            Ok(transcript) => transcript,
            Err(e) => {
                return self.fail(clip_id, &e.to_string()).await;
            }
        };
        self.write_artifact(clip_id, &primary)?;
        tracing::info!(
            "Primary transcription complete for {} in {:.1}s",
            clip_id,
            primary.processing_time_seconds
        );

        let mut total_time = primary.processing_time_seconds;
        let mut model_used = primary_model.clone();

        if dual_model {
            let secondary_model = self.config.whisper_model_secondary.clone();
            let secondary = match self.run_engine(&audio_path, &secondary_model).await {
                Ok(transcript) => transcript,
                Err(e) => {
                    return self.fail(clip_id, &e.to_string()).await;
                }
            };
            self.write_artifact(clip_id, &secondary)?;
            tracing::info!(
                "Secondary transcription complete for {} in {:.1}s",
                clip_id,
                secondary.processing_time_seconds
            );

            total_time += secondary.processing_time_seconds;
            model_used = format!("dual:{}+{}", primary_model, secondary_model);
        }

        // Only the primary transcript lands in the ledger; the secondary
        // lives on disk for the validator.
        let words = primary.word_timestamps();
        self.ledger
            .insert_transcript(clip_id, &primary.text, &words, &model_used, total_time)
            .await?;

        self.ledger.update_status(clip_id, MeetingStatus::Transcribed).await?;
        self.ledger
            .log_event(
                clip_id,
                Stage::Transcribe,
                EventStatus::Completed,
                "Transcription successful",
            )
            .await?;

        tracing::info!("Transcription complete for {} in {:.1}s total", clip_id, total_time);
        Ok(StageOutcome::Completed)
    }

    async fn fail(&self, clip_id: i64, message: &str) -> Result<StageOutcome> {
        tracing::error!("Transcription error for {}: {}", clip_id, message);
        self.ledger.update_status(clip_id, MeetingStatus::Failed).await?;
        self.ledger
            .log_event(clip_id, Stage::Transcribe, EventStatus::Failed, message)
            .await?;
        Ok(StageOutcome::Failed)
    }
}
