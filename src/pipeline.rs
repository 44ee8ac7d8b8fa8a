/*
 * Council Analyzer CLI - Pipeline Orchestration
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

use anyhow::Result;
use chrono::{DateTime, Utc};
use colored::*;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

use crate::analyzer::AnalyzerWorker;
use crate::capabilities::{AudioExtractor, Chat, ClipFetcher, Diarizer, Transcriber};
use crate::config::Config;
use crate::diarization::DiarizationWorker;
use crate::discovery::{self, DiscoveryStats};
use crate::downloader::Downloader;
use crate::ledger::Ledger;
use crate::transcriber::TranscriptionWorker;
use crate::types::{Meeting, MeetingStatus, ProcessingEvent, Stage, StageOutcome};
use crate::validator::ValidationWorker;

// Rough per-meeting stage costs, in minutes, for the ETA estimate.
const EST_DOWNLOAD_MINUTES: i64 = 7;
const EST_TRANSCRIBE_MINUTES: i64 = 25;
const EST_VALIDATE_MINUTES: i64 = 3;
const EST_ANALYZE_MINUTES: i64 = 8;

const SPEED_WINDOW: usize = 20;

/// Per-stage batch counts, printed after each stage drain.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchStats {
    pub done: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl BatchStats {
    fn record(&mut self, outcome: StageOutcome) {
        match outcome {
            StageOutcome::Completed => self.done += 1,
            StageOutcome::Failed => self.failed += 1,
            StageOutcome::Skipped => self.skipped += 1,
        }
    }
}

impl std::fmt::Display for BatchStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "done: {}, failed: {}, skipped: {}",
            self.done, self.failed, self.skipped
        )
    }
}

/// Stage toggles and batch sizes for a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub skip_discovery: bool,
    pub skip_download: bool,
    pub skip_transcribe: bool,
    pub skip_diarize: bool,
    pub skip_validate: bool,
    pub skip_analyze: bool,
    pub download_batch_size: usize,
    pub transcribe_batch_size: usize,
    pub diarize_batch_size: usize,
    pub validate_batch_size: usize,
    pub analyze_batch_size: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            skip_discovery: false,
            skip_download: false,
            skip_transcribe: false,
            skip_diarize: false,
            skip_validate: false,
            skip_analyze: false,
            download_batch_size: 10,
            transcribe_batch_size: 3,
            diarize_batch_size: 5,
            validate_batch_size: 5,
            analyze_batch_size: 1,
        }
    }
}

/// Result of a full pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub discovery: DiscoveryStats,
    pub download: BatchStats,
    pub transcribe: BatchStats,
    pub diarize: BatchStats,
    pub validate: BatchStats,
    pub analyze: BatchStats,
    pub errors: Vec<String>,
}

impl PipelineResult {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            completed_at: None,
            discovery: DiscoveryStats::default(),
            download: BatchStats::default(),
            transcribe: BatchStats::default(),
            diarize: BatchStats::default(),
            validate: BatchStats::default(),
            analyze: BatchStats::default(),
            errors: Vec::new(),
        }
    }

    pub fn summary(&self) -> String {
        let duration = self
            .completed_at
            .map(|end| format!(" in {:.1}s", (end - self.started_at).num_milliseconds() as f64 / 1000.0))
            .unwrap_or_default();

        format!(
            "Pipeline completed{}\n  Discovery: {} new meetings\n  Downloaded: {}\n  Transcribed: {}\n  Diarized: {}\n  Validated: {}\n  Analyzed: {}\n  Errors: {}",
            duration,
            self.discovery.new,
            self.download.done,
            self.transcribe.done,
            self.diarize.done,
            self.validate.done,
            self.analyze.done,
            self.errors.len()
        )
    }
}

/// Current pipeline status with a crude time estimate.
#[derive(Debug, Clone)]
pub struct PipelineStatus {
    pub total_meetings: i64,
    pub by_status: BTreeMap<String, i64>,
    pub pending_download: i64,
    pub pending_transcribe: i64,
    pub pending_validate: i64,
    pub pending_analyze: i64,
    pub completed: i64,
    pub failed: i64,
    pub estimated_minutes_remaining: i64,
    pub recent_failures: Vec<ProcessingEvent>,
}

/// The orchestrator: sequences stage workers against the shared ledger,
/// one meeting at a time, with cooperative shutdown between invocations.
pub struct Pipeline {
    ledger: Ledger,
    config: Config,
    fetcher: Arc<dyn ClipFetcher>,
    downloader: Downloader,
    transcription: TranscriptionWorker,
    validation: ValidationWorker,
    diarization: DiarizationWorker,
    analyzer: AnalyzerWorker,
    shutdown: Arc<AtomicBool>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Ledger,
        config: Config,
        fetcher: Arc<dyn ClipFetcher>,
        extractor: Arc<dyn AudioExtractor>,
        transcriber: Arc<dyn Transcriber>,
        diarizer: Arc<dyn Diarizer>,
        chat: Arc<dyn Chat>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            downloader: Downloader::new(ledger.clone(), extractor, config.clone()),
            transcription: TranscriptionWorker::new(ledger.clone(), transcriber, config.clone()),
            validation: ValidationWorker::new(ledger.clone(), chat.clone(), config.clone()),
            diarization: DiarizationWorker::new(
                ledger.clone(),
                diarizer,
                chat.clone(),
                config.clone(),
            ),
            analyzer: AnalyzerWorker::new(ledger.clone(), chat, config.clone()),
            ledger,
            config,
            fetcher,
            shutdown,
        }
    }

    fn interrupted(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub async fn run_discovery(&self, start_id: i64, end_id: i64) -> Result<DiscoveryStats> {
        discovery::run_discovery(
            Arc::clone(&self.fetcher),
            &self.ledger,
            start_id,
            end_id,
            &discovery::default_type_filter(),
            self.config.discovery_concurrency,
        )
        .await
    }

    /// Drain up to `batch_size` meetings through the download stage,
    /// resuming crash leftovers first.
    pub async fn download_batch(&self, batch_size: usize) -> Result<BatchStats> {
        let mut stats = BatchStats::default();

        // Crash leftovers: meetings stuck mid-download from a prior run
        let leftovers = self
            .ledger
            .get_meetings_by_status(MeetingStatus::Downloading)
            .await?;
        for meeting in leftovers {
            if self.interrupted() || stats.done + stats.failed >= batch_size {
                return Ok(stats);
            }
            tracing::info!("Resuming interrupted download for {}", meeting.clip_id);
            stats.record(self.downloader.download_meeting(meeting.clip_id).await?);
        }

        while stats.done + stats.failed < batch_size && !self.interrupted() {
            let Some(meeting) = self.ledger.next_pending(Stage::Download).await? else {
                break;
            };
            println!("{}", format!("Downloading {}: {}", meeting.clip_id, meeting.title).cyan());
            stats.record(self.downloader.download_meeting(meeting.clip_id).await?);
        }

        Ok(stats)
    }

    pub async fn transcribe_batch(&self, batch_size: usize, dual_model: bool) -> Result<BatchStats> {
        let mut stats = BatchStats::default();

        let leftovers = self
            .ledger
            .get_meetings_by_status(MeetingStatus::Transcribing)
            .await?;
        for meeting in leftovers {
            if self.interrupted() || stats.done + stats.failed >= batch_size {
                return Ok(stats);
            }
            tracing::info!("Resuming interrupted transcription for {}", meeting.clip_id);
            stats.record(
                self.transcription
                    .transcribe_meeting(meeting.clip_id, dual_model)
                    .await?,
            );
        }

        while stats.done + stats.failed < batch_size && !self.interrupted() {
            let Some(meeting) = self.ledger.next_pending(Stage::Transcribe).await? else {
                break;
            };
            println!("{}", format!("Transcribing {}: {}", meeting.clip_id, meeting.title).cyan());
            stats.record(
                self.transcription
                    .transcribe_meeting(meeting.clip_id, dual_model)
                    .await?,
            );
        }

        Ok(stats)
    }

    pub async fn validate_batch(&self, batch_size: usize) -> Result<BatchStats> {
        let mut stats = BatchStats::default();

        let leftovers = self
            .ledger
            .get_meetings_by_status(MeetingStatus::Validating)
            .await?;
        for meeting in leftovers {
            if self.interrupted() || stats.done + stats.failed >= batch_size {
                return Ok(stats);
            }
            tracing::info!("Resuming interrupted validation for {}", meeting.clip_id);
            stats.record(self.validation.validate_meeting(meeting.clip_id).await?);
        }

        while stats.done + stats.failed < batch_size && !self.interrupted() {
            let Some(meeting) = self.ledger.next_pending(Stage::Validate).await? else {
                break;
            };
            println!("{}", format!("Validating {}: {}", meeting.clip_id, meeting.title).cyan());
            stats.record(self.validation.validate_meeting(meeting.clip_id).await?);
        }

        Ok(stats)
    }

    pub async fn analyze_batch(&self, batch_size: usize) -> Result<BatchStats> {
        let mut stats = BatchStats::default();
        let types = self.config.enabled_analysis_types.clone();

        let leftovers = self
            .ledger
            .get_meetings_by_status(MeetingStatus::Analyzing)
            .await?;
        for meeting in leftovers {
            if self.interrupted() || stats.done + stats.failed >= batch_size {
                return Ok(stats);
            }
            tracing::info!("Resuming interrupted analysis for {}", meeting.clip_id);
            stats.record(self.analyzer.analyze_meeting(meeting.clip_id, &types).await?);
        }

        while stats.done + stats.failed < batch_size && !self.interrupted() {
            let Some(meeting) = self.ledger.next_pending(Stage::Analyze).await? else {
                break;
            };
            println!("{}", format!("Analyzing {}: {}", meeting.clip_id, meeting.title).cyan());
            stats.record(self.analyzer.analyze_meeting(meeting.clip_id, &types).await?);
        }

        Ok(stats)
    }

    /// Meetings eligible for diarization: transcribed or later, with no
    /// diarization artifact yet. Oldest clip first.
    pub async fn pending_diarization(&self) -> Result<Vec<Meeting>> {
        let mut pending: Vec<Meeting> = self
            .ledger
            .get_all_meetings()
            .await?
            .into_iter()
            .filter(|meeting| {
                meeting.status.ordinal() >= MeetingStatus::Transcribed.ordinal()
                    && meeting.status != MeetingStatus::Failed
                    && meeting.status != MeetingStatus::Skipped
                    && !self.config.diarization_path(meeting.clip_id).exists()
            })
            .collect();

        pending.sort_by_key(|meeting| meeting.clip_id);
        Ok(pending)
    }

    pub async fn diarize_batch(&self, batch_size: usize) -> Result<BatchStats> {
        let mut stats = BatchStats::default();

        let pending = self.pending_diarization().await?;
        if pending.is_empty() {
            println!("{}", "No meetings pending diarization".yellow());
            return Ok(stats);
        }

        for meeting in pending.into_iter().take(batch_size) {
            if self.interrupted() {
                break;
            }
            println!("{}", format!("Diarizing {}: {}", meeting.clip_id, meeting.title).cyan());
            stats.record(self.diarization.diarize_meeting(meeting.clip_id).await?);
        }

        Ok(stats)
    }

    pub async fn diarize_one(&self, clip_id: i64) -> Result<StageOutcome> {
        self.diarization.diarize_meeting(clip_id).await
    }

    /// Run the full stage sequence. Each stage drains its batch before the
    /// next begins; a stage-level error is recorded and ends the run.
    pub async fn run_full_pipeline(&self, options: &PipelineOptions) -> PipelineResult {
        let mut result = PipelineResult::new();

        let outcome: Result<()> = async {
            if !options.skip_discovery {
                println!("\n{}", "Stage 1: Discovery".bold().cyan());
                result.discovery = self
                    .run_discovery(self.config.clip_id_start, self.config.clip_id_end)
                    .await?;
            } else {
                println!("\n{}", "Skipping discovery".dimmed());
            }

            if !options.skip_download && !self.interrupted() {
                println!("\n{}", "Stage 2: Download".bold().cyan());
                result.download = self.download_batch(options.download_batch_size).await?;
                println!("  {}", result.download);
            } else {
                println!("\n{}", "Skipping download".dimmed());
            }

            if !options.skip_transcribe && !self.interrupted() {
                println!("\n{}", "Stage 3: Transcription".bold().cyan());
                result.transcribe = self
                    .transcribe_batch(options.transcribe_batch_size, true)
                    .await?;
                println!("  {}", result.transcribe);
            } else {
                println!("\n{}", "Skipping transcription".dimmed());
            }

            if !options.skip_diarize && !self.interrupted() {
                println!("\n{}", "Stage 4: Speaker Diarization".bold().cyan());
                result.diarize = self.diarize_batch(options.diarize_batch_size).await?;
                println!("  {}", result.diarize);
            } else {
                println!("\n{}", "Skipping diarization".dimmed());
            }

            if !options.skip_validate && !self.interrupted() {
                println!("\n{}", "Stage 5: Validation".bold().cyan());
                result.validate = self.validate_batch(options.validate_batch_size).await?;
                println!("  {}", result.validate);
            } else {
                println!("\n{}", "Skipping validation".dimmed());
            }

            if !options.skip_analyze && !self.interrupted() {
                println!("\n{}", "Stage 6: Analysis".bold().cyan());
                result.analyze = self.analyze_batch(options.analyze_batch_size).await?;
                println!("  {}", result.analyze);
            } else {
                println!("\n{}", "Skipping analysis".dimmed());
            }

            Ok(())
        }
        .await;

        if let Err(e) = outcome {
            tracing::error!("Pipeline error: {}", e);
            result.errors.push(e.to_string());
        }

        result.completed_at = Some(Utc::now());

        println!("\n{}", "=".repeat(50));
        println!("{}", "Pipeline Complete!".bold().green());
        println!("{}", result.summary());

        result
    }

    /// Process pending items only; discovery is skipped.
    pub async fn run_incremental(&self) -> PipelineResult {
        let options = PipelineOptions {
            skip_discovery: true,
            ..PipelineOptions::default()
        };
        self.run_full_pipeline(&options).await
    }

    pub async fn status(&self) -> Result<PipelineStatus> {
        let stats = self.ledger.stats().await?;

        let count = |status: MeetingStatus| -> i64 {
            stats.by_status.get(status.as_str()).copied().unwrap_or(0)
        };

        let pending_download = count(MeetingStatus::Discovered);
        let pending_transcribe = count(MeetingStatus::Downloaded);
        let pending_validate = count(MeetingStatus::Transcribed);
        let pending_analyze = count(MeetingStatus::Validated);

        let estimated_minutes_remaining = pending_download * EST_DOWNLOAD_MINUTES
            + pending_transcribe * EST_TRANSCRIBE_MINUTES
            + pending_validate * EST_VALIDATE_MINUTES
            + pending_analyze * EST_ANALYZE_MINUTES;

        let completed = count(MeetingStatus::Analyzed);
        let failed = count(MeetingStatus::Failed);

        Ok(PipelineStatus {
            total_meetings: stats.total_meetings,
            by_status: stats.by_status,
            pending_download,
            pending_transcribe,
            pending_validate,
            pending_analyze,
            completed,
            failed,
            estimated_minutes_remaining,
            recent_failures: stats.recent_failures,
        })
    }

    pub async fn print_status(&self) -> Result<()> {
        let status = self.status().await?;

        println!("\n{}", "Pipeline Status".bold());
        println!("{}", "=".repeat(50));

        // Statuses in pipeline order, not alphabetical
        for meeting_status in MeetingStatus::all() {
            if let Some(count) = status.by_status.get(meeting_status.as_str()) {
                println!("  {:<14} {:>6}", meeting_status.as_str(), count);
            }
        }
        println!("  {:<14} {:>6}", "total", status.total_meetings);

        println!("\n{}", "Pending Work:".bold());
        println!("  Download:   {}", status.pending_download);
        println!("  Transcribe: {}", status.pending_transcribe);
        println!("  Validate:   {}", status.pending_validate);
        println!("  Analyze:    {}", status.pending_analyze);
        println!("  Completed:  {}", status.completed);
        println!("  Failed:     {}", status.failed);

        if status.estimated_minutes_remaining > 0 {
            let hours = status.estimated_minutes_remaining / 60;
            let minutes = status.estimated_minutes_remaining % 60;
            println!(
                "\n{}",
                format!("Estimated time remaining: {}h {}m", hours, minutes).dimmed()
            );
        }

        if !status.recent_failures.is_empty() {
            println!("\n{}", "Recent Failures:".bold().red());
            for failure in status.recent_failures.iter().take(5) {
                let message: String = failure.message.chars().take(50).collect();
                println!("  Clip {} [{}]: {}", failure.clip_id, failure.stage, message);
            }
        }

        Ok(())
    }

    /// Continuous diarization supervisor: drain pending meetings, sleep,
    /// recheck. A meeting leaves the queue once its failed diarize events
    /// reach `max_retries`. Runs until interrupted.
    pub async fn run_continuous_diarization(
        &self,
        max_retries: u32,
        retry_delay: Duration,
        poll_interval: Duration,
    ) -> Result<()> {
        let mut completed = 0usize;
        let mut failed = 0usize;
        let mut completion_secs: Vec<f64> = Vec::new();

        println!("{}", "Continuous diarization started (Ctrl+C to stop)".bold());

        while !self.interrupted() {
            let mut pending = Vec::new();
            for meeting in self.pending_diarization().await? {
                let retries = self.ledger.retry_count(meeting.clip_id, Stage::Diarize).await?;
                if retries < max_retries as i64 {
                    pending.push(meeting);
                } else {
                    tracing::warn!(
                        "Meeting {} exhausted {} diarize retries; leaving it for manual review",
                        meeting.clip_id,
                        retries
                    );
                }
            }

            if pending.is_empty() {
                println!(
                    "{}",
                    format!(
                        "Queue empty ({} done, {} failed this session); rechecking in {}s",
                        completed,
                        failed,
                        poll_interval.as_secs()
                    )
                    .dimmed()
                );
                self.interruptible_sleep(poll_interval).await;
                continue;
            }

            let queue_len = pending.len();
            for (position, meeting) in pending.into_iter().enumerate() {
                if self.interrupted() {
                    break;
                }

                println!(
                    "{}",
                    format!(
                        "[{}/{}] Diarizing {}: {}",
                        position + 1,
                        queue_len,
                        meeting.clip_id,
                        meeting.title
                    )
                    .cyan()
                );

                let started = Instant::now();
                let outcome = self.diarization.diarize_meeting(meeting.clip_id).await?;
                let elapsed = started.elapsed().as_secs_f64();

                match outcome {
                    StageOutcome::Completed => {
                        completed += 1;
                        completion_secs.push(elapsed);
                        if completion_secs.len() > SPEED_WINDOW {
                            completion_secs.remove(0);
                        }

                        let avg = completion_secs.iter().sum::<f64>() / completion_secs.len() as f64;
                        let per_hour = if avg > 0.0 { 3600.0 / avg } else { 0.0 };
                        let remaining = queue_len.saturating_sub(position + 1);
                        println!(
                            "{}",
                            format!(
                                "  done in {:.0}s ({:.1}/hr, ~{:.1}h left this pass)",
                                elapsed,
                                per_hour,
                                if per_hour > 0.0 { remaining as f64 / per_hour } else { 0.0 }
                            )
                            .green()
                        );
                    }
                    _ => {
                        failed += 1;
                        println!(
                            "{}",
                            format!("  failed after {:.0}s; backing off {}s", elapsed, retry_delay.as_secs())
                                .red()
                        );
                        self.interruptible_sleep(retry_delay).await;
                    }
                }
            }
        }

        println!(
            "{}",
            format!("Continuous diarization stopped: {} done, {} failed", completed, failed).bold()
        );
        Ok(())
    }

    async fn interruptible_sleep(&self, duration: Duration) {
        let mut remaining = duration;
        let tick = Duration::from_secs(1);
        while remaining > Duration::ZERO && !self.interrupted() {
            let step = remaining.min(tick);
            sleep(step).await;
            remaining = remaining.saturating_sub(step);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::path::Path;

    use crate::capabilities::{AudioProbe, ChatOptions, SpeakerTurn};
    use crate::test_support::test_config;
    use crate::types::{AnalysisType, AsrSegment, TranscriptFile, WordStamp};

    const CLIP_PAGE: &str = r#"
<html>
  <head><title>6/1/21 City Council Meeting</title></head>
  <body>
    <source type="application/x-mpegurl" src="https://example.test/streams/100.m3u8">
    <div class="index-point" time="0" data-id="1">1. Call to Order</div>
    <div class="index-point" time="4" data-id="2">2. Budget Hearing</div>
  </body>
</html>
"#;

    struct StubFetcher;

    #[async_trait]
    impl ClipFetcher for StubFetcher {
        async fn fetch_clip_page(&self, clip_id: i64) -> Result<Option<String>> {
            if clip_id == 100 {
                Ok(Some(CLIP_PAGE.to_string()))
            } else {
                Ok(None)
            }
        }
    }

    struct StubExtractor;

    #[async_trait]
    impl AudioExtractor for StubExtractor {
        async fn extract_audio(&self, _stream_url: &str, output: &Path) -> Result<()> {
            std::fs::create_dir_all(output.parent().unwrap()).unwrap();
            std::fs::write(output, b"audio").unwrap();
            Ok(())
        }

        async fn probe_audio(&self, path: &Path) -> Result<Option<AudioProbe>> {
            if !path.exists() {
                return Ok(None);
            }
            let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            if size == 0 {
                return Ok(None);
            }
            Ok(Some(AudioProbe {
                duration_seconds: 8.0,
                size_bytes: size,
                format: Some("mp3".to_string()),
            }))
        }
    }

    struct StubAsr;

    #[async_trait]
    impl Transcriber for StubAsr {
        async fn transcribe(&self, _audio: &Path, model: &str) -> Result<TranscriptFile> {
            Ok(TranscriptFile {
                text: "This is Council Member Huber. I move approval of the budget and the housing element."
                    .to_string(),
                segments: vec![
                    AsrSegment {
                        start: 0.0,
                        end: 4.0,
                        text: "This is Council Member Huber".to_string(),
                        words: Some(vec![
                            WordStamp { word: "This".to_string(), start: 0.0, end: 0.5 },
                            WordStamp { word: "is".to_string(), start: 0.5, end: 1.0 },
                            WordStamp { word: "Council".to_string(), start: 1.0, end: 1.5 },
                            WordStamp { word: "Member".to_string(), start: 1.5, end: 2.0 },
                            WordStamp { word: "Huber".to_string(), start: 2.0, end: 2.5 },
                        ]),
                    },
                    AsrSegment {
                        start: 4.0,
                        end: 8.0,
                        text: "I move approval of the budget and the housing element".to_string(),
                        words: Some(vec![
                            WordStamp { word: "I".to_string(), start: 4.0, end: 4.2 },
                            WordStamp { word: "move".to_string(), start: 4.2, end: 4.6 },
                            WordStamp { word: "approval".to_string(), start: 4.6, end: 5.2 },
                            WordStamp { word: "of".to_string(), start: 5.2, end: 5.4 },
                            WordStamp { word: "the".to_string(), start: 5.4, end: 5.6 },
                            WordStamp { word: "budget".to_string(), start: 5.6, end: 6.0 },
                            WordStamp { word: "and".to_string(), start: 6.0, end: 6.2 },
                            WordStamp { word: "the".to_string(), start: 6.2, end: 6.4 },
                            WordStamp { word: "housing".to_string(), start: 6.4, end: 7.0 },
                            WordStamp { word: "element".to_string(), start: 7.0, end: 8.0 },
                        ]),
                    },
                ],
                language: "en".to_string(),
                processing_time_seconds: 0.5,
                model: model.to_string(),
            })
        }
    }

    struct StubDiarizer;

    #[async_trait]
    impl Diarizer for StubDiarizer {
        async fn diarize(&self, _audio: &Path) -> Result<Vec<SpeakerTurn>> {
            Ok(vec![SpeakerTurn { start: 0.0, end: 8.0, speaker_id: "SPK_0".to_string() }])
        }

        fn is_available(&self) -> bool {
            true
        }
    }

    struct StubChat;

    #[async_trait]
    impl Chat for StubChat {
        async fn generate(&self, _model: &str, prompt: &str, _options: ChatOptions) -> Result<String> {
            if prompt.contains("identify who is speaking") {
                return Ok("[]".to_string());
            }
            if prompt.contains("Check this transcript segment") {
                return Ok(r#"{"score": 92, "issues": [], "needs_deep_review": false}"#.to_string());
            }
            if prompt.contains("Summarize") {
                return Ok(r#"{"summary": ["budget approved"]}"#.to_string());
            }
            if prompt.contains("Extract all votes") {
                return Ok(r#"{"votes": []}"#.to_string());
            }
            if prompt.contains("priority topics") {
                return Ok(r#"{"alerts": []}"#.to_string());
            }
            Ok(r#"{"housing_mentions": ["housing element"], "zoning_topics": [], "infrastructure": [], "sustainability": [], "council_positions": {}, "key_quotes": [], "action_items": []}"#.to_string())
        }
    }

    async fn pipeline_under_test(config: Config) -> (Pipeline, Ledger) {
        let ledger = Ledger::open_in_memory().await.unwrap();
        let pipeline = Pipeline::new(
            ledger.clone(),
            config,
            Arc::new(StubFetcher),
            Arc::new(StubExtractor),
            Arc::new(StubAsr),
            Arc::new(StubDiarizer),
            Arc::new(StubChat),
            Arc::new(AtomicBool::new(false)),
        );
        (pipeline, ledger)
    }

    #[tokio::test]
    async fn full_pipeline_carries_a_meeting_to_analyzed() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf());
        let (pipeline, ledger) = pipeline_under_test(config.clone()).await;

        pipeline.run_discovery(95, 105).await.unwrap();

        let download = pipeline.download_batch(10).await.unwrap();
        assert_eq!(download.done, 1);

        let transcribe = pipeline.transcribe_batch(3, true).await.unwrap();
        assert_eq!(transcribe.done, 1);

        let diarize = pipeline.diarize_batch(5).await.unwrap();
        assert_eq!(diarize.done, 1);

        let validate = pipeline.validate_batch(5).await.unwrap();
        assert_eq!(validate.done, 1);

        let analyze = pipeline.analyze_batch(1).await.unwrap();
        assert_eq!(analyze.done, 1);

        let meeting = ledger.get_meeting(100).await.unwrap().unwrap();
        assert_eq!(meeting.status, MeetingStatus::Analyzed);

        // The analyzed meeting carries a validation record and at least one
        // analysis row per enabled type.
        let validation = ledger.get_validation(100).await.unwrap().unwrap();
        assert!((0.0..=1.0).contains(&validation.wer_score));
        for analysis_type in AnalysisType::default_enabled() {
            assert!(
                ledger.count_analyses(100, analysis_type.as_str()).await.unwrap() >= 1,
                "no {} rows",
                analysis_type
            );
        }

        // Diarization named the speaker from pattern evidence and mapped
        // the second segment through the shared turn ID.
        let diarization = crate::diarization::load_diarization(&config, 100).unwrap();
        assert_eq!(
            diarization.speaker_mapping.get("SPK_0").map(String::as_str),
            Some("Huber")
        );
    }

    #[tokio::test]
    async fn stages_are_no_ops_when_nothing_is_pending() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf());
        let (pipeline, _ledger) = pipeline_under_test(config).await;

        let download = pipeline.download_batch(10).await.unwrap();
        assert_eq!(download.done + download.failed + download.skipped, 0);

        let analyze = pipeline.analyze_batch(5).await.unwrap();
        assert_eq!(analyze.done + analyze.failed + analyze.skipped, 0);
    }

    #[tokio::test]
    async fn status_estimates_follow_the_stage_averages() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf());
        let (pipeline, ledger) = pipeline_under_test(config).await;

        ledger
            .insert_meeting(1, "1/1/21 City Council", None, crate::types::MeetingType::CityCouncil, Some("u"), None)
            .await
            .unwrap();
        ledger
            .insert_meeting(2, "1/2/21 City Council", None, crate::types::MeetingType::CityCouncil, Some("u"), None)
            .await
            .unwrap();
        ledger.update_status(2, MeetingStatus::Downloaded).await.unwrap();

        let status = pipeline.status().await.unwrap();
        assert_eq!(status.pending_download, 1);
        assert_eq!(status.pending_transcribe, 1);
        assert_eq!(
            status.estimated_minutes_remaining,
            EST_DOWNLOAD_MINUTES + EST_TRANSCRIBE_MINUTES
        );
    }

    #[tokio::test]
    async fn pending_diarization_requires_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf());
        let (pipeline, ledger) = pipeline_under_test(config.clone()).await;

        ledger
            .insert_meeting(10, "1/1/21 City Council", None, crate::types::MeetingType::CityCouncil, Some("u"), None)
            .await
            .unwrap();
        ledger.update_status(10, MeetingStatus::Transcribed).await.unwrap();

        ledger
            .insert_meeting(11, "1/2/21 City Council", None, crate::types::MeetingType::CityCouncil, Some("u"), None)
            .await
            .unwrap();
        ledger.update_status(11, MeetingStatus::Analyzed).await.unwrap();

        // Meeting 11 already has an artifact
        std::fs::create_dir_all(&config.transcript_dir).unwrap();
        std::fs::write(config.diarization_path(11), "{}").unwrap();

        // Still-downloading meetings are not eligible
        ledger
            .insert_meeting(12, "1/3/21 City Council", None, crate::types::MeetingType::CityCouncil, Some("u"), None)
            .await
            .unwrap();

        let pending = pipeline.pending_diarization().await.unwrap();
        let ids: Vec<i64> = pending.iter().map(|m| m.clip_id).collect();
        assert_eq!(ids, vec![10]);
    }
}
