/*
 * Council Analyzer CLI - Audio Downloader
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
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::{sleep, timeout};

use crate::capabilities::{AudioExtractor, AudioProbe};
use crate::config::Config;
use crate::error::PipelineError;
use crate::ledger::Ledger;
use crate::types::{EventStatus, MeetingStatus, Stage, StageOutcome};

/// Stream extractor backed by the system ffmpeg/ffprobe binaries.
pub struct FfmpegExtractor {
    download_timeout: Duration,
}

impl FfmpegExtractor {
    pub fn new(config: &Config) -> Self {
        Self {
            download_timeout: Duration::from_secs(config.download_timeout_sec.max(1)),
        }
    }
}

#[async_trait]
impl AudioExtractor for FfmpegExtractor {
    async fn extract_audio(&self, stream_url: &str, output: &Path) -> Result<()> {
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create audio output directory")?;
        }

        let mut cmd = Command::new("ffmpeg");
        cmd.args([
            "-y", // Overwrite output
            "-i",
            stream_url,
            "-vn", // No video
            "-acodec",
            "libmp3lame",
            "-q:a",
            "2", // ~190 kbps VBR
            "-map",
            "0:a:0", // First audio stream
        ])
        .arg(output)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

        let mut child = cmd.spawn().context("Failed to start ffmpeg")?;

        // Drain stderr in the background so a chatty ffmpeg cannot stall on
        // a full pipe buffer.
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buffer = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buffer).await;
            }
            buffer
        });

        tokio::select! {
            status = child.wait() => {
                let status = status.context("Failed to wait for ffmpeg")?;
                let stderr_output = stderr_task.await.unwrap_or_default();

                if !status.success() {
                    let tail: String = stderr_output
                        .chars()
                        .rev()
                        .take(500)
                        .collect::<Vec<_>>()
                        .into_iter()
                        .rev()
                        .collect();
                    return Err(PipelineError::TransientExternal(format!(
                        "ffmpeg error: {}",
                        tail.trim()
                    ))
                    .into());
                }
                Ok(())
            }
            _ = sleep(self.download_timeout) => {
                let _ = child.kill().await;
                stderr_task.abort();
                Err(PipelineError::TransientExternal("download timeout".to_string()).into())
            }
        }
    }

    async fn probe_audio(&self, path: &Path) -> Result<Option<AudioProbe>> {
        if !path.exists() {
            return Ok(None);
        }

        let mut cmd = Command::new("ffprobe");
        cmd.args(["-v", "quiet", "-print_format", "json", "-show_format"])
            .arg(path)
            .stdin(Stdio::null());

        let output = timeout(Duration::from_secs(30), cmd.output())
            .await
            .context("ffprobe timeout")?
            .context("Failed to run ffprobe")?;

        if !output.status.success() {
            return Ok(None);
        }

        let parsed: serde_json::Value =
            serde_json::from_slice(&output.stdout).context("Failed to parse ffprobe output")?;

        let Some(format) = parsed.get("format") else {
            return Ok(None);
        };

        let duration_seconds = format
            .get("duration")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);

        let size_bytes = format
            .get("size")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);

        let format_name = format
            .get("format_name")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        Ok(Some(AudioProbe {
            duration_seconds,
            size_bytes,
            format: format_name,
        }))
    }
}

/// Download stage worker: materializes the stream as a local audio file,
/// verifies it, and flips the status only after the artifact is sound.
pub struct Downloader {
    ledger: Ledger,
    extractor: Arc<dyn AudioExtractor>,
    config: Config,
}

impl Downloader {
    pub fn new(ledger: Ledger, extractor: Arc<dyn AudioExtractor>, config: Config) -> Self {
        Self {
            ledger,
            extractor,
            config,
        }
    }

    /// Download a single meeting's audio. Absorbs all non-fatal errors.
    pub async fn download_meeting(&self, clip_id: i64) -> Result<StageOutcome> {
        let Some(meeting) = self.ledger.get_meeting(clip_id).await? else {
            tracing::error!("Meeting {} not found", clip_id);
            self.ledger
                .log_event(clip_id, Stage::Download, EventStatus::Failed, "Meeting not found")
                .await?;
            return Ok(StageOutcome::Failed);
        };

        match meeting.status {
            MeetingStatus::Discovered => {
                if !self
                    .ledger
                    .try_advance(clip_id, MeetingStatus::Discovered, MeetingStatus::Downloading)
                    .await?
                {
                    // Another worker claimed it between read and CAS.
                    return Ok(StageOutcome::Skipped);
                }
            }
            // A crash mid-download leaves this status behind; resume.
            MeetingStatus::Downloading => {}
            _ => return Ok(StageOutcome::Skipped),
        }

        let Some(video_url) = meeting.video_url.clone() else {
            tracing::warn!("Meeting {} has no stream URL", clip_id);
            self.ledger.update_status(clip_id, MeetingStatus::Failed).await?;
            self.ledger
                .log_event(clip_id, Stage::Download, EventStatus::Failed, "No stream URL available")
                .await?;
            return Ok(StageOutcome::Skipped);
        };

        let output_path = self.config.audio_path(clip_id);

        // Resume primitive: a clean existing artifact completes the stage
        // without re-fetching.
        if let Some(probe) = self.extractor.probe_audio(&output_path).await? {
            if probe.duration_seconds > 0.0 && probe.size_bytes > 0 {
                tracing::info!("Meeting {} already downloaded, advancing", clip_id);
                self.ledger.update_status(clip_id, MeetingStatus::Downloaded).await?;
                self.ledger
                    .log_event(
                        clip_id,
                        Stage::Download,
                        EventStatus::Completed,
                        &format!("Existing audio verified: {}", output_path.display()),
                    )
                    .await?;
                return Ok(StageOutcome::Completed);
            }
        }

        self.ledger
            .log_event(
                clip_id,
                Stage::Download,
                EventStatus::Started,
                &format!("Starting download: {}", video_url),
            )
            .await?;

        match self.extractor.extract_audio(&video_url, &output_path).await {
            Ok(()) => {}
            Err(e) => {
                tracing::error!("Download failed for {}: {}", clip_id, e);
                self.ledger.update_status(clip_id, MeetingStatus::Failed).await?;
                self.ledger
                    .log_event(clip_id, Stage::Download, EventStatus::Failed, &e.to_string())
                    .await?;
                return Ok(StageOutcome::Failed);
            }
        }

        // Probe before the status flip; an empty artifact is a failure.
        let probe = self.extractor.probe_audio(&output_path).await?;
        match probe {
            Some(probe) if probe.duration_seconds > 0.0 && probe.size_bytes > 0 => {
                self.ledger.update_status(clip_id, MeetingStatus::Downloaded).await?;
                self.ledger
                    .log_event(
                        clip_id,
                        Stage::Download,
                        EventStatus::Completed,
                        &format!(
                            "Downloaded {:.0}s, {} bytes",
                            probe.duration_seconds, probe.size_bytes
                        ),
                    )
                    .await?;
                tracing::info!(
                    "Downloaded {}: {} ({}), {:.1}MB",
                    clip_id,
                    crate::utils::format_duration(probe.duration_seconds as u64),
                    probe.format.as_deref().unwrap_or("unknown format"),
                    probe.size_bytes as f64 / 1024.0 / 1024.0
                );
                Ok(StageOutcome::Completed)
            }
            _ => {
                self.ledger.update_status(clip_id, MeetingStatus::Failed).await?;
                self.ledger
                    .log_event(
                        clip_id,
                        Stage::Download,
                        EventStatus::Failed,
                        "Output file empty or missing",
                    )
                    .await?;
                Ok(StageOutcome::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::Mutex;

    use crate::test_support::test_config;
    use crate::types::MeetingType;

    /// Extractor that records invocations and simulates a growing artifact.
    struct FakeExtractor {
        extract_calls: Mutex<usize>,
        probe_ok_after_extract: bool,
    }

    #[async_trait]
    impl AudioExtractor for FakeExtractor {
        async fn extract_audio(&self, _stream_url: &str, output: &Path) -> Result<()> {
            *self.extract_calls.lock().unwrap() += 1;
            std::fs::create_dir_all(output.parent().unwrap()).unwrap();
            std::fs::write(output, b"mp3 bytes").unwrap();
            Ok(())
        }

        async fn probe_audio(&self, path: &Path) -> Result<Option<AudioProbe>> {
            if !path.exists() {
                return Ok(None);
            }
            let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            if size == 0 {
                // Zero-byte leftovers from an interrupted download probe as
                // unusable.
                return Ok(None);
            }
            if !self.probe_ok_after_extract {
                return Ok(None);
            }
            Ok(Some(AudioProbe {
                duration_seconds: 5400.0,
                size_bytes: size,
                format: Some("mp3".to_string()),
            }))
        }
    }

    async fn ledger_with_meeting(status: MeetingStatus) -> Ledger {
        let ledger = Ledger::open_in_memory().await.unwrap();
        ledger
            .insert_meeting(
                500,
                "6/1/21 City Council",
                NaiveDate::from_ymd_opt(2021, 6, 1),
                MeetingType::CityCouncil,
                Some("https://example.test/stream/500.m3u8"),
                None,
            )
            .await
            .unwrap();
        if status != MeetingStatus::Discovered {
            ledger.update_status(500, status).await.unwrap();
        }
        ledger
    }

    #[tokio::test]
    async fn interrupted_download_with_empty_file_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf());
        let ledger = ledger_with_meeting(MeetingStatus::Downloading).await;

        // Zero-byte leftover from the interrupted run
        std::fs::create_dir_all(&config.audio_dir).unwrap();
        std::fs::write(config.audio_path(500), b"").unwrap();

        let extractor = Arc::new(FakeExtractor {
            extract_calls: Mutex::new(0),
            probe_ok_after_extract: true,
        });
        let downloader = Downloader::new(ledger.clone(), extractor.clone(), config);

        let outcome = downloader.download_meeting(500).await.unwrap();
        assert_eq!(outcome, StageOutcome::Completed);
        assert_eq!(*extractor.extract_calls.lock().unwrap(), 1);

        let meeting = ledger.get_meeting(500).await.unwrap().unwrap();
        assert_eq!(meeting.status, MeetingStatus::Downloaded);
    }

    #[tokio::test]
    async fn clean_existing_artifact_advances_without_refetch() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf());
        let ledger = ledger_with_meeting(MeetingStatus::Discovered).await;

        std::fs::create_dir_all(&config.audio_dir).unwrap();
        std::fs::write(config.audio_path(500), b"already here").unwrap();

        let extractor = Arc::new(FakeExtractor {
            extract_calls: Mutex::new(0),
            probe_ok_after_extract: true,
        });
        let downloader = Downloader::new(ledger.clone(), extractor.clone(), config);

        let outcome = downloader.download_meeting(500).await.unwrap();
        assert_eq!(outcome, StageOutcome::Completed);
        assert_eq!(*extractor.extract_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_stream_url_fails_the_meeting() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf());
        let ledger = Ledger::open_in_memory().await.unwrap();
        ledger
            .insert_meeting(501, "6/2/21 City Council", None, MeetingType::CityCouncil, None, None)
            .await
            .unwrap();

        let extractor = Arc::new(FakeExtractor {
            extract_calls: Mutex::new(0),
            probe_ok_after_extract: true,
        });
        let downloader = Downloader::new(ledger.clone(), extractor, config);

        let outcome = downloader.download_meeting(501).await.unwrap();
        assert_eq!(outcome, StageOutcome::Skipped);

        let meeting = ledger.get_meeting(501).await.unwrap().unwrap();
        assert_eq!(meeting.status, MeetingStatus::Failed);
        assert_eq!(ledger.retry_count(501, Stage::Download).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn meetings_past_the_gate_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf());
        let ledger = ledger_with_meeting(MeetingStatus::Transcribed).await;

        let extractor = Arc::new(FakeExtractor {
            extract_calls: Mutex::new(0),
            probe_ok_after_extract: true,
        });
        let downloader = Downloader::new(ledger.clone(), extractor.clone(), config);

        let outcome = downloader.download_meeting(500).await.unwrap();
        assert_eq!(outcome, StageOutcome::Skipped);
        assert_eq!(*extractor.extract_calls.lock().unwrap(), 0);

        let meeting = ledger.get_meeting(500).await.unwrap().unwrap();
        assert_eq!(meeting.status, MeetingStatus::Transcribed);
    }
}
