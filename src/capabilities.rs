/*
 * Council Analyzer CLI - External Capability Seams
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
use async_trait::async_trait;
use std::path::Path;

use crate::types::TranscriptFile;

/// Fetches one upstream clip page by ID.
///
/// `Ok(None)` means the clip does not exist (HTTP 404) and the candidate is
/// silently skipped. Transient errors surface as `Err` and are handled by
/// the discovery pass (warn + skip, no retry).
#[async_trait]
pub trait ClipFetcher: Send + Sync {
    async fn fetch_clip_page(&self, clip_id: i64) -> Result<Option<String>>;
}

/// Probe result for a materialized audio file.
#[derive(Debug, Clone)]
pub struct AudioProbe {
    pub duration_seconds: f64,
    pub size_bytes: u64,
    pub format: Option<String>,
}

/// Reads a stream manifest and writes a local audio file, then verifies it.
#[async_trait]
pub trait AudioExtractor: Send + Sync {
    /// Extract the audio track of `stream_url` into `output`.
    async fn extract_audio(&self, stream_url: &str, output: &Path) -> Result<()>;

    /// Probe an audio file. `Ok(None)` means the file is missing or not a
    /// decodable audio container.
    async fn probe_audio(&self, path: &Path) -> Result<Option<AudioProbe>>;
}

/// A speech-to-text engine invocation. The same trait serves both the
/// primary and the secondary engine; the model identifier selects which.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &Path, model: &str) -> Result<TranscriptFile>;
}

/// A contiguous interval attributed to one opaque speaker ID.
#[derive(Debug, Clone)]
pub struct SpeakerTurn {
    pub start: f64,
    pub end: f64,
    pub speaker_id: String,
}

/// Produces speaker turns for an audio file. An unavailable diarizer
/// returns an empty list; name identification still runs downstream.
#[async_trait]
pub trait Diarizer: Send + Sync {
    async fn diarize(&self, audio: &Path) -> Result<Vec<SpeakerTurn>>;
    fn is_available(&self) -> bool;
}

/// Generation options passed through to the LLM endpoint.
#[derive(Debug, Clone, Copy)]
pub struct ChatOptions {
    pub temperature: f32,
    pub max_tokens: i32,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 2000,
        }
    }
}

/// A prompt/response LLM endpoint. Responses are raw text; callers extract
/// JSON themselves and degrade gracefully on parse failure.
#[async_trait]
pub trait Chat: Send + Sync {
    async fn generate(&self, model: &str, prompt: &str, options: ChatOptions) -> Result<String>;
}
