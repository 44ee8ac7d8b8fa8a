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
use std::env;
use std::path::PathBuf;

use crate::types::AnalysisType;

/// Central configuration for the pipeline, threaded by value through the
/// stage constructors. No hidden globals.
#[derive(Debug, Clone)]
pub struct Config {
    // Data layout
    pub data_dir: PathBuf,
    pub audio_dir: PathBuf,
    pub transcript_dir: PathBuf,
    pub analysis_dir: PathBuf,
    pub db_path: PathBuf,
    pub log_dir: PathBuf,

    // Upstream clip pages
    pub clip_url_template: String,
    pub clip_id_start: i64,
    pub clip_id_end: i64,
    pub discovery_concurrency: usize,

    // ASR engines (dual transcription)
    pub asr_base_url: String,
    pub whisper_model_primary: String,
    pub whisper_model_secondary: String,

    // LLM endpoints
    pub ollama_base_url: String,
    pub ollama_model_analysis: String,
    pub ollama_model_validation_fast: String,
    pub ollama_model_validation_deep: String,

    // Hosted diarizer (optional)
    pub diarizer_base_url: String,
    pub diarizer_api_token: Option<String>,

    // Validation thresholds
    pub validation_coherence_threshold: i64,
    pub validation_wer_threshold: f64,
    pub validation_tier1_segment_limit: usize,
    pub validation_tier2_segment_limit: usize,

    // Timeouts (seconds)
    pub download_timeout_sec: u64,
    pub transcribe_timeout_sec: u64,
    pub analysis_timeout_sec: u64,
    pub http_timeout_sec: u64,

    // Continuous-mode supervision
    pub diarize_max_retries: u32,
    pub diarize_retry_delay_sec: u64,
    pub diarize_poll_interval_sec: u64,

    // Analysis
    pub enabled_analysis_types: Vec<AnalysisType>,
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file if it exists
        dotenv::dotenv().ok();

        let data_dir = env::var("COUNCIL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".council-analyzer")
                    .join("data")
            });

        let audio_dir = env::var("COUNCIL_AUDIO_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("audio"));

        let transcript_dir = env::var("COUNCIL_TRANSCRIPT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("transcripts"));

        let analysis_dir = env::var("COUNCIL_ANALYSIS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("analysis"));

        let db_path = env::var("COUNCIL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("meetings.db"));

        let log_dir = env::var("COUNCIL_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("logs"));

        let clip_url_template = env::var("COUNCIL_CLIP_URL_TEMPLATE").unwrap_or_else(|_| {
            "https://chico-ca.granicus.com/player/clip/{clip_id}".to_string()
        });

        let clip_id_start = env::var("COUNCIL_CLIP_ID_START")
            .unwrap_or_else(|_| "900".to_string())
            .parse::<i64>()
            .unwrap_or(900);

        let clip_id_end = env::var("COUNCIL_CLIP_ID_END")
            .unwrap_or_else(|_| "1300".to_string())
            .parse::<i64>()
            .unwrap_or(1300);

        let discovery_concurrency = env::var("COUNCIL_DISCOVERY_CONCURRENCY")
            .unwrap_or_else(|_| "5".to_string())
            .parse::<usize>()
            .unwrap_or(5)
            .max(1);

        let asr_base_url = env::var("COUNCIL_ASR_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:8090".to_string());

        let whisper_model_primary = env::var("COUNCIL_WHISPER_MODEL_PRIMARY")
            .unwrap_or_else(|_| "large-v3".to_string());

        let whisper_model_secondary = env::var("COUNCIL_WHISPER_MODEL_SECONDARY")
            .unwrap_or_else(|_| "medium".to_string());

        let ollama_base_url = env::var("OLLAMA_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:11434".to_string());

        let ollama_model_analysis = env::var("COUNCIL_OLLAMA_MODEL_ANALYSIS")
            .unwrap_or_else(|_| "qwen2.5vl:72b".to_string());

        let ollama_model_validation_fast = env::var("COUNCIL_OLLAMA_MODEL_VALIDATION_FAST")
            .unwrap_or_else(|_| "mistral:7b-instruct".to_string());

        let ollama_model_validation_deep = env::var("COUNCIL_OLLAMA_MODEL_VALIDATION_DEEP")
            .unwrap_or_else(|_| "deepseek-r1:70b".to_string());

        let diarizer_base_url = env::var("COUNCIL_DIARIZER_BASE_URL")
            .unwrap_or_else(|_| "https://api.pyannote.ai/v1".to_string());

        let diarizer_api_token = env::var("DIARIZER_API_TOKEN")
            .ok()
            .or_else(|| env::var("PYANNOTE_API_TOKEN").ok())
            .filter(|token| !token.is_empty());

        let validation_coherence_threshold = env::var("COUNCIL_COHERENCE_THRESHOLD")
            .unwrap_or_else(|_| "80".to_string())
            .parse::<i64>()
            .unwrap_or(80);

        let validation_wer_threshold = env::var("COUNCIL_WER_THRESHOLD")
            .unwrap_or_else(|_| "0.15".to_string())
            .parse::<f64>()
            .unwrap_or(0.15);

        let validation_tier1_segment_limit = env::var("COUNCIL_TIER1_SEGMENT_LIMIT")
            .unwrap_or_else(|_| "50".to_string())
            .parse::<usize>()
            .unwrap_or(50);

        let validation_tier2_segment_limit = env::var("COUNCIL_TIER2_SEGMENT_LIMIT")
            .unwrap_or_else(|_| "20".to_string())
            .parse::<usize>()
            .unwrap_or(20);

        let download_timeout_sec = env::var("COUNCIL_DOWNLOAD_TIMEOUT_SEC")
            .unwrap_or_else(|_| "3600".to_string())
            .parse::<u64>()
            .unwrap_or(3600);

        let transcribe_timeout_sec = env::var("COUNCIL_TRANSCRIBE_TIMEOUT_SEC")
            .unwrap_or_else(|_| "7200".to_string())
            .parse::<u64>()
            .unwrap_or(7200);

        let analysis_timeout_sec = env::var("COUNCIL_ANALYSIS_TIMEOUT_SEC")
            .unwrap_or_else(|_| "1800".to_string())
            .parse::<u64>()
            .unwrap_or(1800);

        let http_timeout_sec = env::var("COUNCIL_HTTP_TIMEOUT_SEC")
            .unwrap_or_else(|_| "30".to_string())
            .parse::<u64>()
            .unwrap_or(30);

        let diarize_max_retries = env::var("COUNCIL_DIARIZE_MAX_RETRIES")
            .unwrap_or_else(|_| "3".to_string())
            .parse::<u32>()
            .unwrap_or(3);

        let diarize_retry_delay_sec = env::var("COUNCIL_DIARIZE_RETRY_DELAY_SEC")
            .unwrap_or_else(|_| "60".to_string())
            .parse::<u64>()
            .unwrap_or(60);

        let diarize_poll_interval_sec = env::var("COUNCIL_DIARIZE_POLL_INTERVAL_SEC")
            .unwrap_or_else(|_| "300".to_string())
            .parse::<u64>()
            .unwrap_or(300);

        let enabled_analysis_types = match env::var("COUNCIL_ANALYSIS_TYPES") {
            Ok(raw) if !raw.trim().is_empty() => {
                let mut types = Vec::new();
                for token in raw.split(',') {
                    let parsed = token
                        .trim()
                        .parse::<AnalysisType>()
                        .map_err(|e| anyhow::anyhow!(e))
                        .context("COUNCIL_ANALYSIS_TYPES contains an unknown analysis type")?;
                    if !types.contains(&parsed) {
                        types.push(parsed);
                    }
                }
                types
            }
            _ => AnalysisType::default_enabled(),
        };

        Ok(Config {
            data_dir,
            audio_dir,
            transcript_dir,
            analysis_dir,
            db_path,
            log_dir,
            clip_url_template,
            clip_id_start,
            clip_id_end,
            discovery_concurrency,
            asr_base_url,
            whisper_model_primary,
            whisper_model_secondary,
            ollama_base_url,
            ollama_model_analysis,
            ollama_model_validation_fast,
            ollama_model_validation_deep,
            diarizer_base_url,
            diarizer_api_token,
            validation_coherence_threshold,
            validation_wer_threshold,
            validation_tier1_segment_limit,
            validation_tier2_segment_limit,
            download_timeout_sec,
            transcribe_timeout_sec,
            analysis_timeout_sec,
            http_timeout_sec,
            diarize_max_retries,
            diarize_retry_delay_sec,
            diarize_poll_interval_sec,
            enabled_analysis_types,
        })
    }

    /// Create all required data directories.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            &self.data_dir,
            &self.audio_dir,
            &self.transcript_dir,
            &self.analysis_dir,
            &self.log_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn clip_url(&self, clip_id: i64) -> String {
        self.clip_url_template
            .replace("{clip_id}", &clip_id.to_string())
    }

    pub fn audio_path(&self, clip_id: i64) -> PathBuf {
        self.audio_dir.join(format!("{}.mp3", clip_id))
    }

    pub fn transcript_path(&self, clip_id: i64, model: &str) -> PathBuf {
        let model_suffix = model.replace('/', "_").replace('-', "_");
        self.transcript_dir
            .join(format!("{}_{}.json", clip_id, model_suffix))
    }

    pub fn diarization_path(&self, clip_id: i64) -> PathBuf {
        self.transcript_dir
            .join(format!("{}_diarization.json", clip_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_support::test_config;

    #[test]
    fn clip_url_substitutes_the_id() {
        let config = test_config(PathBuf::from("/tmp/council"));
        assert_eq!(config.clip_url(1042), "https://example.test/clip/1042");
    }

    #[test]
    fn transcript_path_normalizes_model_names() {
        let config = test_config(PathBuf::from("/tmp/council"));
        let path = config.transcript_path(1042, "large-v3");
        assert!(path.ends_with("1042_large_v3.json"));
    }

    #[test]
    fn diarization_path_uses_the_fixed_suffix() {
        let config = test_config(PathBuf::from("/tmp/council"));
        assert!(config.diarization_path(7).ends_with("7_diarization.json"));
    }
}
