/*
 * Council Analyzer CLI - Shared Test Fixtures
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

use std::path::PathBuf;

use crate::config::Config;
use crate::types::AnalysisType;

/// A config rooted at `base` with default thresholds, for tests.
pub fn test_config(base: PathBuf) -> Config {
    Config {
        data_dir: base.clone(),
        audio_dir: base.join("audio"),
        transcript_dir: base.join("transcripts"),
        analysis_dir: base.join("analysis"),
        db_path: base.join("meetings.db"),
        log_dir: base.join("logs"),
        clip_url_template: "https://example.test/clip/{clip_id}".to_string(),
        clip_id_start: 900,
        clip_id_end: 1300,
        discovery_concurrency: 5,
        asr_base_url: "http://localhost:8090".to_string(),
        whisper_model_primary: "large-v3".to_string(),
        whisper_model_secondary: "medium".to_string(),
        ollama_base_url: "http://localhost:11434".to_string(),
        ollama_model_analysis: "qwen2.5vl:72b".to_string(),
        ollama_model_validation_fast: "mistral:7b-instruct".to_string(),
        ollama_model_validation_deep: "deepseek-r1:70b".to_string(),
        diarizer_base_url: "https://api.pyannote.ai/v1".to_string(),
        diarizer_api_token: None,
        validation_coherence_threshold: 80,
        validation_wer_threshold: 0.15,
        validation_tier1_segment_limit: 50,
        validation_tier2_segment_limit: 20,
        download_timeout_sec: 3600,
        transcribe_timeout_sec: 7200,
        analysis_timeout_sec: 1800,
        http_timeout_sec: 30,
        diarize_max_retries: 3,
        diarize_retry_delay_sec: 60,
        diarize_poll_interval_sec: 300,
        enabled_analysis_types: AnalysisType::default_enabled(),
    }
}
