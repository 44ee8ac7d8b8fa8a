/*
 * Council Analyzer CLI - Speaker Diarization
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
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::capabilities::{Chat, ChatOptions, Diarizer, SpeakerTurn};
use crate::config::Config;
use crate::ledger::Ledger;
use crate::types::{
    AgendaItem, AsrSegment, DiarizationFile, EventStatus, IdentificationMethod, SpeakerSegment,
    Stage, StageOutcome, TranscriptFile, FALSE_POSITIVE_NAMES, KNOWN_COUNCIL_MEMBERS,
    KNOWN_STAFF_ROLES,
};
use crate::utils::extract_json_array;

const SEGMENT_TEXT_LIMIT: usize = 500;
const LLM_SEGMENT_LIMIT: usize = 100;
const LLM_BATCH_SIZE: usize = 10;

const PATTERN_CONFIDENCE: f32 = 0.9;
const AGENDA_CONFIDENCE: f32 = 0.7;
const MAPPED_CONFIDENCE: f32 = 0.6;

const PATTERN_WEIGHT: f64 = 2.0;
const AGENDA_WEIGHT: f64 = 1.5;
const LLM_WEIGHT: f64 = 1.0;

lazy_static! {
    // Compiled once; the honorific is consumed so the capture is the bare
    // name, keeping the stoplist check meaningful.
    static ref SPEAKER_PATTERNS: Vec<Regex> = vec![
        // Self-identification
        Regex::new(
            r"(?i)(?:this is|I'm|I am)\s+(?:council\s?(?:member|man|woman)?\s+|mayor\s+|vice mayor\s+)?([a-zA-Z]+(?:\s+[a-zA-Z]+)?)"
        )
        .unwrap(),
        // Being addressed
        Regex::new(
            r"(?i)(?:thank you|thanks),?\s+(?:council\s?(?:member|man|woman)?\s+|mayor\s+|vice mayor\s+)?([a-zA-Z]+)"
        )
        .unwrap(),
        // Motion and second language
        Regex::new(
            r"(?i)(?:I move|I second|motion by|seconded by)\s+(?:council\s?(?:member|man|woman)?\s+|mayor\s+|vice mayor\s+)?([a-zA-Z]+)"
        )
        .unwrap(),
        // Staff introductions
        Regex::new(
            r"(?i)([a-zA-Z]+(?:\s+[a-zA-Z]+)?),?\s+(?:your|our)\s+(?:city manager|city attorney|city clerk|director|chief)"
        )
        .unwrap(),
    ];
}

/// Filter a raw pattern capture: stoplist on the leading word, then roster
/// containment. Only known council members survive as candidates.
fn filter_candidate(raw: &str) -> Option<String> {
    let name = raw.trim();
    if name.len() <= 2 {
        return None;
    }

    let first_word = name.split_whitespace().next()?.to_lowercase();
    if FALSE_POSITIVE_NAMES.contains(&first_word.as_str()) {
        return None;
    }

    let name_lower = name.to_lowercase();
    KNOWN_COUNCIL_MEMBERS
        .iter()
        .find(|member| name_lower.contains(&member.to_lowercase()))
        .map(|member| member.to_string())
}

/// Regex evidence: candidate names per segment index.
pub fn identify_from_patterns(segments: &[AsrSegment]) -> BTreeMap<usize, Vec<String>> {
    let mut identifications: BTreeMap<usize, Vec<String>> = BTreeMap::new();

    for (i, segment) in segments.iter().enumerate() {
        for pattern in SPEAKER_PATTERNS.iter() {
            for caps in pattern.captures_iter(&segment.text) {
                if let Some(raw) = caps.get(1) {
                    if let Some(member) = filter_candidate(raw.as_str()) {
                        identifications.entry(i).or_default().push(member);
                    }
                }
            }
        }
    }

    identifications
}

/// Agenda evidence: the presenter of the item whose window contains the
/// segment start.
pub fn identify_from_agenda(
    segments: &[AsrSegment],
    agenda_items: &[AgendaItem],
) -> BTreeMap<usize, String> {
    let mut identifications = BTreeMap::new();

    for (i, segment) in segments.iter().enumerate() {
        for item in agenda_items {
            let in_window = item.start_seconds <= segment.start
                && item.end_seconds.map_or(true, |end| end >= segment.start);
            if in_window {
                if let Some(presenter) = &item.presenter {
                    identifications.insert(i, presenter.clone());
                }
                break;
            }
        }
    }

    identifications
}

/// One LLM attribution for a segment.
#[derive(Debug, Clone)]
pub struct LlmIdentification {
    pub segment_index: usize,
    pub speaker: String,
    pub confidence: f32,
}

const LLM_IDENTIFICATION_PROMPT: &str = "\
Analyze this city council meeting transcript and identify who is speaking in each segment.

Known Council Members: {members}
Known Staff: {staff}

Agenda Context: {agenda}

Transcript Segments:
{segments}

For each segment, identify the likely speaker based on:
1. Self-identification (\"This is Council Member X\")
2. Being addressed (\"Thank you, Mayor\")
3. Speech patterns (motions = council members, presentations = staff)
4. Context from previous/next segments

Return ONLY a valid JSON array with one object per segment:
[{\"segment_index\": 0, \"speaker\": \"Council Member Brown\", \"confidence\": 0.8}]";

/// LLM evidence: batched attribution prompts over the leading segments.
/// Failed batches are skipped with a warning.
pub async fn identify_with_llm(
    chat: &dyn Chat,
    model: &str,
    segments: &[AsrSegment],
    agenda_context: &str,
) -> Vec<LlmIdentification> {
    let mut identifications = Vec::new();
    let limited = &segments[..segments.len().min(LLM_SEGMENT_LIMIT)];

    for (batch_number, batch) in limited.chunks(LLM_BATCH_SIZE).enumerate() {
        let batch_start = batch_number * LLM_BATCH_SIZE;

        let segments_text = batch
            .iter()
            .enumerate()
            .map(|(i, segment)| {
                let preview: String = segment.text.chars().take(200).collect();
                format!("[{}] (t={:.1}s): {}", batch_start + i, segment.start, preview)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let agenda_preview: String = agenda_context.chars().take(1000).collect();
        let prompt = LLM_IDENTIFICATION_PROMPT
            .replace("{members}", &KNOWN_COUNCIL_MEMBERS.join(", "))
            .replace("{staff}", &KNOWN_STAFF_ROLES.join(", "))
            .replace("{agenda}", &agenda_preview)
            .replace("{segments}", &segments_text);

        let response = match chat
            .generate(model, &prompt, ChatOptions { temperature: 0.3, max_tokens: 1000 })
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("LLM identification batch failed: {}", e);
                continue;
            }
        };

        let Some(parsed) = extract_json_array(&response) else {
            tracing::warn!("LLM identification batch returned no JSON array");
            continue;
        };

        for entry in parsed.as_array().into_iter().flatten() {
            let Some(index) = entry.get("segment_index").and_then(|v| v.as_u64()) else {
                continue;
            };
            let Some(speaker) = entry.get("speaker").and_then(|v| v.as_str()) else {
                continue;
            };
            if speaker.trim().is_empty() {
                continue;
            }

            identifications.push(LlmIdentification {
                segment_index: index as usize,
                speaker: speaker.to_string(),
                confidence: entry
                    .get("confidence")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.5) as f32,
            });
        }
    }

    identifications
}

/// Weighted name votes for one opaque speaker ID, insertion-ordered so
/// equal-weight ties resolve to the first occurrence.
#[derive(Default)]
struct VoteTally {
    entries: Vec<(String, f64)>,
}

impl VoteTally {
    fn add(&mut self, name: &str, weight: f64) {
        if let Some(entry) = self.entries.iter_mut().find(|(n, _)| n == name) {
            entry.1 += weight;
        } else {
            self.entries.push((name.to_string(), weight));
        }
    }

    fn winner(&self) -> Option<&str> {
        let mut best: Option<(&str, f64)> = None;
        for (name, weight) in &self.entries {
            match best {
                Some((_, best_weight)) if *weight <= best_weight => {}
                _ => best = Some((name.as_str(), *weight)),
            }
        }
        best.map(|(name, _)| name)
    }
}

/// Fuse turn IDs with the three name-evidence sources.
///
/// Direct attribution priority per segment: pattern > agenda > LLM. Votes
/// accumulate per speaker ID; the majority name maps the ID, and mapped
/// names propagate to unattributed segments of the same ID.
pub fn fuse_identifications(
    clip_id: i64,
    turns: &[SpeakerTurn],
    pattern_ids: &BTreeMap<usize, Vec<String>>,
    agenda_ids: &BTreeMap<usize, String>,
    llm_ids: &[LlmIdentification],
    transcript_segments: &[AsrSegment],
) -> DiarizationFile {
    // Segments fully contained in a turn inherit its opaque speaker ID.
    let mut turn_map: BTreeMap<usize, String> = BTreeMap::new();
    for turn in turns {
        for (i, segment) in transcript_segments.iter().enumerate() {
            if segment.start >= turn.start && segment.end <= turn.end {
                turn_map.entry(i).or_insert_with(|| turn.speaker_id.clone());
            }
        }
    }

    let mut votes: BTreeMap<String, VoteTally> = BTreeMap::new();
    let mut segments = Vec::with_capacity(transcript_segments.len());

    for (i, segment) in transcript_segments.iter().enumerate() {
        let speaker_id = turn_map
            .get(&i)
            .cloned()
            .unwrap_or_else(|| format!("UNKNOWN_{}", i));

        let text: String = segment.text.chars().take(SEGMENT_TEXT_LIMIT).collect();

        let mut speaker_segment = SpeakerSegment {
            start: segment.start,
            end: segment.end,
            speaker_id: speaker_id.clone(),
            speaker_name: None,
            confidence: 0.0,
            method: None,
            text,
        };

        if let Some(names) = pattern_ids.get(&i).filter(|names| !names.is_empty()) {
            let name = names[0].clone();
            speaker_segment.speaker_name = Some(name.clone());
            speaker_segment.confidence = PATTERN_CONFIDENCE;
            speaker_segment.method = Some(IdentificationMethod::Pattern.as_str().to_string());
            votes.entry(speaker_id.clone()).or_default().add(&name, PATTERN_WEIGHT);
        } else if let Some(presenter) = agenda_ids.get(&i) {
            speaker_segment.speaker_name = Some(presenter.clone());
            speaker_segment.confidence = AGENDA_CONFIDENCE;
            speaker_segment.method = Some(IdentificationMethod::Agenda.as_str().to_string());
            votes.entry(speaker_id.clone()).or_default().add(presenter, AGENDA_WEIGHT);
        } else if let Some(llm_id) = llm_ids.iter().find(|id| id.segment_index == i) {
            speaker_segment.speaker_name = Some(llm_id.speaker.clone());
            speaker_segment.confidence = llm_id.confidence;
            speaker_segment.method = Some(IdentificationMethod::Llm.as_str().to_string());
            votes
                .entry(speaker_id.clone())
                .or_default()
                .add(&llm_id.speaker, LLM_WEIGHT);
        }

        segments.push(speaker_segment);
    }

    // Majority-vote mapping per speaker ID
    let mut speaker_mapping: BTreeMap<String, String> = BTreeMap::new();
    for (speaker_id, tally) in &votes {
        if let Some(winner) = tally.winner() {
            speaker_mapping.insert(speaker_id.clone(), winner.to_string());
        }
    }

    // Propagate mapped names to segments without direct evidence
    for segment in &mut segments {
        if segment.speaker_name.is_none() {
            if let Some(name) = speaker_mapping.get(&segment.speaker_id) {
                segment.speaker_name = Some(name.clone());
                segment.confidence = MAPPED_CONFIDENCE;
                segment.method = Some(IdentificationMethod::TurnMapped.as_str().to_string());
            }
        }
    }

    let total_speakers = segments
        .iter()
        .map(|s| s.speaker_id.as_str())
        .collect::<std::collections::BTreeSet<_>>()
        .len();
    let identified_speakers = speaker_mapping.len();

    DiarizationFile {
        clip_id,
        total_speakers,
        identified_speakers,
        speaker_mapping,
        segments,
    }
}

/// Hosted diarization service. Without a token the capability reports
/// unavailable and yields no turns; identification still proceeds from
/// transcript evidence alone.
pub struct HostedDiarizer {
    client: Client,
    base_url: String,
    api_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiarizeResponse {
    segments: Vec<DiarizeResponseSegment>,
}

#[derive(Debug, Deserialize)]
struct DiarizeResponseSegment {
    start: f64,
    end: f64,
    speaker: String,
}

impl HostedDiarizer {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.analysis_timeout_sec.max(1)))
            .build()
            .context("Failed to create HTTP client for diarizer")?;

        Ok(Self {
            client,
            base_url: config.diarizer_base_url.trim_end_matches('/').to_string(),
            api_token: config.diarizer_api_token.clone(),
        })
    }
}

#[async_trait]
impl Diarizer for HostedDiarizer {
    async fn diarize(&self, audio: &Path) -> Result<Vec<SpeakerTurn>> {
        let Some(token) = &self.api_token else {
            tracing::warn!("No diarizer token configured; proceeding without speaker turns");
            return Ok(Vec::new());
        };

        let audio_bytes = tokio::fs::read(audio)
            .await
            .with_context(|| format!("Failed to read audio file {}", audio.display()))?;

        let file_name = audio
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("audio.mp3")
            .to_string();

        let form = reqwest::multipart::Form::new().part(
            "audio",
            reqwest::multipart::Part::bytes(audio_bytes)
                .file_name(file_name)
                .mime_str("audio/mpeg")?,
        );

        let response = self
            .client
            .post(format!("{}/diarize", self.base_url))
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await
            .context("Failed to send audio to diarizer")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_else(|_| "<no body>".to_string());
            return Err(anyhow::anyhow!("diarizer error ({}): {}", status, body));
        }

        let parsed: DiarizeResponse = response
            .json()
            .await
            .context("Failed to parse diarizer response")?;

        Ok(parsed
            .segments
            .into_iter()
            .map(|segment| SpeakerTurn {
                start: segment.start,
                end: segment.end,
                speaker_id: segment.speaker,
            })
            .collect())
    }

    fn is_available(&self) -> bool {
        self.api_token.is_some()
    }
}

/// Diarization stage worker. Status-orthogonal: eligibility is the absence
/// of the diarization artifact, and failures are retryable up to the
/// supervisor's limit.
pub struct DiarizationWorker {
    ledger: Ledger,
    diarizer: Arc<dyn Diarizer>,
    chat: Arc<dyn Chat>,
    config: Config,
}

impl DiarizationWorker {
    pub fn new(
        ledger: Ledger,
        diarizer: Arc<dyn Diarizer>,
        chat: Arc<dyn Chat>,
        config: Config,
    ) -> Self {
        Self {
            ledger,
            diarizer,
            chat,
            config,
        }
    }

    /// Diarize one meeting and write the artifact.
    pub async fn diarize_meeting(&self, clip_id: i64) -> Result<StageOutcome> {
        let Some(meeting) = self.ledger.get_meeting(clip_id).await? else {
            tracing::error!("Meeting {} not found", clip_id);
            self.ledger
                .log_event(clip_id, Stage::Diarize, EventStatus::Failed, "Meeting not found")
                .await?;
            return Ok(StageOutcome::Failed);
        };

        let audio_path = self.config.audio_path(clip_id);
        let transcript_path = self
            .config
            .transcript_path(clip_id, &self.config.whisper_model_primary);

        if !audio_path.exists() {
            self.ledger
                .log_event(clip_id, Stage::Diarize, EventStatus::Failed, "Audio file not found")
                .await?;
            return Ok(StageOutcome::Failed);
        }

        let transcript: TranscriptFile = match std::fs::read_to_string(&transcript_path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
        {
            Some(transcript) => transcript,
            None => {
                self.ledger
                    .log_event(
                        clip_id,
                        Stage::Diarize,
                        EventStatus::Failed,
                        "Primary transcript artifact missing",
                    )
                    .await?;
                return Ok(StageOutcome::Failed);
            }
        };

        tracing::info!("Diarizing meeting {}: {}", clip_id, meeting.title);
        self.ledger
            .log_event(clip_id, Stage::Diarize, EventStatus::Started, "Starting speaker diarization")
            .await?;

        if !self.diarizer.is_available() {
            tracing::info!(
                "Diarizer unavailable for {}; identification runs from transcript evidence only",
                clip_id
            );
        }

        // Turn production; a configured diarizer that errors is a
        // retryable failure.
        let turns = match self.diarizer.diarize(&audio_path).await {
            Ok(turns) => turns,
            Err(e) => {
                tracing::error!("Diarization error for {}: {}", clip_id, e);
                self.ledger
                    .log_event(clip_id, Stage::Diarize, EventStatus::Failed, &e.to_string())
                    .await?;
                return Ok(StageOutcome::Failed);
            }
        };

        let segments = &transcript.segments;

        let pattern_ids = identify_from_patterns(segments);
        tracing::info!(
            "Meeting {}: {} pattern matches",
            clip_id,
            pattern_ids.values().map(|v| v.len()).sum::<usize>()
        );

        let agenda_items = self.ledger.get_agenda_items(clip_id).await?;
        let agenda_ids = identify_from_agenda(segments, &agenda_items);
        tracing::info!(
            "Meeting {}: {} segments matched to agenda presenters",
            clip_id,
            agenda_ids.len()
        );

        let agenda_context = agenda_items
            .iter()
            .take(10)
            .map(|item| format!("- {}", item.title))
            .collect::<Vec<_>>()
            .join("\n");
        let llm_ids = identify_with_llm(
            self.chat.as_ref(),
            &self.config.ollama_model_validation_fast,
            segments,
            &agenda_context,
        )
        .await;
        tracing::info!("Meeting {}: LLM assigned {} speakers", clip_id, llm_ids.len());

        let result =
            fuse_identifications(clip_id, &turns, &pattern_ids, &agenda_ids, &llm_ids, segments);

        let output_path = self.config.diarization_path(clip_id);
        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create transcript directory")?;
        }
        let json = serde_json::to_string_pretty(&result)
            .context("Failed to serialize diarization result")?;
        if let Err(e) = std::fs::write(&output_path, json) {
            self.ledger
                .log_event(clip_id, Stage::Diarize, EventStatus::Failed, &e.to_string())
                .await?;
            return Ok(StageOutcome::Failed);
        }

        self.ledger
            .log_event(
                clip_id,
                Stage::Diarize,
                EventStatus::Completed,
                &format!(
                    "Identified {}/{} speakers",
                    result.identified_speakers, result.total_speakers
                ),
            )
            .await?;

        tracing::info!(
            "Diarization complete for {}: {}/{} speakers identified",
            clip_id,
            result.identified_speakers,
            result.total_speakers
        );

        Ok(StageOutcome::Completed)
    }
}

/// Load a previously written diarization artifact, if present.
pub fn load_diarization(config: &Config, clip_id: i64) -> Option<DiarizationFile> {
    let path = config.diarization_path(clip_id);
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(file) => Some(file),
        Err(e) => {
            tracing::warn!("Could not load diarization for {}: {}", clip_id, e);
            None
        }
    }
}
