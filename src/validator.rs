/*
 * Council Analyzer CLI - Transcript Validation
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
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use crate::capabilities::{Chat, ChatOptions};
use crate::config::Config;
use crate::error::PipelineError;
use crate::ledger::Ledger;
use crate::types::{
    AgendaItem, DivergentSegment, EventStatus, MeetingStatus, Stage, StageOutcome, Tier1Score,
    Tier2Score, TranscriptFile, ValidationRecord, DOMAIN_TERMS, KNOWN_COUNCIL_MEMBERS,
};
use crate::utils::extract_json_object;

const TIER1_TEXT_LIMIT: usize = 2000;
const TIER2_TEXT_LIMIT: usize = 1500;

const FAST_VALIDATION_PROMPT: &str = "\
Check this transcript segment for errors. Return ONLY valid JSON, no other text.

Agenda: {agenda_title}
Text: {segment_text}

Known council members: {members}
Known local terms: {terms}

Return this exact JSON format:
{\"score\": 85, \"issues\": [\"example issue\"], \"needs_deep_review\": false}";

const DEEP_VALIDATION_PROMPT: &str = "\
You are validating a city council meeting transcript. Think through potential errors carefully.

Agenda Item: {agenda_title}
Transcript Segment: {segment_text}

Engine Comparison:
- Primary version: {primary_text}
- Secondary version: {secondary_text}

Known council members: {members}
Known local terms: {terms}

Analyze:
1. Which transcription is more accurate for proper nouns?
2. Are there nonsense words or repeated phrases?
3. Does the discussion match the agenda topic?
4. Are there obvious transcription errors?

Return ONLY valid JSON:
{\"coherence_score\": 85, \"preferred_transcription\": \"primary\", \"issues\": [\"list issues\"], \"corrections\": {\"wrong\": \"right\"}, \"needs_human_review\": false}";

/// Word-level error rate between two texts, in `[0, 1]`.
///
/// Bytewise-identical texts score 0; so do texts identical after
/// lowercasing and trimming. If exactly one side is empty the score is 1.
pub fn word_error_rate(reference: &str, hypothesis: &str) -> f64 {
    let reference = reference.trim().to_lowercase();
    let hypothesis = hypothesis.trim().to_lowercase();

    if reference == hypothesis {
        return 0.0;
    }
    if reference.is_empty() || hypothesis.is_empty() {
        return 1.0;
    }

    let reference_words: Vec<&str> = reference.split_whitespace().collect();
    let hypothesis_words: Vec<&str> = hypothesis.split_whitespace().collect();

    let distance = levenshtein_words(&reference_words, &hypothesis_words);
    (distance as f64 / reference_words.len() as f64).min(1.0)
}

/// Word-level Levenshtein distance with a rolling two-row table.
fn levenshtein_words(reference: &[&str], hypothesis: &[&str]) -> usize {
    if reference.is_empty() {
        return hypothesis.len();
    }
    if hypothesis.is_empty() {
        return reference.len();
    }

    let mut previous: Vec<usize> = (0..=hypothesis.len()).collect();
    let mut current = vec![0usize; hypothesis.len() + 1];

    for (i, ref_word) in reference.iter().enumerate() {
        current[0] = i + 1;
        for (j, hyp_word) in hypothesis.iter().enumerate() {
            let substitution_cost = if ref_word == hyp_word { 0 } else { 1 };
            current[j + 1] = (previous[j] + substitution_cost)
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[hypothesis.len()]
}

/// Compare two engine outputs: whole-text WER plus per-segment divergence
/// against the configured threshold. Secondary text for a primary segment
/// is the concatenation of all time-overlapping secondary segments.
pub fn compare_transcripts(
    primary: &TranscriptFile,
    secondary: &TranscriptFile,
    wer_threshold: f64,
) -> (f64, Vec<DivergentSegment>) {
    let overall_wer = word_error_rate(&primary.text, &secondary.text);

    let mut divergent = Vec::new();

    for (i, p_segment) in primary.segments.iter().enumerate() {
        let mut secondary_text = String::new();
        for s_segment in &secondary.segments {
            if s_segment.start <= p_segment.end && s_segment.end >= p_segment.start {
                if !secondary_text.is_empty() {
                    secondary_text.push(' ');
                }
                secondary_text.push_str(s_segment.text.trim());
            }
        }

        let segment_wer = word_error_rate(&p_segment.text, &secondary_text);
        if segment_wer > wer_threshold {
            divergent.push(DivergentSegment {
                segment_index: i,
                start: p_segment.start,
                end: p_segment.end,
                wer: segment_wer,
                primary_text: p_segment.text.clone(),
                secondary_text,
            });
        }
    }

    (overall_wer, divergent)
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let truncated: String = text.chars().take(limit).collect();
    format!("{}...", truncated)
}

fn glossary_members() -> String {
    KNOWN_COUNCIL_MEMBERS.join(", ")
}

fn glossary_terms() -> String {
    DOMAIN_TERMS.join(", ")
}

/// The agenda item whose window contains `offset`, if any. Later matching
/// items win, mirroring agenda nesting where sub-items follow their parent.
fn agenda_title_at(agenda_items: &[AgendaItem], offset: f64) -> Option<String> {
    let mut title = None;
    for item in agenda_items {
        if item.start_seconds <= offset {
            match item.end_seconds {
                Some(end) if end < offset => {}
                _ => title = Some(item.title.clone()),
            }
        }
    }
    title
}

/// Validation stage worker: model agreement plus two-tier LLM coherence.
pub struct ValidationWorker {
    ledger: Ledger,
    chat: Arc<dyn Chat>,
    config: Config,
}

impl ValidationWorker {
    pub fn new(ledger: Ledger, chat: Arc<dyn Chat>, config: Config) -> Self {
        Self {
            ledger,
            chat,
            config,
        }
    }

    fn load_transcript_file(&self, clip_id: i64, model: &str) -> Option<TranscriptFile> {
        let path = self.config.transcript_path(clip_id, model);
        load_transcript(&path)
    }

    /// Tier-1 fast coherence check. LLM failures and unparseable responses
    /// degrade to a mid-range score with a deep-review flag; never fatal.
    async fn tier1_validate(&self, segment_text: &str, agenda_title: Option<&str>) -> Tier1Score {
        let prompt = FAST_VALIDATION_PROMPT
            .replace("{agenda_title}", agenda_title.unwrap_or("General meeting content"))
            .replace("{segment_text}", &truncate_chars(segment_text, TIER1_TEXT_LIMIT))
            .replace("{members}", &glossary_members())
            .replace("{terms}", &glossary_terms());

        let response = match self
            .chat
            .generate(
                &self.config.ollama_model_validation_fast,
                &prompt,
                ChatOptions { temperature: 0.2, max_tokens: 500 },
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Tier-1 validation call failed: {}", e);
                String::new()
            }
        };

        match extract_json_object(&response) {
            Some(value) => Tier1Score {
                score: value.get("score").and_then(|v| v.as_i64()).unwrap_or(50),
                issues: string_list(value.get("issues")),
                needs_deep_review: value
                    .get("needs_deep_review")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            },
            None => Tier1Score {
                score: 50,
                issues: vec!["Failed to parse validation response".to_string()],
                needs_deep_review: true,
            },
        }
    }

    /// Tier-2 deep coherence check over both engines' text.
    async fn tier2_validate(
        &self,
        segment_text: &str,
        agenda_title: Option<&str>,
        primary_text: &str,
        secondary_text: &str,
    ) -> Tier2Score {
        let prompt = DEEP_VALIDATION_PROMPT
            .replace("{agenda_title}", agenda_title.unwrap_or("General meeting content"))
            .replace("{segment_text}", &truncate_chars(segment_text, TIER2_TEXT_LIMIT))
            .replace("{primary_text}", &truncate_chars(primary_text, TIER2_TEXT_LIMIT))
            .replace("{secondary_text}", &truncate_chars(secondary_text, TIER2_TEXT_LIMIT))
            .replace("{members}", &glossary_members())
            .replace("{terms}", &glossary_terms());

        let response = match self
            .chat
            .generate(
                &self.config.ollama_model_validation_deep,
                &prompt,
                ChatOptions { temperature: 0.2, max_tokens: 1000 },
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Tier-2 validation call failed: {}", e);
                String::new()
            }
        };

        match extract_json_object(&response) {
            Some(value) => Tier2Score {
                coherence_score: value
                    .get("coherence_score")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(50),
                preferred_transcription: value
                    .get("preferred_transcription")
                    .and_then(|v| v.as_str())
                    .unwrap_or("primary")
                    .to_string(),
                issues: string_list(value.get("issues")),
                corrections: value
                    .get("corrections")
                    .and_then(|v| v.as_object())
                    .map(|map| {
                        map.iter()
                            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                            .collect()
                    })
                    .unwrap_or_default(),
                needs_human_review: value
                    .get("needs_human_review")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            },
            None => Tier2Score {
                coherence_score: 50,
                preferred_transcription: "primary".to_string(),
                issues: vec!["Failed to parse deep validation response".to_string()],
                corrections: BTreeMap::new(),
                needs_human_review: true,
            },
        }
    }

    /// Validate one transcribed meeting. Absorbs all non-fatal errors.
    pub async fn validate_meeting(&self, clip_id: i64) -> Result<StageOutcome> {
        let Some(meeting) = self.ledger.get_meeting(clip_id).await? else {
            tracing::error!("Meeting {} not found", clip_id);
            self.ledger
                .log_event(clip_id, Stage::Validate, EventStatus::Failed, "Meeting not found")
                .await?;
            return Ok(StageOutcome::Failed);
        };

        match meeting.status {
            MeetingStatus::Transcribed => {
                if !self
                    .ledger
                    .try_advance(clip_id, MeetingStatus::Transcribed, MeetingStatus::Validating)
                    .await?
                {
                    return Ok(StageOutcome::Skipped);
                }
            }
            MeetingStatus::Validating => {}
            _ => return Ok(StageOutcome::Skipped),
        }

        let Some(primary) = self.load_transcript_file(clip_id, &self.config.whisper_model_primary)
        else {
            let missing =
                PipelineError::NotFound(format!("primary transcript artifact for {}", clip_id));
            tracing::error!("{}", missing);
            self.ledger.update_status(clip_id, MeetingStatus::Failed).await?;
            self.ledger
                .log_event(clip_id, Stage::Validate, EventStatus::Failed, &missing.to_string())
                .await?;
            return Ok(StageOutcome::Failed);
        };

        let secondary = self.load_transcript_file(clip_id, &self.config.whisper_model_secondary);

        self.ledger
            .log_event(clip_id, Stage::Validate, EventStatus::Started, "Starting validation")
            .await?;

        // Model agreement
        let (overall_wer, divergent_segments) = match &secondary {
            Some(secondary) => {
                compare_transcripts(&primary, secondary, self.config.validation_wer_threshold)
            }
            None => {
                tracing::warn!("No secondary transcript for {}; skipping comparison", clip_id);
                (0.0, Vec::new())
            }
        };
        tracing::info!(
            "Meeting {}: overall WER {:.2}%, {} divergent segments",
            clip_id,
            overall_wer * 100.0,
            divergent_segments.len()
        );

        let agenda_items = self.ledger.get_agenda_items(clip_id).await?;

        // Tier 1 over the leading segments
        let mut tier1_scores: BTreeMap<usize, Tier1Score> = BTreeMap::new();
        let mut deep_review_indices: BTreeSet<usize> = BTreeSet::new();

        for (i, segment) in primary
            .segments
            .iter()
            .take(self.config.validation_tier1_segment_limit)
            .enumerate()
        {
            let agenda_title = agenda_title_at(&agenda_items, segment.start);
            let score = self.tier1_validate(&segment.text, agenda_title.as_deref()).await;

            if score.score < self.config.validation_coherence_threshold || score.needs_deep_review
            {
                deep_review_indices.insert(i);
            }
            tier1_scores.insert(i, score);
        }

        // Divergent segments join the deep-review set
        for divergent in &divergent_segments {
            deep_review_indices.insert(divergent.segment_index);
        }

        // Tier 2 over the flagged union, visited at most once each
        let mut tier2_scores: BTreeMap<usize, Tier2Score> = BTreeMap::new();
        if !deep_review_indices.is_empty() {
            tracing::info!(
                "Meeting {}: running tier-2 validation on {} segments",
                clip_id,
                deep_review_indices.len().min(self.config.validation_tier2_segment_limit)
            );
        }

        for &index in deep_review_indices
            .iter()
            .take(self.config.validation_tier2_segment_limit)
        {
            let Some(segment) = primary.segments.get(index) else {
                continue;
            };

            let divergent = divergent_segments
                .iter()
                .find(|d| d.segment_index == index);

            let (primary_text, secondary_text) = match divergent {
                Some(divergent) => (divergent.primary_text.clone(), divergent.secondary_text.clone()),
                None => {
                    // Nearest secondary segment by start offset
                    let mut secondary_text = String::new();
                    if let Some(secondary) = &secondary {
                        for s_segment in &secondary.segments {
                            if (s_segment.start - segment.start).abs() < 5.0 {
                                secondary_text = s_segment.text.clone();
                                break;
                            }
                        }
                    }
                    (segment.text.clone(), secondary_text)
                }
            };

            let agenda_title = agenda_title_at(&agenda_items, segment.start);
            let score = self
                .tier2_validate(&segment.text, agenda_title.as_deref(), &primary_text, &secondary_text)
                .await;
            tier2_scores.insert(index, score);
        }

        // Deduped issue collection; human review propagates from tier 2
        let mut issues: BTreeSet<String> = BTreeSet::new();
        for score in tier1_scores.values() {
            issues.extend(score.issues.iter().cloned());
        }
        let mut human_review_needed = false;
        for score in tier2_scores.values() {
            issues.extend(score.issues.iter().cloned());
            if score.needs_human_review {
                human_review_needed = true;
            }
        }

        let record = ValidationRecord {
            clip_id,
            primary_text: primary.text.clone(),
            secondary_text: secondary.as_ref().map(|s| s.text.clone()).unwrap_or_default(),
            // Correction application is deferred; the merged text is the
            // primary text verbatim.
            merged_text: primary.text.clone(),
            wer_score: overall_wer,
            divergent_segments,
            tier1_scores,
            tier2_scores,
            validation_issues: issues.into_iter().collect(),
            human_review_needed,
        };

        // The record write is the only fatal point of this stage.
        if let Err(e) = self.ledger.insert_validation(&record).await {
            self.ledger.update_status(clip_id, MeetingStatus::Failed).await?;
            self.ledger
                .log_event(clip_id, Stage::Validate, EventStatus::Failed, &e.to_string())
                .await?;
            return Ok(StageOutcome::Failed);
        }

        self.ledger.update_status(clip_id, MeetingStatus::Validated).await?;
        self.ledger
            .log_event(
                clip_id,
                Stage::Validate,
                EventStatus::Completed,
                &format!(
                    "WER: {:.2}%, Issues: {}",
                    record.wer_score * 100.0,
                    record.validation_issues.len()
                ),
            )
            .await?;

        tracing::info!(
            "Validation complete for {}: WER {:.2}%, human review needed: {}",
            clip_id,
            record.wer_score * 100.0,
            record.human_review_needed
        );

        Ok(StageOutcome::Completed)
    }
}

fn string_list(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

fn load_transcript(path: &Path) -> Option<TranscriptFile> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(transcript) => Some(transcript),
        Err(e) => {
            tracing::warn!("Corrupt transcript artifact {}: {}", path.display(), e);
            None
        }
    }
}
