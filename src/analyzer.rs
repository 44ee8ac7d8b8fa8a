/*
 * Council Analyzer CLI - LLM Analysis
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
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::capabilities::{Chat, ChatOptions};
use crate::config::Config;
use crate::diarization::load_diarization;
use crate::ledger::Ledger;
use crate::segmenter::{segment_meeting, MeetingSegment};
use crate::types::{
    AnalysisType, DiarizationFile, EventStatus, MeetingStatus, Stage, StageOutcome,
    PRIORITY_KEYWORDS,
};
use crate::utils::{chunk_text, extract_json_object};

const SEGMENT_TEXT_LIMIT: usize = 6000;
const MIN_SEGMENT_CHARS: usize = 50;
const SUMMARY_CHUNK_CHARS: usize = 4000;
const SUMMARY_CHUNK_COUNT: usize = 3;
const SUMMARY_BULLET_LIMIT: usize = 10;
const MEETING_SUMMARY_ORDINAL: i64 = -1;

/// Prompt template for an analysis type. `{text}` and `{agenda_title}` are
/// substituted per segment. The response schemas are load-bearing;
/// downstream consumers read these shapes.
fn prompt_template(analysis_type: AnalysisType) -> &'static str {
    match analysis_type {
        AnalysisType::Summary => {
            "Summarize this city council meeting segment in 3-5 bullet points.
Focus on:
- Key decisions made
- Major debates or disagreements
- Action items or next steps
- Public comment themes

Segment:
{text}

Return JSON: {\"summary\": [\"bullet1\", \"bullet2\"]}"
        }
        AnalysisType::AdvocacyIntel => {
            "Analyze this city council meeting segment for Smart Growth advocacy intelligence.

Extract:
1. Housing and development discussions
2. Zoning changes or proposals
3. Infrastructure and transit topics
4. Environmental and sustainability mentions
5. Council member positions on growth issues

Segment:
{text}

Agenda Item: {agenda_title}

Return JSON:
{
  \"housing_mentions\": [\"list of housing-related discussions\"],
  \"zoning_topics\": [\"any zoning changes discussed\"],
  \"infrastructure\": [\"infrastructure topics\"],
  \"sustainability\": [\"environmental mentions\"],
  \"council_positions\": {\"member_name\": \"their stated position\"},
  \"key_quotes\": [\"notable quotes\"],
  \"action_items\": [\"decisions or next steps\"]
}"
        }
        AnalysisType::VoteRecord => {
            "Extract all votes from this meeting segment.

For each vote, identify:
- What was voted on
- Who made the motion
- Who seconded
- Vote result
- Individual votes if mentioned

Segment:
{text}

Return JSON:
{
  \"votes\": [
    {
      \"motion\": \"description of what was voted on\",
      \"mover\": \"who made motion\",
      \"seconder\": \"who seconded\",
      \"result\": \"passed/failed\",
      \"vote_count\": {\"yes\": 0, \"no\": 0, \"abstain\": 0},
      \"individual_votes\": {\"member\": \"yes/no/abstain\"}
    }
  ]
}"
        }
        AnalysisType::PriorityAlerts => {
            "Check this segment for these priority topics:
{keywords}

For each mention, note the context and who said it.

Segment:
{text}

Return JSON:
{
  \"alerts\": [
    {
      \"keyword\": \"the priority topic found\",
      \"context\": \"what was said about it\",
      \"speaker\": \"who mentioned it\",
      \"sentiment\": \"supportive/opposed/neutral\"
    }
  ]
}"
        }
        AnalysisType::OppositionTracking => {
            "Find statements by these council members in this segment:
- Tom van Overbeek
- Kasey Reynolds

For each statement, note:
- The topic being discussed
- Their stated position
- How they voted (if applicable)

Segment:
{text}

Return JSON:
{
  \"van_overbeek\": [
    {\"topic\": \"topic\", \"position\": \"their stance\", \"quote\": \"relevant quote\"}
  ],
  \"reynolds\": [
    {\"topic\": \"topic\", \"position\": \"their stance\", \"quote\": \"relevant quote\"}
  ]
}"
        }
        AnalysisType::PublicComment => {
            "Summarize public comments in this segment:
- How many speakers (estimate)
- Main topics raised
- General sentiment
- Any notable organizations represented

Segment:
{text}

Return JSON:
{
  \"speaker_count\": 0,
  \"topics\": [\"main topics\"],
  \"sentiment_summary\": \"overall tone\",
  \"organizations\": [\"groups represented\"],
  \"key_points\": [\"main points raised\"]
}"
        }
    }
}

/// Speaker roster header for prompts, from the diarization mapping.
fn speaker_summary(diarization: &DiarizationFile) -> String {
    let identified: BTreeSet<&str> = diarization
        .speaker_mapping
        .values()
        .filter(|name| !name.is_empty())
        .map(String::as_str)
        .collect();

    if identified.is_empty() {
        return String::new();
    }

    let mut lines = vec!["Identified speakers in this meeting:".to_string()];
    for name in identified {
        lines.push(format!("  - {}", name));
    }
    lines.join("\n")
}

/// Prefix segment text with the identified-speaker header when diarization
/// is available.
fn enhance_text_with_speakers(text: &str, diarization: Option<&DiarizationFile>) -> String {
    let Some(diarization) = diarization else {
        return text.to_string();
    };

    let identified: BTreeSet<&str> = diarization
        .speaker_mapping
        .values()
        .filter(|name| !name.is_empty())
        .map(String::as_str)
        .collect();

    if identified.is_empty() {
        return text.to_string();
    }

    let names: Vec<&str> = identified.into_iter().collect();
    format!("[Identified speakers: {}]\n\n{}", names.join(", "), text)
}

/// Analysis stage worker: per-segment LLM extraction plus the meeting-level
/// summary roll-up.
pub struct AnalyzerWorker {
    ledger: Ledger,
    chat: Arc<dyn Chat>,
    config: Config,
}

impl AnalyzerWorker {
    pub fn new(ledger: Ledger, chat: Arc<dyn Chat>, config: Config) -> Self {
        Self {
            ledger,
            chat,
            config,
        }
    }

    /// Run one extractor over one text. An unparseable response persists as
    /// a raw blob; a transport error yields `None` and the stage continues.
    async fn analyze_text(
        &self,
        text: &str,
        analysis_type: AnalysisType,
        agenda_title: Option<&str>,
    ) -> Option<Value> {
        let truncated = if text.chars().count() > SEGMENT_TEXT_LIMIT {
            let head: String = text.chars().take(SEGMENT_TEXT_LIMIT).collect();
            format!("{}... [truncated]", head)
        } else {
            text.to_string()
        };

        let keywords = PRIORITY_KEYWORDS
            .iter()
            .map(|keyword| format!("- {}", keyword))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = prompt_template(analysis_type)
            .replace("{text}", &truncated)
            .replace("{agenda_title}", agenda_title.unwrap_or("General meeting content"))
            .replace("{keywords}", &keywords);

        let response = match self
            .chat
            .generate(
                &self.config.ollama_model_analysis,
                &prompt,
                ChatOptions { temperature: 0.3, max_tokens: 2000 },
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::error!("Analysis call failed ({}): {}", analysis_type, e);
                return None;
            }
        };

        match extract_json_object(&response) {
            Some(value) => Some(value),
            None => {
                tracing::warn!("Could not parse JSON response for {}", analysis_type);
                Some(json!({ "raw_response": response }))
            }
        }
    }

    /// Analyze one validated meeting across the enabled analysis types.
    pub async fn analyze_meeting(
        &self,
        clip_id: i64,
        analysis_types: &[AnalysisType],
    ) -> Result<StageOutcome> {
        let Some(meeting) = self.ledger.get_meeting(clip_id).await? else {
            tracing::error!("Meeting {} not found", clip_id);
            self.ledger
                .log_event(clip_id, Stage::Analyze, EventStatus::Failed, "Meeting not found")
                .await?;
            return Ok(StageOutcome::Failed);
        };

        match meeting.status {
            MeetingStatus::Validated => {
                if !self
                    .ledger
                    .try_advance(clip_id, MeetingStatus::Validated, MeetingStatus::Analyzing)
                    .await?
                {
                    return Ok(StageOutcome::Skipped);
                }
            }
            MeetingStatus::Analyzing => {}
            _ => return Ok(StageOutcome::Skipped),
        }

        let Some(transcript) = self.ledger.get_transcript(clip_id).await? else {
            tracing::error!("No transcript for {}", clip_id);
            self.ledger.update_status(clip_id, MeetingStatus::Failed).await?;
            self.ledger
                .log_event(clip_id, Stage::Analyze, EventStatus::Failed, "No transcript in ledger")
                .await?;
            return Ok(StageOutcome::Failed);
        };

        if let Some(validation) = self.ledger.get_validation(clip_id).await? {
            if validation.human_review_needed {
                tracing::warn!(
                    "Meeting {} is flagged for human review; analysis may be unreliable",
                    clip_id
                );
            }
        }

        let diarization = load_diarization(&self.config, clip_id);
        match &diarization {
            Some(d) => tracing::info!(
                "Using diarization for {}: {}/{} speakers identified",
                clip_id,
                d.identified_speakers,
                d.total_speakers
            ),
            None => tracing::info!("No diarization data available for {}", clip_id),
        }

        self.ledger
            .log_event(
                clip_id,
                Stage::Analyze,
                EventStatus::Started,
                &format!(
                    "Analysis types: {}",
                    analysis_types
                        .iter()
                        .map(|t| t.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            )
            .await?;

        // Agenda-aligned segments, or one synthetic whole-meeting segment
        let segments = match segment_meeting(&self.ledger, clip_id).await? {
            Some(segments) if !segments.is_empty() => segments,
            _ => vec![MeetingSegment {
                agenda_item_id: None,
                item_number: None,
                item_title: None,
                text: transcript.full_text.clone(),
                start_seconds: 0.0,
                end_seconds: None,
                word_count: transcript.full_text.split_whitespace().count(),
            }],
        };

        let total_segments = segments.len();
        for (ordinal, segment) in segments.iter().enumerate() {
            if segment.text.chars().count() < MIN_SEGMENT_CHARS {
                continue;
            }

            let enhanced = enhance_text_with_speakers(&segment.text, diarization.as_ref());
            let agenda_title = segment.item_title.as_deref();

            for &analysis_type in analysis_types {
                tracing::info!(
                    "Analyzing segment {}/{} of {}: {}",
                    ordinal + 1,
                    total_segments,
                    clip_id,
                    analysis_type
                );

                let Some(result) = self.analyze_text(&enhanced, analysis_type, agenda_title).await
                else {
                    continue;
                };

                self.ledger
                    .insert_analysis(
                        clip_id,
                        analysis_type.as_str(),
                        ordinal as i64,
                        segment.agenda_item_id,
                        &result,
                        &self.config.ollama_model_analysis,
                    )
                    .await?;
            }
        }

        // Meeting-level summary: cost-capped at the first three chunks
        let meeting_summary = self.meeting_summary(&transcript.full_text).await;
        if let Some(summary) = meeting_summary {
            self.ledger
                .insert_analysis(
                    clip_id,
                    AnalysisType::Summary.as_str(),
                    MEETING_SUMMARY_ORDINAL,
                    None,
                    &summary,
                    &self.config.ollama_model_analysis,
                )
                .await?;
        }

        let mut total_rows = 0;
        for analysis_type in analysis_types {
            total_rows += self
                .ledger
                .count_analyses(clip_id, analysis_type.as_str())
                .await?;
        }

        self.ledger.update_status(clip_id, MeetingStatus::Analyzed).await?;
        self.ledger
            .log_event(
                clip_id,
                Stage::Analyze,
                EventStatus::Completed,
                &format!(
                    "Completed {} analysis types ({} rows)",
                    analysis_types.len(),
                    total_rows
                ),
            )
            .await?;

        tracing::info!("Analysis complete for {}", clip_id);
        Ok(StageOutcome::Completed)
    }

    async fn meeting_summary(&self, full_text: &str) -> Option<Value> {
        if full_text.chars().count() <= 2 * SUMMARY_CHUNK_CHARS {
            return self.analyze_text(full_text, AnalysisType::Summary, None).await;
        }

        let chunks = chunk_text(full_text, SUMMARY_CHUNK_CHARS);
        let mut bullets = Vec::new();

        for chunk in chunks.iter().take(SUMMARY_CHUNK_COUNT) {
            if let Some(result) = self.analyze_text(chunk, AnalysisType::Summary, None).await {
                if let Some(summary) = result.get("summary").and_then(|v| v.as_array()) {
                    bullets.extend(summary.iter().cloned());
                }
            }
        }

        bullets.truncate(SUMMARY_BULLET_LIMIT);
        Some(json!({ "summary": bullets }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use crate::test_support::test_config;
    use crate::types::{MeetingType, SpeakerSegment, WordStamp};

    /// Chat stub that records prompts and replies per analysis type.
    struct RecordingChat {
        prompts: Mutex<Vec<String>>,
        malformed_for_votes: bool,
    }

    #[async_trait]
    impl Chat for RecordingChat {
        async fn generate(&self, _model: &str, prompt: &str, _options: ChatOptions) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());

            if prompt.contains("Extract all votes") {
                if self.malformed_for_votes {
                    return Ok("Sure, here you go: [malformed".to_string());
                }
                return Ok(r#"{"votes": [{"motion": "approve the consent agenda", "mover": "Brown", "seconder": "Stone", "result": "passed", "vote_count": {"yes": 7, "no": 0, "abstain": 0}, "individual_votes": {"Brown": "yes"}}]}"#.to_string());
            }
            if prompt.contains("Summarize this city council meeting segment") {
                return Ok(r#"{"summary": ["budget discussed", "vote held"]}"#.to_string());
            }
            if prompt.contains("priority topics") {
                return Ok(r#"{"alerts": []}"#.to_string());
            }
            Ok(r#"{"housing_mentions": [], "zoning_topics": [], "infrastructure": [], "sustainability": [], "council_positions": {}, "key_quotes": [], "action_items": []}"#.to_string())
        }
    }

    async fn validated_meeting(config: &Config, text: &str) -> Ledger {
        let ledger = Ledger::open_in_memory().await.unwrap();
        ledger
            .insert_meeting(
                400,
                "6/1/21 City Council",
                NaiveDate::from_ymd_opt(2021, 6, 1),
                MeetingType::CityCouncil,
                Some("https://example.test/stream/400.m3u8"),
                None,
            )
            .await
            .unwrap();
        ledger.update_status(400, MeetingStatus::Validated).await.unwrap();

        let words: Vec<WordStamp> = Vec::new();
        ledger
            .insert_transcript(400, text, &words, "dual:large-v3+medium", 10.0)
            .await
            .unwrap();

        ledger
    }

    fn long_segment_text() -> String {
        "the council discussed the annual budget and took a roll call vote on the consent agenda"
            .to_string()
    }

    #[tokio::test]
    async fn analyzes_all_types_and_advances_status() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf());
        let ledger = validated_meeting(&config, &long_segment_text()).await;

        let chat = Arc::new(RecordingChat {
            prompts: Mutex::new(Vec::new()),
            malformed_for_votes: false,
        });
        let worker = AnalyzerWorker::new(ledger.clone(), chat, config);

        let outcome = worker
            .analyze_meeting(400, &AnalysisType::default_enabled())
            .await
            .unwrap();
        assert_eq!(outcome, StageOutcome::Completed);

        for analysis_type in AnalysisType::default_enabled() {
            assert!(
                ledger.count_analyses(400, analysis_type.as_str()).await.unwrap() >= 1,
                "missing analysis rows for {}",
                analysis_type
            );
        }

        let meeting = ledger.get_meeting(400).await.unwrap().unwrap();
        assert_eq!(meeting.status, MeetingStatus::Analyzed);
    }

    #[tokio::test]
    async fn malformed_response_persists_raw_blob_and_stage_advances() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf());
        let ledger = validated_meeting(&config, &long_segment_text()).await;

        let chat = Arc::new(RecordingChat {
            prompts: Mutex::new(Vec::new()),
            malformed_for_votes: true,
        });
        let worker = AnalyzerWorker::new(ledger.clone(), chat, config);

        let outcome = worker
            .analyze_meeting(400, &[AnalysisType::VoteRecord])
            .await
            .unwrap();
        assert_eq!(outcome, StageOutcome::Completed);

        assert_eq!(
            ledger.count_analyses(400, AnalysisType::VoteRecord.as_str()).await.unwrap(),
            1
        );

        let meeting = ledger.get_meeting(400).await.unwrap().unwrap();
        assert_eq!(meeting.status, MeetingStatus::Analyzed);
    }

    #[tokio::test]
    async fn speaker_header_enriches_prompts_when_diarization_exists() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf());
        let ledger = validated_meeting(&config, &long_segment_text()).await;

        let mut mapping = BTreeMap::new();
        mapping.insert("SPK_0".to_string(), "Huber".to_string());
        let diarization = DiarizationFile {
            clip_id: 400,
            total_speakers: 1,
            identified_speakers: 1,
            speaker_mapping: mapping,
            segments: vec![SpeakerSegment {
                start: 0.0,
                end: 5.0,
                speaker_id: "SPK_0".to_string(),
                speaker_name: Some("Huber".to_string()),
                confidence: 0.9,
                method: Some("pattern".to_string()),
                text: "the council discussed".to_string(),
            }],
        };
        let path = config.diarization_path(400);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, serde_json::to_string_pretty(&diarization).unwrap()).unwrap();

        let chat = Arc::new(RecordingChat {
            prompts: Mutex::new(Vec::new()),
            malformed_for_votes: false,
        });
        let worker = AnalyzerWorker::new(ledger.clone(), chat.clone(), config);

        worker
            .analyze_meeting(400, &[AnalysisType::Summary])
            .await
            .unwrap();

        let prompts = chat.prompts.lock().unwrap();
        assert!(prompts
            .iter()
            .any(|p| p.contains("[Identified speakers: Huber]")));
    }

    #[tokio::test]
    async fn short_segments_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf());
        let ledger = validated_meeting(&config, "too short").await;

        let chat = Arc::new(RecordingChat {
            prompts: Mutex::new(Vec::new()),
            malformed_for_votes: false,
        });
        let worker = AnalyzerWorker::new(ledger.clone(), chat.clone(), config);

        let outcome = worker
            .analyze_meeting(400, &[AnalysisType::AdvocacyIntel])
            .await
            .unwrap();
        assert_eq!(outcome, StageOutcome::Completed);

        // Only the meeting-level summary prompt went out.
        let prompts = chat.prompts.lock().unwrap();
        assert!(prompts.iter().all(|p| p.contains("Summarize")));
        assert_eq!(
            ledger.count_analyses(400, AnalysisType::AdvocacyIntel.as_str()).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn meeting_summary_row_uses_the_meeting_level_ordinal() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf());
        let ledger = validated_meeting(&config, &long_segment_text()).await;

        let chat = Arc::new(RecordingChat {
            prompts: Mutex::new(Vec::new()),
            malformed_for_votes: false,
        });
        let worker = AnalyzerWorker::new(ledger.clone(), chat, config);

        worker
            .analyze_meeting(400, &[AnalysisType::Summary])
            .await
            .unwrap();

        // Segment row plus the meeting-level roll-up
        assert_eq!(
            ledger.count_analyses(400, AnalysisType::Summary.as_str()).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn meetings_not_at_the_gate_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path().to_path_buf());
        let ledger = validated_meeting(&config, &long_segment_text()).await;
        ledger.update_status(400, MeetingStatus::Transcribed).await.unwrap();

        let chat = Arc::new(RecordingChat {
            prompts: Mutex::new(Vec::new()),
            malformed_for_votes: false,
        });
        let worker = AnalyzerWorker::new(ledger.clone(), chat, config);

        let outcome = worker
            .analyze_meeting(400, &AnalysisType::default_enabled())
            .await
            .unwrap();
        assert_eq!(outcome, StageOutcome::Skipped);
    }
}
