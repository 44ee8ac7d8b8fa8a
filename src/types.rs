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

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a meeting. Strictly forward-ordered; `Failed` and
/// `Skipped` are terminal (a failed meeting can be manually reset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeetingStatus {
    Discovered,
    Downloading,
    Downloaded,
    Transcribing,
    Transcribed,
    Validating,
    Validated,
    Analyzing,
    Analyzed,
    Failed,
    Skipped,
}

impl MeetingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeetingStatus::Discovered => "discovered",
            MeetingStatus::Downloading => "downloading",
            MeetingStatus::Downloaded => "downloaded",
            MeetingStatus::Transcribing => "transcribing",
            MeetingStatus::Transcribed => "transcribed",
            MeetingStatus::Validating => "validating",
            MeetingStatus::Validated => "validated",
            MeetingStatus::Analyzing => "analyzing",
            MeetingStatus::Analyzed => "analyzed",
            MeetingStatus::Failed => "failed",
            MeetingStatus::Skipped => "skipped",
        }
    }

    /// Position in the forward sequence. Terminal states sort last.
    pub fn ordinal(&self) -> u8 {
        match self {
            MeetingStatus::Discovered => 0,
            MeetingStatus::Downloading => 1,
            MeetingStatus::Downloaded => 2,
            MeetingStatus::Transcribing => 3,
            MeetingStatus::Transcribed => 4,
            MeetingStatus::Validating => 5,
            MeetingStatus::Validated => 6,
            MeetingStatus::Analyzing => 7,
            MeetingStatus::Analyzed => 8,
            MeetingStatus::Failed => 9,
            MeetingStatus::Skipped => 10,
        }
    }

    pub fn all() -> &'static [MeetingStatus] {
        &[
            MeetingStatus::Discovered,
            MeetingStatus::Downloading,
            MeetingStatus::Downloaded,
            MeetingStatus::Transcribing,
            MeetingStatus::Transcribed,
            MeetingStatus::Validating,
            MeetingStatus::Validated,
            MeetingStatus::Analyzing,
            MeetingStatus::Analyzed,
            MeetingStatus::Failed,
            MeetingStatus::Skipped,
        ]
    }
}

impl fmt::Display for MeetingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MeetingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovered" => Ok(MeetingStatus::Discovered),
            "downloading" => Ok(MeetingStatus::Downloading),
            "downloaded" => Ok(MeetingStatus::Downloaded),
            "transcribing" => Ok(MeetingStatus::Transcribing),
            "transcribed" => Ok(MeetingStatus::Transcribed),
            "validating" => Ok(MeetingStatus::Validating),
            "validated" => Ok(MeetingStatus::Validated),
            "analyzing" => Ok(MeetingStatus::Analyzing),
            "analyzed" => Ok(MeetingStatus::Analyzed),
            "failed" => Ok(MeetingStatus::Failed),
            "skipped" => Ok(MeetingStatus::Skipped),
            other => Err(format!("unknown meeting status: {}", other)),
        }
    }
}

/// Pipeline stage identifiers used in the processing log and scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Discovery,
    Download,
    Transcribe,
    Diarize,
    Validate,
    Analyze,
    Segment,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Discovery => "discovery",
            Stage::Download => "download",
            Stage::Transcribe => "transcribe",
            Stage::Diarize => "diarize",
            Stage::Validate => "validate",
            Stage::Analyze => "analyze",
            Stage::Segment => "segment",
        }
    }

    /// The status a meeting must hold to be eligible for this stage.
    /// Discovery and diarization are not status-gated.
    pub fn input_status(&self) -> Option<MeetingStatus> {
        match self {
            Stage::Download => Some(MeetingStatus::Discovered),
            Stage::Transcribe => Some(MeetingStatus::Downloaded),
            Stage::Validate => Some(MeetingStatus::Transcribed),
            Stage::Analyze => Some(MeetingStatus::Validated),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome recorded for a processing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Started,
    Completed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Started => "started",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Category of meeting, parsed from the clip page title.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeetingType {
    CityCouncil,
    PlanningCommission,
    SpecialMeeting,
    Budget,
}

impl MeetingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeetingType::CityCouncil => "City Council",
            MeetingType::PlanningCommission => "Planning Commission",
            MeetingType::SpecialMeeting => "Special Meeting",
            MeetingType::Budget => "Budget Meeting",
        }
    }
}

impl fmt::Display for MeetingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MeetingType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "City Council" => Ok(MeetingType::CityCouncil),
            "Planning Commission" => Ok(MeetingType::PlanningCommission),
            "Special Meeting" => Ok(MeetingType::SpecialMeeting),
            "Budget Meeting" => Ok(MeetingType::Budget),
            other => Err(format!("unknown meeting type: {}", other)),
        }
    }
}

/// A meeting row in the ledger, keyed by the upstream clip ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meeting {
    pub clip_id: i64,
    pub title: String,
    pub meeting_date: Option<NaiveDate>,
    pub meeting_type: MeetingType,
    pub video_url: Option<String>,
    pub duration_seconds: Option<i64>,
    pub status: MeetingStatus,
    pub discovered_at: DateTime<Utc>,
}

/// An agenda index point, time-anchored into the meeting audio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgendaItem {
    pub id: i64,
    pub clip_id: i64,
    pub item_number: Option<String>,
    pub title: String,
    pub start_seconds: f64,
    pub end_seconds: Option<f64>,
    pub presenter: Option<String>,
    pub anchor_id: Option<i64>,
}

/// One word with its timing, flattened out of the ASR segments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordStamp {
    pub word: String,
    pub start: f64,
    pub end: f64,
}

/// A time-bounded piece of an ASR transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub words: Option<Vec<WordStamp>>,
}

/// The on-disk transcript artifact, one per engine per meeting. The engine
/// response may omit the trailing metadata; the transcription worker fills
/// it in before the artifact is written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptFile {
    pub text: String,
    #[serde(default)]
    pub segments: Vec<AsrSegment>,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub processing_time_seconds: f64,
    #[serde(default)]
    pub model: String,
}

impl TranscriptFile {
    /// Flatten segment word lists into one ordered word-timestamp list.
    pub fn word_timestamps(&self) -> Vec<WordStamp> {
        let mut words = Vec::new();
        for segment in &self.segments {
            if let Some(segment_words) = &segment.words {
                words.extend(segment_words.iter().cloned());
            }
        }
        words
    }
}

/// A segment whose per-segment WER exceeded the divergence threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DivergentSegment {
    pub segment_index: usize,
    pub start: f64,
    pub end: f64,
    pub wer: f64,
    pub primary_text: String,
    pub secondary_text: String,
}

/// Tier-1 (fast) coherence score for one segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tier1Score {
    pub score: i64,
    pub issues: Vec<String>,
    pub needs_deep_review: bool,
}

/// Tier-2 (deep) coherence result for one flagged segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tier2Score {
    pub coherence_score: i64,
    pub preferred_transcription: String,
    pub issues: Vec<String>,
    pub corrections: BTreeMap<String, String>,
    pub needs_human_review: bool,
}

/// Full validation outcome persisted for a meeting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub clip_id: i64,
    pub primary_text: String,
    pub secondary_text: String,
    pub merged_text: String,
    pub wer_score: f64,
    pub divergent_segments: Vec<DivergentSegment>,
    pub tier1_scores: BTreeMap<usize, Tier1Score>,
    pub tier2_scores: BTreeMap<usize, Tier2Score>,
    pub validation_issues: Vec<String>,
    pub human_review_needed: bool,
}

/// How a speaker name was assigned to a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentificationMethod {
    Pattern,
    Agenda,
    Llm,
    TurnMapped,
}

impl IdentificationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentificationMethod::Pattern => "pattern",
            IdentificationMethod::Agenda => "agenda",
            IdentificationMethod::Llm => "llm",
            IdentificationMethod::TurnMapped => "turn-detector-mapped",
        }
    }
}

impl fmt::Display for IdentificationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A transcript segment attributed to a speaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerSegment {
    pub start: f64,
    pub end: f64,
    pub speaker_id: String,
    #[serde(default)]
    pub speaker_name: Option<String>,
    pub confidence: f32,
    #[serde(default)]
    pub method: Option<String>,
    pub text: String,
}

/// The diarization artifact written next to the transcripts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiarizationFile {
    pub clip_id: i64,
    pub total_speakers: usize,
    pub identified_speakers: usize,
    pub speaker_mapping: BTreeMap<String, String>,
    pub segments: Vec<SpeakerSegment>,
}

/// The fixed set of LLM extractors that can run over a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnalysisType {
    Summary,
    AdvocacyIntel,
    VoteRecord,
    PriorityAlerts,
    OppositionTracking,
    PublicComment,
}

impl AnalysisType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisType::Summary => "summary",
            AnalysisType::AdvocacyIntel => "advocacy_intel",
            AnalysisType::VoteRecord => "vote_record",
            AnalysisType::PriorityAlerts => "priority_alerts",
            AnalysisType::OppositionTracking => "opposition_tracking",
            AnalysisType::PublicComment => "public_comment",
        }
    }

    /// Types run by default; opposition tracking and public comment are
    /// opt-in via configuration.
    pub fn default_enabled() -> Vec<AnalysisType> {
        vec![
            AnalysisType::Summary,
            AnalysisType::AdvocacyIntel,
            AnalysisType::VoteRecord,
            AnalysisType::PriorityAlerts,
        ]
    }
}

impl fmt::Display for AnalysisType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AnalysisType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "summary" => Ok(AnalysisType::Summary),
            "advocacy_intel" => Ok(AnalysisType::AdvocacyIntel),
            "vote_record" => Ok(AnalysisType::VoteRecord),
            "priority_alerts" => Ok(AnalysisType::PriorityAlerts),
            "opposition_tracking" => Ok(AnalysisType::OppositionTracking),
            "public_comment" => Ok(AnalysisType::PublicComment),
            other => Err(format!("unknown analysis type: {}", other)),
        }
    }
}

/// Result of one stage-worker invocation on one meeting. Non-fatal
/// failures are absorbed into `Failed`; `Skipped` means the status gate or
/// a missing prerequisite made the invocation a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Completed,
    Failed,
    Skipped,
}

/// One row of the append-only processing log.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingEvent {
    pub id: i64,
    pub clip_id: i64,
    pub stage: String,
    pub status: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

// Known council members for speaker identification and prompt glossaries.
pub const KNOWN_COUNCIL_MEMBERS: &[&str] = &[
    "Coolidge", // Mayor
    "Reynolds",
    "Brown",
    "Huber",
    "Morgan",
    "Stone",
    "Tandon",
    "van Overbeek",
];

pub const KNOWN_STAFF_ROLES: &[&str] = &[
    "City Manager",
    "City Attorney",
    "City Clerk",
    "Public Works Director",
    "Community Development Director",
    "Police Chief",
    "Fire Chief",
    "Finance Director",
];

// Local place names and institutions fed to the coherence-check prompts.
pub const DOMAIN_TERMS: &[&str] = &[
    "Bidwell",
    "Esplanade",
    "Valley's Edge",
    "CARD",
    "CUSD",
    "Enloe",
    "Chico",
    "Butte County",
    "Paradise",
    "Oroville",
    "Big Chico Creek",
];

// Priority topics scanned for by the alerts extractor.
pub const PRIORITY_KEYWORDS: &[&str] = &[
    "Valley's Edge",
    "parking minimum",
    "missing middle",
    "infill",
    "groundwater",
    "infrastructure deficit",
    "form-based code",
    "ADU",
    "accessory dwelling",
    "zoning",
    "housing",
];

// Words that are NOT names. Filters false positives from phrases like
// "I'm just...", "I'm not sure...", "thank you, please...".
pub const FALSE_POSITIVE_NAMES: &[&str] = &[
    "i", "we", "you", "just", "not", "sure", "sorry", "here", "going",
    "trying", "looking", "hoping", "thinking", "wondering", "asking",
    "saying", "making", "doing", "getting", "having", "taking", "coming",
    "speaking", "talking", "reading", "writing", "working", "running",
    "very", "really", "actually", "also", "still", "even", "only",
    "glad", "happy", "pleased", "honored", "grateful", "excited",
    "concerned", "worried", "confused", "curious", "afraid", "opposed",
    "in", "on", "at", "to", "for", "with", "from", "a", "the", "an",
    "assuming", "guessing", "betting", "certain", "confident",
    "wel", "welcome", "thank", "thanks", "please", "next", "first", "last",
    "our", "this", "that", "item", "agenda", "motion", "second",
    "council", "member", "mayor", "vice", "city", "public", "speaker",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in MeetingStatus::all() {
            let parsed: MeetingStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, *status);
        }
    }

    #[test]
    fn status_rejects_unknown_literal() {
        assert!("paused".parse::<MeetingStatus>().is_err());
    }

    #[test]
    fn stage_input_statuses_follow_the_sequence() {
        assert_eq!(Stage::Download.input_status(), Some(MeetingStatus::Discovered));
        assert_eq!(Stage::Transcribe.input_status(), Some(MeetingStatus::Downloaded));
        assert_eq!(Stage::Validate.input_status(), Some(MeetingStatus::Transcribed));
        assert_eq!(Stage::Analyze.input_status(), Some(MeetingStatus::Validated));
        assert_eq!(Stage::Diarize.input_status(), None);
    }

    #[test]
    fn word_timestamps_flatten_in_order() {
        let transcript = TranscriptFile {
            text: "good evening everyone".to_string(),
            segments: vec![
                AsrSegment {
                    start: 0.0,
                    end: 1.0,
                    text: "good evening".to_string(),
                    words: Some(vec![
                        WordStamp { word: "good".to_string(), start: 0.0, end: 0.4 },
                        WordStamp { word: "evening".to_string(), start: 0.4, end: 1.0 },
                    ]),
                },
                AsrSegment {
                    start: 1.0,
                    end: 1.5,
                    text: "everyone".to_string(),
                    words: Some(vec![WordStamp {
                        word: "everyone".to_string(),
                        start: 1.0,
                        end: 1.5,
                    }]),
                },
            ],
            language: "en".to_string(),
            processing_time_seconds: 0.1,
            model: "large-v3".to_string(),
        };

        let words = transcript.word_timestamps();
        assert_eq!(words.len(), 3);
        assert_eq!(words[2].word, "everyone");
    }

    #[test]
    fn identification_methods_have_stable_labels() {
        assert_eq!(IdentificationMethod::Pattern.as_str(), "pattern");
        assert_eq!(IdentificationMethod::TurnMapped.as_str(), "turn-detector-mapped");
    }
}
