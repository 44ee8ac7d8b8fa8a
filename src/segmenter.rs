/*
 * Council Analyzer CLI - Agenda Segmentation
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
use serde::{Deserialize, Serialize};

use crate::ledger::Ledger;
use crate::types::{AgendaItem, EventStatus, Stage, WordStamp};

const DEFAULT_ITEM_SPAN_SECONDS: f64 = 3600.0;
const FALLBACK_TAIL_SECONDS: f64 = 600.0;

/// One agenda-aligned slice of a meeting transcript. Derived on demand;
/// never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeetingSegment {
    pub agenda_item_id: Option<i64>,
    pub item_number: Option<String>,
    pub item_title: Option<String>,
    pub text: String,
    pub start_seconds: f64,
    pub end_seconds: Option<f64>,
    pub word_count: usize,
}

/// Resolve the end offset of item `i`: explicit end, next item's start,
/// last word's end, then a fixed one-hour span.
fn resolve_end(items: &[AgendaItem], i: usize, words: &[WordStamp]) -> f64 {
    if let Some(end) = items[i].end_seconds {
        return end;
    }
    if let Some(next) = items.get(i + 1) {
        return next.start_seconds;
    }
    if let Some(last_word) = words.last() {
        return last_word.end;
    }
    items[i].start_seconds + DEFAULT_ITEM_SPAN_SECONDS
}

/// Slice a transcript into agenda-aligned segments.
///
/// A word belongs to the item whose `[start, end)` window contains its
/// start offset. With no word timing the text is split proportionally by
/// each item's share of the total duration; with no agenda items the whole
/// transcript becomes one synthetic segment.
pub fn segment_transcript(
    full_text: &str,
    word_timestamps: &[WordStamp],
    agenda_items: &[AgendaItem],
) -> Vec<MeetingSegment> {
    if agenda_items.is_empty() {
        return vec![MeetingSegment {
            agenda_item_id: None,
            item_number: None,
            item_title: None,
            text: full_text.to_string(),
            start_seconds: 0.0,
            end_seconds: None,
            word_count: full_text.split_whitespace().count(),
        }];
    }

    if word_timestamps.is_empty() {
        return segment_by_proportion(full_text, agenda_items);
    }

    let mut segments = Vec::with_capacity(agenda_items.len());

    for (i, item) in agenda_items.iter().enumerate() {
        let start = item.start_seconds;
        let end = resolve_end(agenda_items, i, word_timestamps);

        let mut words = Vec::new();
        for stamp in word_timestamps {
            if stamp.start >= start && stamp.start < end {
                words.push(stamp.word.as_str());
            } else if stamp.start >= end {
                break;
            }
        }

        let text = words.join(" ").trim().to_string();
        let word_count = words.len();

        segments.push(MeetingSegment {
            agenda_item_id: Some(item.id),
            item_number: item.item_number.clone(),
            item_title: Some(item.title.clone()),
            text,
            start_seconds: start,
            end_seconds: Some(end),
            word_count,
        });
    }

    segments
}

/// Fallback used when the transcript carries no word timing: allot words to
/// items by their time-share of the total duration, spilling the remainder
/// into the last item.
fn segment_by_proportion(full_text: &str, agenda_items: &[AgendaItem]) -> Vec<MeetingSegment> {
    let words: Vec<&str> = full_text.split_whitespace().collect();
    let total_words = words.len();
    if total_words == 0 {
        return Vec::new();
    }

    let last = &agenda_items[agenda_items.len() - 1];
    let total_duration = last
        .end_seconds
        .unwrap_or(last.start_seconds + FALLBACK_TAIL_SECONDS);

    let mut segments = Vec::with_capacity(agenda_items.len());
    let mut word_index = 0usize;

    for (i, item) in agenda_items.iter().enumerate() {
        let start = item.start_seconds;
        let end = match item.end_seconds {
            Some(end) => end,
            None => agenda_items
                .get(i + 1)
                .map(|next| next.start_seconds)
                .unwrap_or(total_duration),
        };

        let proportion = if total_duration > 0.0 {
            (end - start) / total_duration
        } else {
            1.0 / agenda_items.len() as f64
        };
        let word_count = (total_words as f64 * proportion) as usize;

        let slice_end = (word_index + word_count).min(total_words);
        let segment_words = &words[word_index..slice_end];
        word_index = slice_end;

        segments.push(MeetingSegment {
            agenda_item_id: Some(item.id),
            item_number: item.item_number.clone(),
            item_title: Some(item.title.clone()),
            text: segment_words.join(" "),
            start_seconds: start,
            end_seconds: Some(end),
            word_count: segment_words.len(),
        });
    }

    // Remainder spills into the last item
    if word_index < total_words {
        if let Some(last_segment) = segments.last_mut() {
            let remaining = words[word_index..].join(" ");
            if last_segment.text.is_empty() {
                last_segment.text = remaining;
            } else {
                last_segment.text.push(' ');
                last_segment.text.push_str(&remaining);
            }
            last_segment.word_count += total_words - word_index;
        }
    }

    segments
}

/// Segment a meeting out of the ledger, logging the derivation.
pub async fn segment_meeting(ledger: &Ledger, clip_id: i64) -> Result<Option<Vec<MeetingSegment>>> {
    let Some(transcript) = ledger.get_transcript(clip_id).await? else {
        tracing::warn!("No transcript found for {}", clip_id);
        return Ok(None);
    };

    let agenda_items = ledger.get_agenda_items(clip_id).await?;

    ledger
        .log_event(clip_id, Stage::Segment, EventStatus::Started, "Segmenting transcript")
        .await?;

    let segments = segment_transcript(
        &transcript.full_text,
        &transcript.word_timestamps,
        &agenda_items,
    );

    ledger
        .log_event(
            clip_id,
            Stage::Segment,
            EventStatus::Completed,
            &format!("Created {} segments", segments.len()),
        )
        .await?;

    Ok(Some(segments))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: i64, start: f64, end: Option<f64>, title: &str) -> AgendaItem {
        AgendaItem {
            id,
            clip_id: 1,
            item_number: Some(id.to_string()),
            title: title.to_string(),
            start_seconds: start,
            end_seconds: end,
            presenter: None,
            anchor_id: None,
        }
    }

    fn stamps(words: &[(&str, f64, f64)]) -> Vec<WordStamp> {
        words
            .iter()
            .map(|(word, start, end)| WordStamp {
                word: word.to_string(),
                start: *start,
                end: *end,
            })
            .collect()
    }

    #[test]
    fn words_land_in_the_item_containing_their_start() {
        let items = vec![
            item(1, 0.0, Some(10.0), "Call to Order"),
            item(2, 10.0, Some(20.0), "Consent Agenda"),
        ];
        let words = stamps(&[
            ("good", 0.0, 0.5),
            ("evening", 0.5, 1.0),
            ("consent", 10.0, 10.5),
            ("agenda", 10.5, 11.0),
        ]);

        let segments = segment_transcript("good evening consent agenda", &words, &items);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].text, "good evening");
        assert_eq!(segments[1].text, "consent agenda");
        assert_eq!(segments[0].word_count, 2);
    }

    #[test]
    fn boundary_word_goes_to_the_next_item() {
        let items = vec![
            item(1, 0.0, Some(10.0), "First"),
            item(2, 10.0, Some(20.0), "Second"),
        ];
        let words = stamps(&[("exactly", 10.0, 10.4)]);

        let segments = segment_transcript("exactly", &words, &items);
        assert_eq!(segments[0].text, "");
        assert_eq!(segments[1].text, "exactly");
    }

    #[test]
    fn last_item_end_falls_back_to_last_word() {
        let items = vec![item(1, 0.0, None, "Only Item")];
        let words = stamps(&[("first", 0.0, 1.0), ("last", 100.0, 101.5)]);

        let segments = segment_transcript("first last", &words, &items);
        assert_eq!(segments[0].end_seconds, Some(101.5));
        assert_eq!(segments[0].text, "first last");
    }

    #[test]
    fn missing_end_derives_from_next_item_start() {
        let items = vec![
            item(1, 0.0, None, "First"),
            item(2, 50.0, Some(80.0), "Second"),
        ];
        let words = stamps(&[("early", 1.0, 1.5), ("later", 60.0, 60.5)]);

        let segments = segment_transcript("early later", &words, &items);
        assert_eq!(segments[0].end_seconds, Some(50.0));
        assert_eq!(segments[0].text, "early");
        assert_eq!(segments[1].text, "later");
    }

    #[test]
    fn no_agenda_items_yields_one_synthetic_segment() {
        let words = stamps(&[("hello", 0.0, 0.5)]);
        let segments = segment_transcript("hello there", &words, &[]);

        assert_eq!(segments.len(), 1);
        assert!(segments[0].agenda_item_id.is_none());
        assert_eq!(segments[0].text, "hello there");
        assert_eq!(segments[0].word_count, 2);
        assert_eq!(segments[0].end_seconds, None);
    }

    #[test]
    fn proportional_split_when_no_word_timing() {
        let items = vec![
            item(1, 0.0, Some(300.0), "First Half"),
            item(2, 300.0, Some(600.0), "Second Half"),
        ];
        let text = (0..100).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ");

        let segments = segment_transcript(&text, &[], &items);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].word_count, 50);
        assert_eq!(segments[1].word_count, 50);
    }

    #[test]
    fn proportional_remainder_spills_into_last_item() {
        let items = vec![
            item(1, 0.0, Some(400.0), "Long"),
            item(2, 400.0, Some(600.0), "Short"),
        ];
        let text = (0..10).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ");

        let segments = segment_transcript(&text, &[], &items);
        let total: usize = segments.iter().map(|s| s.word_count).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn segmentation_is_deterministic() {
        let items = vec![item(1, 0.0, Some(10.0), "A"), item(2, 10.0, None, "B")];
        let words = stamps(&[("x", 0.0, 0.2), ("y", 11.0, 11.2)]);

        let first = segment_transcript("x y", &words, &items);
        let second = segment_transcript("x y", &words, &items);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn empty_text_without_timing_produces_no_segments() {
        let items = vec![item(1, 0.0, Some(10.0), "A")];
        assert!(segment_transcript("", &[], &items).is_empty());
    }
}
