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

use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use crate::types::MeetingType;

lazy_static! {
    static ref DATE_RE: Regex = Regex::new(r"^(\d{1,2})/(\d{1,2})/(\d{2})").unwrap();
}

/// Parse a date from a meeting title like "12/4/24 City Council".
/// Two-digit years below 50 resolve to 2000+, otherwise 1900+.
pub fn parse_meeting_date(title: &str) -> Option<NaiveDate> {
    let caps = DATE_RE.captures(title)?;
    let month: u32 = caps[1].parse().ok()?;
    let day: u32 = caps[2].parse().ok()?;
    let year_two: i32 = caps[3].parse().ok()?;

    let year = if year_two < 50 {
        2000 + year_two
    } else {
        1900 + year_two
    };

    NaiveDate::from_ymd_opt(year, month, day)
}

/// Extract the meeting type from a title. Keyword priority: special,
/// planning commission, city council, budget. Defaults to City Council.
pub fn parse_meeting_type(title: &str) -> MeetingType {
    let title_lower = title.to_lowercase();

    if title_lower.contains("special") {
        return MeetingType::SpecialMeeting;
    }
    if title_lower.contains("planning commission") {
        return MeetingType::PlanningCommission;
    }
    if title_lower.contains("city council") {
        return MeetingType::CityCouncil;
    }
    if title_lower.contains("budget") {
        return MeetingType::Budget;
    }

    MeetingType::CityCouncil
}

/// Format a duration in seconds as a human-readable string.
pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Split text into chunks of at most `max_chars`, preferring sentence
/// boundaries, falling back to word boundaries for oversized sentences.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    if text.len() <= max_chars {
        return vec![text.to_string()];
    }

    lazy_static! {
        static ref SENTENCE_RE: Regex = Regex::new(r"(?s)[^.!?]*[.!?]+\s*|[^.!?]+$").unwrap();
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for sentence_match in SENTENCE_RE.find_iter(text) {
        let sentence = sentence_match.as_str().trim();
        if sentence.is_empty() {
            continue;
        }

        if current.len() + sentence.len() + 1 <= max_chars {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(sentence);
        } else {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            if sentence.len() > max_chars {
                // Oversized sentence: split on words
                for word in sentence.split_whitespace() {
                    if current.len() + word.len() + 1 <= max_chars {
                        if !current.is_empty() {
                            current.push(' ');
                        }
                        current.push_str(word);
                    } else {
                        if !current.is_empty() {
                            chunks.push(std::mem::take(&mut current));
                        }
                        current.push_str(word);
                    }
                }
            } else {
                current.push_str(sentence);
            }
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

/// Extract the first balanced `{...}` block from an LLM response and parse
/// it. Falls back to parsing the whole response. Tolerates prose wrappers.
pub fn extract_json_object(response: &str) -> Option<Value> {
    if let Some(candidate) = first_balanced(response, '{', '}') {
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            if value.is_object() {
                return Some(value);
            }
        }
    }

    serde_json::from_str::<Value>(response.trim())
        .ok()
        .filter(Value::is_object)
}

/// Extract the first balanced `[...]` block from an LLM response and parse
/// it as a JSON array.
pub fn extract_json_array(response: &str) -> Option<Value> {
    if let Some(candidate) = first_balanced(response, '[', ']') {
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            if value.is_array() {
                return Some(value);
            }
        }
    }

    serde_json::from_str::<Value>(response.trim())
        .ok()
        .filter(Value::is_array)
}

/// Return the first substring delimited by balanced `open`/`close`
/// characters, string-literal aware.
fn first_balanced(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_date_at_start_of_title() {
        let date = parse_meeting_date("12/4/24 City Council Meeting").unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2024, 12, 4).unwrap());
    }

    #[test]
    fn two_digit_year_pivot() {
        assert_eq!(
            parse_meeting_date("1/1/00 City Council").unwrap(),
            NaiveDate::from_ymd_opt(2000, 1, 1).unwrap()
        );
        assert_eq!(
            parse_meeting_date("1/1/49 City Council").unwrap(),
            NaiveDate::from_ymd_opt(2049, 1, 1).unwrap()
        );
        assert_eq!(
            parse_meeting_date("1/1/50 City Council").unwrap(),
            NaiveDate::from_ymd_opt(1950, 1, 1).unwrap()
        );
    }

    #[test]
    fn unparseable_date_is_none() {
        assert!(parse_meeting_date("City Council Meeting").is_none());
        assert!(parse_meeting_date("13/45/24 City Council").is_none());
    }

    #[test]
    fn meeting_type_keyword_priority() {
        assert_eq!(
            parse_meeting_type("6/1/21 Special Meeting - City Council"),
            MeetingType::SpecialMeeting
        );
        assert_eq!(
            parse_meeting_type("6/1/21 Planning Commission"),
            MeetingType::PlanningCommission
        );
        assert_eq!(
            parse_meeting_type("6/1/21 City Council"),
            MeetingType::CityCouncil
        );
        assert_eq!(
            parse_meeting_type("6/1/21 Budget Session"),
            MeetingType::Budget
        );
        assert_eq!(parse_meeting_type("6/1/21 Something Else"), MeetingType::CityCouncil);
    }

    #[test]
    fn format_duration_buckets() {
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(3725), "1h 2m 5s");
    }

    #[test]
    fn chunk_text_respects_limit() {
        let text = "One sentence. Two sentence. Three sentence. Four sentence.";
        let chunks = chunk_text(text, 30);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.len() <= 30, "chunk too long: {:?}", chunk);
        }
    }

    #[test]
    fn chunk_text_short_input_is_single_chunk() {
        assert_eq!(chunk_text("short", 100), vec!["short".to_string()]);
    }

    #[test]
    fn extracts_json_object_from_prose() {
        let response = "Sure, here you go: {\"score\": 85, \"issues\": []} hope that helps";
        let value = extract_json_object(response).unwrap();
        assert_eq!(value["score"], 85);
    }

    #[test]
    fn extracts_nested_json_object() {
        let response = "{\"outer\": {\"inner\": 1}, \"note\": \"braces } in strings are fine\"}";
        let value = extract_json_object(response).unwrap();
        assert_eq!(value["outer"]["inner"], 1);
    }

    #[test]
    fn malformed_json_yields_none() {
        assert!(extract_json_object("Sure, here you go: [malformed").is_none());
    }

    #[test]
    fn extracts_json_array_from_prose() {
        let response = "Results:\n[{\"segment_index\": 0, \"speaker\": \"Brown\"}]\nDone.";
        let value = extract_json_array(response).unwrap();
        assert_eq!(value[0]["speaker"], "Brown");
    }
}
