/*
 * Council Analyzer CLI - Meeting Discovery
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
use chrono::NaiveDate;
use indicatif::{ProgressBar, ProgressStyle};
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::capabilities::ClipFetcher;
use crate::config::Config;
use crate::ledger::{Ledger, NewAgendaItem};
use crate::types::{EventStatus, MeetingType, Stage};
use crate::utils::{parse_meeting_date, parse_meeting_type};

/// Metadata extracted from one clip page.
#[derive(Debug, Clone)]
pub struct MeetingMetadata {
    pub clip_id: i64,
    pub title: String,
    pub meeting_date: Option<NaiveDate>,
    pub meeting_type: MeetingType,
    pub video_url: Option<String>,
    pub duration_seconds: Option<i64>,
    pub agenda_items: Vec<NewAgendaItem>,
}

/// Counts reported by one discovery pass.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryStats {
    pub new: usize,
    pub existing: usize,
    pub updated: usize,
}

/// Meeting types processed unless the caller narrows the filter.
pub fn default_type_filter() -> Vec<MeetingType> {
    vec![
        MeetingType::CityCouncil,
        MeetingType::PlanningCommission,
        MeetingType::SpecialMeeting,
    ]
}

/// HTTP-backed clip fetcher against the configured player URL template.
pub struct HttpClipFetcher {
    client: Client,
    config: Config,
}

impl HttpClipFetcher {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_sec.max(1)))
            .build()
            .context("Failed to create HTTP client for discovery")?;

        Ok(Self {
            client,
            config: config.clone(),
        })
    }
}

#[async_trait]
impl ClipFetcher for HttpClipFetcher {
    async fn fetch_clip_page(&self, clip_id: i64) -> Result<Option<String>> {
        let url = self.config.clip_url(clip_id);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("request error for clip {}", clip_id))?;

        match response.status().as_u16() {
            200 => {
                let body = response
                    .text()
                    .await
                    .with_context(|| format!("failed to read clip page {}", clip_id))?;
                Ok(Some(body))
            }
            404 => Ok(None),
            other => Err(anyhow::anyhow!("clip {}: HTTP {}", clip_id, other)),
        }
    }
}

lazy_static! {
    static ref TITLE_RE: Regex = Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap();
    static ref SOURCE_TAG_RE: Regex = Regex::new(r"(?is)<source\b[^>]*>").unwrap();
    static ref SRC_ATTR_RE: Regex = Regex::new(r#"(?i)src\s*=\s*["']([^"']+)["']"#).unwrap();
    static ref VIDEO_URL_RE: Regex =
        Regex::new(r#"video_url\s*=\s*["']([^"']+)["']"#).unwrap();
    static ref DURATION_RE: Regex = Regex::new(r#"(?i)duration["\s:]+(\d+)"#).unwrap();
    static ref INDEX_POINT_RE: Regex =
        Regex::new(r#"(?is)<div\b[^>]*class\s*=\s*["'][^"']*index-point[^"']*["'][^>]*>(.*?)</div>"#)
            .unwrap();
    static ref TIME_ATTR_RE: Regex = Regex::new(r#"(?i)\btime\s*=\s*["'](\d+)["']"#).unwrap();
    static ref DATA_ID_RE: Regex = Regex::new(r#"(?i)\bdata-id\s*=\s*["'](\d+)["']"#).unwrap();
    static ref ITEM_NUMBER_RE: Regex = Regex::new(r"^(\d+\.?\d*\.?)\s*").unwrap();
    static ref TAG_RE: Regex = Regex::new(r"(?s)<[^>]+>").unwrap();
}

fn strip_tags(html: &str) -> String {
    TAG_RE.replace_all(html, " ").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parse a clip page into meeting metadata. Returns `None` for pages that
/// do not describe a meeting.
pub fn parse_clip_page(html: &str, clip_id: i64) -> Option<MeetingMetadata> {
    let title = TITLE_RE
        .captures(html)
        .map(|caps| strip_tags(&caps[1]).trim().to_string())?;

    if title.is_empty() {
        return None;
    }
    // Vendor landing pages carry the platform name without a city reference.
    let title_lower = title.to_lowercase();
    if title_lower.contains("granicus") && !title_lower.contains("city") {
        return None;
    }

    let meeting_date = parse_meeting_date(&title);
    let meeting_type = parse_meeting_type(&title);

    // Prefer the manifest-typed source reference
    let mut video_url = None;
    for tag_match in SOURCE_TAG_RE.find_iter(html) {
        let tag = tag_match.as_str();
        if tag.to_lowercase().contains("application/x-mpegurl") {
            if let Some(caps) = SRC_ATTR_RE.captures(tag) {
                video_url = Some(caps[1].to_string());
                break;
            }
        }
    }

    // Fall back to the script-embedded variable
    if video_url.is_none() {
        video_url = VIDEO_URL_RE
            .captures(html)
            .map(|caps| caps[1].to_string());
    }

    let duration_seconds = DURATION_RE
        .captures(html)
        .and_then(|caps| caps[1].parse::<i64>().ok());

    let agenda_items = parse_agenda_anchors(html);

    Some(MeetingMetadata {
        clip_id,
        title,
        meeting_date,
        meeting_type,
        video_url,
        duration_seconds,
        agenda_items,
    })
}

/// Extract agenda index anchors. The end offset of each item derives from
/// the next anchor's start; the last item has no end offset.
fn parse_agenda_anchors(html: &str) -> Vec<NewAgendaItem> {
    struct Anchor {
        start_seconds: f64,
        anchor_id: Option<i64>,
        text: String,
    }

    let mut anchors = Vec::new();
    for caps in INDEX_POINT_RE.captures_iter(html) {
        let full_tag = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        let inner = caps.get(1).map(|m| m.as_str()).unwrap_or_default();

        let Some(time_caps) = TIME_ATTR_RE.captures(full_tag) else {
            continue;
        };
        let Ok(start_seconds) = time_caps[1].parse::<f64>() else {
            continue;
        };

        let anchor_id = DATA_ID_RE
            .captures(full_tag)
            .and_then(|caps| caps[1].parse::<i64>().ok());

        anchors.push(Anchor {
            start_seconds,
            anchor_id,
            text: strip_tags(inner).trim().to_string(),
        });
    }

    let mut items = Vec::with_capacity(anchors.len());
    for (i, anchor) in anchors.iter().enumerate() {
        let end_seconds = anchors.get(i + 1).map(|next| next.start_seconds);

        let item_number = ITEM_NUMBER_RE
            .captures(&anchor.text)
            .map(|caps| caps[1].trim_end_matches('.').to_string());

        let title: String = anchor.text.chars().take(500).collect();

        items.push(NewAgendaItem {
            item_number,
            title,
            start_seconds: anchor.start_seconds,
            end_seconds,
            presenter: None,
            anchor_id: anchor.anchor_id,
        });
    }

    items
}

/// Probe a contiguous clip ID range and upsert discovered meetings.
///
/// Individual probe failures are isolated: a transient HTTP error is logged
/// as a warning and the candidate is skipped without retry.
pub async fn run_discovery(
    fetcher: Arc<dyn ClipFetcher>,
    ledger: &Ledger,
    start_id: i64,
    end_id: i64,
    filter_types: &[MeetingType],
    concurrency: usize,
) -> Result<DiscoveryStats> {
    let total = (end_id - start_id + 1).max(0) as u64;
    tracing::info!("Starting discovery for clips {} to {}", start_id, end_id);

    let progress = ProgressBar::new(total);
    progress.set_style(
        ProgressStyle::with_template("{msg} [{bar:40.cyan/blue}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    progress.set_message("Discovering clips");

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = Vec::new();

    for clip_id in start_id..=end_id {
        let fetcher = Arc::clone(&fetcher);
        let semaphore = Arc::clone(&semaphore);
        let progress = progress.clone();

        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok()?;
            let result = fetcher.fetch_clip_page(clip_id).await;
            progress.inc(1);

            match result {
                Ok(Some(html)) => parse_clip_page(&html, clip_id),
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!("Discovery probe failed for clip {}: {}", clip_id, e);
                    None
                }
            }
        }));
    }

    let mut discovered = Vec::new();
    for task in tasks {
        if let Ok(Some(metadata)) = task.await {
            discovered.push(metadata);
        }
    }
    progress.finish_and_clear();

    tracing::info!("Discovered {} candidate meetings", discovered.len());
    save_discovered_meetings(ledger, &discovered, filter_types).await
}

/// Persist discovered meetings. Re-running is idempotent: existing rows are
/// untouched except to backfill a missing stream URL.
pub async fn save_discovered_meetings(
    ledger: &Ledger,
    meetings: &[MeetingMetadata],
    filter_types: &[MeetingType],
) -> Result<DiscoveryStats> {
    let mut stats = DiscoveryStats::default();

    for metadata in meetings {
        if !filter_types.is_empty() && !filter_types.contains(&metadata.meeting_type) {
            continue;
        }

        match ledger.get_meeting(metadata.clip_id).await? {
            Some(existing) => {
                stats.existing += 1;
                if existing.video_url.is_none() {
                    if let Some(url) = &metadata.video_url {
                        ledger.update_video_url(metadata.clip_id, url).await?;
                        stats.updated += 1;
                    }
                }
            }
            None => {
                let inserted = ledger
                    .insert_meeting(
                        metadata.clip_id,
                        &metadata.title,
                        metadata.meeting_date,
                        metadata.meeting_type,
                        metadata.video_url.as_deref(),
                        metadata.duration_seconds,
                    )
                    .await?;

                if inserted {
                    stats.new += 1;

                    if !metadata.agenda_items.is_empty() {
                        ledger
                            .insert_agenda_items(metadata.clip_id, &metadata.agenda_items)
                            .await?;
                    }

                    ledger
                        .log_event(
                            metadata.clip_id,
                            Stage::Discovery,
                            EventStatus::Completed,
                            &format!("Discovered: {}", metadata.title),
                        )
                        .await?;
                } else {
                    // Another writer inserted between our read and write.
                    stats.existing += 1;
                }
            }
        }
    }

    Ok(stats)
}
