#![forbid(unsafe_code)]

//! Resolves a SoundCloud playlist or track URL into a normalized track list.
//!
//! SoundCloud sets come back from a flat extraction with bare stream URLs and
//! often without titles. When that happens (and the set is small enough) every
//! track is re-resolved with a per-track metadata query, fanned out through
//! the `Limiter` under a single aggregate time budget. Failed lookups keep
//! their placeholder title; only a failed playlist dump is fatal.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::extractor::{ExtractorClient, FlatExtraction, MetadataFlags};
use crate::limiter::Limiter;

/// Sets larger than this never get per-track enrichment.
pub const ENRICHMENT_TRACK_CEILING: usize = 50;
/// Absolute cap on per-track lookups in one enrichment pass.
const ENRICHMENT_HARD_CAP: usize = 60;
/// Parallel metadata lookups; downloads stay sequential, metadata does not.
const ENRICHMENT_CONCURRENCY: usize = 6;
/// Shared wall-clock budget for the whole enrichment pass, not per call.
const ENRICHMENT_BUDGET: Duration = Duration::from_secs(3 * 60);

/// One playable item. Immutable once handed to the download orchestrator.
/// Only `title` and `url` are required when a client echoes tracks back in a
/// download request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default = "unknown_uploader")]
    pub uploader: String,
    #[serde(default)]
    pub duration: Option<f64>,
    pub url: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
}

fn unknown_uploader() -> String {
    "Unknown".to_string()
}

/// Response payload for `/api/playlist-info`.
#[derive(Debug, Clone, Serialize)]
pub struct PlaylistInfo {
    pub title: String,
    pub uploader: String,
    pub tracks: Vec<Track>,
    pub playlist_count: usize,
}

/// Subset of a flat `--dump-single-json` playlist payload.
#[derive(Debug, Deserialize)]
struct RawPlaylist {
    title: Option<String>,
    playlist_title: Option<String>,
    uploader: Option<String>,
    playlist_uploader: Option<String>,
    playlist_count: Option<usize>,
    entries: Option<Vec<RawEntry>>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    id: Option<String>,
    ie_key: Option<String>,
    title: Option<String>,
    uploader: Option<String>,
    uploader_id: Option<String>,
    duration: Option<f64>,
    url: Option<String>,
    webpage_url: Option<String>,
    original_url: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<RawThumbnail>,
}

#[derive(Debug, Deserialize)]
struct RawThumbnail {
    url: Option<String>,
}

/// Subset of a single-track `--dump-single-json` payload.
#[derive(Debug, Deserialize)]
struct RawTrackInfo {
    id: Option<String>,
    title: Option<String>,
    uploader: Option<String>,
    duration: Option<f64>,
    webpage_url: Option<String>,
    thumbnail: Option<String>,
}

impl RawEntry {
    /// Flat entries without any usable URL cannot be downloaded and are
    /// dropped; every other field has a fallback.
    fn into_track(self, index: usize, playlist_uploader: Option<&str>) -> Option<Track> {
        let url = self
            .url
            .or(self.webpage_url)
            .or(self.original_url)
            .filter(|url| !url.trim().is_empty())?;

        let id = self
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("{}_{index}", self.ie_key.as_deref().unwrap_or("track")));

        let title = self
            .title
            .filter(|title| !title.trim().is_empty())
            .unwrap_or_else(|| placeholder_title(index));

        let uploader = self
            .uploader
            .or(self.uploader_id)
            .or_else(|| playlist_uploader.map(str::to_string))
            .unwrap_or_else(unknown_uploader);

        let thumbnail = self
            .thumbnail
            .or_else(|| self.thumbnails.into_iter().find_map(|thumb| thumb.url));

        Some(Track {
            id,
            title,
            uploader,
            duration: self.duration,
            url,
            thumbnail,
        })
    }
}

fn placeholder_title(index: usize) -> String {
    format!("Track {}", index + 1)
}

/// A flat extraction leaves titles as `Track N`; anything matching that shape
/// is treated as unresolved.
pub fn is_placeholder_title(title: &str) -> bool {
    title.starts_with("Track ")
}

pub struct PlaylistResolver {
    client: Arc<ExtractorClient>,
    limiter: Limiter,
    enrichment_budget: Duration,
}

impl PlaylistResolver {
    pub fn new(client: Arc<ExtractorClient>) -> Self {
        Self {
            client,
            limiter: Limiter::new(ENRICHMENT_CONCURRENCY),
            enrichment_budget: ENRICHMENT_BUDGET,
        }
    }

    /// Shortened budget for tests; production keeps the default.
    pub fn with_enrichment_budget(mut self, enrichment_budget: Duration) -> Self {
        self.enrichment_budget = enrichment_budget;
        self
    }

    /// Resolves a URL to a normalized track list. A URL containing the
    /// `/sets/` marker is a playlist, anything else is a single track.
    pub async fn resolve(&self, url: &str) -> Result<PlaylistInfo> {
        if url.contains("/sets/") {
            self.resolve_playlist(url).await
        } else {
            self.resolve_single(url).await
        }
    }

    async fn resolve_playlist(&self, url: &str) -> Result<PlaylistInfo> {
        let flags = MetadataFlags {
            flat: Some(FlatExtraction::Playlist),
            no_check_certificates: false,
        };
        let mut raw = self.dump_playlist(url, &flags).await?;

        // Some yt-dlp versions only emit an entries array for SoundCloud sets
        // with the alternate flat-extraction spelling.
        if raw.entries.is_none() {
            println!("Trying alternative playlist extraction method...");
            let flags = MetadataFlags {
                flat: Some(FlatExtraction::InPlaylist),
                no_check_certificates: true,
            };
            raw = self.dump_playlist(url, &flags).await?;
        }

        let entries = raw.entries.take().context("no track information found")?;

        let playlist_uploader = raw
            .uploader
            .clone()
            .or_else(|| raw.playlist_uploader.clone());
        let mut tracks: Vec<Track> = entries
            .into_iter()
            .enumerate()
            .filter_map(|(index, entry)| entry.into_track(index, playlist_uploader.as_deref()))
            .collect();

        let needs_details = tracks.iter().any(|track| is_placeholder_title(&track.title));
        if needs_details && tracks.len() <= ENRICHMENT_TRACK_CEILING {
            println!(
                "Fetching detailed track information for {} tracks...",
                tracks.len()
            );
            self.enrich_tracks(&mut tracks).await;
        }

        let playlist_count = raw.playlist_count.unwrap_or(tracks.len());
        Ok(PlaylistInfo {
            title: raw
                .title
                .or(raw.playlist_title)
                .unwrap_or_else(|| "SoundCloud Playlist".to_string()),
            uploader: playlist_uploader.unwrap_or_else(unknown_uploader),
            tracks,
            playlist_count,
        })
    }

    async fn resolve_single(&self, url: &str) -> Result<PlaylistInfo> {
        let flags = MetadataFlags {
            flat: None,
            no_check_certificates: true,
        };
        let value = self
            .client
            .dump_json(url, &flags)
            .await
            .with_context(|| format!("fetching track info for {url}"))?;
        let info: RawTrackInfo =
            serde_json::from_value(value).context("deserializing track info")?;

        let title = info
            .title
            .filter(|title| !title.trim().is_empty())
            .context("no track information found")?;
        let uploader = info.uploader.unwrap_or_else(unknown_uploader);

        Ok(PlaylistInfo {
            title: format!("Single Track: {title}"),
            uploader: uploader.clone(),
            tracks: vec![Track {
                id: info.id.unwrap_or_default(),
                title,
                uploader,
                duration: info.duration,
                url: info.webpage_url.unwrap_or_else(|| url.to_string()),
                thumbnail: info.thumbnail,
            }],
            playlist_count: 1,
        })
    }

    async fn dump_playlist(&self, url: &str, flags: &MetadataFlags) -> Result<RawPlaylist> {
        let value = self
            .client
            .dump_json(url, flags)
            .await
            .with_context(|| format!("fetching playlist info for {url}"))?;
        serde_json::from_value(value).context("deserializing playlist info")
    }

    /// Re-resolves every track in parallel to replace placeholder titles.
    /// Best effort: lookups that fail or run past the shared budget leave the
    /// original track untouched.
    async fn enrich_tracks(&self, tracks: &mut [Track]) {
        let mut lookups = JoinSet::new();
        for (index, track) in tracks.iter().enumerate().take(ENRICHMENT_HARD_CAP) {
            let client = self.client.clone();
            let limiter = self.limiter.clone();
            let url = track.url.clone();
            lookups.spawn(async move {
                let flags = MetadataFlags {
                    flat: None,
                    no_check_certificates: true,
                };
                let result = limiter.run(client.dump_json(&url, &flags)).await;
                (index, result)
            });
        }

        let drained = timeout(self.enrichment_budget, async {
            while let Some(joined) = lookups.join_next().await {
                let Ok((index, result)) = joined else {
                    continue;
                };
                match result {
                    Ok(value) => {
                        if let Ok(details) = serde_json::from_value::<RawTrackInfo>(value) {
                            apply_details(&mut tracks[index], details);
                        }
                    }
                    Err(err) => {
                        eprintln!(
                            "  Warning: detail lookup failed for track {}: {err}",
                            index + 1
                        );
                    }
                }
            }
        })
        .await;

        if drained.is_err() {
            eprintln!("Warning: track detail enrichment exceeded its time budget");
            lookups.abort_all();
        }
    }
}

fn apply_details(track: &mut Track, details: RawTrackInfo) {
    if let Some(title) = details.title.filter(|title| !title.trim().is_empty()) {
        track.title = title;
    }
    if let Some(uploader) = details.uploader {
        track.uploader = uploader;
    }
    if details.duration.is_some() {
        track.duration = details.duration;
    }
    if details.thumbnail.is_some() {
        track.thumbnail = details.thumbnail;
    }
}
