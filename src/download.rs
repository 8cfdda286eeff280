#![forbid(unsafe_code)]

//! Batch download orchestrator.
//!
//! Takes a normalized track list, downloads each track via yt-dlp one at a
//! time, verifies the artifact on disk, and streams human-readable progress
//! lines plus a machine-parsable issues payload back to the caller.
//!
//! Downloads are strictly sequential: parallel yt-dlp invocations against
//! SoundCloud overwhelm the service and fail intermittently, so this trades
//! throughput for reliability. Metadata fan-out (see `playlist`) is the
//! parallel half of the system.

use anyhow::{Context as _, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use crate::extractor::ExtractorClient;
use crate::playlist::Track;

/// Artifacts smaller than this are treated as restricted previews rather
/// than real downloads.
pub const MIN_FULL_TRACK_BYTES: u64 = 1024 * 1024;

/// Prefix of the machine-parsable summary line; clients detect and strip it.
pub const ISSUES_PREFIX: &str = "ISSUES_DETECTED:";

const MAX_FILENAME_CHARS: usize = 255;

const DEGRADED_ISSUE: &str = "Restricted content (preview only)";
const DEGRADED_REASON: &str = "Region restriction, authentication required, or private track";
const MISSING_ARTIFACT_ISSUE: &str = "Download failed";
const MISSING_ARTIFACT_REASON: &str = "Track not accessible or removed";

/// Result for one track. Exactly one outcome is recorded per input track,
/// in input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackOutcome {
    Success {
        path: PathBuf,
        size: u64,
    },
    /// Artifact exists but is implausibly small; kept on disk, reported as a
    /// preview-only download.
    Degraded {
        issue: &'static str,
        reason: &'static str,
    },
    Failed {
        issue: &'static str,
        reason: &'static str,
    },
}

impl TrackOutcome {
    fn issue(&self) -> Option<(&'static str, &'static str)> {
        match self {
            TrackOutcome::Success { .. } => None,
            TrackOutcome::Degraded { issue, reason } | TrackOutcome::Failed { issue, reason } => {
                Some((issue, reason))
            }
        }
    }
}

/// Entry of the `ISSUES_DETECTED` payload.
#[derive(Debug, Clone, Serialize)]
pub struct IssueReport {
    pub title: String,
    pub issue: String,
    pub reason: String,
}

/// Final result of one orchestrator run.
#[derive(Debug)]
pub struct JobSummary {
    pub total: usize,
    pub succeeded: usize,
    pub outcomes: Vec<TrackOutcome>,
}

/// Sink for progress lines over the open response.
///
/// `write_line` reports whether the peer is still connected; once it returns
/// false further writes are dropped silently. Disconnection is never an
/// error: batch jobs outlive many a browser tab.
pub trait ProgressSink: Send {
    fn write_line(&mut self, line: &str) -> bool;

    /// Resolves when the peer goes away, letting the orchestrator cancel the
    /// in-flight download instead of orphaning the subprocess. Sinks without
    /// disconnect detection pend forever.
    fn closed(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(std::future::pending())
    }
}

/// Downloads every track to `dest`, sequentially and in input order.
///
/// Per-track failures are classified and recorded, never fatal; the only
/// job-fatal condition here is a destination that cannot be created, which
/// fails before anything is streamed. Re-running on a populated directory
/// re-attempts every track; there is no skip-if-exists logic.
pub async fn run_batch(
    client: &ExtractorClient,
    tracks: &[Track],
    dest: &Path,
    sink: &mut dyn ProgressSink,
) -> Result<JobSummary> {
    fs::create_dir_all(dest)
        .with_context(|| format!("creating download directory {}", dest.display()))?;

    let total = tracks.len();
    let mut outcomes = Vec::with_capacity(total);
    let mut succeeded = 0usize;

    for (index, track) in tracks.iter().enumerate() {
        if !sink.write_line(&format!(
            "Downloading {}/{total}: {}",
            index + 1,
            track.title
        )) {
            eprintln!("Client disconnected; stopping batch after {index} of {total} tracks");
            break;
        }

        let outcome = tokio::select! {
            outcome = download_one(client, track, dest) => outcome,
            () = sink.closed() => {
                // Dropping the download future kills the yt-dlp child.
                eprintln!(
                    "Client disconnected; stopping batch after {index} of {total} tracks"
                );
                break;
            }
        };

        match &outcome {
            TrackOutcome::Success { .. } => {
                succeeded += 1;
                sink.write_line(&format!("Download completed for: {}", track.title));
            }
            TrackOutcome::Degraded { .. } => {
                sink.write_line(&format!(
                    "Download completed for: {} (preview only)",
                    track.title
                ));
            }
            TrackOutcome::Failed { .. } => {
                sink.write_line(&format!("Download failed for: {}", track.title));
            }
        }
        outcomes.push(outcome);
    }

    sink.write_line("");
    sink.write_line(&format!(
        "Download complete! {succeeded}/{total} tracks downloaded successfully."
    ));

    let issues = collect_issues(tracks, &outcomes);
    if !issues.is_empty() {
        let payload = serde_json::to_string(&issues).context("serializing issues payload")?;
        sink.write_line(&format!("{ISSUES_PREFIX}{payload}"));
    }

    Ok(JobSummary {
        total,
        succeeded,
        outcomes,
    })
}

async fn download_one(client: &ExtractorClient, track: &Track, dest: &Path) -> TrackOutcome {
    let stem = sanitize_title(&track.title);
    let template = dest.join(format!("{stem}.%(ext)s"));

    match client.download_audio(&track.url, &template).await {
        Ok(()) => classify_artifact(dest, &stem),
        Err(err) => {
            eprintln!("  Warning: download failed for {}: {err}", track.title);
            let (issue, reason) = classify_failure(&err.to_string());
            TrackOutcome::Failed { issue, reason }
        }
    }
}

/// Verifies the artifact yt-dlp claims to have written. A clean exit without
/// a matching file still counts as a failure; a suspiciously small file is a
/// preview, not a success.
fn classify_artifact(dest: &Path, stem: &str) -> TrackOutcome {
    let Some(path) = find_artifact(dest, stem) else {
        return TrackOutcome::Failed {
            issue: MISSING_ARTIFACT_ISSUE,
            reason: MISSING_ARTIFACT_REASON,
        };
    };

    match fs::metadata(&path) {
        Ok(meta) if meta.len() < MIN_FULL_TRACK_BYTES => TrackOutcome::Degraded {
            issue: DEGRADED_ISSUE,
            reason: DEGRADED_REASON,
        },
        Ok(meta) => TrackOutcome::Success {
            path,
            size: meta.len(),
        },
        Err(_) => TrackOutcome::Failed {
            issue: MISSING_ARTIFACT_ISSUE,
            reason: MISSING_ARTIFACT_REASON,
        },
    }
}

fn find_artifact(dest: &Path, stem: &str) -> Option<PathBuf> {
    let entries = fs::read_dir(dest).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with(stem) && (name.ends_with(".mp3") || name.ends_with(".m4a")) {
            return Some(entry.path());
        }
    }
    None
}

/// Best-effort mapping from yt-dlp error text to a user-facing issue.
///
/// These substrings mirror what the tool emits today; if it ever exposes
/// structured error codes this is the one place to swap them in.
pub fn classify_failure(text: &str) -> (&'static str, &'static str) {
    if text.contains("Private") {
        ("Private track", "Track is private or requires authentication")
    } else if text.contains("region") || text.contains("geo") {
        ("Region restricted", "Content not available in your region")
    } else if text.contains("removed") || text.contains("unavailable") {
        (
            "Track unavailable",
            "Track has been removed or is no longer available",
        )
    } else {
        ("Download failed", "Technical download error")
    }
}

fn collect_issues(tracks: &[Track], outcomes: &[TrackOutcome]) -> Vec<IssueReport> {
    tracks
        .iter()
        .zip(outcomes)
        .filter_map(|(track, outcome)| {
            outcome.issue().map(|(issue, reason)| IssueReport {
                title: track.title.clone(),
                issue: issue.to_string(),
                reason: reason.to_string(),
            })
        })
        .collect()
}

/// Builds a filesystem-safe filename stem from a track title: invalid
/// characters become `-`, whitespace runs collapse, length is capped.
pub fn sanitize_title(title: &str) -> String {
    let replaced: String = title
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '-',
            _ => c,
        })
        .collect();
    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(MAX_FILENAME_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    struct VecSink {
        lines: Vec<String>,
    }

    impl VecSink {
        fn new() -> Self {
            Self { lines: Vec::new() }
        }
    }

    impl ProgressSink for VecSink {
        fn write_line(&mut self, line: &str) -> bool {
            self.lines.push(line.to_string());
            true
        }
    }

    /// Pretends the peer hangs up after a fixed number of lines.
    struct DisconnectingSink {
        lines: Vec<String>,
        remaining: usize,
    }

    impl ProgressSink for DisconnectingSink {
        fn write_line(&mut self, line: &str) -> bool {
            if self.remaining == 0 {
                return false;
            }
            self.remaining -= 1;
            self.lines.push(line.to_string());
            true
        }
    }

    /// Stub yt-dlp whose behaviour is keyed on the target URL: full-size
    /// download, tiny preview, hard failures with recognizable stderr, or a
    /// clean exit that writes nothing.
    fn stub_client(dir: &TempDir) -> ExtractorClient {
        let path = dir.path().join("yt-dlp-stub");
        let script = r#"#!/bin/bash
out=""
prev=""
url=""
for a in "$@"; do
  if [[ "$prev" == "--output" ]]; then out="$a"; fi
  prev="$a"
  url="$a"
done
target="${out//%(ext)s/mp3}"
case "$url" in
  *private*) echo "ERROR: This track is Private" >&2; exit 1 ;;
  *blocked*) echo "ERROR: not available due to geo restriction" >&2; exit 1 ;;
  *gone*) echo "ERROR: this track has been removed" >&2; exit 1 ;;
  *silent*) exit 0 ;;
  *preview*) head -c 2048 /dev/zero > "$target" ;;
  *boundary*) head -c 1048576 /dev/zero > "$target" ;;
  *) head -c 1200000 /dev/zero > "$target" ;;
esac
"#;
        fs::write(&path, script).unwrap();
        #[cfg(unix)]
        {
            let mut perms = fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms).unwrap();
        }
        ExtractorClient::new(path)
    }

    fn track(title: &str, url: &str) -> Track {
        Track {
            id: String::new(),
            title: title.to_string(),
            uploader: "someone".to_string(),
            duration: None,
            url: url.to_string(),
            thumbnail: None,
        }
    }

    #[tokio::test]
    async fn mixed_batch_reports_every_outcome_in_order() {
        let dir = TempDir::new().unwrap();
        let client = stub_client(&dir);
        let dest = dir.path().join("playlist");
        let tracks = vec![
            track("Full Song", "https://soundcloud.com/a/full"),
            track("Preview Song", "https://soundcloud.com/a/preview"),
            track("Hidden Song", "https://soundcloud.com/a/private"),
            track("Ghost Song", "https://soundcloud.com/a/silent"),
        ];

        let mut sink = VecSink::new();
        let summary = run_batch(&client, &tracks, &dest, &mut sink).await.unwrap();

        assert_eq!(summary.total, 4);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.outcomes.len(), 4);
        assert!(matches!(summary.outcomes[0], TrackOutcome::Success { .. }));
        assert!(matches!(summary.outcomes[1], TrackOutcome::Degraded { .. }));
        assert!(matches!(
            summary.outcomes[2],
            TrackOutcome::Failed {
                issue: "Private track",
                ..
            }
        ));
        assert!(matches!(
            summary.outcomes[3],
            TrackOutcome::Failed {
                issue: "Download failed",
                reason: "Track not accessible or removed",
            }
        ));

        let issues_line = format!(
            "{ISSUES_PREFIX}{}",
            serde_json::to_string(&collect_issues(&tracks, &summary.outcomes)).unwrap()
        );
        assert_eq!(
            sink.lines,
            vec![
                "Downloading 1/4: Full Song",
                "Download completed for: Full Song",
                "Downloading 2/4: Preview Song",
                "Download completed for: Preview Song (preview only)",
                "Downloading 3/4: Hidden Song",
                "Download failed for: Hidden Song",
                "Downloading 4/4: Ghost Song",
                "Download failed for: Ghost Song",
                "",
                "Download complete! 1/4 tracks downloaded successfully.",
                issues_line.as_str(),
            ]
        );

        // The payload itself parses and carries one entry per non-success.
        let payload = sink.lines.last().unwrap().strip_prefix(ISSUES_PREFIX).unwrap();
        let issues: Vec<serde_json::Value> = serde_json::from_str(payload).unwrap();
        assert_eq!(issues.len(), 3);
        assert_eq!(issues[1]["issue"], "Private track");
    }

    #[tokio::test]
    async fn empty_track_list_completes_immediately() {
        let dir = TempDir::new().unwrap();
        let client = stub_client(&dir);
        let dest = dir.path().join("empty");

        let mut sink = VecSink::new();
        let summary = run_batch(&client, &[], &dest, &mut sink).await.unwrap();

        assert_eq!(summary.total, 0);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(
            sink.lines,
            vec![
                "".to_string(),
                "Download complete! 0/0 tracks downloaded successfully.".to_string(),
            ]
        );
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn artifact_at_exactly_one_mebibyte_is_a_success() {
        let dir = TempDir::new().unwrap();
        let client = stub_client(&dir);
        let dest = dir.path().join("boundary");
        let tracks = vec![track("Edge Case", "https://soundcloud.com/a/boundary")];

        let mut sink = VecSink::new();
        let summary = run_batch(&client, &tracks, &dest, &mut sink).await.unwrap();

        assert!(matches!(
            summary.outcomes[0],
            TrackOutcome::Success { size, .. } if size == MIN_FULL_TRACK_BYTES
        ));
    }

    #[tokio::test]
    async fn rerun_reattempts_every_track() {
        let dir = TempDir::new().unwrap();
        let client = stub_client(&dir);
        let dest = dir.path().join("playlist");
        let tracks = vec![track("Full Song", "https://soundcloud.com/a/full")];

        let mut first = VecSink::new();
        run_batch(&client, &tracks, &dest, &mut first).await.unwrap();
        let mut second = VecSink::new();
        let summary = run_batch(&client, &tracks, &dest, &mut second)
            .await
            .unwrap();

        // No skip-if-exists: the second run downloads again and reports the
        // same line sequence.
        assert_eq!(summary.succeeded, 1);
        assert_eq!(first.lines, second.lines);
    }

    #[tokio::test]
    async fn invalid_destination_fails_before_streaming() {
        let dir = TempDir::new().unwrap();
        let client = stub_client(&dir);
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "file").unwrap();
        let dest = blocker.join("nested");
        let tracks = vec![track("Full Song", "https://soundcloud.com/a/full")];

        let mut sink = VecSink::new();
        let err = run_batch(&client, &tracks, &dest, &mut sink)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("creating download directory"));
        assert!(sink.lines.is_empty());
    }

    #[tokio::test]
    async fn disconnect_stops_the_batch() {
        let dir = TempDir::new().unwrap();
        let client = stub_client(&dir);
        let dest = dir.path().join("playlist");
        let tracks = vec![
            track("One", "https://soundcloud.com/a/full"),
            track("Two", "https://soundcloud.com/a/full"),
            track("Three", "https://soundcloud.com/a/full"),
        ];

        // Enough budget for the first track's two lines, then hang up.
        let mut sink = DisconnectingSink {
            lines: Vec::new(),
            remaining: 2,
        };
        let summary = run_batch(&client, &tracks, &dest, &mut sink).await.unwrap();

        assert_eq!(summary.outcomes.len(), 1);
        assert!(sink.lines.len() <= 3);
    }

    #[test]
    fn classify_failure_matches_known_markers() {
        assert_eq!(classify_failure("This track is Private").0, "Private track");
        assert_eq!(
            classify_failure("blocked in your region").0,
            "Region restricted"
        );
        assert_eq!(classify_failure("geo-blocked content").0, "Region restricted");
        assert_eq!(
            classify_failure("video has been removed").0,
            "Track unavailable"
        );
        assert_eq!(
            classify_failure("content unavailable here").0,
            "Track unavailable"
        );
        let (issue, reason) = classify_failure("something exploded");
        assert_eq!(issue, "Download failed");
        assert_eq!(reason, "Technical download error");
    }

    #[test]
    fn sanitize_title_replaces_and_caps() {
        assert_eq!(
            sanitize_title("My <Song>: a/b\\c|d?e*f\"g"),
            "My -Song-- a-b-c-d-e-f-g"
        );
        assert_eq!(sanitize_title("  spaced   out \t title "), "spaced out title");
        let long = "x".repeat(400);
        assert_eq!(sanitize_title(&long).chars().count(), 255);
    }
}
