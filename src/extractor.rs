#![forbid(unsafe_code)]

//! Thin client around the yt-dlp binary.
//!
//! Every interaction with SoundCloud goes through here: metadata queries buffer
//! stdout and parse it as JSON, downloads write straight to disk, and single
//! track streaming pipes the subprocess stdout into the HTTP response. The
//! client is constructed once at startup and injected into whatever needs it;
//! there is no process-global instance.

use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::timeout;

/// Hard wall-clock ceiling for a single download invocation. SoundCloud
/// transcoding stalls have been observed to hang yt-dlp indefinitely.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Failure modes of one yt-dlp invocation. The orchestrator classifies
/// `Exit` stderr text per track; everything else is surfaced as-is.
#[derive(Debug, thiserror::Error)]
pub enum ExtractorError {
    #[error("could not launch {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("yt-dlp exited with {status}: {stderr}")]
    Exit { status: ExitStatus, stderr: String },
    #[error("yt-dlp returned malformed JSON: {source}")]
    MalformedOutput {
        #[source]
        source: serde_json::Error,
    },
    #[error("yt-dlp timed out after {0:?}")]
    Timeout(Duration),
}

/// How a metadata query flattens playlists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlatExtraction {
    /// `--flat-playlist`: one entry per track, no per-track resolution.
    Playlist,
    /// `--extract-flat in_playlist`: alternate spelling some yt-dlp versions
    /// need before they emit an `entries` array for SoundCloud sets.
    InPlaylist,
}

/// Options for `dump_json`. Warnings are always suppressed.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataFlags {
    pub flat: Option<FlatExtraction>,
    pub no_check_certificates: bool,
}

#[derive(Debug, Clone)]
pub struct ExtractorClient {
    binary: PathBuf,
    download_timeout: Duration,
}

impl ExtractorClient {
    pub fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            download_timeout: DOWNLOAD_TIMEOUT,
        }
    }

    /// Shortened timeout for tests; production code sticks with the default.
    pub fn with_download_timeout(mut self, download_timeout: Duration) -> Self {
        self.download_timeout = download_timeout;
        self
    }

    /// Resolves the binary to use: an explicitly configured path wins,
    /// otherwise `yt-dlp` is expected on PATH. Either way the binary must
    /// answer `--version` so a misconfiguration fails at startup rather than
    /// on the first request.
    pub fn locate(explicit: Option<PathBuf>) -> anyhow::Result<Self> {
        let binary = explicit.unwrap_or_else(|| PathBuf::from("yt-dlp"));
        let status = std::process::Command::new(&binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(status) if status.success() => Ok(Self::new(binary)),
            Ok(status) => anyhow::bail!(
                "{} is present but `--version` failed with {status}",
                binary.display()
            ),
            Err(err) => anyhow::bail!(
                "{} is not installed or not executable: {err}",
                binary.display()
            ),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    fn spawn_error(&self, source: io::Error) -> ExtractorError {
        ExtractorError::Spawn {
            binary: self.binary.clone(),
            source,
        }
    }

    /// Runs a `--dump-single-json` metadata query and parses the buffered
    /// stdout. A parse failure on a clean exit is reported separately from a
    /// non-zero exit so callers can tell a broken tool from a broken track.
    pub async fn dump_json(
        &self,
        url: &str,
        flags: &MetadataFlags,
    ) -> Result<Value, ExtractorError> {
        let mut command = self.command();
        command.arg("--dump-single-json").arg("--no-warnings");
        match flags.flat {
            Some(FlatExtraction::Playlist) => {
                command.arg("--flat-playlist");
            }
            Some(FlatExtraction::InPlaylist) => {
                command.arg("--extract-flat").arg("in_playlist");
            }
            None => {}
        }
        if flags.no_check_certificates {
            command.arg("--no-check-certificates");
        }
        command.arg(url);

        let output = command
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| self.spawn_error(err))?;

        if !output.status.success() {
            return Err(ExtractorError::Exit {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|source| ExtractorError::MalformedOutput { source })
    }

    /// Downloads one track as mp3 to the given `<name>.%(ext)s` template.
    /// Single-item mode: the binary never recurses into a nested playlist and
    /// writes no info-json/description/thumbnail side files. Enforces the
    /// wall-clock timeout; on expiry the subprocess is killed.
    pub async fn download_audio(
        &self,
        url: &str,
        output_template: &Path,
    ) -> Result<(), ExtractorError> {
        let mut command = self.command();
        command
            .arg("--extract-audio")
            .arg("--audio-format")
            .arg("mp3")
            .arg("--audio-quality")
            .arg("0")
            .arg("--no-playlist")
            .arg("--no-write-info-json")
            .arg("--no-write-description")
            .arg("--no-write-thumbnail")
            .arg("--no-warnings")
            .arg("--output")
            .arg(output_template)
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|err| self.spawn_error(err))?;

        // wait_with_output owns the child, so when the timeout drops the
        // future the kill_on_drop flag reaps the subprocess.
        let output = match timeout(self.download_timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|err| self.spawn_error(err))?,
            Err(_) => return Err(ExtractorError::Timeout(self.download_timeout)),
        };

        if output.status.success() {
            Ok(())
        } else {
            Err(ExtractorError::Exit {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }

    /// Spawns a download that writes mp3 bytes to stdout, for piping straight
    /// into an HTTP response. Dropping the returned stream kills the
    /// subprocess, which is exactly what a client disconnect should do.
    pub fn stream_audio(&self, url: &str) -> Result<AudioStream, ExtractorError> {
        let mut command = self.command();
        command
            .arg("--extract-audio")
            .arg("--audio-format")
            .arg("mp3")
            .arg("--audio-quality")
            .arg("0")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--output")
            .arg("-")
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|err| self.spawn_error(err))?;
        let stdout = child.stdout.take().ok_or_else(|| {
            self.spawn_error(io::Error::other("child stdout was not captured"))
        })?;

        Ok(AudioStream {
            _child: child,
            stdout,
        })
    }
}

/// A live yt-dlp process plus its stdout. Holding the child alongside the
/// pipe ties the process lifetime to the consuming body stream.
pub struct AudioStream {
    _child: Child,
    stdout: ChildStdout,
}

impl AsyncRead for AudioStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn write_stub(dir: &TempDir, script: &str) -> PathBuf {
        let path = dir.path().join("yt-dlp-stub");
        fs::write(&path, script).unwrap();
        #[cfg(unix)]
        {
            let mut perms = fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms).unwrap();
        }
        path
    }

    #[tokio::test]
    async fn dump_json_parses_clean_output() {
        let dir = TempDir::new().unwrap();
        let stub = write_stub(
            &dir,
            "#!/bin/sh\nprintf '{\"title\": \"Night Drive\", \"uploader\": \"dj\"}'\n",
        );
        let client = ExtractorClient::new(stub);

        let value = client
            .dump_json("https://soundcloud.com/dj/night-drive", &MetadataFlags::default())
            .await
            .unwrap();
        assert_eq!(value["title"], "Night Drive");
    }

    #[tokio::test]
    async fn dump_json_reports_exit_with_stderr() {
        let dir = TempDir::new().unwrap();
        let stub = write_stub(
            &dir,
            "#!/bin/sh\necho 'ERROR: This track is Private' >&2\nexit 1\n",
        );
        let client = ExtractorClient::new(stub);

        let err = client
            .dump_json("https://soundcloud.com/x/y", &MetadataFlags::default())
            .await
            .unwrap_err();
        match err {
            ExtractorError::Exit { stderr, .. } => assert!(stderr.contains("Private")),
            other => panic!("expected Exit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dump_json_distinguishes_malformed_output() {
        let dir = TempDir::new().unwrap();
        let stub = write_stub(&dir, "#!/bin/sh\nprintf 'not json at all'\n");
        let client = ExtractorClient::new(stub);

        let err = client
            .dump_json("https://soundcloud.com/x/y", &MetadataFlags::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractorError::MalformedOutput { .. }));
    }

    #[tokio::test]
    async fn dump_json_failed_spawn_is_a_spawn_error() {
        let client = ExtractorClient::new(PathBuf::from("/nonexistent/yt-dlp"));
        let err = client
            .dump_json("https://soundcloud.com/x/y", &MetadataFlags::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractorError::Spawn { .. }));
    }

    #[tokio::test]
    async fn download_audio_writes_to_the_template() {
        let dir = TempDir::new().unwrap();
        // Mimics yt-dlp by substituting the extension placeholder itself.
        let stub = write_stub(
            &dir,
            r#"#!/bin/bash
out=""
while [[ $# -gt 1 ]]; do
  if [[ "$1" == "--output" ]]; then out="$2"; shift; fi
  shift
done
target="${out//%(ext)s/mp3}"
echo "audio" > "$target"
"#,
        );
        let client = ExtractorClient::new(stub);
        let template = dir.path().join("song.%(ext)s");

        client
            .download_audio("https://soundcloud.com/x/y", &template)
            .await
            .unwrap();
        assert!(dir.path().join("song.mp3").exists());
    }

    #[tokio::test]
    async fn download_audio_times_out_and_kills() {
        let dir = TempDir::new().unwrap();
        let stub = write_stub(&dir, "#!/bin/sh\nsleep 5\n");
        let client = ExtractorClient::new(stub)
            .with_download_timeout(Duration::from_millis(100));

        let err = client
            .download_audio("https://soundcloud.com/x/y", Path::new("/tmp/unused.%(ext)s"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractorError::Timeout(_)));
    }

    #[tokio::test]
    async fn stream_audio_yields_stdout_bytes() {
        let dir = TempDir::new().unwrap();
        let stub = write_stub(&dir, "#!/bin/sh\nprintf 'ID3fakeaudio'\n");
        let client = ExtractorClient::new(stub);

        let mut stream = client.stream_audio("https://soundcloud.com/x/y").unwrap();
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes).await.unwrap();
        assert_eq!(bytes, b"ID3fakeaudio");
    }
}
