use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;

use crate::error::TranscodeError;

#[derive(Debug, Deserialize, Clone)]
pub struct FFprobeFormat {
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub format_name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FFprobeStream {
    pub codec_type: String,
    #[serde(default)]
    pub codec_name: Option<String>,
    #[serde(default)]
    pub width: Option<i64>,
    #[serde(default)]
    pub height: Option<i64>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FFprobeOutput {
    #[serde(default)]
    pub streams: Vec<FFprobeStream>,
    pub format: FFprobeFormat,
}

impl FFprobeOutput {
    pub fn video_stream(&self) -> Option<&FFprobeStream> {
        self.streams.iter().find(|s| s.codec_type == "video")
    }

    pub fn audio_stream(&self) -> Option<&FFprobeStream> {
        self.streams.iter().find(|s| s.codec_type == "audio")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    Hevc,
    Other(String),
}

impl From<&str> for VideoCodec {
    fn from(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "h264" => Self::H264,
            "hevc" | "h265" => Self::Hevc,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioCodec {
    Aac,
    Mp3,
    Opus,
    Vorbis,
    Other(String),
}

impl From<&str> for AudioCodec {
    fn from(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "aac" => Self::Aac,
            "mp3" => Self::Mp3,
            "opus" => Self::Opus,
            "vorbis" => Self::Vorbis,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Container/codec metadata reduced from a probe run.
#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub duration: Option<Duration>,
    pub container: String,
    pub video_codec: Option<VideoCodec>,
    pub audio_codec: Option<AudioCodec>,
    pub resolution: Option<(u32, u32)>,
}

impl From<FFprobeOutput> for MediaInfo {
    fn from(out: FFprobeOutput) -> Self {
        let duration = out
            .format
            .duration
            .as_deref()
            .and_then(|d| d.parse::<f64>().ok())
            .filter(|d| *d > 0.0)
            .map(Duration::from_secs_f64);
        let video = out.video_stream();
        let video_codec = video
            .and_then(|s| s.codec_name.as_deref())
            .map(VideoCodec::from);
        let resolution = video.and_then(|s| match (s.width, s.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some((w as u32, h as u32)),
            _ => None,
        });
        let audio_codec = out
            .audio_stream()
            .and_then(|s| s.codec_name.as_deref())
            .map(AudioCodec::from);
        Self {
            duration,
            container: out.format.format_name,
            video_codec,
            audio_codec,
            resolution,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscodeReason {
    NoVideoCodec,
    UnsupportedVideoCodec(String),
    UnsupportedAudioCodec(String),
    MkvContainer,
    AviContainer,
    LegacyContainerExtension,
}

/// Decides whether a source needs transcoding rather than passthrough.
pub fn should_transcode(media_info: &MediaInfo, file_name: &str) -> Vec<TranscodeReason> {
    let mut reasons = Vec::new();

    match &media_info.video_codec {
        None => reasons.push(TranscodeReason::NoVideoCodec),
        Some(VideoCodec::H264) | Some(VideoCodec::Hevc) => {}
        Some(VideoCodec::Other(name)) => {
            reasons.push(TranscodeReason::UnsupportedVideoCodec(name.clone()))
        }
    }

    if let Some(AudioCodec::Other(name)) = &media_info.audio_codec {
        reasons.push(TranscodeReason::UnsupportedAudioCodec(name.clone()));
    }

    let format = media_info.container.to_ascii_lowercase();
    if !format.is_empty() && !format.contains("mp4") {
        if format.contains("matroska") || format.contains("mkv") {
            reasons.push(TranscodeReason::MkvContainer);
        } else if format.contains("avi") {
            reasons.push(TranscodeReason::AviContainer);
        }
    }

    let lower_name = file_name.to_ascii_lowercase();
    if [".avi", ".mkv", ".wmv", ".rmvb", ".flv"]
        .iter()
        .any(|ext| lower_name.ends_with(ext))
    {
        reasons.push(TranscodeReason::LegacyContainerExtension);
    }

    reasons
}

/// Invokes the probing tool against a (possibly remote) source and reduces its
/// output to [`MediaInfo`]. Never returns a partial/garbage result: any probe
/// failure surfaces as [`TranscodeError::ProbeFailed`] for the caller to decide
/// a fallback (e.g. a caller-supplied hint duration).
pub async fn probe(
    tool_path: &Path,
    source_url: &str,
    headers: Option<&str>,
    timeout: Duration,
) -> Result<MediaInfo, TranscodeError> {
    let mut cmd = Command::new(tool_path);
    cmd.args(["-hide_banner", "-loglevel", "error"]);
    if let Some(headers) = headers {
        cmd.arg("-headers").arg(headers);
    }
    cmd.args(["-show_format", "-show_streams", "-print_format", "json"]);
    cmd.arg(source_url);
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| TranscodeError::probe_failed(format!("probe timed out after {timeout:?}")))?
        .map_err(|e| TranscodeError::probe_failed(format!("failed to spawn probe: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(TranscodeError::probe_failed(format!(
            "probe exited with {}: {}",
            output.status, stderr
        )));
    }

    let parsed: FFprobeOutput = serde_json::from_slice(&output.stdout)
        .map_err(|e| TranscodeError::probe_failed(format!("failed to parse probe output: {e}")))?;
    Ok(parsed.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media_info(video: Option<VideoCodec>, container: &str) -> MediaInfo {
        MediaInfo {
            duration: None,
            container: container.to_string(),
            video_codec: video,
            audio_codec: None,
            resolution: None,
        }
    }

    #[test]
    fn flags_unsupported_video_codec() {
        let info = media_info(Some(VideoCodec::Other("mpeg4".into())), "mp4");
        let reasons = should_transcode(&info, "movie.mp4");
        assert!(matches!(
            reasons.as_slice(),
            [TranscodeReason::UnsupportedVideoCodec(c)] if c == "mpeg4"
        ));
    }

    #[test]
    fn h264_in_mp4_needs_no_transcode() {
        let info = media_info(Some(VideoCodec::H264), "mov,mp4,m4a,3gp,3g2,mj2");
        assert!(should_transcode(&info, "movie.mp4").is_empty());
    }

    #[test]
    fn mkv_extension_flagged_even_with_supported_codec() {
        let info = media_info(Some(VideoCodec::H264), "matroska,webm");
        let reasons = should_transcode(&info, "movie.mkv");
        assert!(reasons.contains(&TranscodeReason::MkvContainer));
        assert!(reasons.contains(&TranscodeReason::LegacyContainerExtension));
    }

    #[test]
    fn deserializes_ffprobe_json() {
        let raw = r#"{
            "streams": [
                {"codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080},
                {"codec_type": "audio", "codec_name": "aac"}
            ],
            "format": {"duration": "120.5", "format_name": "mov,mp4,m4a,3gp,3g2,mj2"}
        }"#;
        let parsed: FFprobeOutput = serde_json::from_str(raw).unwrap();
        let info: MediaInfo = parsed.into();
        assert_eq!(info.duration, Some(Duration::from_secs_f64(120.5)));
        assert_eq!(info.resolution, Some((1920, 1080)));
        assert_eq!(info.video_codec, Some(VideoCodec::H264));
    }
}
