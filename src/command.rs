use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::config::Config;
use crate::error::TranscodeError;
use crate::probe::MediaInfo;

const LEGACY_CONTAINERS: [&str; 2] = ["avi", "asf"];
const LEGACY_CODECS: [&str; 4] = ["mpeg4", "msmpeg4v2", "msmpeg4v3", "mpeg1video"];
const LEGACY_EXTENSIONS: [&str; 3] = [".avi", ".asf", ".wmv"];

fn uses_legacy_decode(media_info: Option<&MediaInfo>, file_name: &str) -> bool {
    if let Some(info) = media_info {
        if let Some(crate::probe::VideoCodec::Other(codec)) = &info.video_codec {
            if LEGACY_CODECS.contains(&codec.to_ascii_lowercase().as_str()) {
                return true;
            }
        }
        let container = info.container.to_ascii_lowercase();
        if LEGACY_CONTAINERS.iter().any(|c| container.contains(c)) {
            return true;
        }
    }
    let lower = file_name.to_ascii_lowercase();
    LEGACY_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// The fields `build_command` needs out of a `Task`, decoupled from the full
/// struct so callers can build a command before a task exists (e.g. for dry-run
/// logging) without locking the task table.
#[derive(Debug, Clone)]
pub struct CommandInput<'a> {
    pub source_url: &'a str,
    pub request_headers: Option<&'a str>,
    pub file_name: &'a str,
    pub media_info: Option<&'a MediaInfo>,
    pub output_dir: &'a Path,
    pub seek_time: f64,
}

/// Builds the worker argv in the fixed stage order: global flags, headers,
/// input seek, hwaccel, input, video encode, audio encode, encoder preset,
/// general output flags, HLS output flags, output path.
pub fn build_command(cfg: &Config, input: &CommandInput, start_segment: u64) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    let push = |args: &mut Vec<OsString>, s: &str| args.push(OsString::from(s));

    push(&mut args, "-hide_banner");
    push(&mut args, "-loglevel");
    push(&mut args, &cfg.loglevel);

    if let Some(headers) = input.request_headers {
        push(&mut args, "-headers");
        push(&mut args, headers);
    }

    push(&mut args, "-ss");
    push(&mut args, &format!("{:.6}", input.seek_time));

    let legacy_decode = uses_legacy_decode(input.media_info, input.file_name);
    let use_hwaccel = cfg.use_hwaccel && !legacy_decode;
    let video_encoder = cfg.effective_video_encoder(use_hwaccel).to_string();
    let is_qsv = use_hwaccel && video_encoder.starts_with("h264_qsv");

    if is_qsv {
        push(&mut args, "-hwaccel");
        push(&mut args, "qsv");
        push(&mut args, "-hwaccel_output_format");
        push(&mut args, "qsv");
    }

    push(&mut args, "-i");
    push(&mut args, input.source_url);

    push(&mut args, "-c:v");
    push(&mut args, &video_encoder);

    if let Some(bitrate) = &cfg.video_bitrate {
        push(&mut args, "-b:v");
        push(&mut args, bitrate);
    }
    if let Some(maxrate) = &cfg.maxrate {
        push(&mut args, "-maxrate");
        push(&mut args, maxrate);
    }
    if let Some(bufsize) = &cfg.bufsize {
        push(&mut args, "-bufsize");
        push(&mut args, bufsize);
    }

    if is_qsv {
        push(&mut args, "-vf");
        push(&mut args, "vpp_qsv=format=nv12");
    } else {
        push(&mut args, "-sc_threshold");
        push(&mut args, "0");
        push(&mut args, "-pix_fmt");
        push(&mut args, "yuv420p");
    }

    push(&mut args, "-g");
    push(&mut args, &cfg.gop_size.to_string());
    push(&mut args, "-keyint_min");
    push(&mut args, &cfg.gop_size.to_string());

    push(&mut args, "-c:a");
    push(&mut args, &cfg.audio_encoder);
    if let Some(bitrate) = &cfg.audio_bitrate {
        push(&mut args, "-b:a");
        push(&mut args, bitrate);
    }
    if let Some(channels) = cfg.audio_channels {
        push(&mut args, "-ac");
        push(&mut args, &channels.to_string());
    }
    if let Some(rate) = cfg.audio_sample_rate {
        push(&mut args, "-ar");
        push(&mut args, &rate.to_string());
    }

    if is_qsv {
        push(&mut args, "-preset");
        push(&mut args, &cfg.qsv_preset);
    } else if video_encoder.to_ascii_lowercase().contains("x264") {
        push(&mut args, "-preset");
        push(&mut args, &cfg.x264_preset);
    }

    push(&mut args, "-map_metadata");
    push(&mut args, "-1");
    push(&mut args, "-map_chapters");
    push(&mut args, "-1");
    push(&mut args, "-threads");
    push(&mut args, "4");

    push(&mut args, "-copyts");
    push(&mut args, "-avoid_negative_ts");
    push(&mut args, "disabled");
    push(&mut args, "-max_muxing_queue_size");
    push(&mut args, "1024");
    push(&mut args, "-max_delay");
    push(&mut args, "5000000");

    push(&mut args, "-f");
    push(&mut args, "hls");
    push(&mut args, "-hls_playlist_type");
    push(&mut args, "vod");
    push(&mut args, "-hls_list_size");
    push(&mut args, "0");
    push(&mut args, "-hls_time");
    push(&mut args, &cfg.segment_duration.to_string());
    push(&mut args, "-hls_segment_type");
    push(&mut args, "mpegts");
    push(&mut args, "-start_number");
    push(&mut args, &start_segment.to_string());

    args.push(OsString::from("-hls_segment_filename"));
    args.push(input.output_dir.join("segment%d.ts").into_os_string());

    push(&mut args, "-y");
    args.push(input.output_dir.join("internal.m3u8").into_os_string());

    args
}

/// Renders an argv for logging, replacing the value following `-headers` with a
/// placeholder so request headers never land in a log file.
pub fn redact_command_line(args: &[OsString]) -> String {
    let mut out = Vec::with_capacity(args.len());
    let mut i = 0;
    while i < args.len() {
        let arg = args[i].to_string_lossy().to_string();
        out.push(arg.clone());
        if arg == "-headers" && i + 1 < args.len() {
            out.push("<headers>".to_string());
            i += 2;
            continue;
        }
        i += 1;
    }
    out.join(" ")
}

/// Spawns the worker, redirecting its stdout+stderr into `output_dir/transcode.log`.
/// `kill_on_drop` is a last-resort safety net; the graceful stop protocol in the
/// manager is what normally tears the process down.
pub async fn spawn(
    tool_path: &Path,
    args: &[OsString],
    output_dir: &Path,
) -> Result<Child, TranscodeError> {
    tokio::fs::create_dir_all(output_dir).await?;
    let log_path = output_dir.join("transcode.log");
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&log_path)?;
    let log_file_err = log_file.try_clone()?;

    let mut cmd = Command::new(tool_path);
    cmd.args(args);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::from(log_file));
    cmd.stderr(Stdio::from(log_file_err));
    cmd.kill_on_drop(true);

    tracing::debug!(
        command = %redact_command_line(args),
        "spawning transcode worker"
    );

    cmd.spawn()
        .map_err(|e| TranscodeError::spawn_failed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{MediaInfo, VideoCodec};
    use std::path::PathBuf;

    fn info(codec: VideoCodec, container: &str) -> MediaInfo {
        MediaInfo {
            duration: None,
            container: container.to_string(),
            video_codec: Some(codec),
            audio_codec: None,
            resolution: None,
        }
    }

    #[test]
    fn legacy_avi_forces_software_decode() {
        let info = info(VideoCodec::H264, "avi");
        assert!(uses_legacy_decode(Some(&info), "movie.avi"));
    }

    #[test]
    fn mp4_h264_does_not_force_legacy_decode() {
        let info = info(VideoCodec::H264, "mov,mp4,m4a,3gp,3g2,mj2");
        assert!(!uses_legacy_decode(Some(&info), "movie.mp4"));
    }

    #[test]
    fn build_command_places_start_number_and_output() {
        let cfg = Config::default();
        let out_dir = PathBuf::from("/tmp/xyz");
        let input = CommandInput {
            source_url: "https://example.com/video.mp4",
            request_headers: None,
            file_name: "movie.mp4",
            media_info: None,
            output_dir: &out_dir,
            seek_time: 12.0,
        };
        let args = build_command(&cfg, &input, 4);
        let rendered: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        let start_idx = rendered.iter().position(|a| a == "-start_number").unwrap();
        assert_eq!(rendered[start_idx + 1], "4");
        assert!(rendered.last().unwrap().ends_with("internal.m3u8"));
    }

    #[test]
    fn redacts_headers_in_log_line() {
        let args: Vec<OsString> = vec![
            "-headers".into(),
            "Authorization: secret".into(),
            "-i".into(),
            "url".into(),
        ];
        let rendered = redact_command_line(&args);
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("<headers>"));
    }
}
