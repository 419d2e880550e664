use std::fmt::Display;
use std::path::PathBuf;

fn env_override<T: std::str::FromStr>(env_key: &str, current: T) -> T
where
    T::Err: Display,
{
    let Ok(raw) = std::env::var(env_key) else {
        return current;
    };
    match serde_plain::from_str(&raw) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(found = raw, env_key, "could not parse env override: {e}");
            current
        }
    }
}

fn env_override_opt<T: std::str::FromStr>(env_key: &str, current: Option<T>) -> Option<T>
where
    T::Err: Display,
{
    let Ok(raw) = std::env::var(env_key) else {
        return current;
    };
    match serde_plain::from_str::<T>(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(found = raw, env_key, "could not parse env override: {e}");
            current
        }
    }
}

#[derive(Debug)]
pub enum ValidationError {
    SegmentDurationZero,
    MaxConcurrentTasksZero,
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::SegmentDurationZero => write!(f, "segment_duration must be >= 1"),
            ValidationError::MaxConcurrentTasksZero => {
                write!(f, "max_concurrent_tasks must be >= 1")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Static, validated transcoding parameters. Every field can be overridden from
/// the environment as `TRANSCODE_<UPPER_SNAKE_FIELD>`.
#[derive(Debug, Clone)]
pub struct Config {
    pub segment_duration: u32,
    pub seek_tolerance: u32,
    pub gap_threshold: u64,

    pub use_hwaccel: bool,
    pub video_encoder: String,
    pub video_encoder_sw: String,
    pub audio_encoder: String,

    pub video_bitrate: Option<String>,
    pub maxrate: Option<String>,
    pub bufsize: Option<String>,
    pub gop_size: u32,

    pub audio_bitrate: Option<String>,
    pub audio_channels: Option<u32>,
    pub audio_sample_rate: Option<u32>,

    pub loglevel: String,
    pub qsv_preset: String,
    pub x264_preset: String,

    pub max_concurrent_tasks: usize,
    pub task_timeout: u64,
    pub cleanup_interval: u64,
    pub probe_timeout: u64,

    pub work_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            segment_duration: 3,
            seek_tolerance: 24,
            gap_threshold: 10,

            use_hwaccel: true,
            video_encoder: "h264_qsv".to_string(),
            video_encoder_sw: "libx264".to_string(),
            audio_encoder: "aac".to_string(),

            video_bitrate: None,
            maxrate: None,
            bufsize: None,
            gop_size: 60,

            audio_bitrate: None,
            audio_channels: None,
            audio_sample_rate: None,

            loglevel: "warning".to_string(),
            qsv_preset: "7".to_string(),
            x264_preset: "medium".to_string(),

            max_concurrent_tasks: 2,
            task_timeout: 3600,
            cleanup_interval: 300,
            probe_timeout: 30,

            work_dir: PathBuf::from("data/transcode"),
        }
    }
}

impl Config {
    /// Bootstrap timeout for tasks that never reach `started_at`, independent of
    /// `task_timeout`.
    pub const BOOTSTRAP_TIMEOUT_SECS: u64 = 300;

    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            segment_duration: env_override("TRANSCODE_SEGMENT_DURATION", d.segment_duration),
            seek_tolerance: env_override("TRANSCODE_SEEK_TOLERANCE", d.seek_tolerance),
            gap_threshold: env_override("TRANSCODE_GAP_THRESHOLD", d.gap_threshold),

            use_hwaccel: env_override("TRANSCODE_USE_HWACCEL", d.use_hwaccel),
            video_encoder: env_override("TRANSCODE_VIDEO_ENCODER", d.video_encoder),
            video_encoder_sw: env_override("TRANSCODE_VIDEO_ENCODER_SW", d.video_encoder_sw),
            audio_encoder: env_override("TRANSCODE_AUDIO_ENCODER", d.audio_encoder),

            video_bitrate: env_override_opt("TRANSCODE_VIDEO_BITRATE", d.video_bitrate),
            maxrate: env_override_opt("TRANSCODE_MAXRATE", d.maxrate),
            bufsize: env_override_opt("TRANSCODE_BUFSIZE", d.bufsize),
            gop_size: env_override("TRANSCODE_GOP_SIZE", d.gop_size),

            audio_bitrate: env_override_opt("TRANSCODE_AUDIO_BITRATE", d.audio_bitrate),
            audio_channels: env_override_opt("TRANSCODE_AUDIO_CHANNELS", d.audio_channels),
            audio_sample_rate: env_override_opt(
                "TRANSCODE_AUDIO_SAMPLE_RATE",
                d.audio_sample_rate,
            ),

            loglevel: env_override("TRANSCODE_LOGLEVEL", d.loglevel),
            qsv_preset: env_override("TRANSCODE_QSV_PRESET", d.qsv_preset),
            x264_preset: env_override("TRANSCODE_X264_PRESET", d.x264_preset),

            max_concurrent_tasks: env_override(
                "TRANSCODE_MAX_CONCURRENT_TASKS",
                d.max_concurrent_tasks,
            ),
            task_timeout: env_override("TRANSCODE_TASK_TIMEOUT", d.task_timeout),
            cleanup_interval: env_override("TRANSCODE_CLEANUP_INTERVAL", d.cleanup_interval),
            probe_timeout: env_override("TRANSCODE_PROBE_TIMEOUT", d.probe_timeout),

            work_dir: env_override("TRANSCODE_WORK_DIR", d.work_dir.display().to_string())
                .into(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.segment_duration == 0 {
            return Err(ValidationError::SegmentDurationZero);
        }
        if self.max_concurrent_tasks == 0 {
            return Err(ValidationError::MaxConcurrentTasksZero);
        }
        Ok(())
    }

    pub fn effective_video_encoder(&self, use_hwaccel: bool) -> &str {
        if use_hwaccel {
            &self.video_encoder
        } else {
            &self.video_encoder_sw
        }
    }

    pub fn output_dir(&self, content_key: &str) -> PathBuf {
        self.work_dir.join(content_key)
    }

    pub fn segment_path(&self, content_key: &str, segment_id: u64) -> PathBuf {
        self.output_dir(content_key)
            .join(format!("segment{segment_id}.ts"))
    }

    pub fn segment_pattern(&self, content_key: &str) -> PathBuf {
        self.output_dir(content_key).join("segment%d.ts")
    }

    pub fn internal_playlist_path(&self, content_key: &str) -> PathBuf {
        self.output_dir(content_key).join("internal.m3u8")
    }

    pub fn transcode_log_path(&self, content_key: &str) -> PathBuf {
        self.output_dir(content_key).join("transcode.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_zero_segment_duration() {
        let mut cfg = Config::default();
        cfg.segment_duration = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ValidationError::SegmentDurationZero)
        ));
    }

    #[test]
    fn segment_path_is_scoped_per_content_key() {
        let cfg = Config::default();
        let path = cfg.segment_path("abc123", 5);
        assert_eq!(path, cfg.work_dir.join("abc123").join("segment5.ts"));
    }
}
