use std::path::PathBuf;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::Config;
use crate::probe::MediaInfo;

#[derive(Debug, Clone)]
pub enum TaskStatus {
    Starting,
    Running,
    Ready,
    Completed,
    Error(String),
    Stopped(String),
}

/// A single content key's transcoding state. One task per distinct source video;
/// seeks against the same content key reuse this record and its on-disk segment
/// cache instead of spawning a parallel worker.
#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: Uuid,
    pub content_key: String,
    pub file_name: String,

    pub source_url: String,
    pub request_headers: Option<String>,

    pub probed_duration: Option<f64>,
    pub hint_duration: f64,
    pub media_info: Option<MediaInfo>,

    pub output_dir: PathBuf,
    pub segment_duration: u32,

    pub current_encode_offset: f64,
    pub status: TaskStatus,

    pub created_at: OffsetDateTime,
    pub started_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
    pub last_access_at: OffsetDateTime,
    pub access_count: u64,
}

/// Deterministic v5 UUID derived purely from the content key so repeated
/// requests for the same source always resolve to the same task (and thus the
/// same output directory / segment cache), without any shared mutable counter.
const TASK_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x3c, 0x2a, 0x7e, 0x4d, 0x9b, 0x61, 0x4a, 0x58, 0x8f, 0x0b, 0x71, 0x2d, 0x6e, 0x9a, 0x1c, 0x05,
]);

pub fn task_id_for(content_key: &str) -> Uuid {
    Uuid::new_v5(&TASK_ID_NAMESPACE, content_key.as_bytes())
}

impl Task {
    pub fn new(
        content_key: String,
        file_name: String,
        source_url: String,
        request_headers: Option<String>,
        hint_duration: f64,
        cfg: &Config,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            task_id: task_id_for(&content_key),
            output_dir: cfg.output_dir(&content_key),
            content_key,
            file_name,
            source_url,
            request_headers,
            probed_duration: None,
            hint_duration,
            media_info: None,
            segment_duration: cfg.segment_duration,
            current_encode_offset: 0.0,
            status: TaskStatus::Starting,
            created_at: now,
            started_at: None,
            completed_at: None,
            last_access_at: now,
            access_count: 0,
        }
    }

    pub fn duration(&self) -> f64 {
        match self.probed_duration {
            Some(d) if d > 0.0 => d,
            _ => self.hint_duration,
        }
    }

    pub fn update_access(&mut self) {
        self.last_access_at = OffsetDateTime::now_utc();
        self.access_count += 1;
    }

    pub fn mark_starting(&mut self) {
        self.status = TaskStatus::Starting;
    }

    pub fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
        if self.started_at.is_none() {
            self.started_at = Some(OffsetDateTime::now_utc());
        }
    }

    pub fn mark_ready(&mut self) {
        if matches!(self.status, TaskStatus::Starting | TaskStatus::Running) {
            self.status = TaskStatus::Ready;
        }
    }

    pub fn mark_completed(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(OffsetDateTime::now_utc());
    }

    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.status = TaskStatus::Error(message.into());
        self.completed_at = Some(OffsetDateTime::now_utc());
    }

    pub fn mark_stopped(&mut self, reason: impl Into<String>) {
        self.status = TaskStatus::Stopped(reason.into());
        self.completed_at = Some(OffsetDateTime::now_utc());
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Starting | TaskStatus::Running | TaskStatus::Ready
        )
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Error(_) | TaskStatus::Stopped(_)
        )
    }

    /// Whether a seek to `target_time` can be served by the currently running
    /// worker without a restart: forward-only, within the tolerance window, and
    /// never once the task has finished (a finished worker cannot resume).
    pub fn can_seek_directly(&self, target_time: f64, seek_tolerance: u32) -> bool {
        if self.is_finished() {
            return false;
        }
        if target_time < self.current_encode_offset {
            return false;
        }
        target_time - self.current_encode_offset <= seek_tolerance as f64
    }

    /// Absolute segment index containing `time_secs`, clamped to
    /// `[0, expected_count-1]` once a duration is known (probed or hinted);
    /// unclamped (just `floor(t / segment_duration)`) while duration is still
    /// unknown, matching the open-playlist case where there is no upper bound
    /// to clamp against.
    pub fn segment_of(&self, time_secs: f64) -> u64 {
        let raw = crate::playlist::segment_for_time(time_secs.max(0.0), self.segment_duration);
        let duration = self.duration();
        if duration > 0.0 {
            let max_index =
                crate::playlist::expected_segment_count(duration, self.segment_duration)
                    .saturating_sub(1);
            raw.min(max_index)
        } else {
            raw
        }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        let Some(started_at) = self.started_at else {
            return std::time::Duration::ZERO;
        };
        let end = self.completed_at.unwrap_or_else(OffsetDateTime::now_utc);
        (end - started_at)
            .try_into()
            .unwrap_or(std::time::Duration::ZERO)
    }

    pub fn is_timeout(&self, task_timeout: u64) -> bool {
        if !self.is_active() {
            return false;
        }
        let now = OffsetDateTime::now_utc();
        match self.started_at {
            None => {
                (now - self.created_at).whole_seconds()
                    > Config::BOOTSTRAP_TIMEOUT_SECS as i64
            }
            Some(_) => (now - self.last_access_at).whole_seconds() > task_timeout as i64,
        }
    }

    pub fn is_idle(&self, idle_seconds: u64) -> bool {
        if self.is_active() {
            return false;
        }
        let now = OffsetDateTime::now_utc();
        (now - self.last_access_at).whole_seconds() > idle_seconds as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_task() -> Task {
        Task::new(
            "content-key-1".to_string(),
            "movie.mp4".to_string(),
            "https://example.com/movie.mp4".to_string(),
            None,
            0.0,
            &Config::default(),
        )
    }

    #[test]
    fn segment_of_clamps_to_last_segment_when_duration_known() {
        let mut task = test_task();
        task.hint_duration = 11.0; // ceil(11/3) = 4 segments, indices 0..=3
        assert_eq!(task.segment_of(9.0), 3);
        assert_eq!(task.segment_of(10_000.0), 3);
    }

    #[test]
    fn segment_of_is_unclamped_while_duration_unknown() {
        let task = test_task(); // hint_duration 0.0, no probed_duration
        assert_eq!(task.segment_of(300.0), 100);
    }

    #[test]
    fn task_id_is_pure_function_of_content_key() {
        let a = task_id_for("same-key");
        let b = task_id_for("same-key");
        let c = task_id_for("different-key");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn can_seek_directly_rejects_backward_jump() {
        let mut task = test_task();
        task.current_encode_offset = 30.0;
        assert!(!task.can_seek_directly(10.0, 24));
    }

    #[test]
    fn can_seek_directly_rejects_once_finished() {
        let mut task = test_task();
        task.mark_completed();
        assert!(!task.can_seek_directly(task.current_encode_offset, 24));
    }

    #[test]
    fn can_seek_directly_within_tolerance() {
        let mut task = test_task();
        task.current_encode_offset = 10.0;
        assert!(task.can_seek_directly(30.0, 24));
        assert!(!task.can_seek_directly(35.0, 24));
    }

    #[test]
    fn lifecycle_transitions() {
        let mut task = test_task();
        assert!(task.is_active());
        task.mark_running();
        assert!(task.started_at.is_some());
        task.mark_ready();
        assert!(matches!(task.status, TaskStatus::Ready));
        task.mark_completed();
        assert!(task.is_finished());
        assert!(!task.is_active());
    }
}
