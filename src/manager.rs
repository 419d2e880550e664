use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::command::{self, CommandInput};
use crate::config::Config;
use crate::error::TranscodeError;
use crate::playlist;
use crate::probe;
use crate::task::{task_id_for, Task, TaskStatus};
use crate::url_refresh::UrlRefresh;

const MONITOR_POLL_INTERVAL: Duration = Duration::from_secs(1);
const SEGMENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct Manager {
    config: Config,
    tasks: StdMutex<HashMap<Uuid, Task>>,
    processes: AsyncMutex<HashMap<Uuid, Child>>,
    refresher: Arc<dyn UrlRefresh>,
    ffmpeg_path: PathBuf,
    ffprobe_path: PathBuf,
    exit_token: CancellationToken,
    cleanup_handle: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Manager {
    pub fn new(
        config: Config,
        refresher: Arc<dyn UrlRefresh>,
        ffmpeg_path: PathBuf,
        ffprobe_path: PathBuf,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            config,
            tasks: StdMutex::new(HashMap::new()),
            processes: AsyncMutex::new(HashMap::new()),
            refresher,
            ffmpeg_path,
            ffprobe_path,
            exit_token: CancellationToken::new(),
            cleanup_handle: StdMutex::new(None),
        });

        let cleanup_manager = manager.clone();
        let handle = tokio::spawn(async move { cleanup_manager.cleanup_loop().await });
        *manager.cleanup_handle.lock().unwrap() = Some(handle);

        manager
    }

    async fn cleanup_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.cleanup_interval);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let cleaned = self.cleanup().await;
                    if cleaned > 0 {
                        tracing::info!(cleaned, "cleanup loop reclaimed tasks");
                    }
                }
                _ = self.exit_token.cancelled() => {
                    tracing::debug!("cleanup loop exiting");
                    return;
                }
            }
        }
    }

    /// Cancels the cleanup loop, stops every active worker, and joins the
    /// cleanup task. Call this once before dropping the manager.
    pub async fn shutdown(&self) {
        self.exit_token.cancel();
        let handle = self.cleanup_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let active_ids: Vec<Uuid> = {
            let tasks = self.tasks.lock().unwrap();
            tasks
                .values()
                .filter(|t| t.is_active())
                .map(|t| t.task_id)
                .collect()
        };
        for id in active_ids {
            let _ = self.stop_task(id, "shutdown").await;
        }
    }

    fn with_task<R>(&self, task_id: Uuid, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.get_mut(&task_id).map(f)
    }

    fn read_task<R>(&self, task_id: Uuid, f: impl FnOnce(&Task) -> R) -> Option<R> {
        let tasks = self.tasks.lock().unwrap();
        tasks.get(&task_id).map(f)
    }

    fn active_count(&self) -> usize {
        self.tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.is_active())
            .count()
    }

    /// Finds an existing active task for `content_key` whose current encode
    /// position can directly serve `start_time`, or creates and starts a new
    /// one. Always returns the same task id for the same `content_key`.
    pub async fn get_or_create_task(
        self: &Arc<Self>,
        content_key: &str,
        file_name: &str,
        source_url: &str,
        request_headers: Option<&str>,
        start_time: f64,
        hint_duration: f64,
    ) -> Result<Uuid, TranscodeError> {
        let task_id = task_id_for(content_key);

        let reusable = self.with_task(task_id, |task| {
            let reusable =
                task.is_active() && task.can_seek_directly(start_time, self.config.seek_tolerance);
            if reusable {
                task.update_access();
            }
            reusable
        });
        if reusable == Some(true) {
            return Ok(task_id);
        }

        if self.active_count() >= self.config.max_concurrent_tasks {
            return Err(TranscodeError::capacity_reached(format!(
                "{} concurrent tasks already running",
                self.config.max_concurrent_tasks
            )));
        }

        let mut task = Task::new(
            content_key.to_string(),
            file_name.to_string(),
            source_url.to_string(),
            request_headers.map(str::to_string),
            hint_duration,
            &self.config,
        );

        match probe::probe(
            &self.ffprobe_path,
            source_url,
            request_headers,
            Duration::from_secs(self.config.probe_timeout),
        )
        .await
        {
            Ok(info) => {
                task.probed_duration = info.duration.map(|d| d.as_secs_f64());
                task.media_info = Some(info);
            }
            Err(e) => {
                tracing::warn!(content_key, error = %e, "probe failed, falling back to hint duration");
            }
        }

        // current_encode_offset must land on a segment boundary so it always
        // agrees with the `-start_number` the worker is given; derive both
        // from the same segment index rather than storing the raw start_time.
        let start_segment = task.segment_of(start_time.max(0.0));
        task.current_encode_offset = playlist::time_for_segment(start_segment, self.config.segment_duration);
        {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.insert(task_id, task);
        }

        self.spawn_worker(task_id, start_segment).await?;
        Ok(task_id)
    }

    async fn spawn_worker(
        self: &Arc<Self>,
        task_id: Uuid,
        start_segment: u64,
    ) -> Result<(), TranscodeError> {
        let snapshot = self
            .with_task(task_id, |task| {
                (
                    task.source_url.clone(),
                    task.request_headers.clone(),
                    task.file_name.clone(),
                    task.media_info.clone(),
                    task.output_dir.clone(),
                    task.current_encode_offset,
                )
            })
            .ok_or_else(|| TranscodeError::not_found(format!("task {task_id}")))?;

        let (source_url, headers, file_name, media_info, output_dir, seek_time) = snapshot;
        let input = CommandInput {
            source_url: &source_url,
            request_headers: headers.as_deref(),
            file_name: &file_name,
            media_info: media_info.as_ref(),
            output_dir: &output_dir,
            seek_time,
        };
        let args = command::build_command(&self.config, &input, start_segment);

        match command::spawn(&self.ffmpeg_path, &args, &output_dir).await {
            Ok(child) => {
                self.processes.lock().await.insert(task_id, child);
                self.with_task(task_id, |task| task.mark_running());
                let manager = self.clone();
                tokio::spawn(async move { manager.monitor_loop(task_id).await });
                Ok(())
            }
            Err(e) => {
                self.with_task(task_id, |task| task.mark_error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn monitor_loop(self: Arc<Self>, task_id: Uuid) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(MONITOR_POLL_INTERVAL) => {}
                _ = self.exit_token.cancelled() => return,
            }

            let Some(still_active) = self.read_task(task_id, |t| t.is_active()) else {
                return;
            };
            if !still_active {
                return;
            }

            let exit_status = {
                let mut processes = self.processes.lock().await;
                match processes.get_mut(&task_id) {
                    Some(child) => child.try_wait().ok().flatten(),
                    None => None,
                }
            };

            if let Some(status) = exit_status {
                self.processes.lock().await.remove(&task_id);
                if status.success() {
                    self.with_task(task_id, |t| t.mark_completed());
                    tracing::info!(%task_id, "worker completed");
                } else {
                    let message = format!("worker exited with {status}");
                    self.with_task(task_id, |t| t.mark_error(message.clone()));
                    tracing::error!(%task_id, "{message}");
                }
                return;
            }

            let running = self.read_task(task_id, |t| {
                matches!(t.status, TaskStatus::Running)
                    .then(|| (t.content_key.clone(), t.segment_of(t.current_encode_offset)))
            });
            if let Some(Some((content_key, start_segment))) = running {
                if self.segment_exists(&content_key, start_segment).await {
                    self.with_task(task_id, |t| t.mark_ready());
                }
            }
        }
    }

    /// A segment is on disk and non-empty. The filesystem is the source of
    /// truth here rather than an in-memory mirror, so this remains correct
    /// across monitor task restarts.
    async fn segment_exists(&self, content_key: &str, segment_id: u64) -> bool {
        let path = self.config.segment_path(content_key, segment_id);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len() > 0,
            Err(_) => false,
        }
    }

    async fn find_last_existing_segment(&self, content_key: &str, max_segment: u64) -> Option<u64> {
        let (mut low, mut high) = (0i64, max_segment as i64);
        let mut last_existing: Option<u64> = None;
        while low <= high {
            let mid = (low + high) / 2;
            if self.segment_exists(content_key, mid as u64).await {
                last_existing = Some(mid as u64);
                low = mid + 1;
            } else {
                high = mid - 1;
            }
        }
        last_existing
    }

    async fn find_first_existing_segment(
        &self,
        content_key: &str,
        hint_segment: u64,
    ) -> Option<u64> {
        if self.segment_exists(content_key, hint_segment).await {
            return Some(hint_segment);
        }
        let (mut low, mut high) = (0i64, hint_segment as i64);
        let mut found: Option<u64> = None;
        while low <= high {
            let mid = (low + high) / 2;
            if self.segment_exists(content_key, mid as u64).await {
                found = Some(mid as u64);
                low = mid + 1;
            } else {
                high = mid - 1;
            }
        }
        found
    }

    async fn refresh_url_if_needed(&self, task_id: Uuid) {
        let content_key = self.read_task(task_id, |t| t.content_key.clone());
        let Some(content_key) = content_key else {
            return;
        };
        if let Some((url, headers)) = self.refresher.refresh(&content_key).await {
            self.with_task(task_id, |t| {
                t.source_url = url;
                t.request_headers = headers;
            });
            tracing::info!(content_key, "refreshed upstream url before worker restart");
        }
    }

    async fn stop_worker_process(&self, task_id: Uuid) {
        let mut child = { self.processes.lock().await.remove(&task_id) };
        let Some(child) = &mut child else {
            return;
        };
        let _ = child.start_kill();
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                let _ = child.kill().await;
            }
        }
    }

    /// Stops the worker attached to `task_id`, if any, and marks the task
    /// stopped with `reason`.
    pub async fn stop_task(&self, task_id: Uuid, reason: &str) -> Result<(), TranscodeError> {
        let is_active = self
            .read_task(task_id, |t| t.is_active())
            .ok_or_else(|| TranscodeError::not_found(format!("task {task_id}")))?;
        if is_active {
            self.stop_worker_process(task_id).await;
        }
        self.with_task(task_id, |t| t.mark_stopped(reason.to_string()));
        Ok(())
    }

    /// Translates a client seek into continue/wait/restart, per the tolerance
    /// window and segment cache. Returns the HLS stream start-time offset the
    /// caller should report to the player.
    pub async fn seek(self: &Arc<Self>, task_id: Uuid, target_time: f64) -> Result<f64, TranscodeError> {
        let (content_key, duration, segment_duration, current_offset) = self
            .read_task(task_id, |t| {
                (t.content_key.clone(), t.duration(), t.segment_duration, t.current_encode_offset)
            })
            .ok_or_else(|| TranscodeError::not_found(format!("task {task_id}")))?;

        let mut target_time = target_time.max(0.0);
        if duration > 0.0 && target_time >= duration {
            target_time = (duration - 1.0).max(0.0);
        }
        let target_segment = playlist::segment_for_time(target_time, segment_duration);

        if self
            .read_task(task_id, |t| t.can_seek_directly(target_time, self.config.seek_tolerance))
            == Some(true)
        {
            return Ok(current_offset);
        }

        if self.segment_exists(&content_key, target_segment).await {
            let needs_restart = self
                .read_task(task_id, |t| !t.is_active() && !matches!(t.status, TaskStatus::Completed))
                == Some(true);
            if needs_restart {
                self.refresh_url_if_needed(task_id).await;
                let last = self
                    .find_last_existing_segment(&content_key, 10_000)
                    .await
                    .unwrap_or(0);
                let start_segment = last + 1;
                let start_time = playlist::time_for_segment(start_segment, segment_duration);
                self.with_task(task_id, |t| {
                    t.current_encode_offset = start_time;
                    t.mark_starting();
                });
                self.spawn_worker(task_id, start_segment).await?;
            }
            return Ok(0.0);
        }

        let is_active = self.read_task(task_id, |t| t.is_active());
        if is_active == Some(true) {
            self.stop_worker_process(task_id).await;
        }
        self.refresh_url_if_needed(task_id).await;

        let start_time = playlist::time_for_segment(target_segment, segment_duration);
        self.with_task(task_id, |t| {
            t.current_encode_offset = start_time;
            t.mark_starting();
        });
        self.spawn_worker(task_id, target_segment).await?;
        Ok(0.0)
    }

    /// Ensures the worker will eventually produce `segment_id`, restarting it
    /// if it's running far enough ahead (beyond `gap_threshold`) or not at all.
    /// Returns `false` when the segment is too far behind the worker's current
    /// position to justify a restart.
    pub async fn ensure_transcoding_for_segment(
        self: &Arc<Self>,
        task_id: Uuid,
        segment_id: u64,
    ) -> Result<bool, TranscodeError> {
        let content_key = self
            .read_task(task_id, |t| t.content_key.clone())
            .ok_or_else(|| TranscodeError::not_found(format!("task {task_id}")))?;

        if self.segment_exists(&content_key, segment_id).await {
            return Ok(true);
        }

        let (is_active, segment_duration, current_segment) = self
            .read_task(task_id, |t| {
                (t.is_active(), t.segment_duration, t.segment_of(t.current_encode_offset))
            })
            .unwrap();

        if is_active {
            if current_segment <= segment_id {
                return Ok(true);
            }
            if segment_id + self.config.gap_threshold < current_segment {
                tracing::warn!(
                    %task_id,
                    segment_id,
                    current_segment,
                    "segment far behind worker position, not restarting"
                );
                return Ok(false);
            }
            self.stop_worker_process(task_id).await;
        }

        self.refresh_url_if_needed(task_id).await;
        let segment_time = playlist::time_for_segment(segment_id, segment_duration);
        self.with_task(task_id, |t| {
            t.current_encode_offset = segment_time;
            t.mark_starting();
        });
        self.spawn_worker(task_id, segment_id).await?;
        Ok(true)
    }

    /// Blocks (without holding any lock across the wait) until `segment_id`
    /// exists and, if the worker is still active, until the segment after it
    /// has also appeared -- the signal that the requested segment is complete.
    pub async fn wait_for_segment(
        &self,
        task_id: Uuid,
        segment_id: u64,
        timeout: Duration,
    ) -> Result<PathBuf, TranscodeError> {
        let content_key = self
            .read_task(task_id, |t| t.content_key.clone())
            .ok_or_else(|| TranscodeError::not_found(format!("task {task_id}")))?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let finished_badly = self
                .read_task(task_id, |t| t.is_finished() && !matches!(t.status, TaskStatus::Completed))
                .unwrap_or(true);
            if finished_badly {
                return Err(TranscodeError::segment_unavailable(format!(
                    "task {task_id} ended before producing segment {segment_id}"
                )));
            }

            if self.segment_exists(&content_key, segment_id).await {
                let is_active = self.read_task(task_id, |t| t.is_active()).unwrap_or(false);
                if !is_active || self.segment_exists(&content_key, segment_id + 1).await {
                    return Ok(self.config.segment_path(&content_key, segment_id));
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(TranscodeError::wait_timeout(format!(
                    "segment {segment_id} did not appear within {timeout:?}"
                )));
            }
            tokio::time::sleep(SEGMENT_POLL_INTERVAL).await;
        }
    }

    pub fn get_segment_path(&self, task_id: Uuid, segment_id: u64) -> Result<PathBuf, TranscodeError> {
        let content_key = self
            .read_task(task_id, |t| t.content_key.clone())
            .ok_or_else(|| TranscodeError::not_found(format!("task {task_id}")))?;
        let path = self.config.segment_path(&content_key, segment_id);
        if path.exists() {
            Ok(path)
        } else {
            Err(TranscodeError::segment_unavailable(format!(
                "segment {segment_id} not yet produced"
            )))
        }
    }

    /// Synthesizes the full playlist for `task_id`. `segment_url` renders the
    /// absolute-index URL for each segment; the manager owns no HTTP routes of
    /// its own.
    pub async fn get_playlist(
        &self,
        task_id: Uuid,
        segment_url: impl Fn(u64) -> String,
    ) -> Result<String, TranscodeError> {
        let (content_key, mut duration, segment_duration, current_offset) = self
            .read_task(task_id, |t| {
                (t.content_key.clone(), t.duration(), t.segment_duration, t.current_encode_offset)
            })
            .ok_or_else(|| TranscodeError::not_found(format!("task {task_id}")))?;

        if duration <= 0.0 {
            if let Some(last) = self.find_last_existing_segment(&content_key, 10_000).await {
                duration = (last + 1) as f64 * segment_duration as f64 * 1.1;
            }
        }

        if duration <= 0.0 {
            return Ok(playlist::synthesize_open_playlist(segment_duration, segment_url));
        }

        let hint_segment = playlist::segment_for_time(current_offset, segment_duration);
        let start_segment = if current_offset > 0.0 {
            self.find_first_existing_segment(&content_key, hint_segment)
                .await
                .unwrap_or(0)
        } else {
            0
        };
        let start_time_offset = playlist::time_for_segment(start_segment, segment_duration);

        Ok(playlist::synthesize_vod_playlist(
            segment_duration,
            duration,
            start_time_offset,
            segment_url,
        ))
    }

    /// Sweeps timed-out active tasks and idle finished tasks, stopping
    /// processes and dropping their on-disk caches. Returns the number of
    /// tasks reclaimed.
    pub async fn cleanup(&self) -> usize {
        let (to_stop, to_drop): (Vec<Uuid>, Vec<Uuid>) = {
            let tasks = self.tasks.lock().unwrap();
            let to_stop = tasks
                .values()
                .filter(|t| t.is_active() && t.is_timeout(self.config.task_timeout))
                .map(|t| t.task_id)
                .collect();
            let to_drop = tasks
                .values()
                .filter(|t| t.is_idle(self.config.task_timeout))
                .map(|t| t.task_id)
                .collect();
            (to_stop, to_drop)
        };

        for id in &to_stop {
            let _ = self.stop_task(*id, "timeout").await;
        }

        let mut removed = 0;
        for id in to_stop.into_iter().chain(to_drop) {
            let removed_task = {
                let mut tasks = self.tasks.lock().unwrap();
                tasks.remove(&id)
            };
            if let Some(task) = removed_task {
                if let Err(e) = tokio::fs::remove_dir_all(&task.output_dir).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(path = %task.output_dir.display(), "failed to clean up task directory: {e}");
                    }
                }
                removed += 1;
            }
        }
        removed
    }
}
