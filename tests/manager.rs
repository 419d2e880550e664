//! End-to-end tests against `Manager`, driving real (but fake) `ffmpeg`/`ffprobe`
//! child processes so the cleanup/monitor/seek plumbing runs unmodified. The
//! fake probe reports whatever duration is passed as its "source url" (a test
//! fixture, never a real network address); the fake encoder drops a handful of
//! empty `segment<N>.ts` files a few milliseconds apart and then idles, the way
//! a real encoder keeps writing segments for as long as it runs.
#![cfg(unix)]

use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hls_transcode_core::error::TranscodeErrorKind;
use hls_transcode_core::{Config, Manager, NoopUrlRefresh};

fn unique_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "hls-transcode-core-test-{name}-{}-{:?}",
        std::process::id(),
        std::thread::current().id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_script(path: &Path, body: &str) {
    let mut file = std::fs::File::create(path).unwrap();
    writeln!(file, "#!/bin/sh").unwrap();
    file.write_all(body.as_bytes()).unwrap();
    let mut perms = file.metadata().unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).unwrap();
}

fn fake_ffprobe(dir: &Path) -> PathBuf {
    let path = dir.join("ffprobe.sh");
    write_script(
        &path,
        r#"
dur="11.0"
for a in "$@"; do dur="$a"; done
cat <<JSON
{"streams":[{"codec_type":"video","codec_name":"h264","width":1280,"height":720},{"codec_type":"audio","codec_name":"aac"}],"format":{"duration":"$dur","format_name":"mov,mp4,m4a,3gp,3g2,mj2"}}
JSON
"#,
    );
    path
}

/// Writes `segment<start>.ts ... segment<start+count-1>.ts` a few ms apart,
/// then idles so the "worker" is still observed as running by the caller.
fn fake_ffmpeg(dir: &Path) -> PathBuf {
    let path = dir.join("ffmpeg.sh");
    write_script(
        &path,
        r#"
start=0
pattern=""
prev=""
for arg in "$@"; do
  if [ "$prev" = "-start_number" ]; then start="$arg"; fi
  if [ "$prev" = "-hls_segment_filename" ]; then pattern="$arg"; fi
  prev="$arg"
done
outdir=$(dirname "$pattern")
mkdir -p "$outdir"
printf '%s\n' "$@" > "$outdir/argv.log"
i=$start
count=0
while [ $count -lt 4 ]; do
  sleep 0.05
  printf 'x' > "$outdir/segment$i.ts"
  i=$((i + 1))
  count=$((count + 1))
done
sleep 30
"#,
    );
    path
}

/// Polls `argv.log` (written by the fake ffmpeg before it starts producing
/// segments) and returns the value immediately following `flag`.
async fn argv_value(output_dir: &Path, flag: &str) -> String {
    let log_path = output_dir.join("argv.log");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(contents) = tokio::fs::read_to_string(&log_path).await {
            let lines: Vec<&str> = contents.lines().collect();
            if let Some(idx) = lines.iter().position(|l| *l == flag) {
                if let Some(value) = lines.get(idx + 1) {
                    return value.to_string();
                }
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("argv.log never contained {flag}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn test_config(work_dir: PathBuf, max_concurrent_tasks: usize) -> Config {
    Config {
        work_dir,
        max_concurrent_tasks,
        segment_duration: 3,
        seek_tolerance: 24,
        gap_threshold: 10,
        probe_timeout: 10,
        cleanup_interval: 3600,
        task_timeout: 3600,
        ..Config::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cold_start_probes_duration_and_produces_segments() {
    let dir = unique_dir("cold-start");
    let ffprobe = fake_ffprobe(&dir);
    let ffmpeg = fake_ffmpeg(&dir);
    let config = test_config(dir.join("work"), 2);
    let manager = Manager::new(config, Arc::new(NoopUrlRefresh), ffmpeg, ffprobe);

    let task_id = manager
        .get_or_create_task("k1", "movie.mp4", "11.0", None, 0.0, 0.0)
        .await
        .expect("task creation should succeed");

    let playlist = manager
        .get_playlist(task_id, |seg| format!("segment/{seg}"))
        .await
        .expect("playlist should synthesize even before any segment exists");
    assert!(playlist.starts_with("#EXTM3U"));
    assert!(playlist.contains("#EXT-X-ENDLIST"));
    // ceil(11.0 / 3) == 4 entries.
    assert_eq!(playlist.matches("#EXTINF").count(), 4);

    let path = manager
        .wait_for_segment(task_id, 0, Duration::from_secs(10))
        .await
        .expect("segment 0 should appear well within the wait budget");
    assert!(tokio::fs::metadata(&path).await.unwrap().len() > 0);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unaligned_start_time_floors_offset_and_start_number_together() {
    let dir = unique_dir("unaligned-start");
    let ffprobe = fake_ffprobe(&dir);
    let ffmpeg = fake_ffmpeg(&dir);
    let work_dir = dir.join("work");
    let config = test_config(work_dir.clone(), 2);
    let manager = Manager::new(config, Arc::new(NoopUrlRefresh), ffmpeg, ffprobe);

    // start_time=16.0 does not land on a 3s segment boundary; floor(16/3) == 5,
    // whose nominal range is [15, 18), so both -ss and -start_number must
    // agree on segment 5 / offset 15.0, never on the raw 16.0.
    manager
        .get_or_create_task("k-unaligned", "movie.mp4", "100.0", None, 16.0, 0.0)
        .await
        .expect("task creation should succeed");

    let output_dir = work_dir.join("k-unaligned");
    let start_number = argv_value(&output_dir, "-start_number").await;
    let ss = argv_value(&output_dir, "-ss").await;

    assert_eq!(start_number, "5");
    let ss: f64 = ss.parse().unwrap();
    assert!(
        (ss - 15.0).abs() < 1e-6,
        "-ss {ss} does not match floored offset for -start_number {start_number}"
    );

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn seek_within_tolerance_does_not_restart_worker() {
    let dir = unique_dir("seek-tolerance");
    let ffprobe = fake_ffprobe(&dir);
    let ffmpeg = fake_ffmpeg(&dir);
    let config = test_config(dir.join("work"), 2);
    let manager = Manager::new(config, Arc::new(NoopUrlRefresh), ffmpeg, ffprobe);

    let task_id = manager
        .get_or_create_task("k2", "movie.mp4", "11.0", None, 0.0, 0.0)
        .await
        .unwrap();
    manager
        .wait_for_segment(task_id, 0, Duration::from_secs(10))
        .await
        .unwrap();

    // 15s is within the default 24s tolerance of offset 0.
    let resumed_at = manager.seek(task_id, 15.0).await.unwrap();
    assert_eq!(resumed_at, 0.0);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn capacity_reached_blocks_a_third_task() {
    let dir = unique_dir("capacity");
    let ffprobe = fake_ffprobe(&dir);
    let ffmpeg = fake_ffmpeg(&dir);
    let config = test_config(dir.join("work"), 1);
    let manager = Manager::new(config, Arc::new(NoopUrlRefresh), ffmpeg, ffprobe);

    manager
        .get_or_create_task("busy", "movie.mp4", "11.0", None, 0.0, 0.0)
        .await
        .expect("first task should be admitted");

    let err = manager
        .get_or_create_task("other", "movie2.mp4", "11.0", None, 0.0, 0.0)
        .await
        .expect_err("second task should be rejected while at capacity");
    assert_eq!(err.kind, TranscodeErrorKind::CapacityReached);

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn probe_failure_falls_back_to_hint_duration() {
    let dir = unique_dir("probe-failure");
    let ffprobe = dir.join("ffprobe.sh");
    write_script(&ffprobe, "exit 1\n");
    let ffmpeg = fake_ffmpeg(&dir);
    let config = test_config(dir.join("work"), 2);
    let manager = Manager::new(config, Arc::new(NoopUrlRefresh), ffmpeg, ffprobe);

    let task_id = manager
        .get_or_create_task("k3", "movie.mp4", "ignored", None, 0.0, 60.0)
        .await
        .expect("task creation should still succeed on probe failure");

    let playlist = manager
        .get_playlist(task_id, |seg| format!("segment/{seg}"))
        .await
        .unwrap();
    // ceil(60.0 / 3) == 20 entries from the hint duration, since probing failed.
    assert_eq!(playlist.matches("#EXTINF").count(), 20);

    manager.shutdown().await;
}
