use std::fmt::Write;

/// Fixed primer length for open (duration-unknown) playlists. Does not grow as
/// the worker produces segments; see the open question decision in DESIGN.md.
pub const OPEN_PLAYLIST_PRIMER_LEN: u64 = 100;

/// Synthesizes a VOD m3u8 covering the whole source up front, independent of how
/// much the worker has actually produced. `start_time_offset` steers the player
/// (via `#EXT-X-START`) to the first segment that already exists without
/// truncating the playlist, so the progress bar always reflects full duration.
pub fn synthesize_vod_playlist(
    segment_duration: u32,
    duration_secs: f64,
    start_time_offset: f64,
    segment_url: impl Fn(u64) -> String,
) -> String {
    let segment_count = expected_segment_count(duration_secs, segment_duration);
    let segment_duration = segment_duration as f64;

    let mut out = String::new();
    writeln!(out, "#EXTM3U").unwrap();
    writeln!(out, "#EXT-X-VERSION:3").unwrap();
    writeln!(out, "#EXT-X-PLAYLIST-TYPE:VOD").unwrap();
    writeln!(out, "#EXT-X-TARGETDURATION:{}", segment_duration.round() as u32).unwrap();
    writeln!(out, "#EXT-X-MEDIA-SEQUENCE:0").unwrap();
    if start_time_offset > 0.0 {
        writeln!(out, "#EXT-X-START:TIME-OFFSET={:.3}", start_time_offset).unwrap();
    }

    for i in 0..segment_count {
        let remaining = duration_secs - (i as f64) * segment_duration;
        let this_duration = remaining.min(segment_duration).max(0.0);
        writeln!(out, "#EXTINF:{:.6},", this_duration).unwrap();
        writeln!(out, "{}", segment_url(i)).unwrap();
    }
    write!(out, "#EXT-X-ENDLIST").unwrap();
    out
}

/// Synthesizes an open (EVENT) m3u8 used while duration is unknown. Emits a
/// fixed-size primer of nominal-duration entries and omits `#EXT-X-ENDLIST` so
/// the player keeps polling for more segments.
pub fn synthesize_open_playlist(
    segment_duration: u32,
    segment_url: impl Fn(u64) -> String,
) -> String {
    let mut out = String::new();
    writeln!(out, "#EXTM3U").unwrap();
    writeln!(out, "#EXT-X-VERSION:3").unwrap();
    writeln!(out, "#EXT-X-PLAYLIST-TYPE:EVENT").unwrap();
    writeln!(out, "#EXT-X-TARGETDURATION:{segment_duration}").unwrap();
    writeln!(out, "#EXT-X-MEDIA-SEQUENCE:0").unwrap();

    for i in 0..OPEN_PLAYLIST_PRIMER_LEN {
        writeln!(out, "#EXTINF:{:.6},", segment_duration as f64).unwrap();
        writeln!(out, "{}", segment_url(i)).unwrap();
    }
    out
}

/// Number of segments a source of `duration_secs` is divided into at
/// `segment_duration`; always at least 1 so a sub-one-segment source still
/// gets a single entry.
pub fn expected_segment_count(duration_secs: f64, segment_duration: u32) -> u64 {
    (duration_secs / segment_duration as f64).ceil().max(1.0) as u64
}

/// Maps a wall-clock time to the absolute segment index that contains it.
pub fn segment_for_time(time_secs: f64, segment_duration: u32) -> u64 {
    if time_secs <= 0.0 {
        return 0;
    }
    (time_secs / segment_duration as f64) as u64
}

/// Maps an absolute segment index back to its nominal start time.
pub fn time_for_segment(segment_id: u64, segment_duration: u32) -> f64 {
    segment_id as f64 * segment_duration as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vod_playlist_covers_whole_duration() {
        let playlist = synthesize_vod_playlist(3, 10.0, 0.0, |i| format!("segment/{i}"));
        assert!(playlist.starts_with("#EXTM3U"));
        assert!(playlist.ends_with("#EXT-X-ENDLIST"));
        assert_eq!(playlist.matches("#EXTINF").count(), 4);
        assert!(playlist.contains("segment/3"));
    }

    #[test]
    fn vod_playlist_final_segment_is_shorter() {
        let playlist = synthesize_vod_playlist(3, 7.0, 0.0, |i| format!("segment/{i}"));
        assert!(playlist.contains("#EXTINF:1.000000,"));
    }

    #[test]
    fn open_playlist_has_no_endlist_and_fixed_primer() {
        let playlist = synthesize_open_playlist(3, |i| format!("segment/{i}"));
        assert!(!playlist.contains("#EXT-X-ENDLIST"));
        assert_eq!(
            playlist.matches("#EXTINF").count(),
            OPEN_PLAYLIST_PRIMER_LEN as usize
        );
    }

    #[test]
    fn expected_segment_count_matches_vod_playlist_entries() {
        assert_eq!(expected_segment_count(10.0, 3), 4);
        assert_eq!(expected_segment_count(9.0, 3), 3);
        assert_eq!(expected_segment_count(0.5, 3), 1);
    }

    #[test]
    fn segment_time_round_trip_is_monotonic() {
        for id in [0u64, 1, 5, 100] {
            let t = time_for_segment(id, 3);
            assert_eq!(segment_for_time(t, 3), id);
        }
    }
}
