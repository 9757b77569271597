//! ffmpeg command construction for encodes, segmentation, concatenation and
//! thumbnails, plus `-progress` output parsing.

use crate::encode::tool::ToolCommand;
use crate::profiles::{Codec, EncodeProfile, Extension};
use std::path::Path;

/// Length of the animated gif preview, in seconds.
const GIF_PREVIEW_SECS: u32 = 4;

/// Per-codec video and audio arguments.
fn codec_args(codec: Codec) -> &'static [&'static str] {
    match codec {
        Codec::H264 => &[
            "-c:v", "libx264", "-preset", "medium", "-crf", "23", "-pix_fmt", "yuv420p",
            "-c:a", "aac", "-b:a", "128k",
        ],
        Codec::H265 => &[
            "-c:v", "libx265", "-preset", "medium", "-crf", "28", "-tag:v", "hvc1",
            "-pix_fmt", "yuv420p", "-c:a", "aac", "-b:a", "128k",
        ],
        Codec::Vp9 => &[
            "-c:v", "libvpx-vp9", "-b:v", "0", "-crf", "32", "-row-mt", "1",
            "-c:a", "libopus", "-b:a", "96k",
        ],
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Builds the ffmpeg invocation that encodes `input` into `profile`.
///
/// Progress is written to stdout as `key=value` lines (`-progress pipe:1`).
pub fn encode_command(
    ffmpeg: &str,
    profile: &EncodeProfile,
    input: &Path,
    output: &Path,
    threads: u32,
) -> ToolCommand {
    let mut cmd = ToolCommand::new(ffmpeg)
        .args(["-hide_banner", "-nostats", "-loglevel", "error", "-y"])
        .args(["-progress", "pipe:1"])
        .arg("-i")
        .arg(path_arg(input));

    if threads > 0 {
        cmd = cmd.arg("-threads").arg(threads.to_string());
    }

    match (profile.extension, profile.codec, profile.resolution) {
        (Extension::Gif, _, _) => {
            cmd = cmd
                .arg("-t")
                .arg(GIF_PREVIEW_SECS.to_string())
                .arg("-vf")
                .arg("fps=10,scale=320:-1:flags=lanczos,split[s0][s1];[s0]palettegen[p];[s1][p]paletteuse")
                .args(["-loop", "0", "-an"]);
        }
        (_, Some(codec), resolution) => {
            if let Some(res) = resolution {
                cmd = cmd.arg("-vf").arg(format!("scale=-2:{}", res.height()));
            }
            cmd = cmd.args(codec_args(codec).iter().copied());
            if profile.extension == Extension::Mp4 {
                cmd = cmd.args(["-movflags", "+faststart"]);
            }
        }
        // validated profiles always carry a codec unless they are gif
        (_, None, _) => {}
    }

    cmd.arg(path_arg(output))
}

/// Splits `input` into stream-copied segments of roughly `segment_secs`.
///
/// `pattern` is an ffmpeg output template such as `chunks/m1/part_%04d.mp4`.
pub fn segment_command(ffmpeg: &str, input: &Path, segment_secs: u64, pattern: &Path) -> ToolCommand {
    ToolCommand::new(ffmpeg)
        .args(["-hide_banner", "-loglevel", "error", "-y"])
        .arg("-i")
        .arg(path_arg(input))
        .args(["-c", "copy", "-map", "0", "-f", "segment"])
        .arg("-segment_time")
        .arg(segment_secs.to_string())
        .args(["-reset_timestamps", "1"])
        .arg(path_arg(pattern))
}

/// Losslessly concatenates the files named in a concat `list` into `output`.
pub fn concat_command(ffmpeg: &str, list: &Path, output: &Path) -> ToolCommand {
    ToolCommand::new(ffmpeg)
        .args(["-hide_banner", "-loglevel", "error", "-y"])
        .args(["-f", "concat", "-safe", "0"])
        .arg("-i")
        .arg(path_arg(list))
        .args(["-c", "copy", "-movflags", "+faststart"])
        .arg(path_arg(output))
}

/// Extracts a single frame at `time_secs`, optionally scaled to `width`.
pub fn thumbnail_command(
    ffmpeg: &str,
    input: &Path,
    time_secs: f64,
    output: &Path,
    width: Option<u32>,
) -> ToolCommand {
    let mut cmd = ToolCommand::new(ffmpeg)
        .args(["-hide_banner", "-loglevel", "error", "-y"])
        .arg("-ss")
        .arg(format!("{:.2}", time_secs))
        .arg("-i")
        .arg(path_arg(input))
        .args(["-vframes", "1"]);
    if let Some(w) = width {
        cmd = cmd.arg("-vf").arg(format!("scale={}:-2", w));
    }
    cmd.arg(path_arg(output))
}

/// Seconds of video covered by one sprite tile.
pub const SPRITE_INTERVAL_SECS: u64 = 10;
const SPRITE_TILE_WIDTH: u32 = 160;
const SPRITE_MAX_COLUMNS: u64 = 10;

/// Columns and rows of the sprite sheet for a video of `duration_secs`.
pub fn sprite_grid(duration_secs: u64) -> (u64, u64) {
    let tiles = duration_secs.div_ceil(SPRITE_INTERVAL_SECS).max(1);
    let columns = tiles.min(SPRITE_MAX_COLUMNS);
    (columns, tiles.div_ceil(columns))
}

/// Samples one frame per [`SPRITE_INTERVAL_SECS`] and tiles the scaled frames
/// into a single image, used for seek-bar previews.
pub fn sprite_command(ffmpeg: &str, input: &Path, duration_secs: u64, output: &Path) -> ToolCommand {
    let (columns, rows) = sprite_grid(duration_secs);
    ToolCommand::new(ffmpeg)
        .args(["-hide_banner", "-loglevel", "error", "-y"])
        .arg("-i")
        .arg(path_arg(input))
        .arg("-vf")
        .arg(format!(
            "fps=1/{},scale={}:-2,tile={}x{}",
            SPRITE_INTERVAL_SECS, SPRITE_TILE_WIDTH, columns, rows
        ))
        .args(["-frames:v", "1"])
        .arg(path_arg(output))
}

/// Renders an ffmpeg concat demuxer list for the given files, in order.
pub fn concat_list<P: AsRef<Path>>(files: &[P]) -> String {
    files
        .iter()
        .map(|p| {
            let escaped = p.as_ref().to_string_lossy().replace('\'', "'\\''");
            format!("file '{}'\n", escaped)
        })
        .collect()
}

/// Turns one `-progress` line into a percentage of `duration_secs`.
///
/// Returns `None` for lines that carry no position. `progress=end` maps to
/// 100; positions are capped at 99 until then.
pub fn parse_progress_line(line: &str, duration_secs: u64) -> Option<u8> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "progress" if value == "end" => Some(100),
        // out_time_ms is in microseconds as well
        "out_time_us" | "out_time_ms" => {
            if duration_secs == 0 {
                return None;
            }
            let micros: i64 = value.parse().ok()?;
            if micros < 0 {
                return None;
            }
            let percent = micros as f64 / (duration_secs as f64 * 1_000_000.0) * 100.0;
            Some(percent.clamp(0.0, 99.0) as u8)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::{test_profile, Resolution};
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_progress_never_exceeds_99_before_end(
            duration in 1u64..100_000,
            micros in 0i64..i64::MAX / 2,
        ) {
            let line = format!("out_time_us={}", micros);
            let percent = parse_progress_line(&line, duration).expect("position line");
            prop_assert!(percent <= 99);
        }

        #[test]
        fn prop_concat_list_has_one_entry_per_file(
            names in prop::collection::vec("[a-z0-9_' ]{1,12}", 1..10),
        ) {
            let files: Vec<PathBuf> = names.iter().map(|n| PathBuf::from(format!("/c/{}.mp4", n))).collect();
            let list = concat_list(&files);
            prop_assert_eq!(list.lines().count(), files.len());
            prop_assert!(list.lines().all(|l| l.starts_with("file '") && l.ends_with('\'')));
        }
    }

    #[test]
    fn test_progress_lines() {
        assert_eq!(parse_progress_line("out_time_us=30000000", 60), Some(50));
        assert_eq!(parse_progress_line("out_time_ms=15000000", 60), Some(25));
        assert_eq!(parse_progress_line("progress=end", 60), Some(100));
        assert_eq!(parse_progress_line("progress=continue", 60), None);
        assert_eq!(parse_progress_line("out_time_us=N/A", 60), None);
        assert_eq!(parse_progress_line("out_time_us=30000000", 0), None);
        assert_eq!(parse_progress_line("frame=120", 60), None);
        assert_eq!(parse_progress_line("garbage", 60), None);
    }

    #[test]
    fn test_h264_encode_command() {
        let profile = test_profile(3, Extension::Mp4, Some(Resolution::R720), Some(Codec::H264));
        let cmd = encode_command("ffmpeg", &profile, Path::new("/in.mov"), Path::new("/out.mp4"), 4);
        let args = cmd.get_args();

        assert!(has_flag_with_value(args, "-i", "/in.mov"));
        assert!(has_flag_with_value(args, "-vf", "scale=-2:720"));
        assert!(has_flag_with_value(args, "-c:v", "libx264"));
        assert!(has_flag_with_value(args, "-threads", "4"));
        assert!(has_flag_with_value(args, "-progress", "pipe:1"));
        assert!(has_flag_with_value(args, "-movflags", "+faststart"));
        assert_eq!(args.last().map(String::as_str), Some("/out.mp4"));
    }

    #[test]
    fn test_vp9_webm_has_no_faststart() {
        let profile = test_profile(8, Extension::Webm, Some(Resolution::R720), Some(Codec::Vp9));
        let cmd = encode_command("ffmpeg", &profile, Path::new("/in"), Path::new("/out.webm"), 0);
        let args = cmd.get_args();
        assert!(has_flag_with_value(args, "-c:v", "libvpx-vp9"));
        assert!(!args.iter().any(|a| a == "-movflags"));
        assert!(!args.iter().any(|a| a == "-threads"));
    }

    #[test]
    fn test_gif_encode_uses_palette() {
        let profile = test_profile(1, Extension::Gif, None, None);
        let cmd = encode_command("ffmpeg", &profile, Path::new("/in"), Path::new("/out.gif"), 2);
        let args = cmd.get_args();
        assert!(args.iter().any(|a| a.contains("palettegen")));
        assert!(has_flag_with_value(args, "-loop", "0"));
        assert!(!args.iter().any(|a| a == "-c:v"));
    }

    #[test]
    fn test_segment_and_concat_commands_stream_copy() {
        let seg = segment_command("ffmpeg", Path::new("/in.mp4"), 240, Path::new("/c/part_%04d.mp4"));
        assert!(has_flag_with_value(seg.get_args(), "-c", "copy"));
        assert!(has_flag_with_value(seg.get_args(), "-segment_time", "240"));

        let cat = concat_command("ffmpeg", Path::new("/t/list.txt"), Path::new("/o.mp4"));
        assert!(has_flag_with_value(cat.get_args(), "-f", "concat"));
        assert!(has_flag_with_value(cat.get_args(), "-safe", "0"));
        assert!(has_flag_with_value(cat.get_args(), "-c", "copy"));
    }

    #[test]
    fn test_thumbnail_command() {
        let cmd = thumbnail_command("ffmpeg", Path::new("/in"), 12.345, Path::new("/t.jpg"), Some(344));
        let args = cmd.get_args();
        assert!(has_flag_with_value(args, "-ss", "12.35") || has_flag_with_value(args, "-ss", "12.34"));
        assert!(has_flag_with_value(args, "-vframes", "1"));
        assert!(has_flag_with_value(args, "-vf", "scale=344:-2"));
    }

    #[test]
    fn test_sprite_grid() {
        assert_eq!(sprite_grid(0), (1, 1));
        assert_eq!(sprite_grid(25), (3, 1));
        assert_eq!(sprite_grid(100), (10, 1));
        assert_eq!(sprite_grid(101), (10, 2));
        assert_eq!(sprite_grid(600), (10, 6));
    }

    #[test]
    fn test_sprite_command_tiles_sampled_frames() {
        let cmd = sprite_command("ffmpeg", Path::new("/in.mp4"), 600, Path::new("/s.jpg"));
        let args = cmd.get_args();
        assert!(has_flag_with_value(args, "-vf", "fps=1/10,scale=160:-2,tile=10x6"));
        assert!(has_flag_with_value(args, "-frames:v", "1"));
    }

    #[test]
    fn test_concat_list_escapes_quotes() {
        let list = concat_list(&[PathBuf::from("/c/it's.mp4"), PathBuf::from("/c/b.mp4")]);
        assert_eq!(list, "file '/c/it'\\''s.mp4'\nfile '/c/b.mp4'\n");
    }
}
