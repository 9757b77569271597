//! External encoder plumbing: bounded tool execution, ffmpeg commands and
//! chunk concatenation.

pub mod concat;
pub mod ffmpeg;
pub mod tool;

pub use concat::{Concatenator, FfmpegConcat};
pub use ffmpeg::{
    concat_command, concat_list, encode_command, parse_progress_line, segment_command,
    sprite_command, thumbnail_command,
};
pub use tool::{ToolCommand, ToolError, ToolOutput};
