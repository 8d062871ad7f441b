//! FFmpeg CLI wrapper for transcoding.
//!
//! This crate provides:
//! - Type-safe FFmpeg command building
//! - Progress parsing from `-progress pipe:2`
//! - A timeout-bounded runner that keeps FFmpeg's diagnostics for error reports
//! - The [`Transcoder`] task and its FFmpeg implementation

pub mod command;
pub mod error;
pub mod progress;
pub mod transcode;

pub use command::{check_ffmpeg, FfmpegCommand, FfmpegRunner};
pub use error::{MediaError, MediaResult};
pub use progress::FfmpegProgress;
pub use transcode::{scale_pad_filter, transcode_command, FfmpegTranscoder, Transcoder};
