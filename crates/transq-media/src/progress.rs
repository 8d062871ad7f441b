//! FFmpeg progress parsing.

use serde::{Deserialize, Serialize};

/// Progress information from FFmpeg.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FfmpegProgress {
    /// Current frame number
    pub frame: u64,
    /// Output time in milliseconds
    pub out_time_ms: i64,
    /// Encoding speed (e.g., 1.5 = 1.5x realtime)
    pub speed: f64,
    /// Whether encoding is complete
    pub is_complete: bool,
}

/// What one stderr line from `-progress pipe:2` turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StderrLine {
    /// A `key=value` progress field
    Field,
    /// `progress=continue|end`, closing one progress block
    BlockEnd,
    /// Anything else, i.e. a diagnostic from FFmpeg itself
    Diagnostic,
}

/// Parse a stderr line, folding progress fields into `current`.
pub(crate) fn parse_progress_line(line: &str, current: &mut FfmpegProgress) -> StderrLine {
    let line = line.trim();
    let Some((key, value)) = line.split_once('=') else {
        return StderrLine::Diagnostic;
    };

    match key {
        "out_time_us" => {
            if let Ok(us) = value.parse::<i64>() {
                current.out_time_ms = us / 1000;
            }
        }
        "frame" => {
            if let Ok(frame) = value.parse() {
                current.frame = frame;
            }
        }
        "speed" => {
            // Format: "1.5x" or "N/A"
            if let Some(speed) = value.strip_suffix('x').and_then(|s| s.trim().parse().ok()) {
                current.speed = speed;
            }
        }
        "progress" => {
            // "continue" or "end"
            current.is_complete = value == "end";
            return StderrLine::BlockEnd;
        }
        k if k.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') => {}
        _ => return StderrLine::Diagnostic,
    }
    StderrLine::Field
}
