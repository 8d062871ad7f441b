//! Transcoding parameters.
//!
//! Jobs carry free-form parameters; the transcoder reads the keys it knows
//! from them and falls back to defaults for the rest.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Output resolution preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Resolution {
    #[serde(rename = "480p")]
    P480,
    #[default]
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "1080p")]
    P1080,
}

impl Resolution {
    /// Target frame size (width, height).
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Resolution::P480 => (854, 480),
            Resolution::P720 => (1280, 720),
            Resolution::P1080 => (1920, 1080),
        }
    }

    /// Parse a resolution label; unknown labels fall back to 720p.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "480p" => Resolution::P480,
            "1080p" => Resolution::P1080,
            _ => Resolution::P720,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::P480 => "480p",
            Resolution::P720 => "720p",
            Resolution::P1080 => "1080p",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parameters understood by the transcoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscodeParams {
    pub resolution: Resolution,
    /// Container format of the output
    pub format: String,
    /// x264 preset
    pub preset: String,
    /// Constant rate factor
    pub crf: u8,
}

impl Default for TranscodeParams {
    fn default() -> Self {
        Self {
            resolution: Resolution::P720,
            format: "mp4".to_string(),
            preset: "slow".to_string(),
            crf: 20,
        }
    }
}

impl TranscodeParams {
    /// Read known keys out of free-form job parameters.
    ///
    /// `crf` is accepted as a number or a numeric string, and clamped to the
    /// x264 range 0..=51. `forceFormat` is accepted as an alias of `format`.
    pub fn from_value(params: &serde_json::Value) -> Self {
        let defaults = Self::default();
        let str_field = |key: &str| params.get(key).and_then(|v| v.as_str());

        let resolution = str_field("resolution")
            .map(Resolution::from_label)
            .unwrap_or(defaults.resolution);

        let format = str_field("format")
            .or_else(|| str_field("forceFormat"))
            .map(|f| f.trim().to_lowercase())
            .filter(|f| !f.is_empty())
            .unwrap_or(defaults.format);

        let preset = str_field("preset")
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or(defaults.preset);

        let crf = params
            .get("crf")
            .and_then(|v| {
                v.as_u64()
                    .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
            })
            .map(|c| c.min(51) as u8)
            .unwrap_or(defaults.crf);

        Self {
            resolution,
            format,
            preset,
            crf,
        }
    }
}
