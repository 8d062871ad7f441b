//! Transcoding task.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info};

use transq_models::TranscodeParams;
use transq_storage::ObjectStorage;

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};

/// Containers the x264/AAC output can be written to.
const SUPPORTED_FORMATS: &[&str] = &["mp4", "mov", "mkv"];

/// A long-running task turning the object at `input_ref` into the object at
/// `output_ref`.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn run(
        &self,
        input_ref: &str,
        output_ref: &str,
        params: &serde_json::Value,
    ) -> MediaResult<()>;
}

/// Scale to fit inside the target frame, then letterbox to exactly that size.
pub fn scale_pad_filter(params: &TranscodeParams) -> String {
    let (w, h) = params.resolution.dimensions();
    format!("scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2")
}

/// Build the x264/AAC transcode command.
pub fn transcode_command(
    input: &std::path::Path,
    output: &std::path::Path,
    params: &TranscodeParams,
) -> FfmpegCommand {
    FfmpegCommand::new(input, output)
        .video_filter(scale_pad_filter(params))
        .video_codec("libx264")
        .preset(params.preset.clone())
        .crf(params.crf)
        .audio_codec("aac")
        .movflags("+faststart")
        .format(params.format.clone())
}

/// Transcoder that pulls the input from object storage, runs FFmpeg on local
/// files and uploads the result.
pub struct FfmpegTranscoder {
    storage: Arc<dyn ObjectStorage>,
    work_dir: PathBuf,
    timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(storage: Arc<dyn ObjectStorage>, work_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            storage,
            work_dir,
            timeout,
        }
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn run(
        &self,
        input_ref: &str,
        output_ref: &str,
        params: &serde_json::Value,
    ) -> MediaResult<()> {
        let params = TranscodeParams::from_value(params);
        if !SUPPORTED_FORMATS.contains(&params.format.as_str()) {
            return Err(MediaError::UnsupportedFormat(params.format));
        }

        tokio::fs::create_dir_all(&self.work_dir).await?;
        // Removed with everything in it when dropped
        let scratch = tempfile::Builder::new()
            .prefix("transq-")
            .tempdir_in(&self.work_dir)?;
        let input = scratch.path().join("input");
        let output = scratch.path().join(format!("output.{}", params.format));

        let started = Instant::now();
        self.storage.download_to(input_ref, &input).await?;
        debug!(input_ref, elapsed_ms = started.elapsed().as_millis() as u64, "Downloaded source");

        let cmd = transcode_command(&input, &output, &params);
        let output_ref_owned = output_ref.to_string();
        FfmpegRunner::new()
            .with_timeout(self.timeout)
            .run_with_progress(&cmd, move |p| {
                debug!(
                    output_ref = %output_ref_owned,
                    out_time_ms = p.out_time_ms,
                    frame = p.frame,
                    speed = p.speed,
                    "Transcode progress"
                );
            })
            .await?;

        let size = tokio::fs::metadata(&output)
            .await
            .map(|m| m.len())
            .map_err(|_| MediaError::FileNotFound(output.clone()))?;
        if size == 0 {
            return Err(MediaError::ffmpeg_failed("FFmpeg produced an empty file", None, None));
        }

        self.storage.upload_from(&output, output_ref).await?;

        info!(
            input_ref,
            output_ref,
            resolution = %params.resolution,
            size_bytes = size,
            duration_ms = started.elapsed().as_millis() as u64,
            "Transcode finished"
        );
        Ok(())
    }
}
