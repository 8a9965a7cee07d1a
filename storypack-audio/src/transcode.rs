//! External transcoding engine behind a trait seam.
//!
//! Production shells out to ffmpeg through scratch files in the work dir.
//! The invocation pins every varying knob (`-fflags +bitexact`, metadata
//! stripped) so identical input always yields identical compressed bytes.
//!
//! Env overrides:
//! - FFMPEG_BIN, ENCODE_TIMEOUT_MS, PACKGEN_WORK_DIR

use crate::encode::{Codec, EncodingError, EncodingProfile};
use crate::utils::{gen_id, get_from_env_or_path};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tokio::task;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// Compresses conditioned WAV bytes into the device codec.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// The engine name, for logs and reports (e.g. "ffmpeg").
    fn name(&self) -> String;

    /// Transcode a complete in-memory WAV into `profile.codec` bytes.
    async fn transcode(
        &self,
        wav: &[u8],
        profile: &EncodingProfile,
    ) -> Result<Vec<u8>, EncodingError>;
}

#[derive(Clone, Debug)]
pub struct FfmpegTranscoderConfig {
    pub ffmpeg_bin: Option<PathBuf>,
    pub work_dir: PathBuf,
    pub timeout_ms: u64,
}

impl Default for FfmpegTranscoderConfig {
    fn default() -> Self {
        let ffmpeg_bin = get_from_env_or_path("FFMPEG_BIN", "ffmpeg");
        let work_dir = std::env::var("PACKGEN_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());
        let timeout_ms = std::env::var("ENCODE_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(60_000);
        Self {
            ffmpeg_bin,
            work_dir,
            timeout_ms,
        }
    }
}

/// Transcoder backed by a local ffmpeg binary.
pub struct FfmpegTranscoder {
    cfg: FfmpegTranscoderConfig,
}

impl FfmpegTranscoder {
    pub fn new(cfg: Option<FfmpegTranscoderConfig>) -> Self {
        let cfg = cfg.unwrap_or_default();
        if let Some(ref p) = cfg.ffmpeg_bin {
            info!(target = "encoder", bin = ?p, "Detected ffmpeg binary");
        } else {
            warn!(target = "encoder", "⚠️ ffmpeg binary not found; encoding will fail");
        }
        Self { cfg }
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    fn name(&self) -> String {
        "ffmpeg".to_string()
    }

    async fn transcode(
        &self,
        wav: &[u8],
        profile: &EncodingProfile,
    ) -> Result<Vec<u8>, EncodingError> {
        let ffmpeg = self.cfg.ffmpeg_bin.clone().ok_or_else(|| {
            EncodingError::EngineError {
                status: -1,
                stderr: "ffmpeg binary not found".into(),
            }
        })?;

        let id = gen_id();
        let in_path = self.cfg.work_dir.join(format!("enc_{}.wav", id));
        let out_path = self
            .cfg
            .work_dir
            .join(format!("enc_{}.{}", id, profile.codec.as_str()));

        std::fs::write(&in_path, wav)?;

        let profile = profile.clone();
        let run_in = in_path.clone();
        let run_out = out_path.clone();
        let join = task::spawn_blocking(move || run_ffmpeg(&ffmpeg, &run_in, &run_out, &profile));

        let result = match timeout(Duration::from_millis(self.cfg.timeout_ms), join).await {
            Ok(join_res) => join_res.map_err(|e| EncodingError::EngineError {
                status: -1,
                stderr: format!("transcode task: {}", e),
            })?,
            Err(_) => Err(EncodingError::EngineError {
                status: -1,
                stderr: format!("ffmpeg timed out after {} ms", self.cfg.timeout_ms),
            }),
        };

        let bytes = result.and_then(|_| std::fs::read(&out_path).map_err(EncodingError::Io));
        for p in [&in_path, &out_path] {
            if let Err(e) = std::fs::remove_file(p) {
                debug!(target = "encoder", path = ?p, error = %e, "Failed to remove scratch file");
            }
        }
        bytes
    }
}

fn run_ffmpeg(
    ffmpeg: &Path,
    input: &Path,
    output: &Path,
    profile: &EncodingProfile,
) -> Result<(), EncodingError> {
    let mut cmd = Command::new(ffmpeg);
    cmd.arg("-hide_banner").arg("-loglevel").arg("error");
    cmd.arg("-y");
    cmd.arg("-i").arg(input);
    cmd.arg("-vn");
    cmd.arg("-ac").arg(profile.channels.to_string());
    cmd.arg("-ar").arg(profile.sample_rate.to_string());
    match profile.codec {
        Codec::Mp3 => {
            cmd.arg("-c:a").arg("libmp3lame");
            cmd.arg("-id3v2_version").arg("0");
        }
        Codec::Ogg => {
            cmd.arg("-c:a").arg("libvorbis");
        }
    }
    cmd.arg("-b:a").arg(format!("{}k", profile.bitrate_kbps));
    // Identical input must produce identical bytes for dedup to hold.
    cmd.arg("-fflags").arg("+bitexact");
    cmd.arg("-flags:a").arg("+bitexact");
    cmd.arg("-map_metadata").arg("-1");
    cmd.arg(output);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    debug!(target = "encoder", command = ?cmd, "Running ffmpeg");
    let output_res = cmd.output().map_err(EncodingError::Io)?;
    if !output_res.status.success() {
        return Err(EncodingError::EngineError {
            status: output_res.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output_res.stderr).to_string(),
        });
    }
    Ok(())
}
