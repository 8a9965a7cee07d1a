use std::fs;
use std::path::{Path, PathBuf};

use storypack_audio::{Codec, FfmpegTranscoderConfig, PiperEngineConfig};
use storypack_core::CompilerConfig;

/// Everything the CLI needs to stand up a compiler: the core configuration
/// plus the external binary locations the engines run.
#[derive(Clone, Debug)]
pub struct PackgenConfig {
    pub compiler: CompilerConfig,
    pub piper_bin: Option<PathBuf>,
    pub voice_dir: Option<PathBuf>,
    pub ffmpeg_bin: Option<PathBuf>,
}

impl Default for PackgenConfig {
    fn default() -> Self {
        Self {
            compiler: CompilerConfig::default(),
            piper_bin: None,
            voice_dir: None,
            ffmpeg_bin: None,
        }
    }
}

impl PackgenConfig {
    /// Load configuration from a TOML file (path via PACKGEN_CONFIG or
    /// ./packgen.toml), overlaying values onto env-driven defaults.
    pub fn load() -> Self {
        let default = Self::default();
        let path = std::env::var("PACKGEN_CONFIG").unwrap_or_else(|_| "packgen.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(target = "packgen", path = %path, "No TOML config found; using defaults/env");
            return default;
        }
        match fs::read_to_string(p) {
            Ok(s) => match toml::from_str::<PackgenToml>(&s) {
                Ok(t) => t.overlay(default),
                Err(e) => {
                    tracing::warn!(target = "packgen", error = %e, "Failed to parse TOML; using defaults");
                    default
                }
            },
            Err(e) => {
                tracing::warn!(target = "packgen", error = %e, "Failed to read TOML; using defaults");
                default
            }
        }
    }

    /// Engine configuration for the Piper process, with the configured
    /// binary and voice directory layered over env/PATH detection.
    pub fn piper_config(&self) -> PiperEngineConfig {
        let mut cfg = PiperEngineConfig::default();
        cfg.work_dir = self.compiler.work_dir.clone();
        if let Some(bin) = &self.piper_bin {
            cfg.piper_bin = Some(bin.clone());
        }
        if let Some(dir) = &self.voice_dir {
            cfg.voice_dir = Some(dir.clone());
        }
        cfg
    }

    pub fn ffmpeg_config(&self) -> FfmpegTranscoderConfig {
        let mut cfg = FfmpegTranscoderConfig::default();
        cfg.work_dir = self.compiler.work_dir.clone();
        if let Some(bin) = &self.ffmpeg_bin {
            cfg.ffmpeg_bin = Some(bin.clone());
        }
        cfg
    }
}

// =========================
// TOML overlay definitions
// =========================

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct PackgenToml {
    pub voice: Option<String>,
    pub piper_bin: Option<PathBuf>,
    pub voice_dir: Option<PathBuf>,
    pub ffmpeg_bin: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub worker_count: Option<usize>,
    pub max_retries: Option<u32>,
    pub backoff_base_ms: Option<u64>,
    pub synth_timeout_ms: Option<u64>,
    pub node_timeout_secs: Option<u64>,
    pub job_timeout_secs: Option<u64>,
    pub fail_fast: Option<bool>,
    pub target_format: Option<TargetFormatToml>,
}

impl PackgenToml {
    fn overlay(self, mut base: PackgenConfig) -> PackgenConfig {
        if let Some(v) = self.voice {
            base.compiler.voice.voice = v;
        }
        if let Some(v) = self.piper_bin {
            base.piper_bin = Some(v);
        }
        if let Some(v) = self.voice_dir {
            base.voice_dir = Some(v);
        }
        if let Some(v) = self.ffmpeg_bin {
            base.ffmpeg_bin = Some(v);
        }
        if let Some(v) = self.work_dir {
            base.compiler.work_dir = v;
        }
        if let Some(v) = self.cache_dir {
            base.compiler.cache_dir = v;
        }
        if let Some(v) = self.worker_count {
            base.compiler.worker_count = v.max(1);
        }
        if let Some(v) = self.max_retries {
            base.compiler.max_retries = v;
        }
        if let Some(v) = self.backoff_base_ms {
            base.compiler.backoff_base_ms = v;
        }
        if let Some(v) = self.synth_timeout_ms {
            base.compiler.synth_timeout_ms = v;
        }
        if let Some(v) = self.node_timeout_secs {
            base.compiler.node_timeout_secs = v;
        }
        if let Some(v) = self.job_timeout_secs {
            base.compiler.job_timeout_secs = v;
        }
        if let Some(v) = self.fail_fast {
            base.compiler.fail_fast = v;
        }
        if let Some(t) = self.target_format {
            t.apply(&mut base.compiler.profile);
        }
        base
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct TargetFormatToml {
    pub codec: Option<Codec>,
    pub bitrate_kbps: Option<u32>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub target_level_dbfs: Option<f32>,
    pub silence_threshold_db: Option<f32>,
}

impl TargetFormatToml {
    fn apply(self, p: &mut storypack_audio::EncodingProfile) {
        if let Some(v) = self.codec {
            p.codec = v;
        }
        if let Some(v) = self.bitrate_kbps {
            p.bitrate_kbps = v;
        }
        if let Some(v) = self.sample_rate {
            p.sample_rate = v;
        }
        if let Some(v) = self.channels {
            p.channels = v;
        }
        if let Some(v) = self.target_level_dbfs {
            p.target_level_dbfs = v;
        }
        if let Some(v) = self.silence_threshold_db {
            p.silence_threshold_db = v;
        }
    }
}
