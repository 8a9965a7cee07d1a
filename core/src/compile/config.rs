//! Compiler configuration.
//!
//! Env overrides (all optional):
//! - PACKGEN_VOICE, PACKGEN_WORK_DIR, PACKGEN_CACHE_DIR
//! - PACKGEN_WORKERS, PACKGEN_MAX_RETRIES, PACKGEN_BACKOFF_BASE_MS
//! - PACKGEN_NODE_TIMEOUT_SECS, PACKGEN_JOB_TIMEOUT_SECS, PACKGEN_FAIL_FAST
//! - SYNTH_TIMEOUT_MS

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use storypack_audio::{EncodingProfile, VoiceParams};

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// Voice used for every synthesized node.
    pub voice: VoiceParams,
    /// Target encoding for all narration audio.
    pub profile: EncodingProfile,
    /// Scratch directory for spooled raw audio.
    pub work_dir: PathBuf,
    /// Asset store root; survives across runs.
    pub cache_dir: PathBuf,
    /// Parallel workers per phase.
    pub worker_count: usize,
    /// Retry budget for transient synthesis failures.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    /// Wall-clock cap for one synthesis call.
    pub synth_timeout_ms: u64,
    /// Combined synthesis + encoding budget per node. 0 disables it.
    pub node_timeout_secs: u64,
    /// Budget for the whole compile. 0 disables it.
    pub job_timeout_secs: u64,
    /// Abort outstanding work on the first permanent node failure.
    pub fail_fast: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        let work_dir = std::env::var("PACKGEN_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("packgen"));
        let cache_dir = std::env::var("PACKGEN_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| work_dir.join("cache"));
        let mut voice = VoiceParams::default();
        if let Ok(v) = std::env::var("PACKGEN_VOICE") {
            voice.voice = v;
        }
        Self {
            voice,
            profile: EncodingProfile::default(),
            work_dir,
            cache_dir,
            worker_count: env_parse("PACKGEN_WORKERS", num_cpus::get().max(1)),
            max_retries: env_parse("PACKGEN_MAX_RETRIES", 2),
            backoff_base_ms: env_parse("PACKGEN_BACKOFF_BASE_MS", 200),
            synth_timeout_ms: env_parse("SYNTH_TIMEOUT_MS", 30_000),
            node_timeout_secs: env_parse("PACKGEN_NODE_TIMEOUT_SECS", 60),
            job_timeout_secs: env_parse("PACKGEN_JOB_TIMEOUT_SECS", 0),
            fail_fast: env_parse("PACKGEN_FAIL_FAST", true),
        }
    }
}
