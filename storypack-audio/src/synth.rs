//! Narration synthesis: engine trait, Piper subprocess engine, retrying adapter.
//!
//! The adapter is what the compiler calls. It owns the per-call deadline and
//! the retry budget; the engine behind it only knows how to turn text into
//! raw PCM. Production uses Piper via a local subprocess:
//! - text on stdin, `-m` voice model, WAV written to a scratch file
//! - non-zero exit is reported with the process stderr attached
//!
//! Env overrides:
//! - PIPER_BIN, PIPER_VOICE_DIR
//! - SYNTH_TIMEOUT_MS, PACKGEN_WORK_DIR

use crate::raw::RawAudio;
use crate::utils::{gen_id, get_from_env_or_path};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use thiserror::Error;
use tokio::task;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SynthesisError {
    #[error("Synthesis timed out after {0} ms")]
    Timeout(u64),

    #[error("Synthesis engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Synthesis input rejected: {0}")]
    InputRejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SynthesisError {
    /// Transient failures are worth another attempt; everything else is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, SynthesisError::EngineUnavailable(_))
    }
}

/// Voice selection and prosody parameters for one synthesis call.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VoiceParams {
    /// Voice model path or name (resolved against the engine's voice dir).
    pub voice: String,
    /// Speech rate multiplier (0.5-2.0, 1.0 = model default).
    pub rate: f32,
    /// Requested output sample rate.
    pub sample_rate: u32,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            voice: String::new(),
            rate: 1.0,
            sample_rate: 22_050,
        }
    }
}

/// A text-to-speech engine. Implementations must not mutate shared state
/// beyond returning the audio buffer.
#[async_trait]
pub trait SynthesisEngine: Send + Sync {
    /// The engine name, for logs and reports (e.g. "piper").
    fn name(&self) -> String;

    /// Synthesize narration audio for `text` with the given voice.
    async fn synthesize(&self, text: &str, voice: &VoiceParams)
        -> Result<RawAudio, SynthesisError>;
}

#[derive(Clone, Debug)]
pub struct PiperEngineConfig {
    pub piper_bin: Option<PathBuf>,
    pub voice_dir: Option<PathBuf>,
    pub work_dir: PathBuf,
}

impl Default for PiperEngineConfig {
    fn default() -> Self {
        let piper_bin = get_from_env_or_path("PIPER_BIN", "piper");
        let voice_dir = std::env::var("PIPER_VOICE_DIR").ok().map(PathBuf::from);
        let work_dir = std::env::var("PACKGEN_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir());
        Self {
            piper_bin,
            voice_dir,
            work_dir,
        }
    }
}

/// Synthesis engine backed by a local Piper binary.
pub struct PiperEngine {
    cfg: PiperEngineConfig,
}

impl PiperEngine {
    pub fn new(cfg: Option<PiperEngineConfig>) -> Self {
        let cfg = cfg.unwrap_or_default();
        if let Some(ref p) = cfg.piper_bin {
            info!(target = "synthesis", bin = ?p, "Detected Piper binary");
        } else {
            warn!(target = "synthesis", "⚠️ Piper binary not found; synthesis will fail");
        }
        Self { cfg }
    }

    fn resolve_voice_path(&self, voice: &str) -> Option<PathBuf> {
        if voice.is_empty() {
            return None;
        }
        let direct = PathBuf::from(voice);
        if direct.exists() {
            return Some(direct);
        }
        if let Some(dir) = &self.cfg.voice_dir {
            let candidate = dir.join(voice);
            if candidate.exists() {
                return Some(candidate);
            }
            for ext in ["onnx", "onnx.gz"].iter() {
                let c = dir.join(format!("{}.{}", voice, ext));
                if c.exists() {
                    return Some(c);
                }
            }
        }
        None
    }
}

#[async_trait]
impl SynthesisEngine for PiperEngine {
    fn name(&self) -> String {
        "piper".to_string()
    }

    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceParams,
    ) -> Result<RawAudio, SynthesisError> {
        if text.trim().is_empty() {
            return Err(SynthesisError::InputRejected("empty narration text".into()));
        }
        let piper = self
            .cfg
            .piper_bin
            .clone()
            .ok_or_else(|| SynthesisError::EngineUnavailable("Piper binary not found".into()))?;
        let voice_path = self.resolve_voice_path(&voice.voice).ok_or_else(|| {
            SynthesisError::InputRejected(format!(
                "voice model not found: {:?} (set PIPER_VOICE_DIR or pass a path)",
                voice.voice
            ))
        })?;

        let wav_path = self.cfg.work_dir.join(format!("synth_{}.wav", gen_id()));
        let text = text.to_string();
        let rate = voice.rate;
        let sample_rate = voice.sample_rate;

        let out_path = wav_path.clone();
        let join = task::spawn_blocking(move || {
            run_piper(&piper, &voice_path, rate, sample_rate, &text, &out_path)
        });
        join.await
            .map_err(|e| SynthesisError::EngineUnavailable(format!("synthesis task: {}", e)))??;

        let audio = RawAudio::from_wav_path(&wav_path).map_err(|e| {
            SynthesisError::EngineUnavailable(format!("Piper produced unreadable WAV: {}", e))
        })?;
        if let Err(e) = std::fs::remove_file(&wav_path) {
            debug!(target = "synthesis", path = ?wav_path, error = %e, "Failed to remove scratch WAV");
        }
        Ok(audio)
    }
}

fn run_piper(
    piper: &Path,
    voice_path: &Path,
    rate: f32,
    sample_rate: u32,
    text: &str,
    out_wav: &Path,
) -> Result<(), SynthesisError> {
    let mut cmd = Command::new(piper);
    cmd.arg("-m").arg(voice_path);
    cmd.arg("-f").arg(out_wav);
    let length_scale = (1.0f32 / rate.clamp(0.5, 2.0)).clamp(0.5, 2.0);
    cmd.arg("--length_scale").arg(format!("{:.2}", length_scale));
    cmd.arg("--sample_rate").arg(sample_rate.to_string());
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    debug!(target = "synthesis", command = ?cmd, "Running piper");
    let mut child = cmd.spawn().map_err(|e| {
        SynthesisError::EngineUnavailable(format!("failed to spawn Piper: {}", e))
    })?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(text.as_bytes()).map_err(SynthesisError::Io)?;
    }
    let output = child.wait_with_output().map_err(SynthesisError::Io)?;
    if !output.status.success() {
        return Err(SynthesisError::EngineUnavailable(format!(
            "Piper failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct SynthesisAdapterConfig {
    /// Retry budget for transient failures. 2 means up to 3 attempts total.
    pub max_retries: u32,
    /// Base backoff; attempt n sleeps base * 2^n before retrying.
    pub backoff_base_ms: u64,
    /// Wall-clock cap per synthesis call.
    pub timeout_ms: u64,
}

impl Default for SynthesisAdapterConfig {
    fn default() -> Self {
        let timeout_ms = std::env::var("SYNTH_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(30_000);
        Self {
            max_retries: 2,
            backoff_base_ms: 200,
            timeout_ms,
        }
    }
}

/// Wraps a [`SynthesisEngine`] with the failure policy the compiler expects:
/// a hard per-call deadline, and exponential-backoff retries for transient
/// engine failures. Permanent rejections pass through untouched.
pub struct SynthesisAdapter {
    engine: Arc<dyn SynthesisEngine>,
    cfg: SynthesisAdapterConfig,
}

impl SynthesisAdapter {
    pub fn new(engine: Arc<dyn SynthesisEngine>, cfg: Option<SynthesisAdapterConfig>) -> Self {
        Self {
            engine,
            cfg: cfg.unwrap_or_default(),
        }
    }

    pub fn engine_name(&self) -> String {
        self.engine.name()
    }

    pub async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceParams,
    ) -> Result<RawAudio, SynthesisError> {
        let mut attempt: u32 = 0;
        loop {
            let call = self.engine.synthesize(text, voice);
            let result = match timeout(Duration::from_millis(self.cfg.timeout_ms), call).await {
                Ok(r) => r,
                Err(_) => return Err(SynthesisError::Timeout(self.cfg.timeout_ms)),
            };

            match result {
                Ok(audio) => return Ok(audio),
                Err(e) if e.is_transient() && attempt < self.cfg.max_retries => {
                    let backoff = self.cfg.backoff_base_ms.saturating_mul(1 << attempt);
                    warn!(
                        target = "synthesis",
                        attempt = attempt + 1,
                        backoff_ms = backoff,
                        error = %e,
                        "Transient synthesis failure, retrying"
                    );
                    sleep(Duration::from_millis(backoff)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Engine that fails with a transient error a fixed number of times
    /// before succeeding.
    struct FlakyEngine {
        failures_before_success: u32,
        calls: AtomicU32,
    }

    impl FlakyEngine {
        fn new(failures_before_success: u32) -> Self {
            Self {
                failures_before_success,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl SynthesisEngine for FlakyEngine {
        fn name(&self) -> String {
            "flaky".to_string()
        }

        async fn synthesize(
            &self,
            _text: &str,
            voice: &VoiceParams,
        ) -> Result<RawAudio, SynthesisError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Err(SynthesisError::EngineUnavailable("engine busy".into()))
            } else {
                Ok(RawAudio::new(vec![0.1, 0.2], voice.sample_rate, 1))
            }
        }
    }

    struct RejectingEngine;

    #[async_trait]
    impl SynthesisEngine for RejectingEngine {
        fn name(&self) -> String {
            "rejecting".to_string()
        }

        async fn synthesize(
            &self,
            _text: &str,
            _voice: &VoiceParams,
        ) -> Result<RawAudio, SynthesisError> {
            Err(SynthesisError::InputRejected("unsupported voice".into()))
        }
    }

    struct StallingEngine;

    #[async_trait]
    impl SynthesisEngine for StallingEngine {
        fn name(&self) -> String {
            "stalling".to_string()
        }

        async fn synthesize(
            &self,
            _text: &str,
            _voice: &VoiceParams,
        ) -> Result<RawAudio, SynthesisError> {
            sleep(Duration::from_secs(60)).await;
            unreachable!("call should have been cut off by the adapter deadline");
        }
    }

    fn fast_cfg(max_retries: u32) -> SynthesisAdapterConfig {
        SynthesisAdapterConfig {
            max_retries,
            backoff_base_ms: 1,
            timeout_ms: 200,
        }
    }

    #[tokio::test]
    async fn transient_failures_within_budget_succeed() {
        let engine = Arc::new(FlakyEngine::new(2));
        let adapter = SynthesisAdapter::new(engine.clone(), Some(fast_cfg(2)));

        let result = adapter.synthesize("hello", &VoiceParams::default()).await;
        assert!(result.is_ok(), "third attempt should succeed: {:?}", result.err());
        assert_eq!(
            engine.calls.load(Ordering::SeqCst),
            3,
            "two failures plus one success"
        );
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_surfaces_engine_unavailable() {
        let engine = Arc::new(FlakyEngine::new(10));
        let adapter = SynthesisAdapter::new(engine.clone(), Some(fast_cfg(2)));

        let result = adapter.synthesize("hello", &VoiceParams::default()).await;
        assert!(matches!(result, Err(SynthesisError::EngineUnavailable(_))));
        assert_eq!(
            engine.calls.load(Ordering::SeqCst),
            3,
            "budget of 2 retries means exactly 3 attempts"
        );
    }

    #[tokio::test]
    async fn permanent_rejection_is_not_retried() {
        let engine = Arc::new(RejectingEngine);
        let adapter = SynthesisAdapter::new(engine, Some(fast_cfg(5)));

        let result = adapter.synthesize("hello", &VoiceParams::default()).await;
        assert!(matches!(result, Err(SynthesisError::InputRejected(_))));
    }

    #[tokio::test]
    async fn slow_engine_hits_the_deadline() {
        let adapter = SynthesisAdapter::new(Arc::new(StallingEngine), Some(fast_cfg(0)));

        let result = adapter.synthesize("hello", &VoiceParams::default()).await;
        assert!(matches!(result, Err(SynthesisError::Timeout(200))));
    }
}
