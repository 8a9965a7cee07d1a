//! Audio encoding: normalization, silence trim, resample, transcode.
//!
//! Everything up to transcoding is pure sample math on f32 buffers; the final
//! compression step goes through a [`Transcoder`](crate::transcode::Transcoder)
//! so the compiler can swap the external engine for a deterministic fake in
//! tests. The whole pipeline is a pure function of (raw audio, profile):
//! identical inputs produce byte-identical output, which is what makes
//! content-addressed deduplication sound.

use crate::raw::RawAudio;
use crate::transcode::Transcoder;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum EncodingError {
    #[error("Unsupported sample format: {0}")]
    UnsupportedSampleFormat(String),

    #[error("Encoding engine exited with status {status}: {stderr}")]
    EngineError { status: i32, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Target compressed codec accepted by the playback device.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Mp3,
    Ogg,
}

impl Codec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::Mp3 => "mp3",
            Codec::Ogg => "ogg",
        }
    }
}

/// The device's fixed audio format plus the conditioning knobs applied
/// before transcoding.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EncodingProfile {
    pub codec: Codec,
    pub bitrate_kbps: u32,
    pub sample_rate: u32,
    pub channels: u16,
    /// Peak level the audio is normalized to before compression.
    pub target_level_dbfs: f32,
    /// Leading/trailing frames quieter than this are trimmed.
    pub silence_threshold_db: f32,
}

impl Default for EncodingProfile {
    fn default() -> Self {
        Self {
            codec: Codec::Mp3,
            bitrate_kbps: 64,
            sample_rate: 22_050,
            channels: 1,
            target_level_dbfs: -3.0,
            silence_threshold_db: -45.0,
        }
    }
}

/// Compressed audio ready to be stored in a pack.
#[derive(Clone, Debug)]
pub struct EncodedAudio {
    pub bytes: Vec<u8>,
    pub profile: EncodingProfile,
}

/// Conditions raw PCM and drives the external transcoder.
pub struct AudioEncoder {
    transcoder: Arc<dyn Transcoder>,
}

impl AudioEncoder {
    pub fn new(transcoder: Arc<dyn Transcoder>) -> Self {
        Self { transcoder }
    }

    pub fn engine_name(&self) -> String {
        self.transcoder.name()
    }

    pub async fn encode(
        &self,
        raw: &RawAudio,
        profile: &EncodingProfile,
    ) -> Result<EncodedAudio, EncodingError> {
        validate_input(raw)?;

        let mut samples = raw.samples.clone();
        peak_normalize(&mut samples, profile.target_level_dbfs);
        let mut trimmed = trim_silence(&samples, raw.channels, profile.silence_threshold_db);
        if trimmed.is_empty() {
            // Fully-silent narration stays a short silent clip rather than
            // a zero-length stream the device reader would choke on.
            trimmed = vec![0.0; (raw.sample_rate / 10).max(1) as usize * raw.channels as usize];
        }

        let conditioned = RawAudio::new(trimmed, raw.sample_rate, raw.channels);
        let resampled = resample(&conditioned, profile.sample_rate, profile.channels);

        debug!(
            target = "encoder",
            in_frames = raw.frames(),
            out_frames = resampled.frames(),
            codec = profile.codec.as_str(),
            "Conditioned audio for transcoding"
        );

        let wav = resampled
            .to_wav_bytes()
            .map_err(|e| EncodingError::UnsupportedSampleFormat(e.to_string()))?;
        let bytes = self.transcoder.transcode(&wav, profile).await?;
        Ok(EncodedAudio {
            bytes,
            profile: profile.clone(),
        })
    }
}

fn validate_input(raw: &RawAudio) -> Result<(), EncodingError> {
    if raw.channels == 0 || raw.channels > 2 {
        return Err(EncodingError::UnsupportedSampleFormat(format!(
            "{} channels (expected 1 or 2)",
            raw.channels
        )));
    }
    if raw.sample_rate < 8_000 || raw.sample_rate > 192_000 {
        return Err(EncodingError::UnsupportedSampleFormat(format!(
            "sample rate {} Hz out of range",
            raw.sample_rate
        )));
    }
    if raw.samples.is_empty() {
        return Err(EncodingError::UnsupportedSampleFormat("empty audio".into()));
    }
    if raw.samples.len() % raw.channels as usize != 0 {
        return Err(EncodingError::UnsupportedSampleFormat(
            "sample count not aligned to channel count".into(),
        ));
    }
    Ok(())
}

pub(crate) fn db_to_linear(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// Scale the buffer so its peak sits at `target_dbfs`. Silent buffers are
/// left untouched.
pub fn peak_normalize(samples: &mut [f32], target_dbfs: f32) {
    let peak = samples.iter().fold(0f32, |acc, s| acc.max(s.abs()));
    if peak <= f32::EPSILON {
        return;
    }
    let gain = db_to_linear(target_dbfs) / peak;
    for s in samples.iter_mut() {
        *s *= gain;
    }
}

/// Drop leading and trailing frames whose loudest channel stays below the
/// threshold. Interior silence is preserved.
pub fn trim_silence(samples: &[f32], channels: u16, threshold_db: f32) -> Vec<f32> {
    let ch = channels.max(1) as usize;
    let threshold = db_to_linear(threshold_db);
    let frames = samples.len() / ch;

    let frame_loud = |i: usize| {
        samples[i * ch..(i + 1) * ch]
            .iter()
            .any(|s| s.abs() > threshold)
    };

    let first = (0..frames).find(|&i| frame_loud(i));
    let last = (0..frames).rev().find(|&i| frame_loud(i));
    match (first, last) {
        (Some(a), Some(b)) => samples[a * ch..(b + 1) * ch].to_vec(),
        _ => Vec::new(),
    }
}

/// Linear-interpolation resample plus channel-count conversion.
pub fn resample(audio: &RawAudio, dst_rate: u32, dst_channels: u16) -> RawAudio {
    let converted = match (audio.channels, dst_channels) {
        (2, 1) => downmix_to_mono(audio),
        (1, 2) => duplicate_to_stereo(audio),
        _ => audio.clone(),
    };
    if converted.sample_rate == dst_rate {
        return converted;
    }

    let ch = converted.channels as usize;
    let src_frames = converted.frames();
    if src_frames == 0 {
        return RawAudio::new(Vec::new(), dst_rate, converted.channels);
    }
    let dst_frames =
        ((src_frames as u64 * dst_rate as u64) / converted.sample_rate as u64).max(1) as usize;

    let mut out = Vec::with_capacity(dst_frames * ch);
    let step = converted.sample_rate as f64 / dst_rate as f64;
    for frame in 0..dst_frames {
        let pos = frame as f64 * step;
        let i0 = pos.floor() as usize;
        let i1 = (i0 + 1).min(src_frames - 1);
        let frac = (pos - i0 as f64) as f32;
        for c in 0..ch {
            let a = converted.samples[i0 * ch + c];
            let b = converted.samples[i1 * ch + c];
            out.push(a + (b - a) * frac);
        }
    }
    RawAudio::new(out, dst_rate, converted.channels)
}

fn downmix_to_mono(audio: &RawAudio) -> RawAudio {
    let mono = audio
        .samples
        .chunks_exact(2)
        .map(|pair| (pair[0] + pair[1]) * 0.5)
        .collect();
    RawAudio::new(mono, audio.sample_rate, 1)
}

fn duplicate_to_stereo(audio: &RawAudio) -> RawAudio {
    let mut stereo = Vec::with_capacity(audio.samples.len() * 2);
    for &s in &audio.samples {
        stereo.push(s);
        stereo.push(s);
    }
    RawAudio::new(stereo, audio.sample_rate, 2)
}
