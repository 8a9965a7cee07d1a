//! Raw PCM audio buffers and WAV conversion.

use std::io::Cursor;
use std::path::Path;

/// Uncompressed audio as interleaved f32 samples.
///
/// This is the exchange type between the synthesis engine and the encoder.
/// Samples are normalized to [-1.0, 1.0]; `channels` frames are interleaved.
#[derive(Clone, Debug, PartialEq)]
pub struct RawAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl RawAudio {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Number of frames (samples per channel).
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    /// Duration of the audio in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Parse a WAV file from disk. Accepts 16-bit integer and 32-bit float PCM.
    pub fn from_wav_path(path: &Path) -> Result<Self, hound::Error> {
        let reader = hound::WavReader::open(path)?;
        Self::from_reader(reader)
    }

    /// Parse a WAV file held in memory.
    pub fn from_wav_bytes(bytes: &[u8]) -> Result<Self, hound::Error> {
        let reader = hound::WavReader::new(Cursor::new(bytes))?;
        Self::from_reader(reader)
    }

    fn from_reader<R: std::io::Read>(reader: hound::WavReader<R>) -> Result<Self, hound::Error> {
        let spec = reader.spec();
        let samples = match (spec.sample_format, spec.bits_per_sample) {
            (hound::SampleFormat::Int, 16) => reader
                .into_samples::<i16>()
                .map(|s| s.map(|v| v as f32 / i16::MAX as f32))
                .collect::<Result<Vec<f32>, _>>()?,
            (hound::SampleFormat::Float, 32) => reader
                .into_samples::<f32>()
                .collect::<Result<Vec<f32>, _>>()?,
            _ => return Err(hound::Error::Unsupported),
        };
        Ok(Self {
            samples,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
        })
    }

    /// Encode as 16-bit PCM WAV in memory. This is the shape external
    /// transcoders consume.
    pub fn to_wav_bytes(&self) -> Result<Vec<u8>, hound::Error> {
        let spec = hound::WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
            for &sample in &self.samples {
                let clamped = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                writer.write_sample(clamped)?;
            }
            writer.finalize()?;
        }
        Ok(cursor.into_inner())
    }

    /// Write a 16-bit PCM WAV file to disk.
    pub fn write_wav(&self, path: &Path) -> Result<(), hound::Error> {
        let spec = hound::WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec)?;
        for &sample in &self.samples {
            let clamped = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer.write_sample(clamped)?;
        }
        writer.finalize()
    }
}
