// Audio capabilities for the story-pack compiler

// Shared audio utilities
pub(crate) mod utils;

pub mod raw;

pub use raw::RawAudio;

pub mod synth;

pub use synth::{
    PiperEngine, PiperEngineConfig, SynthesisAdapter, SynthesisAdapterConfig, SynthesisEngine,
    SynthesisError, VoiceParams,
};

pub mod encode;

pub use encode::{AudioEncoder, Codec, EncodedAudio, EncodingError, EncodingProfile};

pub mod transcode;

pub use transcode::{FfmpegTranscoder, FfmpegTranscoderConfig, Transcoder};
