// Storypack Core Library
// Story-graph validation, narration pipeline, and binary pack container

pub mod compile;
pub mod pack;
pub mod store;
pub mod story;

pub(crate) mod util;

// Export core types
pub use compile::{
    CancelHandle, CompileFailure, CompileResult, CompileStage, CompileStats, Compiler,
    CompilerConfig, NodeOutcome, ProgressBus, ProgressEvent, ProgressKind,
};
pub use pack::{Pack, PackAsset, PackNode, PackReader};
pub use store::{AssetKind, AssetStore, StoredAsset};
pub use story::{
    GraphError, NodeId, PackMeta, RawStory, StoryGraph, StoryNode, Transition, Trigger,
};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PackError {
    #[error("Story error: {0}")]
    Graph(#[from] story::GraphError),

    #[error("Synthesis error: {0}")]
    Synthesis(#[from] storypack_audio::SynthesisError),

    #[error("Encoding error: {0}")]
    Encoding(#[from] storypack_audio::EncodingError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] pack::SerializationError),

    #[error("Pack format error: {0}")]
    Format(#[from] pack::FormatError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Job timed out after {0} s")]
    JobTimeout(u64),

    #[error("Compile cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
pub type Result<T> = std::result::Result<T, PackError>;
