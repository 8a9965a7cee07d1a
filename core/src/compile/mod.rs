//! The compile pipeline: configuration, progress fan-out, and the
//! orchestrator that drives a validated story graph through synthesis,
//! encoding, and pack serialization.

mod config;
mod orchestrator;
mod progress;

pub use config::CompilerConfig;
pub use orchestrator::{
    CancelHandle, CompileFailure, CompileResult, CompileStats, Compiler, NodeOutcome,
};
pub use progress::{ProgressBus, ProgressBusStats, ProgressEvent, ProgressKind};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline stage, observable in progress events and the final result.
/// `Done`, `Failed`, and `Cancelled` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileStage {
    Validating,
    Synthesizing,
    Encoding,
    Serializing,
    Done,
    Failed,
    Cancelled,
}

impl CompileStage {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CompileStage::Done | CompileStage::Failed | CompileStage::Cancelled
        )
    }
}

impl fmt::Display for CompileStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompileStage::Validating => "validating",
            CompileStage::Synthesizing => "synthesizing",
            CompileStage::Encoding => "encoding",
            CompileStage::Serializing => "serializing",
            CompileStage::Done => "done",
            CompileStage::Failed => "failed",
            CompileStage::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}
