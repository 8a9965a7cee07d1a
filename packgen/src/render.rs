//! Progress rendering for the compile command. Events go to stderr so the
//! pack path on stdout stays scriptable.

use storypack_core::{CompileResult, CompileStage, ProgressEvent, ProgressKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub fn spawn(mut rx: mpsc::Receiver<ProgressEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            render(&event);
        }
    })
}

fn render(event: &ProgressEvent) {
    match event.kind {
        ProgressKind::Started => eprintln!("compiling..."),
        ProgressKind::StageChanged => eprintln!("stage: {}", event.stage),
        ProgressKind::CacheHit => {
            if let Some(node) = &event.node {
                eprintln!("  = {} (cached)", node);
            }
        }
        ProgressKind::Synthesized => {
            if let Some(node) = &event.node {
                eprintln!("  ~ {} narrated", node);
            }
        }
        ProgressKind::Encoded => {
            if let Some(node) = &event.node {
                eprintln!("  + {} encoded", node);
            }
        }
        ProgressKind::NodeFailed => {
            if let Some(node) = &event.node {
                eprintln!("  ✗ {}: {}", node, event.detail);
            } else {
                eprintln!("  ✗ {}", event.detail);
            }
        }
        ProgressKind::Finished => {}
    }
}

pub fn print_summary(result: &CompileResult) {
    let stats = &result.stats;
    match result.state {
        CompileStage::Done => {
            eprintln!(
                "✓ {} nodes ({} cached, {} synthesized, {} pre-recorded) in {} ms",
                stats.total_nodes,
                stats.cache_hits,
                stats.synthesized,
                stats.prerecorded,
                stats.elapsed_ms
            );
            if let Some(path) = &result.artifact {
                println!("{}", path.display());
            }
        }
        CompileStage::Cancelled => {
            eprintln!("⚠️ compile cancelled after {} ms; no pack written", stats.elapsed_ms);
        }
        _ => {
            eprintln!(
                "✗ compile failed after {} ms; no pack written",
                stats.elapsed_ms
            );
        }
    }
}

pub fn print_failure_report(result: &CompileResult) {
    if result.failures.is_empty() {
        return;
    }
    eprintln!("{} failure(s):", result.failures.len());
    for failure in &result.failures {
        match &failure.node {
            Some(node) => eprintln!("  {} [{}]: {}", node, failure.stage, failure.message),
            None => eprintln!("  [{}]: {}", failure.stage, failure.message),
        }
    }
}
