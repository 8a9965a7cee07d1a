mod cli;
mod config;
mod render;
mod simulate;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use cli::{Cli, Command};
use config::PackgenConfig;
use storypack_audio::{FfmpegTranscoder, PiperEngine};
use storypack_core::{Compiler, PackReader, RawStory};
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logging / tracing; stdout carries only the command's own output
    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info,storypack_core=info,packgen=info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Compile {
            script,
            output,
            voice,
            workers,
            keep_going,
        } => compile(script, output, voice, workers, keep_going).await,
        Command::Inspect { pack } => inspect(&pack),
        Command::Simulate { pack, entry } => Ok(simulate::run(&pack, entry)?),
    }
}

async fn compile(
    script: PathBuf,
    output: PathBuf,
    voice: Option<String>,
    workers: Option<usize>,
    keep_going: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    // Defaults + env + optional TOML overlay, then CLI flags on top
    let mut cfg = PackgenConfig::load();
    if let Some(voice) = voice {
        cfg.compiler.voice.voice = voice;
    }
    if let Some(workers) = workers {
        cfg.compiler.worker_count = workers.max(1);
    }
    if keep_going {
        cfg.compiler.fail_fast = false;
    }

    let story = RawStory::load(&script)?;
    info!(
        target = "packgen",
        script = %script.display(),
        nodes = story.nodes.len(),
        "Loaded story script"
    );

    let piper_cfg = cfg.piper_config();
    let ffmpeg_cfg = cfg.ffmpeg_config();
    let engine = Arc::new(PiperEngine::new(Some(piper_cfg)));
    let transcoder = Arc::new(FfmpegTranscoder::new(Some(ffmpeg_cfg)));
    let compiler = Compiler::new(Some(cfg.compiler), engine, transcoder)?;

    let (sub_id, rx) = compiler.progress().subscribe();
    let renderer = render::spawn(rx);

    // Ctrl-C cancels the run; finished narration stays cached.
    let cancel = compiler.cancel_handle();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!(target = "packgen", "Interrupt received; cancelling compile");
            cancel.cancel();
        }
    });

    let result = compiler.compile(story, &output).await;
    compiler.progress().unsubscribe(&sub_id);
    let _ = renderer.await;

    render::print_failure_report(&result);
    render::print_summary(&result);
    if !result.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

fn inspect(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let reader = PackReader::open(path)?;
    let meta = reader.meta();

    println!(
        "pack: {} (format v{})",
        path.display(),
        reader.format_version()
    );
    println!(
        "title: {}  language: {}  version: {}",
        meta.title, meta.language, meta.version
    );
    if !meta.description.is_empty() {
        println!("description: {}", meta.description);
    }
    let entry_ids = reader
        .entry_points()
        .iter()
        .map(|&o| reader.node_id(o).map(|id| id.to_string()))
        .collect::<Result<Vec<_>, _>>()?;
    println!(
        "nodes: {}  assets: {}  entry points: {}",
        reader.node_count(),
        reader.asset_count(),
        entry_ids.join(", ")
    );

    println!();
    println!(
        "{:>5}  {:<24}  {:<5}  {:<12}  {:<12}  {}",
        "ord", "id", "flags", "audio", "image", "transitions"
    );
    for (ordinal, node) in reader.nodes()?.iter().enumerate() {
        let mut flags = String::new();
        if node.entry_point {
            flags.push('E');
        }
        if node.terminal {
            flags.push('T');
        }
        if flags.is_empty() {
            flags.push('-');
        }
        println!(
            "{:>5}  {:<24}  {:<5}  {:<12}  {:<12}  {}",
            ordinal,
            node.id.as_str(),
            flags,
            node.audio.as_deref().map(short).unwrap_or("-"),
            node.image.as_deref().map(short).unwrap_or("-"),
            node.transitions.len()
        );
    }

    println!();
    println!("{:>5}  {:<6}  {:>10}  {}", "ord", "kind", "bytes", "hash");
    for ordinal in 0..reader.asset_count() {
        let entry = reader
            .asset_entry(ordinal)
            .ok_or("asset index out of range")?;
        let kind = match entry.kind {
            0 => "audio",
            1 => "image",
            _ => "?",
        };
        println!(
            "{:>5}  {:<6}  {:>10}  {}",
            ordinal,
            kind,
            entry.blob_len,
            reader.asset_hash(ordinal)?
        );
    }
    Ok(())
}

fn short(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}
