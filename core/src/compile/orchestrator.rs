//! The pipeline driver.
//!
//! A compile walks a fixed state machine: `Validating -> Synthesizing ->
//! Encoding -> Serializing -> Done`, with `Failed` and `Cancelled` reachable
//! from anywhere. Synthesis and encoding fan out across nodes on a
//! `JoinSet` bounded by a worker-count semaphore; raw audio produced by the
//! synthesis phase is spooled to scratch WAV files so the working set stays
//! at one decoded buffer per worker, not one per node.
//!
//! Before any engine runs, every node's recipe hash is checked against the
//! asset store; hits skip both engine phases. `compile` itself never
//! returns `Err`: all failures land in the result's report.

use crate::compile::{
    CompileStage, CompilerConfig, ProgressBus, ProgressEvent, ProgressKind,
};
use crate::pack::{write_pack_file, Pack, PackAsset, PackNode};
use crate::store::{file_recipe_hash, recipe_hash, AssetKind, AssetStore};
use crate::story::{NodeId, RawStory, StoryGraph};
use crate::util::gen_id;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use storypack_audio::{
    AudioEncoder, RawAudio, SynthesisAdapter, SynthesisAdapterConfig, SynthesisEngine, Transcoder,
};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

/// Cooperative cancellation token for a running compile. One handle per
/// [`Compiler`]; once cancelled it stays cancelled.
#[derive(Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// How a node's narration ended up in (or out of) the pack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeOutcome {
    /// Recipe already in the store; no engine was invoked.
    CacheHit,
    /// Text went through synthesis and encoding.
    Synthesized,
    /// Pre-recorded file re-encoded to the target profile.
    Prerecorded,
    /// Node carries no narration at all.
    Silent,
    /// Work was abandoned after cancellation or an earlier failure.
    Skipped,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompileFailure {
    pub node: Option<NodeId>,
    pub stage: CompileStage,
    pub message: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CompileStats {
    pub total_nodes: usize,
    pub cache_hits: usize,
    pub synthesized: usize,
    pub prerecorded: usize,
    pub elapsed_ms: u64,
}

/// Everything a front-end needs to report a compile: terminal state, the
/// artifact path on success, per-node outcomes, and the failure report.
#[derive(Clone, Debug)]
pub struct CompileResult {
    pub state: CompileStage,
    pub artifact: Option<PathBuf>,
    pub outcomes: HashMap<NodeId, NodeOutcome>,
    pub failures: Vec<CompileFailure>,
    pub stats: CompileStats,
}

impl CompileResult {
    pub fn is_success(&self) -> bool {
        self.state == CompileStage::Done
    }
}

enum JobSource {
    /// Narration text to synthesize.
    Text(String),
    /// Pre-recorded WAV to re-encode.
    File(PathBuf),
}

/// One unit of engine work: a node that missed the cache.
struct NarrationJob {
    node: NodeId,
    recipe: String,
    source: JobSource,
}

struct Spooled {
    scratch: PathBuf,
    spent_ms: u64,
}

/// Mutable state for one compile run.
struct JobCtx {
    graph: StoryGraph,
    tag: String,
    jobs: Vec<NarrationJob>,
    spooled: Vec<Option<Spooled>>,
    audio_by_node: HashMap<NodeId, String>,
    image_by_node: HashMap<NodeId, String>,
    outcomes: HashMap<NodeId, NodeOutcome>,
    failures: Vec<CompileFailure>,
    abort: Arc<AtomicBool>,
}

enum SynthOutput {
    Done {
        idx: usize,
        scratch: PathBuf,
        spent_ms: u64,
    },
    Skipped {
        idx: usize,
    },
    Failed {
        idx: usize,
        message: String,
    },
}

enum EncodeInput {
    Spooled { scratch: PathBuf, spent_ms: u64 },
    File(PathBuf),
}

enum EncodeOutput {
    Done {
        idx: usize,
        content_hash: String,
        prerecorded: bool,
    },
    Skipped {
        idx: usize,
    },
    Failed {
        idx: usize,
        message: String,
    },
}

pub struct Compiler {
    cfg: CompilerConfig,
    synth: Arc<SynthesisAdapter>,
    encoder: Arc<AudioEncoder>,
    store: Arc<AssetStore>,
    progress: Arc<ProgressBus>,
    cancel: CancelHandle,
}

impl Compiler {
    /// Build a compiler around injected engines. Opens (or creates) the
    /// asset store under the configured cache dir.
    pub fn new(
        cfg: Option<CompilerConfig>,
        engine: Arc<dyn SynthesisEngine>,
        transcoder: Arc<dyn Transcoder>,
    ) -> crate::Result<Self> {
        let cfg = cfg.unwrap_or_default();
        std::fs::create_dir_all(&cfg.work_dir)?;
        let store = Arc::new(AssetStore::open(&cfg.cache_dir)?);
        let synth = Arc::new(SynthesisAdapter::new(
            engine,
            Some(SynthesisAdapterConfig {
                max_retries: cfg.max_retries,
                backoff_base_ms: cfg.backoff_base_ms,
                timeout_ms: cfg.synth_timeout_ms,
            }),
        ));
        let encoder = Arc::new(AudioEncoder::new(transcoder));
        info!(
            target = "compiler",
            engine = %synth.engine_name(),
            workers = cfg.worker_count,
            cache = %cfg.cache_dir.display(),
            "Compiler ready"
        );
        Ok(Self {
            cfg,
            synth,
            encoder,
            store,
            progress: Arc::new(ProgressBus::new()),
            cancel: CancelHandle::new(),
        })
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.cfg
    }

    pub fn progress(&self) -> Arc<ProgressBus> {
        self.progress.clone()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn store(&self) -> Arc<AssetStore> {
        self.store.clone()
    }

    /// Run the whole pipeline. Never returns `Err`: validation problems,
    /// engine failures, and timeouts all land in the result's report.
    pub async fn compile(&self, story: RawStory, output: &Path) -> CompileResult {
        let started = Instant::now();
        let stage_cell = Mutex::new(CompileStage::Validating);

        let mut result = if self.cfg.job_timeout_secs == 0 {
            self.run(story, output, &stage_cell).await
        } else {
            let budget = Duration::from_secs(self.cfg.job_timeout_secs);
            match timeout(budget, self.run(story, output, &stage_cell)).await {
                Ok(result) => result,
                Err(_) => {
                    let stage = stage_cell
                        .lock()
                        .map(|s| *s)
                        .unwrap_or(CompileStage::Validating);
                    warn!(
                        target = "compiler",
                        %stage,
                        budget_secs = self.cfg.job_timeout_secs,
                        "Job budget exhausted"
                    );
                    let failure = CompileFailure {
                        node: None,
                        stage,
                        message: format!(
                            "Job exceeded its {} s budget",
                            self.cfg.job_timeout_secs
                        ),
                    };
                    self.finish(
                        CompileStage::Failed,
                        None,
                        HashMap::new(),
                        vec![failure],
                        CompileStats::default(),
                    )
                }
            }
        };

        // Completed work stays reusable even after cancellation or failure.
        if let Err(e) = self.store.flush() {
            warn!(target = "store", error = %e, "Could not flush asset store manifest");
        }
        result.stats.elapsed_ms = started.elapsed().as_millis() as u64;
        result
    }

    async fn run(
        &self,
        story: RawStory,
        output: &Path,
        stage_cell: &Mutex<CompileStage>,
    ) -> CompileResult {
        info!(target = "compiler", output = %output.display(), "Compile started");
        self.progress
            .publish(ProgressEvent::new(ProgressKind::Started, CompileStage::Validating));

        let graph = match StoryGraph::build(story) {
            Ok(graph) => graph,
            Err(e) => {
                warn!(target = "compiler", error = %e, "Story validation failed");
                let failure = CompileFailure {
                    node: None,
                    stage: CompileStage::Validating,
                    message: e.to_string(),
                };
                return self.finish(
                    CompileStage::Failed,
                    None,
                    HashMap::new(),
                    vec![failure],
                    CompileStats::default(),
                );
            }
        };

        let total_nodes = graph.len();
        let mut ctx = JobCtx {
            graph,
            tag: gen_id(),
            jobs: Vec::new(),
            spooled: Vec::new(),
            audio_by_node: HashMap::new(),
            image_by_node: HashMap::new(),
            outcomes: HashMap::new(),
            failures: Vec::new(),
            abort: Arc::new(AtomicBool::new(false)),
        };

        self.set_stage(stage_cell, CompileStage::Synthesizing);
        self.plan_jobs(&mut ctx);
        if self.cfg.fail_fast && !ctx.failures.is_empty() {
            return self.finish_ctx(CompileStage::Failed, None, ctx, total_nodes);
        }

        self.synthesize_all(&mut ctx).await;
        if self.cancel.is_cancelled() {
            self.sweep_scratch(&mut ctx);
            return self.finish_ctx(CompileStage::Cancelled, None, ctx, total_nodes);
        }
        if self.cfg.fail_fast && !ctx.failures.is_empty() {
            self.sweep_scratch(&mut ctx);
            return self.finish_ctx(CompileStage::Failed, None, ctx, total_nodes);
        }

        self.set_stage(stage_cell, CompileStage::Encoding);
        self.encode_all(&mut ctx).await;
        if self.cancel.is_cancelled() {
            return self.finish_ctx(CompileStage::Cancelled, None, ctx, total_nodes);
        }
        if !ctx.failures.is_empty() {
            return self.finish_ctx(CompileStage::Failed, None, ctx, total_nodes);
        }

        self.set_stage(stage_cell, CompileStage::Serializing);
        self.ingest_images(&mut ctx);
        if !ctx.failures.is_empty() {
            return self.finish_ctx(CompileStage::Failed, None, ctx, total_nodes);
        }
        if self.cancel.is_cancelled() {
            return self.finish_ctx(CompileStage::Cancelled, None, ctx, total_nodes);
        }

        let pack = match self.assemble(&mut ctx) {
            Some(pack) => pack,
            None => return self.finish_ctx(CompileStage::Failed, None, ctx, total_nodes),
        };
        match write_pack_file(&pack, output) {
            Ok(()) => self.finish_ctx(
                CompileStage::Done,
                Some(output.to_path_buf()),
                ctx,
                total_nodes,
            ),
            Err(e) => {
                ctx.failures.push(CompileFailure {
                    node: None,
                    stage: CompileStage::Serializing,
                    message: e.to_string(),
                });
                self.finish_ctx(CompileStage::Failed, None, ctx, total_nodes)
            }
        }
    }

    /// Partition nodes into engine jobs, cache hits, and silent nodes.
    /// Pre-recorded narration is hashed here so its cache key exists before
    /// any engine runs.
    fn plan_jobs(&self, ctx: &mut JobCtx) {
        for node in ctx.graph.nodes() {
            if let Some(audio_ref) = node.audio.as_deref() {
                let path = ctx.graph.resolve_asset(audio_ref);
                let bytes = match std::fs::read(&path) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let message =
                            format!("Narration file {} is unreadable: {}", path.display(), e);
                        warn!(target = "compiler", node = %node.id, error = %message, "Node failed");
                        self.progress.publish(
                            ProgressEvent::new(ProgressKind::NodeFailed, CompileStage::Synthesizing)
                                .with_node(node.id.clone())
                                .with_detail(message.clone()),
                        );
                        ctx.outcomes.insert(node.id.clone(), NodeOutcome::Failed);
                        ctx.failures.push(CompileFailure {
                            node: Some(node.id.clone()),
                            stage: CompileStage::Synthesizing,
                            message,
                        });
                        continue;
                    }
                };
                let source_hash = AssetStore::hash_bytes(&bytes);
                let recipe = match file_recipe_hash(&source_hash, &self.cfg.profile) {
                    Ok(recipe) => recipe,
                    Err(e) => {
                        ctx.outcomes.insert(node.id.clone(), NodeOutcome::Failed);
                        ctx.failures.push(CompileFailure {
                            node: Some(node.id.clone()),
                            stage: CompileStage::Synthesizing,
                            message: format!("Could not compute cache key: {}", e),
                        });
                        continue;
                    }
                };
                if let Some(asset) = self.store.lookup_recipe(&recipe) {
                    debug!(target = "compiler", node = %node.id, hash = %asset.content_hash, "Narration cache hit");
                    self.progress.publish(
                        ProgressEvent::new(ProgressKind::CacheHit, CompileStage::Synthesizing)
                            .with_node(node.id.clone())
                            .with_detail(asset.content_hash.clone()),
                    );
                    ctx.audio_by_node
                        .insert(node.id.clone(), asset.content_hash.clone());
                    ctx.outcomes.insert(node.id.clone(), NodeOutcome::CacheHit);
                } else {
                    ctx.jobs.push(NarrationJob {
                        node: node.id.clone(),
                        recipe,
                        source: JobSource::File(path),
                    });
                }
            } else if node.needs_synthesis() {
                let text = node.text.clone().unwrap_or_default();
                let recipe = match recipe_hash(&text, &self.cfg.voice, &self.cfg.profile) {
                    Ok(recipe) => recipe,
                    Err(e) => {
                        ctx.outcomes.insert(node.id.clone(), NodeOutcome::Failed);
                        ctx.failures.push(CompileFailure {
                            node: Some(node.id.clone()),
                            stage: CompileStage::Synthesizing,
                            message: format!("Could not compute cache key: {}", e),
                        });
                        continue;
                    }
                };
                if let Some(asset) = self.store.lookup_recipe(&recipe) {
                    debug!(target = "compiler", node = %node.id, hash = %asset.content_hash, "Narration cache hit");
                    self.progress.publish(
                        ProgressEvent::new(ProgressKind::CacheHit, CompileStage::Synthesizing)
                            .with_node(node.id.clone())
                            .with_detail(asset.content_hash.clone()),
                    );
                    ctx.audio_by_node
                        .insert(node.id.clone(), asset.content_hash.clone());
                    ctx.outcomes.insert(node.id.clone(), NodeOutcome::CacheHit);
                } else {
                    ctx.jobs.push(NarrationJob {
                        node: node.id.clone(),
                        recipe,
                        source: JobSource::Text(text),
                    });
                }
            } else {
                ctx.outcomes.insert(node.id.clone(), NodeOutcome::Silent);
            }
        }
        ctx.spooled.resize_with(ctx.jobs.len(), || None);
        info!(
            target = "compiler",
            jobs = ctx.jobs.len(),
            cache_hits = ctx.audio_by_node.len(),
            "Narration plan ready"
        );
    }

    /// Phase one: synthesize every text job in parallel, spooling raw audio
    /// to scratch WAVs.
    async fn synthesize_all(&self, ctx: &mut JobCtx) {
        let semaphore = Arc::new(Semaphore::new(self.cfg.worker_count.max(1)));
        let budget_ms = self.cfg.node_timeout_secs.saturating_mul(1000);
        let mut set: JoinSet<SynthOutput> = JoinSet::new();

        for (idx, job) in ctx.jobs.iter().enumerate() {
            let text = match &job.source {
                JobSource::Text(text) => text.clone(),
                JobSource::File(_) => continue,
            };
            let sem = semaphore.clone();
            let synth = self.synth.clone();
            let voice = self.cfg.voice.clone();
            let cancel = self.cancel.clone();
            let abort = ctx.abort.clone();
            let scratch = self.cfg.work_dir.join(format!("raw_{}_{}.wav", ctx.tag, idx));

            set.spawn(async move {
                let _permit = match sem.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return SynthOutput::Skipped { idx },
                };
                if cancel.is_cancelled() || abort.load(Ordering::SeqCst) {
                    return SynthOutput::Skipped { idx };
                }
                let started = Instant::now();
                match with_budget(budget_ms, synth.synthesize(&text, &voice)).await {
                    None => SynthOutput::Failed {
                        idx,
                        message: format!("Synthesis exceeded the node budget ({} ms)", budget_ms),
                    },
                    Some(Err(e)) => SynthOutput::Failed {
                        idx,
                        message: e.to_string(),
                    },
                    Some(Ok(raw)) => match raw.write_wav(&scratch) {
                        Ok(()) => SynthOutput::Done {
                            idx,
                            scratch,
                            spent_ms: started.elapsed().as_millis() as u64,
                        },
                        Err(e) => SynthOutput::Failed {
                            idx,
                            message: format!("Could not spool raw audio: {}", e),
                        },
                    },
                }
            });
        }

        while let Some(joined) = set.join_next().await {
            let output = match joined {
                Ok(output) => output,
                Err(e) => {
                    if e.is_cancelled() {
                        continue;
                    }
                    ctx.failures.push(CompileFailure {
                        node: None,
                        stage: CompileStage::Synthesizing,
                        message: format!("Synthesis worker panicked: {}", e),
                    });
                    if self.cfg.fail_fast {
                        ctx.abort.store(true, Ordering::SeqCst);
                        set.abort_all();
                    }
                    continue;
                }
            };
            match output {
                SynthOutput::Done {
                    idx,
                    scratch,
                    spent_ms,
                } => {
                    let node = ctx.jobs[idx].node.clone();
                    debug!(target = "compiler", node = %node, spent_ms, "Node synthesized");
                    self.progress.publish(
                        ProgressEvent::new(ProgressKind::Synthesized, CompileStage::Synthesizing)
                            .with_node(node),
                    );
                    ctx.spooled[idx] = Some(Spooled { scratch, spent_ms });
                }
                SynthOutput::Skipped { idx } => {
                    let node = ctx.jobs[idx].node.clone();
                    ctx.outcomes.entry(node).or_insert(NodeOutcome::Skipped);
                }
                SynthOutput::Failed { idx, message } => {
                    self.note_node_failure(ctx, idx, CompileStage::Synthesizing, message);
                    if self.cfg.fail_fast {
                        ctx.abort.store(true, Ordering::SeqCst);
                        set.abort_all();
                    }
                }
            }
        }
    }

    /// Phase two: re-encode every spooled buffer and pre-recorded file,
    /// landing results in the asset store under the node's recipe.
    async fn encode_all(&self, ctx: &mut JobCtx) {
        let semaphore = Arc::new(Semaphore::new(self.cfg.worker_count.max(1)));
        let budget_ms = self.cfg.node_timeout_secs.saturating_mul(1000);
        let mut set: JoinSet<EncodeOutput> = JoinSet::new();

        for (idx, job) in ctx.jobs.iter().enumerate() {
            let input = match &job.source {
                JobSource::Text(_) => match ctx.spooled[idx].take() {
                    Some(spooled) => EncodeInput::Spooled {
                        scratch: spooled.scratch,
                        spent_ms: spooled.spent_ms,
                    },
                    // Synthesis failed or was skipped; nothing to encode.
                    None => {
                        ctx.outcomes
                            .entry(job.node.clone())
                            .or_insert(NodeOutcome::Skipped);
                        continue;
                    }
                },
                JobSource::File(path) => EncodeInput::File(path.clone()),
            };
            let sem = semaphore.clone();
            let encoder = self.encoder.clone();
            let store = self.store.clone();
            let profile = self.cfg.profile.clone();
            let recipe = job.recipe.clone();
            let cancel = self.cancel.clone();
            let abort = ctx.abort.clone();

            set.spawn(async move {
                let _permit = match sem.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        discard_input(&input);
                        return EncodeOutput::Skipped { idx };
                    }
                };
                if cancel.is_cancelled() || abort.load(Ordering::SeqCst) {
                    discard_input(&input);
                    return EncodeOutput::Skipped { idx };
                }

                let (raw_result, remaining_ms, prerecorded) = match &input {
                    EncodeInput::Spooled { scratch, spent_ms } => {
                        let remaining = if budget_ms == 0 {
                            0
                        } else {
                            budget_ms.saturating_sub(*spent_ms)
                        };
                        if budget_ms != 0 && remaining == 0 {
                            let _ = std::fs::remove_file(scratch);
                            return EncodeOutput::Failed {
                                idx,
                                message: format!(
                                    "Node exceeded its {} ms budget during synthesis",
                                    budget_ms
                                ),
                            };
                        }
                        let raw = RawAudio::from_wav_path(scratch)
                            .map_err(|e| format!("Spooled audio is unreadable: {}", e));
                        let _ = std::fs::remove_file(scratch);
                        (raw, remaining, false)
                    }
                    EncodeInput::File(path) => (
                        RawAudio::from_wav_path(path).map_err(|e| {
                            format!(
                                "Pre-recorded narration {} is not readable WAV audio: {}",
                                path.display(),
                                e
                            )
                        }),
                        budget_ms,
                        true,
                    ),
                };
                let raw = match raw_result {
                    Ok(raw) => raw,
                    Err(message) => return EncodeOutput::Failed { idx, message },
                };

                let encoded = match with_budget(remaining_ms, encoder.encode(&raw, &profile)).await
                {
                    None => {
                        return EncodeOutput::Failed {
                            idx,
                            message: format!(
                                "Encoding exceeded the node budget ({} ms)",
                                remaining_ms
                            ),
                        }
                    }
                    Some(Err(e)) => {
                        return EncodeOutput::Failed {
                            idx,
                            message: e.to_string(),
                        }
                    }
                    Some(Ok(encoded)) => encoded,
                };

                let asset = match store.insert(AssetKind::Audio, &encoded.bytes) {
                    Ok(asset) => asset,
                    Err(e) => {
                        return EncodeOutput::Failed {
                            idx,
                            message: format!("Could not store encoded narration: {}", e),
                        }
                    }
                };
                store.record_recipe(&recipe, &asset.content_hash);
                EncodeOutput::Done {
                    idx,
                    content_hash: asset.content_hash,
                    prerecorded,
                }
            });
        }

        while let Some(joined) = set.join_next().await {
            let output = match joined {
                Ok(output) => output,
                Err(e) => {
                    if e.is_cancelled() {
                        continue;
                    }
                    ctx.failures.push(CompileFailure {
                        node: None,
                        stage: CompileStage::Encoding,
                        message: format!("Encoding worker panicked: {}", e),
                    });
                    if self.cfg.fail_fast {
                        ctx.abort.store(true, Ordering::SeqCst);
                        set.abort_all();
                    }
                    continue;
                }
            };
            match output {
                EncodeOutput::Done {
                    idx,
                    content_hash,
                    prerecorded,
                } => {
                    let node = ctx.jobs[idx].node.clone();
                    debug!(target = "compiler", node = %node, hash = %content_hash, "Node encoded");
                    self.progress.publish(
                        ProgressEvent::new(ProgressKind::Encoded, CompileStage::Encoding)
                            .with_node(node.clone())
                            .with_detail(content_hash.clone()),
                    );
                    ctx.audio_by_node.insert(node.clone(), content_hash);
                    let outcome = if prerecorded {
                        NodeOutcome::Prerecorded
                    } else {
                        NodeOutcome::Synthesized
                    };
                    ctx.outcomes.insert(node, outcome);
                }
                EncodeOutput::Skipped { idx } => {
                    let node = ctx.jobs[idx].node.clone();
                    ctx.outcomes.entry(node).or_insert(NodeOutcome::Skipped);
                }
                EncodeOutput::Failed { idx, message } => {
                    self.note_node_failure(ctx, idx, CompileStage::Encoding, message);
                    if self.cfg.fail_fast {
                        ctx.abort.store(true, Ordering::SeqCst);
                        set.abort_all();
                    }
                }
            }
        }
    }

    /// Artwork goes through the store at assembly time; images are small
    /// and need no engine, so this stays sequential.
    fn ingest_images(&self, ctx: &mut JobCtx) {
        for node in ctx.graph.nodes() {
            if let Some(image_ref) = node.image.as_deref() {
                let path = ctx.graph.resolve_asset(image_ref);
                match std::fs::read(&path) {
                    Ok(bytes) if bytes.is_empty() => {
                        ctx.failures.push(CompileFailure {
                            node: Some(node.id.clone()),
                            stage: CompileStage::Serializing,
                            message: format!("Image {} is empty", path.display()),
                        });
                    }
                    Ok(bytes) => match self.store.insert(AssetKind::Image, &bytes) {
                        Ok(asset) => {
                            debug!(target = "compiler", node = %node.id, hash = %asset.content_hash, "Image ingested");
                            ctx.image_by_node.insert(node.id.clone(), asset.content_hash);
                        }
                        Err(e) => {
                            ctx.failures.push(CompileFailure {
                                node: Some(node.id.clone()),
                                stage: CompileStage::Serializing,
                                message: format!(
                                    "Could not store image {}: {}",
                                    path.display(),
                                    e
                                ),
                            });
                        }
                    },
                    Err(e) => {
                        ctx.failures.push(CompileFailure {
                            node: Some(node.id.clone()),
                            stage: CompileStage::Serializing,
                            message: format!("Image {} is unreadable: {}", path.display(), e),
                        });
                    }
                }
            }
        }
    }

    /// Build the in-memory pack from the graph plus resolved asset hashes,
    /// pulling payload bytes back out of the store.
    fn assemble(&self, ctx: &mut JobCtx) -> Option<Pack> {
        let failures_before = ctx.failures.len();
        let mut pack = Pack::new(ctx.graph.meta().clone());
        let mut wanted: Vec<(String, AssetKind)> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for node in ctx.graph.nodes() {
            let audio = ctx.audio_by_node.get(&node.id).cloned();
            let image = ctx.image_by_node.get(&node.id).cloned();
            if let Some(hash) = &audio {
                if seen.insert(hash.clone()) {
                    wanted.push((hash.clone(), AssetKind::Audio));
                }
            }
            if let Some(hash) = &image {
                if seen.insert(hash.clone()) {
                    wanted.push((hash.clone(), AssetKind::Image));
                }
            }
            pack.nodes.push(PackNode {
                id: node.id.clone(),
                entry_point: node.entry_point,
                terminal: node.terminal,
                audio,
                image,
                transitions: node.transitions.clone(),
            });
        }

        for (hash, kind) in wanted {
            match self.store.get(&hash) {
                Ok(Some(bytes)) => pack.assets.push(PackAsset {
                    kind,
                    content_hash: hash,
                    bytes,
                }),
                Ok(None) => ctx.failures.push(CompileFailure {
                    node: None,
                    stage: CompileStage::Serializing,
                    message: format!("Cached object {} has gone missing", hash),
                }),
                Err(e) => ctx.failures.push(CompileFailure {
                    node: None,
                    stage: CompileStage::Serializing,
                    message: format!("Could not load cached object {}: {}", hash, e),
                }),
            }
        }

        if ctx.failures.len() == failures_before {
            Some(pack)
        } else {
            None
        }
    }

    fn note_node_failure(
        &self,
        ctx: &mut JobCtx,
        idx: usize,
        stage: CompileStage,
        message: String,
    ) {
        let node = ctx.jobs[idx].node.clone();
        warn!(target = "compiler", node = %node, %stage, error = %message, "Node failed");
        self.progress.publish(
            ProgressEvent::new(ProgressKind::NodeFailed, stage)
                .with_node(node.clone())
                .with_detail(message.clone()),
        );
        ctx.outcomes.insert(node.clone(), NodeOutcome::Failed);
        ctx.failures.push(CompileFailure {
            node: Some(node),
            stage,
            message,
        });
    }

    fn sweep_scratch(&self, ctx: &mut JobCtx) {
        for slot in ctx.spooled.iter_mut() {
            if let Some(spooled) = slot.take() {
                let _ = std::fs::remove_file(&spooled.scratch);
            }
        }
    }

    fn set_stage(&self, cell: &Mutex<CompileStage>, stage: CompileStage) {
        if let Ok(mut current) = cell.lock() {
            *current = stage;
        }
        info!(target = "compiler", %stage, "Stage changed");
        self.progress
            .publish(ProgressEvent::new(ProgressKind::StageChanged, stage));
    }

    fn finish_ctx(
        &self,
        state: CompileStage,
        artifact: Option<PathBuf>,
        ctx: JobCtx,
        total_nodes: usize,
    ) -> CompileResult {
        self.finish(
            state,
            artifact,
            ctx.outcomes,
            ctx.failures,
            CompileStats {
                total_nodes,
                ..Default::default()
            },
        )
    }

    fn finish(
        &self,
        state: CompileStage,
        artifact: Option<PathBuf>,
        outcomes: HashMap<NodeId, NodeOutcome>,
        failures: Vec<CompileFailure>,
        mut stats: CompileStats,
    ) -> CompileResult {
        for outcome in outcomes.values() {
            match outcome {
                NodeOutcome::CacheHit => stats.cache_hits += 1,
                NodeOutcome::Synthesized => stats.synthesized += 1,
                NodeOutcome::Prerecorded => stats.prerecorded += 1,
                _ => {}
            }
        }
        self.progress
            .publish(ProgressEvent::new(ProgressKind::Finished, state));
        match state {
            CompileStage::Done => info!(
                target = "compiler",
                cache_hits = stats.cache_hits,
                synthesized = stats.synthesized,
                prerecorded = stats.prerecorded,
                "Compile finished"
            ),
            CompileStage::Cancelled => warn!(target = "compiler", "Compile cancelled"),
            _ => warn!(
                target = "compiler",
                failures = failures.len(),
                "Compile failed"
            ),
        }
        CompileResult {
            state,
            artifact,
            outcomes,
            failures,
            stats,
        }
    }
}

async fn with_budget<F: std::future::Future>(budget_ms: u64, fut: F) -> Option<F::Output> {
    if budget_ms == 0 {
        Some(fut.await)
    } else {
        timeout(Duration::from_millis(budget_ms), fut).await.ok()
    }
}

fn discard_input(input: &EncodeInput) {
    if let EncodeInput::Spooled { scratch, .. } = input {
        let _ = std::fs::remove_file(scratch);
    }
}
