//! Compiler orchestration tests
//!
//! End-to-end compiles against fake engines: caching, retries, budgets,
//! cancellation, and the failure policies. No real TTS or ffmpeg involved.

use std::fs;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mockall::mock;
use storypack_audio::{
    EncodingError, EncodingProfile, RawAudio, SynthesisEngine, SynthesisError, Transcoder,
    VoiceParams,
};
use storypack_core::{
    CompileStage, Compiler, CompilerConfig, NodeId, NodeOutcome, PackMeta, PackReader,
    ProgressKind, RawStory, StoryNode, Transition, Trigger,
};
use tempfile::TempDir;
use tokio::sync::Semaphore;

fn meta(title: &str) -> PackMeta {
    PackMeta {
        title: title.to_string(),
        language: "en".to_string(),
        version: 1,
        description: String::new(),
    }
}

fn text_node(id: &str, text: &str) -> StoryNode {
    let mut node = StoryNode::new(id);
    node.text = Some(text.to_string());
    node
}

fn entry(mut node: StoryNode) -> StoryNode {
    node.entry_point = true;
    node
}

fn terminal(mut node: StoryNode) -> StoryNode {
    node.terminal = true;
    node
}

fn auto(mut node: StoryNode, target: &str) -> StoryNode {
    node.transitions.push(Transition {
        target: NodeId::new(target),
        trigger: Trigger::AutoAdvance,
    });
    node
}

fn choice(mut node: StoryNode, target: &str, index: u32) -> StoryNode {
    node.transitions.push(Transition {
        target: NodeId::new(target),
        trigger: Trigger::Choice { index },
    });
    node
}

fn single_node_story() -> RawStory {
    RawStory::new(
        meta("Solo"),
        vec![terminal(entry(text_node("solo", "A very short tale.")))],
    )
}

fn two_node_story() -> RawStory {
    RawStory::new(
        meta("Pair"),
        vec![
            entry(auto(text_node("start", "Once upon a time."), "end")),
            terminal(text_node("end", "The end.")),
        ],
    )
}

/// Entry with two choices, one silent menu node, one terminal.
fn branching_story() -> RawStory {
    let start = entry(choice(
        choice(text_node("start", "You stand before two doors."), "cave", 0),
        "menu",
        1,
    ));
    let cave = auto(text_node("cave", "The cave is dark and cold."), "end");
    let menu = choice(StoryNode::new("menu"), "end", 0);
    let end = terminal(text_node("end", "You made it out. The end."));
    RawStory::new(meta("Two Doors"), vec![start, cave, menu, end])
}

fn test_config(root: &TempDir) -> CompilerConfig {
    let mut cfg = CompilerConfig::default();
    cfg.work_dir = root.path().join("work");
    cfg.cache_dir = root.path().join("cache");
    cfg.worker_count = 4;
    cfg.max_retries = 2;
    cfg.backoff_base_ms = 5;
    cfg.synth_timeout_ms = 5_000;
    cfg.node_timeout_secs = 0;
    cfg.job_timeout_secs = 0;
    cfg.fail_fast = true;
    cfg
}

/// Square-ish wave derived from the text bytes, loud enough to survive
/// silence trimming and distinct per narration line.
fn seeded_audio(text: &str) -> RawAudio {
    let seed = text
        .bytes()
        .fold(7u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    let period = 8 + (seed % 24) as usize;
    let samples = (0..4410)
        .map(|i| if (i / period) % 2 == 0 { 0.4 } else { -0.4 })
        .collect();
    RawAudio::new(samples, 22_050, 1)
}

struct FakeEngine {
    calls: AtomicU32,
}

impl FakeEngine {
    fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SynthesisEngine for FakeEngine {
    fn name(&self) -> String {
        "fake".to_string()
    }

    async fn synthesize(
        &self,
        text: &str,
        _voice: &VoiceParams,
    ) -> Result<RawAudio, SynthesisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(seeded_audio(text))
    }
}

/// Fails the first `failures` calls with a transient error, then succeeds.
struct FlakyEngine {
    calls: AtomicU32,
    failures: u32,
}

impl FlakyEngine {
    fn new(failures: u32) -> Self {
        Self {
            calls: AtomicU32::new(0),
            failures,
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SynthesisEngine for FlakyEngine {
    fn name(&self) -> String {
        "flaky".to_string()
    }

    async fn synthesize(
        &self,
        text: &str,
        _voice: &VoiceParams,
    ) -> Result<RawAudio, SynthesisError> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            Err(SynthesisError::EngineUnavailable(
                "engine rebooting".to_string(),
            ))
        } else {
            Ok(seeded_audio(text))
        }
    }
}

/// Never returns within any test budget.
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
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(SynthesisError::EngineUnavailable("stalled".to_string()))
    }
}

/// Blocks every call behind a semaphore the test controls.
struct GatedEngine {
    gate: Arc<Semaphore>,
    inner: FakeEngine,
}

#[async_trait]
impl SynthesisEngine for GatedEngine {
    fn name(&self) -> String {
        "gated".to_string()
    }

    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceParams,
    ) -> Result<RawAudio, SynthesisError> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| SynthesisError::EngineUnavailable("gate closed".to_string()))?;
        self.inner.synthesize(text, voice).await
    }
}

/// Proof that a code path never reaches synthesis.
struct PanickingEngine;

#[async_trait]
impl SynthesisEngine for PanickingEngine {
    fn name(&self) -> String {
        "untouchable".to_string()
    }

    async fn synthesize(
        &self,
        _text: &str,
        _voice: &VoiceParams,
    ) -> Result<RawAudio, SynthesisError> {
        panic!("synthesis engine must not run");
    }
}

/// Deterministic transcoder: tags the conditioned WAV with the profile so
/// different profiles yield different bytes.
struct FakeTranscoder {
    calls: AtomicU32,
}

impl FakeTranscoder {
    fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    fn name(&self) -> String {
        "fake-codec".to_string()
    }

    async fn transcode(
        &self,
        wav: &[u8],
        profile: &EncodingProfile,
    ) -> Result<Vec<u8>, EncodingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut out = format!("{:?}/{}:", profile.codec, profile.bitrate_kbps).into_bytes();
        out.extend_from_slice(wav);
        Ok(out)
    }
}

mock! {
    pub TargetTranscoder {}

    #[async_trait]
    impl Transcoder for TargetTranscoder {
        fn name(&self) -> String;
        async fn transcode(
            &self,
            wav: &[u8],
            profile: &EncodingProfile,
        ) -> Result<Vec<u8>, EncodingError>;
    }
}

#[tokio::test]
async fn compiles_story_end_to_end() {
    let root = TempDir::new().unwrap();
    let engine = Arc::new(FakeEngine::new());
    let compiler = Compiler::new(
        Some(test_config(&root)),
        engine.clone(),
        Arc::new(FakeTranscoder::new()),
    )
    .unwrap();
    let (_, mut events) = compiler.progress().subscribe();

    let out = root.path().join("tale.pack");
    let result = compiler.compile(branching_story(), &out).await;

    assert!(result.is_success(), "failures: {:?}", result.failures);
    assert_eq!(result.artifact.as_deref(), Some(out.as_path()));
    assert_eq!(result.stats.total_nodes, 4);
    assert_eq!(result.stats.synthesized, 3);
    assert_eq!(result.outcomes[&NodeId::new("menu")], NodeOutcome::Silent);
    assert_eq!(engine.calls(), 3);

    let reader = PackReader::open(&out).unwrap();
    assert_eq!(reader.node_count(), 4);
    assert_eq!(reader.entry_points().len(), 1);
    let start = reader.node_by_id(&NodeId::new("start")).unwrap().unwrap();
    assert!(start.audio.is_some());
    assert_eq!(start.transitions.len(), 2);

    drop(compiler);
    let mut kinds = Vec::new();
    while let Some(event) = events.recv().await {
        kinds.push(event.kind);
    }
    assert_eq!(kinds.first(), Some(&ProgressKind::Started));
    assert_eq!(kinds.last(), Some(&ProgressKind::Finished));
    assert!(kinds.contains(&ProgressKind::Synthesized));
    assert!(kinds.contains(&ProgressKind::Encoded));
}

#[tokio::test]
async fn identical_narration_lands_in_the_pack_once() {
    let root = TempDir::new().unwrap();
    let engine = Arc::new(FakeEngine::new());
    let compiler = Compiler::new(
        Some(test_config(&root)),
        engine.clone(),
        Arc::new(FakeTranscoder::new()),
    )
    .unwrap();

    let story = RawStory::new(
        meta("Echo"),
        vec![
            entry(auto(text_node("a", "Shared line."), "b")),
            auto(text_node("b", "Shared line."), "c"),
            terminal(text_node("c", "Goodbye.")),
        ],
    );
    let out = root.path().join("echo.pack");
    let result = compiler.compile(story, &out).await;

    assert!(result.is_success(), "failures: {:?}", result.failures);
    // Both narrations were synthesized, but the identical output bytes
    // collapse to a single stored asset.
    assert_eq!(engine.calls(), 3);
    let reader = PackReader::open(&out).unwrap();
    assert_eq!(reader.asset_count(), 2);
    let a = reader.node_by_id(&NodeId::new("a")).unwrap().unwrap();
    let b = reader.node_by_id(&NodeId::new("b")).unwrap().unwrap();
    let c = reader.node_by_id(&NodeId::new("c")).unwrap().unwrap();
    assert_eq!(a.audio, b.audio);
    assert_ne!(a.audio, c.audio);
}

#[tokio::test]
async fn transient_failures_retry_then_succeed() {
    let root = TempDir::new().unwrap();
    let engine = Arc::new(FlakyEngine::new(2));
    let compiler = Compiler::new(
        Some(test_config(&root)),
        engine.clone(),
        Arc::new(FakeTranscoder::new()),
    )
    .unwrap();

    let out = root.path().join("solo.pack");
    let result = compiler.compile(single_node_story(), &out).await;

    assert!(result.is_success(), "failures: {:?}", result.failures);
    assert_eq!(engine.calls(), 3);
    assert_eq!(
        result.outcomes[&NodeId::new("solo")],
        NodeOutcome::Synthesized
    );
}

#[tokio::test]
async fn exhausted_retries_fail_the_node_and_the_run() {
    let root = TempDir::new().unwrap();
    let engine = Arc::new(FlakyEngine::new(u32::MAX));
    let compiler = Compiler::new(
        Some(test_config(&root)),
        engine.clone(),
        Arc::new(FakeTranscoder::new()),
    )
    .unwrap();

    let out = root.path().join("solo.pack");
    let result = compiler.compile(single_node_story(), &out).await;

    assert_eq!(result.state, CompileStage::Failed);
    assert!(result.artifact.is_none());
    assert!(!out.exists());
    // max_retries = 2 means three attempts total.
    assert_eq!(engine.calls(), 3);
    assert_eq!(result.outcomes[&NodeId::new("solo")], NodeOutcome::Failed);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].node, Some(NodeId::new("solo")));
    assert_eq!(result.failures[0].stage, CompileStage::Synthesizing);
    assert!(result.failures[0].message.contains("unavailable"));
}

#[tokio::test]
async fn warm_cache_skips_engines_and_reproduces_the_pack() {
    let root = TempDir::new().unwrap();
    let out_first = root.path().join("first.pack");
    let first = Compiler::new(
        Some(test_config(&root)),
        Arc::new(FakeEngine::new()),
        Arc::new(FakeTranscoder::new()),
    )
    .unwrap();
    let result = first.compile(branching_story(), &out_first).await;
    assert!(result.is_success(), "failures: {:?}", result.failures);
    drop(first);

    // Same cache dir, but engines that blow up if anything reaches them.
    let second = Compiler::new(
        Some(test_config(&root)),
        Arc::new(PanickingEngine),
        Arc::new(MockTargetTranscoder::new()),
    )
    .unwrap();
    let out_second = root.path().join("second.pack");
    let result = second.compile(branching_story(), &out_second).await;

    assert!(result.is_success(), "failures: {:?}", result.failures);
    assert_eq!(result.stats.cache_hits, 3);
    let hits = result
        .outcomes
        .values()
        .filter(|o| **o == NodeOutcome::CacheHit)
        .count();
    assert_eq!(hits, 3);
    assert_eq!(
        fs::read(&out_first).unwrap(),
        fs::read(&out_second).unwrap(),
        "recompiling from cache is byte-identical"
    );
}

#[tokio::test]
async fn cancelled_run_publishes_nothing_but_keeps_the_cache() {
    let root = TempDir::new().unwrap();
    let out_first = root.path().join("first.pack");
    let first = Compiler::new(
        Some(test_config(&root)),
        Arc::new(FakeEngine::new()),
        Arc::new(FakeTranscoder::new()),
    )
    .unwrap();
    assert!(first.compile(two_node_story(), &out_first).await.is_success());
    drop(first);

    let second = Compiler::new(
        Some(test_config(&root)),
        Arc::new(PanickingEngine),
        Arc::new(MockTargetTranscoder::new()),
    )
    .unwrap();
    second.cancel_handle().cancel();
    let out_second = root.path().join("second.pack");
    let result = second.compile(two_node_story(), &out_second).await;

    assert_eq!(result.state, CompileStage::Cancelled);
    assert!(result.artifact.is_none());
    assert!(!out_second.exists());
    drop(second);

    // The cache survived the cancelled run.
    let third = Compiler::new(
        Some(test_config(&root)),
        Arc::new(PanickingEngine),
        Arc::new(MockTargetTranscoder::new()),
    )
    .unwrap();
    let out_third = root.path().join("third.pack");
    let result = third.compile(two_node_story(), &out_third).await;
    assert!(result.is_success(), "failures: {:?}", result.failures);
    assert_eq!(result.stats.cache_hits, 2);
}

#[tokio::test]
async fn cancel_during_synthesis_sweeps_scratch_files() {
    let root = TempDir::new().unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let engine = Arc::new(GatedEngine {
        gate: gate.clone(),
        inner: FakeEngine::new(),
    });
    let compiler = Arc::new(
        Compiler::new(
            Some(test_config(&root)),
            engine,
            Arc::new(FakeTranscoder::new()),
        )
        .unwrap(),
    );
    let handle = compiler.cancel_handle();

    let out = root.path().join("tale.pack");
    let task = tokio::spawn({
        let compiler = compiler.clone();
        async move { compiler.compile(two_node_story(), &out).await }
    });

    // Let both synthesis tasks start and park on the gate, then cancel and
    // release them.
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.cancel();
    gate.add_permits(8);

    let result = task.await.unwrap();
    assert_eq!(result.state, CompileStage::Cancelled);
    assert!(result.artifact.is_none());

    let work_dir = compiler.config().work_dir.clone();
    let scratch: Vec<_> = fs::read_dir(&work_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("raw_"))
        .collect();
    assert!(scratch.is_empty(), "spooled audio swept on cancel");
}

#[tokio::test]
async fn collect_all_reports_every_failing_node() {
    let root = TempDir::new().unwrap();
    let mut cfg = test_config(&root);
    cfg.fail_fast = false;
    let engine = Arc::new(FakeEngine::new());
    let compiler =
        Compiler::new(Some(cfg), engine.clone(), Arc::new(FakeTranscoder::new())).unwrap();

    let mut broken_a = StoryNode::new("broken_a");
    broken_a.audio = Some("missing_a.wav".to_string());
    let mut broken_b = StoryNode::new("broken_b");
    broken_b.audio = Some("missing_b.wav".to_string());
    let story = RawStory::new(
        meta("Holes"),
        vec![
            entry(choice(
                choice(
                    choice(text_node("start", "We begin."), "broken_a", 0),
                    "broken_b",
                    1,
                ),
                "good",
                2,
            )),
            auto(broken_a, "end"),
            auto(broken_b, "end"),
            auto(text_node("good", "Still fine."), "end"),
            terminal(text_node("end", "Done.")),
        ],
    );

    let out = root.path().join("holes.pack");
    let result = compiler.compile(story, &out).await;

    assert_eq!(result.state, CompileStage::Failed);
    assert!(result.artifact.is_none());
    assert_eq!(result.failures.len(), 2);
    let mut failed: Vec<_> = result
        .failures
        .iter()
        .filter_map(|f| f.node.clone())
        .collect();
    failed.sort();
    assert_eq!(failed, vec![NodeId::new("broken_a"), NodeId::new("broken_b")]);
    // Healthy nodes still ran so their narration landed in the cache.
    assert_eq!(engine.calls(), 3);
    assert_eq!(
        result.outcomes[&NodeId::new("good")],
        NodeOutcome::Synthesized
    );
}

#[tokio::test]
async fn prerecorded_narration_is_reencoded_not_synthesized() {
    let root = TempDir::new().unwrap();
    let script_dir = TempDir::new().unwrap();
    seeded_audio("hand recorded intro")
        .write_wav(&script_dir.path().join("intro.wav"))
        .unwrap();

    let mut start = StoryNode::new("start");
    start.audio = Some("intro.wav".to_string());
    let mut story = RawStory::new(
        meta("Recorded"),
        vec![
            entry(auto(start, "end")),
            terminal(text_node("end", "Bye.")),
        ],
    );
    story.base_dir = script_dir.path().to_path_buf();

    let engine = Arc::new(FakeEngine::new());
    let transcoder = Arc::new(FakeTranscoder::new());
    let compiler = Compiler::new(Some(test_config(&root)), engine.clone(), transcoder.clone())
        .unwrap();
    let out = root.path().join("recorded.pack");
    let result = compiler.compile(story, &out).await;

    assert!(result.is_success(), "failures: {:?}", result.failures);
    assert_eq!(
        result.outcomes[&NodeId::new("start")],
        NodeOutcome::Prerecorded
    );
    assert_eq!(result.stats.prerecorded, 1);
    // Only "end" went through the synthesis engine; both went through the
    // transcoder.
    assert_eq!(engine.calls(), 1);
    assert_eq!(transcoder.calls(), 2);
}

#[tokio::test]
async fn validation_failure_stops_before_any_engine_runs() {
    let root = TempDir::new().unwrap();
    let compiler = Compiler::new(
        Some(test_config(&root)),
        Arc::new(PanickingEngine),
        Arc::new(MockTargetTranscoder::new()),
    )
    .unwrap();

    let story = RawStory::new(
        meta("Broken"),
        vec![terminal(entry(auto(
            text_node("start", "Hello."),
            "ghost",
        )))],
    );
    let out = root.path().join("broken.pack");
    let result = compiler.compile(story, &out).await;

    assert_eq!(result.state, CompileStage::Failed);
    assert!(result.artifact.is_none());
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].stage, CompileStage::Validating);
    assert!(result.failures[0].message.contains("ghost"));
}

#[tokio::test]
async fn job_budget_fails_the_whole_run() {
    let root = TempDir::new().unwrap();
    let mut cfg = test_config(&root);
    cfg.job_timeout_secs = 1;
    cfg.synth_timeout_ms = 30_000;
    let compiler = Compiler::new(
        Some(cfg),
        Arc::new(StallingEngine),
        Arc::new(FakeTranscoder::new()),
    )
    .unwrap();

    let out = root.path().join("slow.pack");
    let result = compiler.compile(single_node_story(), &out).await;

    assert_eq!(result.state, CompileStage::Failed);
    assert!(result.artifact.is_none());
    assert!(!out.exists());
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].stage, CompileStage::Synthesizing);
    assert!(result.failures[0].message.contains("budget"));
}

#[tokio::test]
async fn node_budget_caps_synthesis_time() {
    let root = TempDir::new().unwrap();
    let mut cfg = test_config(&root);
    cfg.node_timeout_secs = 1;
    cfg.max_retries = 0;
    cfg.synth_timeout_ms = 30_000;
    let compiler = Compiler::new(
        Some(cfg),
        Arc::new(StallingEngine),
        Arc::new(FakeTranscoder::new()),
    )
    .unwrap();

    let out = root.path().join("slow.pack");
    let result = compiler.compile(single_node_story(), &out).await;

    assert_eq!(result.state, CompileStage::Failed);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].node, Some(NodeId::new("solo")));
    assert!(result.failures[0].message.contains("node budget"));
}

#[tokio::test]
async fn silent_nodes_consume_no_engine_calls() {
    let root = TempDir::new().unwrap();
    let engine = Arc::new(FakeEngine::new());
    let compiler = Compiler::new(
        Some(test_config(&root)),
        engine.clone(),
        Arc::new(FakeTranscoder::new()),
    )
    .unwrap();

    let story = RawStory::new(
        meta("Quiet"),
        vec![
            entry(choice(text_node("start", "Pick one."), "menu", 0)),
            choice(StoryNode::new("menu"), "end", 0),
            terminal(text_node("end", "Farewell.")),
        ],
    );
    let out = root.path().join("quiet.pack");
    let result = compiler.compile(story, &out).await;

    assert!(result.is_success(), "failures: {:?}", result.failures);
    assert_eq!(engine.calls(), 2);
    assert_eq!(result.outcomes[&NodeId::new("menu")], NodeOutcome::Silent);

    let reader = PackReader::open(&out).unwrap();
    let menu = reader.node_by_id(&NodeId::new("menu")).unwrap().unwrap();
    assert_eq!(menu.audio, None);
    assert_eq!(menu.image, None);
}
