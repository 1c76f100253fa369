// Run controller: owns the run context, the ledger and the scheduler, and
// serializes operator actions (plan, start, cancel, reset, regenerate, package).

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::core::config::{Config, PacingConfig, PackagingConfig};
use crate::core::errors::RunError;
use crate::core::styles::StyleCatalog;
use crate::core::types::{LedgerEntryView, PlanItem, RunContext, StatusCounts, Strategy};
use crate::orchestration::ledger::ResultLedger;
use crate::orchestration::scheduler::{BatchScheduler, RunOutcome, RunReport};
use crate::services::compositor::Compositor;
use crate::services::generation::{PlanSource, StickerGenerator};
use crate::services::packaging::{build_package, ArchiveReceipt, Archiver};
use crate::utils::image_ops::prepare_reference_async;
use crate::utils::Metrics;

/// Lifecycle of the controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    /// Setup: no run started, or the last one was reset
    #[default]
    Idle,
    Running,
    Completed,
    Cancelled,
    /// Aborted by a fatal error (bad credential)
    Failed,
}

/// Operator request to start a run
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunRequest {
    pub captions: Vec<String>,
    #[serde(default)]
    pub style_id: String,
    #[serde(default)]
    pub strategy: Option<Strategy>,
    /// Raw reference image bytes (any decodable format)
    #[serde(skip)]
    pub reference_image: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartedRun {
    pub run_id: u64,
    pub items: usize,
    pub strategy: Strategy,
}

/// Read-only view of the ledger plus controller state
#[derive(Debug, Clone, Serialize)]
pub struct LedgerView {
    pub run_id: u64,
    pub version: u64,
    pub phase: RunPhase,
    pub counts: StatusCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub items: Vec<LedgerEntryView>,
}

/// Controller knobs that are not owned by the scheduler
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub default_strategy: Strategy,
    pub upload_max_dimension: u32,
    pub upload_jpeg_quality: u8,
    pub packaging: PackagingConfig,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_strategy: config.default_strategy,
            upload_max_dimension: config.compositor.upload_max_dimension,
            upload_jpeg_quality: config.compositor.upload_jpeg_quality,
            packaging: config.packaging.clone(),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            default_strategy: Strategy::Grid,
            upload_max_dimension: 800,
            upload_jpeg_quality: 85,
            packaging: PackagingConfig::default(),
        }
    }
}

#[derive(Default)]
struct ControllerState {
    phase: RunPhase,
    /// Context of the latest run, kept after it finishes for regeneration
    context: Option<RunContext>,
    plan: Vec<PlanItem>,
    task: Option<JoinHandle<()>>,
    last_report: Option<RunReport>,
    last_error: Option<String>,
}

pub struct StickerOrchestrator {
    scheduler: Arc<BatchScheduler>,
    planner: Arc<dyn PlanSource>,
    ledger: ResultLedger,
    styles: StyleCatalog,
    settings: OrchestratorSettings,
    metrics: Option<Metrics>,
    next_run_id: AtomicU64,
    state: Arc<Mutex<ControllerState>>,
}

impl StickerOrchestrator {
    pub fn new(
        generator: Arc<dyn StickerGenerator>,
        planner: Arc<dyn PlanSource>,
        compositor: Arc<dyn Compositor>,
        styles: StyleCatalog,
        pacing: PacingConfig,
        settings: OrchestratorSettings,
        metrics: Option<Metrics>,
    ) -> Self {
        let ledger = ResultLedger::new();
        let scheduler = BatchScheduler::new(generator, compositor, ledger.clone(), pacing, metrics.clone());

        Self {
            scheduler: Arc::new(scheduler),
            planner,
            ledger,
            styles,
            settings,
            metrics,
            next_run_id: AtomicU64::new(1),
            state: Arc::new(Mutex::new(ControllerState::default())),
        }
    }

    pub fn styles(&self) -> &StyleCatalog {
        &self.styles
    }

    pub fn ledger(&self) -> &ResultLedger {
        &self.ledger
    }

    pub fn phase(&self) -> RunPhase {
        self.state.lock().phase
    }

    pub fn last_report(&self) -> Option<RunReport> {
        self.state.lock().last_report.clone()
    }

    /// Wait until the ledger moves past `since` or `timeout` elapses, then
    /// return the current view.
    pub async fn wait_for_change(&self, since: u64, timeout: Duration) -> LedgerView {
        let mut changes = self.ledger.subscribe();
        let timed_out = tokio::time::timeout(timeout, changes.wait_for(|v| *v > since))
            .await
            .is_err();
        if timed_out {
            debug!("No ledger change past version {} within {:?}", since, timeout);
        }
        self.ledger_view()
    }

    fn allocate_run_id(&self) -> u64 {
        self.next_run_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Ask the planner for `count` captions. Does not touch the ledger.
    #[instrument(skip(self, context))]
    pub async fn plan(&self, count: usize, context: &str) -> Result<Vec<PlanItem>, RunError> {
        let pairs = self
            .planner
            .generate_plan(count, context)
            .await
            .map_err(|e| {
                warn!("Planning failed: {}", e);
                RunError::Planning(e)
            })?;
        info!("Planner returned {} captions", pairs.len());
        Ok(PlanItem::from_pairs(pairs))
    }

    /// Start a run in the background and return its id.
    ///
    /// The style is resolved and the reference image downscaled before any
    /// state changes, so a rejected request leaves the controller untouched.
    #[instrument(skip(self, request), fields(captions = request.captions.len()))]
    pub async fn start_run(&self, request: RunRequest) -> Result<StartedRun, RunError> {
        let style_prompt = self
            .styles
            .resolve(&request.style_id)
            .ok_or_else(|| RunError::UnknownStyle(request.style_id.clone()))?
            .to_string();

        let plan = PlanItem::from_captions(
            request
                .captions
                .iter()
                .map(|c| c.trim())
                .filter(|c| !c.is_empty()),
        );
        if plan.is_empty() {
            return Err(RunError::EmptyPlan);
        }
        let strategy = request.strategy.unwrap_or(self.settings.default_strategy);

        self.ensure_idle()?;

        let reference_image = match request.reference_image {
            Some(bytes) if !bytes.is_empty() => Some(
                prepare_reference_async(
                    Arc::new(bytes),
                    self.settings.upload_max_dimension,
                    self.settings.upload_jpeg_quality,
                )
                .await?,
            ),
            _ => None,
        };

        let mut state = self.state.lock();
        if state.phase == RunPhase::Running {
            return Err(RunError::AlreadyRunning(self.ledger.run_id()));
        }

        let run_id = self.allocate_run_id();
        let ctx = RunContext::new(run_id, reference_image, style_prompt);
        self.ledger.reset(run_id, &plan);
        if let Some(ref m) = self.metrics {
            m.record_run_started();
        }

        let items = plan.len();
        state.phase = RunPhase::Running;
        state.context = Some(ctx.clone());
        state.plan = plan.clone();
        state.last_report = None;
        state.last_error = None;

        let scheduler = Arc::clone(&self.scheduler);
        let shared = Arc::clone(&self.state);
        state.task = Some(tokio::spawn(async move {
            let result = scheduler.run(&plan, &ctx, strategy).await;
            finish(&shared, run_id, result);
        }));

        info!("Run {} started: {} items, {} strategy", run_id, items, strategy);
        Ok(StartedRun {
            run_id,
            items,
            strategy,
        })
    }

    /// Cancel the active run or regeneration. Safe to call repeatedly.
    pub fn cancel(&self) -> bool {
        let state = self.state.lock();
        match (&state.context, state.phase) {
            (Some(ctx), RunPhase::Running) => {
                if !ctx.is_cancelled() {
                    info!("Cancelling run {}", ctx.run_id);
                    ctx.cancellation.cancel();
                }
                true
            }
            _ => false,
        }
    }

    /// Cancel anything in flight and return to setup with an empty ledger.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if let Some(ref ctx) = state.context {
            ctx.cancellation.cancel();
        }
        // A fresh id detaches the ledger from the old run, so its late
        // updates are dropped.
        let run_id = self.allocate_run_id();
        self.ledger.clear(run_id);
        *state = ControllerState::default();
        info!("Controller reset");
    }

    /// Regenerate one item of the latest run in the background.
    #[instrument(skip(self))]
    pub fn regenerate(&self, id: usize) -> Result<u64, RunError> {
        let mut state = self.state.lock();
        if state.phase == RunPhase::Running {
            return Err(RunError::AlreadyRunning(self.ledger.run_id()));
        }
        let previous = state.context.clone().ok_or(RunError::UnknownItem(id))?;
        let item = state
            .plan
            .iter()
            .find(|item| item.id == id)
            .cloned()
            .ok_or(RunError::UnknownItem(id))?;

        // Same run id and inputs, fresh cancellation scope
        let ctx = RunContext {
            cancellation: CancellationToken::new(),
            ..previous
        };
        let run_id = ctx.run_id;
        state.phase = RunPhase::Running;
        state.context = Some(ctx.clone());
        state.last_error = None;

        let scheduler = Arc::clone(&self.scheduler);
        let shared = Arc::clone(&self.state);
        state.task = Some(tokio::spawn(async move {
            let result = scheduler.regenerate(&item, &ctx).await;
            finish(&shared, run_id, result);
        }));

        info!("Regenerating item {} of run {}", id, run_id);
        Ok(run_id)
    }

    pub fn ledger_view(&self) -> LedgerView {
        let state = self.state.lock();
        LedgerView {
            run_id: self.ledger.run_id(),
            version: self.ledger.version(),
            phase: state.phase,
            counts: self.ledger.counts(),
            last_error: state.last_error.clone(),
            items: self.ledger.views(),
        }
    }

    /// Bundle the finished ledger and hand it to `archiver`.
    #[instrument(skip(self, archiver))]
    pub async fn package(&self, archiver: &dyn Archiver) -> Result<ArchiveReceipt, RunError> {
        self.ensure_idle()?;

        let results = self.ledger.snapshot();
        let config = self.settings.packaging.clone();
        let package = tokio::task::spawn_blocking(move || build_package(&results, &config))
            .await
            .map_err(|e| RunError::TaskJoinFailed(e.to_string()))??;

        Ok(archiver.archive(&package).await?)
    }

    /// Wait for the background task, if any, to finish.
    pub async fn wait(&self) -> Result<(), RunError> {
        let task = self.state.lock().task.take();
        if let Some(task) = task {
            task.await
                .map_err(|e| RunError::TaskJoinFailed(e.to_string()))?;
        }
        Ok(())
    }

    fn ensure_idle(&self) -> Result<(), RunError> {
        if self.state.lock().phase == RunPhase::Running {
            return Err(RunError::AlreadyRunning(self.ledger.run_id()));
        }
        Ok(())
    }
}

/// Record how a background task ended, unless the controller has moved on
/// to a different run since.
fn finish(state: &Mutex<ControllerState>, run_id: u64, result: Result<RunReport, RunError>) {
    let mut state = state.lock();
    let current = state.context.as_ref().map(|ctx| ctx.run_id);
    if current != Some(run_id) {
        return;
    }

    match result {
        Ok(report) => {
            state.phase = match report.outcome {
                RunOutcome::Completed => RunPhase::Completed,
                RunOutcome::Cancelled => RunPhase::Cancelled,
            };
            state.last_report = Some(report);
        }
        Err(e) => {
            error!("Run {} failed: {}", run_id, e);
            state.phase = RunPhase::Failed;
            state.last_error = Some(match &e {
                RunError::Fatal(inner) => inner.user_message(),
                other => other.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::{CompositorResult, CredentialProblem, GenerationError};
    use crate::core::types::{CaptionPair, ImagePayload, ItemStatus};
    use crate::services::packaging::DirectoryArchiver;
    use crate::utils::image_ops::encode_png;
    use async_trait::async_trait;
    use image::{DynamicImage, Rgba, RgbaImage};
    use std::sync::atomic::AtomicUsize;

    fn png(size: u32) -> ImagePayload {
        let image = RgbaImage::from_pixel(size, size, Rgba([10, 160, 90, 255]));
        ImagePayload::png(encode_png(&image).unwrap())
    }

    struct StubGenerator {
        calls: AtomicUsize,
        failure: Option<GenerationError>,
        latency: Duration,
    }

    impl StubGenerator {
        fn ok() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failure: None,
                latency: Duration::from_secs(1),
            }
        }

        fn failing(error: GenerationError) -> Self {
            Self {
                failure: Some(error),
                ..Self::ok()
            }
        }

        fn respond(&self) -> Result<ImagePayload, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.failure {
                Some(e) => Err(e.clone()),
                None => Ok(png(24)),
            }
        }
    }

    #[async_trait]
    impl StickerGenerator for StubGenerator {
        async fn generate_single(
            &self,
            _caption: &str,
            _style_prompt: &str,
            _reference_image: Option<&ImagePayload>,
            _cancel: &CancellationToken,
        ) -> Result<ImagePayload, GenerationError> {
            tokio::time::sleep(self.latency).await;
            self.respond()
        }

        async fn generate_grid(
            &self,
            _captions: &[String],
            _style_prompt: &str,
            _reference_image: Option<&ImagePayload>,
            _cancel: &CancellationToken,
        ) -> Result<ImagePayload, GenerationError> {
            tokio::time::sleep(self.latency).await;
            self.respond()
        }
    }

    struct StubPlanner {
        calls: AtomicUsize,
        failure: Option<GenerationError>,
    }

    #[async_trait]
    impl PlanSource for StubPlanner {
        async fn generate_plan(&self, count: usize, _context: &str) -> Result<Vec<CaptionPair>, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = &self.failure {
                return Err(e.clone());
            }
            Ok((0..count)
                .map(|i| CaptionPair {
                    caption_local: format!("caption {}", i),
                    caption_alt: format!("alt {}", i),
                })
                .collect())
        }
    }

    struct PassThrough;

    impl Compositor for PassThrough {
        fn composite_caption(&self, image: &DynamicImage, _text: &str) -> CompositorResult<RgbaImage> {
            Ok(image.to_rgba8())
        }
    }

    fn orchestrator_with(generator: StubGenerator, planner_failure: Option<GenerationError>) -> (StickerOrchestrator, Arc<StubGenerator>, Arc<StubPlanner>) {
        let generator = Arc::new(generator);
        let planner = Arc::new(StubPlanner {
            calls: AtomicUsize::new(0),
            failure: planner_failure,
        });
        let orchestrator = StickerOrchestrator::new(
            generator.clone(),
            planner.clone(),
            Arc::new(PassThrough),
            StyleCatalog::builtin(),
            PacingConfig::default(),
            OrchestratorSettings::default(),
            Some(Metrics::new()),
        );
        (orchestrator, generator, planner)
    }

    fn request(captions: &[&str], strategy: Strategy) -> RunRequest {
        RunRequest {
            captions: captions.iter().map(|c| c.to_string()).collect(),
            style_id: "chibi".to_string(),
            strategy: Some(strategy),
            reference_image: None,
        }
    }

    #[tokio::test]
    async fn test_plan_failure_stays_in_setup() {
        let credential = GenerationError::InvalidCredential(CredentialProblem::NotConfigured);
        let (orchestrator, generator, planner) = orchestrator_with(StubGenerator::ok(), Some(credential));

        let result = orchestrator.plan(8, "office life").await;

        assert!(matches!(
            result,
            Err(RunError::Planning(GenerationError::InvalidCredential(_)))
        ));
        assert_eq!(planner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
        assert_eq!(orchestrator.phase(), RunPhase::Idle);
        assert!(orchestrator.ledger().is_empty());
    }

    #[tokio::test]
    async fn test_plan_keeps_caption_pairs() {
        let (orchestrator, _, _) = orchestrator_with(StubGenerator::ok(), None);
        let plan = orchestrator.plan(3, "").await.unwrap();

        assert_eq!(plan.len(), 3);
        assert_eq!(plan[2].id, 2);
        assert_eq!(plan[2].caption_alt.as_deref(), Some("alt 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_completes_and_packages() {
        let (orchestrator, _, _) = orchestrator_with(StubGenerator::ok(), None);

        let started = orchestrator
            .start_run(request(&["hi", "  ", "bye", "thanks"], Strategy::Serial))
            .await
            .unwrap();
        assert_eq!(started.items, 3);
        assert_eq!(orchestrator.phase(), RunPhase::Running);

        orchestrator.wait().await.unwrap();

        assert_eq!(orchestrator.phase(), RunPhase::Completed);
        let view = orchestrator.ledger_view();
        assert_eq!(view.counts.success, 3);
        assert!(view.items.iter().all(|i| i.processed_image.is_some()));

        let dir = tempfile::tempdir().unwrap();
        let receipt = orchestrator
            .package(&DirectoryArchiver::new(dir.path()))
            .await
            .unwrap();
        assert!(receipt.files.contains(&"sticker_3.png".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_change_returns_newer_view() {
        let (orchestrator, _, _) = orchestrator_with(StubGenerator::ok(), None);

        // nothing happens: times out with the current view
        let idle = orchestrator.wait_for_change(0, Duration::from_secs(1)).await;
        assert_eq!(idle.version, 0);
        assert!(idle.items.is_empty());

        orchestrator
            .start_run(request(&["hi", "bye"], Strategy::Serial))
            .await
            .unwrap();
        let view = orchestrator.wait_for_change(0, Duration::from_secs(30)).await;
        assert!(view.version > 0);
        assert_eq!(view.items.len(), 2);

        orchestrator.wait().await.unwrap();
        let done = orchestrator.ledger_view();
        let later = orchestrator.wait_for_change(done.version, Duration::from_secs(1)).await;
        assert_eq!(later.version, done.version);
        assert_eq!(later.counts.success, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_rejected_while_running() {
        let (orchestrator, _, _) = orchestrator_with(StubGenerator::ok(), None);
        orchestrator
            .start_run(request(&["a", "b"], Strategy::Grid))
            .await
            .unwrap();

        let second = orchestrator.start_run(request(&["c"], Strategy::Grid)).await;
        assert!(matches!(second, Err(RunError::AlreadyRunning(_))));
        assert!(matches!(orchestrator.regenerate(0), Err(RunError::AlreadyRunning(_))));

        orchestrator.wait().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent_and_allows_a_new_run() {
        let (orchestrator, _, _) = orchestrator_with(StubGenerator::ok(), None);
        orchestrator
            .start_run(request(&["a", "b", "c", "d", "e"], Strategy::Grid))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(orchestrator.cancel());
        assert!(orchestrator.cancel());
        orchestrator.wait().await.unwrap();

        assert_eq!(orchestrator.phase(), RunPhase::Cancelled);
        assert!(!orchestrator.cancel());
        assert_eq!(orchestrator.ledger().counts().generating, 0);

        let started = orchestrator
            .start_run(request(&["x"], Strategy::Serial))
            .await
            .unwrap();
        orchestrator.wait().await.unwrap();
        assert_eq!(orchestrator.ledger().run_id(), started.run_id);
        assert_eq!(orchestrator.ledger().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_credential_marks_run_failed() {
        let credential = GenerationError::InvalidCredential(CredentialProblem::Rejected("API key not valid".into()));
        let (orchestrator, generator, _) = orchestrator_with(StubGenerator::failing(credential), None);

        orchestrator
            .start_run(request(&["a", "b", "c"], Strategy::Serial))
            .await
            .unwrap();
        orchestrator.wait().await.unwrap();

        assert_eq!(orchestrator.phase(), RunPhase::Failed);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
        let view = orchestrator.ledger_view();
        assert!(view.last_error.unwrap().contains("Configuration problem"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_regenerate_and_reset() {
        let (orchestrator, generator, _) = orchestrator_with(StubGenerator::ok(), None);
        orchestrator
            .start_run(request(&["a", "b"], Strategy::Parallel))
            .await
            .unwrap();
        orchestrator.wait().await.unwrap();
        let calls = generator.calls.load(Ordering::SeqCst);

        orchestrator.regenerate(1).unwrap();
        orchestrator.wait().await.unwrap();
        assert_eq!(generator.calls.load(Ordering::SeqCst), calls + 1);
        assert_eq!(orchestrator.ledger().get(1).unwrap().status, ItemStatus::Success);
        assert!(matches!(orchestrator.regenerate(7), Err(RunError::UnknownItem(7))));

        orchestrator.reset();
        assert_eq!(orchestrator.phase(), RunPhase::Idle);
        assert!(orchestrator.ledger().is_empty());
        assert!(matches!(orchestrator.regenerate(0), Err(RunError::UnknownItem(0))));
    }

    #[tokio::test]
    async fn test_start_rejects_bad_requests() {
        let (orchestrator, _, _) = orchestrator_with(StubGenerator::ok(), None);

        let mut unknown = request(&["a"], Strategy::Grid);
        unknown.style_id = "baroque".to_string();
        assert!(matches!(orchestrator.start_run(unknown).await, Err(RunError::UnknownStyle(_))));

        let empty = request(&["", "   "], Strategy::Grid);
        assert!(matches!(orchestrator.start_run(empty).await, Err(RunError::EmptyPlan)));

        let mut garbage = request(&["a"], Strategy::Grid);
        garbage.reference_image = Some(vec![0, 1, 2, 3]);
        assert!(matches!(orchestrator.start_run(garbage).await, Err(RunError::Reference(_))));

        assert_eq!(orchestrator.phase(), RunPhase::Idle);
    }

    #[tokio::test]
    async fn test_package_refuses_empty_ledger() {
        let (orchestrator, _, _) = orchestrator_with(StubGenerator::ok(), None);
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            orchestrator.package(&DirectoryArchiver::new(dir.path())).await,
            Err(RunError::Packaging(_))
        ));
    }
}
