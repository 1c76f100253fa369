// Batch scheduler: drives a plan through the generator and compositor under
// one of the pacing strategies, writing every transition to the ledger.

use futures::future::join_all;
use image::DynamicImage;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::core::config::PacingConfig;
use crate::core::errors::{CompositorError, CompositorResult, GenerationError, RunError};
use crate::core::types::{GenerationResult, ImagePayload, PlanItem, RunContext, StatusCounts, Strategy};
use crate::middleware::{cancellable, pause, Backoff, RetryPolicy};
use crate::orchestration::ledger::ResultLedger;
use crate::services::compositor::{finish_slice, finish_sticker, Compositor};
use crate::services::generation::StickerGenerator;
use crate::utils::image_ops::{decode_image, slice_grid};
use crate::utils::Metrics;

/// How a run ended when it was not aborted by a fatal error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: u64,
    pub outcome: RunOutcome,
    pub counts: StatusCounts,
    pub elapsed_ms: u64,
}

/// Why a strategy stopped before the end of the plan
enum Halt {
    Cancelled,
    Fatal(GenerationError),
}

impl From<GenerationError> for Halt {
    fn from(error: GenerationError) -> Self {
        match error {
            GenerationError::Cancelled => Halt::Cancelled,
            other => Halt::Fatal(other),
        }
    }
}

type Step = Result<(), Halt>;

pub struct BatchScheduler {
    generator: Arc<dyn StickerGenerator>,
    compositor: Arc<dyn Compositor>,
    ledger: ResultLedger,
    pacing: PacingConfig,
    metrics: Option<Metrics>,
}

impl BatchScheduler {
    pub fn new(
        generator: Arc<dyn StickerGenerator>,
        compositor: Arc<dyn Compositor>,
        ledger: ResultLedger,
        pacing: PacingConfig,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            generator,
            compositor,
            ledger,
            pacing,
            metrics,
        }
    }

    pub fn ledger(&self) -> &ResultLedger {
        &self.ledger
    }

    /// Drive `plan` to completion or cancellation.
    ///
    /// Items already successful in the ledger are skipped. The ledger must
    /// have been reset for `ctx.run_id` beforehand.
    #[instrument(skip(self, plan, ctx), fields(run_id = ctx.run_id, items = plan.len(), strategy = %strategy))]
    pub async fn run(&self, plan: &[PlanItem], ctx: &RunContext, strategy: Strategy) -> Result<RunReport, RunError> {
        if plan.is_empty() {
            return Err(RunError::EmptyPlan);
        }

        let start = Instant::now();
        info!("Starting run {} ({} items, {} strategy)", ctx.run_id, plan.len(), strategy);

        let result = match strategy {
            Strategy::Serial => self.run_serial(plan, ctx).await,
            Strategy::Grid => self.run_grid(plan, ctx).await,
            Strategy::Parallel => self.run_parallel(plan, ctx).await,
        };

        let outcome = match result {
            Ok(()) => RunOutcome::Completed,
            Err(Halt::Cancelled) => {
                let reverted = self.ledger.revert_in_flight(ctx.run_id);
                if let Some(ref m) = self.metrics {
                    m.record_run_cancelled();
                }
                info!("Run {} cancelled ({} in-flight items returned to pending)", ctx.run_id, reverted);
                RunOutcome::Cancelled
            }
            Err(Halt::Fatal(e)) => {
                self.ledger.revert_in_flight(ctx.run_id);
                error!("Run {} aborted: {}", ctx.run_id, e);
                return Err(RunError::Fatal(e));
            }
        };

        let counts = self.ledger.counts();
        info!(
            "Run {} {:?} in {:.1}s: {} succeeded, {} failed, {} pending",
            ctx.run_id,
            outcome,
            start.elapsed().as_secs_f64(),
            counts.success,
            counts.error,
            counts.unfinished()
        );

        Ok(RunReport {
            run_id: ctx.run_id,
            outcome,
            counts,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Regenerate a single item, bypassing batching and the success skip.
    ///
    /// If cancelled, the entry is put back the way it was before.
    #[instrument(skip(self, item, ctx), fields(run_id = ctx.run_id, item = item.id))]
    pub async fn regenerate(&self, item: &PlanItem, ctx: &RunContext) -> Result<RunReport, RunError> {
        let start = Instant::now();
        let previous = self.ledger.get(item.id).ok_or(RunError::UnknownItem(item.id))?;
        self.ledger.force_replace(ctx.run_id, GenerationResult::generating(item));

        let outcome = match self.generate_item(item, ctx).await {
            Ok((raw, processed)) => {
                self.ledger
                    .force_replace(ctx.run_id, GenerationResult::succeeded(item, raw, processed));
                if let Some(ref m) = self.metrics {
                    m.record_item_outcome(true);
                }
                info!("Item {} regenerated", item.id);
                RunOutcome::Completed
            }
            Err(GenerationError::Cancelled) => {
                self.ledger.force_replace(ctx.run_id, previous);
                RunOutcome::Cancelled
            }
            Err(e) => {
                self.record_failure(ctx, item, &e);
                if e.is_fatal() {
                    return Err(RunError::Fatal(e));
                }
                RunOutcome::Completed
            }
        };

        Ok(RunReport {
            run_id: ctx.run_id,
            outcome,
            counts: self.ledger.counts(),
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Generate and finish one item. Compositing failures are reported as
    /// `CompositingFailed`, which is never retried.
    pub async fn generate_item(
        &self,
        item: &PlanItem,
        ctx: &RunContext,
    ) -> Result<(ImagePayload, ImagePayload), GenerationError> {
        let token = &ctx.cancellation;
        let raw = cancellable(
            token,
            self.generator.generate_single(
                &item.caption,
                &ctx.style_prompt,
                ctx.reference_image.as_ref(),
                token,
            ),
        )
        .await?;

        let processed = finish_sticker(
            Arc::clone(&self.compositor),
            raw.clone(),
            item.caption.clone(),
            self.metrics.clone(),
        )
        .await
        .map_err(|e| GenerationError::CompositingFailed(e.to_string()))?;

        Ok((raw, processed))
    }

    fn mark_generating(&self, ctx: &RunContext, item: &PlanItem) {
        self.ledger.apply(ctx.run_id, GenerationResult::generating(item));
    }

    fn record_success(&self, ctx: &RunContext, item: &PlanItem, raw: ImagePayload, processed: ImagePayload) {
        if self.ledger.apply(ctx.run_id, GenerationResult::succeeded(item, raw, processed)) {
            debug!("Item {} done", item.id);
            if let Some(ref m) = self.metrics {
                m.record_item_outcome(true);
            }
        }
    }

    fn record_failure(&self, ctx: &RunContext, item: &PlanItem, error: &GenerationError) {
        if self.ledger.apply(ctx.run_id, GenerationResult::failed(item, error.user_message())) {
            warn!("Item {} ('{}') failed: {}", item.id, item.caption, error);
            if let Some(ref m) = self.metrics {
                m.record_item_outcome(false);
            }
        }
    }

    fn record_batch(&self) {
        if let Some(ref m) = self.metrics {
            m.record_batch_processed();
        }
    }

    fn check_cancelled(ctx: &RunContext) -> Step {
        if ctx.is_cancelled() {
            Err(Halt::Cancelled)
        } else {
            Ok(())
        }
    }

    fn any_unresolved(&self, items: &[PlanItem]) -> bool {
        items.iter().any(|item| !self.ledger.is_success(item.id))
    }

    /// One item at a time, fixed cooldown between retries, short pause after
    /// each success.
    async fn run_serial(&self, plan: &[PlanItem], ctx: &RunContext) -> Step {
        let policy = RetryPolicy::new(
            self.pacing.serial_max_attempts,
            Backoff::Fixed(self.pacing.serial_cooldown),
        );
        let token = &ctx.cancellation;

        for (position, item) in plan.iter().enumerate() {
            Self::check_cancelled(ctx)?;
            if self.ledger.is_success(item.id) {
                debug!("Item {} already succeeded, skipping", item.id);
                continue;
            }

            self.mark_generating(ctx, item);
            let label = format!("Item {}", item.id);
            let result = policy
                .run(token, &label, |_| self.generate_item(item, ctx))
                .await;

            match result {
                Ok((raw, processed)) => {
                    self.record_success(ctx, item, raw, processed);
                    if self.any_unresolved(&plan[position + 1..]) {
                        pause(token, self.pacing.serial_item_delay).await?;
                    }
                }
                Err(GenerationError::Cancelled) => return Err(Halt::Cancelled),
                Err(e) if e.is_fatal() => {
                    self.record_failure(ctx, item, &e);
                    return Err(Halt::Fatal(e));
                }
                Err(e) => self.record_failure(ctx, item, &e),
            }
            self.record_batch();
        }

        Ok(())
    }

    /// One 2x2 sheet per batch, sliced and finished in parallel. A failed
    /// sheet fails every member with the same detail.
    async fn run_grid(&self, plan: &[PlanItem], ctx: &RunContext) -> Step {
        let token = &ctx.cancellation;
        let batch_size = self.pacing.grid_batch_size.clamp(1, 4);
        let total_batches = plan.len().div_ceil(batch_size);
        let mut requested = false;

        for (index, batch) in plan.chunks(batch_size).enumerate() {
            Self::check_cancelled(ctx)?;

            let members: Vec<&PlanItem> = batch
                .iter()
                .filter(|item| !self.ledger.is_success(item.id))
                .collect();
            if members.is_empty() {
                debug!("Batch {} already complete, skipping", index + 1);
                continue;
            }

            if requested {
                pause(token, self.pacing.grid_batch_delay).await?;
            }
            requested = true;

            info!("Grid batch {}/{} ({} items)", index + 1, total_batches, members.len());
            for item in &members {
                self.mark_generating(ctx, item);
            }

            let captions: Vec<String> = members.iter().map(|item| item.caption.clone()).collect();
            let sheet = cancellable(
                token,
                self.generator.generate_grid(
                    &captions,
                    &ctx.style_prompt,
                    ctx.reference_image.as_ref(),
                    token,
                ),
            )
            .await;

            match sheet {
                Ok(sheet) => self.finish_grid_batch(ctx, &members, sheet).await,
                Err(GenerationError::Cancelled) => return Err(Halt::Cancelled),
                Err(e) if e.is_fatal() => {
                    for item in &members {
                        self.record_failure(ctx, item, &e);
                    }
                    return Err(Halt::Fatal(e));
                }
                Err(e) => {
                    for item in &members {
                        self.record_failure(ctx, item, &e);
                    }
                    let rest = &plan[((index + 1) * batch_size).min(plan.len())..];
                    if e.is_quota() && self.any_unresolved(rest) {
                        warn!("Quota hit on batch {}, pausing before continuing", index + 1);
                        pause(token, self.pacing.grid_quota_pause).await?;
                    }
                }
            }
            self.record_batch();
        }

        Ok(())
    }

    async fn finish_grid_batch(&self, ctx: &RunContext, members: &[&PlanItem], sheet: ImagePayload) {
        let slices = match slice_sheet(sheet, members.len()).await {
            Ok(slices) => slices,
            Err(e) => {
                let error = GenerationError::CompositingFailed(e.to_string());
                for item in members {
                    self.record_failure(ctx, item, &error);
                }
                return;
            }
        };

        let tasks = members.iter().zip(slices).map(|(item, slice)| {
            finish_slice(
                Arc::clone(&self.compositor),
                slice,
                item.caption.clone(),
                self.metrics.clone(),
            )
        });
        let finished = join_all(tasks).await;

        for (item, outcome) in members.iter().zip(finished) {
            match outcome {
                Ok((raw, processed)) => self.record_success(ctx, item, raw, processed),
                Err(e) => self.record_failure(ctx, item, &GenerationError::CompositingFailed(e.to_string())),
            }
        }
    }

    /// Small batches of concurrent single requests. Retryable failures retry
    /// the unresolved members of the whole batch; a non-retryable failure
    /// fails every unresolved member.
    async fn run_parallel(&self, plan: &[PlanItem], ctx: &RunContext) -> Step {
        let token = &ctx.cancellation;
        let batch_size = self.pacing.parallel_batch_size.max(1);
        let batch_delay = self.pacing.parallel_delay_for(plan.len());
        let max_attempts = self.pacing.parallel_max_attempts.max(1);
        let total_batches = plan.len().div_ceil(batch_size);
        let mut requested = false;

        for (index, batch) in plan.chunks(batch_size).enumerate() {
            let mut attempt = 1;
            loop {
                Self::check_cancelled(ctx)?;

                let members: Vec<&PlanItem> = batch
                    .iter()
                    .filter(|item| !self.ledger.is_success(item.id))
                    .collect();
                if members.is_empty() {
                    break;
                }

                if requested && attempt == 1 {
                    pause(token, batch_delay).await?;
                }
                requested = true;

                info!(
                    "Parallel batch {}/{} attempt {}/{} ({} items)",
                    index + 1,
                    total_batches,
                    attempt,
                    max_attempts,
                    members.len()
                );
                for item in &members {
                    self.mark_generating(ctx, item);
                }

                let outcomes = join_all(members.iter().map(|item| self.generate_item(item, ctx))).await;

                let mut failures: Vec<(&PlanItem, GenerationError)> = Vec::new();
                for (item, outcome) in members.iter().zip(outcomes) {
                    match outcome {
                        Ok((raw, processed)) => self.record_success(ctx, item, raw, processed),
                        Err(e) => failures.push((*item, e)),
                    }
                }

                if failures.iter().any(|(_, e)| e.is_cancelled()) {
                    return Err(Halt::Cancelled);
                }
                if let Some(fatal) = failures.iter().find(|(_, e)| e.is_fatal()).map(|(_, e)| e.clone()) {
                    for (item, e) in &failures {
                        self.record_failure(ctx, item, e);
                    }
                    return Err(Halt::Fatal(fatal));
                }
                if failures.is_empty() {
                    break;
                }

                let all_retryable = failures.iter().all(|(_, e)| e.is_retryable());
                if all_retryable && attempt < max_attempts {
                    warn!(
                        "{} items in batch {} hit retryable errors, retrying in {:.0}s",
                        failures.len(),
                        index + 1,
                        self.pacing.parallel_backoff.as_secs_f64()
                    );
                    if let Some(ref m) = self.metrics {
                        m.record_retry();
                    }
                    pause(token, self.pacing.parallel_backoff).await?;
                    attempt += 1;
                    continue;
                }

                for (item, e) in &failures {
                    self.record_failure(ctx, item, e);
                }
                break;
            }
            self.record_batch();
        }

        Ok(())
    }
}

/// Decode a grid sheet and cut it into `n` quadrants, off the runtime.
async fn slice_sheet(sheet: ImagePayload, n: usize) -> CompositorResult<Vec<DynamicImage>> {
    tokio::task::spawn_blocking(move || -> CompositorResult<Vec<DynamicImage>> {
        let image = decode_image(&sheet.data)?;
        Ok(slice_grid(&image, n))
    })
    .await
    .map_err(|e| CompositorError::TaskJoinFailed(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::CredentialProblem;
    use crate::core::types::ItemStatus;
    use crate::utils::image_ops::encode_png;
    use async_trait::async_trait;
    use image::{Rgba, RgbaImage};
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn png(size: u32) -> ImagePayload {
        let image = RgbaImage::from_pixel(size, size, Rgba([40, 80, 120, 255]));
        ImagePayload::png(encode_png(&image).unwrap())
    }

    /// Generator double with scripted failures per caption (single) or per
    /// call (grid). Records every call with its (paused) timestamp.
    #[derive(Default)]
    struct FakeGenerator {
        single_failures: Mutex<HashMap<String, VecDeque<GenerationError>>>,
        grid_failures: Mutex<VecDeque<Option<GenerationError>>>,
        single_calls: Mutex<Vec<(String, tokio::time::Instant)>>,
        grid_calls: Mutex<Vec<Vec<String>>>,
    }

    impl FakeGenerator {
        fn fail_single(self, caption: &str, errors: Vec<GenerationError>) -> Self {
            self.single_failures.lock().insert(caption.to_string(), errors.into());
            self
        }

        fn fail_grid(self, outcomes: Vec<Option<GenerationError>>) -> Self {
            *self.grid_failures.lock() = outcomes.into();
            self
        }

        fn single_calls_for(&self, caption: &str) -> Vec<tokio::time::Instant> {
            self.single_calls
                .lock()
                .iter()
                .filter(|(c, _)| c == caption)
                .map(|(_, t)| *t)
                .collect()
        }

        fn single_call_count(&self) -> usize {
            self.single_calls.lock().len()
        }

        fn grid_call_count(&self) -> usize {
            self.grid_calls.lock().len()
        }
    }

    #[async_trait]
    impl StickerGenerator for FakeGenerator {
        async fn generate_single(
            &self,
            caption: &str,
            _style_prompt: &str,
            _reference_image: Option<&ImagePayload>,
            _cancel: &CancellationToken,
        ) -> Result<ImagePayload, GenerationError> {
            self.single_calls
                .lock()
                .push((caption.to_string(), tokio::time::Instant::now()));
            let scripted = self
                .single_failures
                .lock()
                .get_mut(caption)
                .and_then(|queue| queue.pop_front());
            match scripted {
                Some(error) => Err(error),
                None => Ok(png(20)),
            }
        }

        async fn generate_grid(
            &self,
            captions: &[String],
            _style_prompt: &str,
            _reference_image: Option<&ImagePayload>,
            _cancel: &CancellationToken,
        ) -> Result<ImagePayload, GenerationError> {
            self.grid_calls.lock().push(captions.to_vec());
            match self.grid_failures.lock().pop_front().flatten() {
                Some(error) => Err(error),
                None => Ok(png(32)),
            }
        }
    }

    #[derive(Default)]
    struct CountingCompositor {
        calls: AtomicUsize,
    }

    impl Compositor for CountingCompositor {
        fn composite_caption(&self, image: &DynamicImage, _text: &str) -> CompositorResult<RgbaImage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(image.to_rgba8())
        }
    }

    struct Harness {
        generator: Arc<FakeGenerator>,
        compositor: Arc<CountingCompositor>,
        scheduler: BatchScheduler,
        ledger: ResultLedger,
        plan: Vec<PlanItem>,
        ctx: RunContext,
    }

    fn harness(generator: FakeGenerator, items: usize) -> Harness {
        let generator = Arc::new(generator);
        let compositor = Arc::new(CountingCompositor::default());
        let ledger = ResultLedger::new();
        let plan = PlanItem::from_captions((0..items).map(|i| format!("c{}", i)));
        let ctx = RunContext::new(1, None, "");
        ledger.reset(ctx.run_id, &plan);

        let scheduler = BatchScheduler::new(
            generator.clone(),
            compositor.clone(),
            ledger.clone(),
            PacingConfig::default(),
            Some(Metrics::new()),
        );

        Harness {
            generator,
            compositor,
            scheduler,
            ledger,
            plan,
            ctx,
        }
    }

    fn quota() -> GenerationError {
        GenerationError::QuotaExceeded("429 RESOURCE_EXHAUSTED".into())
    }

    #[tokio::test(start_paused = true)]
    async fn test_grid_run_of_eight_items() {
        let h = harness(FakeGenerator::default(), 8);

        let report = h.scheduler.run(&h.plan, &h.ctx, Strategy::Grid).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(h.generator.grid_call_count(), 2);
        assert_eq!(h.compositor.calls.load(Ordering::SeqCst), 8);
        assert_eq!(report.counts.success, 8);
        assert_eq!(h.ledger.len(), 8);

        let grid_calls = h.generator.grid_calls.lock().clone();
        assert_eq!(grid_calls[0], vec!["c0", "c1", "c2", "c3"]);
        assert_eq!(grid_calls[1], vec!["c4", "c5", "c6", "c7"]);

        // each member gets its own 16x16 quadrant as its raw image
        let raw = h.ledger.get(5).unwrap().raw_image.unwrap();
        let decoded = decode_image(&raw.data).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 16));
    }

    #[tokio::test(start_paused = true)]
    async fn test_serial_retry_waits_for_cooldown() {
        let generator = FakeGenerator::default().fail_single("c2", vec![quota(), quota()]);
        let h = harness(generator, 5);

        let report = h.scheduler.run(&h.plan, &h.ctx, Strategy::Serial).await.unwrap();

        assert_eq!(report.counts.success, 5);
        assert_eq!(h.ledger.get(2).unwrap().status, ItemStatus::Success);

        let calls = h.generator.single_calls_for("c2");
        assert_eq!(calls.len(), 3);
        let cooldown = PacingConfig::default().serial_cooldown;
        assert!(calls[2] - calls[0] >= cooldown * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_serial_exhaustion_marks_item_error_and_continues() {
        let generator = FakeGenerator::default().fail_single("c1", vec![quota(), quota(), quota()]);
        let h = harness(generator, 3);

        let report = h.scheduler.run(&h.plan, &h.ctx, Strategy::Serial).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(h.generator.single_calls_for("c1").len(), 3);
        let failed = h.ledger.get(1).unwrap();
        assert_eq!(failed.status, ItemStatus::Error);
        assert!(failed.error_detail.unwrap().contains("Rate limit"));
        assert_eq!(h.ledger.get(2).unwrap().status, ItemStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grid_failure_fails_whole_batch_with_same_detail() {
        let generator = FakeGenerator::default().fail_grid(vec![Some(GenerationError::SafetyBlocked {
            reason: "SAFETY".into(),
        })]);
        let h = harness(generator, 8);

        let report = h.scheduler.run(&h.plan, &h.ctx, Strategy::Grid).await.unwrap();

        let entries = h.ledger.snapshot();
        let details: Vec<Option<String>> = entries[..4].iter().map(|e| e.error_detail.clone()).collect();
        assert!(entries[..4].iter().all(|e| e.status == ItemStatus::Error));
        assert!(details.iter().all(|d| d.is_some() && *d == details[0]));
        assert!(entries[4..].iter().all(|e| e.status == ItemStatus::Success));
        assert_eq!(report.counts.error, 4);
        assert_eq!(h.compositor.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_items_are_not_regenerated() {
        let h = harness(FakeGenerator::default(), 6);
        let original = GenerationResult::succeeded(&h.plan[0], png(8), png(4));
        h.ledger.apply(1, original.clone());
        h.ledger.apply(1, GenerationResult::succeeded(&h.plan[1], png(8), png(4)));

        h.scheduler.run(&h.plan, &h.ctx, Strategy::Serial).await.unwrap();

        assert!(h.generator.single_calls_for("c0").is_empty());
        assert!(h.generator.single_calls_for("c1").is_empty());
        assert_eq!(h.generator.single_call_count(), 4);
        assert_eq!(h.ledger.get(0).unwrap().processed_image, original.processed_image);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_trailing_pause_when_nothing_follows() {
        let pacing = PacingConfig::default();

        // serial: the only pending item is followed by finished ones
        let h = harness(FakeGenerator::default(), 3);
        for item in &h.plan[1..] {
            h.ledger.apply(1, GenerationResult::succeeded(item, png(8), png(4)));
        }
        let start = tokio::time::Instant::now();
        h.scheduler.run(&h.plan, &h.ctx, Strategy::Serial).await.unwrap();
        assert!(start.elapsed() < pacing.serial_item_delay);

        // grid: quota failure on the last batch
        let h = harness(FakeGenerator::default().fail_grid(vec![Some(quota())]), 4);
        let start = tokio::time::Instant::now();
        let report = h.scheduler.run(&h.plan, &h.ctx, Strategy::Grid).await.unwrap();
        assert_eq!(report.counts.error, 4);
        assert!(start.elapsed() < pacing.grid_quota_pause);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_pause_before_next_grid_batch() {
        let pacing = PacingConfig::default();
        let h = harness(FakeGenerator::default().fail_grid(vec![Some(quota())]), 8);

        let start = tokio::time::Instant::now();
        let report = h.scheduler.run(&h.plan, &h.ctx, Strategy::Grid).await.unwrap();

        assert_eq!((report.counts.error, report.counts.success), (4, 4));
        assert!(start.elapsed() >= pacing.grid_quota_pause + pacing.grid_batch_delay);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_grid_batch_is_skipped() {
        let h = harness(FakeGenerator::default(), 8);
        for item in &h.plan[..4] {
            h.ledger.apply(1, GenerationResult::succeeded(item, png(8), png(4)));
        }

        h.scheduler.run(&h.plan, &h.ctx, Strategy::Grid).await.unwrap();

        assert_eq!(h.generator.grid_call_count(), 1);
        assert_eq!(h.generator.grid_calls.lock()[0], vec!["c4", "c5", "c6", "c7"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_batch_delay_stops_next_request() {
        let h = harness(FakeGenerator::default(), 8);
        let token = h.ctx.cancellation.clone();
        tokio::spawn(async move {
            // first batch is immediate, the inter-batch delay is 10s
            tokio::time::sleep(Duration::from_secs(3)).await;
            token.cancel();
        });

        let report = h.scheduler.run(&h.plan, &h.ctx, Strategy::Grid).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(h.generator.grid_call_count(), 1);
        assert_eq!(report.counts.success, 4);
        assert_eq!(report.counts.pending, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_retries_only_unresolved_members() {
        let generator = FakeGenerator::default().fail_single("c1", vec![quota()]);
        let h = harness(generator, 3);

        let report = h.scheduler.run(&h.plan, &h.ctx, Strategy::Parallel).await.unwrap();

        assert_eq!(report.counts.success, 3);
        assert_eq!(h.generator.single_calls_for("c0").len(), 1);
        assert_eq!(h.generator.single_calls_for("c1").len(), 2);
        assert_eq!(h.generator.single_calls_for("c2").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_non_retryable_fails_unresolved_members() {
        let generator = FakeGenerator::default()
            .fail_single("c0", vec![GenerationError::SafetyBlocked { reason: "SAFETY".into() }])
            .fail_single("c1", vec![quota()]);
        let h = harness(generator, 6);

        let report = h.scheduler.run(&h.plan, &h.ctx, Strategy::Parallel).await.unwrap();

        assert_eq!(h.ledger.get(0).unwrap().status, ItemStatus::Error);
        assert_eq!(h.ledger.get(1).unwrap().status, ItemStatus::Error);
        assert_eq!(h.ledger.get(2).unwrap().status, ItemStatus::Success);
        assert_eq!(h.generator.single_calls_for("c1").len(), 1);
        assert_eq!(report.counts.success, 4);
        assert!(h.ledger.all_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_credential_failure_aborts_run() {
        let generator = FakeGenerator::default().fail_single(
            "c0",
            vec![GenerationError::InvalidCredential(CredentialProblem::Rejected("bad key".into()))],
        );
        let h = harness(generator, 4);

        let result = h.scheduler.run(&h.plan, &h.ctx, Strategy::Serial).await;

        assert!(matches!(result, Err(RunError::Fatal(GenerationError::InvalidCredential(_)))));
        assert_eq!(h.generator.single_call_count(), 1);
        assert_eq!(h.ledger.get(0).unwrap().status, ItemStatus::Error);
        assert_eq!(h.ledger.counts().pending, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_strategy_leaves_items_terminal() {
        for strategy in [Strategy::Serial, Strategy::Grid, Strategy::Parallel] {
            let generator = FakeGenerator::default()
                .fail_single("c3", vec![GenerationError::NoImageReturned])
                .fail_grid(vec![None, Some(quota())]);
            let h = harness(generator, 7);

            let report = h.scheduler.run(&h.plan, &h.ctx, strategy).await.unwrap();

            assert_eq!(report.outcome, RunOutcome::Completed, "{}", strategy);
            assert!(h.ledger.all_terminal(), "{} left unfinished items", strategy);
            assert_eq!(report.counts.total(), 7);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_regenerate_replaces_a_successful_entry() {
        let h = harness(FakeGenerator::default(), 3);
        h.scheduler.run(&h.plan, &h.ctx, Strategy::Grid).await.unwrap();
        let before = h.ledger.get(1).unwrap().raw_image;

        let report = h.scheduler.regenerate(&h.plan[1], &h.ctx).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(h.generator.single_calls_for("c1").len(), 1);
        let after = h.ledger.get(1).unwrap();
        assert_eq!(after.status, ItemStatus::Success);
        assert_ne!(after.raw_image, before);
    }

    #[tokio::test]
    async fn test_empty_plan_is_rejected() {
        let h = harness(FakeGenerator::default(), 0);
        assert!(matches!(
            h.scheduler.run(&h.plan, &h.ctx, Strategy::Grid).await,
            Err(RunError::EmptyPlan)
        ));
    }
}
