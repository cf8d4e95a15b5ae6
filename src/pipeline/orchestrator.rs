//! The two-stage extraction orchestrator.
//!
//! Drives one job from "PDF + config" to published output: rasterize, lay
//! out, run local OCR per column, validate, and escalate columns with gaps
//! to the remote engine exactly once. Retries happen at the OCR engine
//! boundary with exponential backoff; everything else surfaces upward.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbImage;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::core::{
    ExtractError, JobConfig, MAX_PROBLEM_NUMBER, OcrFailure, OcrStrategy, Rect,
};
use crate::layout::{ColumnStrip, LayoutAnalyzer};
use crate::ocr::{
    EngineKind, LanguageHint, Marker, MarkerParser, OcrEngine, OcrResponse, ParserConfig,
    RemoteCoordEngine, SharedSpan, TesseractEngine,
};
use crate::output::{
    ColumnEntry, ErrorEntry, JobStatus, Manifest, OutputWriter, PageEntry, ProblemEntry,
    crop_problem,
};
use crate::pdf::{PdfRasterizer, is_pdf_path};
use crate::pipeline::boundary::{solve_boundaries, verify_boundaries};
use crate::pipeline::progress::{ProgressSink, ProgressStage, ProgressTracker};
use crate::pipeline::reconcile::reconcile_blocks;
use crate::pipeline::state::{ColumnPhase, ColumnState};
use crate::pipeline::validator::{Diagnosis, expected_for_column, job_expected_set, validate};

/// One cropped problem, ready to be written out.
pub struct ProblemCrop {
    pub number: u32,
    pub rect: Rect,
    pub source: EngineKind,
    pub image: RgbImage,
}

/// Result of processing one column.
pub struct ColumnOutcome {
    pub page: usize,
    pub column: usize,
    pub phase: ColumnPhase,
    pub crops: Vec<ProblemCrop>,
    /// Expected numbers never recovered, ascending.
    pub missing: Vec<u32>,
    /// Final detected numbers in column-y order.
    pub detected: Vec<u32>,
    /// Non-fatal errors recorded for the manifest.
    pub notes: Vec<ErrorEntry>,
}

/// Result of processing one page.
pub struct PageOutcome {
    pub page: usize,
    pub columns: Vec<ColumnOutcome>,
}

/// What a finished job hands back to the caller.
pub struct JobReport {
    pub job_id: String,
    pub status: JobStatus,
    pub manifest: Manifest,
    /// Published output directory; `None` when the job failed.
    pub output_dir: Option<PathBuf>,
    /// Published ZIP archive; `None` when the job failed.
    pub zip_path: Option<PathBuf>,
}

/// Wall-clock bookkeeping for one job.
#[derive(Debug, Clone, Copy)]
struct JobClock {
    started: Instant,
    deadline: Option<Instant>,
}

impl JobClock {
    fn new(budget: Option<Duration>) -> Self {
        let started = Instant::now();
        Self {
            started,
            deadline: budget.map(|d| started + d),
        }
    }

    fn deadline_error(&self) -> ExtractError {
        ExtractError::DeadlineExceeded {
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }

    fn check(&self) -> Result<(), ExtractError> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(self.deadline_error()),
            _ => Ok(()),
        }
    }

    /// Effective timeout for one engine call and whether the deadline, not
    /// the per-call limit, is the binding constraint.
    fn call_timeout(&self, per_call: Duration) -> Result<(Duration, bool), ExtractError> {
        match self.deadline {
            None => Ok((per_call, false)),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(self.deadline_error());
                }
                let remaining = deadline - now;
                if remaining < per_call {
                    Ok((remaining, true))
                } else {
                    Ok((per_call, false))
                }
            }
        }
    }
}

enum RemoteAttempt {
    Success(OcrResponse),
    Unavailable(String),
    Failed(String),
}

/// Runs extraction jobs.
///
/// Cheap to clone; all shared state lives behind `Arc`s. The remote engine
/// is throttled through a semaphore sized by the job's parallel policy.
#[derive(Clone)]
pub struct Extractor {
    config: Arc<JobConfig>,
    analyzer: Arc<LayoutAnalyzer>,
    local: Arc<dyn OcrEngine>,
    remote: Option<Arc<dyn OcrEngine>>,
    progress: Option<ProgressSink>,
    remote_gate: Arc<Semaphore>,
}

impl Extractor {
    /// Builds an extractor with the default engines: Tesseract locally and
    /// the coordinate-returning remote service for gap recovery.
    pub fn new(config: JobConfig) -> Result<Self, ExtractError> {
        let local: Arc<dyn OcrEngine> = Arc::new(TesseractEngine::new());
        let remote: Option<Arc<dyn OcrEngine>> = match config.strategy {
            OcrStrategy::LocalThenRemote => Some(Arc::new(RemoteCoordEngine::new(
                config.remote_credentials.clone(),
            ))),
            _ => None,
        };
        Self::with_engines(config, local, remote)
    }

    /// Builds an extractor around caller-provided engines.
    pub fn with_engines(
        config: JobConfig,
        local: Arc<dyn OcrEngine>,
        remote: Option<Arc<dyn OcrEngine>>,
    ) -> Result<Self, ExtractError> {
        config.validate()?;
        let remote_gate = Arc::new(Semaphore::new(config.parallel.remote_inflight));
        Ok(Self {
            config: Arc::new(config),
            analyzer: Arc::new(LayoutAnalyzer::new()),
            local,
            remote,
            progress: None,
            remote_gate,
        })
    }

    /// Registers a progress callback.
    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Runs one job end to end.
    ///
    /// Errors are returned only when the job cannot start (unreadable input,
    /// rasterizer failure). Failures after that point produce an `Ok` report
    /// with `Failed` status and no published output.
    pub async fn run(&self, pdf_path: &Path, out_root: &Path) -> Result<JobReport, ExtractError> {
        if !pdf_path.is_file() {
            return Err(ExtractError::invalid_input(format!(
                "PDF not found: {}",
                pdf_path.display()
            )));
        }
        if !is_pdf_path(pdf_path) {
            return Err(ExtractError::invalid_input(format!(
                "not a PDF file: {}",
                pdf_path.display()
            )));
        }
        let job_id = job_id_from(pdf_path);
        let clock = JobClock::new(self.config.deadline);
        let tracker = Arc::new(ProgressTracker::new(&job_id, self.progress.clone()));

        info!(target: "pipeline", job_id = %job_id, pdf = %pdf_path.display(), "job started");

        // The PDFium handle is not Send; keep it out of any await scope.
        let pages = {
            let rasterizer = PdfRasterizer::new(self.config.dpi)?;
            rasterizer.rasterize(pdf_path)?
        };
        tracker.emit(ProgressStage::Rasterize, 1, 1);

        let body = self
            .run_after_rasterize(pages, &job_id, out_root, clock, &tracker)
            .await;
        match body {
            Ok(report) => Ok(report),
            Err(error) => Ok(self.failed_report(job_id, error)),
        }
    }

    async fn run_after_rasterize(
        &self,
        pages: Vec<RgbImage>,
        job_id: &str,
        out_root: &Path,
        clock: JobClock,
        tracker: &Arc<ProgressTracker>,
    ) -> Result<JobReport, ExtractError> {
        clock.check()?;

        let page_count = pages.len();
        let mut page_strips: Vec<Vec<ColumnStrip>> = Vec::with_capacity(page_count);
        for (index, image) in pages.into_iter().enumerate() {
            let strips = self.analyzer.analyze(&image, index);
            tracker.advance(ProgressStage::Layout, &tracker.pages_laid_out, page_count);
            page_strips.push(strips);
        }
        clock.check()?;

        let total_columns = page_strips.iter().map(Vec::len).sum::<usize>().max(1);
        let job_expected = job_expected_set(self.config.expected_problem_count, None);

        let mut outcomes = self
            .process_all_pages(page_strips, &job_expected, total_columns, clock, tracker)
            .await?;

        self.infer_missing_for_empty_columns(&mut outcomes);

        clock.check()?;
        self.package(job_id, out_root, &outcomes, clock, tracker)
    }

    async fn process_all_pages(
        &self,
        page_strips: Vec<Vec<ColumnStrip>>,
        job_expected: &BTreeSet<u32>,
        total_columns: usize,
        clock: JobClock,
        tracker: &Arc<ProgressTracker>,
    ) -> Result<Vec<PageOutcome>, ExtractError> {
        let concurrency = self.config.parallel.page_concurrency();

        if concurrency <= 1 {
            let mut outcomes = Vec::with_capacity(page_strips.len());
            for (page, strips) in page_strips.into_iter().enumerate() {
                outcomes.push(
                    self.process_page(page, strips, job_expected, clock, tracker, total_columns)
                        .await?,
                );
            }
            return Ok(outcomes);
        }

        let gate = Arc::new(Semaphore::new(concurrency));
        let mut tasks = JoinSet::new();
        for (page, strips) in page_strips.into_iter().enumerate() {
            let this = self.clone();
            let job_expected = job_expected.clone();
            let tracker = Arc::clone(tracker);
            let gate = Arc::clone(&gate);
            tasks.spawn(async move {
                let _permit = gate
                    .acquire()
                    .await
                    .map_err(|_| ExtractError::internal("page gate closed"))?;
                this.process_page(page, strips, &job_expected, clock, &tracker, total_columns)
                    .await
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|e| ExtractError::internal(format!("page task panicked: {e}")))??;
            outcomes.push(outcome);
        }
        outcomes.sort_by_key(|p| p.page);
        Ok(outcomes)
    }

    async fn process_page(
        &self,
        page: usize,
        strips: Vec<ColumnStrip>,
        job_expected: &BTreeSet<u32>,
        clock: JobClock,
        tracker: &ProgressTracker,
        total_columns: usize,
    ) -> Result<PageOutcome, ExtractError> {
        let mut columns = Vec::with_capacity(strips.len());
        for strip in strips {
            columns.push(
                self.process_column(strip, job_expected, clock, tracker, total_columns)
                    .await?,
            );
        }
        Ok(PageOutcome { page, columns })
    }

    /// Runs one column through the two-stage state machine.
    async fn process_column(
        &self,
        strip: ColumnStrip,
        job_expected: &BTreeSet<u32>,
        clock: JobClock,
        tracker: &ProgressTracker,
        total_columns: usize,
    ) -> Result<ColumnOutcome, ExtractError> {
        let mut state = ColumnState::new();
        let mut budget = self.config.max_retries;
        let mut notes: Vec<ErrorEntry> = Vec::new();

        let local_config = ParserConfig::for_local(&self.config);
        let parser = MarkerParser::new(local_config.clone());

        let response = self.run_local(&strip.image, clock, &mut budget).await?;
        state.advance(ColumnPhase::LocalOcrDone)?;
        let parsed = parser.parse_with_spans(&response.blocks);
        let mut markers = parsed.markers;
        let mut spans = parsed.spans;
        // Blocks seen so far; shared-passage members are searched in here.
        let mut block_pool = response.blocks;
        let recovered = parser.recover_span_members(&spans, &block_pool, &detected_set(&markers));
        markers = merge_markers(markers, recovered);
        let mut diagnosis = self.diagnose(&markers, &spans, job_expected);

        // One relaxed local pass when the first left gaps and budget remains.
        if !diagnosis.missing.is_empty() && budget > 0 {
            budget -= 1;
            match self.run_local_once(&strip.image, clock).await {
                Ok(second) => {
                    state.advance(ColumnPhase::LocalOcrDone)?;
                    let relaxed_parser = MarkerParser::new(local_config.relaxed());
                    let relaxed = relaxed_parser.parse_with_spans(&second.blocks);
                    markers = merge_markers(markers, relaxed.markers);
                    spans = merge_spans(spans, relaxed.spans);
                    block_pool.extend(second.blocks);
                    let recovered = relaxed_parser.recover_span_members(
                        &spans,
                        &block_pool,
                        &detected_set(&markers),
                    );
                    markers = merge_markers(markers, recovered);
                    diagnosis = self.diagnose(&markers, &spans, job_expected);
                }
                Err(e) if matches!(e, ExtractError::DeadlineExceeded { .. }) => return Err(e),
                Err(e) => {
                    warn!(
                        target: "pipeline",
                        page = strip.page,
                        column = strip.column,
                        error = %e,
                        "relaxed local pass failed; keeping first-pass markers"
                    );
                }
            }
        }

        state.advance(ColumnPhase::ValidatedStage1)?;
        tracker.advance(
            ProgressStage::LocalOcr,
            &tracker.columns_local_done,
            total_columns,
        );

        if complete_ok(&diagnosis) {
            state.advance(ColumnPhase::CompleteOk)?;
        } else if !diagnosis.missing.is_empty() && self.config.strategy.permits_remote() {
            state.advance(ColumnPhase::Stage1Gaps)?;
            let missing_set: BTreeSet<u32> = diagnosis.missing.iter().copied().collect();

            match self.run_remote(&strip.image, clock, &mut budget).await? {
                RemoteAttempt::Success(response) => {
                    state.advance(ColumnPhase::RemoteOcrDone)?;
                    let strip_dims = (strip.width(), strip.height());
                    let blocks =
                        reconcile_blocks(response.blocks, response.page_dims, strip_dims)?;
                    state.advance(ColumnPhase::Reconciled)?;

                    let remote_parser = MarkerParser::new(ParserConfig::for_remote(&self.config));
                    let remote_parsed = remote_parser.parse_with_spans(&blocks);
                    let filled: Vec<Marker> = remote_parsed
                        .markers
                        .into_iter()
                        .filter(|m| missing_set.contains(&m.number))
                        .collect();
                    markers = merge_markers(markers, filled);
                    spans = merge_spans(spans, remote_parsed.spans);
                    block_pool.extend(blocks);
                    let recovered = remote_parser.recover_span_members(
                        &spans,
                        &block_pool,
                        &detected_set(&markers),
                    );
                    markers = merge_markers(markers, recovered);
                    diagnosis = self.diagnose(&markers, &spans, job_expected);

                    state.advance(ColumnPhase::ValidatedFinal)?;
                    if complete_ok(&diagnosis) {
                        state.advance(ColumnPhase::CompleteOk)?;
                    } else {
                        state.advance(ColumnPhase::CompletePartial)?;
                    }
                }
                RemoteAttempt::Unavailable(message) => {
                    notes.push(ErrorEntry {
                        kind: "remote_unavailable".to_string(),
                        message,
                    });
                    state.advance(ColumnPhase::CompletePartial)?;
                }
                RemoteAttempt::Failed(message) => {
                    notes.push(ErrorEntry {
                        kind: "ocr_failed".to_string(),
                        message,
                    });
                    state.advance(ColumnPhase::CompletePartial)?;
                }
            }
            tracker.advance(
                ProgressStage::RemoteOcr,
                &tracker.columns_remote_done,
                total_columns,
            );
        } else {
            state.advance(ColumnPhase::CompletePartial)?;
        }

        let boundaries = solve_boundaries(&markers, strip.width(), strip.height());
        verify_boundaries(&boundaries, strip.width(), strip.height())?;

        let sources: BTreeMap<u32, EngineKind> =
            markers.iter().map(|m| (m.number, m.source)).collect();

        let mut crops = Vec::with_capacity(boundaries.len());
        for boundary in &boundaries {
            let image = crop_problem(&strip.image, &boundary.rect)?;
            crops.push(ProblemCrop {
                number: boundary.number,
                rect: boundary.rect,
                source: sources
                    .get(&boundary.number)
                    .copied()
                    .unwrap_or(EngineKind::Local),
                image,
            });
        }

        info!(
            target: "pipeline",
            page = strip.page,
            column = strip.column,
            phase = ?state.phase(),
            problems = crops.len(),
            missing = ?diagnosis.missing,
            "column finished"
        );

        Ok(ColumnOutcome {
            page: strip.page,
            column: strip.column,
            phase: state.phase(),
            crops,
            missing: diagnosis.missing,
            detected: markers.iter().map(|m| m.number).collect(),
            notes,
        })
    }

    /// Validates the column, expecting the detected span plus every number
    /// a shared passage announced.
    fn diagnose(
        &self,
        markers: &[Marker],
        spans: &[SharedSpan],
        job_expected: &BTreeSet<u32>,
    ) -> Diagnosis {
        let detected: Vec<u32> = markers.iter().map(|m| m.number).collect();
        let mut expected = expected_for_column(&detected, job_expected);
        for span in spans {
            for number in span.start..=span.end.min(MAX_PROBLEM_NUMBER) {
                expected.insert(number);
            }
        }
        validate(&detected, &expected)
    }

    /// Local OCR with transient retries drawn from the column's budget.
    async fn run_local(
        &self,
        image: &RgbImage,
        clock: JobClock,
        budget: &mut u32,
    ) -> Result<OcrResponse, ExtractError> {
        let hints = LanguageHint::defaults();
        let mut attempt: u32 = 0;
        loop {
            let (timeout, deadline_bound) = clock.call_timeout(self.config.local_timeout)?;
            let outcome =
                tokio::time::timeout(timeout, self.local.run(image, &hints, self.config.dpi))
                    .await;
            match outcome {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(failure)) if failure.is_transient() && *budget > 0 => {
                    *budget -= 1;
                    warn!(target: "ocr", engine = "local", attempt, error = %failure, "transient failure; retrying");
                    tokio::time::sleep(backoff(attempt)).await;
                    attempt += 1;
                }
                Ok(Err(failure)) => {
                    return Err(ExtractError::ocr_failed("local", failure.to_string()));
                }
                Err(_) if deadline_bound => return Err(clock.deadline_error()),
                Err(_) if *budget > 0 => {
                    *budget -= 1;
                    warn!(target: "ocr", engine = "local", attempt, "call timed out; retrying");
                    attempt += 1;
                }
                Err(_) => return Err(ExtractError::ocr_failed("local", "call timed out")),
            }
        }
    }

    /// Single local OCR attempt; used by the relaxed second pass.
    async fn run_local_once(
        &self,
        image: &RgbImage,
        clock: JobClock,
    ) -> Result<OcrResponse, ExtractError> {
        let hints = LanguageHint::defaults();
        let (timeout, deadline_bound) = clock.call_timeout(self.config.local_timeout)?;
        match tokio::time::timeout(timeout, self.local.run(image, &hints, self.config.dpi)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(failure)) => Err(ExtractError::ocr_failed("local", failure.to_string())),
            Err(_) if deadline_bound => Err(clock.deadline_error()),
            Err(_) => Err(ExtractError::ocr_failed("local", "call timed out")),
        }
    }

    /// Remote OCR behind the in-flight gate, invoked at most once per column.
    async fn run_remote(
        &self,
        image: &RgbImage,
        clock: JobClock,
        budget: &mut u32,
    ) -> Result<RemoteAttempt, ExtractError> {
        let Some(remote) = &self.remote else {
            return Ok(RemoteAttempt::Unavailable(
                "no remote engine configured".to_string(),
            ));
        };

        let hints = LanguageHint::defaults();
        let mut attempt: u32 = 0;
        loop {
            let permit = self
                .remote_gate
                .acquire()
                .await
                .map_err(|_| ExtractError::internal("remote gate closed"))?;
            let (timeout, deadline_bound) = clock.call_timeout(self.config.remote_timeout)?;
            let outcome =
                tokio::time::timeout(timeout, remote.run(image, &hints, self.config.dpi)).await;
            drop(permit);

            match outcome {
                Ok(Ok(response)) => return Ok(RemoteAttempt::Success(response)),
                Ok(Err(OcrFailure::Unavailable(message))) => {
                    return Ok(RemoteAttempt::Unavailable(message));
                }
                Ok(Err(OcrFailure::Permanent(message))) => {
                    return Ok(RemoteAttempt::Unavailable(message));
                }
                Ok(Err(failure)) if *budget > 0 => {
                    *budget -= 1;
                    warn!(target: "ocr", engine = "remote", attempt, error = %failure, "transient failure; retrying");
                    tokio::time::sleep(backoff(attempt)).await;
                    attempt += 1;
                }
                Ok(Err(failure)) => return Ok(RemoteAttempt::Failed(failure.to_string())),
                Err(_) if deadline_bound => return Err(clock.deadline_error()),
                Err(_) if *budget > 0 => {
                    *budget -= 1;
                    warn!(target: "ocr", engine = "remote", attempt, "call timed out; retrying");
                    attempt += 1;
                }
                Err(_) => return Ok(RemoteAttempt::Failed("call timed out".to_string())),
            }
        }
    }

    /// Columns that detected nothing inherit the job-wide expectation once
    /// the whole job's maximum is known.
    fn infer_missing_for_empty_columns(&self, outcomes: &mut [PageOutcome]) {
        let observed_max = outcomes
            .iter()
            .flat_map(|p| p.columns.iter())
            .flat_map(|c| c.detected.iter().copied())
            .max();
        let inferred = job_expected_set(self.config.expected_problem_count, observed_max);
        if inferred.is_empty() {
            return;
        }

        for page in outcomes.iter_mut() {
            for column in page.columns.iter_mut() {
                if column.detected.is_empty() && column.missing.is_empty() {
                    column.missing = inferred.iter().copied().collect();
                }
            }
        }
    }

    fn package(
        &self,
        job_id: &str,
        out_root: &Path,
        outcomes: &[PageOutcome],
        clock: JobClock,
        tracker: &ProgressTracker,
    ) -> Result<JobReport, ExtractError> {
        std::fs::create_dir_all(out_root)?;
        let writer = OutputWriter::create(out_root, job_id, self.config.image_format)?;

        let written = write_outputs(&writer, job_id, outcomes, clock);
        let manifest = match written {
            Ok(manifest) => manifest,
            Err(e) => {
                writer.discard();
                return Err(e);
            }
        };

        let published = writer.publish()?;
        tracker.emit(ProgressStage::Package, 1, 1);

        info!(
            target: "pipeline",
            job_id,
            status = ?manifest.status,
            zip = %published.zip.display(),
            "job finished"
        );

        Ok(JobReport {
            job_id: job_id.to_string(),
            status: manifest.status,
            manifest,
            output_dir: Some(published.dir),
            zip_path: Some(published.zip),
        })
    }

    fn failed_report(&self, job_id: String, failure: ExtractError) -> JobReport {
        error!(target: "pipeline", job_id = %job_id, error = %failure, "job failed");
        let manifest = Manifest {
            job_id: job_id.clone(),
            pages: Vec::new(),
            status: JobStatus::Failed,
            errors: vec![ErrorEntry {
                kind: failure.kind().to_string(),
                message: failure.to_string(),
            }],
        };
        JobReport {
            job_id,
            status: JobStatus::Failed,
            manifest,
            output_dir: None,
            zip_path: None,
        }
    }
}

/// The column terminates in `COMPLETE_OK` only with nothing missing and no
/// duplicate detections.
fn complete_ok(diagnosis: &Diagnosis) -> bool {
    diagnosis.missing.is_empty() && diagnosis.duplicates.is_empty()
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(100u64.saturating_mul(1 << attempt.min(6)))
}

/// Merges marker lists; on number collision the higher confidence wins,
/// with ties broken toward the remote engine.
fn merge_markers(base: Vec<Marker>, additions: Vec<Marker>) -> Vec<Marker> {
    let mut by_number: BTreeMap<u32, Marker> = BTreeMap::new();
    for marker in base.into_iter().chain(additions) {
        match by_number.entry(marker.number) {
            Entry::Vacant(slot) => {
                slot.insert(marker);
            }
            Entry::Occupied(mut slot) => {
                if replaces(&marker, slot.get()) {
                    slot.insert(marker);
                }
            }
        }
    }
    let mut merged: Vec<Marker> = by_number.into_values().collect();
    merged.sort_by_key(|m| m.bbox.y);
    merged
}

fn replaces(candidate: &Marker, incumbent: &Marker) -> bool {
    if candidate.confidence != incumbent.confidence {
        candidate.confidence > incumbent.confidence
    } else {
        candidate.source == EngineKind::Remote
    }
}

fn detected_set(markers: &[Marker]) -> BTreeSet<u32> {
    markers.iter().map(|m| m.number).collect()
}

/// Deduplicates shared-passage spans by their number range, keeping the
/// higher-confidence sighting.
fn merge_spans(base: Vec<SharedSpan>, additions: Vec<SharedSpan>) -> Vec<SharedSpan> {
    let mut by_range: BTreeMap<(u32, u32), SharedSpan> = BTreeMap::new();
    for span in base.into_iter().chain(additions) {
        match by_range.entry((span.start, span.end)) {
            Entry::Vacant(slot) => {
                slot.insert(span);
            }
            Entry::Occupied(mut slot) => {
                if span.confidence > slot.get().confidence {
                    slot.insert(span);
                }
            }
        }
    }
    let mut merged: Vec<SharedSpan> = by_range.into_values().collect();
    merged.sort_by_key(|s| s.bbox.y);
    merged
}

fn job_status(outcomes: &[PageOutcome]) -> JobStatus {
    let partial = outcomes.iter().flat_map(|p| p.columns.iter()).any(|c| {
        !c.missing.is_empty() || !c.notes.is_empty() || c.phase == ColumnPhase::CompletePartial
    });
    if partial {
        JobStatus::Partial
    } else {
        JobStatus::Ok
    }
}

/// Writes every crop and the manifest into the scratch tree.
fn write_outputs(
    writer: &OutputWriter,
    job_id: &str,
    outcomes: &[PageOutcome],
    clock: JobClock,
) -> Result<Manifest, ExtractError> {
    let mut pages = Vec::with_capacity(outcomes.len());
    let mut errors: Vec<ErrorEntry> = Vec::new();

    for page_outcome in outcomes {
        clock.check()?;
        let mut columns = Vec::with_capacity(page_outcome.columns.len());
        for column in &page_outcome.columns {
            let mut problems = Vec::with_capacity(column.crops.len());
            for crop in &column.crops {
                let file =
                    writer.write_problem(page_outcome.page, column.column, crop.number, &crop.image)?;
                problems.push(ProblemEntry {
                    number: crop.number,
                    file,
                    source: crop.source,
                });
            }
            columns.push(ColumnEntry {
                column: column.column,
                problems,
                missing: column.missing.clone(),
            });
            errors.extend(column.notes.iter().cloned());
        }
        pages.push(PageEntry {
            page: page_outcome.page,
            columns,
        });
    }

    let manifest = Manifest {
        job_id: job_id.to_string(),
        pages,
        status: job_status(outcomes),
        errors,
    };
    writer.write_manifest(&manifest)?;
    Ok(manifest)
}

/// Derives a stable job identifier from the input file name.
fn job_id_from(pdf_path: &Path) -> String {
    let stem = pdf_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cleaned: String = stem
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "job".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::core::{JobConfig, OcrStrategy};
    use crate::ocr::TextBlock;

    struct ScriptedEngine {
        kind: EngineKind,
        script: Mutex<VecDeque<Result<OcrResponse, OcrFailure>>>,
        calls: AtomicUsize,
    }

    impl ScriptedEngine {
        fn new(
            kind: EngineKind,
            script: Vec<Result<OcrResponse, OcrFailure>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                kind,
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OcrEngine for ScriptedEngine {
        fn kind(&self) -> EngineKind {
            self.kind
        }

        async fn available(&self) -> bool {
            true
        }

        async fn run(
            &self,
            image: &RgbImage,
            _hints: &[LanguageHint],
            _dpi: u32,
        ) -> Result<OcrResponse, OcrFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(response(self.kind, image.dimensions(), vec![])))
        }
    }

    fn block(text: &str, x: u32, y: u32, confidence: f32, engine: EngineKind) -> TextBlock {
        TextBlock {
            text: text.to_string(),
            bbox: Rect::new(x, y, 30, 24).unwrap(),
            confidence,
            engine,
        }
    }

    fn response(engine: EngineKind, page_dims: (u32, u32), blocks: Vec<TextBlock>) -> OcrResponse {
        OcrResponse {
            blocks,
            engine,
            page_dims,
            elapsed: Duration::from_millis(5),
        }
    }

    fn strip(width: u32, height: u32) -> ColumnStrip {
        ColumnStrip {
            page: 0,
            column: 0,
            bounds: Rect::new(0, 0, width, height).unwrap(),
            image: RgbImage::new(width, height),
        }
    }

    fn extractor(
        config: JobConfig,
        local: Arc<ScriptedEngine>,
        remote: Option<Arc<ScriptedEngine>>,
    ) -> Extractor {
        Extractor::with_engines(
            config,
            local,
            remote.map(|r| r as Arc<dyn OcrEngine>),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn clean_column_completes_locally() {
        let local = ScriptedEngine::new(
            EngineKind::Local,
            vec![Ok(response(
                EngineKind::Local,
                (1169, 3309),
                vec![
                    block("1.", 40, 100, 0.9, EngineKind::Local),
                    block("2.", 40, 900, 0.9, EngineKind::Local),
                    block("3.", 40, 1700, 0.9, EngineKind::Local),
                    block("4.", 40, 2500, 0.9, EngineKind::Local),
                ],
            ))],
        );
        let remote = ScriptedEngine::new(EngineKind::Remote, vec![]);
        let ex = extractor(JobConfig::default(), Arc::clone(&local), Some(Arc::clone(&remote)));

        let tracker = ProgressTracker::new("test", None);
        let outcome = ex
            .process_column(strip(1169, 3309), &BTreeSet::new(), JobClock::new(None), &tracker, 1)
            .await
            .unwrap();

        assert_eq!(outcome.phase, ColumnPhase::CompleteOk);
        assert_eq!(outcome.detected, vec![1, 2, 3, 4]);
        assert!(outcome.missing.is_empty());
        assert_eq!(outcome.crops.len(), 4);
        // Last problem reaches the strip bottom.
        assert_eq!(outcome.crops[3].rect.bottom(), 3309);
        assert!(outcome.crops.iter().all(|c| c.source == EngineKind::Local));
        assert_eq!(remote.calls(), 0);
    }

    #[tokio::test]
    async fn gap_is_recovered_by_remote_coordinates() {
        let local_blocks = vec![
            block("1.", 40, 100, 0.9, EngineKind::Local),
            block("2.", 40, 500, 0.9, EngineKind::Local),
            block("5.", 40, 1340, 0.9, EngineKind::Local),
            block("6.", 40, 2600, 0.9, EngineKind::Local),
        ];
        let local = ScriptedEngine::new(
            EngineKind::Local,
            vec![
                Ok(response(EngineKind::Local, (1169, 3309), local_blocks.clone())),
                Ok(response(EngineKind::Local, (1169, 3309), local_blocks)),
            ],
        );
        // The remote engine reports in its own, larger page space.
        let remote = ScriptedEngine::new(
            EngineKind::Remote,
            vec![Ok(response(
                EngineKind::Remote,
                (2923, 8273),
                vec![TextBlock {
                    text: "3.".to_string(),
                    bbox: Rect::new(245, 2374, 25, 27).unwrap(),
                    confidence: 0.98,
                    engine: EngineKind::Remote,
                }],
            ))],
        );
        let ex = extractor(JobConfig::default(), local, Some(Arc::clone(&remote)));

        let tracker = ProgressTracker::new("test", None);
        let outcome = ex
            .process_column(strip(1169, 3309), &BTreeSet::new(), JobClock::new(None), &tracker, 1)
            .await
            .unwrap();

        assert_eq!(outcome.phase, ColumnPhase::CompletePartial);
        assert_eq!(outcome.detected, vec![1, 2, 3, 5, 6]);
        assert_eq!(outcome.missing, vec![4]);
        assert_eq!(remote.calls(), 1);

        let three = outcome.crops.iter().find(|c| c.number == 3).unwrap();
        assert_eq!(three.source, EngineKind::Remote);
        assert_eq!(three.rect.y, 950);
        assert_eq!(three.rect.bottom(), 1340);
        assert_eq!(three.rect.w, 1169);
    }

    #[tokio::test]
    async fn remote_unavailable_falls_through_to_partial() {
        let blocks = vec![
            block("1.", 40, 100, 0.9, EngineKind::Local),
            block("2.", 40, 700, 0.9, EngineKind::Local),
            block("5.", 40, 1500, 0.9, EngineKind::Local),
        ];
        let local = ScriptedEngine::new(
            EngineKind::Local,
            vec![
                Ok(response(EngineKind::Local, (1000, 2000), blocks.clone())),
                Ok(response(EngineKind::Local, (1000, 2000), blocks)),
            ],
        );
        let remote = ScriptedEngine::new(
            EngineKind::Remote,
            vec![Err(OcrFailure::Unavailable("credentials missing".into()))],
        );
        let ex = extractor(JobConfig::default(), local, Some(Arc::clone(&remote)));

        let tracker = ProgressTracker::new("test", None);
        let outcome = ex
            .process_column(strip(1000, 2000), &BTreeSet::new(), JobClock::new(None), &tracker, 1)
            .await
            .unwrap();

        assert_eq!(outcome.phase, ColumnPhase::CompletePartial);
        assert_eq!(outcome.missing, vec![3, 4]);
        assert_eq!(outcome.notes.len(), 1);
        assert_eq!(outcome.notes[0].kind, "remote_unavailable");
        assert_eq!(remote.calls(), 1);
    }

    #[tokio::test]
    async fn remote_runs_at_most_once_even_when_gaps_remain() {
        let blocks = vec![
            block("1.", 40, 100, 0.9, EngineKind::Local),
            block("4.", 40, 1500, 0.9, EngineKind::Local),
        ];
        let local = ScriptedEngine::new(
            EngineKind::Local,
            vec![
                Ok(response(EngineKind::Local, (1000, 2000), blocks.clone())),
                Ok(response(EngineKind::Local, (1000, 2000), blocks)),
            ],
        );
        // Remote finds nothing; the gap survives but no second call happens.
        let remote = ScriptedEngine::new(
            EngineKind::Remote,
            vec![Ok(response(EngineKind::Remote, (1000, 2000), vec![]))],
        );
        let ex = extractor(JobConfig::default(), local, Some(Arc::clone(&remote)));

        let tracker = ProgressTracker::new("test", None);
        let outcome = ex
            .process_column(strip(1000, 2000), &BTreeSet::new(), JobClock::new(None), &tracker, 1)
            .await
            .unwrap();

        assert_eq!(outcome.phase, ColumnPhase::CompletePartial);
        assert_eq!(outcome.missing, vec![2, 3]);
        assert_eq!(remote.calls(), 1);
    }

    #[tokio::test]
    async fn local_only_strategy_never_calls_remote() {
        let blocks = vec![
            block("1.", 40, 100, 0.9, EngineKind::Local),
            block("3.", 40, 1200, 0.9, EngineKind::Local),
        ];
        let local = ScriptedEngine::new(
            EngineKind::Local,
            vec![
                Ok(response(EngineKind::Local, (1000, 2000), blocks.clone())),
                Ok(response(EngineKind::Local, (1000, 2000), blocks)),
            ],
        );
        let remote = ScriptedEngine::new(EngineKind::Remote, vec![]);
        let config = JobConfig::default().with_strategy(OcrStrategy::LocalOnly);
        let ex = extractor(config, local, Some(Arc::clone(&remote)));

        let tracker = ProgressTracker::new("test", None);
        let outcome = ex
            .process_column(strip(1000, 2000), &BTreeSet::new(), JobClock::new(None), &tracker, 1)
            .await
            .unwrap();

        assert_eq!(outcome.phase, ColumnPhase::CompletePartial);
        assert_eq!(outcome.missing, vec![2]);
        assert_eq!(remote.calls(), 0);
    }

    #[tokio::test]
    async fn transient_local_failures_retry_within_budget() {
        let local = ScriptedEngine::new(
            EngineKind::Local,
            vec![
                Err(OcrFailure::Transient("hiccup".into())),
                Ok(response(
                    EngineKind::Local,
                    (1000, 2000),
                    vec![block("1.", 40, 100, 0.9, EngineKind::Local)],
                )),
            ],
        );
        let ex = extractor(JobConfig::default(), Arc::clone(&local), None);

        let tracker = ProgressTracker::new("test", None);
        let outcome = ex
            .process_column(strip(1000, 2000), &BTreeSet::new(), JobClock::new(None), &tracker, 1)
            .await
            .unwrap();

        assert_eq!(outcome.phase, ColumnPhase::CompleteOk);
        assert_eq!(local.calls(), 2);
    }

    #[tokio::test]
    async fn permanent_local_failure_is_fatal() {
        let local = ScriptedEngine::new(
            EngineKind::Local,
            vec![Err(OcrFailure::Permanent("corrupt image".into()))],
        );
        let ex = extractor(JobConfig::default(), local, None);

        let tracker = ProgressTracker::new("test", None);
        let result = ex
            .process_column(strip(1000, 2000), &BTreeSet::new(), JobClock::new(None), &tracker, 1)
            .await;

        assert!(matches!(result, Err(ExtractError::OcrFailed { .. })));
    }

    #[tokio::test]
    async fn expired_deadline_aborts_the_column() {
        let local = ScriptedEngine::new(EngineKind::Local, vec![]);
        let config = JobConfig::default().with_deadline(Some(Duration::from_millis(0)));
        let ex = extractor(config, Arc::clone(&local), None);

        let tracker = ProgressTracker::new("test", None);
        let clock = JobClock::new(Some(Duration::from_millis(0)));
        tokio::time::sleep(Duration::from_millis(2)).await;
        let result = ex
            .process_column(strip(100, 200), &BTreeSet::new(), clock, &tracker, 1)
            .await;

        assert!(matches!(result, Err(ExtractError::DeadlineExceeded { .. })));
        assert_eq!(local.calls(), 0);
    }

    #[tokio::test]
    async fn empty_local_recovered_entirely_by_remote() {
        let local = ScriptedEngine::new(
            EngineKind::Local,
            vec![
                Ok(response(EngineKind::Local, (1000, 2000), vec![])),
                Ok(response(EngineKind::Local, (1000, 2000), vec![])),
            ],
        );
        let remote = ScriptedEngine::new(
            EngineKind::Remote,
            vec![Ok(response(
                EngineKind::Remote,
                (1000, 2000),
                vec![
                    block("1.", 30, 100, 0.98, EngineKind::Remote),
                    block("2.", 30, 900, 0.98, EngineKind::Remote),
                ],
            ))],
        );
        let config = JobConfig::default().with_expected_problem_count(Some(2));
        let ex = extractor(config, local, Some(Arc::clone(&remote)));

        let job_expected: BTreeSet<u32> = [1, 2].into_iter().collect();
        let tracker = ProgressTracker::new("test", None);
        let outcome = ex
            .process_column(strip(1000, 2000), &job_expected, JobClock::new(None), &tracker, 1)
            .await
            .unwrap();

        assert_eq!(outcome.phase, ColumnPhase::CompleteOk);
        assert!(outcome.missing.is_empty());
        assert_eq!(outcome.crops.len(), 2);
        assert!(outcome.crops.iter().all(|c| c.source == EngineKind::Remote));
    }

    #[tokio::test]
    async fn relaxed_second_pass_recovers_a_weak_marker() {
        // The "2." token sits just under the default confidence gate; the
        // relaxed pass accepts it.
        let blocks = vec![
            block("1.", 40, 100, 0.9, EngineKind::Local),
            block("2.", 40, 900, 0.45, EngineKind::Local),
            block("3.", 40, 1500, 0.9, EngineKind::Local),
        ];
        let local = ScriptedEngine::new(
            EngineKind::Local,
            vec![
                Ok(response(EngineKind::Local, (1000, 2000), blocks.clone())),
                Ok(response(EngineKind::Local, (1000, 2000), blocks)),
            ],
        );
        let remote = ScriptedEngine::new(EngineKind::Remote, vec![]);
        let ex = extractor(JobConfig::default(), Arc::clone(&local), Some(Arc::clone(&remote)));

        let tracker = ProgressTracker::new("test", None);
        let outcome = ex
            .process_column(strip(1000, 2000), &BTreeSet::new(), JobClock::new(None), &tracker, 1)
            .await
            .unwrap();

        assert_eq!(outcome.phase, ColumnPhase::CompleteOk);
        assert_eq!(outcome.detected, vec![1, 2, 3]);
        assert_eq!(local.calls(), 2);
        assert_eq!(remote.calls(), 0);
    }

    #[tokio::test]
    async fn shared_passage_member_recovered_locally() {
        // [8~9] announces a passage for 8 and 9; 9's own token is a bare
        // digit the strict grammar rejects, so span recovery must find it.
        let local = ScriptedEngine::new(
            EngineKind::Local,
            vec![Ok(response(
                EngineKind::Local,
                (1000, 2000),
                vec![
                    block("[8~9] 다음 글을 읽고", 40, 200, 0.9, EngineKind::Local),
                    block("9", 40, 900, 0.8, EngineKind::Local),
                ],
            ))],
        );
        let remote = ScriptedEngine::new(EngineKind::Remote, vec![]);
        let ex = extractor(JobConfig::default(), local, Some(Arc::clone(&remote)));

        let tracker = ProgressTracker::new("test", None);
        let outcome = ex
            .process_column(strip(1000, 2000), &BTreeSet::new(), JobClock::new(None), &tracker, 1)
            .await
            .unwrap();

        assert_eq!(outcome.phase, ColumnPhase::CompleteOk);
        assert_eq!(outcome.detected, vec![8, 9]);
        assert!(outcome.missing.is_empty());
        assert_eq!(outcome.crops.len(), 2);
        assert_eq!(remote.calls(), 0);
    }

    #[tokio::test]
    async fn shared_passage_gap_escalates_to_remote() {
        // Only the range token is seen locally; 9 stays missing, which must
        // drive the remote pass, and the remote sighting fills it.
        let local_blocks = vec![block("[8~9]", 40, 200, 0.9, EngineKind::Local)];
        let local = ScriptedEngine::new(
            EngineKind::Local,
            vec![
                Ok(response(EngineKind::Local, (1000, 2000), local_blocks.clone())),
                Ok(response(EngineKind::Local, (1000, 2000), local_blocks)),
            ],
        );
        let remote = ScriptedEngine::new(
            EngineKind::Remote,
            vec![Ok(response(
                EngineKind::Remote,
                (1000, 2000),
                vec![block("9.", 40, 900, 0.95, EngineKind::Remote)],
            ))],
        );
        let ex = extractor(JobConfig::default(), local, Some(Arc::clone(&remote)));

        let tracker = ProgressTracker::new("test", None);
        let outcome = ex
            .process_column(strip(1000, 2000), &BTreeSet::new(), JobClock::new(None), &tracker, 1)
            .await
            .unwrap();

        assert_eq!(remote.calls(), 1);
        assert_eq!(outcome.phase, ColumnPhase::CompleteOk);
        assert_eq!(outcome.detected, vec![8, 9]);
        assert!(outcome.missing.is_empty());
        let nine = outcome.crops.iter().find(|c| c.number == 9).unwrap();
        assert_eq!(nine.source, EngineKind::Remote);
    }

    #[test]
    fn merge_spans_dedups_by_range() {
        let weak = SharedSpan {
            start: 8,
            end: 9,
            bbox: Rect::new(40, 210, 60, 24).unwrap(),
            confidence: 0.6,
            source: EngineKind::Local,
        };
        let strong = SharedSpan {
            start: 8,
            end: 9,
            bbox: Rect::new(40, 200, 60, 24).unwrap(),
            confidence: 0.9,
            source: EngineKind::Remote,
        };
        let merged = merge_spans(vec![weak], vec![strong]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].source, EngineKind::Remote);
    }

    #[test]
    fn merge_prefers_confidence_then_remote() {
        let local_marker = Marker {
            number: 3,
            bbox: Rect::new(10, 100, 20, 20).unwrap(),
            confidence: 0.8,
            source: EngineKind::Local,
        };
        let remote_same_conf = Marker {
            number: 3,
            bbox: Rect::new(12, 105, 20, 20).unwrap(),
            confidence: 0.8,
            source: EngineKind::Remote,
        };
        let merged = merge_markers(vec![local_marker.clone()], vec![remote_same_conf]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].source, EngineKind::Remote);

        let remote_weaker = Marker {
            number: 3,
            bbox: Rect::new(12, 105, 20, 20).unwrap(),
            confidence: 0.5,
            source: EngineKind::Remote,
        };
        let merged = merge_markers(vec![local_marker], vec![remote_weaker]);
        assert_eq!(merged[0].source, EngineKind::Local);
    }

    #[test]
    fn merge_output_is_sorted_by_y() {
        let a = Marker {
            number: 2,
            bbox: Rect::new(10, 800, 20, 20).unwrap(),
            confidence: 0.9,
            source: EngineKind::Local,
        };
        let b = Marker {
            number: 1,
            bbox: Rect::new(10, 100, 20, 20).unwrap(),
            confidence: 0.9,
            source: EngineKind::Remote,
        };
        let merged = merge_markers(vec![a], vec![b]);
        assert_eq!(
            merged.iter().map(|m| m.number).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn job_ids_are_sanitized_file_stems() {
        assert_eq!(job_id_from(Path::new("/tmp/물리_중간고사.pdf")), "물리_중간고사");
        assert_eq!(job_id_from(Path::new("a b-c.pdf")), "a_b_c");
        assert_eq!(job_id_from(Path::new("/")), "job");
    }

    #[test]
    fn empty_columns_inherit_inferred_expectations() {
        let config = JobConfig::default();
        let local = ScriptedEngine::new(EngineKind::Local, vec![]);
        let ex = extractor(config, local, None);

        let mut outcomes = vec![PageOutcome {
            page: 0,
            columns: vec![
                ColumnOutcome {
                    page: 0,
                    column: 0,
                    phase: ColumnPhase::CompleteOk,
                    crops: vec![],
                    missing: vec![],
                    detected: vec![1, 2, 3],
                    notes: vec![],
                },
                ColumnOutcome {
                    page: 0,
                    column: 1,
                    phase: ColumnPhase::CompleteOk,
                    crops: vec![],
                    missing: vec![],
                    detected: vec![],
                    notes: vec![],
                },
            ],
        }];

        ex.infer_missing_for_empty_columns(&mut outcomes);
        assert_eq!(outcomes[0].columns[1].missing, vec![1, 2, 3]);
        // Columns that detected something are untouched.
        assert!(outcomes[0].columns[0].missing.is_empty());
    }

    #[test]
    fn status_is_partial_when_anything_is_missing() {
        let ok_column = ColumnOutcome {
            page: 0,
            column: 0,
            phase: ColumnPhase::CompleteOk,
            crops: vec![],
            missing: vec![],
            detected: vec![1],
            notes: vec![],
        };
        let partial_column = ColumnOutcome {
            page: 0,
            column: 1,
            phase: ColumnPhase::CompletePartial,
            crops: vec![],
            missing: vec![4],
            detected: vec![3],
            notes: vec![],
        };

        let ok_pages = vec![PageOutcome {
            page: 0,
            columns: vec![ok_column],
        }];
        assert_eq!(job_status(&ok_pages), JobStatus::Ok);

        let partial_pages = vec![PageOutcome {
            page: 0,
            columns: vec![partial_column],
        }];
        assert_eq!(job_status(&partial_pages), JobStatus::Partial);
    }
}
