//! Job orchestration: one remote extraction job per page.
//!
//! Each page goes through the same lifecycle:
//!
//! ```text
//! Pending ──admission──▶ Submitted ──▶ Polling ──▶ Completed
//!    │                       │            │
//!    └───────────────────────┴────────────┴──────▶ Failed
//! ```
//!
//! * **Admission**: before submitting, the worker asks the service how many
//!   jobs are in flight. At or above `max_processing_limit` it sleeps with
//!   exponential backoff (`initial_backoff` doubling up to `max_backoff`)
//!   and asks again. A failed load check counts as busy. Admission is
//!   serialized across this run's workers: the gate is held from the load
//!   check until `submit` returns, so the next check already counts the
//!   previous job.
//! * **Submit**: exactly once; a rejected submission fails the page.
//! * **Poll**: every `poll_interval` until the job completes or fails.
//!
//! Pages run concurrently through `buffer_unordered`; each worker writes its
//! result into the slot of its input position, so the returned vector is in
//! input order no matter which page finishes first. A page failure never
//! touches its siblings.

use crate::cancel::CancellationToken;
use crate::config::ExtractionConfig;
use crate::error::PageError;
use crate::output::PageResult;
use crate::pipeline::render::PageImage;
use crate::progress::ProgressCallback;
use crate::schema::FieldSchema;
use crate::service::{ExtractionService, JobStatus};
use futures::stream::{self, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Tunables of the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub max_processing_limit: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub poll_interval: Duration,
    pub max_poll_errors: u32,
    /// Concurrent page workers; `None` runs one per page.
    pub concurrency: Option<usize>,
    pub page_timeout: Option<Duration>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&ExtractionConfig::default())
    }
}

impl From<&ExtractionConfig> for OrchestratorSettings {
    fn from(config: &ExtractionConfig) -> Self {
        Self {
            max_processing_limit: config.max_processing_limit,
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            poll_interval: config.poll_interval,
            max_poll_errors: config.max_poll_errors,
            concurrency: config.concurrency,
            page_timeout: config.page_timeout,
        }
    }
}

/// Doubling delay sequence, capped at `max`.
///
/// `initial, 2·initial, 4·initial, … , max, max, …`
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { next: initial, max }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next.min(self.max);
        self.next = delay.saturating_mul(2).min(self.max);
        delay
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        Some(self.next_delay())
    }
}

/// Lifecycle state of one page's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Submitted,
    Polling,
    Completed,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "pending",
            JobState::Submitted => "submitted",
            JobState::Polling => "polling",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Bookkeeping for one page's remote job.
#[derive(Debug, Clone)]
pub struct ExtractionJob {
    pub page_num: usize,
    pub record_id: Option<String>,
    pub state: JobState,
    pub polls: u32,
}

impl ExtractionJob {
    pub fn new(page_num: usize) -> Self {
        Self {
            page_num,
            record_id: None,
            state: JobState::Pending,
            polls: 0,
        }
    }

    fn transition(&mut self, next: JobState) {
        if self.state != next {
            debug!("Page {}: {} → {}", self.page_num, self.state, next);
            self.state = next;
        }
    }
}

pub struct JobOrchestrator {
    service: Arc<dyn ExtractionService>,
    settings: OrchestratorSettings,
    progress: Option<ProgressCallback>,
    cancellation: CancellationToken,
    admission: Mutex<()>,
}

impl JobOrchestrator {
    pub fn new(service: Arc<dyn ExtractionService>, settings: OrchestratorSettings) -> Self {
        Self {
            service,
            settings,
            progress: None,
            cancellation: CancellationToken::new(),
            admission: Mutex::new(()),
        }
    }

    pub fn with_progress(mut self, progress: Option<ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Run every page to resolution.
    ///
    /// The result at index *i* belongs to `pages[i]`.
    pub async fn run(&self, pages: Vec<PageImage>, schema: &FieldSchema) -> Vec<PageResult> {
        let total = pages.len();
        let workers = self.settings.concurrency.unwrap_or(total).max(1);
        info!(
            "Submitting {} page(s) with {} worker(s), ceiling {} in-flight job(s)",
            total, workers, self.settings.max_processing_limit
        );

        let mut slots: Vec<Option<PageResult>> = vec![None; total];
        let mut resolved = stream::iter(pages.into_iter().enumerate().map(|(slot, page)| async move {
            (slot, self.run_page(page, schema, total).await)
        }))
        .buffer_unordered(workers);

        while let Some((slot, result)) = resolved.next().await {
            slots[slot] = Some(result);
        }

        // Every worker future runs to completion, so every slot is filled.
        slots.into_iter().flatten().collect()
    }

    async fn run_page(&self, page: PageImage, schema: &FieldSchema, total: usize) -> PageResult {
        let started = Instant::now();
        let page_num = page.page_num;
        let mut job = ExtractionJob::new(page_num);

        let outcome = tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(PageError::Cancelled { page: page_num }),
            outcome = self.drive_with_limit(&mut job, page, schema, total) => outcome,
        };

        match &outcome {
            Ok(content) => {
                job.transition(JobState::Completed);
                if let Some(cb) = &self.progress {
                    cb.on_page_complete(page_num, total, content.len());
                }
            }
            Err(e) => {
                job.transition(JobState::Failed);
                warn!("{}", e);
                if let Some(cb) = &self.progress {
                    cb.on_page_error(page_num, total, &e.to_string());
                }
            }
        }

        PageResult {
            page_num,
            record_id: job.record_id,
            polls: job.polls,
            duration_ms: started.elapsed().as_millis() as u64,
            outcome,
        }
    }

    async fn drive_with_limit(
        &self,
        job: &mut ExtractionJob,
        page: PageImage,
        schema: &FieldSchema,
        total: usize,
    ) -> Result<String, PageError> {
        let page_num = page.page_num;
        match self.settings.page_timeout {
            Some(limit) => tokio::time::timeout(limit, self.drive(job, page, schema, total))
                .await
                .unwrap_or(Err(PageError::Timeout {
                    page: page_num,
                    secs: limit.as_secs(),
                })),
            None => self.drive(job, page, schema, total).await,
        }
    }

    async fn drive(
        &self,
        job: &mut ExtractionJob,
        page: PageImage,
        schema: &FieldSchema,
        total: usize,
    ) -> Result<String, PageError> {
        let page_num = page.page_num;
        let record_id = {
            let _admitted = self.admission.lock().await;
            self.wait_for_capacity(page_num).await;

            if let Some(cb) = &self.progress {
                cb.on_page_start(page_num, total);
            }
            self.service
                .submit(&page, schema)
                .await
                .map_err(|e| PageError::Submission {
                    page: page_num,
                    detail: e.to_string(),
                })?
        };
        drop(page);

        job.record_id = Some(record_id.clone());
        job.transition(JobState::Submitted);
        if let Some(cb) = &self.progress {
            cb.on_page_submitted(page_num, &record_id);
        }

        self.poll_until_resolved(job, &record_id).await
    }

    /// Block until the service reports spare capacity.
    async fn wait_for_capacity(&self, page_num: usize) {
        let limit = self.settings.max_processing_limit;
        let mut backoff = Backoff::new(self.settings.initial_backoff, self.settings.max_backoff);

        loop {
            let in_flight = match self.service.in_flight_jobs().await {
                Ok(n) if n < limit => {
                    debug!("Page {}: admitted ({} of {} in flight)", page_num, n, limit);
                    return;
                }
                Ok(n) => Some(n),
                Err(e) => {
                    warn!("Page {}: load check failed, assuming busy: {}", page_num, e);
                    None
                }
            };

            let delay = backoff.next_delay();
            debug!(
                "Page {}: service busy ({:?} in flight), retrying in {:?}",
                page_num, in_flight, delay
            );
            if let Some(cb) = &self.progress {
                cb.on_service_busy(page_num, in_flight, delay);
            }
            tokio::time::sleep(delay).await;
        }
    }

    async fn poll_until_resolved(
        &self,
        job: &mut ExtractionJob,
        record_id: &str,
    ) -> Result<String, PageError> {
        let page = job.page_num;
        let mut consecutive_errors = 0u32;

        loop {
            job.polls += 1;
            job.transition(JobState::Polling);

            match self.service.job_status(record_id).await {
                Ok(JobStatus::Completed { content }) => return Ok(content),
                Ok(JobStatus::Failed { status, diagnostic }) => {
                    return Err(PageError::JobFailed {
                        page,
                        record_id: record_id.to_string(),
                        status,
                        diagnostic,
                    })
                }
                Ok(JobStatus::Processing) => consecutive_errors = 0,
                Err(e) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= self.settings.max_poll_errors {
                        return Err(PageError::PollFailed {
                            page,
                            attempts: consecutive_errors,
                            detail: e.to_string(),
                        });
                    }
                    warn!(
                        "Page {}: status request {} failed ({}/{}): {}",
                        page, record_id, consecutive_errors, self.settings.max_poll_errors, e
                    );
                }
            }

            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }
}
