//! Pipeline integration tests against a scripted in-memory service.
//!
//! Every test runs on tokio's paused clock: sleeps in the orchestrator and
//! in the mock resolve instantly, and elapsed times are exact, so backoff
//! and polling intervals can be asserted to the second.

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use statement_extract::pipeline::orchestrator::{JobOrchestrator, OrchestratorSettings};
use statement_extract::{
    extract_pages, ExtractionConfig, ExtractionConfigBuilder, ExtractionProgressCallback,
    ExtractionService, FieldSchema, JobStatus, PageError, PageImage, PageStatus, ProgressCallback,
    ServiceError, StatementError,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

// ── Mock service ─────────────────────────────────────────────────────────────

#[derive(Clone)]
enum Script {
    /// Completes with `content` on the `polls`-th status request.
    Complete { content: String, polls: u32 },
    /// Reports `failed` on the first status request.
    Fail,
    /// Submission is rejected.
    Reject,
    /// Stays `processing` forever.
    Never,
}

#[derive(Default)]
struct Calls {
    sync_requests: usize,
    submitted: Vec<(usize, Instant)>,
    load_checks: Vec<Instant>,
    polls: HashMap<usize, u32>,
    completed: Vec<usize>,
}

struct MockService {
    sample: String,
    scripts: HashMap<usize, Script>,
    submit_latency: HashMap<usize, Duration>,
    /// Load-check answers consumed in order; `None` is a failed check.
    load: Mutex<VecDeque<Option<usize>>>,
    load_after: Option<usize>,
    calls: Mutex<Calls>,
}

impl MockService {
    fn new(sample: impl Into<String>) -> Self {
        Self {
            sample: sample.into(),
            scripts: HashMap::new(),
            submit_latency: HashMap::new(),
            load: Mutex::new(VecDeque::new()),
            load_after: Some(0),
            calls: Mutex::new(Calls::default()),
        }
    }

    fn page(mut self, page: usize, script: Script) -> Self {
        self.scripts.insert(page, script);
        self
    }

    fn latency(mut self, page: usize, d: Duration) -> Self {
        self.submit_latency.insert(page, d);
        self
    }

    fn load_sequence(self, answers: Vec<Option<usize>>) -> Self {
        *self.load.lock().unwrap() = answers.into();
        self
    }

    /// Answer once the scripted sequence is used up.
    fn load_after(mut self, answer: Option<usize>) -> Self {
        self.load_after = answer;
        self
    }

    fn page_of(record_id: &str) -> usize {
        record_id
            .strip_prefix("rec-")
            .and_then(|n| n.parse().ok())
            .expect("mock record id")
    }
}

#[async_trait]
impl ExtractionService for MockService {
    async fn extract_sync(&self, _image: &PageImage, output_type: &str) -> Result<String, ServiceError> {
        assert_eq!(output_type, "markdown-financial-docs");
        self.calls.lock().unwrap().sync_requests += 1;
        Ok(self.sample.clone())
    }

    async fn submit(&self, image: &PageImage, schema: &FieldSchema) -> Result<String, ServiceError> {
        assert!(!schema.is_empty());
        if let Some(d) = self.submit_latency.get(&image.page_num) {
            tokio::time::sleep(*d).await;
        }
        if let Some(Script::Reject) = self.scripts.get(&image.page_num) {
            return Err(ServiceError::Status {
                status: 400,
                body: "unsupported image".into(),
            });
        }
        self.calls
            .lock()
            .unwrap()
            .submitted
            .push((image.page_num, Instant::now()));
        Ok(format!("rec-{}", image.page_num))
    }

    async fn job_status(&self, record_id: &str) -> Result<JobStatus, ServiceError> {
        let page = Self::page_of(record_id);
        let mut calls = self.calls.lock().unwrap();
        let polls = {
            let n = calls.polls.entry(page).or_default();
            *n += 1;
            *n
        };
        Ok(match self.scripts.get(&page) {
            Some(Script::Complete { content, polls: needed }) if polls >= *needed => {
                calls.completed.push(page);
                JobStatus::Completed {
                    content: content.clone(),
                }
            }
            Some(Script::Fail) => JobStatus::Failed {
                status: "failed".into(),
                diagnostic: format!(r#"{{"record_id":"{record_id}","message":"unreadable"}}"#),
            },
            _ => JobStatus::Processing,
        })
    }

    async fn in_flight_jobs(&self) -> Result<usize, ServiceError> {
        self.calls.lock().unwrap().load_checks.push(Instant::now());
        let answer = self
            .load
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.load_after);
        answer.ok_or_else(|| ServiceError::Decode("listing unavailable".into()))
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

const HEADER: &str = "<tr><th>Date</th><th>Description</th><th>Amount</th></tr>";

fn html_table(rows: &[[&str; 3]]) -> String {
    let body: String = rows
        .iter()
        .map(|r| format!("<tr><td>{}</td><td>{}</td><td>{}</td></tr>", r[0], r[1], r[2]))
        .collect();
    format!("<table>{HEADER}{body}</table>")
}

fn sample_page() -> String {
    format!(
        "# Account summary\n<table><tr><th>Opening</th><th>Closing</th></tr></table>\n{}",
        html_table(&[["01/01", "Opening balance", "0.00"]])
    )
}

fn page_images(n: usize) -> Vec<PageImage> {
    (1..=n).map(|p| PageImage::new(p, vec![0x89, b'P', b'N', b'G'])).collect()
}

fn config_for(mock: &Arc<MockService>) -> ExtractionConfigBuilder {
    ExtractionConfig::builder().service(mock.clone())
}

fn secs(v: &[u64]) -> Vec<Duration> {
    v.iter().map(|s| Duration::from_secs(*s)).collect()
}

fn gaps(instants: &[Instant]) -> Vec<Duration> {
    instants.windows(2).map(|w| w[1] - w[0]).collect()
}

// ── Ordering ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn results_follow_page_order_under_random_latency() {
    let latencies = [7u64, 1, 12, 3, 9, 0, 5, 11];
    let polls = [1u32, 3, 2, 1, 4, 2, 1, 3];

    let mut mock = MockService::new(sample_page());
    for (i, (lat, polls)) in latencies.iter().zip(polls).enumerate() {
        let page = i + 1;
        let date = format!("01/{page:02}");
        let desc = format!("page {page}");
        mock = mock
            .page(
                page,
                Script::Complete {
                    content: html_table(&[[date.as_str(), desc.as_str(), "1.00"]]),
                    polls,
                },
            )
            .latency(page, Duration::from_secs(*lat));
    }
    let mock = Arc::new(mock);

    let output = extract_pages(page_images(8), &config_for(&mock).build().unwrap())
        .await
        .unwrap();

    // Completion order differs from page order...
    let completed = mock.calls.lock().unwrap().completed.clone();
    assert_eq!(completed.len(), 8);
    assert_ne!(completed, (1..=8).collect::<Vec<_>>());

    // ...but the dataset does not.
    let pages: Vec<usize> = output.dataset.records.iter().map(|r| r.page).collect();
    assert_eq!(pages, (1..=8).collect::<Vec<_>>());
    for (i, _) in output.dataset.records.iter().enumerate() {
        assert_eq!(
            output.dataset.value(i, "Description"),
            Some(format!("page {}", i + 1).as_str())
        );
    }
    assert_eq!(output.schema.fields(), ["Date", "Description", "Amount"]);
    assert_eq!(mock.calls.lock().unwrap().sync_requests, 1);
}

#[tokio::test(start_paused = true)]
async fn orchestrator_slots_match_input_positions() {
    let mock = Arc::new(
        MockService::new("")
            .page(1, Script::Complete { content: "a".into(), polls: 3 })
            .page(2, Script::Complete { content: "b".into(), polls: 1 })
            .page(3, Script::Complete { content: "c".into(), polls: 2 }),
    );
    let schema = FieldSchema::from_fields(["Amount"]).unwrap();
    let results = JobOrchestrator::new(mock, OrchestratorSettings::default())
        .run(page_images(3), &schema)
        .await;

    let got: Vec<(usize, Option<&str>)> = results.iter().map(|r| (r.page_num, r.content())).collect();
    assert_eq!(got, vec![(1, Some("a")), (2, Some("b")), (3, Some("c"))]);
    assert_eq!(results[0].polls, 3);
}

// ── Admission control ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn always_busy_service_backs_off_and_never_submits() {
    let mock = Arc::new(MockService::new("").load_after(Some(50)));
    let settings = OrchestratorSettings {
        page_timeout: Some(Duration::from_secs(300)),
        ..OrchestratorSettings::default()
    };
    let schema = FieldSchema::from_fields(["Amount"]).unwrap();

    let results = JobOrchestrator::new(mock.clone(), settings)
        .run(page_images(1), &schema)
        .await;

    let calls = mock.calls.lock().unwrap();
    assert!(calls.submitted.is_empty());
    assert_eq!(gaps(&calls.load_checks), secs(&[5, 10, 20, 40, 60, 60, 60]));
    assert_eq!(
        results[0].outcome,
        Err(PageError::Timeout { page: 1, secs: 300 })
    );
    assert_eq!(results[0].record_id, None);
}

/// Counts a job as in flight only once its upload has finished, and
/// releases it on the second status request.
#[derive(Default)]
struct SlowUploadService {
    state: Mutex<SlowUploadState>,
}

#[derive(Default)]
struct SlowUploadState {
    in_flight: usize,
    peak: usize,
    polls: HashMap<String, u32>,
}

#[async_trait]
impl ExtractionService for SlowUploadService {
    async fn extract_sync(&self, _: &PageImage, _: &str) -> Result<String, ServiceError> {
        Ok(String::new())
    }

    async fn submit(&self, image: &PageImage, _: &FieldSchema) -> Result<String, ServiceError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut state = self.state.lock().unwrap();
        state.in_flight += 1;
        state.peak = state.peak.max(state.in_flight);
        Ok(format!("rec-{}", image.page_num))
    }

    async fn job_status(&self, record_id: &str) -> Result<JobStatus, ServiceError> {
        let mut state = self.state.lock().unwrap();
        let n = state.polls.entry(record_id.to_string()).or_default();
        *n += 1;
        if *n < 2 {
            return Ok(JobStatus::Processing);
        }
        state.in_flight -= 1;
        Ok(JobStatus::Completed {
            content: record_id.to_string(),
        })
    }

    async fn in_flight_jobs(&self) -> Result<usize, ServiceError> {
        Ok(self.state.lock().unwrap().in_flight)
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_workers_stay_under_the_ceiling() {
    let service = Arc::new(SlowUploadService::default());
    let settings = OrchestratorSettings {
        max_processing_limit: 2,
        ..OrchestratorSettings::default()
    };
    let schema = FieldSchema::from_fields(["Amount"]).unwrap();

    let results = JobOrchestrator::new(service.clone(), settings)
        .run(page_images(5), &schema)
        .await;

    assert!(results.iter().all(|r| r.is_success()), "{results:?}");
    let state = service.state.lock().unwrap();
    assert_eq!(state.peak, 2);
    assert_eq!(state.in_flight, 0);
}

#[derive(Default)]
struct BusyRecorder {
    waits: Mutex<Vec<(usize, Option<usize>, Duration)>>,
}

impl ExtractionProgressCallback for BusyRecorder {
    fn on_service_busy(&self, page_num: usize, in_flight: Option<usize>, wait: Duration) {
        self.waits.lock().unwrap().push((page_num, in_flight, wait));
    }
}

#[tokio::test(start_paused = true)]
async fn failed_load_checks_count_as_busy() {
    let mock = Arc::new(
        MockService::new("")
            .load_sequence(vec![None, Some(75), Some(3)])
            .page(1, Script::Complete { content: "ok".into(), polls: 1 }),
    );
    let recorder = Arc::new(BusyRecorder::default());
    let schema = FieldSchema::from_fields(["Amount"]).unwrap();

    let start = Instant::now();
    let results = JobOrchestrator::new(mock.clone(), OrchestratorSettings::default())
        .with_progress(Some(recorder.clone() as ProgressCallback))
        .run(page_images(1), &schema)
        .await;

    assert!(results[0].is_success());
    let submitted_at = mock.calls.lock().unwrap().submitted[0].1;
    assert_eq!(submitted_at - start, Duration::from_secs(15));
    assert_eq!(
        *recorder.waits.lock().unwrap(),
        vec![
            (1, None, Duration::from_secs(5)),
            (1, Some(75), Duration::from_secs(10)),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn backoff_restarts_for_each_page() {
    let mock = Arc::new(
        MockService::new("")
            .load_sequence(vec![Some(50), Some(0), Some(50), Some(0)])
            .page(1, Script::Complete { content: "1".into(), polls: 1 })
            .page(2, Script::Complete { content: "2".into(), polls: 1 }),
    );
    let settings = OrchestratorSettings {
        concurrency: Some(1),
        ..OrchestratorSettings::default()
    };
    let schema = FieldSchema::from_fields(["Amount"]).unwrap();

    let start = Instant::now();
    JobOrchestrator::new(mock.clone(), settings)
        .run(page_images(2), &schema)
        .await;

    let submitted: Vec<Duration> = mock
        .calls
        .lock()
        .unwrap()
        .submitted
        .iter()
        .map(|(_, at)| *at - start)
        .collect();
    // Each page waits the initial 5 s once, not a continued 10 s.
    assert_eq!(submitted, secs(&[5, 10]));
}

// ── Failure isolation ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn failed_job_on_page_two_leaves_pages_one_and_three() {
    let mock = Arc::new(
        MockService::new(sample_page())
            .page(
                1,
                Script::Complete {
                    content: html_table(&[["01/02", "Coffee", "-4.50"], ["01/03", "Salary", "2500.00"]]),
                    polls: 2,
                },
            )
            .page(2, Script::Fail)
            .page(
                3,
                Script::Complete {
                    content: html_table(&[["01/09", "Rent", "-900.00"]]),
                    polls: 1,
                },
            ),
    );

    let output = extract_pages(page_images(3), &config_for(&mock).build().unwrap())
        .await
        .unwrap();

    let tags: Vec<(usize, usize)> = output
        .dataset
        .records
        .iter()
        .map(|r| (r.page, r.row_number))
        .collect();
    assert_eq!(tags, vec![(1, 1), (1, 2), (3, 1)]);
    assert_eq!(output.dataset.value(2, "Description"), Some("Rent"));

    match &output.pages[1].status {
        PageStatus::Failed {
            error: PageError::JobFailed { record_id, diagnostic, .. },
        } => {
            assert_eq!(record_id, "rec-2");
            assert!(diagnostic.contains("unreadable"));
        }
        other => panic!("unexpected status {other:?}"),
    }
    assert_eq!(output.stats.failed_pages, 1);
    assert_eq!(output.stats.extracted_pages, 2);

    let err = output.into_result().unwrap_err();
    assert!(matches!(
        err,
        StatementError::PartialFailure { failed: 1, total: 3, ref pages } if pages == &vec![2]
    ));
}

#[tokio::test(start_paused = true)]
async fn rejected_submission_fails_only_that_page() {
    let mock = Arc::new(
        MockService::new("")
            .page(1, Script::Complete { content: "x".into(), polls: 1 })
            .page(2, Script::Reject),
    );
    let schema = FieldSchema::from_fields(["Amount"]).unwrap();
    let results = JobOrchestrator::new(mock.clone(), OrchestratorSettings::default())
        .run(page_images(2), &schema)
        .await;

    assert!(results[0].is_success());
    assert_eq!(
        results[1].outcome,
        Err(PageError::Submission {
            page: 2,
            detail: "service returned HTTP 400: unsupported image".into(),
        })
    );
    assert_eq!(results[1].polls, 0);
    assert!(!mock.calls.lock().unwrap().polls.contains_key(&2));
}

// ── Merging ──────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn duplicate_rows_across_pages_are_dropped() {
    let repeated = ["01/31", "Balance carried forward", "1200.00"];
    let mock = Arc::new(
        MockService::new(sample_page())
            .page(
                1,
                Script::Complete {
                    content: html_table(&[["01/30", "Fee", "-2.00"], repeated]),
                    polls: 1,
                },
            )
            .page(
                2,
                Script::Complete {
                    content: html_table(&[repeated, ["01/31", "Balance carried forward", "1200.01"]]),
                    polls: 1,
                },
            ),
    );

    let output = extract_pages(page_images(2), &config_for(&mock).build().unwrap())
        .await
        .unwrap();

    let tags: Vec<(usize, usize)> = output
        .dataset
        .records
        .iter()
        .map(|r| (r.page, r.row_number))
        .collect();
    assert_eq!(tags, vec![(1, 1), (1, 2), (2, 2)]);
    assert_eq!(output.stats.duplicate_rows, 1);
    assert_eq!(output.stats.total_rows, 3);
}

#[tokio::test(start_paused = true)]
async fn mixed_encodings_normalize_into_one_table() {
    let mock = Arc::new(
        MockService::new(sample_page())
            .page(
                1,
                Script::Complete {
                    content: html_table(&[["02/01", "Groceries", "-54.20"]]),
                    polls: 1,
                },
            )
            .page(
                2,
                Script::Complete {
                    content: "```json\n[{\"date\": \"02/02\", \"description\": \"Fuel\", \"amount\": \"-40.00\"}]\n```"
                        .into(),
                    polls: 1,
                },
            )
            .page(
                3,
                Script::Complete {
                    content: r#"{"metadata": {"bank": "Example"}, "content": [{"Date": "02/03", "Description": "Refund", "Amount": "12.00", "Branch": "North"}]}"#.into(),
                    polls: 1,
                },
            )
            .page(
                4,
                Script::Complete {
                    content: "Nothing to report on this page.".into(),
                    polls: 1,
                },
            ),
    );

    let output = extract_pages(page_images(4), &config_for(&mock).build().unwrap())
        .await
        .unwrap();

    let descriptions: Vec<Option<&str>> = (0..output.dataset.len())
        .map(|i| output.dataset.value(i, "Description"))
        .collect();
    assert_eq!(descriptions, vec![Some("Groceries"), Some("Fuel"), Some("Refund")]);
    assert_eq!(output.stats.empty_pages, 1);

    let csv = output.dataset.to_csv_string().unwrap();
    assert!(csv.starts_with("Date,Description,Amount,page,row_number\n"));
    assert!(!csv.contains("North"));
}

// ── Schema ───────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn sample_without_table_is_fatal() {
    let mock = Arc::new(
        MockService::new("Statement period: January")
            .page(1, Script::Complete { content: "x".into(), polls: 1 }),
    );
    let err = extract_pages(page_images(1), &config_for(&mock).build().unwrap())
        .await
        .unwrap_err();

    assert!(matches!(err, StatementError::SchemaDetection { .. }));
    assert!(mock.calls.lock().unwrap().submitted.is_empty());
}

#[tokio::test(start_paused = true)]
async fn supplied_fields_skip_the_sample_request() {
    let mock = Arc::new(MockService::new("").page(
        1,
        Script::Complete {
            content: r#"{"Posted": "03/01", "Amount": "5.00"}"#.into(),
            polls: 1,
        },
    ));
    let config = config_for(&mock)
        .fields(["Posted", "Amount"])
        .build()
        .unwrap();

    let output = extract_pages(page_images(1), &config).await.unwrap();

    assert_eq!(mock.calls.lock().unwrap().sync_requests, 0);
    assert_eq!(output.dataset.value(0, "Posted"), Some("03/01"));
}

#[tokio::test]
async fn no_pages_is_an_error() {
    let mock = Arc::new(MockService::new(sample_page()));
    let err = extract_pages(Vec::new(), &config_for(&mock).build().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, StatementError::NoPages));
}

// ── Cancellation ─────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn cancellation_resolves_pending_pages_and_keeps_finished_ones() {
    let mock = Arc::new(
        MockService::new("")
            .page(1, Script::Complete { content: r#"{"Amount": "1.00"}"#.into(), polls: 1 })
            .page(2, Script::Never)
            .page(3, Script::Never),
    );
    let config = config_for(&mock).fields(["Amount"]).build().unwrap();

    let token = config.cancellation.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(12)).await;
        token.cancel();
    });

    let start = Instant::now();
    let output = extract_pages(page_images(3), &config).await.unwrap();

    assert_eq!(start.elapsed(), Duration::from_secs(12));
    assert_eq!(output.dataset.len(), 1);
    assert_eq!(output.failed_pages(), vec![2, 3]);
    assert_eq!(
        output.pages[2].status,
        PageStatus::Failed {
            error: PageError::Cancelled { page: 3 }
        }
    );
    assert_eq!(output.pages[1].record_id.as_deref(), Some("rec-2"));
    // Polls at 0 s, 5 s and 10 s before the cancel at 12 s.
    assert_eq!(mock.calls.lock().unwrap().polls[&2], 3);
}

#[tokio::test(start_paused = true)]
async fn cancelled_before_start_submits_nothing() {
    let mock = Arc::new(MockService::new(sample_page()));
    let config = config_for(&mock).build().unwrap();
    config.cancellation.cancel();

    let err = extract_pages(page_images(2), &config).await.unwrap_err();
    assert!(matches!(err, StatementError::Cancelled));
    assert!(mock.calls.lock().unwrap().submitted.is_empty());
}
