//! The remote extraction service, as seen by the orchestrator.
//!
//! The orchestrator never talks HTTP directly; it drives an
//! [`ExtractionService`] trait object. [`http::NanonetsClient`] is the
//! production implementation; tests plug in scripted in-memory services.

pub mod http;

use crate::error::ServiceError;
use crate::pipeline::render::PageImage;
use crate::schema::FieldSchema;
use async_trait::async_trait;
use serde_json::Value;

/// Processing state of one remote job, as reported by the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// Queued or running; poll again later.
    Processing,
    /// Finished; `content` is the raw page payload.
    Completed { content: String },
    /// The service gave up on the job. `diagnostic` is the full status
    /// payload so the reason survives into the page manifest.
    Failed { status: String, diagnostic: String },
}

impl JobStatus {
    /// Interpret a status payload (`{"processing_status": ..., "content": ...}`).
    ///
    /// Any status other than `completed`, `failed` or `error` (including a
    /// missing one) counts as still processing.
    pub fn from_payload(payload: &Value) -> Self {
        let status = payload
            .get("processing_status")
            .or_else(|| payload.get("status"))
            .and_then(Value::as_str)
            .unwrap_or("processing")
            .to_ascii_lowercase();

        match status.as_str() {
            "completed" => JobStatus::Completed {
                content: payload.get("content").map(content_text).unwrap_or_default(),
            },
            "failed" | "error" => JobStatus::Failed {
                status,
                diagnostic: payload.to_string(),
            },
            _ => JobStatus::Processing,
        }
    }

    /// True for `completed`, `failed` and `error`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Processing)
    }
}

/// `content` may come back as a string or as structured JSON; structured
/// content is re-serialised so the normalizer sees one text form.
pub(crate) fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Submit/poll contract of the remote OCR extraction service.
///
/// Implementations must be `Send + Sync`: one instance is shared by every
/// page worker of a run.
#[async_trait]
pub trait ExtractionService: Send + Sync {
    /// Synchronous extraction of one image in the given output mode.
    /// Used only for the sample page that seeds schema detection.
    async fn extract_sync(&self, image: &PageImage, output_type: &str)
        -> Result<String, ServiceError>;

    /// Start an asynchronous extraction of `image` for the schema's fields.
    /// Returns the remote record identifier.
    async fn submit(&self, image: &PageImage, schema: &FieldSchema)
        -> Result<String, ServiceError>;

    /// Current status of a submitted job.
    async fn job_status(&self, record_id: &str) -> Result<JobStatus, ServiceError>;

    /// Number of jobs the service is currently processing for this account.
    async fn in_flight_jobs(&self) -> Result<usize, ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn completed_payload_carries_content() {
        let status = JobStatus::from_payload(&json!({
            "processing_status": "completed",
            "content": "<table></table>"
        }));
        assert_eq!(
            status,
            JobStatus::Completed {
                content: "<table></table>".into()
            }
        );
        assert!(status.is_terminal());
    }

    #[test]
    fn structured_content_is_serialised() {
        let status = JobStatus::from_payload(&json!({
            "processing_status": "completed",
            "content": {"metadata": {}, "content": []}
        }));
        let JobStatus::Completed { content } = status else {
            panic!("expected completed");
        };
        assert!(content.contains("\"metadata\""));
    }

    #[test]
    fn failed_and_error_keep_diagnostic() {
        for s in ["failed", "ERROR"] {
            let status = JobStatus::from_payload(&json!({
                "processing_status": s,
                "message": "unreadable image"
            }));
            match status {
                JobStatus::Failed { status, diagnostic } => {
                    assert_eq!(status, s.to_ascii_lowercase());
                    assert!(diagnostic.contains("unreadable image"));
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn unknown_or_missing_status_is_processing() {
        assert_eq!(
            JobStatus::from_payload(&json!({"processing_status": "queued"})),
            JobStatus::Processing
        );
        assert_eq!(JobStatus::from_payload(&json!({})), JobStatus::Processing);
    }
}
