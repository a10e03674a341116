//! reqwest-backed client for the Nanonets extraction API.
//!
//! | Operation | Request |
//! |-----------|---------|
//! | sample page | `POST {base}/extract` (multipart: `file`, `output_type`, `model`) |
//! | submit      | `POST {base}/extract-async` (`output_type=specified-fields`, `specified_fields`) |
//! | status      | `GET {base}/files/{record_id}` |
//! | load check  | `GET {base}/files` |
//!
//! Every request carries `Authorization: Bearer <key>`.

use super::{content_text, ExtractionService, JobStatus};
use crate::config::ExtractionConfig;
use crate::error::{ServiceError, StatementError};
use crate::pipeline::render::PageImage;
use crate::schema::FieldSchema;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Environment variable consulted when no API key is configured.
pub const API_KEY_ENV: &str = "NANONETS_API_KEY";

/// Output mode used when submitting pages for the schema's fields.
const SPECIFIED_FIELDS_OUTPUT: &str = "specified-fields";

/// Keys under which a listing response may hold its records.
const LISTING_KEYS: [&str; 5] = ["files", "records", "results", "data", "items"];

pub struct NanonetsClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    document_name: String,
}

impl fmt::Debug for NanonetsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NanonetsClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("document_name", &self.document_name)
            .finish()
    }
}

impl NanonetsClient {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        request_timeout_secs: u64,
    ) -> Result<Self, StatementError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(request_timeout_secs))
            .build()
            .map_err(|e| StatementError::Internal(format!("HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            document_name: "statement".to_string(),
        })
    }

    /// Prefix for uploaded file names (`{name}_page_{n}.png`).
    pub fn with_document_name(mut self, name: impl Into<String>) -> Self {
        self.document_name = name.into();
        self
    }

    /// Build a client from the configuration, falling back to
    /// [`API_KEY_ENV`] for the key.
    pub fn from_config(config: &ExtractionConfig) -> Result<Self, StatementError> {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| StatementError::ServiceNotConfigured {
                hint: format!("Set {API_KEY_ENV} or pass --api-key."),
            })?;

        let client = Self::new(
            api_key,
            config.base_url.clone(),
            config.model.clone(),
            config.request_timeout_secs,
        )?;
        Ok(match &config.document_name {
            Some(name) => client.with_document_name(name.clone()),
            None => client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn image_part(&self, image: &PageImage, file_name: String) -> Result<Part, ServiceError> {
        Ok(Part::bytes(image.png.clone())
            .file_name(file_name)
            .mime_str("image/png")?)
    }
}

#[async_trait]
impl ExtractionService for NanonetsClient {
    async fn extract_sync(
        &self,
        image: &PageImage,
        output_type: &str,
    ) -> Result<String, ServiceError> {
        let file_name = format!("{}_first_page.png", self.document_name);
        let form = Form::new()
            .part("file", self.image_part(image, file_name)?)
            .text("output_type", output_type.to_string())
            .text("model", self.model.clone());

        let response = self
            .http
            .post(self.url("extract"))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;
        let payload = read_json(response).await?;

        payload
            .get("content")
            .map(content_text)
            .ok_or_else(|| ServiceError::Decode("sync response has no 'content'".into()))
    }

    async fn submit(&self, image: &PageImage, schema: &FieldSchema) -> Result<String, ServiceError> {
        let file_name = format!("{}_page_{}.png", self.document_name, image.page_num);
        let form = Form::new()
            .part("file", self.image_part(image, file_name)?)
            .text("output_type", SPECIFIED_FIELDS_OUTPUT)
            .text("model", self.model.clone())
            .text("specified_fields", schema.joined());

        let response = self
            .http
            .post(self.url("extract-async"))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;
        let payload = read_json(response).await?;

        let record_id = record_id_of(&payload)?;
        debug!("Page {}: submitted as record {}", image.page_num, record_id);
        Ok(record_id)
    }

    async fn job_status(&self, record_id: &str) -> Result<JobStatus, ServiceError> {
        let response = self
            .http
            .get(self.url(&format!("files/{record_id}")))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let payload = read_json(response).await?;
        Ok(JobStatus::from_payload(&payload))
    }

    async fn in_flight_jobs(&self) -> Result<usize, ServiceError> {
        let response = self
            .http
            .get(self.url("files"))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let payload = read_json(response).await?;
        count_in_flight(&payload)
    }
}

async fn read_json(response: reqwest::Response) -> Result<Value, ServiceError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ServiceError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response.json::<Value>().await?)
}

fn record_id_of(payload: &Value) -> Result<String, ServiceError> {
    match payload.get("record_id") {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(ServiceError::Decode(format!(
            "submit response has no 'record_id': {payload}"
        ))),
    }
}

/// Count listed jobs that are not in a terminal status.
fn count_in_flight(payload: &Value) -> Result<usize, ServiceError> {
    let records = match payload {
        Value::Array(items) => items,
        Value::Object(map) => LISTING_KEYS
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_array))
            .ok_or_else(|| ServiceError::Decode("listing response holds no job list".into()))?,
        other => {
            return Err(ServiceError::Decode(format!(
                "listing response is not a list: {other}"
            )))
        }
    };

    Ok(records
        .iter()
        .filter(|record| !JobStatus::from_payload(record).is_terminal())
        .count())
}
