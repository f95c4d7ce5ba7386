use crate::ClientConfig;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use sbx_core::{
    decode_report, AnalysisTask, ForensicReport, InsightRequest, ReportError, TelemetryEvent,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-success HTTP status, with the best message the body offered.
    #[error("{message}")]
    Status { status: u16, message: String },

    /// Error record sent by the server inside an otherwise healthy stream.
    #[error("{0}")]
    Stream(String),

    #[error("chat stream exceeded {limit} malformed frames")]
    MalformedStream { limit: usize },

    #[error("invalid report: {0}")]
    Report(#[from] ReportError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("base url cannot carry a path: {0}")]
    InvalidBase(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),
}

/// The REST surface the correlation view depends on.
#[async_trait]
pub trait AnalysisApi: Send + Sync {
    async fn list_tasks(&self) -> Result<Vec<AnalysisTask>, ApiError>;

    async fn telemetry_history(
        &self,
        task_id: Option<&str>,
        search: Option<&str>,
    ) -> Result<Vec<TelemetryEvent>, ApiError>;

    async fn ai_report(&self, task_id: &str) -> Result<ForensicReport, ApiError>;

    async fn ai_insight(&self, request: &InsightRequest) -> Result<ForensicReport, ApiError>;
}

#[derive(Clone)]
pub struct ApiClient {
    pub(crate) http: Client,
    pub(crate) config: ClientConfig,
}

impl ApiClient {
    pub fn new(config: ClientConfig) -> Result<Self, ApiError> {
        let http = Client::builder()
            .user_agent(concat!("sbx/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Resolves a root-relative API path against the base url, keeping any
    /// path prefix the base carries.
    pub(crate) fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.config.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| ApiError::InvalidBase(self.config.base_url.to_string()))?;
            path.pop_if_empty();
            path.extend(segments);
        }
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, ApiError> {
        debug!(event = "api_get", url = %url);
        let response = self.http.get(url).send().await?;
        let response = ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl AnalysisApi for ApiClient {
    async fn list_tasks(&self) -> Result<Vec<AnalysisTask>, ApiError> {
        let url = self.endpoint(&["tasks"])?;
        self.get_json(url).await
    }

    async fn telemetry_history(
        &self,
        task_id: Option<&str>,
        search: Option<&str>,
    ) -> Result<Vec<TelemetryEvent>, ApiError> {
        let mut url = self.endpoint(&["vms", "telemetry", "history"])?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(task_id) = task_id {
                query.append_pair("task_id", task_id);
            }
            if let Some(search) = search.filter(|s| !s.trim().is_empty()) {
                query.append_pair("search", search);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        self.get_json(url).await
    }

    async fn ai_report(&self, task_id: &str) -> Result<ForensicReport, ApiError> {
        let url = self.endpoint(&["tasks", task_id, "ai-report"])?;
        debug!(event = "api_get", url = %url);
        let response = self.http.get(url).send().await?;
        let body = ensure_success(response).await?.text().await?;
        Ok(decode_report(&body)?)
    }

    async fn ai_insight(&self, request: &InsightRequest) -> Result<ForensicReport, ApiError> {
        let url = self.endpoint(&["vms", "analysis", "ai-insight"])?;
        debug!(
            event = "api_post",
            url = %url,
            processes = request.processes.len(),
            events = request.events.len()
        );
        let response = self.http.post(url).json(request).send().await?;
        let body = ensure_success(response).await?.text().await?;
        Ok(decode_report(&body)?)
    }
}

pub(crate) async fn ensure_success(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Status {
        status: status.as_u16(),
        message: status_message(status, &body),
    })
}

/// Prefers a `response` or `error` string from a JSON body, then a generic
/// status message; a body that is not JSON at all yields the status text.
pub(crate) fn status_message(status: StatusCode, body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(value) => ["response", "error"]
            .into_iter()
            .find_map(|key| {
                value
                    .get(key)
                    .and_then(Value::as_str)
                    .filter(|message| !message.trim().is_empty())
            })
            .map(str::to_string)
            .unwrap_or_else(|| format!("request failed with status {}", status.as_u16())),
        Err(_) => status
            .canonical_reason()
            .map(str::to_string)
            .unwrap_or_else(|| status.to_string()),
    }
}
