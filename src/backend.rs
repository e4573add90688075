use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::config::BackendConfig;
use crate::error::RunError;
use crate::log_debug;
use crate::types::{JobResponse, JobSubmission};

/// Trait for talking to the job endpoint. Enables mocking in scheduler tests.
///
/// The same call is used for the first submission and for every poll tick;
/// the backend recognises repeats by `run_id`.
pub trait JobBackend: Send + Sync {
    fn submit(
        &self,
        submission: &JobSubmission,
    ) -> impl std::future::Future<Output = Result<JobResponse, RunError>> + Send;
}

/// Real implementation posting JSON to the prompt run endpoint.
pub struct HttpJobBackend {
    client: reqwest::Client,
    url: String,
}

impl HttpJobBackend {
    pub fn new(config: &BackendConfig) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            url: submit_url(&config.base_url, &config.submit_path),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl JobBackend for HttpJobBackend {
    async fn submit(&self, submission: &JobSubmission) -> Result<JobResponse, RunError> {
        log_debug!(
            "[backend] POST {} (run {})",
            self.url,
            submission.run_id
        );
        let response = self.client.post(&self.url).json(submission).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RunError::Backend {
                status: status.as_u16(),
                message: error_message_from_body(&body),
            });
        }

        let body = response.text().await?;
        parse_job_response(&body)
    }
}

/// Join base URL and path with exactly one slash between them.
pub fn submit_url(base_url: &str, submit_path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        submit_path.trim_start_matches('/')
    )
}

/// Parse a 2xx response body.
pub fn parse_job_response(body: &str) -> Result<JobResponse, RunError> {
    serde_json::from_str(body).map_err(|e| RunError::Decode(e.to_string()))
}

/// Pull a human-readable message out of an error body.
///
/// Backends usually answer `{"error": "..."}` or `{"detail": "..."}`; anything
/// else is passed through trimmed.
pub fn error_message_from_body(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for field in ["error", "detail", "message"] {
            if let Some(text) = value.get(field).and_then(|v| v.as_str()) {
                return text.to_string();
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "empty response body".to_string()
    } else {
        trimmed.to_string()
    }
}

// --- Mock ---

/// One scripted answer from [`MockJobBackend`].
#[derive(Debug, Clone)]
pub enum MockReply {
    Pending,
    Completed(serde_json::Value),
    JobFailed(String),
    HttpError(u16, String),
}

impl MockReply {
    fn into_result(self) -> Result<JobResponse, RunError> {
        match self {
            MockReply::Pending => Ok(JobResponse::Pending),
            MockReply::Completed(output) => Ok(JobResponse::Completed { output }),
            MockReply::JobFailed(error) => Ok(JobResponse::Failed { error }),
            MockReply::HttpError(status, message) => Err(RunError::Backend { status, message }),
        }
    }
}

/// Mock backend for scheduler tests.
///
/// Replies are scripted per request key (`prompt__document__profile`). Each
/// call pops the next reply for that key; when a script runs dry the
/// fallback reply is used. Every call sleeps `latency` first and is recorded.
pub struct MockJobBackend {
    scripts: tokio::sync::Mutex<HashMap<String, VecDeque<MockReply>>>,
    fallback: MockReply,
    latency: Duration,
    calls: tokio::sync::Mutex<Vec<JobSubmission>>,
    in_call: AtomicUsize,
    peak_in_call: AtomicUsize,
}

impl MockJobBackend {
    /// Every request completes on its first call with `output`.
    pub fn completing(output: serde_json::Value) -> Self {
        Self::with_fallback(MockReply::Completed(output))
    }

    /// Every request stays pending forever.
    pub fn pending_forever() -> Self {
        Self::with_fallback(MockReply::Pending)
    }

    pub fn with_fallback(fallback: MockReply) -> Self {
        Self {
            scripts: tokio::sync::Mutex::new(HashMap::new()),
            fallback,
            latency: Duration::ZERO,
            calls: tokio::sync::Mutex::new(Vec::new()),
            in_call: AtomicUsize::new(0),
            peak_in_call: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Script the replies for one request key, in call order.
    pub fn with_script(mut self, request_key: &str, replies: Vec<MockReply>) -> Self {
        self.scripts
            .get_mut()
            .insert(request_key.to_string(), replies.into());
        self
    }

    pub async fn calls(&self) -> Vec<JobSubmission> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }

    /// Calls currently awaiting a reply.
    pub fn in_flight(&self) -> usize {
        self.in_call.load(Ordering::SeqCst)
    }

    /// Highest number of calls that were awaiting a reply at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_call.load(Ordering::SeqCst)
    }
}

/// Counts one call as in progress until dropped, including when the caller
/// drops the call future mid-latency.
struct InCallGuard<'a>(&'a AtomicUsize);

impl<'a> InCallGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InCallGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl JobBackend for MockJobBackend {
    async fn submit(&self, submission: &JobSubmission) -> Result<JobResponse, RunError> {
        self.calls.lock().await.push(submission.clone());

        let _in_call = InCallGuard::enter(&self.in_call);
        self.peak_in_call
            .fetch_max(self.in_call.load(Ordering::SeqCst), Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let key = crate::key::request_key(
            &submission.prompt_id,
            &submission.document_id,
            &submission.profile_id,
        );
        let reply = {
            let mut scripts = self.scripts.lock().await;
            scripts
                .get_mut(&key)
                .and_then(|script| script.pop_front())
                .unwrap_or_else(|| self.fallback.clone())
        };

        reply.into_result()
    }
}
