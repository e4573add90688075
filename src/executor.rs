use std::time::Duration;

use tokio::time::Instant;

use crate::backend::JobBackend;
use crate::config::SchedulerConfig;
use crate::error::RunError;
use crate::types::{JobResponse, JobSubmission, RunRequest};
use crate::{log_debug, log_info};

/// Timing for the submit-then-poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_wait: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_wait: Duration::from_secs(30),
        }
    }
}

impl From<&SchedulerConfig> for PollConfig {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.poll_interval_secs),
            max_wait: Duration::from_secs(config.max_wait_secs),
        }
    }
}

/// One in-flight submission: the request, its correlation id, and its deadline.
///
/// Lives from the first submission until the poll loop resolves.
#[derive(Debug, Clone)]
pub struct PollEnvelope {
    pub request: RunRequest,
    pub run_id: String,
    pub started: Instant,
    pub max_wait: Duration,
    pub interval: Duration,
}

impl PollEnvelope {
    pub fn new(request: RunRequest, run_id: String, poll: PollConfig) -> Self {
        Self {
            request,
            run_id,
            started: Instant::now(),
            max_wait: poll.max_wait,
            interval: poll.interval,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.started + self.max_wait
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline()
    }
}

/// Generate a fresh correlation id for one admission.
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Submit a run and poll until it completes, fails, or the deadline passes.
///
/// The first call is made immediately. While the backend answers `pending`,
/// the loop sleeps one interval and re-submits the same body. The deadline is
/// hard: a call still in progress at the deadline is dropped, and the last
/// sleep is cut short at the deadline. With a 5s interval and 30s max wait at
/// most six calls are made.
///
/// Timing out only stops client-side polling; the backend job is not cancelled.
pub async fn execute_run(
    envelope: &PollEnvelope,
    backend: &impl JobBackend,
) -> Result<serde_json::Value, RunError> {
    let submission = JobSubmission::new(&envelope.request, &envelope.run_id);
    let deadline = envelope.deadline();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        log_debug!(
            "[{}] Polling {} (attempt {})",
            envelope.run_id,
            envelope.request,
            attempt
        );

        let call = tokio::time::timeout_at(deadline, backend.submit(&submission));
        let response = match call.await {
            Ok(result) => result?,
            Err(_) => {
                log_debug!(
                    "[{}] Call {} still in progress at the deadline",
                    envelope.run_id,
                    attempt
                );
                return Err(RunError::Timeout(envelope.max_wait));
            }
        };

        match response {
            JobResponse::Completed { output } => {
                log_info!(
                    "[{}] Completed {} after {} call(s)",
                    envelope.run_id,
                    envelope.request,
                    attempt
                );
                return Ok(output);
            }
            JobResponse::Failed { error } => return Err(RunError::JobFailed(error)),
            JobResponse::Pending => {}
        }

        tokio::time::sleep_until((Instant::now() + envelope.interval).min(deadline)).await;

        if envelope.is_expired(Instant::now()) {
            return Err(RunError::Timeout(envelope.max_wait));
        }
    }
}
