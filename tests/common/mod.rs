#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use prompt_runner::backend::MockJobBackend;
use prompt_runner::dispatcher::{spawn_dispatcher, DispatcherHandle, DispatcherOptions};
use prompt_runner::executor::PollConfig;
use prompt_runner::sink::{AlertLog, OutputStore};
use prompt_runner::types::{Catalog, DispatchSummary, RunRequest};

/// Creates a `RunRequest`, panicking on invalid ids.
pub fn make_request(prompt_id: &str, document_id: &str, profile_id: &str) -> RunRequest {
    RunRequest::new(prompt_id, document_id, profile_id).expect("valid ids")
}

/// Creates `count` requests for prompt `p1` and profile `l1` over documents
/// `d01`, `d02`, ... in order.
pub fn make_requests(count: usize) -> Vec<RunRequest> {
    (1..=count)
        .map(|i| make_request("p1", &format!("d{:02}", i), "l1"))
        .collect()
}

/// Creates a catalog with `prompts` prompts (`p1`..), `profiles` profiles
/// (`l1`..) and `documents` documents (`d1`..).
pub fn make_catalog(prompts: usize, profiles: usize, documents: usize) -> Catalog {
    Catalog {
        prompts: (1..=prompts).map(|i| format!("p{}", i)).collect(),
        profiles: (1..=profiles).map(|i| format!("l{}", i)).collect(),
        documents: (1..=documents).map(|i| format!("d{}", i)).collect(),
    }
}

/// Dispatcher options with the default 5s/30s polling and a cap of `max_active`.
pub fn options(catalog: Catalog, max_active: usize) -> DispatcherOptions {
    DispatcherOptions {
        max_active,
        poll: PollConfig {
            interval: Duration::from_secs(5),
            max_wait: Duration::from_secs(30),
        },
        catalog,
        ..Default::default()
    }
}

/// A running dispatcher plus the sinks it writes to.
pub struct Harness {
    pub handle: DispatcherHandle,
    pub task: tokio::task::JoinHandle<DispatchSummary>,
    pub backend: Arc<MockJobBackend>,
    pub outputs: Arc<OutputStore>,
    pub alerts: Arc<AlertLog>,
}

impl Harness {
    /// Drop the handle and wait for the dispatcher's summary.
    pub async fn shutdown(self) -> DispatchSummary {
        drop(self.handle);
        self.task.await.expect("dispatcher task")
    }
}

pub fn start(backend: MockJobBackend, options: DispatcherOptions) -> Harness {
    let backend = Arc::new(backend);
    let outputs = Arc::new(OutputStore::new());
    let alerts = Arc::new(AlertLog::new());
    let (handle, task) = spawn_dispatcher(
        backend.clone(),
        outputs.clone(),
        alerts.clone(),
        options,
    );
    Harness {
        handle,
        task,
        backend,
        outputs,
        alerts,
    }
}
