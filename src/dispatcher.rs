use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::backend::JobBackend;
use crate::config::PromptRunnerConfig;
use crate::error::RunError;
use crate::executor::{self, PollConfig, PollEnvelope};
use crate::key::{self, KeyFlags};
use crate::queue::{QueueSnapshot, RunQueue};
use crate::sink::{AlertSink, OutputEntry, OutputSink};
use crate::status::RunStatusTable;
use crate::types::{Catalog, DispatchSummary, PromptStatus, RunMode, RunRequest};
use crate::{log_debug, log_info, log_warn};

// --- Request expansion: pure function ---

/// Requests produced by one run mode together with the status markers that
/// must be set for them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Expansion {
    pub requests: Vec<RunRequest>,
    pub markers: BTreeMap<String, BTreeSet<String>>,
}

impl Expansion {
    fn from_requests(requests: Vec<RunRequest>) -> Self {
        let mut markers: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for request in &requests {
            markers
                .entry(request.prompt_id().to_string())
                .or_default()
                .insert(request.status_key());
        }
        Self { requests, markers }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// Expand a run mode into the Cartesian product of its axes.
///
/// Fixed axes use the id carried by the mode and must exist in the catalog.
/// "All" axes take every catalog entry. Order is prompt, then document,
/// then profile, so admission order is deterministic.
pub fn expand(mode: &RunMode, catalog: &Catalog) -> Result<Expansion, RunError> {
    let prompts = axis("prompt", fixed_prompt(mode), &catalog.prompts)?;
    let profiles = axis("profile", fixed_profile(mode), &catalog.profiles)?;
    let documents = axis("document", fixed_document(mode), &catalog.documents)?;

    let mut requests = Vec::with_capacity(prompts.len() * profiles.len() * documents.len());
    for prompt_id in &prompts {
        for document_id in &documents {
            for profile_id in &profiles {
                requests.push(RunRequest::new(prompt_id, document_id, profile_id)?);
            }
        }
    }

    Ok(Expansion::from_requests(requests))
}

fn axis(
    kind: &'static str,
    fixed: Option<&String>,
    all: &[String],
) -> Result<Vec<String>, RunError> {
    match fixed {
        Some(id) if all.contains(id) => Ok(vec![id.clone()]),
        Some(id) => Err(RunError::UnknownId {
            kind,
            id: id.clone(),
        }),
        None => Ok(all.to_vec()),
    }
}

fn fixed_prompt(mode: &RunMode) -> Option<&String> {
    match mode {
        RunMode::OnePromptOneProfileOneDoc { prompt_id, .. }
        | RunMode::OnePromptOneProfileAllDocs { prompt_id, .. }
        | RunMode::OnePromptAllProfilesOneDoc { prompt_id, .. }
        | RunMode::OnePromptAllProfilesAllDocs { prompt_id } => Some(prompt_id),
        RunMode::AllPromptsOneProfileOneDoc { .. }
        | RunMode::AllPromptsAllProfilesOneDoc { .. }
        | RunMode::AllPromptsAllProfilesAllDocs => None,
    }
}

fn fixed_profile(mode: &RunMode) -> Option<&String> {
    match mode {
        RunMode::OnePromptOneProfileOneDoc { profile_id, .. }
        | RunMode::OnePromptOneProfileAllDocs { profile_id, .. }
        | RunMode::AllPromptsOneProfileOneDoc { profile_id, .. } => Some(profile_id),
        RunMode::OnePromptAllProfilesOneDoc { .. }
        | RunMode::OnePromptAllProfilesAllDocs { .. }
        | RunMode::AllPromptsAllProfilesOneDoc { .. }
        | RunMode::AllPromptsAllProfilesAllDocs => None,
    }
}

fn fixed_document(mode: &RunMode) -> Option<&String> {
    match mode {
        RunMode::OnePromptOneProfileOneDoc { document_id, .. }
        | RunMode::OnePromptAllProfilesOneDoc { document_id, .. }
        | RunMode::AllPromptsOneProfileOneDoc { document_id, .. }
        | RunMode::AllPromptsAllProfilesOneDoc { document_id } => Some(document_id),
        RunMode::OnePromptOneProfileAllDocs { .. }
        | RunMode::OnePromptAllProfilesAllDocs { .. }
        | RunMode::AllPromptsAllProfilesAllDocs => None,
    }
}

// --- Dispatch state ---

/// A request moved from the queue to execution, with its correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub run_id: String,
    pub request: RunRequest,
}

#[derive(Debug, Clone)]
struct InFlight {
    seq: u64,
    request: RunRequest,
}

/// Queue, status table, and in-flight runs, mutated only through these methods.
///
/// Every method reads and writes the current state, so completions arriving
/// in any order cannot undo each other's updates.
#[derive(Debug)]
pub struct DispatchState {
    queue: RunQueue,
    status: RunStatusTable,
    in_flight: HashMap<String, InFlight>,
    next_seq: u64,
}

impl DispatchState {
    pub fn new(max_active: usize) -> Self {
        Self {
            queue: RunQueue::new(max_active),
            status: RunStatusTable::new(),
            in_flight: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Mark every expanded cell RUNNING and append its request to the queue.
    ///
    /// Both happen in the same call, so a queued request always has a marker.
    pub fn enqueue(&mut self, expansion: Expansion) -> usize {
        let count = expansion.requests.len();
        self.status.mark_running(expansion.markers);
        self.queue.enqueue(expansion.requests);
        count
    }

    /// Level-triggered admission: fill every free slot from the queue head.
    pub fn admit(&mut self) -> Vec<Admission> {
        let available = self.queue.available();
        if available == 0 || self.queue.is_empty() {
            return Vec::new();
        }

        let drained = self.queue.drain(available);
        self.queue.admit(drained.len());

        drained
            .into_iter()
            .map(|request| {
                let run_id = executor::new_run_id();
                self.next_seq += 1;
                self.in_flight.insert(
                    run_id.clone(),
                    InFlight {
                        seq: self.next_seq,
                        request: request.clone(),
                    },
                );
                Admission { run_id, request }
            })
            .collect()
    }

    /// Release the run's slot and clear its status cell.
    ///
    /// Returns `None` (and changes nothing) if the run id is unknown or was
    /// already settled. The cell stays marked while another queued or
    /// in-flight request targets the same cell.
    pub fn settle(&mut self, run_id: &str) -> Option<RunRequest> {
        let entry = self.in_flight.remove(run_id)?;
        self.queue.release(1);

        let request = entry.request;
        if !self.has_pending_duplicate(&request) {
            self.status
                .clear(request.prompt_id(), &request.status_key());
        }
        Some(request)
    }

    fn has_pending_duplicate(&self, request: &RunRequest) -> bool {
        self.queue.pending().any(|r| r == request)
            || self.in_flight.values().any(|f| f.request == *request)
    }

    pub fn queue(&self) -> &RunQueue {
        &self.queue
    }

    pub fn status(&self) -> &RunStatusTable {
        &self.status
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_empty()
    }

    /// In-flight requests in admission order, followed by the queue in FIFO order.
    pub fn pending_requests(&self) -> Vec<RunRequest> {
        let mut in_flight: Vec<&InFlight> = self.in_flight.values().collect();
        in_flight.sort_by_key(|f| f.seq);
        in_flight
            .into_iter()
            .map(|f| f.request.clone())
            .chain(self.queue.pending().cloned())
            .collect()
    }

    /// Forget everything: queue, status cells, and in-flight bookkeeping.
    pub fn reset(&mut self) {
        self.queue.reset();
        self.status.reset();
        self.in_flight.clear();
    }
}

/// Alert text for a failed run. Always names the document.
pub fn alert_message(request: &RunRequest, err: &RunError) -> String {
    if err.is_timeout() {
        format!(
            "Run timed out for document {} (prompt {}, profile {}): {}",
            request.document_id(),
            request.prompt_id(),
            request.profile_id(),
            err
        )
    } else {
        format!(
            "Failed to run prompt {} on document {} with profile {}: {}",
            request.prompt_id(),
            request.document_id(),
            request.profile_id(),
            err
        )
    }
}

// --- Command enum ---

pub enum DispatcherCommand {
    Enqueue {
        mode: RunMode,
        reply: oneshot::Sender<Result<usize, RunError>>,
    },
    Restore {
        requests: Vec<RunRequest>,
        reply: oneshot::Sender<usize>,
    },
    RunStatusFor {
        prompt_id: String,
        reply: oneshot::Sender<PromptStatus>,
    },
    FocusDocument {
        document_id: Option<String>,
        reply: oneshot::Sender<()>,
    },
    QueueSnapshot {
        reply: oneshot::Sender<QueueSnapshot>,
    },
    PendingRequests {
        reply: oneshot::Sender<Vec<RunRequest>>,
    },
    Reset {
        catalog: Catalog,
        reply: oneshot::Sender<()>,
    },
    WaitIdle {
        reply: oneshot::Sender<()>,
    },
}

// --- DispatcherHandle ---

#[derive(Clone)]
pub struct DispatcherHandle {
    sender: mpsc::Sender<DispatcherCommand>,
}

impl DispatcherHandle {
    async fn send_command<T>(
        &self,
        command: DispatcherCommand,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, RunError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| RunError::DispatcherClosed)?;
        rx.await.map_err(|_| RunError::DispatcherClosed)
    }

    /// Expand `mode`, mark its cells RUNNING, and queue the requests.
    ///
    /// Returns how many requests were queued.
    pub async fn enqueue_run(&self, mode: RunMode) -> Result<usize, RunError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(DispatcherCommand::Enqueue { mode, reply }, rx)
            .await?
    }

    /// Re-mark and re-queue requests recovered from a resume snapshot.
    pub async fn restore(&self, requests: Vec<RunRequest>) -> Result<usize, RunError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(DispatcherCommand::Restore { requests, reply }, rx)
            .await
    }

    pub async fn run_status_for(&self, prompt_id: &str) -> Result<PromptStatus, RunError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            DispatcherCommand::RunStatusFor {
                prompt_id: prompt_id.to_string(),
                reply,
            },
            rx,
        )
        .await
    }

    /// Set the document whose results are published for rendering.
    pub async fn focus_document(&self, document_id: Option<&str>) -> Result<(), RunError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(
            DispatcherCommand::FocusDocument {
                document_id: document_id.map(str::to_string),
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn queue_snapshot(&self) -> Result<QueueSnapshot, RunError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(DispatcherCommand::QueueSnapshot { reply }, rx)
            .await
    }

    pub async fn pending_requests(&self) -> Result<Vec<RunRequest>, RunError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(DispatcherCommand::PendingRequests { reply }, rx)
            .await
    }

    /// Switch to a new catalog, dropping queued work and abandoning in-flight polls.
    pub async fn reset(&self, catalog: Catalog) -> Result<(), RunError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(DispatcherCommand::Reset { catalog, reply }, rx)
            .await
    }

    /// Resolve once nothing is queued or in flight.
    pub async fn wait_idle(&self) -> Result<(), RunError> {
        let (reply, rx) = oneshot::channel();
        self.send_command(DispatcherCommand::WaitIdle { reply }, rx)
            .await
    }

    /// [`wait_idle`](Self::wait_idle) that gives up with
    /// [`RunError::Interrupted`] once `cancel` fires. Runs keep going in the
    /// dispatcher; the caller decides what to do with them.
    pub async fn wait_idle_or_cancelled(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), RunError> {
        tokio::select! {
            idle = self.wait_idle() => idle,
            _ = cancel.cancelled() => Err(RunError::Interrupted),
        }
    }
}

// --- Settle guard ---

struct Completion {
    run_id: String,
    outcome: Result<serde_json::Value, RunError>,
}

/// Reports a run's outcome to the dispatcher when dropped.
///
/// A task that panics or is aborted still drops its guard, so the
/// dispatcher always hears about every admitted run.
struct SettleGuard {
    run_id: String,
    outcome: Option<Result<serde_json::Value, RunError>>,
    done: mpsc::UnboundedSender<Completion>,
}

impl SettleGuard {
    fn new(run_id: String, done: mpsc::UnboundedSender<Completion>) -> Self {
        Self {
            run_id,
            outcome: None,
            done,
        }
    }

    fn finish(mut self, outcome: Result<serde_json::Value, RunError>) {
        self.outcome = Some(outcome);
    }
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        let outcome = self.outcome.take().unwrap_or(Err(RunError::Interrupted));
        let _ = self.done.send(Completion {
            run_id: std::mem::take(&mut self.run_id),
            outcome,
        });
    }
}

// --- Actor implementation ---

const CHANNEL_CAPACITY: usize = 32;

/// Everything needed to start a dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    pub max_active: usize,
    pub poll: PollConfig,
    pub key_flags: KeyFlags,
    pub catalog: Catalog,
    pub focused_document: Option<String>,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            max_active: crate::queue::MAX_ACTIVE_APIS,
            poll: PollConfig::default(),
            key_flags: KeyFlags::default(),
            catalog: Catalog::default(),
            focused_document: None,
        }
    }
}

impl DispatcherOptions {
    pub fn from_config(config: &PromptRunnerConfig) -> Self {
        Self {
            max_active: config.scheduler.max_active,
            poll: PollConfig::from(&config.scheduler),
            key_flags: KeyFlags::default(),
            catalog: config.catalog.to_catalog(),
            focused_document: config.catalog.focused_document.clone(),
        }
    }
}

struct DispatcherActor<B: JobBackend + 'static> {
    state: DispatchState,
    catalog: Catalog,
    focused_document: Option<String>,
    poll: PollConfig,
    key_flags: KeyFlags,
    backend: Arc<B>,
    outputs: Arc<dyn OutputSink>,
    alerts: Arc<dyn AlertSink>,
    tasks: JoinSet<()>,
    /// Output keys showing a loading entry, by run id.
    loading: HashMap<String, String>,
    done_tx: mpsc::UnboundedSender<Completion>,
    idle_waiters: Vec<oneshot::Sender<()>>,
    summary: DispatchSummary,
}

impl<B: JobBackend + 'static> DispatcherActor<B> {
    fn is_focused(&self, request: &RunRequest) -> bool {
        self.focused_document.as_deref() == Some(request.document_id())
    }

    fn output_key(&self, request: &RunRequest) -> Option<String> {
        match key::encode(
            request.prompt_id(),
            request.document_id(),
            request.profile_id(),
            &self.key_flags,
        ) {
            Ok(k) => Some(k),
            Err(e) => {
                log_warn!("Cannot build output key for {}: {}", request, e);
                None
            }
        }
    }

    fn handle_command(&mut self, cmd: DispatcherCommand) {
        match cmd {
            DispatcherCommand::Enqueue { mode, reply } => {
                let result = expand(&mode, &self.catalog).map(|expansion| {
                    log_info!("Queueing {} run(s) for {}", expansion.len(), mode.name());
                    self.state.enqueue(expansion)
                });
                // Admit before replying so callers observe the post-admission state.
                self.admit_and_spawn();
                let _ = reply.send(result);
            }
            DispatcherCommand::Restore { requests, reply } => {
                let count = self.state.enqueue(Expansion::from_requests(requests));
                if count > 0 {
                    log_info!("Restored {} pending run(s)", count);
                }
                self.admit_and_spawn();
                let _ = reply.send(count);
            }
            DispatcherCommand::RunStatusFor { prompt_id, reply } => {
                let _ = reply.send(self.state.status().snapshot(&prompt_id));
            }
            DispatcherCommand::FocusDocument { document_id, reply } => {
                self.focused_document = document_id;
                let _ = reply.send(());
            }
            DispatcherCommand::QueueSnapshot { reply } => {
                let _ = reply.send(self.state.queue().snapshot());
            }
            DispatcherCommand::PendingRequests { reply } => {
                let _ = reply.send(self.state.pending_requests());
            }
            DispatcherCommand::Reset { catalog, reply } => {
                let abandoned = self.state.in_flight_count();
                let dropped = self.state.queue().len();
                self.tasks.abort_all();
                for (_, k) in self.loading.drain() {
                    self.outputs.publish(&k, OutputEntry::done(None));
                }
                self.state.reset();
                self.catalog = catalog;
                log_info!(
                    "Dispatcher reset: dropped {} queued, abandoned {} in flight",
                    dropped,
                    abandoned
                );
                let _ = reply.send(());
            }
            DispatcherCommand::WaitIdle { reply } => {
                self.idle_waiters.push(reply);
            }
        }
    }

    fn admit_and_spawn(&mut self) {
        for admission in self.state.admit() {
            self.summary.admitted += 1;
            log_debug!("[{}] Admitted {}", admission.run_id, admission.request);

            if self.is_focused(&admission.request) {
                if let Some(k) = self.output_key(&admission.request) {
                    self.outputs.publish(&k, OutputEntry::loading());
                    self.loading.insert(admission.run_id.clone(), k);
                }
            }

            let envelope = PollEnvelope::new(admission.request, admission.run_id.clone(), self.poll);
            let guard = SettleGuard::new(admission.run_id, self.done_tx.clone());
            let backend = Arc::clone(&self.backend);

            self.tasks.spawn(async move {
                let outcome = executor::execute_run(&envelope, backend.as_ref()).await;
                guard.finish(outcome);
            });
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        let Some(request) = self.state.settle(&completion.run_id) else {
            log_debug!(
                "[{}] Ignoring completion for unknown or settled run",
                completion.run_id
            );
            return;
        };
        self.loading.remove(&completion.run_id);

        let focused = self.is_focused(&request);
        let output_key = self.output_key(&request);

        match completion.outcome {
            Ok(output) => {
                self.summary.succeeded += 1;
                if let Some(k) = output_key {
                    let entry = OutputEntry::done(Some(output));
                    if focused {
                        self.outputs.publish(&k, entry);
                    } else {
                        self.outputs.stash(&k, entry);
                    }
                }
            }
            Err(e) => {
                if e.is_timeout() {
                    self.summary.timed_out += 1;
                } else {
                    self.summary.failed += 1;
                }
                self.alerts.alert(&alert_message(&request, &e));
                if let (true, Some(k)) = (focused, output_key) {
                    self.outputs.publish(&k, OutputEntry::done(None));
                }
            }
        }
    }

    fn notify_idle_waiters(&mut self) {
        if self.idle_waiters.is_empty() || !self.state.is_idle() {
            return;
        }
        for waiter in self.idle_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

// --- Actor loop ---

async fn run_dispatcher<B: JobBackend + 'static>(
    mut rx: mpsc::Receiver<DispatcherCommand>,
    mut done_rx: mpsc::UnboundedReceiver<Completion>,
    mut actor: DispatcherActor<B>,
) -> DispatchSummary {
    loop {
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(cmd) => actor.handle_command(cmd),
                None => break,
            },
            Some(completion) = done_rx.recv() => {
                actor.handle_completion(completion);
            }
            Some(joined) = actor.tasks.join_next(), if !actor.tasks.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        log_warn!("Run task panicked: {}", e);
                    }
                }
            }
        }

        actor.admit_and_spawn();
        actor.notify_idle_waiters();
    }

    // Shutdown: every handle is gone. Let in-flight runs settle, admit nothing new.
    let left_queued = actor.state.queue().len();
    if left_queued > 0 {
        log_warn!("Dispatcher stopping with {} run(s) still queued", left_queued);
    }
    while actor.state.in_flight_count() > 0 {
        match done_rx.recv().await {
            Some(completion) => actor.handle_completion(completion),
            None => break,
        }
    }
    while actor.tasks.join_next().await.is_some() {}

    actor.summary
}

// --- Spawn ---

pub fn spawn_dispatcher<B: JobBackend + 'static>(
    backend: Arc<B>,
    outputs: Arc<dyn OutputSink>,
    alerts: Arc<dyn AlertSink>,
    options: DispatcherOptions,
) -> (DispatcherHandle, tokio::task::JoinHandle<DispatchSummary>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (done_tx, done_rx) = mpsc::unbounded_channel();

    let actor = DispatcherActor {
        state: DispatchState::new(options.max_active),
        catalog: options.catalog,
        focused_document: options.focused_document,
        poll: options.poll,
        key_flags: options.key_flags,
        backend,
        outputs,
        alerts,
        tasks: JoinSet::new(),
        loading: HashMap::new(),
        done_tx,
        idle_waiters: Vec::new(),
        summary: DispatchSummary::default(),
    };

    let task_handle = tokio::spawn(run_dispatcher(rx, done_rx, actor));

    (DispatcherHandle { sender: tx }, task_handle)
}
