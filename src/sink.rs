use std::collections::HashMap;
use std::sync::Mutex;

use crate::log_error;

/// One cell value as the UI renders it.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputEntry {
    pub is_loading: bool,
    pub output: Option<serde_json::Value>,
}

impl OutputEntry {
    pub fn loading() -> Self {
        Self {
            is_loading: true,
            output: None,
        }
    }

    pub fn done(output: Option<serde_json::Value>) -> Self {
        Self {
            is_loading: false,
            output,
        }
    }
}

/// Keyed sink for run outputs.
///
/// `publish` is for the focused document and signals a re-render; `stash`
/// keeps a result for later viewing without one.
pub trait OutputSink: Send + Sync {
    fn publish(&self, key: &str, entry: OutputEntry);
    fn stash(&self, key: &str, entry: OutputEntry);
}

/// Receives human-readable failure descriptions.
pub trait AlertSink: Send + Sync {
    fn alert(&self, message: &str);
}

#[derive(Debug, Default)]
struct OutputState {
    entries: HashMap<String, OutputEntry>,
    revision: u64,
}

/// In-memory output store.
///
/// Uses `std::sync::Mutex` because every operation is a short map update
/// with no await under the lock.
#[derive(Debug, Default)]
pub struct OutputStore {
    state: Mutex<OutputState>,
}

impl OutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<OutputEntry> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.entries.get(key).cloned())
    }

    /// Number of publishes so far. Changes only when the focused pane must redraw.
    pub fn revision(&self) -> u64 {
        self.state.lock().map(|state| state.revision).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|state| state.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries sorted by key.
    pub fn entries(&self) -> Vec<(String, OutputEntry)> {
        let mut entries: Vec<(String, OutputEntry)> = self
            .state
            .lock()
            .map(|state| {
                state
                    .entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

impl OutputSink for OutputStore {
    fn publish(&self, key: &str, entry: OutputEntry) {
        if let Ok(mut state) = self.state.lock() {
            state.entries.insert(key.to_string(), entry);
            state.revision += 1;
        }
    }

    fn stash(&self, key: &str, entry: OutputEntry) {
        if let Ok(mut state) = self.state.lock() {
            state.entries.insert(key.to_string(), entry);
        }
    }
}

/// Alert sink that logs each message and keeps it for inspection.
#[derive(Debug, Default)]
pub struct AlertLog {
    messages: Mutex<Vec<String>>,
}

impl AlertLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}

impl AlertSink for AlertLog {
    fn alert(&self, message: &str) {
        log_error!("{}", message);
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message.to_string());
        }
    }
}
