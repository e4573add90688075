use std::collections::{BTreeMap, BTreeSet};

use crate::types::{PromptStatus, RunState};

/// Which (document, profile) cells are in flight, per prompt.
///
/// A cell is present only while its request is queued or executing. Empty
/// per-prompt maps are removed so absence always means idle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunStatusTable {
    prompts: BTreeMap<String, PromptStatus>,
}

impl RunStatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge RUNNING markers into the table.
    ///
    /// Existing cells for the same prompt are kept; only the named cells are
    /// (re)set to `Running`.
    pub fn mark_running(&mut self, entries: BTreeMap<String, BTreeSet<String>>) {
        for (prompt_id, cells) in entries {
            if cells.is_empty() {
                continue;
            }
            let prompt = self.prompts.entry(prompt_id).or_default();
            for cell in cells {
                prompt.insert(cell, RunState::Running);
            }
        }
    }

    /// Remove exactly one cell. Returns false if the cell was not present.
    pub fn clear(&mut self, prompt_id: &str, status_key: &str) -> bool {
        let Some(prompt) = self.prompts.get_mut(prompt_id) else {
            return false;
        };
        let removed = prompt.remove(status_key).is_some();
        if prompt.is_empty() {
            self.prompts.remove(prompt_id);
        }
        removed
    }

    /// Owned copy of one prompt's cells; empty if the prompt has none running.
    pub fn snapshot(&self, prompt_id: &str) -> PromptStatus {
        self.prompts.get(prompt_id).cloned().unwrap_or_default()
    }

    pub fn is_running(&self, prompt_id: &str, status_key: &str) -> bool {
        self.prompts
            .get(prompt_id)
            .is_some_and(|p| p.get(status_key) == Some(&RunState::Running))
    }

    /// Total number of cells across all prompts.
    pub fn len(&self) -> usize {
        self.prompts.values().map(|p| p.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }

    pub fn reset(&mut self) {
        self.prompts.clear();
    }
}
