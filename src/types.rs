use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::KeyError;
use crate::key;

// --- Run requests ---

/// One unit of work: evaluate one prompt against one document with one profile.
///
/// Ids are validated on construction, so every `RunRequest` has a
/// collision-free request key and status key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunRequest {
    prompt_id: String,
    document_id: String,
    profile_id: String,
}

impl RunRequest {
    pub fn new(prompt_id: &str, document_id: &str, profile_id: &str) -> Result<Self, KeyError> {
        key::validate_id("prompt", prompt_id)?;
        key::validate_id("document", document_id)?;
        key::validate_id("profile", profile_id)?;
        Ok(Self {
            prompt_id: prompt_id.to_string(),
            document_id: document_id.to_string(),
            profile_id: profile_id.to_string(),
        })
    }

    /// Parse a `prompt__document__profile` key produced by [`RunRequest::key`].
    pub fn from_key(request_key: &str) -> Result<Self, KeyError> {
        let (prompt_id, document_id, profile_id) = key::decode_request_key(request_key)?;
        Self::new(&prompt_id, &document_id, &profile_id)
    }

    pub fn prompt_id(&self) -> &str {
        &self.prompt_id
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn profile_id(&self) -> &str {
        &self.profile_id
    }

    pub fn key(&self) -> String {
        key::request_key(&self.prompt_id, &self.document_id, &self.profile_id)
    }

    pub fn status_key(&self) -> String {
        key::status_key(&self.document_id, &self.profile_id)
    }
}

impl std::fmt::Display for RunRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "prompt {} / document {} / profile {}",
            self.prompt_id, self.document_id, self.profile_id
        )
    }
}

impl Serialize for RunRequest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.key())
    }
}

impl<'de> Deserialize<'de> for RunRequest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        RunRequest::from_key(&raw).map_err(serde::de::Error::custom)
    }
}

// --- Run state ---

/// State of one status cell as exposed to renderers.
///
/// The status table only ever stores `Running`: a settled cell is removed, so
/// absence means idle. `Completed` is part of the serialized value domain that
/// status consumers accept and is never written by the dispatcher.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Completed,
}

/// Per-prompt status map: status key -> state.
pub type PromptStatus = BTreeMap<String, RunState>;

// --- Run modes ---

/// The bulk-dispatch operations a caller can request.
///
/// Each variant carries exactly the ids it needs; "all" axes are resolved
/// against the dispatcher's [`Catalog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    OnePromptOneProfileOneDoc {
        prompt_id: String,
        profile_id: String,
        document_id: String,
    },
    OnePromptOneProfileAllDocs {
        prompt_id: String,
        profile_id: String,
    },
    OnePromptAllProfilesOneDoc {
        prompt_id: String,
        document_id: String,
    },
    OnePromptAllProfilesAllDocs {
        prompt_id: String,
    },
    AllPromptsOneProfileOneDoc {
        profile_id: String,
        document_id: String,
    },
    AllPromptsAllProfilesOneDoc {
        document_id: String,
    },
    AllPromptsAllProfilesAllDocs,
}

impl RunMode {
    pub fn name(&self) -> &'static str {
        match self {
            RunMode::OnePromptOneProfileOneDoc { .. } => "one-prompt-one-profile-one-doc",
            RunMode::OnePromptOneProfileAllDocs { .. } => "one-prompt-one-profile-all-docs",
            RunMode::OnePromptAllProfilesOneDoc { .. } => "one-prompt-all-profiles-one-doc",
            RunMode::OnePromptAllProfilesAllDocs { .. } => "one-prompt-all-profiles-all-docs",
            RunMode::AllPromptsOneProfileOneDoc { .. } => "all-prompts-one-profile-one-doc",
            RunMode::AllPromptsAllProfilesOneDoc { .. } => "all-prompts-all-profiles-one-doc",
            RunMode::AllPromptsAllProfilesAllDocs => "all-prompts-all-profiles-all-docs",
        }
    }
}

/// Known prompts, LLM profiles, and documents of the current project.
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Catalog {
    pub prompts: Vec<String>,
    pub profiles: Vec<String>,
    pub documents: Vec<String>,
}

// --- Backend wire types ---

/// Body sent to the job endpoint, both for the initial submission and for
/// every poll tick.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct JobSubmission {
    pub prompt_id: String,
    pub document_id: String,
    pub profile_id: String,
    pub run_id: String,
}

impl JobSubmission {
    pub fn new(request: &RunRequest, run_id: &str) -> Self {
        Self {
            prompt_id: request.prompt_id().to_string(),
            document_id: request.document_id().to_string(),
            profile_id: request.profile_id().to_string(),
            run_id: run_id.to_string(),
        }
    }
}

/// What the job endpoint answers with.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobResponse {
    Pending,
    Completed { output: serde_json::Value },
    Failed { error: String },
}

// --- Outcomes ---

/// Counters returned when the dispatcher shuts down.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchSummary {
    pub admitted: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub timed_out: u32,
}
