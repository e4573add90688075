//! Composite keys addressing outputs, status cells, and queued requests.
//!
//! All keys join ids with [`DELIMITER`]. Ids are validated before joining so
//! that two distinct id tuples can never produce the same key.

use crate::error::KeyError;

pub const DELIMITER: &str = "__";

const SINGLE_PASS_MARKER: &str = "single-pass";

/// How the prompt was evaluated. Single-pass runs store their output under a
/// separate key so both variants can be shown side by side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PassMode {
    #[default]
    Standard,
    SinglePass,
}

/// Optional qualifiers appended to an output key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFlags {
    pub pass_mode: PassMode,
    pub variant: Option<String>,
}

/// The parts recovered from an output key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputKeyParts {
    pub prompt_id: String,
    pub document_id: String,
    pub profile_id: String,
    pub flags: KeyFlags,
}

/// Check that `id` can be joined with [`DELIMITER`] without ambiguity.
///
/// Rejects empty ids, ids containing `__`, and ids with a leading or trailing
/// underscore (`"a_" + "__" + "b"` and `"a" + "__" + "_b"` both give `"a___b"`).
pub fn validate_id(field: &'static str, id: &str) -> Result<(), KeyError> {
    if id.is_empty() {
        return Err(KeyError::EmptyId { field });
    }
    if id.contains(DELIMITER) {
        return Err(KeyError::ContainsDelimiter {
            field,
            id: id.to_string(),
        });
    }
    if id.starts_with('_') || id.ends_with('_') {
        return Err(KeyError::EdgeUnderscore {
            field,
            id: id.to_string(),
        });
    }
    Ok(())
}

/// Key of one (document, profile) cell inside a prompt's status map.
pub fn status_key(document_id: &str, profile_id: &str) -> String {
    format!("{}{}{}", document_id, DELIMITER, profile_id)
}

/// Key identifying a queued request: `prompt__document__profile`.
pub fn request_key(prompt_id: &str, document_id: &str, profile_id: &str) -> String {
    format!(
        "{}{d}{}{d}{}",
        prompt_id,
        document_id,
        profile_id,
        d = DELIMITER
    )
}

/// Build the output key for a run, validating every id first.
pub fn encode(
    prompt_id: &str,
    document_id: &str,
    profile_id: &str,
    flags: &KeyFlags,
) -> Result<String, KeyError> {
    validate_id("prompt", prompt_id)?;
    validate_id("document", document_id)?;
    validate_id("profile", profile_id)?;

    let mut key = request_key(prompt_id, document_id, profile_id);
    if flags.pass_mode == PassMode::SinglePass {
        key.push_str(DELIMITER);
        key.push_str(SINGLE_PASS_MARKER);
    }
    if let Some(variant) = &flags.variant {
        validate_id("variant", variant)?;
        if variant == SINGLE_PASS_MARKER {
            return Err(KeyError::Malformed(format!("{}{}{}", key, DELIMITER, variant)));
        }
        key.push_str(DELIMITER);
        key.push_str(variant);
    }
    Ok(key)
}

/// Split an output key back into its parts.
///
/// A fourth segment equal to `single-pass` is read as the pass mode; any
/// other trailing segment is the variant.
pub fn decode(key: &str) -> Result<OutputKeyParts, KeyError> {
    let malformed = || KeyError::Malformed(key.to_string());
    let parts: Vec<&str> = key.split(DELIMITER).collect();

    if parts.len() < 3 || parts.len() > 5 || parts.iter().any(|p| p.is_empty()) {
        return Err(malformed());
    }

    let mut flags = KeyFlags::default();
    match &parts[3..] {
        [] => {}
        [one] if *one == SINGLE_PASS_MARKER => flags.pass_mode = PassMode::SinglePass,
        [one] => flags.variant = Some(one.to_string()),
        [pass, variant] if *pass == SINGLE_PASS_MARKER => {
            flags.pass_mode = PassMode::SinglePass;
            flags.variant = Some(variant.to_string());
        }
        _ => return Err(malformed()),
    }

    Ok(OutputKeyParts {
        prompt_id: parts[0].to_string(),
        document_id: parts[1].to_string(),
        profile_id: parts[2].to_string(),
        flags,
    })
}

/// Split a `prompt__document__profile` request key.
pub fn decode_request_key(key: &str) -> Result<(String, String, String), KeyError> {
    let parts = decode(key)?;
    if parts.flags != KeyFlags::default() {
        return Err(KeyError::Malformed(key.to_string()));
    }
    Ok((parts.prompt_id, parts.document_id, parts.profile_id))
}
