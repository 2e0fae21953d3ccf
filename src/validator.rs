// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Input validation for counter creation and admin edits.
//!
//! Everything here runs before the store is touched:
//! - Mode must be `unique` or `unlimited`
//! - Values must be non-negative
//! - Labels are trimmed, non-empty and at most 80 characters
//! - Notes are at most 200 characters

use crate::models::{
    CountMode, CounterPatch, NewCounter, MAX_LABEL_CHARS, MAX_NOTE_CHARS,
};
use thiserror::Error;
use tracing::debug;

/// Validation error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid mode {0:?}: expected \"unique\" or \"unlimited\"")]
    InvalidMode(String),

    #[error("Counter value must not be negative, got {0}")]
    NegativeValue(i64),

    #[error("Label must not be empty")]
    EmptyLabel,

    #[error("Label exceeds {max} characters (got {actual})")]
    LabelTooLong { max: usize, actual: usize },

    #[error("Note exceeds {max} characters (got {actual})")]
    NoteTooLong { max: usize, actual: usize },

    #[error("Activity trend must span 7 or 30 days, got {0}")]
    InvalidTrendWindow(u32),
}

/// A creation request that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidCounter {
    pub label: String,
    pub start_value: u64,
    pub mode: CountMode,
    pub throttle_ms: Option<i64>,
    pub note: Option<String>,
}

/// A metadata patch that passed validation. `note: Some(None)` clears the note.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidPatch {
    pub label: Option<String>,
    pub value: Option<u64>,
    pub note: Option<Option<String>>,
}

impl ValidPatch {
    pub fn is_empty(&self) -> bool {
        self.label.is_none() && self.value.is_none() && self.note.is_none()
    }
}

/// Validate a counter creation request.
pub fn validate_new_counter(input: &NewCounter) -> Result<ValidCounter, ValidationError> {
    let mode: CountMode = input.mode.parse()?;
    let start_value = validate_value(input.start_value)?;
    let label = validate_label(&input.label)?;
    let note = match input.note.as_deref() {
        Some(note) => validate_note(note)?,
        None => None,
    };

    // A throttle only means something for unlimited counters
    let throttle_ms = match mode {
        CountMode::Unique => None,
        CountMode::Unlimited => input
            .throttle_override_secs
            .map(|secs| i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)),
    };

    debug!(%mode, start_value, "Counter input validated");

    Ok(ValidCounter {
        label,
        start_value,
        mode,
        throttle_ms,
        note,
    })
}

/// Validate an admin metadata patch.
pub fn validate_patch(patch: &CounterPatch) -> Result<ValidPatch, ValidationError> {
    Ok(ValidPatch {
        label: patch.label.as_deref().map(validate_label).transpose()?,
        value: patch.value.map(validate_value).transpose()?,
        note: patch.note.as_deref().map(validate_note).transpose()?,
    })
}

pub fn validate_value(value: i64) -> Result<u64, ValidationError> {
    u64::try_from(value).map_err(|_| ValidationError::NegativeValue(value))
}

pub fn validate_label(label: &str) -> Result<String, ValidationError> {
    let label = label.trim();
    if label.is_empty() {
        return Err(ValidationError::EmptyLabel);
    }

    let actual = label.chars().count();
    if actual > MAX_LABEL_CHARS {
        return Err(ValidationError::LabelTooLong {
            max: MAX_LABEL_CHARS,
            actual,
        });
    }

    Ok(label.to_string())
}

/// Validate a note. Blank notes normalize to `None`.
pub fn validate_note(note: &str) -> Result<Option<String>, ValidationError> {
    let note = note.trim();
    if note.is_empty() {
        return Ok(None);
    }

    let actual = note.chars().count();
    if actual > MAX_NOTE_CHARS {
        return Err(ValidationError::NoteTooLong {
            max: MAX_NOTE_CHARS,
            actual,
        });
    }

    Ok(Some(note.to_string()))
}
