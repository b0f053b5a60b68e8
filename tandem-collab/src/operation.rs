//! Text operations and the single-hunk diff that produces them.
//!
//! Wire format (JSON, flattened into the `operation` envelope):
//! ```text
//! { "type": "insert",  "position": 3, "content": "X",                 "baseRevision": 0 }
//! { "type": "delete",  "position": 4, "length": 1,                    "baseRevision": 5 }
//! { "type": "replace", "position": 0, "content": "ab", "oldLength": 2, "baseRevision": 9 }
//! ```
//!
//! Positions and lengths count `char`s, so an edit can never land inside a
//! UTF-8 sequence.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single contiguous edit against a text buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Edit {
    Insert {
        position: usize,
        content: String,
    },
    Delete {
        position: usize,
        length: usize,
    },
    #[serde(rename_all = "camelCase")]
    Replace {
        position: usize,
        content: String,
        old_length: usize,
    },
}

/// An edit tagged with the revision the author last observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextOperation {
    #[serde(flatten)]
    pub edit: Edit,
    pub base_revision: u64,
}

impl TextOperation {
    pub fn new(edit: Edit, base_revision: u64) -> Self {
        Self { edit, base_revision }
    }
}

/// Raised when an edit does not fit the text it is applied to.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error("position {position} is past the end of the text ({len} chars)")]
    PositionOutOfRange { position: usize, len: usize },
    #[error("range {position}..{end} is past the end of the text ({len} chars)")]
    RangeOutOfBounds { position: usize, end: usize, len: usize },
}

impl Edit {
    pub fn insert(position: usize, content: impl Into<String>) -> Self {
        Edit::Insert { position, content: content.into() }
    }

    pub fn delete(position: usize, length: usize) -> Self {
        Edit::Delete { position, length }
    }

    pub fn replace(position: usize, content: impl Into<String>, old_length: usize) -> Self {
        Edit::Replace { position, content: content.into(), old_length }
    }

    /// Wire name of the edit kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Edit::Insert { .. } => "insert",
            Edit::Delete { .. } => "delete",
            Edit::Replace { .. } => "replace",
        }
    }

    pub fn position(&self) -> usize {
        match self {
            Edit::Insert { position, .. }
            | Edit::Delete { position, .. }
            | Edit::Replace { position, .. } => *position,
        }
    }

    /// Number of chars removed by this edit.
    pub fn removed_len(&self) -> usize {
        match self {
            Edit::Insert { .. } => 0,
            Edit::Delete { length, .. } => *length,
            Edit::Replace { old_length, .. } => *old_length,
        }
    }

    /// Text inserted by this edit.
    pub fn inserted(&self) -> &str {
        match self {
            Edit::Insert { content, .. } | Edit::Replace { content, .. } => content,
            Edit::Delete { .. } => "",
        }
    }

    /// Apply strictly: out-of-range positions are an error.
    pub fn apply(&self, text: &str) -> Result<String, ApplyError> {
        let len = text.chars().count();
        let position = self.position();
        if position > len {
            return Err(ApplyError::PositionOutOfRange { position, len });
        }
        let end = position.saturating_add(self.removed_len());
        if end > len {
            return Err(ApplyError::RangeOutOfBounds { position, end, len });
        }
        Ok(splice(text, position, end, self.inserted()))
    }

    /// Pull position and removed length into `0..=len`.
    pub fn clamp_to(&self, len: usize) -> Edit {
        let position = self.position().min(len);
        let removed = self.removed_len().min(len - position);
        match self {
            Edit::Insert { content, .. } => Edit::Insert { position, content: content.clone() },
            Edit::Delete { .. } => Edit::Delete { position, length: removed },
            Edit::Replace { content, .. } => Edit::Replace {
                position,
                content: content.clone(),
                old_length: removed,
            },
        }
    }

    /// Clamp against `text`, then apply. Never fails.
    pub fn apply_clamped(&self, text: &str) -> String {
        let len = text.chars().count();
        let position = self.position().min(len);
        let end = position + self.removed_len().min(len - position);
        splice(text, position, end, self.inserted())
    }
}

/// Compute the single edit that turns `old` into `new`.
///
/// The changed region is bounded by the common prefix and the common suffix.
/// A pure growth becomes an insert and a pure shrink becomes a delete.
/// Everything else becomes one covering replace. The result is exact for any
/// pair of strings. Several separate changes collapse into one replace that
/// spans all of them.
pub fn diff(old: &str, new: &str) -> Option<Edit> {
    if old == new {
        return None;
    }

    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();

    let prefix = old_chars
        .iter()
        .zip(&new_chars)
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = old_chars[prefix..]
        .iter()
        .rev()
        .zip(new_chars[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let removed = old_chars.len() - prefix - suffix;
    let inserted: String = new_chars[prefix..new_chars.len() - suffix].iter().collect();

    let edit = if removed == 0 {
        Edit::Insert { position: prefix, content: inserted }
    } else if inserted.is_empty() {
        Edit::Delete { position: prefix, length: removed }
    } else {
        Edit::Replace { position: prefix, content: inserted, old_length: removed }
    };
    Some(edit)
}

fn splice(text: &str, start: usize, end: usize, inserted: &str) -> String {
    let start_byte = byte_offset(text, start);
    let end_byte = byte_offset(text, end);
    let mut out = String::with_capacity(text.len() - (end_byte - start_byte) + inserted.len());
    out.push_str(&text[..start_byte]);
    out.push_str(inserted);
    out.push_str(&text[end_byte..]);
    out
}

fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices().nth(chars).map_or(text.len(), |(i, _)| i)
}
