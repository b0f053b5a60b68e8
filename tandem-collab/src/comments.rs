//! Position-anchored comments.
//!
//! Comments are append-only and keep the `(line, column)` they were created
//! with. Later edits do not move them.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::{unix_millis, ClientId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub author_id: ClientId,
    pub content: String,
    pub line: u32,
    pub column: u32,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(default)]
    pub resolved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommentError {
    #[error("comment content must not be empty")]
    EmptyContent,
    #[error("comment {0} not found")]
    NotFound(String),
}

/// Comments of one session, in creation order.
#[derive(Debug, Clone, Default)]
pub struct CommentStore {
    comments: Vec<Comment>,
}

impl CommentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and append a comment anchored at `(line, column)`.
    pub fn add(
        &mut self,
        author_id: ClientId,
        content: &str,
        line: u32,
        column: u32,
    ) -> Result<Comment, CommentError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(CommentError::EmptyContent);
        }
        let comment = Comment {
            id: Uuid::new_v4().to_string(),
            author_id,
            content: content.to_string(),
            line,
            column,
            timestamp: unix_millis(),
            resolved: false,
        };
        self.comments.push(comment.clone());
        Ok(comment)
    }

    /// Mark a comment resolved. Resolving twice is not an error.
    pub fn resolve(&mut self, id: &str) -> Result<&Comment, CommentError> {
        let comment = self
            .comments
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| CommentError::NotFound(id.to_string()))?;
        comment.resolved = true;
        Ok(comment)
    }

    /// Append a comment created elsewhere. Returns `false` for a duplicate id.
    pub fn insert(&mut self, comment: Comment) -> bool {
        if self.comments.iter().any(|c| c.id == comment.id) {
            return false;
        }
        self.comments.push(comment);
        true
    }

    pub fn replace_all(&mut self, comments: Vec<Comment>) {
        self.comments = comments;
    }

    pub fn get(&self, id: &str) -> Option<&Comment> {
        self.comments.iter().find(|c| c.id == id)
    }

    pub fn all(&self) -> &[Comment] {
        &self.comments
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &Comment> {
        self.comments.iter().filter(|c| !c.resolved)
    }

    pub fn len(&self) -> usize {
        self.comments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comments.is_empty()
    }
}
