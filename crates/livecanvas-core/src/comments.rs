//! Comment threads pinned to the canvas.
//!
//! Threads live in their own shared map, next to the shapes. They are
//! stacked by an integer `z_index`, independent of shape z-order.

use std::time::{SystemTime, UNIX_EPOCH};

use kurbo::Point;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crdt::CrdtError;

pub type ThreadId = Uuid;
pub type CommentId = Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CommentError {
    #[error("comment body is empty")]
    EmptyBody,
    #[error("no comment thread with id {0}")]
    NotFound(ThreadId),
    #[error(transparent)]
    Storage(#[from] CrdtError),
}

/// A single comment in a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub author: String,
    pub body: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
}

impl Comment {
    /// Create a comment. Bodies that are empty after trimming are rejected.
    pub fn new(author: impl Into<String>, body: impl Into<String>) -> Result<Self, CommentError> {
        let body = body.into();
        if body.trim().is_empty() {
            return Err(CommentError::EmptyBody);
        }
        Ok(Self {
            id: Uuid::new_v4(),
            author: author.into(),
            body,
            created_at: now_millis(),
        })
    }
}

/// A thread of comments anchored at a canvas position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentThread {
    pub id: ThreadId,
    pub x: f64,
    pub y: f64,
    pub z_index: i64,
    #[serde(default)]
    pub resolved: bool,
    pub comments: Vec<Comment>,
    pub created_at: u64,
}

impl CommentThread {
    /// Create an empty thread at `anchor`.
    pub fn new(anchor: Point, z_index: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            x: anchor.x,
            y: anchor.y,
            z_index,
            resolved: false,
            comments: Vec::new(),
            created_at: now_millis(),
        }
    }

    pub fn anchor(&self) -> Point {
        Point::new(self.x, self.y)
    }

    pub fn set_anchor(&mut self, anchor: Point) {
        self.x = anchor.x;
        self.y = anchor.y;
    }

    pub fn first_comment(&self) -> Option<&Comment> {
        self.comments.first()
    }
}

/// `z_index` for a thread placed above all of `threads`.
pub fn next_z_index<'a>(threads: impl IntoIterator<Item = &'a CommentThread>) -> i64 {
    threads
        .into_iter()
        .map(|t| t.z_index)
        .max()
        .map_or(0, |max| max + 1)
}

/// Sort threads bottom to top. Equal indices fall back to id.
pub fn sort_threads(threads: &mut [CommentThread]) {
    threads.sort_by(|a, b| a.z_index.cmp(&b.z_index).then_with(|| a.id.cmp(&b.id)));
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
