//! Keyset pagination cursor
//!
//! Pages are ordered by `(createdAt, id)` ascending. A worker keeps the key of
//! the last item it saw and asks for everything after it. An empty page means
//! the end of the data set: the cursor goes back to "absent" and the next read
//! starts over from the first page.

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Position after the last item of an observed page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cursor {
    /// `createdAt` exactly as the service returned it
    pub created_at: String,

    /// Tie-break id
    pub id: i64,
}

impl Cursor {
    pub fn new(created_at: impl Into<String>, id: i64) -> Self {
        Self {
            created_at: created_at.into(),
            id,
        }
    }

    /// Build a cursor from the last item of a page.
    ///
    /// Returns `None` for an empty page or when the last item has no usable
    /// `createdAt`/`id` pair.
    pub fn from_page(items: &[Value]) -> Option<Self> {
        let last = items.last()?;
        let created_at = last.get("createdAt")?.as_str()?;
        let id = match last.get("id")? {
            Value::Number(n) => n.as_i64()?,
            Value::String(s) => s.parse().ok()?,
            _ => return None,
        };
        Some(Self::new(created_at, id))
    }

    /// Query parameters identifying this position
    pub fn query_pairs(&self) -> [(&'static str, String); 2] {
        [
            ("createdAt", self.created_at.clone()),
            ("id", self.id.to_string()),
        ]
    }

    fn timestamp_micros(&self) -> Option<i64> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(&self.created_at) {
            return Some(dt.timestamp_micros());
        }
        NaiveDateTime::parse_from_str(&self.created_at, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|dt| dt.and_utc().timestamp_micros())
    }
}

/// Parsed timestamps order by instant and sort before unparsable ones, which
/// order by text.
impl Ord for Cursor {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_time = match (self.timestamp_micros(), other.timestamp_micros()) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.created_at.cmp(&other.created_at),
        };
        by_time.then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for Cursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Cursor {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Cursor {}

/// What a page did to the traversal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageStep {
    /// Cursor moved forward
    Advanced,
    /// Empty page: traversal wrapped to the beginning
    Wrapped,
    /// Page ended at or before the previous position
    Regressed,
    /// Last item carried no usable sort key; cursor reset
    Malformed,
}

/// Per-worker traversal state
#[derive(Debug, Clone, Default)]
pub struct Traversal {
    cursor: Option<Cursor>,
    pass: u64,
    pages_in_pass: u64,
}

impl Traversal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    /// Completed passes over the data set (number of resets)
    pub fn pass(&self) -> u64 {
        self.pass
    }

    pub fn pages_in_pass(&self) -> u64 {
        self.pages_in_pass
    }

    /// Apply a successfully parsed page
    pub fn advance(&mut self, items: &[Value]) -> PageStep {
        if items.is_empty() {
            self.reset();
            return PageStep::Wrapped;
        }
        let Some(next) = Cursor::from_page(items) else {
            self.reset();
            return PageStep::Malformed;
        };
        let step = match &self.cursor {
            Some(previous) if next <= *previous => PageStep::Regressed,
            _ => PageStep::Advanced,
        };
        self.cursor = Some(next);
        self.pages_in_pass += 1;
        step
    }

    /// Forget the position; next read starts from the first page
    pub fn reset(&mut self) {
        if self.cursor.is_some() || self.pages_in_pass > 0 {
            self.pass += 1;
        }
        self.cursor = None;
        self.pages_in_pass = 0;
    }
}
