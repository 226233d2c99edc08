//! The unit of work flowing through a pipeline.
use std::collections::HashMap;
use std::fmt;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Duration;
use uuid::Uuid;

use crate::error::{ErrorRecord, Severity};

/// Item is the uniform unit of data transiting a pipeline. It carries an
/// opaque unique id, an open payload written by stages, per-stage wall-clock
/// timings, and the error records attached along the way.
///
/// Items are deep-copyable through [`Clone`] and serializable, so they can
/// cross the boundary into isolated stage workers.
///
/// ```
/// # use flowline::Item;
/// let mut item = Item::new();
/// item.payload.insert("text".into(), "Hello World".into());
/// assert!(!item.id().is_empty());
/// assert!(!item.has_errors());
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Item {
    id: String,
    /// Open mapping from string keys to arbitrary values; stages read and
    /// write it freely.
    pub payload: HashMap<String, Value>,
    timings: FxHashMap<String, Duration>,
    soft_errors: Vec<ErrorRecord>,
    critical_errors: Vec<ErrorRecord>,
    meta: ItemMeta,
}

/// Internal routing metadata, never touched by stages.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct ItemMeta {
    sequence: Option<u64>,
}

impl Item {
    /// Create an empty item with a freshly generated unique id.
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    /// Create an empty item with a caller-supplied id, for sources that
    /// derive identity from their backing store (file names, document ids).
    pub fn with_id(id: impl Into<String>) -> Self {
        Item {
            id: id.into(),
            payload: HashMap::new(),
            timings: FxHashMap::default(),
            soft_errors: Vec::new(),
            critical_errors: Vec::new(),
            meta: ItemMeta::default(),
        }
    }

    /// Unique identifier, assigned at creation and never mutated afterwards.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Record the wall-clock duration of the last processing call a stage
    /// spent on this item.
    pub fn set_timing(&mut self, stage: &str, elapsed: Duration) {
        let _ = self.timings.insert(stage.to_string(), elapsed);
    }

    /// Elapsed time of the last processing call of the named stage, or `None`
    /// if the stage never processed this item.
    pub fn timing(&self, stage: &str) -> Option<Duration> {
        self.timings.get(stage).copied()
    }

    /// Attach a soft error record: an expected, data-dependent failure that
    /// does not interrupt processing.
    pub fn add_error(&mut self, stage: &str, message: impl Into<String>) {
        self.soft_errors.push(ErrorRecord::soft(stage, message));
    }

    /// Attach a critical error record capturing an unexpected fault.
    pub fn add_critical_error(&mut self, stage: &str, error: impl fmt::Display) {
        self.critical_errors
            .push(ErrorRecord::critical(stage, error.to_string()));
    }

    pub(crate) fn push_record(&mut self, record: ErrorRecord) {
        match record.severity() {
            Severity::Soft => self.soft_errors.push(record),
            Severity::Critical => self.critical_errors.push(record),
        }
    }

    /// True when at least one soft error has been attached.
    pub fn has_errors(&self) -> bool {
        !self.soft_errors.is_empty()
    }

    /// True when at least one critical error has been attached.
    pub fn has_critical_errors(&self) -> bool {
        !self.critical_errors.is_empty()
    }

    /// Soft error records in the order they were attached.
    pub fn soft_errors(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.soft_errors.iter()
    }

    /// Critical error records in the order they were attached.
    pub fn critical_errors(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.critical_errors.iter()
    }

    /// Monotonic sequence number stamped when the item entered the pipeline,
    /// useful for ordering diagnostics. `None` before entry.
    pub fn sequence(&self) -> Option<u64> {
        self.meta.sequence
    }

    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        self.meta.sequence = Some(sequence);
    }
}

impl Default for Item {
    fn default() -> Self {
        Item::new()
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "item {} with {} payload keys", self.id, self.payload.len())
    }
}
