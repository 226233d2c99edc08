//! Error records and the per-pipeline error handling policy.
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::item::Item;
use crate::{Error, StageError};

/// Severity class of an [`ErrorRecord`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    /// Expected, data-dependent failure explicitly signalled by a stage.
    Soft,
    /// Unexpected fault escaping a stage call.
    Critical,
}

/// An error attached to an item, recording which stage produced it and when.
///
/// Records travel with their item, including across the boundary into
/// isolated workers, so the captured fault is kept in rendered form rather
/// than as a live error object.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorRecord {
    severity: Severity,
    message: String,
    exception: Option<String>,
    stage: String,
    timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub(crate) fn soft(stage: &str, message: impl Into<String>) -> Self {
        ErrorRecord {
            severity: Severity::Soft,
            message: message.into(),
            exception: None,
            stage: stage.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub(crate) fn critical(stage: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        ErrorRecord {
            severity: Severity::Critical,
            exception: Some(message.clone()),
            message,
            stage: stage.to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Severity class of this record.
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Name of the stage that produced the error.
    pub fn stage(&self) -> &str {
        &self.stage
    }

    /// Rendered form of the captured fault, `None` for plain soft errors.
    pub fn exception(&self) -> Option<&str> {
        self.exception.as_deref()
    }

    /// Moment the record was captured.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Per-pipeline policy for classifying and propagating stage errors.
///
/// The manager's [`ErrorManager::handle`] is the single choke-point through
/// which every stage failure passes: it logs, attaches the record to the
/// item, and decides whether the failure surfaces to the consumer. Two
/// orthogonal switches govern critical errors:
///
/// * `raise_on_critical_error` (default off): surface the first critical
///   error to the consumer, terminating the run.
/// * `skip_on_critical_error` (default on): bypass downstream stages for an
///   item carrying critical errors; the item still reaches the output queue.
///
/// ```
/// use flowline::ErrorManager;
///
/// let strict = ErrorManager::new().raise_on_critical_error();
/// let tolerant = ErrorManager::new().no_skip_on_critical_error();
/// ```
#[derive(Clone, Debug)]
pub struct ErrorManager {
    raise_on_critical: bool,
    skip_on_critical: bool,
}

impl Default for ErrorManager {
    fn default() -> Self {
        ErrorManager {
            raise_on_critical: false,
            skip_on_critical: true,
        }
    }
}

impl ErrorManager {
    /// Manager with the default policy: critical errors are attached and the
    /// affected item skips downstream stages.
    pub fn new() -> Self {
        ErrorManager::default()
    }

    /// Surface the first critical error to the consumer, terminating the run.
    pub fn raise_on_critical_error(mut self) -> Self {
        self.raise_on_critical = true;
        self
    }

    /// Keep processing an item through downstream stages even after it has
    /// collected a critical error.
    pub fn no_skip_on_critical_error(mut self) -> Self {
        self.skip_on_critical = false;
        self
    }

    pub(crate) fn skips(&self, item: &Item) -> bool {
        self.skip_on_critical && item.has_critical_errors()
    }

    /// Handle a stage failure: log it, attach the record to the item, and
    /// return an error only when the run must terminate per policy.
    pub fn handle(&self, error: StageError, stage: &str, item: &mut Item) -> Result<(), Error> {
        match error {
            StageError::Soft(message) => {
                error!(
                    item = item.id(),
                    "stage {} has generated an error: {}", stage, message
                );
                item.push_record(ErrorRecord::soft(stage, message));
                Ok(())
            }
            StageError::Critical(message) => {
                error!(
                    item = item.id(),
                    "stage {} has generated a critical error: {}", stage, message
                );
                item.push_record(ErrorRecord::critical(stage, &message));
                if self.raise_on_critical {
                    Err(Error::CriticalStageFailure {
                        stage: stage.to_string(),
                        message,
                    })
                } else {
                    Ok(())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StageError;

    #[test]
    fn test_soft_errors_attach_and_continue() {
        let manager = ErrorManager::new().raise_on_critical_error();
        let mut item = Item::new();
        let result = manager.handle(StageError::soft("test pipeline error"), "error", &mut item);
        assert!(result.is_ok());
        assert!(item.has_errors());
        assert!(!item.has_critical_errors());
        let record = item.soft_errors().next().expect("record attached");
        assert_eq!(record.to_string(), "test pipeline error");
        assert_eq!(record.severity(), Severity::Soft);
    }

    #[test]
    fn test_critical_errors_attach_by_default() {
        let manager = ErrorManager::new();
        let mut item = Item::new();
        let result = manager.handle(StageError::critical("test exception"), "error", &mut item);
        assert!(result.is_ok());
        assert!(item.has_critical_errors());
        let record = item.critical_errors().next().expect("record attached");
        assert_eq!(record.exception(), Some("test exception"));
        assert_eq!(record.stage(), "error");
    }

    #[test]
    fn test_critical_errors_raise_when_configured() {
        let manager = ErrorManager::new().raise_on_critical_error();
        let mut item = Item::new();
        let result = manager.handle(StageError::critical("test exception"), "error", &mut item);
        match result {
            Err(Error::CriticalStageFailure { stage, message }) => {
                assert_eq!(stage, "error");
                assert_eq!(message, "test exception");
            }
            other => panic!("expected critical failure, got {other:?}"),
        }
        // the record is attached even when the error is re-raised
        assert!(item.has_critical_errors());
    }

    #[test]
    fn test_skip_policy() {
        let mut item = Item::new();
        assert!(!ErrorManager::new().skips(&item));
        item.add_critical_error("error", "boom");
        assert!(ErrorManager::new().skips(&item));
        assert!(!ErrorManager::new().no_skip_on_critical_error().skips(&item));
    }
}
