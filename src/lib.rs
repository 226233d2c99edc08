//! Fast and flexible multi-stage data processing pipelines written in Rust
//!
//! Provides a library for composing an ordered list of named stages plus a
//! source into a concurrent processing pipeline. Each stage runs at a
//! configurable concurrency level, either cooperatively on the shared async
//! runtime or on dedicated worker threads, and optionally in batch mode with
//! size and timeout flush triggers. The pipeline routes items through bounded
//! queues with backpressure, records per-stage timings, and classifies and
//! propagates errors according to a configurable policy.
//!
//! ```
//! use flowline::{Item, Pipeline, Source, Stage, StageConfig, StageError};
//!
//! struct Counter(u64);
//!
//! #[async_trait::async_trait]
//! impl Source for Counter {
//!     async fn pop(&mut self) -> Result<Option<Item>, flowline::Error> {
//!         if self.0 == 0 {
//!             return Ok(None);
//!         }
//!         self.0 -= 1;
//!         let mut item = Item::new();
//!         item.payload.insert("n".into(), self.0.into());
//!         Ok(Some(item))
//!     }
//! }
//!
//! struct Double;
//!
//! #[async_trait::async_trait]
//! impl Stage for Double {
//!     async fn process(&self, item: &mut Item) -> Result<(), StageError> {
//!         let n = item.payload["n"].as_u64().ok_or_else(|| StageError::soft("not a number"))?;
//!         item.payload.insert("n".into(), (n * 2).into());
//!         Ok(())
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let pipeline = Pipeline::builder()
//!     .set_source(Counter(3))
//!     .append_stage("double", Double, StageConfig::new().concurrency(1))
//!     .build()
//!     .await
//!     .unwrap();
//! let mut items = pipeline.run().await.unwrap();
//! while let Some(item) = items.next().await {
//!     let item = item.unwrap();
//!     assert!(item.timing("double").is_some());
//! }
//! assert_eq!(pipeline.count(), 3);
//! # })
//! ```
use async_trait::async_trait;
use thiserror::Error as ThisError;
use tokio::time::Duration;

pub mod error;
pub mod helpers;
pub mod item;
mod runtime;

pub use error::{ErrorManager, ErrorRecord, Severity};
pub use item::Item;
pub use runtime::{Pipeline, PipelineBuilder, ProcessedItems, StageConfig};

/// Source module trait producing the items that enter the pipeline.
#[async_trait]
pub trait Source: Send {
    /// Read the next item, or `None` once the source is exhausted. Exhaustion
    /// triggers a graceful shutdown of the whole pipeline.
    async fn pop(&mut self) -> Result<Option<Item>, Error>;
}

/// A single-item processing stage.
///
/// Stages are shared between all workers of their pipeline slot, so any state
/// kept across items must be deliberate (interior mutability behind `&self`).
#[async_trait]
pub trait Stage: Send + Sync {
    /// Called once per worker after it has been spawned, inside the worker's
    /// execution context. Resources that must live with the worker (clients,
    /// file handles) belong here rather than in the constructor.
    async fn on_start(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Called once per worker before it exits.
    async fn on_stop(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Process one item in place. Returning an error plays the role of a
    /// raised exception: [`StageError::Soft`] attaches an error record and the
    /// item continues downstream, anything else is a critical error governed
    /// by the [`ErrorManager`] policy.
    async fn process(&self, item: &mut Item) -> Result<(), StageError>;
}

/// A stage invoked with multiple items at once.
///
/// The runtime buffers incoming items and calls [`BatchStage::process_batch`]
/// when the buffer reaches [`BatchStage::size`], when
/// [`BatchStage::timeout`] has elapsed since the first buffered item arrived,
/// or when the end of the stream is observed, whichever comes first.
#[async_trait]
pub trait BatchStage: Send + Sync {
    /// Preferred number of items per batch.
    fn size(&self) -> usize {
        500
    }

    /// Maximum time to hold a non-full batch, measured from the arrival of
    /// its first item. A zero duration disables the deadline entirely: the
    /// batch flushes only on size or at the end of the stream.
    fn timeout(&self) -> Duration {
        Duration::from_secs(10)
    }

    /// Called once per worker after it has been spawned. See
    /// [`Stage::on_start`].
    async fn on_start(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Called once per worker before it exits.
    async fn on_stop(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Process a buffered batch in place. The slice is in arrival order and
    /// must keep its length and order; results are mapped back to their
    /// positions by index.
    async fn process_batch(&self, items: &mut [Item]) -> Result<(), StageError>;
}

/// Failure returned by a stage call, classified by severity.
///
/// The two classes drive the [`ErrorManager`] policy: soft errors are
/// expected, data-dependent failures that never interrupt processing, while
/// critical errors are unexpected faults that may skip downstream stages or
/// terminate the run depending on configuration.
#[derive(Clone, Debug, ThisError)]
pub enum StageError {
    /// Expected, data-dependent failure. The item continues down the
    /// pipeline carrying the error record.
    #[error("{0}")]
    Soft(String),

    /// Unexpected fault. Handling is governed by the error manager policy.
    #[error("{0}")]
    Critical(String),
}

impl StageError {
    /// Build a soft error from a message.
    pub fn soft(message: impl Into<String>) -> Self {
        StageError::Soft(message.into())
    }

    /// Build a critical error from any displayable fault.
    pub fn critical(error: impl std::fmt::Display) -> Self {
        StageError::Critical(error.to_string())
    }
}

/// Enum to capture errors occurred through the pipeline.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The pipeline was assembled or used in an unsupported way.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A stage name was appended more than once to the same pipeline.
    #[error("Duplicate stage name: {0}")]
    DuplicateStageName(String),

    /// The source is exhausted and every delivered item has been consumed.
    /// This is the graceful end of a run, not a failure.
    #[error("End of input reached")]
    EndOfInput,

    /// Failure to send to an internal queue transporting items between stages.
    #[error("Pipeline processing error: {0}")]
    UnableToSendToChannel(String),

    /// Failure to receive from an internal queue.
    #[error("Channel receive error")]
    RecvChannelError(
        #[from]
        #[source]
        flume::RecvError,
    ),

    /// A stage failed with a critical error while the error manager is
    /// configured to surface them to the consumer.
    #[error("Critical error in stage {stage}: {message}")]
    CriticalStageFailure {
        /// Name of the stage that failed.
        stage: String,
        /// Rendered fault reported by the stage.
        message: String,
    },

    /// Error reported by the source while reading input.
    #[error("Source error: {0}")]
    SourceError(String),

    /// Error with the processing pipeline due to a failure of internal
    /// machinery rather than user stage code. Always fatal.
    #[error("Execution error: {0}")]
    ExecutionError(String),
}
