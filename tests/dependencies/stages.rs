use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use flowline::{BatchStage, Error, Item, Stage, StageError};
use tokio::time::Duration;
use uuid::Uuid;

fn reverse_text(item: &mut Item, cycles: usize) -> Result<(), StageError> {
    let text = item.payload["text"]
        .as_str()
        .ok_or_else(|| StageError::soft("item has no text"))?
        .to_string();
    let mut reversed = text;
    for _ in 0..cycles.max(1) {
        reversed = reversed.chars().rev().collect();
    }
    item.payload.insert("text".into(), reversed.into());
    Ok(())
}

fn duplicate_text(item: &mut Item) -> Result<(), StageError> {
    let text = item.payload["text"]
        .as_str()
        .ok_or_else(|| StageError::soft("item has no text"))?
        .to_string();
    let key = format!("text_{}", Uuid::new_v4().simple());
    item.payload.insert(key, text.into());
    Ok(())
}

/// Reverses the `text` payload; odd cycle counts leave it reversed, and large
/// counts make the stage deliberately CPU-bound.
pub struct TextReverser {
    cycles: usize,
}

impl TextReverser {
    pub fn new(cycles: usize) -> Self {
        TextReverser { cycles }
    }
}

impl Default for TextReverser {
    fn default() -> Self {
        TextReverser::new(1)
    }
}

#[async_trait]
impl Stage for TextReverser {
    async fn process(&self, item: &mut Item) -> Result<(), StageError> {
        reverse_text(item, self.cycles)
    }
}

/// Copies the `text` payload under a fresh `text_*` key.
#[derive(Default)]
pub struct TextDuplicator;

#[async_trait]
impl Stage for TextDuplicator {
    async fn process(&self, item: &mut Item) -> Result<(), StageError> {
        duplicate_text(item)
    }
}

/// Sleeps for a fixed delay on every item.
pub struct TimeWaster {
    delay: Duration,
}

impl TimeWaster {
    pub fn new(delay: Duration) -> Self {
        TimeWaster { delay }
    }
}

#[async_trait]
impl Stage for TimeWaster {
    async fn process(&self, _item: &mut Item) -> Result<(), StageError> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

/// Fails every item with a soft error.
#[derive(Default)]
pub struct ErrorStage;

#[async_trait]
impl Stage for ErrorStage {
    async fn process(&self, _item: &mut Item) -> Result<(), StageError> {
        Err(StageError::soft("test pipeline error"))
    }
}

/// Fails every item with a critical error after a measurable delay.
#[derive(Default)]
pub struct ExceptionStage;

#[async_trait]
impl Stage for ExceptionStage {
    async fn process(&self, _item: &mut Item) -> Result<(), StageError> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Err(StageError::critical("test exception"))
    }
}

/// Marks items with a flag that is only set once `on_start` has run in the
/// worker, proving the hook ordering.
#[derive(Default)]
pub struct InitCheckedStage {
    started: AtomicBool,
    stopped: Arc<AtomicBool>,
}

impl InitCheckedStage {
    pub fn stop_probe(&self) -> Arc<AtomicBool> {
        self.stopped.clone()
    }
}

#[async_trait]
impl Stage for InitCheckedStage {
    async fn on_start(&self) -> Result<(), Error> {
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    async fn on_stop(&self) -> Result<(), Error> {
        self.stopped.store(true, Ordering::Release);
        Ok(())
    }

    async fn process(&self, item: &mut Item) -> Result<(), StageError> {
        if !self.started.load(Ordering::Acquire) {
            return Err(StageError::critical("worker processed before on_start"));
        }
        item.payload.insert("initialized".into(), true.into());
        Ok(())
    }
}

/// Batch flavor of [`TextReverser`].
pub struct BatchTextReverser {
    size: usize,
    timeout: Duration,
    cycles: usize,
}

impl BatchTextReverser {
    pub fn new(size: usize) -> Self {
        BatchTextReverser {
            size,
            ..BatchTextReverser::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cycles(mut self, cycles: usize) -> Self {
        self.cycles = cycles;
        self
    }
}

impl Default for BatchTextReverser {
    fn default() -> Self {
        BatchTextReverser {
            size: 100,
            timeout: Duration::from_millis(250),
            cycles: 1,
        }
    }
}

#[async_trait]
impl BatchStage for BatchTextReverser {
    fn size(&self) -> usize {
        self.size
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn process_batch(&self, items: &mut [Item]) -> Result<(), StageError> {
        for item in items.iter_mut() {
            reverse_text(item, self.cycles)?;
        }
        Ok(())
    }
}

/// Batch flavor of [`TextDuplicator`], optionally recording the largest batch
/// it was handed.
pub struct BatchTextDuplicator {
    size: usize,
    timeout: Duration,
    max_batch: Arc<AtomicUsize>,
}

impl BatchTextDuplicator {
    pub fn new(size: usize) -> Self {
        BatchTextDuplicator {
            size,
            ..BatchTextDuplicator::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Handle observing the largest batch handed to this stage.
    pub fn batch_probe(&self) -> Arc<AtomicUsize> {
        self.max_batch.clone()
    }
}

impl Default for BatchTextDuplicator {
    fn default() -> Self {
        BatchTextDuplicator {
            size: 100,
            timeout: Duration::from_millis(250),
            max_batch: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl BatchStage for BatchTextDuplicator {
    fn size(&self) -> usize {
        self.size
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn process_batch(&self, items: &mut [Item]) -> Result<(), StageError> {
        self.max_batch.fetch_max(items.len(), Ordering::AcqRel);
        for item in items.iter_mut() {
            duplicate_text(item)?;
        }
        Ok(())
    }
}

/// Batch stage failing every batch with a soft error.
pub struct BatchErrorStage {
    size: usize,
}

impl BatchErrorStage {
    pub fn new(size: usize) -> Self {
        BatchErrorStage { size }
    }
}

#[async_trait]
impl BatchStage for BatchErrorStage {
    fn size(&self) -> usize {
        self.size
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(250)
    }

    async fn process_batch(&self, _items: &mut [Item]) -> Result<(), StageError> {
        Err(StageError::soft("test pipeline error"))
    }
}

/// Batch stage failing every batch with a critical error.
pub struct BatchExceptionStage {
    size: usize,
}

impl BatchExceptionStage {
    pub fn new(size: usize) -> Self {
        BatchExceptionStage { size }
    }
}

#[async_trait]
impl BatchStage for BatchExceptionStage {
    fn size(&self) -> usize {
        self.size
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(250)
    }

    async fn process_batch(&self, _items: &mut [Item]) -> Result<(), StageError> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Err(StageError::critical("test exception"))
    }
}
