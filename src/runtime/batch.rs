//! Stage invocation helpers and the inline stage chain with its size+timeout
//! batch accumulator.
use std::sync::Arc;

use tokio::time::{Duration, Instant};
use tracing::trace;

use crate::error::ErrorManager;
use crate::item::Item;
use crate::runtime::WorkUnit;
use crate::{BatchStage, Error, Stage};

/// Invoke a single-item stage on one item, recording the wall-clock timing
/// and funneling any failure through the error manager.
pub(crate) async fn run_single(
    stage: &dyn Stage,
    name: &str,
    errors: &ErrorManager,
    item: &mut Item,
) -> Result<(), Error> {
    let started = Instant::now();
    let result = stage.process(item).await;
    item.set_timing(name, started.elapsed());
    if let Err(e) = result {
        errors.handle(e, name, item)?;
    }
    Ok(())
}

/// Invoke a batch stage on a buffered batch. The whole-batch elapsed time is
/// written into every item; on failure the error record is attached to every
/// item of the batch. Surviving items are appended to `out` in order.
pub(crate) async fn run_batch(
    stage: &dyn BatchStage,
    name: &str,
    errors: &ErrorManager,
    mut items: Vec<Item>,
    out: &mut Vec<Item>,
) -> Result<(), Error> {
    if items.is_empty() {
        return Ok(());
    }
    trace!(stage = name, size = items.len(), "processing batch");
    let started = Instant::now();
    let result = stage.process_batch(&mut items).await;
    let elapsed = started.elapsed();
    for item in items.iter_mut() {
        item.set_timing(name, elapsed);
    }
    match result {
        Ok(()) => out.append(&mut items),
        Err(e) => {
            for mut item in items {
                errors.handle(e.clone(), name, &mut item)?;
                out.push(item);
            }
        }
    }
    Ok(())
}

/// One stage executed inline by whichever worker owns the chain. Batch
/// stages keep a per-owner buffer; the stage object itself is shared.
enum InlineStage {
    Single {
        name: String,
        stage: Arc<dyn Stage>,
    },
    Batch {
        name: String,
        stage: Arc<dyn BatchStage>,
        size: usize,
        wait: Duration,
        buffer: Vec<Item>,
        first_at: Option<Instant>,
    },
}

impl InlineStage {
    fn new(name: String, unit: WorkUnit) -> Self {
        match unit {
            WorkUnit::Single(stage) => InlineStage::Single { name, stage },
            WorkUnit::Batch(stage) => {
                let size = stage.size().max(1);
                let wait = stage.timeout();
                InlineStage::Batch {
                    name,
                    stage,
                    size,
                    wait,
                    buffer: Vec::new(),
                    first_at: None,
                }
            }
        }
    }

    /// Feed one item through this stage, appending whatever is ready for the
    /// next stage to `out`. Items already carrying critical errors bypass the
    /// stage under the skip policy.
    async fn feed(
        &mut self,
        mut item: Item,
        errors: &ErrorManager,
        out: &mut Vec<Item>,
    ) -> Result<(), Error> {
        if errors.skips(&item) {
            out.push(item);
            return Ok(());
        }
        match self {
            InlineStage::Single { name, stage } => {
                run_single(stage.as_ref(), name, errors, &mut item).await?;
                out.push(item);
            }
            InlineStage::Batch {
                name,
                stage,
                size,
                wait,
                buffer,
                first_at,
            } => {
                if buffer.is_empty() {
                    *first_at = Some(Instant::now());
                }
                buffer.push(item);
                let expired = !wait.is_zero()
                    && first_at.map_or(false, |first| first.elapsed() >= *wait);
                if buffer.len() >= *size || expired {
                    let batch = std::mem::take(buffer);
                    *first_at = None;
                    run_batch(stage.as_ref(), name, errors, batch, out).await?;
                }
            }
        }
        Ok(())
    }

    /// Flush the buffer regardless of fill level (`all`), or only once its
    /// deadline has passed.
    async fn flush(
        &mut self,
        all: bool,
        errors: &ErrorManager,
        out: &mut Vec<Item>,
    ) -> Result<(), Error> {
        if let InlineStage::Batch {
            name,
            stage,
            wait,
            buffer,
            first_at,
            ..
        } = self
        {
            if buffer.is_empty() {
                return Ok(());
            }
            let expired =
                !wait.is_zero() && first_at.map_or(false, |first| first.elapsed() >= *wait);
            if all || expired {
                let batch = std::mem::take(buffer);
                *first_at = None;
                run_batch(stage.as_ref(), name, errors, batch, out).await?;
            }
        }
        Ok(())
    }

    fn deadline(&self) -> Option<Instant> {
        match self {
            InlineStage::Batch {
                wait,
                buffer,
                first_at: Some(first),
                ..
            } if !wait.is_zero() && !buffer.is_empty() => Some(*first + *wait),
            _ => None,
        }
    }
}

/// An ordered run of stages executed by a single owner: the worker of the
/// nearest pooled stage upstream, or the source driver for leading
/// zero-concurrency stages. Each owner holds its own chain instance, so batch
/// buffers are never shared.
pub(crate) struct InlineChain {
    stages: Vec<InlineStage>,
    errors: Arc<ErrorManager>,
}

impl InlineChain {
    pub(crate) fn new(slots: Vec<(String, WorkUnit)>, errors: Arc<ErrorManager>) -> Self {
        InlineChain {
            stages: slots
                .into_iter()
                .map(|(name, unit)| InlineStage::new(name, unit))
                .collect(),
            errors,
        }
    }

    /// Push one item through the whole chain, appending everything that comes
    /// out of the far end to `out`. A batch stage along the way may retain
    /// the item (and release older ones).
    pub(crate) async fn push(&mut self, item: Item, out: &mut Vec<Item>) -> Result<(), Error> {
        let InlineChain { stages, errors } = self;
        let mut current = vec![item];
        for stage in stages.iter_mut() {
            let mut next = Vec::new();
            for item in current.drain(..) {
                stage.feed(item, errors, &mut next).await?;
            }
            current = next;
        }
        out.append(&mut current);
        Ok(())
    }

    /// Flush every buffered batch, cascading results through the remaining
    /// stages. Called when the end of the stream reaches the chain's owner.
    pub(crate) async fn drain(&mut self, out: &mut Vec<Item>) -> Result<(), Error> {
        self.sweep(true, out).await
    }

    /// Flush only the buffers whose deadline has passed.
    pub(crate) async fn poll_expired(&mut self, out: &mut Vec<Item>) -> Result<(), Error> {
        self.sweep(false, out).await
    }

    async fn sweep(&mut self, all: bool, out: &mut Vec<Item>) -> Result<(), Error> {
        let InlineChain { stages, errors } = self;
        let mut current: Vec<Item> = Vec::new();
        for stage in stages.iter_mut() {
            let mut next = Vec::new();
            for item in current.drain(..) {
                stage.feed(item, errors, &mut next).await?;
            }
            stage.flush(all, errors, &mut next).await?;
            current = next;
        }
        out.append(&mut current);
        Ok(())
    }

    /// Earliest batch flush deadline across the chain, if any buffer is
    /// holding items under a non-zero timeout.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.stages.iter().filter_map(InlineStage::deadline).min()
    }

    /// True when the chain contains a batch stage with a flush deadline, in
    /// which case an idle chain needs periodic expiry polling.
    pub(crate) fn has_timed_batch(&self) -> bool {
        self.stages.iter().any(|stage| {
            matches!(stage, InlineStage::Batch { wait, .. } if !wait.is_zero())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::StageError;

    struct Upper;

    #[async_trait]
    impl Stage for Upper {
        async fn process(&self, item: &mut Item) -> Result<(), StageError> {
            let text = item.payload["text"].as_str().unwrap_or_default().to_uppercase();
            let _ = item.payload.insert("text".into(), text.into());
            Ok(())
        }
    }

    struct Tag {
        size: usize,
        wait: Duration,
    }

    #[async_trait]
    impl BatchStage for Tag {
        fn size(&self) -> usize {
            self.size
        }

        fn timeout(&self) -> Duration {
            self.wait
        }

        async fn process_batch(&self, items: &mut [Item]) -> Result<(), StageError> {
            let total = items.len();
            for item in items.iter_mut() {
                let _ = item.payload.insert("batched_with".into(), total.into());
            }
            Ok(())
        }
    }

    fn text_item(text: &str) -> Item {
        let mut item = Item::new();
        let _ = item.payload.insert("text".into(), text.into());
        item
    }

    fn chain(slots: Vec<(String, WorkUnit)>) -> InlineChain {
        InlineChain::new(slots, Arc::new(ErrorManager::new()))
    }

    #[tokio::test]
    async fn test_batch_flushes_on_size() {
        let mut chain = chain(vec![(
            "tag".into(),
            WorkUnit::Batch(Arc::new(Tag {
                size: 2,
                wait: Duration::ZERO,
            })),
        )]);
        let mut out = Vec::new();
        chain.push(text_item("a"), &mut out).await.expect("push");
        assert!(out.is_empty());
        chain.push(text_item("b"), &mut out).await.expect("push");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].payload["batched_with"], 2);
        assert!(out[0].timing("tag").is_some());
    }

    #[tokio::test]
    async fn test_drain_flushes_partial_batches_in_order() {
        let mut chain = chain(vec![
            (
                "tag".into(),
                WorkUnit::Batch(Arc::new(Tag {
                    size: 10,
                    wait: Duration::ZERO,
                })),
            ),
            ("upper".into(), WorkUnit::Single(Arc::new(Upper))),
        ]);
        let mut out = Vec::new();
        chain.push(text_item("a"), &mut out).await.expect("push");
        chain.push(text_item("b"), &mut out).await.expect("push");
        assert!(out.is_empty());
        chain.drain(&mut out).await.expect("drain");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].payload["text"], "A");
        assert_eq!(out[1].payload["text"], "B");
    }

    #[tokio::test]
    async fn test_expired_buffer_flushes_on_poll() {
        let mut chain = chain(vec![(
            "tag".into(),
            WorkUnit::Batch(Arc::new(Tag {
                size: 10,
                wait: Duration::from_millis(5),
            })),
        )]);
        let mut out = Vec::new();
        chain.push(text_item("a"), &mut out).await.expect("push");
        assert!(chain.next_deadline().is_some());
        chain.poll_expired(&mut out).await.expect("poll");
        assert!(out.is_empty());
        tokio::time::sleep(Duration::from_millis(10)).await;
        chain.poll_expired(&mut out).await.expect("poll");
        assert_eq!(out.len(), 1);
        assert!(chain.next_deadline().is_none());
    }

    #[tokio::test]
    async fn test_items_with_critical_errors_bypass_stages() {
        let mut chain = chain(vec![("upper".into(), WorkUnit::Single(Arc::new(Upper)))]);
        let mut item = text_item("quiet");
        item.add_critical_error("before", "boom");
        let mut out = Vec::new();
        chain.push(item, &mut out).await.expect("push");
        assert_eq!(out[0].payload["text"], "quiet");
        assert!(out[0].timing("upper").is_none());
    }
}
