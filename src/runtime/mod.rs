//! Pipeline coordinator: builder, queue topology, worker spawning, and the
//! streaming / asynchronous / inline execution modes.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use flume::{Receiver, Sender};
use futures::future::join_all;
use rustc_hash::FxHashSet;
use tokio::sync::{Mutex as TokioMutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use tracing::{debug, error, info, trace};

use crate::error::ErrorManager;
use crate::item::Item;
use crate::{BatchStage, Error, Source, Stage};

pub(crate) mod batch;
mod worker;

use batch::{run_batch, run_single, InlineChain};
use worker::{run_worker, SentinelGate, StageWorker};

/// What travels on the queues between stages: an item, or the end-of-stream
/// sentinel emitted exactly once per stage boundary.
#[derive(Debug)]
pub(crate) enum Envelope {
    Payload(Item),
    Stop,
}

/// A stage object of either flavor, shared between its workers.
#[derive(Clone)]
pub(crate) enum WorkUnit {
    Single(Arc<dyn Stage>),
    Batch(Arc<dyn BatchStage>),
}

impl WorkUnit {
    pub(crate) async fn on_start(&self) -> Result<(), Error> {
        match self {
            WorkUnit::Single(stage) => stage.on_start().await,
            WorkUnit::Batch(stage) => stage.on_start().await,
        }
    }

    pub(crate) async fn on_stop(&self) -> Result<(), Error> {
        match self {
            WorkUnit::Single(stage) => stage.on_stop().await,
            WorkUnit::Batch(stage) => stage.on_stop().await,
        }
    }
}

pub(crate) struct StageSlot {
    name: String,
    unit: WorkUnit,
    pooled: bool,
}

/// Per-stage execution settings.
///
/// The default is the inline fast path: no dedicated worker, the upstream
/// executor runs the stage directly.
///
/// ```
/// use flowline::StageConfig;
///
/// let inline = StageConfig::new();
/// let pooled = StageConfig::new().concurrency(2);
/// let isolated = StageConfig::new().concurrency(2).parallel();
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct StageConfig {
    concurrency: usize,
    parallel: bool,
}

impl StageConfig {
    /// Inline execution: concurrency 0, cooperative.
    pub fn new() -> Self {
        StageConfig::default()
    }

    /// Number of dedicated workers for the stage. Zero means the stage is
    /// executed inline by the upstream worker.
    pub fn concurrency(mut self, workers: usize) -> Self {
        self.concurrency = workers;
        self
    }

    /// Run the stage's workers isolated from the shared runtime, each on its
    /// own OS thread. Only meaningful with a concurrency of at least one.
    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }
}

enum StageInit {
    Ready(WorkUnit),
    Factory(Box<dyn FnOnce() -> WorkUnit + Send>),
}

struct StageEntry {
    name: String,
    config: StageConfig,
    init: StageInit,
}

/// Fluent builder assembling a [`Pipeline`].
///
/// Stages run in append order; names must be unique. [`PipelineBuilder::build`]
/// creates the queue fabric, spawns every worker, and resolves stages that
/// were appended as factories.
pub struct PipelineBuilder {
    max_queues_size: Option<usize>,
    max_init_workers: usize,
    source: Option<Box<dyn Source>>,
    errors: ErrorManager,
    entries: Vec<StageEntry>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        PipelineBuilder {
            max_queues_size: None,
            max_init_workers: num_cpus::get(),
            source: None,
            errors: ErrorManager::new(),
            entries: Vec::new(),
        }
    }
}

impl PipelineBuilder {
    /// Builder with default settings and the default error policy.
    pub fn new() -> Self {
        PipelineBuilder::default()
    }

    /// Capacity of every queue between stages, including the output queue.
    /// Zero selects unbounded queues. Defaults to `max_init_workers * 2`.
    pub fn max_queues_size(mut self, capacity: usize) -> Self {
        self.max_queues_size = Some(capacity);
        self
    }

    /// Number of concurrent stage constructions dispatched by
    /// [`PipelineBuilder::append_stage_concurrently`]. Defaults to the number
    /// of CPU cores.
    pub fn max_init_workers(mut self, workers: usize) -> Self {
        self.max_init_workers = workers;
        self
    }

    /// Set the source feeding the pipeline in streaming mode.
    pub fn set_source(mut self, source: impl Source + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Replace the default error handling policy.
    pub fn set_error_manager(mut self, errors: ErrorManager) -> Self {
        self.errors = errors;
        self
    }

    /// Append a single-item stage.
    pub fn append_stage(
        mut self,
        name: impl Into<String>,
        stage: impl Stage + 'static,
        config: StageConfig,
    ) -> Self {
        self.entries.push(StageEntry {
            name: name.into(),
            config,
            init: StageInit::Ready(WorkUnit::Single(Arc::new(stage))),
        });
        self
    }

    /// Append a batch stage.
    pub fn append_batch_stage(
        mut self,
        name: impl Into<String>,
        stage: impl BatchStage + 'static,
        config: StageConfig,
    ) -> Self {
        self.entries.push(StageEntry {
            name: name.into(),
            config,
            init: StageInit::Ready(WorkUnit::Batch(Arc::new(stage))),
        });
        self
    }

    /// Append a single-item stage constructed lazily on the init pool.
    /// [`PipelineBuilder::build`] awaits all pending constructions, running at
    /// most `max_init_workers` of them at once. Useful for stages with an
    /// expensive setup.
    pub fn append_stage_concurrently<S, F>(
        mut self,
        name: impl Into<String>,
        factory: F,
        config: StageConfig,
    ) -> Self
    where
        S: Stage + 'static,
        F: FnOnce() -> S + Send + 'static,
    {
        self.entries.push(StageEntry {
            name: name.into(),
            config,
            init: StageInit::Factory(Box::new(move || WorkUnit::Single(Arc::new(factory())))),
        });
        self
    }

    /// Append a batch stage constructed lazily on the init pool.
    pub fn append_batch_stage_concurrently<S, F>(
        mut self,
        name: impl Into<String>,
        factory: F,
        config: StageConfig,
    ) -> Self
    where
        S: BatchStage + 'static,
        F: FnOnce() -> S + Send + 'static,
    {
        self.entries.push(StageEntry {
            name: name.into(),
            config,
            init: StageInit::Factory(Box::new(move || WorkUnit::Batch(Arc::new(factory())))),
        });
        self
    }

    /// Build the pipeline: resolve pending stage constructions, create the
    /// queue fabric, and spawn every stage worker.
    pub async fn build(self) -> Result<Pipeline, Error> {
        let mut seen = FxHashSet::default();
        for entry in &self.entries {
            if !seen.insert(entry.name.clone()) {
                return Err(Error::DuplicateStageName(entry.name.clone()));
            }
        }

        let max_init = self.max_init_workers.max(1);
        let capacity = self.max_queues_size.unwrap_or(max_init * 2);
        let errors = Arc::new(self.errors);

        // resolve deferred constructions, at most max_init at a time
        let semaphore = Arc::new(Semaphore::new(max_init));
        let mut metas = Vec::with_capacity(self.entries.len());
        let mut pending = Vec::with_capacity(self.entries.len());
        for entry in self.entries {
            let StageEntry { name, config, init } = entry;
            metas.push((name, config));
            let semaphore = semaphore.clone();
            pending.push(async move {
                match init {
                    StageInit::Ready(unit) => Ok(unit),
                    StageInit::Factory(factory) => {
                        let _permit = semaphore.acquire_owned().await.ok();
                        tokio::task::spawn_blocking(factory).await.map_err(|e| {
                            Error::ExecutionError(format!("stage construction failed: {e}"))
                        })
                    }
                }
            });
        }
        let units = join_all(pending).await;

        let mut slots = Vec::with_capacity(metas.len());
        let mut configs = Vec::with_capacity(metas.len());
        for ((name, config), unit) in metas.into_iter().zip(units) {
            slots.push(StageSlot {
                name,
                unit: unit?,
                pooled: config.concurrency > 0,
            });
            configs.push(config);
        }

        // group the stage list into pooled links, each carrying the run of
        // inline stages that follows it; leading inline stages belong to the
        // source driver
        let mut head_slots: Vec<(String, WorkUnit)> = Vec::new();
        struct Link {
            name: String,
            unit: WorkUnit,
            config: StageConfig,
            tail: Vec<(String, WorkUnit)>,
        }
        let mut links: Vec<Link> = Vec::new();
        for (slot, config) in slots.iter().zip(&configs) {
            if config.concurrency == 0 {
                let inline = (slot.name.clone(), slot.unit.clone());
                match links.last_mut() {
                    Some(link) => link.tail.push(inline),
                    None => head_slots.push(inline),
                }
            } else {
                links.push(Link {
                    name: slot.name.clone(),
                    unit: slot.unit.clone(),
                    config: *config,
                    tail: Vec::new(),
                });
            }
        }
        let all_inline = links.is_empty();

        let channel = |capacity: usize| {
            if capacity == 0 {
                flume::unbounded()
            } else {
                flume::bounded(capacity)
            }
        };

        let (err_tx, err_rx) = flume::unbounded();
        let (output_tx, output_rx) = channel(capacity);

        // wire links back to front so each stage knows its downstream queue
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        let mut threads: Vec<std::thread::JoinHandle<()>> = Vec::new();
        let mut next_tx = output_tx;
        for link in links.into_iter().rev() {
            let (tx, rx) = channel(capacity);
            let gate = Arc::new(SentinelGate::new(link.config.concurrency));
            for n in 0..link.config.concurrency {
                let chain_slots: Vec<(String, WorkUnit)> =
                    std::iter::once((link.name.clone(), link.unit.clone()))
                        .chain(link.tail.iter().cloned())
                        .collect();
                let worker = StageWorker {
                    name: link.name.clone(),
                    unit: link.unit.clone(),
                    chain: InlineChain::new(chain_slots, errors.clone()),
                    input: rx.clone(),
                    loopback: tx.clone(),
                    output: next_tx.clone(),
                    gate: gate.clone(),
                };
                if link.config.parallel {
                    threads.push(spawn_isolated(
                        worker,
                        err_tx.clone(),
                        format!("flowline-{}-{n}", link.name),
                    )?);
                } else {
                    let err_tx = err_tx.clone();
                    tasks.push(tokio::spawn(async move {
                        if let Err(e) = run_worker(worker).await {
                            let _ = err_tx.send_async(e).await;
                        }
                    }));
                }
            }
            drop(rx);
            next_tx = tx;
        }
        let first_tx = next_tx;

        let head = InlineChain::new(head_slots, errors.clone());
        let has_timed_head = head.has_timed_batch();

        let core = Arc::new(Core {
            errors,
            slots,
            all_inline,
            first_tx,
            output_rx,
            err_tx,
            err_rx,
            head: TokioMutex::new(Some(head)),
            source: StdMutex::new(self.source),
            sequence: AtomicU64::new(0),
            count: AtomicU64::new(0),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            hooks_closed: AtomicBool::new(false),
            tasks: StdMutex::new(tasks),
            threads: StdMutex::new(threads),
        });

        // start hooks of inline stages run once, owned by the coordinator
        for slot in core.slots.iter().filter(|slot| !slot.pooled) {
            slot.unit.on_start().await?;
        }

        if has_timed_head {
            let flusher = tokio::spawn(head_flusher(core.clone()));
            lock(&core.tasks).push(flusher);
        }

        debug!(stages = core.slots.len(), capacity, "pipeline built");
        Ok(Pipeline { core })
    }
}

fn spawn_isolated(
    worker: StageWorker,
    err_tx: Sender<Error>,
    label: String,
) -> Result<std::thread::JoinHandle<()>, Error> {
    std::thread::Builder::new()
        .name(label)
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = err_tx.send(Error::ExecutionError(format!(
                        "unable to start isolated worker runtime: {e}"
                    )));
                    if worker.gate.arrive() {
                        let _ = worker.output.send(Envelope::Stop);
                    }
                    return;
                }
            };
            runtime.block_on(async move {
                if let Err(e) = run_worker(worker).await {
                    let _ = err_tx.send_async(e).await;
                }
            });
        })
        .map_err(|e| Error::ExecutionError(format!("unable to spawn isolated worker: {e}")))
}

struct Core {
    errors: Arc<ErrorManager>,
    slots: Vec<StageSlot>,
    all_inline: bool,
    first_tx: Sender<Envelope>,
    output_rx: Receiver<Envelope>,
    err_tx: Sender<Error>,
    err_rx: Receiver<Error>,
    head: TokioMutex<Option<InlineChain>>,
    source: StdMutex<Option<Box<dyn Source>>>,
    sequence: AtomicU64,
    count: AtomicU64,
    running: AtomicBool,
    stopped: AtomicBool,
    finished: AtomicBool,
    hooks_closed: AtomicBool,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    threads: StdMutex<Vec<std::thread::JoinHandle<()>>>,
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A built pipeline, ready to run from its source or to accept items
/// injected by the caller.
///
/// See the crate documentation for an end-to-end example.
pub struct Pipeline {
    core: Arc<Core>,
}

impl Pipeline {
    /// Start assembling a pipeline.
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Number of items delivered to the consumer so far.
    pub fn count(&self) -> usize {
        self.core.count.load(Ordering::Acquire) as usize
    }

    /// Run the pipeline from its source. The returned handle yields processed
    /// items until the source is exhausted and every in-flight item has been
    /// delivered; dropping through the end joins all workers.
    ///
    /// A pipeline runs from its source at most once.
    pub async fn run(&self) -> Result<ProcessedItems<'_>, Error> {
        let source = lock(&self.core.source)
            .take()
            .ok_or_else(|| Error::Validation("no source set".into()))?;
        if self.core.running.swap(true, Ordering::AcqRel) {
            return Err(Error::Validation("pipeline is already running".into()));
        }
        let core = self.core.clone();
        let driver = tokio::spawn(async move {
            if let Err(e) = source_driver(source, core.clone()).await {
                let _ = core.err_tx.send_async(e).await;
            }
        });
        lock(&self.core.tasks).push(driver);
        info!("pipeline started");
        Ok(ProcessedItems {
            pipeline: self,
            done: false,
        })
    }

    /// Process one item synchronously on the caller. Only valid when every
    /// stage runs inline (concurrency 0); batch stages see a singleton batch.
    pub async fn process(&self, mut item: Item) -> Result<Item, Error> {
        if !self.core.all_inline {
            return Err(Error::Validation(
                "process is only valid when every stage has concurrency 0".into(),
            ));
        }
        for slot in &self.core.slots {
            if self.core.errors.skips(&item) {
                continue;
            }
            match &slot.unit {
                WorkUnit::Single(stage) => {
                    run_single(stage.as_ref(), &slot.name, &self.core.errors, &mut item).await?;
                }
                WorkUnit::Batch(stage) => {
                    let mut out = Vec::with_capacity(1);
                    run_batch(
                        stage.as_ref(),
                        &slot.name,
                        &self.core.errors,
                        vec![item],
                        &mut out,
                    )
                    .await?;
                    item = out.pop().ok_or_else(|| {
                        Error::ExecutionError("batch stage returned no items".into())
                    })?;
                }
            }
        }
        Ok(item)
    }

    /// Inject one item into the pipeline without a source. Blocks while the
    /// first queue is full. Results are collected with
    /// [`Pipeline::get_item`].
    pub async fn process_async(&self, mut item: Item) -> Result<(), Error> {
        if self.core.running.load(Ordering::Acquire) {
            return Err(Error::Validation(
                "pipeline is running from a source".into(),
            ));
        }
        item.set_sequence(self.core.sequence.fetch_add(1, Ordering::AcqRel));
        let ready = {
            let mut guard = self.core.head.lock().await;
            match guard.as_mut() {
                Some(chain) => {
                    let mut out = Vec::new();
                    chain.push(item, &mut out).await?;
                    out
                }
                None => return Err(Error::Validation("pipeline is stopped".into())),
            }
        };
        self.send_all(ready).await
    }

    /// Receive the next processed item, blocking until one is available.
    /// Returns [`Error::EndOfInput`] once the pipeline has shut down and
    /// every delivered item has been consumed; a critical stage failure under
    /// the raise policy surfaces here.
    pub async fn get_item(&self) -> Result<Item, Error> {
        if self.core.finished.load(Ordering::Acquire) {
            return Err(Error::EndOfInput);
        }
        tokio::select! {
            biased;
            failure = self.core.err_rx.recv_async() => match failure {
                Ok(e) => {
                    self.core.abort();
                    Err(e)
                }
                Err(_) => Err(Error::ExecutionError("error channel closed".into())),
            },
            envelope = self.core.output_rx.recv_async() => match envelope {
                Ok(Envelope::Payload(item)) => {
                    let _ = self.core.count.fetch_add(1, Ordering::AcqRel);
                    trace!(item = item.id(), "item delivered");
                    Ok(item)
                }
                Ok(Envelope::Stop) | Err(_) => {
                    self.core.finished.store(true, Ordering::Release);
                    Err(Error::EndOfInput)
                }
            },
        }
    }

    /// Shut the pipeline down: flush any buffered inline batches, inject the
    /// end-of-stream sentinel, discard undelivered output, and join every
    /// worker. Calling `stop` a second time is a no-op.
    pub async fn stop(&self) -> Result<(), Error> {
        if self.core.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("stopping pipeline");
        let ready = {
            let mut guard = self.core.head.lock().await;
            match guard.take() {
                Some(mut chain) => {
                    let mut out = Vec::new();
                    chain.drain(&mut out).await?;
                    out
                }
                None => Vec::new(),
            }
        };
        self.send_all(ready).await?;
        let _ = self.core.first_tx.send_async(Envelope::Stop).await;

        // drain whatever the consumer did not pick up, until the sentinel
        // has crossed the whole pipeline
        while !self.core.finished.load(Ordering::Acquire) {
            match timeout(Duration::from_millis(50), self.core.output_rx.recv_async()).await {
                Ok(Ok(Envelope::Stop)) | Ok(Err(_)) => {
                    self.core.finished.store(true, Ordering::Release);
                }
                Ok(Ok(Envelope::Payload(_))) | Err(_) => {}
            }
        }
        self.finish().await?;
        info!("pipeline stopped");
        Ok(())
    }

    async fn send_all(&self, items: Vec<Item>) -> Result<(), Error> {
        for item in items {
            self.core
                .first_tx
                .send_async(Envelope::Payload(item))
                .await
                .map_err(|_| {
                    Error::UnableToSendToChannel("pipeline input queue is closed".into())
                })?;
        }
        Ok(())
    }

    /// Join every worker and run the stop hooks of inline stages.
    async fn finish(&self) -> Result<(), Error> {
        let tasks: Vec<JoinHandle<()>> = lock(&self.core.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    return Err(Error::ExecutionError(format!("worker task failed: {e}")));
                }
            }
        }
        let threads: Vec<std::thread::JoinHandle<()>> =
            lock(&self.core.threads).drain(..).collect();
        if !threads.is_empty() {
            tokio::task::spawn_blocking(move || {
                for handle in threads {
                    if handle.join().is_err() {
                        error!("isolated worker thread panicked");
                    }
                }
            })
            .await
            .map_err(|e| Error::ExecutionError(format!("worker thread join failed: {e}")))?;
        }
        if !self.core.hooks_closed.swap(true, Ordering::AcqRel) {
            for slot in self.core.slots.iter().filter(|slot| !slot.pooled) {
                if let Err(e) = slot.unit.on_stop().await {
                    error!(stage = slot.name, "stop hook failed: {}", e);
                }
            }
        }
        Ok(())
    }
}

impl Core {
    /// Best-effort teardown after a surfaced failure: stop the source driver,
    /// request shutdown, and keep the output queue draining so blocked
    /// workers can exit.
    fn abort(&self) {
        self.stopped.store(true, Ordering::Release);
        let _ = self.first_tx.try_send(Envelope::Stop);
        let output_rx = self.output_rx.clone();
        let drainer = tokio::spawn(async move {
            while let Ok(envelope) = output_rx.recv_async().await {
                if matches!(envelope, Envelope::Stop) {
                    break;
                }
            }
        });
        drop(drainer);
    }
}

/// Handle over a running pipeline yielding processed items, returned by
/// [`Pipeline::run`].
pub struct ProcessedItems<'a> {
    pipeline: &'a Pipeline,
    done: bool,
}

impl ProcessedItems<'_> {
    /// Next processed item, or `None` once the run has completed and all
    /// workers have been joined. A critical stage failure under the raise
    /// policy is yielded as an error and terminates the run.
    pub async fn next(&mut self) -> Option<Result<Item, Error>> {
        if self.done {
            return None;
        }
        match self.pipeline.get_item().await {
            Ok(item) => Some(Ok(item)),
            Err(Error::EndOfInput) => {
                self.done = true;
                match self.pipeline.finish().await {
                    Ok(()) => {
                        info!("pipeline finished");
                        None
                    }
                    Err(e) => Some(Err(e)),
                }
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Pull items from the source, pass them through the leading inline stages,
/// and feed the first queue; emits the one end-of-stream sentinel when the
/// source is exhausted or the pipeline is stopped.
async fn source_driver(mut source: Box<dyn Source>, core: Arc<Core>) -> Result<(), Error> {
    debug!("source driver started");
    loop {
        if core.stopped.load(Ordering::Acquire) {
            break;
        }
        match source.pop().await? {
            Some(mut item) => {
                item.set_sequence(core.sequence.fetch_add(1, Ordering::AcqRel));
                trace!(item = item.id(), "item pulled from source");
                let ready = {
                    let mut guard = core.head.lock().await;
                    match guard.as_mut() {
                        Some(chain) => {
                            let mut out = Vec::new();
                            chain.push(item, &mut out).await?;
                            out
                        }
                        None => break,
                    }
                };
                for item in ready {
                    core.first_tx
                        .send_async(Envelope::Payload(item))
                        .await
                        .map_err(|_| {
                            Error::UnableToSendToChannel("pipeline input queue is closed".into())
                        })?;
                }
            }
            None => break,
        }
    }

    let ready = {
        let mut guard = core.head.lock().await;
        match guard.take() {
            Some(mut chain) => {
                let mut out = Vec::new();
                chain.drain(&mut out).await?;
                out
            }
            // stop() already drained the chain and emitted the sentinel
            None => return Ok(()),
        }
    };
    for item in ready {
        core.first_tx
            .send_async(Envelope::Payload(item))
            .await
            .map_err(|_| Error::UnableToSendToChannel("pipeline input queue is closed".into()))?;
    }
    let _ = core.first_tx.send_async(Envelope::Stop).await;
    debug!("source exhausted");
    Ok(())
}

/// Periodically flush expired batch buffers in the head chain, so inline
/// batch stages honor their timeout even while the pipeline is idle.
async fn head_flusher(core: Arc<Core>) {
    let mut tick = interval(Duration::from_millis(20));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        let _ = tick.tick().await;
        let ready = {
            let mut guard = core.head.lock().await;
            match guard.as_mut() {
                Some(chain) => {
                    let mut out = Vec::new();
                    match chain.poll_expired(&mut out).await {
                        Ok(()) => out,
                        Err(e) => {
                            let _ = core.err_tx.send_async(e).await;
                            return;
                        }
                    }
                }
                None => return,
            }
        };
        for item in ready {
            if core
                .first_tx
                .send_async(Envelope::Payload(item))
                .await
                .is_err()
            {
                return;
            }
        }
    }
}
