//! Per-stage worker loops and the end-of-stream sentinel protocol.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use flume::{Receiver, Sender};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, trace};

use crate::item::Item;
use crate::runtime::batch::InlineChain;
use crate::runtime::{Envelope, WorkUnit};
use crate::Error;

/// Shared arrival gate for the workers of one stage. Exactly one sentinel
/// must cross each stage boundary: every worker arrives at the gate when it
/// exits, and only the last arrival forwards the sentinel downstream.
pub(crate) struct SentinelGate {
    workers: usize,
    exited: AtomicUsize,
}

impl SentinelGate {
    pub(crate) fn new(workers: usize) -> Self {
        SentinelGate {
            workers,
            exited: AtomicUsize::new(0),
        }
    }

    /// Record this worker's exit; true for the last worker of the stage.
    pub(crate) fn arrive(&self) -> bool {
        self.exited.fetch_add(1, Ordering::AcqRel) + 1 == self.workers
    }
}

/// Execution context of one worker: the stage it runs (as the head of its
/// inline chain), the queues it is wired to, and the shared exit gate.
pub(crate) struct StageWorker {
    pub(crate) name: String,
    pub(crate) unit: WorkUnit,
    pub(crate) chain: InlineChain,
    pub(crate) input: Receiver<Envelope>,
    pub(crate) loopback: Sender<Envelope>,
    pub(crate) output: Sender<Envelope>,
    pub(crate) gate: Arc<SentinelGate>,
}

enum Received {
    Env(Envelope),
    Expired,
    Disconnected,
}

/// Drive one worker from start hook to exit. Returns an error only on fatal
/// conditions: a start hook failure, a closed downstream queue, or a critical
/// stage error under the raise policy.
pub(crate) async fn run_worker(mut w: StageWorker) -> Result<(), Error> {
    trace!(stage = w.name, "worker started");
    if let Err(e) = w.unit.on_start().await {
        error!(stage = w.name, "worker failed to start: {}", e);
        if w.gate.arrive() {
            let _ = w.output.send_async(Envelope::Stop).await;
        }
        return Err(e);
    }

    let outcome = worker_loop(&mut w).await;

    if let Err(e) = w.unit.on_stop().await {
        error!(stage = w.name, "worker stop hook failed: {}", e);
    }

    let last = w.gate.arrive();
    match outcome {
        Ok(saw_sentinel) => {
            if last {
                w.output
                    .send_async(Envelope::Stop)
                    .await
                    .map_err(|_| closed_queue(&w.name))?;
            } else if saw_sentinel {
                // wake a peer still blocked on the input queue
                w.loopback
                    .send_async(Envelope::Stop)
                    .await
                    .map_err(|_| closed_queue(&w.name))?;
            }
            debug!(stage = w.name, "worker exited");
            Ok(())
        }
        Err(e) => {
            // best effort: let downstream drain even though this worker died
            if last {
                let _ = w.output.send_async(Envelope::Stop).await;
            }
            Err(e)
        }
    }
}

/// Receive loop. `Ok(true)` means the sentinel was observed, `Ok(false)` that
/// the input queue disconnected.
async fn worker_loop(w: &mut StageWorker) -> Result<bool, Error> {
    loop {
        let received = match w.chain.next_deadline() {
            None => match w.input.recv_async().await {
                Ok(env) => Received::Env(env),
                Err(_) => Received::Disconnected,
            },
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    Received::Expired
                } else {
                    match timeout(remaining, w.input.recv_async()).await {
                        Ok(Ok(env)) => Received::Env(env),
                        Ok(Err(_)) => Received::Disconnected,
                        Err(_) => Received::Expired,
                    }
                }
            }
        };

        match received {
            Received::Env(Envelope::Payload(item)) => {
                trace!(stage = w.name, item = item.id(), "received item");
                let mut ready = Vec::new();
                w.chain.push(item, &mut ready).await?;
                forward(&w.output, &w.name, ready).await?;
            }
            Received::Expired => {
                let mut ready = Vec::new();
                w.chain.poll_expired(&mut ready).await?;
                forward(&w.output, &w.name, ready).await?;
            }
            Received::Env(Envelope::Stop) => {
                let mut ready = Vec::new();
                w.chain.drain(&mut ready).await?;
                forward(&w.output, &w.name, ready).await?;
                return Ok(true);
            }
            Received::Disconnected => {
                // upstream died without a sentinel; drain what is buffered
                let mut ready = Vec::new();
                w.chain.drain(&mut ready).await?;
                let _ = forward(&w.output, &w.name, ready).await;
                return Ok(false);
            }
        }
    }
}

async fn forward(
    output: &Sender<Envelope>,
    stage: &str,
    items: Vec<Item>,
) -> Result<(), Error> {
    for item in items {
        output
            .send_async(Envelope::Payload(item))
            .await
            .map_err(|_| closed_queue(stage))?;
    }
    Ok(())
}

fn closed_queue(stage: &str) -> Error {
    Error::UnableToSendToChannel(format!("output queue of stage {stage} is closed"))
}
