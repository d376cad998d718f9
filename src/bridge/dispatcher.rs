//! Per-destination serialized delivery.
//!
//! A [`Bridge`] subscribes to every inter-platform event kind and pushes each
//! event onto its own FIFO queue, drained by a single worker task. Handlers
//! for one destination therefore never overlap and always run in publish
//! order, even though each of them awaits network calls. A failing (or
//! panicking) handler is reported to the error sink and the worker moves on
//! to the next entry.
//!
//! The queue is unbounded because bus listeners run synchronously inside
//! `publish` and must neither block nor drop events.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::anyhow;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bridge::handler::{dispatch_event, BridgeHandler, ErrorSink};
use crate::bus::{EventBus, SubscriptionId};
use crate::common::{BusEvent, EventKind};

struct Job {
    event: Arc<BusEvent>,
    done: Option<oneshot::Sender<()>>,
}

/// Serialized dispatcher bound to one platform adapter.
pub struct Bridge {
    name: String,
    bus: Arc<EventBus>,
    subscription: SubscriptionId,
    queue_tx: mpsc::UnboundedSender<Job>,
    worker: JoinHandle<()>,
}

impl Bridge {
    /// Subscribe `handler` to the bus behind a dedicated worker.
    pub fn spawn<H>(
        name: impl Into<String>,
        bus: Arc<EventBus>,
        handler: H,
        sink: Arc<dyn ErrorSink>,
    ) -> Self
    where
        H: BridgeHandler,
    {
        let name = name.into();
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        let worker = tokio::spawn(run_worker(name.clone(), Arc::new(handler), queue_rx, sink));

        let listener_tx = queue_tx.clone();
        let subscription = bus.subscribe_many(&EventKind::INTER_PLATFORM, move |event| {
            let _ = listener_tx.send(Job {
                event: Arc::clone(event),
                done: None,
            });
        });

        info!(bridge = %name, "Bridge started");

        Self {
            name,
            bus,
            subscription,
            queue_tx,
            worker,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue an event directly, bypassing the bus.
    ///
    /// The returned receiver resolves once the handler has finished with it,
    /// successfully or not.
    pub fn submit(&self, event: Arc<BusEvent>) -> oneshot::Receiver<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let _ = self.queue_tx.send(Job {
            event,
            done: Some(done_tx),
        });
        done_rx
    }

    /// Stop listening, drain what is already queued, then stop the worker.
    pub async fn shutdown(self) {
        self.bus.unsubscribe(self.subscription);
        let Bridge {
            name,
            queue_tx,
            worker,
            ..
        } = self;
        drop(queue_tx);
        if let Err(e) = worker.await {
            debug!(bridge = %name, "Bridge worker join error: {}", e);
        }
        info!(bridge = %name, "Bridge stopped");
    }
}

async fn run_worker<H>(
    name: String,
    handler: Arc<H>,
    mut queue_rx: mpsc::UnboundedReceiver<Job>,
    sink: Arc<dyn ErrorSink>,
) where
    H: BridgeHandler,
{
    while let Some(job) = queue_rx.recv().await {
        let kind = job.event.kind();
        let outcome = AssertUnwindSafe(dispatch_event(handler.as_ref(), &job.event))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => sink.report(&name, kind, &e),
            Err(panic) => sink.report(
                &name,
                kind,
                &anyhow!("handler panicked: {}", panic_message(panic.as_ref())),
            ),
        }

        if let Some(done) = job.done {
            let _ = done.send(());
        }
    }
    debug!(bridge = %name, "Bridge queue closed");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
