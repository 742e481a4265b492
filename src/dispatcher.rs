//! Generic request demultiplexer.
//!
//! The same scaffold runs twice in the consumer: once at the root, keyed by
//! group, and once inside every group consumer, keyed by topic. It spawns
//! workers lazily on the first request for a key, forwards requests with a
//! non-blocking hand-off, and reaps workers that have been idle for the
//! configured period.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::Message;
use crate::error::{Error, Result};

/// One in-flight consume call. Every request gets exactly one reply:
/// a message, a timeout, or a buffer overflow.
pub(crate) struct ConsumeRequest {
    pub received_at: Instant,
    pub group: String,
    pub topic: String,
    pub reply: oneshot::Sender<Result<Message>>,
}

/// A worker the dispatcher can route requests to. `start` spawns the
/// worker's task; the task reports on the `stopped` channel, under the
/// worker's key, once it has fully wound down after `initiate_stop`.
pub(crate) trait Tier: Send + 'static {
    fn start(&mut self, stopped: mpsc::UnboundedSender<String>);
    fn initiate_stop(&mut self);
    /// Non-blocking hand-off. The request comes back when the worker's
    /// queue is full.
    fn submit(&mut self, request: ConsumeRequest) -> std::result::Result<(), ConsumeRequest>;
}

/// How a particular dispatcher keys requests and builds workers.
pub(crate) trait TierFactory: Send + 'static {
    type Tier: Tier;

    fn dispatch_key<'a>(&self, request: &'a ConsumeRequest) -> &'a str;
    fn new_tier(&self, key: &str) -> Self::Tier;
}

pub(crate) struct Dispatcher<F: TierFactory> {
    requests_tx: mpsc::Sender<ConsumeRequest>,
    inner: Option<Inner<F>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

struct Inner<F: TierFactory> {
    scope: &'static str,
    factory: F,
    requests_rx: mpsc::Receiver<ConsumeRequest>,
    dispose_after: Duration,
}

impl<F: TierFactory> Dispatcher<F> {
    /// Set up the request queue without running anything yet, so requests
    /// can already be buffered before `start`.
    pub fn new(
        scope: &'static str,
        factory: F,
        queue_size: usize,
        dispose_after: Duration,
    ) -> Self {
        let (requests_tx, requests_rx) = mpsc::channel(queue_size);
        Self {
            requests_tx,
            inner: Some(Inner {
                scope,
                factory,
                requests_rx,
                dispose_after,
            }),
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn requests(&self) -> &mpsc::Sender<ConsumeRequest> {
        &self.requests_tx
    }

    pub fn start(&mut self) {
        if let Some(inner) = self.inner.take() {
            self.handle = Some(tokio::spawn(run(inner, self.cancel.clone())));
        }
    }

    /// Stop routing, ask every worker to stop and wait until the last one
    /// has signalled back.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

struct Slot<T: Tier> {
    tier: T,
    last_request: Instant,
    stopping: bool,
    /// Prepared replacement for a key whose worker is still winding down.
    /// It buffers requests but only starts once the predecessor is gone.
    successor: Option<T>,
}

async fn run<F: TierFactory>(mut inner: Inner<F>, cancel: CancellationToken) {
    let (stopped_tx, mut stopped_rx) = mpsc::unbounded_channel();
    let mut children: HashMap<String, Slot<F::Tier>> = HashMap::new();

    let sweep_period = (inner.dispose_after / 2).max(Duration::from_millis(10));
    let mut sweep = tokio::time::interval(sweep_period);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe = inner.requests_rx.recv() => match maybe {
                Some(request) => {
                    dispatch(inner.scope, &inner.factory, &mut children, &stopped_tx, request);
                }
                None => break,
            },
            Some(key) = stopped_rx.recv() => {
                on_stopped::<F>(inner.scope, &mut children, &stopped_tx, key);
            }
            _ = sweep.tick() => {
                reap_idle::<F>(inner.scope, &mut children, inner.dispose_after);
            }
            _ = cancel.cancelled() => break,
        }
    }

    // Shutdown: successors never ran, so they just get dropped; everything
    // that was started must signal back before we return.
    for slot in children.values_mut() {
        slot.successor = None;
        if !slot.stopping {
            slot.tier.initiate_stop();
            slot.stopping = true;
        }
    }
    while !children.is_empty() {
        match stopped_rx.recv().await {
            Some(key) => {
                children.remove(&key);
            }
            None => break,
        }
    }
    tracing::debug!(scope = inner.scope, "dispatcher stopped");
}

fn dispatch<F: TierFactory>(
    scope: &'static str,
    factory: &F,
    children: &mut HashMap<String, Slot<F::Tier>>,
    stopped_tx: &mpsc::UnboundedSender<String>,
    request: ConsumeRequest,
) {
    let key = factory.dispatch_key(&request).to_owned();
    let slot = children.entry(key.clone()).or_insert_with(|| {
        tracing::debug!(scope, %key, "spawning dispatch tier");
        let mut tier = factory.new_tier(&key);
        tier.start(stopped_tx.clone());
        Slot {
            tier,
            last_request: Instant::now(),
            stopping: false,
            successor: None,
        }
    });
    slot.last_request = Instant::now();

    let target = if slot.stopping {
        slot.successor
            .get_or_insert_with(|| factory.new_tier(&key))
    } else {
        &mut slot.tier
    };
    if let Err(request) = target.submit(request) {
        tracing::warn!(scope, %key, "tier queue full, rejecting request");
        let _ = request.reply.send(Err(Error::BufferOverflow));
    }
}

fn on_stopped<F: TierFactory>(
    scope: &'static str,
    children: &mut HashMap<String, Slot<F::Tier>>,
    stopped_tx: &mpsc::UnboundedSender<String>,
    key: String,
) {
    let Some(mut slot) = children.remove(&key) else {
        return;
    };
    if let Some(mut successor) = slot.successor.take() {
        tracing::debug!(scope, %key, "starting successor tier");
        successor.start(stopped_tx.clone());
        children.insert(
            key,
            Slot {
                tier: successor,
                last_request: Instant::now(),
                stopping: false,
                successor: None,
            },
        );
    } else {
        tracing::debug!(scope, %key, "dispatch tier retired");
    }
}

fn reap_idle<F: TierFactory>(
    scope: &'static str,
    children: &mut HashMap<String, Slot<F::Tier>>,
    dispose_after: Duration,
) {
    for (key, slot) in children.iter_mut() {
        if !slot.stopping && slot.last_request.elapsed() >= dispose_after {
            tracing::debug!(scope, %key, "disposing of idle tier");
            slot.tier.initiate_stop();
            slot.stopping = true;
        }
    }
}
