//! Fan-in of partition streams into a single topic stream.
//!
//! One multiplexer serves one topic gear. Delivery is demand driven: the
//! topic consumer enqueues a delivery slot for every caller that is
//! waiting, and only then does the multiplexer pick a ready partition
//! input, fairly, and fulfil the slot. The input is acknowledged, which is
//! what lets the owning exclusive consumer commit the offset, only when the
//! fulfilment succeeded; a message whose caller gave up waiting is parked
//! unacknowledged and handed to the next caller instead. The input set is
//! fixed for the lifetime of a multiplexer: partition assignment changes
//! stop the old multiplexer and spawn a fresh one, so upstream never
//! observes a mixed input set.

use std::sync::Arc;

use futures::future;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::Message;

/// A caller waiting for a message. Fulfilled with the next available
/// partition message; dropped when the caller stops waiting.
pub(crate) type DemandSlot = oneshot::Sender<Message>;

/// One exclusive consumer's end plugged into the multiplexer: the slot its
/// messages arrive through and the ack channel leading back to it.
pub(crate) struct MuxInput {
    pub partition: i32,
    pub slot: Arc<Mutex<MessageSlot>>,
    pub acks: mpsc::Sender<()>,
}

/// The hand-off point between an exclusive consumer and the multiplexer.
/// A message that could not be delivered to the caller it was picked for
/// is parked here, still unacknowledged, and the next delivery attempt
/// takes it before reading the channel again. The slot outlives any one
/// multiplexer, so nothing in flight is lost across a rewire.
pub(crate) struct MessageSlot {
    pub rx: mpsc::Receiver<Message>,
    pub parked: Option<Message>,
}

pub(crate) struct Multiplexer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Multiplexer {
    pub fn spawn(
        inputs: Vec<MuxInput>,
        demands: Arc<Mutex<mpsc::Receiver<DemandSlot>>>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(inputs, demands, cancel.clone()));
        Self { cancel, handle }
    }

    /// Stop and join. After this returns no input and no demand is being
    /// read, and every undelivered message sits unacknowledged in its
    /// origin slot.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

async fn run(
    inputs: Vec<MuxInput>,
    demands: Arc<Mutex<mpsc::Receiver<DemandSlot>>>,
    cancel: CancellationToken,
) {
    if inputs.is_empty() {
        return;
    }
    let mut start = 0;
    loop {
        // no input is touched until a caller is actually waiting
        let demand = tokio::select! {
            _ = cancel.cancelled() => return,
            maybe = async { demands.lock().await.recv().await } => match maybe {
                Some(demand) => demand,
                // the topic consumer and all of its successors are gone
                None => return,
            },
        };
        let (index, message) = match next_message(&inputs, start, &cancel).await {
            Some(picked) => picked,
            None => return,
        };
        // rotate past the input just served so none is favored
        start = (index + 1) % inputs.len();

        match demand.send(message) {
            // the ack is what lets the owning consumer commit the offset
            Ok(()) => {
                let _ = inputs[index].acks.send(()).await;
            }
            // the caller gave up waiting; keep the message, unacknowledged,
            // for the next one
            Err(message) => {
                inputs[index].slot.lock().await.parked = Some(message);
            }
        }
    }
}

/// Pick one ready input, scanning from `start`. Parked and already buffered
/// messages win without waiting; otherwise wait for the first input to
/// produce, or for the stop signal.
async fn next_message(
    inputs: &[MuxInput],
    start: usize,
    cancel: &CancellationToken,
) -> Option<(usize, Message)> {
    for i in 0..inputs.len() {
        let index = (start + i) % inputs.len();
        let mut slot = inputs[index].slot.lock().await;
        if let Some(message) = slot.parked.take() {
            return Some((index, message));
        }
        if let Ok(message) = slot.rx.try_recv() {
            return Some((index, message));
        }
    }

    let waiters: Vec<_> = (0..inputs.len())
        .map(|i| {
            let index = (start + i) % inputs.len();
            let slot = Arc::clone(&inputs[index].slot);
            Box::pin(async move {
                let mut slot = slot.lock().await;
                (index, slot.rx.recv().await)
            })
        })
        .collect();

    tokio::select! {
        _ = cancel.cancelled() => None,
        ((index, maybe), _, _) = future::select_all(waiters) => maybe.map(|message| (index, message)),
    }
}
