//! Long-polling request server for one (group, topic) pair.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};

use crate::dispatcher::{ConsumeRequest, Tier};
use crate::error::Error;
use crate::multiplexer::DemandSlot;

/// What a topic consumer leaves behind with its group consumer: the name it
/// serves and the demand queue its multiplexer draws delivery slots from.
#[derive(Clone)]
pub(crate) struct TopicLink {
    pub topic: String,
    pub demands: Arc<Mutex<mpsc::Receiver<DemandSlot>>>,
}

impl TopicLink {
    /// Whether both links belong to the same topic consumer instance. A
    /// retired instance and its successor serve the same topic but never
    /// share a demand queue.
    pub fn same_consumer(&self, other: &TopicLink) -> bool {
        Arc::ptr_eq(&self.demands, &other.demands)
    }
}

/// Serves consume requests for a single topic. For every request still
/// within its long polling deadline it enqueues a delivery slot that the
/// multiplexer fulfils with the next available partition message; no
/// message leaves a partition until a caller is waiting for it.
pub(crate) struct TopicConsumer {
    group: String,
    topic: String,
    long_polling_timeout: Duration,
    requests_tx: Option<mpsc::Sender<ConsumeRequest>>,
    requests_rx: Option<mpsc::Receiver<ConsumeRequest>>,
    demands_tx: mpsc::Sender<DemandSlot>,
    link: TopicLink,
    register_tx: mpsc::Sender<TopicLink>,
    deregister_tx: mpsc::Sender<TopicLink>,
}

impl TopicConsumer {
    pub fn new(
        group: String,
        topic: String,
        queue_size: usize,
        long_polling_timeout: Duration,
        register_tx: mpsc::Sender<TopicLink>,
        deregister_tx: mpsc::Sender<TopicLink>,
    ) -> Self {
        let (requests_tx, requests_rx) = mpsc::channel(queue_size);
        let (demands_tx, demands_rx) = mpsc::channel(1);
        let link = TopicLink {
            topic: topic.clone(),
            demands: Arc::new(Mutex::new(demands_rx)),
        };
        Self {
            group,
            topic,
            long_polling_timeout,
            requests_tx: Some(requests_tx),
            requests_rx: Some(requests_rx),
            demands_tx,
            link,
            register_tx,
            deregister_tx,
        }
    }
}

impl Tier for TopicConsumer {
    fn start(&mut self, stopped: mpsc::UnboundedSender<String>) {
        let requests_rx = self.requests_rx.take().expect("topic consumer started twice");
        tokio::spawn(run(
            self.group.clone(),
            self.topic.clone(),
            self.long_polling_timeout,
            requests_rx,
            self.demands_tx.clone(),
            self.link.clone(),
            self.register_tx.clone(),
            self.deregister_tx.clone(),
            stopped,
        ));
    }

    fn initiate_stop(&mut self) {
        // closing the request queue is the stop signal
        self.requests_tx = None;
    }

    fn submit(&mut self, request: ConsumeRequest) -> Result<(), ConsumeRequest> {
        match &self.requests_tx {
            Some(tx) => tx.try_send(request).map_err(|err| err.into_inner()),
            None => Err(request),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    group: String,
    topic: String,
    long_polling_timeout: Duration,
    mut requests_rx: mpsc::Receiver<ConsumeRequest>,
    demands_tx: mpsc::Sender<DemandSlot>,
    link: TopicLink,
    register_tx: mpsc::Sender<TopicLink>,
    deregister_tx: mpsc::Sender<TopicLink>,
    stopped: mpsc::UnboundedSender<String>,
) {
    tracing::debug!(%group, %topic, "topic consumer starting");
    let _ = register_tx.send(link.clone()).await;

    'requests: while let Some(request) = requests_rx.recv().await {
        // A request that sat buffered past the client's patience gets a
        // timeout: replying with a message the client will never ack only
        // risks losing it.
        let age = request.received_at.elapsed();
        let ttl = long_polling_timeout.saturating_sub(age);
        if ttl.is_zero() {
            let _ = request.reply.send(Err(Error::RequestTimeout));
            continue;
        }
        let deadline = tokio::time::Instant::now() + ttl;

        // A delivery slot can come back unfulfilled when the multiplexer
        // holding it is swapped out during a rebalance; re-arm one until
        // the deadline runs out.
        loop {
            let (slot, mut delivery) = oneshot::channel();
            tokio::select! {
                sent = demands_tx.send(slot) => {
                    if sent.is_err() {
                        let _ = request.reply.send(Err(Error::RequestTimeout));
                        continue 'requests;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let _ = request.reply.send(Err(Error::RequestTimeout));
                    continue 'requests;
                }
            }
            tokio::select! {
                delivered = &mut delivery => match delivered {
                    Ok(message) => {
                        let _ = request.reply.send(Ok(message));
                        continue 'requests;
                    }
                    Err(_) => continue,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    // the slot may have been fulfilled, and acknowledged,
                    // at the same instant the deadline fired; such a
                    // message must still reach the caller
                    let reply = match delivery.try_recv() {
                        Ok(message) => Ok(message),
                        Err(_) => Err(Error::RequestTimeout),
                    };
                    let _ = request.reply.send(reply);
                    continue 'requests;
                }
            }
        }
    }

    let _ = deregister_tx.send(link).await;
    tracing::debug!(%group, %topic, "topic consumer stopped");
    let _ = stopped.send(topic);
}
