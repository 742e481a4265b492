//! Exclusive consumption of a single partition within a group.
//!
//! An exclusive consumer first claims its partition in the coordination
//! service, so that no other member of the group fetches from it, then
//! pumps messages towards its multiplexer one at a time. A message counts
//! as consumed only once the multiplexer acknowledges it, and only then is
//! its successor offset submitted for commit. On shutdown the claim is held
//! until the last submitted offset is observed committed, otherwise the
//! next owner would replay messages this process already served.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::{Message, OFFSET_NEWEST};
use crate::group::GroupCtx;
use crate::multiplexer::{MessageSlot, MuxInput};

pub(crate) struct ExclusiveConsumer {
    partition: i32,
    slot: Arc<Mutex<MessageSlot>>,
    acks_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ExclusiveConsumer {
    pub fn spawn(ctx: &Arc<GroupCtx>, topic: &str, partition: i32) -> Self {
        let (messages_tx, messages_rx) = mpsc::channel(1);
        let (acks_tx, acks_rx) = mpsc::channel(1);
        let slot = Arc::new(Mutex::new(MessageSlot {
            rx: messages_rx,
            parked: None,
        }));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            Arc::clone(ctx),
            topic.to_owned(),
            partition,
            messages_tx,
            acks_rx,
            cancel.clone(),
        ));
        Self {
            partition,
            slot,
            acks_tx,
            cancel,
            handle,
        }
    }

    pub fn mux_input(&self) -> MuxInput {
        MuxInput {
            partition: self.partition,
            slot: Arc::clone(&self.slot),
            acks: self.acks_tx.clone(),
        }
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

async fn run(
    ctx: Arc<GroupCtx>,
    topic: String,
    partition: i32,
    messages_tx: mpsc::Sender<Message>,
    mut acks_rx: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    let group = ctx.group.clone();

    let mut pom = match ctx
        .shared
        .offsets
        .manage_partition(&group, &topic, partition)
        .await
    {
        Ok(pom) => pom,
        Err(err) => {
            tracing::error!(%group, %topic, partition, "cannot open offset manager: {err}");
            return;
        }
    };

    let Some(claim) = ctx.claims.claim_partition(&topic, partition, &cancel).await else {
        pom.close().await;
        return;
    };

    // The stop signal may beat the offset coordinator; in that case no work
    // was ever fetched and the claim just goes back.
    let initial = tokio::select! {
        initial = pom.initial_offset() => initial,
        _ = cancel.cancelled() => None,
    };
    let Some(initial) = initial else {
        pom.close().await;
        claim.release().await;
        return;
    };

    let (mut fetch_rx, concrete_offset) = match ctx
        .shared
        .client
        .consume_partition(&topic, partition, initial.offset)
        .await
    {
        Ok(opened) => opened,
        Err(err) => {
            tracing::error!(%group, %topic, partition, "cannot open partition fetch stream: {err}");
            pom.close().await;
            claim.release().await;
            return;
        }
    };
    tracing::info!(
        %group,
        %topic,
        partition,
        initial = initial.offset,
        concrete = concrete_offset,
        "initialized"
    );

    let mut last_submitted = 0i64;
    let mut last_committed = 0i64;

    // A group consuming this partition for the first time has no stored
    // watermark yet; prime the offset storage with the concrete head.
    if initial.offset == OFFSET_NEWEST {
        pom.submit_offset(concrete_offset, "");
        last_submitted = concrete_offset;
    }

    let mut first_fetched = false;
    let mut fetch_open = true;
    let mut commits_open = true;
    'running: loop {
        let message = loop {
            tokio::select! {
                maybe = fetch_rx.recv(), if fetch_open => match maybe {
                    Some(message) => break message,
                    // the broker client owns fetch retries; a closed stream
                    // only means nothing more will arrive on it
                    None => fetch_open = false,
                },
                maybe = pom.next_committed(), if commits_open => match maybe {
                    Some(committed) => last_committed = committed.offset,
                    None => commits_open = false,
                },
                _ = cancel.cancelled() => break 'running,
            }
        };

        if !first_fetched {
            first_fetched = true;
            if let Some(observer) = &ctx.shared.hooks.first_fetch {
                let _ = observer.send((topic.clone(), partition));
            }
        }

        // Offer the message to the multiplexer, then hold here until it is
        // acknowledged. Commit watermarks keep flowing in the meantime.
        if messages_tx.send(message.clone()).await.is_err() {
            break 'running;
        }
        loop {
            tokio::select! {
                Some(()) = acks_rx.recv() => {
                    last_submitted = message.offset + 1;
                    pom.submit_offset(last_submitted, "");
                    continue 'running;
                }
                maybe = pom.next_committed(), if commits_open => match maybe {
                    Some(committed) => last_committed = committed.offset,
                    None => commits_open = false,
                },
                _ = cancel.cancelled() => break 'running,
            }
        }
    }

    // Flush barrier: the claim must not move to another member before the
    // last submitted offset is seen committed.
    if last_committed != last_submitted && commits_open {
        tracing::info!(
            %group,
            %topic,
            partition,
            submitted = last_submitted,
            committed = last_committed,
            "waiting for the last offset to be committed"
        );
        while let Some(committed) = pom.next_committed().await {
            last_committed = committed.offset;
            if last_committed == last_submitted {
                break;
            }
        }
    }
    pom.close().await;
    claim.release().await;
    tracing::debug!(%group, %topic, partition, "exclusive consumer stopped");
}
