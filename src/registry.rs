//! Per-group façade over the coordination service.
//!
//! A group consumer does not talk to the coordination client directly. The
//! registry task owns the session: it publishes the member's current topic
//! subscription, relays membership snapshots, and hands out partition
//! claims. Closing its membership stream is how terminal coordination
//! failure reaches the group consumer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::coordination::{CoordinationClient, Subscriptions};

pub(crate) struct GroupRegistry {
    topics_tx: mpsc::Sender<Vec<String>>,
    membership_rx: Option<mpsc::Receiver<Subscriptions>>,
    claims: ClaimIssuer,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl GroupRegistry {
    pub fn spawn(
        group: &str,
        member_id: &str,
        coordination: Arc<dyn CoordinationClient>,
        backoff: Duration,
    ) -> Self {
        let (topics_tx, topics_rx) = mpsc::channel(1);
        let (membership_tx, membership_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            group.to_owned(),
            member_id.to_owned(),
            Arc::clone(&coordination),
            backoff,
            topics_rx,
            membership_tx,
            cancel.clone(),
        ));
        Self {
            topics_tx,
            membership_rx: Some(membership_rx),
            claims: ClaimIssuer {
                group: group.to_owned(),
                member_id: member_id.to_owned(),
                coordination,
                retry: backoff,
            },
            cancel,
            handle,
        }
    }

    /// Single-slot channel the group consumer publishes its topic list on.
    pub fn topics(&self) -> &mpsc::Sender<Vec<String>> {
        &self.topics_tx
    }

    pub fn membership_changes(&mut self) -> mpsc::Receiver<Subscriptions> {
        self.membership_rx
            .take()
            .expect("membership stream already taken")
    }

    pub fn claims(&self) -> ClaimIssuer {
        self.claims.clone()
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

async fn run(
    group: String,
    member_id: String,
    coordination: Arc<dyn CoordinationClient>,
    backoff: Duration,
    mut topics_rx: mpsc::Receiver<Vec<String>>,
    membership_tx: mpsc::Sender<Subscriptions>,
    cancel: CancellationToken,
) {
    let mut watch = match coordination.watch_group(&group).await {
        Ok(watch) => watch,
        Err(err) => {
            tracing::error!(%group, %member_id, "cannot watch group membership: {err}");
            return;
        }
    };

    // Topic lists overwrite each other: only the latest one matters, and a
    // failed registration is retried with backoff until a newer list or the
    // stop signal supersedes it.
    let mut pending: Option<Vec<String>> = None;
    let mut retry_at: Option<tokio::time::Instant> = None;
    loop {
        tokio::select! {
            maybe = topics_rx.recv() => match maybe {
                Some(topics) => {
                    pending = Some(topics);
                    retry_at = None;
                }
                None => break,
            },
            maybe = watch.recv() => match maybe {
                Some(subscriptions) => {
                    if membership_tx.send(subscriptions).await.is_err() {
                        break;
                    }
                }
                None => {
                    tracing::error!(%group, %member_id, "membership watch lost");
                    break;
                }
            },
            _ = async { tokio::time::sleep_until(retry_at.unwrap()).await }, if retry_at.is_some() => {
                retry_at = None;
            }
            _ = cancel.cancelled() => break,
        }

        if retry_at.is_none() {
            if let Some(topics) = pending.take() {
                match coordination.register(&group, &member_id, &topics).await {
                    Ok(()) => {
                        tracing::debug!(%group, %member_id, ?topics, "subscription registered");
                    }
                    Err(err) => {
                        tracing::warn!(%group, %member_id, "registration failed, will retry: {err}");
                        pending = Some(topics);
                        retry_at = Some(tokio::time::Instant::now() + backoff);
                    }
                }
            }
        }
    }

    if let Err(err) = coordination.leave(&group, &member_id).await {
        tracing::warn!(%group, %member_id, "leaving the group failed: {err}");
    }
    tracing::debug!(%group, %member_id, "registry stopped");
}

/// Hands out exclusive partition claims. Cloned into every exclusive
/// consumer of the group.
#[derive(Clone)]
pub(crate) struct ClaimIssuer {
    group: String,
    member_id: String,
    coordination: Arc<dyn CoordinationClient>,
    retry: Duration,
}

impl ClaimIssuer {
    /// Block until the exclusive claim on the partition is granted, or
    /// until `stop` fires. The previous owner may still be flushing its
    /// offsets, so this can legitimately take a while.
    pub async fn claim_partition(
        &self,
        topic: &str,
        partition: i32,
        stop: &CancellationToken,
    ) -> Option<PartitionClaim> {
        loop {
            match self
                .coordination
                .try_claim_partition(&self.group, &self.member_id, topic, partition)
                .await
            {
                Ok(true) => {
                    tracing::debug!(group = %self.group, %topic, partition, "partition claimed");
                    return Some(PartitionClaim {
                        group: self.group.clone(),
                        member_id: self.member_id.clone(),
                        topic: topic.to_owned(),
                        partition,
                        coordination: Arc::clone(&self.coordination),
                    });
                }
                Ok(false) => {
                    tracing::debug!(
                        group = %self.group,
                        %topic,
                        partition,
                        "partition still claimed by another member"
                    );
                }
                Err(err) => {
                    tracing::warn!(group = %self.group, %topic, partition, "claim attempt failed: {err}");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.retry) => {}
                _ = stop.cancelled() => return None,
            }
        }
    }
}

/// A granted claim. Dropping it without `release` leaves the coordination
/// node behind until the session expires, so the exclusive consumer always
/// releases explicitly.
pub(crate) struct PartitionClaim {
    group: String,
    member_id: String,
    topic: String,
    partition: i32,
    coordination: Arc<dyn CoordinationClient>,
}

impl PartitionClaim {
    pub async fn release(self) {
        if let Err(err) = self
            .coordination
            .release_partition(&self.group, &self.member_id, &self.topic, self.partition)
            .await
        {
            tracing::warn!(
                group = %self.group,
                topic = %self.topic,
                partition = self.partition,
                "failed to release partition claim: {err}"
            );
        }
    }
}
