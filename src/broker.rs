//! Interfaces of the broker client consumed by the core.
//!
//! The consumer core never speaks the wire protocol itself. Fetching,
//! metadata and offset storage are provided by an implementation of the
//! traits below, typically backed by a real cluster client. The integration
//! tests run against in-memory implementations.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;

/// Offset sentinel resolving to the next offset that will be produced.
pub const OFFSET_NEWEST: i64 = -1;
/// Offset sentinel resolving to the oldest offset still in the log.
pub const OFFSET_EARLIEST: i64 = -2;

/// A single record fetched from a partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Bytes,
    pub value: Bytes,
}

/// An offset watermark together with the metadata stored next to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackedOffset {
    pub offset: i64,
    pub metadata: String,
}

impl TrackedOffset {
    pub fn new(offset: i64) -> Self {
        Self {
            offset,
            metadata: String::new(),
        }
    }
}

/// Read access to the cluster: topic metadata and partition fetch streams.
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Partition ids of the topic.
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>>;

    /// Open a fetch stream over the partition starting at `offset`, which
    /// may be [`OFFSET_NEWEST`] or [`OFFSET_EARLIEST`]. Returns the stream
    /// and the concrete offset the sentinel resolved to. The client owns
    /// fetch retries; a closed stream means nothing more will arrive.
    async fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<(mpsc::Receiver<Message>, i64)>;
}

/// Entry point into group offset storage.
#[async_trait]
pub trait OffsetManager: Send + Sync + 'static {
    async fn manage_partition(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
    ) -> Result<Box<dyn PartitionOffsetManager>>;
}

/// Offset tracking for one (group, topic, partition).
///
/// Submissions are applied in order, and every applied submission is
/// eventually reported back on the committed stream. Nothing appears on the
/// committed stream before the first submission.
#[async_trait]
pub trait PartitionOffsetManager: Send {
    /// The offset to resume consumption from: the stored committed offset,
    /// or an offset sentinel chosen by the manager's initial-offset policy
    /// when the group has none. Yields `None` if the offset coordinator
    /// could not be reached.
    async fn initial_offset(&mut self) -> Option<TrackedOffset>;

    /// Record `offset` as the new watermark to be committed.
    fn submit_offset(&mut self, offset: i64, metadata: &str);

    /// Next watermark observed as committed by the coordinator. `None` when
    /// the commit stream has terminated.
    async fn next_committed(&mut self) -> Option<TrackedOffset>;

    /// Flush and release the manager.
    async fn close(self: Box<Self>);
}
