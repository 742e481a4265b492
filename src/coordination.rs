//! Interface of the coordination service, a ZooKeeper-like registry.
//!
//! Group membership and partition ownership live in a shared coordination
//! service so that independent processes converge on the same view. The
//! core only needs the handful of operations below; sessions, ephemeral
//! nodes and watches are the implementation's business.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// A group membership snapshot: member id to the topics it subscribes to.
pub type Subscriptions = HashMap<String, Vec<String>>;

#[async_trait]
pub trait CoordinationClient: Send + Sync + 'static {
    /// Create or update this member's ephemeral registration within the
    /// group, carrying its current topic subscription.
    async fn register(&self, group: &str, member_id: &str, topics: &[String]) -> Result<()>;

    /// Stream of membership snapshots for the group. A new watcher promptly
    /// receives the current state. Closure of the stream signals terminal
    /// session failure.
    async fn watch_group(&self, group: &str) -> Result<mpsc::UnboundedReceiver<Subscriptions>>;

    /// Attempt to take the exclusive claim on a partition. `Ok(false)` when
    /// another member currently holds it.
    async fn try_claim_partition(
        &self,
        group: &str,
        member_id: &str,
        topic: &str,
        partition: i32,
    ) -> Result<bool>;

    /// Give a held claim back.
    async fn release_partition(
        &self,
        group: &str,
        member_id: &str,
        topic: &str,
        partition: i32,
    ) -> Result<()>;

    /// Drop this member's registration and whatever claims it still holds.
    async fn leave(&self, group: &str, member_id: &str) -> Result<()>;
}
