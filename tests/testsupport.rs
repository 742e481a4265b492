//! In-memory collaborators the integration tests run the consumer against:
//! a partitioned log, a group offset store and a coordination service, all
//! sharing state the way their real counterparts would through a cluster.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex, Notify};

use gregor::prelude::*;

#[allow(dead_code)]
pub fn test_config(client_id: &str) -> Config {
    Config {
        client_id: client_id.to_owned(),
        channel_buffer_size: 8,
        long_polling_timeout: Duration::from_secs(5),
        backoff_timeout: Duration::from_millis(25),
        dispose_after: Duration::from_secs(30),
        ..Config::default()
    }
}

#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll until a message comes back. Early polls may time out while group
/// registration and partition claims are still settling.
#[allow(dead_code)]
pub async fn consume_ok(consumer: &Consumer, group: &str, topic: &str) -> Message {
    for _ in 0..40 {
        match consumer.consume(group, topic).await {
            Ok(message) => return message,
            Err(Error::RequestTimeout) | Err(Error::BufferOverflow) => continue,
            Err(err) => panic!("consume failed: {err}"),
        }
    }
    panic!("no message arrived in time");
}

#[allow(dead_code)]
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

// ---------------------------------------------------------------------------
// partitioned log
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct MemoryCluster {
    topics: Arc<Mutex<HashMap<String, Vec<PartitionLog>>>>,
    produced: Arc<Notify>,
}

#[derive(Default)]
struct PartitionLog {
    records: Vec<(Bytes, Bytes)>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(dead_code)]
    pub async fn create_topic(&self, topic: &str, partitions: i32) {
        let mut topics = self.topics.lock().await;
        topics.insert(
            topic.to_owned(),
            (0..partitions).map(|_| PartitionLog::default()).collect(),
        );
    }

    #[allow(dead_code)]
    pub async fn produce(&self, topic: &str, partition: i32, value: &str) {
        {
            let mut topics = self.topics.lock().await;
            let log = topics
                .get_mut(topic)
                .and_then(|partitions| partitions.get_mut(partition as usize))
                .expect("produce to unknown partition");
            log.records
                .push((Bytes::new(), Bytes::from(value.to_owned())));
        }
        self.produced.notify_waiters();
    }
}

#[async_trait]
impl BrokerClient for MemoryCluster {
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        let topics = self.topics.lock().await;
        let partitions = topics
            .get(topic)
            .ok_or_else(|| Error::Broker(format!("unknown topic {topic}")))?;
        Ok((0..partitions.len() as i32).collect())
    }

    async fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<(mpsc::Receiver<Message>, i64)> {
        let concrete = {
            let topics = self.topics.lock().await;
            let log = topics
                .get(topic)
                .and_then(|partitions| partitions.get(partition as usize))
                .ok_or_else(|| Error::Broker(format!("unknown partition {topic}/{partition}")))?;
            match offset {
                OFFSET_NEWEST => log.records.len() as i64,
                OFFSET_EARLIEST => 0,
                concrete => concrete,
            }
        };

        let (tx, rx) = mpsc::channel(8);
        let topics = Arc::clone(&self.topics);
        let produced = Arc::clone(&self.produced);
        let topic = topic.to_owned();
        tokio::spawn(async move {
            let mut cursor = concrete;
            loop {
                let notified = produced.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let batch: Vec<Message> = {
                    let topics = topics.lock().await;
                    let Some(log) = topics
                        .get(&topic)
                        .and_then(|partitions| partitions.get(partition as usize))
                    else {
                        return;
                    };
                    log.records
                        .iter()
                        .enumerate()
                        .skip(cursor as usize)
                        .map(|(offset, (key, value))| Message {
                            topic: topic.clone(),
                            partition,
                            offset: offset as i64,
                            key: key.clone(),
                            value: value.clone(),
                        })
                        .collect()
                };
                if batch.is_empty() {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tx.closed() => return,
                    }
                    continue;
                }
                for message in batch {
                    cursor = message.offset + 1;
                    if tx.send(message).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok((rx, concrete))
    }
}

// ---------------------------------------------------------------------------
// group offset store
// ---------------------------------------------------------------------------

type OffsetKey = (String, String, i32);

/// Stores committed offsets per (group, topic, partition). Submissions are
/// applied and reported back immediately, unless the store is frozen, in
/// which case they vanish the way an unflushed commit does when a process
/// dies.
#[derive(Clone)]
pub struct MemoryOffsets {
    store: Arc<StdMutex<HashMap<OffsetKey, i64>>>,
    frozen: Arc<AtomicBool>,
    initial_newest: bool,
}

impl MemoryOffsets {
    pub fn new() -> Self {
        Self {
            store: Arc::default(),
            frozen: Arc::default(),
            initial_newest: false,
        }
    }

    /// A store whose initial-offset policy skips the backlog, the way a
    /// fresh group configured for the newest offset would.
    #[allow(dead_code)]
    pub fn with_newest_policy() -> Self {
        Self {
            initial_newest: true,
            ..Self::new()
        }
    }

    #[allow(dead_code)]
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    #[allow(dead_code)]
    pub fn thaw(&self) {
        self.frozen.store(false, Ordering::SeqCst);
    }

    #[allow(dead_code)]
    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.store
            .lock()
            .unwrap()
            .get(&(group.to_owned(), topic.to_owned(), partition))
            .copied()
    }
}

#[async_trait]
impl OffsetManager for MemoryOffsets {
    async fn manage_partition(
        &self,
        group: &str,
        topic: &str,
        partition: i32,
    ) -> Result<Box<dyn PartitionOffsetManager>> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Box::new(MemoryPom {
            key: (group.to_owned(), topic.to_owned(), partition),
            store: Arc::clone(&self.store),
            frozen: Arc::clone(&self.frozen),
            initial_newest: self.initial_newest,
            events_tx,
            events_rx,
        }))
    }
}

struct MemoryPom {
    key: OffsetKey,
    store: Arc<StdMutex<HashMap<OffsetKey, i64>>>,
    frozen: Arc<AtomicBool>,
    initial_newest: bool,
    events_tx: mpsc::UnboundedSender<TrackedOffset>,
    events_rx: mpsc::UnboundedReceiver<TrackedOffset>,
}

#[async_trait]
impl PartitionOffsetManager for MemoryPom {
    async fn initial_offset(&mut self) -> Option<TrackedOffset> {
        let stored = self.store.lock().unwrap().get(&self.key).copied();
        Some(match stored {
            Some(offset) => TrackedOffset::new(offset),
            None if self.initial_newest => TrackedOffset::new(OFFSET_NEWEST),
            None => TrackedOffset::new(OFFSET_EARLIEST),
        })
    }

    fn submit_offset(&mut self, offset: i64, metadata: &str) {
        if self.frozen.load(Ordering::SeqCst) {
            return;
        }
        self.store.lock().unwrap().insert(self.key.clone(), offset);
        let _ = self.events_tx.send(TrackedOffset {
            offset,
            metadata: metadata.to_owned(),
        });
    }

    async fn next_committed(&mut self) -> Option<TrackedOffset> {
        self.events_rx.recv().await
    }

    async fn close(self: Box<Self>) {}
}

// ---------------------------------------------------------------------------
// coordination service
// ---------------------------------------------------------------------------

/// The shared registry: group membership, watches and partition claims.
/// `expire` plays the part of a session timeout taking a dead member's
/// ephemeral state with it.
#[derive(Clone, Default)]
pub struct MemoryCoordination {
    state: Arc<StdMutex<HashMap<String, GroupState>>>,
}

#[derive(Default)]
struct GroupState {
    members: HashMap<String, Vec<String>>,
    claims: HashMap<(String, i32), String>,
    watchers: Vec<mpsc::UnboundedSender<Subscriptions>>,
}

impl MemoryCoordination {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(dead_code)]
    pub fn expire(&self, member_id: &str) {
        let mut state = self.state.lock().unwrap();
        for group in state.values_mut() {
            group.members.remove(member_id);
            group.claims.retain(|_, owner| owner != member_id);
            Self::broadcast(group);
        }
    }

    #[allow(dead_code)]
    pub fn claim_owner(&self, group: &str, topic: &str, partition: i32) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .get(group)?
            .claims
            .get(&(topic.to_owned(), partition))
            .cloned()
    }

    #[allow(dead_code)]
    pub fn members(&self, group: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .get(group)
            .map(|group| group.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn broadcast(group: &mut GroupState) {
        let snapshot: Subscriptions = group.members.clone();
        group
            .watchers
            .retain(|watcher| watcher.send(snapshot.clone()).is_ok());
    }
}

#[async_trait]
impl CoordinationClient for MemoryCoordination {
    async fn register(&self, group: &str, member_id: &str, topics: &[String]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let group = state.entry(group.to_owned()).or_default();
        group.members.insert(member_id.to_owned(), topics.to_vec());
        Self::broadcast(group);
        Ok(())
    }

    async fn watch_group(&self, group: &str) -> Result<mpsc::UnboundedReceiver<Subscriptions>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();
        let group = state.entry(group.to_owned()).or_default();
        let _ = tx.send(group.members.clone());
        group.watchers.push(tx);
        Ok(rx)
    }

    async fn try_claim_partition(
        &self,
        group: &str,
        member_id: &str,
        topic: &str,
        partition: i32,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let group = state.entry(group.to_owned()).or_default();
        let owner = group
            .claims
            .entry((topic.to_owned(), partition))
            .or_insert_with(|| member_id.to_owned());
        Ok(owner.as_str() == member_id)
    }

    async fn release_partition(
        &self,
        group: &str,
        member_id: &str,
        topic: &str,
        partition: i32,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(group) = state.get_mut(group) {
            let key = (topic.to_owned(), partition);
            if group.claims.get(&key).map(String::as_str) == Some(member_id) {
                group.claims.remove(&key);
            }
        }
        Ok(())
    }

    async fn leave(&self, group: &str, member_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(group) = state.get_mut(group) {
            group.members.remove(member_id);
            group.claims.retain(|_, owner| owner != member_id);
            Self::broadcast(group);
        }
        Ok(())
    }
}
