//! The public consumer surface.
//!
//! A [`Consumer`] multiplexes any number of concurrent long-polling calls
//! over the consumer groups and topics they name. Workers come into being
//! on the first request that needs them, register with their group in the
//! coordination service, and melt away again after sitting idle; callers
//! only ever see `consume` and its three possible outcomes.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use crate::broker::{BrokerClient, Message, OffsetManager};
use crate::config::Config;
use crate::coordination::CoordinationClient;
use crate::dispatcher::{ConsumeRequest, Dispatcher, TierFactory};
use crate::error::{Error, Result};
use crate::group::GroupConsumer;

/// Observer hooks injected at construction. Purely for tests and
/// diagnostics; production setups leave this at its default.
#[derive(Clone, Default)]
pub struct Hooks {
    /// Fires with (topic, partition) when an exclusive consumer fetches its
    /// very first message.
    pub first_fetch: Option<mpsc::UnboundedSender<(String, i32)>>,
}

/// Everything the worker tree shares read-only.
pub(crate) struct Shared {
    pub cfg: Config,
    pub client: Arc<dyn BrokerClient>,
    pub offsets: Arc<dyn OffsetManager>,
    pub coordination: Arc<dyn CoordinationClient>,
    pub hooks: Hooks,
}

struct GroupFactory {
    shared: Arc<Shared>,
}

impl TierFactory for GroupFactory {
    type Tier = GroupConsumer;

    fn dispatch_key<'a>(&self, request: &'a ConsumeRequest) -> &'a str {
        &request.group
    }

    fn new_tier(&self, key: &str) -> GroupConsumer {
        GroupConsumer::new(key, Arc::clone(&self.shared))
    }
}

/// Long-polling consumer over a partitioned log, shared by any number of
/// consumer groups and topics.
///
/// ### Example
/// ```ignore
/// let consumer = Consumer::spawn(Config::default(), client, offsets, coordination)?;
/// match consumer.consume("billing", "invoices").await {
///     Ok(message) => handle(message),
///     Err(Error::RequestTimeout) => {} // nothing new, poll again
///     Err(Error::BufferOverflow) => back_off().await,
///     Err(err) => return Err(err),
/// }
/// consumer.stop().await;
/// ```
pub struct Consumer {
    dispatcher: Dispatcher<GroupFactory>,
}

impl Consumer {
    /// Validate the configuration and start the dispatcher tree. Must be
    /// called within a Tokio runtime.
    pub fn spawn(
        cfg: Config,
        client: Arc<dyn BrokerClient>,
        offsets: Arc<dyn OffsetManager>,
        coordination: Arc<dyn CoordinationClient>,
    ) -> Result<Self> {
        Self::spawn_with_hooks(cfg, client, offsets, coordination, Hooks::default())
    }

    pub fn spawn_with_hooks(
        cfg: Config,
        client: Arc<dyn BrokerClient>,
        offsets: Arc<dyn OffsetManager>,
        coordination: Arc<dyn CoordinationClient>,
        hooks: Hooks,
    ) -> Result<Self> {
        cfg.validate()?;
        let shared = Arc::new(Shared {
            cfg,
            client,
            offsets,
            coordination,
            hooks,
        });
        let mut dispatcher = Dispatcher::new(
            "group",
            GroupFactory {
                shared: Arc::clone(&shared),
            },
            shared.cfg.channel_buffer_size,
            shared.cfg.dispose_after,
        );
        dispatcher.start();
        Ok(Self { dispatcher })
    }

    /// Consume one message from `topic` on behalf of `group`.
    ///
    /// Blocks for up to the long polling timeout when the topic has nothing
    /// new. While group registration and partition assignment are still
    /// settling, a call may come back with a timeout or an overflow even
    /// though messages exist; callers are expected to poll again.
    pub async fn consume(&self, group: &str, topic: &str) -> Result<Message> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = ConsumeRequest {
            received_at: Instant::now(),
            group: group.to_owned(),
            topic: topic.to_owned(),
            reply: reply_tx,
        };
        if self.dispatcher.requests().send(request).await.is_err() {
            return Err(Error::RequestTimeout);
        }
        match reply_rx.await {
            Ok(result) => result,
            // the worker went away without answering; to the caller that is
            // indistinguishable from an expired poll
            Err(_) => Err(Error::RequestTimeout),
        }
    }

    /// Stop every worker, deepest first. Returns only once all consumed
    /// offsets of all groups, topics and partitions have been observed as
    /// committed and every partition claim has been released.
    pub async fn stop(mut self) {
        self.dispatcher.stop().await;
    }
}
