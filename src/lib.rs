//! # Gregor
//! Consumption core of a long-polling gateway to a Kafka-style partitioned
//! log.
//!
//! Callers ask for one message at a time: `consume(group, topic)`. Behind
//! that single call the crate joins the consumer group through a
//! ZooKeeper-like coordination service, claims the partitions assigned to
//! this process, fetches from the partition leaders, and commits an offset
//! only after the message it covers has been handed to a caller. Group
//! membership changes trigger a rebalance that never mixes old and new
//! partition assignments.
//!
//! ## Goals
//! - One obvious operation per call, friendly to HTTP gateways
//! - At-least-once delivery with commit-after-acknowledgement
//! - Lazily created, idle-collected workers per group and topic
//! - Graceful shutdown that flushes every offset before releasing claims
//!
//! ## Getting started
//! The crate brings the consumption logic; the cluster clients are injected.
//! Implement [`BrokerClient`](prelude::BrokerClient),
//! [`OffsetManager`](prelude::OffsetManager) and
//! [`CoordinationClient`](prelude::CoordinationClient) for your stack (or
//! take existing implementations) and hand them to
//! [`Consumer::spawn`](prelude::Consumer::spawn):
//!
//! ```ignore
//! use gregor::prelude::*;
//!
//! let cfg = Config {
//!     client_id: "gateway-7".to_owned(),
//!     kafka_seed_peers: vec!["127.0.0.1:9092".to_owned()],
//!     zookeeper_seed_peers: vec!["127.0.0.1:2181".to_owned()],
//!     ..Config::default()
//! };
//! let consumer = Consumer::spawn(cfg, client, offsets, coordination)?;
//!
//! loop {
//!     match consumer.consume("billing", "invoices").await {
//!         Ok(message) => println!("{:?}", message.value),
//!         Err(Error::RequestTimeout) => continue,
//!         Err(Error::BufferOverflow) => tokio::time::sleep(backoff).await,
//!         Err(err) => break eprintln!("{err}"),
//!     }
//! }
//! ```

mod assignor;
mod broker;
mod config;
mod consumer;
mod coordination;
mod dispatcher;
mod error;
mod exclusive;
mod group;
mod multiplexer;
mod registry;
mod topic;

const DEFAULT_CLIENT_ID: &str = "gregor";

pub mod prelude {
    //! Main export of the public surface.

    pub use crate::broker::{
        BrokerClient, Message, OffsetManager, PartitionOffsetManager, TrackedOffset,
        OFFSET_EARLIEST, OFFSET_NEWEST,
    };
    pub use crate::config::Config;
    pub use crate::consumer::{Consumer, Hooks};
    pub use crate::coordination::{CoordinationClient, Subscriptions};
    pub use crate::error::{Error, Result};

    pub use bytes;
}
