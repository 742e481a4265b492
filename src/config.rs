//! Consumer configuration.

use std::time::Duration;

use crate::error::{Error, Result};

/// Static configuration of a [`Consumer`](crate::prelude::Consumer).
///
/// The seed peer lists and the chroot are carried for the broker and
/// coordination clients; the consumer core itself does not dial anything.
#[derive(Clone, Debug)]
pub struct Config {
    /// Unique id of this process. It identifies the member within consumer
    /// groups, so two processes sharing an id will fight over partitions.
    pub client_id: String,
    /// Bound of the per-topic request queues and of the dispatcher hand-off
    /// points. A full queue is reported to the caller as a buffer overflow.
    pub channel_buffer_size: usize,
    /// Maximum time a consume request may wait for a message before it is
    /// answered with a timeout.
    pub long_polling_timeout: Duration,
    /// Delay before a failed rebalance is attempted again. Also paces
    /// partition claim retries while another member still holds the claim.
    pub backoff_timeout: Duration,
    /// Idle period after which a group or topic worker that has seen no
    /// requests is torn down.
    pub dispose_after: Duration,
    /// Kafka bootstrap endpoints, consumed by the broker client.
    pub kafka_seed_peers: Vec<String>,
    /// ZooKeeper ensemble endpoints, consumed by the coordination client.
    pub zookeeper_seed_peers: Vec<String>,
    /// Path prefix namespacing this deployment in ZooKeeper.
    pub zookeeper_chroot: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: crate::DEFAULT_CLIENT_ID.to_owned(),
            channel_buffer_size: 64,
            long_polling_timeout: Duration::from_secs(3),
            backoff_timeout: Duration::from_millis(500),
            dispose_after: Duration::from_secs(20),
            kafka_seed_peers: Vec::new(),
            zookeeper_seed_peers: Vec::new(),
            zookeeper_chroot: String::new(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() {
            return Err(Error::Setup("client_id must not be empty".to_owned()));
        }
        if self.channel_buffer_size == 0 {
            return Err(Error::Setup(
                "channel_buffer_size must be at least 1".to_owned(),
            ));
        }
        if self.long_polling_timeout.is_zero() {
            return Err(Error::Setup(
                "long_polling_timeout must not be zero".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::Config;
    use crate::error::Error;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn empty_client_id_is_rejected() {
        let cfg = Config {
            client_id: String::new(),
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Setup(_))));
    }

    #[test]
    fn zero_buffer_size_is_rejected() {
        let cfg = Config {
            channel_buffer_size: 0,
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Setup(_))));
    }
}
