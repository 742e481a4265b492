//! Error and result types used across the crate.

/// All the ways consumption can fail, either for a single request or for
/// the consumer as a whole.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Construction failed and the consumer never started.
    #[error("setup failed: {0}")]
    Setup(String),

    /// A bounded request queue was full. Transient; the caller should back
    /// off a bit and repeat the request.
    #[error("request buffer overflow")]
    BufferOverflow,

    /// The long poll elapsed without a message, or the request spent longer
    /// than the polling deadline waiting in a queue.
    #[error("long polling timeout")]
    RequestTimeout,

    /// The broker client reported a failure.
    #[error("broker error: {0}")]
    Broker(String),

    /// The coordination service reported a failure.
    #[error("coordination error: {0}")]
    Coordination(String),
}

pub type Result<T> = std::result::Result<T, Error>;
