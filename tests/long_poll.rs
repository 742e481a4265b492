mod testsupport;

use std::sync::Arc;
use std::time::{Duration, Instant};

use gregor::prelude::*;
use testsupport::{test_config, MemoryCluster, MemoryCoordination, MemoryOffsets};

const GROUP: &str = "gateway";
const TOPIC: &str = "events";

fn spawn_consumer(cfg: Config, cluster: &MemoryCluster) -> Consumer {
    Consumer::spawn(
        cfg,
        Arc::new(cluster.clone()),
        Arc::new(MemoryOffsets::new()),
        Arc::new(MemoryCoordination::new()),
    )
    .unwrap()
}

#[tokio::test]
async fn empty_topic_times_out_after_the_polling_deadline() {
    testsupport::init_tracing();
    let cluster = MemoryCluster::new();
    cluster.create_topic(TOPIC, 1).await;
    let mut cfg = test_config("member-a");
    cfg.long_polling_timeout = Duration::from_millis(100);
    let consumer = spawn_consumer(cfg, &cluster);

    let started = Instant::now();
    let result = consumer.consume(GROUP, TOPIC).await;
    let elapsed = started.elapsed();

    assert_eq!(result, Err(Error::RequestTimeout));
    assert!(elapsed >= Duration::from_millis(100), "returned in {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");

    consumer.stop().await;
}

#[tokio::test]
async fn overflowing_the_request_queue_is_reported() {
    testsupport::init_tracing();
    let cluster = MemoryCluster::new();
    cluster.create_topic(TOPIC, 1).await;
    let mut cfg = test_config("member-a");
    cfg.channel_buffer_size = 1;
    cfg.long_polling_timeout = Duration::from_secs(1);
    let consumer = spawn_consumer(cfg, &cluster);

    let outcomes = tokio::join!(
        consumer.consume(GROUP, TOPIC),
        consumer.consume(GROUP, TOPIC),
        consumer.consume(GROUP, TOPIC),
    );
    let outcomes = [outcomes.0, outcomes.1, outcomes.2];

    let overflows = outcomes
        .iter()
        .filter(|outcome| **outcome == Err(Error::BufferOverflow))
        .count();
    let timeouts = outcomes
        .iter()
        .filter(|outcome| **outcome == Err(Error::RequestTimeout))
        .count();
    assert!(overflows >= 1, "outcomes: {outcomes:?}");
    assert_eq!(overflows + timeouts, 3, "outcomes: {outcomes:?}");

    consumer.stop().await;
}

#[tokio::test]
async fn requests_buffered_past_their_deadline_expire_together() {
    testsupport::init_tracing();
    let cluster = MemoryCluster::new();
    cluster.create_topic(TOPIC, 1).await;
    let mut cfg = test_config("member-a");
    cfg.long_polling_timeout = Duration::from_millis(100);
    let consumer = spawn_consumer(cfg, &cluster);

    // five requests share one poll window: the first one waits it out and
    // the rest have already aged past the deadline when they are dequeued
    let started = Instant::now();
    let outcomes = tokio::join!(
        consumer.consume(GROUP, TOPIC),
        consumer.consume(GROUP, TOPIC),
        consumer.consume(GROUP, TOPIC),
        consumer.consume(GROUP, TOPIC),
        consumer.consume(GROUP, TOPIC),
    );
    let elapsed = started.elapsed();

    for outcome in [
        outcomes.0, outcomes.1, outcomes.2, outcomes.3, outcomes.4,
    ] {
        assert_eq!(outcome, Err(Error::RequestTimeout));
    }
    assert!(
        elapsed < Duration::from_millis(400),
        "expired requests were polled one after another: {elapsed:?}"
    );

    consumer.stop().await;
}
