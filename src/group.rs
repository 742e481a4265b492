//! Per-group consumption: membership tracking and partition rebalancing.
//!
//! A group consumer owns everything this process runs on behalf of one
//! consumer group: a dispatcher of topic consumers, the registry session,
//! and one gear per consumed topic bundling the exclusive consumers with
//! the multiplexer that feeds the topic consumer. All coordination state
//! flows through a single event loop; rebalances run as detached tasks that
//! borrow the gear map wholesale and hand it back with the result, so at
//! most one is ever in flight.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use futures::future;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::assignor::assign_partitions;
use crate::consumer::Shared;
use crate::coordination::Subscriptions;
use crate::dispatcher::{ConsumeRequest, Dispatcher, Tier, TierFactory};
use crate::error::Result;
use crate::exclusive::ExclusiveConsumer;
use crate::multiplexer::{Multiplexer, MuxInput};
use crate::registry::{ClaimIssuer, GroupRegistry};
use crate::topic::{TopicConsumer, TopicLink};

/// What the moving parts of a group share: the consumer-wide collaborators
/// plus this group's claim issuer.
pub(crate) struct GroupCtx {
    pub shared: Arc<Shared>,
    pub group: String,
    pub claims: ClaimIssuer,
}

/// The per-topic bundle: the topic consumer's link, the multiplexer feeding
/// it, and one exclusive consumer per assigned partition. The multiplexer
/// is present exactly when there are exclusive consumers.
struct TopicGear {
    link: TopicLink,
    multiplexer: Option<Multiplexer>,
    consumers: HashMap<i32, ExclusiveConsumer>,
}

/// Builds topic consumers for the dispatcher nested inside a group.
struct TopicFactory {
    group: String,
    shared: Arc<Shared>,
    register_tx: mpsc::Sender<TopicLink>,
    deregister_tx: mpsc::Sender<TopicLink>,
}

impl TierFactory for TopicFactory {
    type Tier = TopicConsumer;

    fn dispatch_key<'a>(&self, request: &'a ConsumeRequest) -> &'a str {
        &request.topic
    }

    fn new_tier(&self, key: &str) -> TopicConsumer {
        TopicConsumer::new(
            self.group.clone(),
            key.to_owned(),
            self.shared.cfg.channel_buffer_size,
            self.shared.cfg.long_polling_timeout,
            self.register_tx.clone(),
            self.deregister_tx.clone(),
        )
    }
}

/// The root dispatch tier for one consumer group.
pub(crate) struct GroupConsumer {
    group: String,
    shared: Arc<Shared>,
    requests_tx: mpsc::Sender<ConsumeRequest>,
    inner: Option<Dispatcher<TopicFactory>>,
    register_rx: Option<mpsc::Receiver<TopicLink>>,
    deregister_rx: Option<mpsc::Receiver<TopicLink>>,
    stopping: CancellationToken,
}

impl GroupConsumer {
    pub fn new(group: &str, shared: Arc<Shared>) -> Self {
        let (register_tx, register_rx) = mpsc::channel(1);
        let (deregister_tx, deregister_rx) = mpsc::channel(1);
        let factory = TopicFactory {
            group: group.to_owned(),
            shared: Arc::clone(&shared),
            register_tx,
            deregister_tx,
        };
        let inner = Dispatcher::new(
            "topic",
            factory,
            shared.cfg.channel_buffer_size,
            shared.cfg.dispose_after,
        );
        let requests_tx = inner.requests().clone();
        Self {
            group: group.to_owned(),
            shared,
            requests_tx,
            inner: Some(inner),
            register_rx: Some(register_rx),
            deregister_rx: Some(deregister_rx),
            stopping: CancellationToken::new(),
        }
    }
}

impl Tier for GroupConsumer {
    fn start(&mut self, stopped: mpsc::UnboundedSender<String>) {
        let mut inner = self.inner.take().expect("group consumer started twice");
        inner.start();
        tokio::spawn(supervise(
            self.group.clone(),
            Arc::clone(&self.shared),
            inner,
            self.register_rx.take().expect("group consumer started twice"),
            self.deregister_rx.take().expect("group consumer started twice"),
            self.stopping.clone(),
            stopped,
        ));
    }

    fn initiate_stop(&mut self) {
        self.stopping.cancel();
    }

    fn submit(&mut self, request: ConsumeRequest) -> std::result::Result<(), ConsumeRequest> {
        self.requests_tx
            .try_send(request)
            .map_err(|err| err.into_inner())
    }
}

/// Owns the group's lifecycle: registry up, event loop running, and the
/// orderly unwind in the opposite order. The event loop finishing on its
/// own means the registry session is gone for good, which takes the whole
/// group down with it.
async fn supervise(
    group: String,
    shared: Arc<Shared>,
    mut inner: Dispatcher<TopicFactory>,
    register_rx: mpsc::Receiver<TopicLink>,
    deregister_rx: mpsc::Receiver<TopicLink>,
    stopping: CancellationToken,
    stopped: mpsc::UnboundedSender<String>,
) {
    tracing::info!(%group, "group consumer starting");
    let mut registry = GroupRegistry::spawn(
        &group,
        &shared.cfg.client_id,
        Arc::clone(&shared.coordination),
        shared.cfg.backoff_timeout,
    );
    let membership_rx = registry.membership_changes();
    let ctx = Arc::new(GroupCtx {
        shared: Arc::clone(&shared),
        group: group.clone(),
        claims: registry.claims(),
    });

    let manage_cancel = CancellationToken::new();
    let mut manage = tokio::spawn(manage_partitions(
        Arc::clone(&ctx),
        registry.topics().clone(),
        membership_rx,
        register_rx,
        deregister_rx,
        manage_cancel.clone(),
    ));

    tokio::select! {
        _ = stopping.cancelled() => {
            inner.stop().await;
            manage_cancel.cancel();
            let _ = (&mut manage).await;
        }
        _ = &mut manage => {
            tracing::error!(%group, "registry session lost, shutting the group down");
            inner.stop().await;
        }
    }
    registry.stop().await;
    tracing::info!(%group, "group consumer stopped");
    let _ = stopped.send(group);
}

type RebalanceOutcome = (HashMap<String, TopicGear>, Result<()>);

async fn manage_partitions(
    ctx: Arc<GroupCtx>,
    topics_tx: mpsc::Sender<Vec<String>>,
    mut membership_rx: mpsc::Receiver<Subscriptions>,
    mut register_rx: mpsc::Receiver<TopicLink>,
    mut deregister_rx: mpsc::Receiver<TopicLink>,
    cancel: CancellationToken,
) {
    let group = ctx.group.clone();

    let mut topic_consumers: HashMap<String, TopicLink> = HashMap::new();
    let mut topics: Vec<String> = Vec::new();
    let mut topics_dirty = false;
    let mut subscriptions = Subscriptions::new();
    // the gear map lives here except while a rebalance task borrows it
    let mut gears: Option<HashMap<String, TopicGear>> = Some(HashMap::new());
    let mut should_rebalance = false;
    let mut can_rebalance = true;
    let mut rebalance_inflight = false;
    let mut retry_at: Option<tokio::time::Instant> = None;
    let (outcome_tx, mut outcome_rx) = mpsc::channel::<RebalanceOutcome>(1);

    loop {
        tokio::select! {
            Some(link) = register_rx.recv() => {
                topic_consumers.insert(link.topic.clone(), link);
                topics = list_topics(&topic_consumers);
                topics_dirty = true;
                continue;
            }
            Some(link) = deregister_rx.recv() => {
                // only the instance that registered the entry may remove
                // it; a retired consumer's late deregistration must not
                // clobber the successor already serving the topic
                let still_current = topic_consumers
                    .get(&link.topic)
                    .is_some_and(|current| current.same_consumer(&link));
                if still_current {
                    topic_consumers.remove(&link.topic);
                    topics = list_topics(&topic_consumers);
                    topics_dirty = true;
                }
                continue;
            }
            sent = async { topics_tx.send(topics.clone()).await }, if topics_dirty => {
                if sent.is_err() {
                    tracing::debug!(%group, "registry is gone, topic list not published");
                }
                topics_dirty = false;
                continue;
            }
            maybe = membership_rx.recv() => match maybe {
                Some(new_subscriptions) => {
                    tracing::debug!(%group, subscriptions = ?new_subscriptions, "membership changed");
                    subscriptions = new_subscriptions;
                    retry_at = None;
                    should_rebalance = true;
                }
                None => break,
            },
            Some((returned, result)) = outcome_rx.recv(), if rebalance_inflight => {
                rebalance_inflight = false;
                can_rebalance = true;
                gears = Some(returned);
                if let Err(err) = result {
                    tracing::error!(%group, "rebalance failed: {err}");
                    retry_at = Some(tokio::time::Instant::now() + ctx.shared.cfg.backoff_timeout);
                }
            }
            _ = async { tokio::time::sleep_until(retry_at.unwrap()).await }, if retry_at.is_some() => {
                retry_at = None;
                should_rebalance = true;
            }
            _ = cancel.cancelled() => break,
        }

        if should_rebalance && can_rebalance {
            if let Some(owned) = gears.take() {
                // snapshot so the rebalance never sees later mutations
                let snapshot = topic_consumers.clone();
                let subscriptions = subscriptions.clone();
                let ctx = Arc::clone(&ctx);
                let outcome_tx = outcome_tx.clone();
                tokio::spawn(async move {
                    let outcome = rebalance(ctx, owned, snapshot, subscriptions).await;
                    let _ = outcome_tx.send(outcome).await;
                });
                rebalance_inflight = true;
                should_rebalance = false;
                can_rebalance = false;
            }
        }
    }

    // Wind down: an in-flight rebalance still holds the gears, wait it out
    // before unwiring everything.
    if rebalance_inflight {
        if let Some((returned, _)) = outcome_rx.recv().await {
            gears = Some(returned);
        }
    }
    let gears = gears.take().unwrap_or_default();
    tracing::debug!(%group, gears = gears.len(), "tearing down topic gears");
    let unassigned = BTreeSet::new();
    future::join_all(
        gears
            .into_values()
            .map(|gear| rewire_multiplexer(&ctx, gear, &unassigned)),
    )
    .await;
}

fn list_topics(topic_consumers: &HashMap<String, TopicLink>) -> Vec<String> {
    let mut topics: Vec<String> = topic_consumers.keys().cloned().collect();
    topics.sort_unstable();
    topics
}

/// One rebalance round: compute the partitions this member now owns and
/// rewire every gear accordingly, creating gears for newly consumed topics
/// and dropping the ones left without partitions.
async fn rebalance(
    ctx: Arc<GroupCtx>,
    gears: HashMap<String, TopicGear>,
    topic_consumers: HashMap<String, TopicLink>,
    subscriptions: Subscriptions,
) -> RebalanceOutcome {
    let assigned = match resolve_partitions(&ctx, &subscriptions).await {
        Ok(assigned) => assigned,
        Err(err) => return (gears, Err(err)),
    };
    tracing::info!(group = %ctx.group, ?assigned, "rebalancing");

    let mut jobs: Vec<(String, TopicGear, BTreeSet<i32>)> = Vec::new();
    for (topic, mut gear) in gears {
        let partitions = assigned.get(&topic).cloned().unwrap_or_default();
        // a successor topic consumer may have replaced the instance this
        // gear was wired to; move the gear onto the live link so its
        // multiplexer serves the demand queue someone actually reads
        if let Some(link) = topic_consumers.get(&topic) {
            if !gear.link.same_consumer(link) {
                if let Some(multiplexer) = gear.multiplexer.take() {
                    multiplexer.stop().await;
                }
                gear.link = link.clone();
            }
        }
        jobs.push((topic, gear, partitions));
    }
    for (topic, partitions) in &assigned {
        if jobs.iter().any(|(existing, _, _)| existing == topic) {
            continue;
        }
        // topics nobody long-polls for yet have no gear to build on
        let Some(link) = topic_consumers.get(topic) else {
            continue;
        };
        jobs.push((
            topic.clone(),
            TopicGear {
                link: link.clone(),
                multiplexer: None,
                consumers: HashMap::new(),
            },
            partitions.clone(),
        ));
    }

    let rewired = future::join_all(jobs.into_iter().map(|(topic, gear, partitions)| {
        let ctx = &ctx;
        async move { (topic, rewire_multiplexer(ctx, gear, &partitions).await) }
    }))
    .await;

    let mut gears = HashMap::new();
    for (topic, gear) in rewired {
        // a gear that came out of the rewire without a multiplexer has no
        // partitions left and goes away
        if gear.multiplexer.is_some() {
            gears.insert(topic, gear);
        }
    }
    (gears, Ok(()))
}

/// Reshape a gear to consume exactly `assigned`. The multiplexer is taken
/// down before the first change to the consumer set, in either direction,
/// and a fresh one is wired up at the end; upstream only ever sees the old
/// set or the new set, never a mixture.
async fn rewire_multiplexer(
    ctx: &Arc<GroupCtx>,
    mut gear: TopicGear,
    assigned: &BTreeSet<i32>,
) -> TopicGear {
    let revoked: Vec<i32> = gear
        .consumers
        .keys()
        .filter(|partition| !assigned.contains(partition))
        .copied()
        .collect();
    let mut stopping = Vec::new();
    for partition in revoked {
        if let Some(multiplexer) = gear.multiplexer.take() {
            multiplexer.stop().await;
        }
        if let Some(consumer) = gear.consumers.remove(&partition) {
            stopping.push(consumer.stop());
        }
    }
    future::join_all(stopping).await;

    for &partition in assigned {
        if gear.consumers.contains_key(&partition) {
            continue;
        }
        if let Some(multiplexer) = gear.multiplexer.take() {
            multiplexer.stop().await;
        }
        gear.consumers.insert(
            partition,
            ExclusiveConsumer::spawn(ctx, &gear.link.topic, partition),
        );
    }

    if gear.multiplexer.is_none() && !gear.consumers.is_empty() {
        let mut inputs: Vec<MuxInput> = gear
            .consumers
            .values()
            .map(ExclusiveConsumer::mux_input)
            .collect();
        inputs.sort_by_key(|input| input.partition);
        gear.multiplexer = Some(Multiplexer::spawn(
            inputs,
            Arc::clone(&gear.link.demands),
        ));
    }
    gear
}

/// Turn a membership snapshot into the set of partitions this member owns
/// per topic, using the same deterministic assignment every member runs.
async fn resolve_partitions(
    ctx: &Arc<GroupCtx>,
    subscriptions: &Subscriptions,
) -> Result<HashMap<String, BTreeSet<i32>>> {
    let mut topic_subscribers: HashMap<&str, Vec<String>> = HashMap::new();
    for (member, topics) in subscriptions {
        for topic in topics {
            topic_subscribers
                .entry(topic.as_str())
                .or_default()
                .push(member.clone());
        }
    }

    let me = &ctx.shared.cfg.client_id;
    let my_topics = subscriptions.get(me).cloned().unwrap_or_default();

    let mut assigned = HashMap::new();
    for topic in my_topics {
        let partitions = ctx.shared.client.partitions(&topic).await?;
        let subscribers = topic_subscribers.remove(topic.as_str()).unwrap_or_default();
        let mut per_member = assign_partitions(partitions, subscribers);
        assigned.insert(topic, per_member.remove(me).unwrap_or_default());
    }
    Ok(assigned)
}
