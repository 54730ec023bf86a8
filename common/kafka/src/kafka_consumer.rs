use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use parking_lot::{Condvar, Mutex};
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{ConsumerGroup, GroupHandler, GroupSession, PartitionClaim};
use crate::config::KafkaClientConfig;
use crate::error::{BrokerError, SessionError};
use crate::message::Message;
use crate::metrics_consts::{CONSUMER_ERRORS, REVOKE_STALLED_HANDLERS};

type Partition = (String, i32);

#[derive(Debug)]
enum RebalanceEvent {
    Assign(Vec<Partition>),
    Revoke(Vec<Partition>),
}

fn partitions_of(list: &TopicPartitionList) -> Vec<Partition> {
    list.elements()
        .into_iter()
        .map(|elem| (elem.topic().to_string(), elem.partition()))
        .collect()
}

#[derive(Debug, Default)]
struct GateState {
    revoked: bool,
    in_flight: bool,
    /// First offset routed to the claim and not yet marked.
    next_offset: Option<i64>,
}

/// Admission control for one partition claim.
///
/// The claim stream only hands a message to the handler through
/// [`ClaimGate::admit`], and marking it clears the in-flight flag again. A
/// revocation closes the gate and waits for the message in flight, so every
/// message a handler sees is marked while the partition is still owned.
#[derive(Debug, Default)]
struct ClaimGate {
    state: Mutex<GateState>,
    idle: Condvar,
}

impl ClaimGate {
    fn admit(&self) -> bool {
        let mut state = self.state.lock();
        if state.revoked {
            return false;
        }
        state.in_flight = true;
        true
    }

    fn routed(&self, offset: i64) {
        let mut state = self.state.lock();
        if state.next_offset.is_none() {
            state.next_offset = Some(offset);
        }
    }

    fn acked(&self, offset: i64) {
        let mut state = self.state.lock();
        state.next_offset = Some(offset + 1);
        state.in_flight = false;
        self.idle.notify_all();
    }

    fn release(&self) {
        self.state.lock().in_flight = false;
        self.idle.notify_all();
    }

    /// Closes the gate and waits for the message in flight. Returns false if
    /// the handler was still running at `deadline`.
    fn revoke(&self, deadline: Instant) -> bool {
        let mut state = self.state.lock();
        state.revoked = true;
        while state.in_flight {
            if self.idle.wait_until(&mut state, deadline).timed_out() {
                return !state.in_flight;
            }
        }
        true
    }

    fn is_revoked(&self) -> bool {
        self.state.lock().revoked
    }

    fn next_offset(&self) -> Option<i64> {
        self.state.lock().next_offset
    }
}

/// Gates of the partitions currently claimed, shared by the consumer loop,
/// the group session and the rebalance callback.
#[derive(Debug, Default)]
struct ClaimRegistry {
    gates: Mutex<HashMap<Partition, Arc<ClaimGate>>>,
}

impl ClaimRegistry {
    fn open(&self, partition: Partition) -> Arc<ClaimGate> {
        let gate = Arc::new(ClaimGate::default());
        self.gates.lock().insert(partition, gate.clone());
        gate
    }

    fn get(&self, topic: &str, partition: i32) -> Option<Arc<ClaimGate>> {
        self.gates
            .lock()
            .get(&(topic.to_string(), partition))
            .cloned()
    }

    fn forget(&self, partitions: &[Partition]) {
        let mut gates = self.gates.lock();
        for partition in partitions {
            gates.remove(partition);
        }
    }

    /// Closes the gates of `partitions` and waits up to `timeout` for their
    /// handlers. Returns how many were still running when time ran out.
    fn revoke(&self, partitions: &[Partition], timeout: Duration) -> usize {
        let gates: Vec<Arc<ClaimGate>> = {
            let gates = self.gates.lock();
            partitions
                .iter()
                .filter_map(|partition| gates.get(partition).cloned())
                .collect()
        };

        let deadline = Instant::now() + timeout;
        let stalled = gates.iter().filter(|gate| !gate.revoke(deadline)).count();
        self.forget(partitions);
        stalled
    }
}

/// Runs a blocking wait from inside a librdkafka callback without starving
/// the tasks that share this runtime worker.
fn run_blocking<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// Messages of one claim, released one at a time through its gate.
struct GatedClaimStream {
    messages: mpsc::Receiver<Message>,
    gate: Arc<ClaimGate>,
}

impl Stream for GatedClaimStream {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        if self.gate.is_revoked() {
            return Poll::Ready(None);
        }
        match self.messages.poll_recv(cx) {
            Poll::Ready(Some(message)) if self.gate.admit() => Poll::Ready(Some(message)),
            // Buffered messages of a revoked partition are dropped unhandled
            // and redelivered from the committed offset
            Poll::Ready(_) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for GatedClaimStream {
    fn drop(&mut self) {
        self.gate.release();
    }
}

/// Forwards rebalance callbacks from the librdkafka poll loop to the session
/// currently running in [`KafkaConsumerGroup::consume`].
pub struct GroupContext {
    events: mpsc::UnboundedSender<RebalanceEvent>,
    claims: Arc<ClaimRegistry>,
    drain_timeout: Duration,
}

impl GroupContext {
    fn forward(&self, event: RebalanceEvent) {
        if let Err(e) = self.events.send(event) {
            warn!("Failed to forward rebalance event: {}", e);
        }
    }
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                info!("Revoking {} partitions", partitions.count());
                let revoked = partitions_of(partitions);

                // Claims must stop before librdkafka takes the partitions
                // away, or their acks could no longer be stored
                let stalled =
                    run_blocking(|| self.claims.revoke(&revoked, self.drain_timeout));
                if stalled > 0 {
                    warn!(
                        stalled,
                        "Handlers still running at revocation, their messages will be redelivered"
                    );
                    metrics::counter!(REVOKE_STALLED_HANDLERS).increment(stalled as u64);
                }

                match base_consumer.commit_consumer_state(CommitMode::Sync) {
                    Ok(()) => debug!("Committed stored offsets before revocation"),
                    Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
                    Err(e) => warn!("Failed to commit offsets before revocation: {}", e),
                }

                self.forward(RebalanceEvent::Revoke(revoked));
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => error!("Rebalance error: {}", e),
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                info!("Assigned {} partitions", partitions.count());
                self.forward(RebalanceEvent::Assign(partitions_of(partitions)));
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(e) => error!("Post-rebalance error: {}", e),
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => debug!("Committed offsets for {} partitions", offsets.count()),
            Err(e) => warn!("Failed to commit offsets: {}", e),
        }
    }
}

/// [`ConsumerGroup`] over an rdkafka `StreamConsumer`.
///
/// A session lasts from one assignment to the next revocation. Messages from
/// the shared consumer stream are routed to one bounded channel per assigned
/// partition, each drained by its own claim task. Offsets are stored once a
/// message is marked and committed by librdkafka's auto-commit, and
/// synchronously whenever partitions are revoked.
///
/// Claims are built from whole assignments, so this relies on an eager
/// assignment strategy (librdkafka's default `range,roundrobin`).
pub struct KafkaConsumerGroup {
    consumer: Arc<StreamConsumer<GroupContext>>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<RebalanceEvent>>,
    claims: Arc<ClaimRegistry>,
    subscription: Mutex<Vec<String>>,
    claim_buffer_size: usize,
    retry_backoff: Duration,
    generation: AtomicU64,
    closed: AtomicBool,
    close_token: CancellationToken,
}

impl KafkaConsumerGroup {
    pub fn new(config: &KafkaClientConfig, group_id: &str) -> Result<Self, KafkaError> {
        let tuning = &config.tuning;
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", config.bootstrap_servers())
            .set("statistics.interval.ms", "10000")
            .set("group.id", group_id)
            .set(
                "session.timeout.ms",
                config.consumer_timeout.as_millis().to_string(),
            )
            .set("auto.offset.reset", tuning.offset_reset.to_owned())
            .set("enable.auto.commit", "true")
            // Offsets are only stored once the handler is done with a message
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false");

        if tuning.tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        for (key, value) in &tuning.extra {
            client_config.set(key, value);
        }

        debug!("rdkafka configuration: {:?}", client_config);
        let claims = Arc::new(ClaimRegistry::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let consumer: StreamConsumer<GroupContext> =
            client_config.create_with_context(GroupContext {
                events: events_tx,
                claims: claims.clone(),
                drain_timeout: tuning.revoke_drain_timeout,
            })?;

        Ok(Self {
            consumer: Arc::new(consumer),
            events: tokio::sync::Mutex::new(events_rx),
            claims,
            subscription: Mutex::new(Vec::new()),
            claim_buffer_size: tuning.claim_buffer_size.max(1),
            retry_backoff: tuning.rebalance_retry_backoff,
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            close_token: CancellationToken::new(),
        })
    }

    fn subscribe(&self, topics: &[String]) -> Result<(), KafkaError> {
        let mut subscription = self.subscription.lock();
        // Subscribing again, even to the same topics, makes the member rejoin
        if subscription.as_slice() == topics {
            return Ok(());
        }

        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topic_refs)?;
        *subscription = topics.to_vec();
        info!(topics = ?topics, "Subscribed to topics");
        Ok(())
    }

    async fn run_session(
        &self,
        topics: &[String],
        handler: Arc<dyn GroupHandler>,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        self.subscribe(topics)?;

        let mut events = self.events.lock().await;
        let mut stream = self.consumer.stream();
        let mut session = Session::new(
            handler,
            Arc::new(KafkaGroupSession {
                consumer: self.consumer.clone(),
                claims: self.claims.clone(),
                generation: self.generation.fetch_add(1, Ordering::AcqRel) + 1,
            }),
            self.consumer.clone(),
            self.claims.clone(),
            self.claim_buffer_size,
        );

        // A session that ended without a revocation keeps its partitions
        let assigned = self.consumer.assignment()?;
        if assigned.count() > 0 {
            session.apply(RebalanceEvent::Assign(partitions_of(&assigned)))?;
        }

        let outcome: Result<(), SessionError> = 'session: loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break Ok(()),

                _ = self.close_token.cancelled() => {
                    break Err(BrokerError::ConsumerGroupClosed.into());
                }

                Some(event) = events.recv() => match session.apply(event) {
                    Ok(true) => continue,
                    Ok(false) => break Ok(()),
                    Err(e) => break Err(e),
                },

                next = stream.next() => {
                    let message = match next {
                        Some(Ok(borrowed)) => Message::from(&borrowed),
                        Some(Err(e)) => match classify_error(e) {
                            Some(fatal) => break Err(fatal.into()),
                            None => continue,
                        },
                        None => break Err(BrokerError::ConsumerGroupClosed.into()),
                    };

                    // The rebalance callback runs inside the poll that may
                    // also hand us the first message of a new assignment
                    while let Ok(event) = events.try_recv() {
                        let applied = session.apply(event);
                        if !matches!(applied, Ok(true)) {
                            session.rewind(&message.topic, message.partition, message.offset);
                            break 'session applied.map(|_| ());
                        }
                    }

                    if let Err(e) = session.route(message).await {
                        break Err(e);
                    }
                }
            }
        };

        session.finish().await?;
        outcome
    }
}

/// Sorts consumer stream errors: `Some` ends the session, `None` is logged
/// and consumption continues.
fn classify_error(e: KafkaError) -> Option<KafkaError> {
    match &e {
        KafkaError::MessageConsumptionFatal(code) => {
            error!("Fatal Kafka consumer error: {code:?}");
            metrics::counter!(CONSUMER_ERRORS, "level" => "fatal").increment(1);
            Some(e)
        }
        KafkaError::Global(RDKafkaErrorCode::Authentication) => {
            error!("Authentication failed: {e}");
            metrics::counter!(CONSUMER_ERRORS, "level" => "fatal").increment(1);
            Some(e)
        }
        _ => {
            warn!("Kafka consumer error: {e}");
            metrics::counter!(CONSUMER_ERRORS, "level" => "warn").increment(1);
            None
        }
    }
}

#[async_trait]
impl ConsumerGroup for KafkaConsumerGroup {
    async fn consume(
        &self,
        topics: &[String],
        handler: Arc<dyn GroupHandler>,
        cancel: CancellationToken,
    ) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::ConsumerGroupClosed.into());
        }

        let result = self.run_session(topics, handler, &cancel).await;

        if result.is_err() && !self.retry_backoff.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.retry_backoff) => {}
                _ = cancel.cancelled() => {}
                _ = self.close_token.cancelled() => {}
            }
        }
        result
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(BrokerError::ConsumerGroupClosed);
        }
        self.close_token.cancel();
        self.consumer.unsubscribe();
        info!("Consumer group closed");
        Ok(())
    }
}

struct ClaimSender {
    messages: mpsc::Sender<Message>,
    gate: Arc<ClaimGate>,
}

/// Claims and claim tasks of one consumer group session.
struct Session {
    handler: Arc<dyn GroupHandler>,
    group_session: Arc<dyn GroupSession>,
    consumer: Arc<StreamConsumer<GroupContext>>,
    registry: Arc<ClaimRegistry>,
    claim_buffer_size: usize,
    claims: HashMap<Partition, ClaimSender>,
    workers: JoinSet<Result<(), SessionError>>,
    started: bool,
}

impl Session {
    fn new(
        handler: Arc<dyn GroupHandler>,
        group_session: Arc<dyn GroupSession>,
        consumer: Arc<StreamConsumer<GroupContext>>,
        registry: Arc<ClaimRegistry>,
        claim_buffer_size: usize,
    ) -> Self {
        Self {
            handler,
            group_session,
            consumer,
            registry,
            claim_buffer_size,
            claims: HashMap::new(),
            workers: JoinSet::new(),
            started: false,
        }
    }

    /// Returns false once the session has to end.
    fn apply(&mut self, event: RebalanceEvent) -> Result<bool, SessionError> {
        match event {
            RebalanceEvent::Assign(partitions) => {
                // A member left without partitions still has a live session
                self.start()?;
                for (topic, partition) in partitions {
                    self.claim(topic, partition)?;
                }
                Ok(true)
            }
            RebalanceEvent::Revoke(partitions) => {
                info!(
                    "Session {} ends: {} partitions revoked",
                    self.group_session.generation(),
                    partitions.len()
                );
                Ok(false)
            }
        }
    }

    fn start(&mut self) -> Result<(), SessionError> {
        if !self.started {
            self.handler.setup(self.group_session.as_ref())?;
            self.started = true;
        }
        Ok(())
    }

    fn claim(&mut self, topic: String, partition: i32) -> Result<(), SessionError> {
        let key = (topic.clone(), partition);
        if self.claims.contains_key(&key) {
            return Ok(());
        }
        self.start()?;

        let (sender, receiver) = mpsc::channel(self.claim_buffer_size);
        let gate = self.registry.open(key.clone());
        let messages = GatedClaimStream {
            messages: receiver,
            gate: gate.clone(),
        };
        let claim = PartitionClaim::new(topic, partition, messages.boxed());
        let handler = self.handler.clone();
        let group_session = self.group_session.clone();
        self.workers
            .spawn(async move { handler.consume_claim(group_session, claim).await });
        self.claims.insert(
            key,
            ClaimSender {
                messages: sender,
                gate,
            },
        );
        Ok(())
    }

    async fn route(&mut self, message: Message) -> Result<(), SessionError> {
        let key = (message.topic.clone(), message.partition);
        if !self.claims.contains_key(&key) {
            // Pending revocations were applied before routing, so a message
            // always comes from a partition this member still owns
            debug!(topic = %key.0, partition = key.1, "Claiming partition on first message");
            self.claim(key.0.clone(), key.1)?;
        }
        let Some(claim) = self.claims.get(&key) else {
            return Ok(());
        };

        let offset = message.offset;
        let gate = claim.gate.clone();
        gate.routed(offset);
        if claim.messages.send(message).await.is_ok() {
            return Ok(());
        }

        self.claims.remove(&key);
        self.registry.forget(std::slice::from_ref(&key));
        if gate.is_revoked() {
            return Ok(());
        }

        // The claim task died with messages it never marked; fetch them again
        // and claim the partition anew on the next message
        warn!(topic = %key.0, partition = key.1, "Partition claim stopped early");
        self.rewind(&key.0, key.1, gate.next_offset().unwrap_or(offset));
        Ok(())
    }

    /// Moves the fetch position of a partition back so `offset` is delivered
    /// again.
    fn rewind(&self, topic: &str, partition: i32, offset: i64) {
        if let Err(e) = self
            .consumer
            .seek(topic, partition, Offset::Offset(offset), Duration::ZERO)
        {
            warn!(topic, partition, offset, "Failed to rewind partition: {}", e);
        }
    }

    /// Releases every claim and waits for the claim tasks to drain.
    async fn finish(mut self) -> Result<(), SessionError> {
        let partitions: Vec<Partition> = self.claims.drain().map(|(key, _)| key).collect();

        while let Some(result) = self.workers.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Partition claim failed: {}", e),
                Err(e) => error!("Partition claim task panicked: {}", e),
            }
        }
        self.registry.forget(&partitions);

        if self.started {
            self.handler.cleanup(self.group_session.as_ref())?;
        }
        Ok(())
    }
}

struct KafkaGroupSession {
    consumer: Arc<StreamConsumer<GroupContext>>,
    claims: Arc<ClaimRegistry>,
    generation: u64,
}

impl GroupSession for KafkaGroupSession {
    fn generation(&self) -> u64 {
        self.generation
    }

    fn mark_message(&self, message: &Message) {
        let stored =
            self.consumer
                .store_offset(&message.topic, message.partition, message.offset);
        if let Some(gate) = self.claims.get(&message.topic, message.partition) {
            gate.acked(message.offset);
        }

        if let Err(e) = stored {
            warn!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "Failed to store offset, message will be redelivered: {}",
                e
            );
        }
    }
}
