use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use delay_notifier::{
    broker::{
        Acknowledge, BrokerConnector, BrokerLink, BrokerSession, Delivery, DeliveryStream,
        NotificationBroker, OutboundMessage, QueueArguments,
        connection::ConnectionManager,
        topology::{DEAD_LETTER_EXCHANGE_ARG, DEAD_LETTER_ROUTING_KEY_ARG, QueueTopology},
    },
    channels::{ChannelSender, SendError, run_detached},
    clients::{Cache, NotificationRepository},
    models::{channel::Channel, notification::Notification, status::NotificationStatus},
    services::{notification::NotificationService, status::StatusTracker},
};
use futures_util::{StreamExt, stream};
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const MAIN_QUEUE: &str = "test.delayed";
pub const DEAD_LETTER_EXCHANGE: &str = "test.dlx";
pub const DEAD_LETTER_QUEUE: &str = "test.dlq";
pub const RECONNECT_INTERVAL: Duration = Duration::from_millis(50);

const POLL_INTERVAL: Duration = Duration::from_millis(5);

pub fn test_topology() -> QueueTopology {
    QueueTopology::new(MAIN_QUEUE, DEAD_LETTER_EXCHANGE, DEAD_LETTER_QUEUE)
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

// ---------------------------------------------------------------------------
// In-memory broker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

#[derive(Default)]
struct FakeQueue {
    arguments: QueueArguments,
    messages: VecDeque<StoredMessage>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: Vec<String>,
    queues: HashMap<String, FakeQueue>,
    bindings: Vec<(String, String, String)>,
    declarations: Vec<String>,
    acks: usize,
    rejects: Vec<bool>,
    fail_publish: bool,
}

/// Durable queues, a default exchange, direct-exchange bindings and
/// dead-lettering driven by queue arguments. Survives sessions.
#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut BrokerState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.with_state(|s| s.exchanges.iter().any(|e| e == name))
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.with_state(|s| s.queues.contains_key(name))
    }

    pub fn queue_arguments(&self, name: &str) -> Option<QueueArguments> {
        self.with_state(|s| s.queues.get(name).map(|q| q.arguments.clone()))
    }

    pub fn queue_len(&self, name: &str) -> usize {
        self.with_state(|s| s.queues.get(name).map_or(0, |q| q.messages.len()))
    }

    pub fn messages(&self, name: &str) -> Vec<StoredMessage> {
        self.with_state(|s| {
            s.queues
                .get(name)
                .map(|q| q.messages.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    pub fn notifications(&self, name: &str) -> Vec<Notification> {
        self.messages(name)
            .iter()
            .filter_map(|m| serde_json::from_slice(&m.payload).ok())
            .collect()
    }

    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.with_state(|s| s.bindings.clone())
    }

    pub fn declarations(&self) -> Vec<String> {
        self.with_state(|s| s.declarations.clone())
    }

    pub fn acks(&self) -> usize {
        self.with_state(|s| s.acks)
    }

    pub fn rejects(&self) -> Vec<bool> {
        self.with_state(|s| s.rejects.clone())
    }

    pub fn set_publish_failure(&self, fail: bool) {
        self.with_state(|s| s.fail_publish = fail);
    }

    /// Declares a queue out of band, e.g. to simulate a pre-existing queue.
    pub fn declare_queue(&self, name: &str, arguments: QueueArguments) {
        self.with_state(|s| {
            s.queues.entry(name.to_string()).or_default().arguments = arguments;
        });
    }

    pub fn push_raw(&self, queue: &str, payload: &[u8]) {
        self.with_state(|s| {
            s.queues
                .entry(queue.to_string())
                .or_default()
                .messages
                .push_back(StoredMessage {
                    payload: payload.to_vec(),
                    redelivered: false,
                });
        });
    }

    fn requeue(&self, queue: &str, mut message: StoredMessage) {
        message.redelivered = true;
        self.with_state(|s| {
            if let Some(q) = s.queues.get_mut(queue) {
                q.messages.push_front(message);
            }
        });
    }

    fn dead_letter(&self, queue: &str, message: StoredMessage) {
        self.with_state(|s| {
            let Some(arguments) = s.queues.get(queue).map(|q| q.arguments.clone()) else {
                return;
            };
            let Some(exchange) = arguments.get(DEAD_LETTER_EXCHANGE_ARG) else {
                return;
            };
            let routing_key = arguments
                .get(DEAD_LETTER_ROUTING_KEY_ARG)
                .cloned()
                .unwrap_or_else(|| queue.to_string());

            let targets: Vec<String> = s
                .bindings
                .iter()
                .filter(|(_, ex, key)| ex == exchange && *key == routing_key)
                .map(|(q, _, _)| q.clone())
                .collect();

            for target in targets {
                if let Some(q) = s.queues.get_mut(&target) {
                    q.messages.push_back(StoredMessage {
                        payload: message.payload.clone(),
                        redelivered: false,
                    });
                }
            }
        });
    }
}

type Unacked = Arc<Mutex<Option<(String, StoredMessage)>>>;

pub struct FakeSession {
    broker: FakeBroker,
    closed: Arc<AtomicBool>,
    unacked: Arc<Mutex<Vec<Unacked>>>,
}

impl FakeSession {
    fn new(broker: FakeBroker) -> Self {
        Self {
            broker,
            closed: Arc::new(AtomicBool::new(false)),
            unacked: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drops the session the way a broker does: unacked messages go back to
    /// the head of their queue and every consumer stream ends.
    fn shut(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending: Vec<Unacked> = self.unacked.lock().unwrap().drain(..).collect();
        for slot in pending {
            if let Some((queue, message)) = slot.lock().unwrap().take() {
                self.broker.requeue(&queue, message);
            }
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            Err(anyhow!("channel closed"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerSession for FakeSession {
    async fn declare_exchange(&self, name: &str) -> Result<(), Error> {
        self.ensure_open()?;
        self.broker.with_state(|s| {
            if !s.exchanges.iter().any(|e| e == name) {
                s.exchanges.push(name.to_string());
            }
            s.declarations.push(format!("exchange:{}", name));
        });
        Ok(())
    }

    async fn declare_queue(&self, name: &str, arguments: QueueArguments) -> Result<(), Error> {
        self.ensure_open()?;
        self.broker.with_state(|s| {
            if let Some(existing) = s.queues.get(name) {
                if existing.arguments != arguments {
                    return Err(anyhow!(
                        "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                        name
                    ));
                }
            } else {
                s.queues.insert(
                    name.to_string(),
                    FakeQueue {
                        arguments,
                        messages: VecDeque::new(),
                    },
                );
            }
            s.declarations.push(format!("queue:{}", name));
            Ok(())
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        self.broker.with_state(|s| {
            let binding = (
                queue.to_string(),
                exchange.to_string(),
                routing_key.to_string(),
            );
            if !s.bindings.contains(&binding) {
                s.bindings.push(binding);
            }
            s.declarations.push(format!("bind:{}->{}", queue, exchange));
        });
        Ok(())
    }

    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<(), Error> {
        self.ensure_open()?;
        self.broker.with_state(|s| {
            if s.fail_publish {
                return Err(anyhow!("publish refused"));
            }
            if let Some(q) = s.queues.get_mut(queue) {
                q.messages.push_back(StoredMessage {
                    payload: message.payload,
                    redelivered: false,
                });
            }
            Ok(())
        })
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, Error> {
        self.ensure_open()?;

        let broker = self.broker.clone();
        let closed = Arc::clone(&self.closed);
        let unacked = Arc::clone(&self.unacked);
        let queue = queue.to_string();

        let deliveries = stream::unfold((), move |()| {
            let broker = broker.clone();
            let closed = Arc::clone(&closed);
            let unacked = Arc::clone(&unacked);
            let queue = queue.clone();
            async move {
                loop {
                    if closed.load(Ordering::SeqCst) {
                        return None;
                    }

                    let next = broker.with_state(|s| {
                        s.queues.get_mut(&queue).and_then(|q| q.messages.pop_front())
                    });

                    if let Some(message) = next {
                        let slot: Unacked =
                            Arc::new(Mutex::new(Some((queue.clone(), message.clone()))));
                        unacked.lock().unwrap().push(Arc::clone(&slot));

                        let delivery = Delivery {
                            data: message.payload,
                            redelivered: message.redelivered,
                            acker: Box::new(FakeAcker {
                                broker: broker.clone(),
                                closed: Arc::clone(&closed),
                                slot,
                            }),
                        };
                        return Some((Ok(delivery), ()));
                    }

                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        });

        Ok(deliveries.boxed())
    }

    async fn close(&self) -> Result<(), Error> {
        self.ensure_open()?;
        self.shut();
        Ok(())
    }
}

struct FakeAcker {
    broker: FakeBroker,
    closed: Arc<AtomicBool>,
    slot: Unacked,
}

impl FakeAcker {
    fn take(&self) -> Result<(String, StoredMessage), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(anyhow!("channel closed"));
        }
        self.slot
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("delivery already settled"))
    }
}

#[async_trait]
impl Acknowledge for FakeAcker {
    async fn ack(&self) -> Result<(), Error> {
        self.take()?;
        self.broker.with_state(|s| s.acks += 1);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), Error> {
        let (queue, message) = self.take()?;
        self.broker.with_state(|s| s.rejects.push(requeue));
        if requeue {
            self.broker.requeue(&queue, message);
        } else {
            self.broker.dead_letter(&queue, message);
        }
        Ok(())
    }
}

struct CurrentLink {
    session: Arc<FakeSession>,
    closed_tx: mpsc::UnboundedSender<String>,
}

/// Hands out sessions on a [`FakeBroker`] and lets tests fail connection
/// attempts or sever the live session.
pub struct FakeConnector {
    broker: FakeBroker,
    connects: AtomicUsize,
    failures_remaining: AtomicUsize,
    current: Mutex<Option<CurrentLink>>,
}

impl FakeConnector {
    pub fn new(broker: FakeBroker) -> Arc<Self> {
        Arc::new(Self {
            broker,
            connects: AtomicUsize::new(0),
            failures_remaining: AtomicUsize::new(0),
            current: Mutex::new(None),
        })
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, attempts: usize) {
        self.failures_remaining.store(attempts, Ordering::SeqCst);
    }

    pub fn current_session(&self) -> Option<Arc<FakeSession>> {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .map(|link| Arc::clone(&link.session))
    }

    /// Simulates an unexpected closure of the live connection.
    pub fn sever(&self, reason: &str) {
        if let Some(link) = self.current.lock().unwrap().take() {
            link.session.shut();
            let _ = link.closed_tx.send(reason.to_string());
        }
    }
}

#[async_trait]
impl BrokerConnector for FakeConnector {
    async fn connect(&self) -> Result<BrokerLink, Error> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!("connection refused"));
        }

        let session = Arc::new(FakeSession::new(self.broker.clone()));
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();

        *self.current.lock().unwrap() = Some(CurrentLink {
            session: Arc::clone(&session),
            closed_tx,
        });

        Ok(BrokerLink {
            session,
            closed: closed_rx,
        })
    }
}

// ---------------------------------------------------------------------------
// Repository and cache
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryRepository {
    records: Mutex<HashMap<Uuid, Notification>>,
    history: Mutex<Vec<(Uuid, NotificationStatus)>>,
    status_reads: AtomicUsize,
}

impl InMemoryRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn status_reads(&self) -> usize {
        self.status_reads.load(Ordering::SeqCst)
    }

    /// Every status written for `id`, in order, starting with the created row.
    pub fn history(&self, id: Uuid) -> Vec<NotificationStatus> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|(note_id, _)| *note_id == id)
            .map(|(_, status)| *status)
            .collect()
    }

    pub fn stored_status(&self, id: Uuid) -> Option<NotificationStatus> {
        self.records.lock().unwrap().get(&id).map(|n| n.status)
    }
}

#[async_trait]
impl NotificationRepository for InMemoryRepository {
    async fn create(&self, notification: &Notification) -> Result<Uuid, Error> {
        let mut record = notification.clone();
        record.status = NotificationStatus::Created;
        self.records.lock().unwrap().insert(record.id, record);
        self.history
            .lock()
            .unwrap()
            .push((notification.id, NotificationStatus::Created));
        Ok(notification.id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notification>, Error> {
        Ok(self.records.lock().unwrap().get(&id).cloned())
    }

    async fn status(&self, id: Uuid) -> Result<Option<NotificationStatus>, Error> {
        self.status_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.stored_status(id))
    }

    async fn set_status(&self, id: Uuid, status: NotificationStatus) -> Result<(), Error> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(&id)
            .ok_or_else(|| anyhow!("Notification {} not found", id))?;
        record.status = status;
        self.history.lock().unwrap().push((id, status));
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid) -> Result<NotificationStatus, Error> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(&id)
            .ok_or_else(|| anyhow!("Notification {} not found", id))?;
        if !record.status.is_terminal() {
            record.status = NotificationStatus::Failed;
            self.history.lock().unwrap().push((id, NotificationStatus::Failed));
        }
        Ok(record.status)
    }

    async fn cancel(&self, id: Uuid) -> Result<(), Error> {
        self.set_status(id, NotificationStatus::Canceled).await
    }

    async fn list_all(&self) -> Result<Vec<Notification>, Error> {
        let mut all: Vec<Notification> = self.records.lock().unwrap().values().cloned().collect();
        all.sort_by_key(|n| n.created_at);
        Ok(all)
    }

    async fn health_check(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, (String, Duration)>>,
    unavailable: AtomicBool,
}

impl InMemoryCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn entry(&self, key: &str) -> Option<(String, Duration)> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    pub fn insert_raw(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (value.to_string(), Duration::from_secs(60)));
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    fn ensure_available(&self) -> Result<(), Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(anyhow!("cache unavailable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), Error> {
        self.ensure_available()?;
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (value.to_string(), ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        self.ensure_available()?;
        Ok(self.entries.lock().unwrap().get(key).map(|(v, _)| v.clone()))
    }

    async fn health_check(&self) -> Result<(), Error> {
        self.ensure_available()
    }
}

// ---------------------------------------------------------------------------
// Senders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SentMessage {
    pub message: String,
    pub destination: String,
    pub at: DateTime<Utc>,
}

/// Records every invocation; fails the first `failures` of them, or all of
/// them when `failures` is `usize::MAX`.
pub struct RecordingSender {
    channel: Channel,
    failures: usize,
    delay: Option<Duration>,
    calls: Mutex<Vec<SentMessage>>,
}

impl RecordingSender {
    pub fn new(channel: Channel) -> Arc<Self> {
        Self::build(channel, 0, None)
    }

    pub fn failing(channel: Channel, failures: usize) -> Arc<Self> {
        Self::build(channel, failures, None)
    }

    pub fn slow(channel: Channel, delay: Duration) -> Arc<Self> {
        Self::build(channel, 0, Some(delay))
    }

    pub fn slow_failing(channel: Channel, delay: Duration, failures: usize) -> Arc<Self> {
        Self::build(channel, failures, Some(delay))
    }

    fn build(channel: Channel, failures: usize, delay: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            channel,
            failures,
            delay,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<SentMessage> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ChannelSender for RecordingSender {
    async fn send(
        &self,
        ctx: &CancellationToken,
        message: &str,
        destination: &str,
    ) -> Result<(), SendError> {
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(SentMessage {
                message: message.to_string(),
                destination: destination.to_string(),
                at: Utc::now(),
            });
            calls.len()
        };

        let delay = self.delay;
        run_detached(ctx, async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(())
        })
        .await?;

        if attempt <= self.failures {
            return Err(SendError::Transport(anyhow!("delivery failed (attempt {})", attempt)));
        }
        Ok(())
    }

    fn channel(&self) -> Channel {
        self.channel.clone()
    }
}

/// Sleeps through `delay` without looking at the cancellation token, then
/// flags completion.
pub struct StubbornSender {
    delay: Duration,
    started: AtomicBool,
    finished: AtomicBool,
}

impl StubbornSender {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        })
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelSender for StubbornSender {
    async fn send(
        &self,
        _ctx: &CancellationToken,
        _message: &str,
        _destination: &str,
    ) -> Result<(), SendError> {
        self.started.store(true, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn channel(&self) -> Channel {
        Channel::Email
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub struct Harness {
    pub broker: FakeBroker,
    pub connector: Arc<FakeConnector>,
    pub connection: Arc<ConnectionManager>,
    pub repository: Arc<InMemoryRepository>,
    pub cache: Arc<InMemoryCache>,
    pub tracker: Arc<StatusTracker>,
    pub notifier: Arc<NotificationBroker>,
    pub cancel: CancellationToken,
}

impl Harness {
    pub async fn start() -> Result<Self> {
        Self::start_on(FakeBroker::new()).await
    }

    pub async fn start_on(broker: FakeBroker) -> Result<Self> {
        Self::build(broker, Duration::from_secs(5)).await
    }

    pub async fn start_with_shutdown_timeout(shutdown_timeout: Duration) -> Result<Self> {
        Self::build(FakeBroker::new(), shutdown_timeout).await
    }

    async fn build(broker: FakeBroker, shutdown_timeout: Duration) -> Result<Self> {
        let connector = FakeConnector::new(broker.clone());
        let cancel = CancellationToken::new();

        let connection = ConnectionManager::connect(
            connector.clone(),
            test_topology(),
            RECONNECT_INTERVAL,
            &cancel,
        )
        .await?;

        let repository = InMemoryRepository::new();
        let cache = InMemoryCache::new();
        let tracker = Arc::new(StatusTracker::new(
            repository.clone(),
            cache.clone(),
            Duration::from_secs(300),
        ));

        let notifier = Arc::new(NotificationBroker::new(
            Arc::clone(&connection),
            Arc::clone(&tracker),
            Duration::from_secs(1),
            shutdown_timeout,
            &cancel,
        ));

        Ok(Self {
            broker,
            connector,
            connection,
            repository,
            cache,
            tracker,
            notifier,
            cancel,
        })
    }

    pub fn service(&self) -> NotificationService {
        NotificationService::new(
            self.repository.clone(),
            Arc::clone(&self.tracker),
            Arc::clone(&self.notifier),
        )
    }

    /// Stores `notification` as created and publishes it, bypassing the
    /// service's schedule validation.
    pub async fn enqueue(&self, notification: &Notification) -> Result<()> {
        self.repository.create(notification).await?;
        self.notifier.publish(notification).await
    }
}

pub fn email_notification(send_at: DateTime<Utc>) -> Notification {
    Notification::new("Your order shipped", "x@y.com", Channel::Email, send_at)
}
