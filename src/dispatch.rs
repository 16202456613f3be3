//! Notification listener and dispatcher (spec section 4.5): reads the
//! notify socket, normalises frames, and fans them out to registered
//! callbacks through a bounded, coalescing internal event queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;

use crate::codec::{self, InboundFrame};
use crate::model::{EndpointRole, PropertyEvent};
use crate::transport::SocketManager;

const EVENT_QUEUE_CAPACITY: usize = 256;

/// A dispatched event, passed to both per-property and wildcard callbacks.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    Property(PropertyEvent),
    SequenceGap { expected: u32, actual: u32 },
    Opaque { root: String, raw: String },
}

/// Handle returned by [`Dispatcher::on_property`] / [`Dispatcher::on_any`].
/// Dropping it does not unregister; call [`Registration::cancel`] explicitly,
/// mirroring the teacher crate's explicit-unsubscribe handles.
pub struct Registration {
    id: u64,
    key: RegistrationKey,
    dispatcher: Arc<Inner>,
}

impl Registration {
    pub async fn cancel(self) {
        self.dispatcher.unregister(&self.key, self.id).await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RegistrationKey {
    Property(String),
    Wildcard,
}

/// Coalescing key for the internal event queue. Property events with the
/// same name coalesce onto each other; everything else queues independently
/// (spec 4.5).
#[derive(Debug, Clone, PartialEq, Eq)]
enum QueueKey {
    Property(String),
    Other,
}

struct QueueItem {
    key: QueueKey,
    event: DispatchEvent,
}

type Callback = Box<dyn Fn(DispatchEvent) + Send + Sync + 'static>;

/// Bounded event queue. Normally every event queues independently; only once
/// the queue is full does it fall back to coalescing a same-property event
/// onto one already queued (and failing that, dropping the oldest item) —
/// spec 4.5's backpressure policy, not an unconditional dedup.
struct EventQueue {
    items: Mutex<VecDeque<QueueItem>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl EventQueue {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(EVENT_QUEUE_CAPACITY)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    async fn push(&self, key: QueueKey, event: DispatchEvent) {
        let mut items = self.items.lock().await;
        if items.len() >= EVENT_QUEUE_CAPACITY {
            if let QueueKey::Property(name) = &key {
                if let Some(slot) = items.iter_mut().find(|item| {
                    matches!(&item.key, QueueKey::Property(existing) if existing == name)
                }) {
                    slot.event = event;
                    return;
                }
            }
            items.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        items.push_back(QueueItem { key, event });
        drop(items);
        self.notify.notify_one();
    }

    /// Pop the next event, or `None` once `closed` fires.
    async fn pop(&self, closed: &Notify) -> Option<DispatchEvent> {
        loop {
            {
                let mut items = self.items.lock().await;
                if let Some(item) = items.pop_front() {
                    return Some(item.event);
                }
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = closed.notified() => return None,
            }
        }
    }

    fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct Inner {
    callbacks: RwLock<HashMap<RegistrationKey, HashMap<u64, Arc<Callback>>>>,
    next_id: AtomicU64,
    callback_timeout: Duration,
    sequence_gaps: AtomicU64,
    notifications_dispatched: AtomicU64,
    last_seq: Mutex<Option<u32>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    on_keepalive: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    on_goodbye: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    queue: EventQueue,
    closed: Notify,
}

impl Inner {
    async fn unregister(&self, key: &RegistrationKey, id: u64) {
        let mut cbs = self.callbacks.write().await;
        if let Some(map) = cbs.get_mut(key) {
            map.remove(&id);
        }
    }
}

/// Listens on the notify socket and dispatches parsed frames to registered
/// callbacks. One instance per connected session.
pub struct Dispatcher {
    inner: Arc<Inner>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(callback_timeout_ms: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                callbacks: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                callback_timeout: Duration::from_millis(callback_timeout_ms as u64),
                sequence_gaps: AtomicU64::new(0),
                notifications_dispatched: AtomicU64::new(0),
                last_seq: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                on_keepalive: Mutex::new(None),
                on_goodbye: Mutex::new(None),
                queue: EventQueue::new(),
                closed: Notify::new(),
            }),
            reader: Mutex::new(None),
        }
    }

    /// Install the hook invoked when an `emotivaKeepAlive` frame arrives on
    /// the notify channel. Call before [`Dispatcher::start`].
    pub async fn set_keepalive_hook(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.inner.on_keepalive.lock().await = Some(Arc::new(f));
    }

    /// Install the hook invoked when an `emotivaGoodbye` frame arrives on
    /// the notify channel. Call before [`Dispatcher::start`].
    pub async fn set_goodbye_hook(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.inner.on_goodbye.lock().await = Some(Arc::new(f));
    }

    pub fn on_property(
        &self,
        name: impl Into<String>,
        callback: impl Fn(DispatchEvent) + Send + Sync + 'static,
    ) -> RegistrationFuture<'_> {
        let key = RegistrationKey::Property(name.into());
        RegistrationFuture { dispatcher: &self.inner, key, callback: Some(Box::new(callback)) }
    }

    pub fn on_any(&self, callback: impl Fn(DispatchEvent) + Send + Sync + 'static) -> RegistrationFuture<'_> {
        RegistrationFuture { dispatcher: &self.inner, key: RegistrationKey::Wildcard, callback: Some(Box::new(callback)) }
    }

    pub fn notifications_dropped(&self) -> u64 {
        self.inner.queue.dropped_count()
    }

    pub fn sequence_gaps(&self) -> u64 {
        self.inner.sequence_gaps.load(Ordering::Relaxed)
    }

    pub fn notifications_dispatched(&self) -> u64 {
        self.inner.notifications_dispatched.load(Ordering::Relaxed)
    }

    /// Start the reader and worker loops against `sockets`'s notify
    /// endpoint. Idempotent: a second call while already running is a
    /// no-op.
    pub async fn start(&self, sockets: Arc<SocketManager>, max_xml_bytes: usize) {
        let mut reader = self.reader.lock().await;
        if reader.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let pump = tokio::spawn(async move {
            loop {
                match sockets.recv(EndpointRole::Notify, Duration::from_secs(3600)).await {
                    Ok(datagram) => enqueue_frame(&inner, &datagram.bytes, max_xml_bytes).await,
                    Err(_) => break,
                }
            }
        });

        let inner2 = Arc::clone(&self.inner);
        let worker = tokio::spawn(async move {
            while let Some(event) = inner2.queue.pop(&inner2.closed).await {
                dispatch_event(&inner2, event).await;
            }
        });

        *reader = Some(pump);
        self.inner.tasks.lock().await.push(worker);
    }

    /// Stop the reader and drain dispatched tasks with a 2s bound
    /// (invariant I5).
    pub async fn stop(&self) {
        let mut reader = self.reader.lock().await;
        if let Some(handle) = reader.take() {
            handle.abort();
        }
        self.inner.closed.notify_waiters();
        let mut tasks = self.inner.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
        }
    }
}

pub struct RegistrationFuture<'a> {
    dispatcher: &'a Arc<Inner>,
    key: RegistrationKey,
    callback: Option<Callback>,
}

impl<'a> std::future::IntoFuture for RegistrationFuture<'a> {
    type Output = Registration;
    type IntoFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Registration> + Send + 'a>>;

    fn into_future(mut self) -> Self::IntoFuture {
        let dispatcher = Arc::clone(self.dispatcher);
        let key = self.key.clone();
        let callback = self.callback.take().expect("callback taken exactly once");
        Box::pin(async move {
            let id = dispatcher.next_id.fetch_add(1, Ordering::Relaxed);
            let mut cbs = dispatcher.callbacks.write().await;
            cbs.entry(key.clone())
                .or_insert_with(HashMap::new)
                .insert(id, Arc::new(callback));
            drop(cbs);
            Registration { id, key, dispatcher }
        })
    }
}

/// Parse one notify-channel datagram and push its constituent events onto
/// the coalescing queue, or invoke the keepalive/goodbye hooks directly
/// (those bypass the queue: they're liveness signals, not dispatched
/// events).
async fn enqueue_frame(inner: &Arc<Inner>, bytes: &[u8], max_xml_bytes: usize) {
    let frame = match codec::parse_inbound(bytes, max_xml_bytes) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(error = %e, "dropping malformed notification frame");
            return;
        }
    };

    match frame {
        InboundFrame::Notify { sequence, properties } => {
            check_sequence(inner, sequence).await;
            for prop in properties {
                let key = QueueKey::Property(prop.name.clone());
                inner.queue.push(key, DispatchEvent::Property(prop)).await;
            }
        }
        InboundFrame::Opaque { root, raw } => {
            inner.queue.push(QueueKey::Other, DispatchEvent::Opaque { root, raw }).await;
        }
        InboundFrame::KeepAlive => {
            if let Some(hook) = inner.on_keepalive.lock().await.clone() {
                hook();
            }
        }
        InboundFrame::Goodbye => {
            if let Some(hook) = inner.on_goodbye.lock().await.clone() {
                hook();
            }
        }
        other => {
            tracing::debug!(?other, "unexpected frame on notify channel, ignoring");
        }
    }
}

async fn check_sequence(inner: &Arc<Inner>, sequence: u32) {
    let mut last = inner.last_seq.lock().await;
    if let Some(prev) = *last {
        let expected = prev.wrapping_add(1);
        if sequence != expected && sequence != prev {
            inner.sequence_gaps.fetch_add(1, Ordering::Relaxed);
            inner
                .queue
                .push(QueueKey::Other, DispatchEvent::SequenceGap { expected, actual: sequence })
                .await;
        }
    }
    *last = Some(sequence);
}

fn registration_key_for(event: &DispatchEvent) -> RegistrationKey {
    match event {
        DispatchEvent::Property(p) => RegistrationKey::Property(p.name.clone()),
        DispatchEvent::SequenceGap { .. } | DispatchEvent::Opaque { .. } => RegistrationKey::Wildcard,
    }
}

/// Fan `event` out to its matching callbacks. Each callback invocation is
/// spawned as its own tracked task and this function returns as soon as
/// they're spawned — it does not wait for them to finish, so one slow or
/// hung callback never blocks dispatch of the next queued event (spec 4.5).
async fn dispatch_event(inner: &Arc<Inner>, event: DispatchEvent) {
    let key = registration_key_for(&event);
    let callbacks = {
        let cbs = inner.callbacks.read().await;
        let mut matched: Vec<Arc<Callback>> = Vec::new();
        if let Some(map) = cbs.get(&key) {
            matched.extend(map.values().cloned());
        }
        if key != RegistrationKey::Wildcard {
            if let Some(map) = cbs.get(&RegistrationKey::Wildcard) {
                matched.extend(map.values().cloned());
            }
        }
        matched
    };

    let mut tasks = inner.tasks.lock().await;
    tasks.retain(|t| !t.is_finished());
    for cb in callbacks {
        let event = event.clone();
        let timeout = inner.callback_timeout;
        let inner = Arc::clone(inner);
        let task = tokio::spawn(async move {
            let handle = tokio::task::spawn_blocking(move || cb(event));
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => {
                    inner.notifications_dispatched.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => tracing::warn!(error = %e, "callback task panicked"),
                Err(_) => tracing::warn!("callback exceeded callback_timeout_ms, abandoning"),
            }
        });
        tasks.push(task);
    }
}

impl PartialEq for RegistrationKey {
    fn eq(&self, other: &Self) -> bool {
        matches!(
            (self, other),
            (RegistrationKey::Wildcard, RegistrationKey::Wildcard)
        ) || match (self, other) {
            (RegistrationKey::Property(a), RegistrationKey::Property(b)) => a == b,
            _ => false,
        }
    }
}
impl Eq for RegistrationKey {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// `dispatch_event` only spawns callback tasks; await them directly
    /// (bypassing the 2s `stop()` drain bound) so tests can observe results.
    async fn drain_tasks(inner: &Arc<Inner>) {
        let mut tasks = inner.tasks.lock().await;
        for t in tasks.drain(..) {
            let _ = t.await;
        }
    }

    #[tokio::test]
    async fn registers_and_dispatches_property_event() {
        let dispatcher = Dispatcher::new(1000);
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let _reg = dispatcher
            .on_property("volume", move |_event| {
                count2.fetch_add(1, Ordering::Relaxed);
            })
            .await;

        let inner = Arc::clone(&dispatcher.inner);
        dispatch_event(
            &inner,
            DispatchEvent::Property(PropertyEvent {
                name: "volume".into(),
                value: "-20".into(),
                visible: true,
                seq: 1,
            }),
        )
        .await;
        drain_tasks(&inner).await;

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn sequence_gap_is_detected() {
        let dispatcher = Dispatcher::new(1000);
        let gaps = Arc::new(AtomicUsize::new(0));
        let gaps2 = Arc::clone(&gaps);
        let _reg = dispatcher
            .on_any(move |event| {
                if matches!(event, DispatchEvent::SequenceGap { .. }) {
                    gaps2.fetch_add(1, Ordering::Relaxed);
                }
            })
            .await;

        let inner = Arc::clone(&dispatcher.inner);
        check_sequence(&inner, 1).await;
        check_sequence(&inner, 2).await;
        check_sequence(&inner, 10).await;

        assert_eq!(dispatcher.sequence_gaps(), 1);

        // Drain the queued SequenceGap event through the real worker path.
        while let Some(event) = inner.queue.pop(&inner.closed).await {
            dispatch_event(&inner, event).await;
            break;
        }
        drain_tasks(&inner).await;
        assert_eq!(gaps.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn cancel_stops_future_dispatch() {
        let dispatcher = Dispatcher::new(1000);
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let reg = dispatcher
            .on_property("power", move |_| {
                count2.fetch_add(1, Ordering::Relaxed);
            })
            .await;
        reg.cancel().await;

        let inner = Arc::clone(&dispatcher.inner);
        dispatch_event(
            &inner,
            DispatchEvent::Property(PropertyEvent {
                name: "power".into(),
                value: "1".into(),
                visible: true,
                seq: 1,
            }),
        )
        .await;

        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    /// Below capacity, repeated events for the same property each queue
    /// independently — coalescing is a full-queue backpressure policy, not
    /// an unconditional dedup (spec 4.5).
    #[tokio::test]
    async fn below_capacity_same_property_events_all_queue() {
        let queue = EventQueue::new();
        for v in 0..10 {
            queue
                .push(
                    QueueKey::Property("volume".into()),
                    DispatchEvent::Property(PropertyEvent {
                        name: "volume".into(),
                        value: v.to_string(),
                        visible: true,
                        seq: v as u32,
                    }),
                )
                .await;
        }
        let items = queue.items.lock().await;
        assert_eq!(items.len(), 10);
        assert_eq!(queue.dropped_count(), 0);
    }

    /// Once the queue is full, a same-property event coalesces onto one
    /// already queued instead of forcing a drop of an unrelated item.
    #[tokio::test]
    async fn full_queue_coalesces_same_property_instead_of_dropping() {
        let queue = EventQueue::new();
        for i in 0..EVENT_QUEUE_CAPACITY {
            queue
                .push(
                    QueueKey::Property(format!("prop{i}")),
                    DispatchEvent::Property(PropertyEvent {
                        name: format!("prop{i}"),
                        value: "0".into(),
                        visible: true,
                        seq: 0,
                    }),
                )
                .await;
        }
        assert_eq!(queue.items.lock().await.len(), EVENT_QUEUE_CAPACITY);

        queue
            .push(
                QueueKey::Property("volume".into()),
                DispatchEvent::Property(PropertyEvent {
                    name: "volume".into(),
                    value: "1".into(),
                    visible: true,
                    seq: 1,
                }),
            )
            .await;
        queue
            .push(
                QueueKey::Property("volume".into()),
                DispatchEvent::Property(PropertyEvent {
                    name: "volume".into(),
                    value: "2".into(),
                    visible: true,
                    seq: 2,
                }),
            )
            .await;

        let items = queue.items.lock().await;
        assert_eq!(items.len(), EVENT_QUEUE_CAPACITY);
        assert_eq!(queue.dropped_count(), 1);
        let volume_items: Vec<_> = items
            .iter()
            .filter(|i| matches!(&i.key, QueueKey::Property(n) if n == "volume"))
            .collect();
        assert_eq!(volume_items.len(), 1);
        match &volume_items[0].event {
            DispatchEvent::Property(p) => assert_eq!(p.value, "2"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn distinct_properties_do_not_coalesce() {
        let queue = EventQueue::new();
        queue
            .push(
                QueueKey::Property("volume".into()),
                DispatchEvent::Property(PropertyEvent {
                    name: "volume".into(),
                    value: "1".into(),
                    visible: true,
                    seq: 1,
                }),
            )
            .await;
        queue
            .push(
                QueueKey::Property("power".into()),
                DispatchEvent::Property(PropertyEvent {
                    name: "power".into(),
                    value: "1".into(),
                    visible: true,
                    seq: 1,
                }),
            )
            .await;
        let items = queue.items.lock().await;
        assert_eq!(items.len(), 2);
    }
}
