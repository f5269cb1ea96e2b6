use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use petgraph::dot::Dot;
use petgraph::graph::{DiGraph, NodeIndex};
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::core::errors::{RagError, Result};
use crate::pubsub::message::{Message, Payload, TraceId};

/// Receives messages addressed to the name it was subscribed under.
///
/// Returning `Err` (or panicking) counts as a delivery fault: it is logged and
/// counted by the bus, and never reaches the publisher.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: &Message) -> anyhow::Result<()>;
}

/// Adapts a synchronous closure into a [`MessageHandler`]
pub struct FnHandler<F>(F);

impl<F> FnHandler<F>
where
    F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
{
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        (self.0)(message)
    }
}

type HandlerList = Arc<RwLock<Vec<Arc<dyn MessageHandler>>>>;

struct Mailbox {
    tx: mpsc::UnboundedSender<Message>,
    handlers: HandlerList,
}

/// Counters shared with the mailbox workers
#[derive(Default)]
struct DeliveryStats {
    faults: AtomicU64,
    faults_by_receiver: DashMap<String, u64>,
    last_fault: Mutex<Option<(String, String)>>,
    undelivered: AtomicU64,
}

impl DeliveryStats {
    fn record_fault(&self, fault: &RagError) {
        let RagError::DeliveryFault { receiver, message } = fault else {
            return;
        };
        self.faults.fetch_add(1, Ordering::Relaxed);
        *self
            .faults_by_receiver
            .entry(receiver.clone())
            .or_insert(0) += 1;
        *self.last_fault.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((receiver.clone(), message.clone()));
    }
}

struct BusInner {
    history: RwLock<Vec<Message>>,
    mailboxes: DashMap<String, Mailbox>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<DeliveryStats>,
    closed: AtomicBool,
}

/// In-process publish/subscribe bus with an append-only history log.
///
/// Each receiver name owns a mailbox drained by a dedicated Tokio task, so
/// [`publish`](Self::publish) only records and enqueues the message and returns
/// without running any handler. Handlers registered for the same name run in
/// registration order, one message at a time, in publish order.
///
/// The bus is a cheap handle; clone it into every component that needs it.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

/// Non-owning handle to a [`MessageBus`].
///
/// Handlers stored inside the bus hold this instead of a clone, otherwise the
/// bus would keep itself alive through its own mailboxes.
#[derive(Clone)]
pub struct WeakMessageBus {
    inner: Weak<BusInner>,
}

impl WeakMessageBus {
    /// The bus, unless every owning handle has been dropped
    pub fn upgrade(&self) -> Option<MessageBus> {
        self.inner.upgrade().map(|inner| MessageBus { inner })
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                history: RwLock::new(Vec::new()),
                mailboxes: DashMap::new(),
                workers: Mutex::new(Vec::new()),
                stats: Arc::new(DeliveryStats::default()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakMessageBus {
        WeakMessageBus {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Registers `handler` for every message whose receiver is `name`.
    ///
    /// The first subscription for a name spawns its mailbox worker, so this
    /// must be called from inside a Tokio runtime.
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let name = name.into();
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RagError::runtime(format!(
                "cannot subscribe {name}: bus is shut down"
            )));
        }

        match self.inner.mailboxes.entry(name.clone()) {
            Entry::Occupied(entry) => {
                let mut handlers = entry
                    .get()
                    .handlers
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                handlers.push(handler);
                debug!(receiver = %name, handlers = handlers.len(), "Added handler to mailbox");
            }
            Entry::Vacant(entry) => {
                let runtime = Handle::try_current().map_err(|e| {
                    RagError::runtime(format!("subscribing {name} needs a Tokio runtime: {e}"))
                })?;
                let (tx, rx) = mpsc::unbounded_channel();
                let handlers: HandlerList = Arc::new(RwLock::new(vec![handler]));
                let worker = runtime.spawn(run_mailbox(
                    name.clone(),
                    rx,
                    handlers.clone(),
                    self.inner.stats.clone(),
                ));
                entry.insert(Mailbox { tx, handlers });
                self.inner
                    .workers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(worker);
                info!(receiver = %name, "Mailbox created");
            }
        }
        Ok(())
    }

    /// Subscribes a synchronous closure
    pub fn subscribe_fn<F>(&self, name: impl Into<String>, f: F) -> Result<()>
    where
        F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(name, Arc::new(FnHandler::new(f)))
    }

    /// Appends `message` to the history log and enqueues it for its receiver.
    ///
    /// The append happens even when nobody is subscribed under the receiver's
    /// name or the bus is shut down; such messages are counted as undelivered.
    pub fn publish(&self, message: Message) {
        let receiver = message.receiver().to_string();
        let kind = message.kind();
        let trace = message.trace().clone();

        let delivered = {
            let mut history = self
                .inner
                .history
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let delivered = if self.inner.closed.load(Ordering::Acquire) {
                false
            } else {
                match self.inner.mailboxes.get(&receiver) {
                    Some(mailbox) => mailbox.tx.send(message.clone()).is_ok(),
                    None => false,
                }
            };
            history.push(message);
            delivered
        };

        if delivered {
            debug!(receiver = %receiver, kind = %kind, trace = %trace, "Message enqueued");
        } else {
            self.inner.stats.undelivered.fetch_add(1, Ordering::Relaxed);
            debug!(receiver = %receiver, kind = %kind, trace = %trace, "No subscriber for message");
        }
    }

    /// Creates a message under a freshly generated trace
    pub fn create(
        &self,
        sender: impl Into<String>,
        receiver: impl Into<String>,
        payload: Payload,
    ) -> Message {
        Message::new(sender, receiver, TraceId::generate(), payload)
    }

    /// Creates a message under an existing trace
    pub fn create_with_trace(
        &self,
        sender: impl Into<String>,
        receiver: impl Into<String>,
        trace: TraceId,
        payload: Payload,
    ) -> Message {
        Message::new(sender, receiver, trace, payload)
    }

    /// Full log, or only the messages of `trace`, in publish order
    pub fn history(&self, trace: Option<&TraceId>) -> Vec<Message> {
        let history = self
            .inner
            .history
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match trace {
            Some(trace) => history
                .iter()
                .filter(|m| m.trace() == trace)
                .cloned()
                .collect(),
            None => history.clone(),
        }
    }

    pub fn history_len(&self) -> usize {
        self.inner
            .history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Names with at least one handler, sorted
    pub fn receivers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .mailboxes
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Handler failures caught at the bus boundary since creation
    pub fn delivery_faults(&self) -> u64 {
        self.inner.stats.faults.load(Ordering::Relaxed)
    }

    pub fn delivery_faults_for(&self, receiver: &str) -> u64 {
        self.inner
            .stats
            .faults_by_receiver
            .get(receiver)
            .map(|count| *count)
            .unwrap_or(0)
    }

    /// Most recent handler failure, as a [`RagError::DeliveryFault`]
    pub fn last_fault(&self) -> Option<RagError> {
        self.inner
            .stats
            .last_fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .map(|(receiver, message)| RagError::delivery_fault(receiver, message))
    }

    /// Messages that had no mailbox to go to
    pub fn undelivered(&self) -> u64 {
        self.inner.stats.undelivered.load(Ordering::Relaxed)
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Closes every mailbox and waits for the workers to drain what they
    /// already hold.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.mailboxes.clear();
        let workers: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .inner
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Mailbox worker ended abnormally");
            }
        }
        info!("Message bus shut down");
    }

    /// Renders the message flow of one trace as Graphviz DOT.
    ///
    /// Components become nodes; every message becomes an edge labelled with
    /// its position in the trace and its kind.
    pub fn trace_dot(&self, trace: &TraceId) -> String {
        let messages = self.history(Some(trace));
        let mut graph: DiGraph<String, String> = DiGraph::new();
        let mut nodes: HashMap<String, NodeIndex> = HashMap::new();

        for (seq, message) in messages.iter().enumerate() {
            let from = *nodes
                .entry(message.sender().to_string())
                .or_insert_with(|| graph.add_node(message.sender().to_string()));
            let to = *nodes
                .entry(message.receiver().to_string())
                .or_insert_with(|| graph.add_node(message.receiver().to_string()));
            graph.add_edge(from, to, format!("{}: {}", seq + 1, message.kind()));
        }

        format!("{}", Dot::new(&graph))
    }
}

async fn run_mailbox(
    receiver: String,
    mut rx: mpsc::UnboundedReceiver<Message>,
    handlers: HandlerList,
    stats: Arc<DeliveryStats>,
) {
    debug!(receiver = %receiver, "Mailbox worker started");
    while let Some(message) = rx.recv().await {
        let snapshot: Vec<Arc<dyn MessageHandler>> = handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for (index, handler) in snapshot.iter().enumerate() {
            let outcome = AssertUnwindSafe(handler.handle(&message))
                .catch_unwind()
                .await;
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{e:#}")),
                Err(panic) => Some(panic_message(panic.as_ref())),
            };
            if let Some(reason) = failure {
                let fault = RagError::delivery_fault(receiver.as_str(), reason);
                stats.record_fault(&fault);
                error!(
                    receiver = %receiver,
                    handler = index,
                    kind = %message.kind(),
                    trace = %message.trace(),
                    error = %fault,
                    "Delivery fault"
                );
            }
        }
    }
    debug!(receiver = %receiver, "Mailbox worker stopped");
}

/// Best-effort text of a caught panic
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
