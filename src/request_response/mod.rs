//! Request/response correlation over a pair of AMQP links.
//!
//! A [`RequestResponseClient`] owns a sender to the remote node and a
//! receiver for the node's replies. Requests are stamped with a monotonic
//! message id and a reply-to address, inserted into a correlation map, and
//! resolved when a response with the matching correlation id arrives.
//!
//! All map mutations and link operations run serialized on a drainer
//! appointed through the [`WorkQueue`] handoff protocol, so no lock is held
//! across a work item and the stack's receive path never blocks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use fe2o3_amqp_types::messaging::{MessageId, Outcome, Properties};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::constants::{INITIAL_CREDIT, REPLY_TO_SUFFIX};
use crate::endpoint::{AmqpMessage, Connection, ReceiverLink, Session, SenderLink};
use crate::error::Error;
use crate::util::WorkQueue;

mod slot;
use slot::RequestSlot;

/// Client side of a request/response node pair.
///
/// Cloning is shallow; all clones share the same links and correlation map.
#[derive(Clone)]
pub struct RequestResponseClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for RequestResponseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestResponseClient")
            .field("node_addr", &self.inner.node_addr)
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

enum WorkItem {
    /// Ensure links, insert the slot into the map and send the request
    Start {
        slot: Arc<RequestSlot>,
        request: AmqpMessage,
    },
    /// A response arrived on the receiver
    Complete { response: AmqpMessage },
    /// A slot reached a terminal state off the serializer; remove it from
    /// the map and resolve its sink here
    Finish { slot: Arc<RequestSlot> },
    /// Cancel every outstanding slot and tear the links down
    Close,
}

struct ClientInner {
    node_addr: String,
    reply_to_addr: String,
    connection: Arc<dyn Connection>,
    next_request_id: AtomicU64,
    closed: AtomicBool,
    queue: WorkQueue<WorkItem>,
    // Only ever locked by the appointed drainer; the mutex satisfies the
    // compiler, the handoff protocol provides the exclusion.
    state: tokio::sync::Mutex<ClientState>,
}

#[derive(Default)]
struct ClientState {
    slots: HashMap<String, Arc<RequestSlot>>,
    links: Option<LinkTrio>,
}

/// Session and links as one unit. Any closed member condemns the whole
/// trio and the next request rebuilds it from scratch.
struct LinkTrio {
    session: Box<dyn Session>,
    sender: Box<dyn SenderLink>,
    /// Receive loop owning the receiver link
    pump: JoinHandle<()>,
    /// Cooperative stop signal for the pump; never abort a task that might
    /// currently be the drainer
    stop: CancellationToken,
}

impl LinkTrio {
    fn is_healthy(&self) -> bool {
        !self.sender.is_closed() && !self.pump.is_finished()
    }

    async fn teardown(mut self) {
        self.stop.cancel();
        if let Err(error) = self.session.end().await {
            tracing::debug!(?error, "ending the request/response session failed");
        }
    }
}

impl RequestResponseClient {
    /// Creates a client for the node at `node_addr`. Links are attached
    /// lazily by the first request and re-attached after transient failures.
    pub fn new(connection: Arc<dyn Connection>, node_addr: impl Into<String>) -> Self {
        let node_addr = node_addr.into();
        let reply_to_addr = format!("{}{}", node_addr, REPLY_TO_SUFFIX);
        Self {
            inner: Arc::new(ClientInner {
                node_addr,
                reply_to_addr,
                connection,
                next_request_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                queue: WorkQueue::new(),
                state: tokio::sync::Mutex::new(ClientState::default()),
            }),
        }
    }

    /// Address of the remote node
    pub fn node_addr(&self) -> &str {
        &self.inner.node_addr
    }

    /// Send a request and wait for the correlated response.
    ///
    /// The request must not carry a `message-id` or `reply-to`; both are
    /// stamped here. Fails with [`Error::Disposed`] after [`close`](Self::close)
    /// and with [`Error::InvalidOperation`] when the underlying connection
    /// is closed or the properties are pre-set.
    pub async fn send_request(
        &self,
        mut request: AmqpMessage,
        ct: &CancellationToken,
    ) -> Result<AmqpMessage, Error> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Disposed);
        }
        if self.inner.connection.is_closed() {
            return Err(Error::InvalidOperation("the underlying connection is closed"));
        }
        if let Some(properties) = &request.properties {
            if properties.message_id.is_some() {
                return Err(Error::InvalidOperation("request already carries a message-id"));
            }
            if properties.reply_to.is_some() {
                return Err(Error::InvalidOperation("request already carries a reply-to"));
            }
        }

        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let message_id = format!("{}-{}", self.inner.node_addr, request_id);
        let properties = request.properties.get_or_insert_with(Properties::default);
        properties.message_id = Some(MessageId::String(message_id.clone()));
        properties.reply_to = Some(self.inner.reply_to_addr.clone());

        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(RequestSlot::new(message_id, tx));
        self.spawn_cancel_watcher(&slot, ct);
        self.inner.post(WorkItem::Start { slot, request }).await;

        rx.await.unwrap_or(Err(Error::Cancelled))
    }

    /// Cancel every outstanding request and tear the links down
    pub async fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.post(WorkItem::Close).await;
        }
    }

    /// Registers a watcher that cancels the slot when `ct` fires. The
    /// watcher exits on the slot's done token so the registration never
    /// outlives the request.
    fn spawn_cancel_watcher(&self, slot: &Arc<RequestSlot>, ct: &CancellationToken) {
        let ct = ct.clone();
        let done = slot.done_token();
        let slot = Arc::clone(slot);
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = done.cancelled() => {}
                _ = ct.cancelled() => {
                    if slot.mark_cancelled() {
                        match inner.upgrade() {
                            Some(inner) => inner.post(WorkItem::Finish { slot }).await,
                            None => slot.resolve(),
                        }
                    }
                }
            }
        });
    }
}

impl ClientInner {
    async fn post(self: &Arc<Self>, item: WorkItem) {
        if self.queue.post(item) {
            self.drain().await;
        }
    }

    /// Runs the drainer protocol: pop and execute until the settled counter
    /// is no longer positive. Work item errors are logged and dropped; the
    /// queue must never wedge.
    async fn drain(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        loop {
            let mut executed = 0usize;
            while let Some(item) = self.queue.pop() {
                executed += 1;
                if let Err(error) = self.process(&mut state, item).await {
                    tracing::error!(?error, "request/response work item failed");
                }
            }
            if self.queue.settle(executed) <= 0 {
                break;
            }
        }
    }

    async fn process(
        self: &Arc<Self>,
        state: &mut ClientState,
        item: WorkItem,
    ) -> Result<(), Error> {
        match item {
            WorkItem::Start { slot, request } => self.process_start(state, slot, request).await,
            WorkItem::Complete { response } => {
                Self::process_complete(state, response);
                Ok(())
            }
            WorkItem::Finish { slot } => {
                state.slots.remove(slot.message_id());
                slot.resolve();
                Ok(())
            }
            WorkItem::Close => self.process_close(state).await,
        }
    }

    async fn process_start(
        self: &Arc<Self>,
        state: &mut ClientState,
        slot: Arc<RequestSlot>,
        request: AmqpMessage,
    ) -> Result<(), Error> {
        // The body runs even for a slot that is already terminal (a
        // cancellation registration may have fired before the serializer
        // got here): the request may still reach the peer, and the
        // self-clean below keeps the terminal slot out of the map so its
        // response, if any, is dropped as unknown.
        match self.ensure_links(state).await {
            Ok(true) => {
                state
                    .slots
                    .insert(slot.message_id().to_string(), Arc::clone(&slot));
                let trio = match state.links.as_mut() {
                    Some(trio) => trio,
                    None => {
                        slot.mark_cancelled();
                        state.slots.remove(slot.message_id());
                        slot.resolve();
                        return Ok(());
                    }
                };
                match trio.sender.send(request).await {
                    Ok(Outcome::Accepted(_)) => {}
                    Ok(outcome) => {
                        if slot.mark_failed(Error::NotAccepted(Box::new(outcome))) {
                            state.slots.remove(slot.message_id());
                            slot.resolve();
                        }
                    }
                    Err(error) => {
                        if slot.mark_failed(error) {
                            state.slots.remove(slot.message_id());
                            slot.resolve();
                        }
                    }
                }
                if !slot.is_pending() {
                    // terminal before or during the send; a Finish item that
                    // already ran removed nothing, so clean up here
                    state.slots.remove(slot.message_id());
                    slot.resolve();
                }
            }
            // The client or the connection is going away
            Ok(false) => {
                if slot.mark_cancelled() {
                    slot.resolve();
                }
            }
            Err(error) => {
                if slot.mark_failed(error) {
                    slot.resolve();
                }
            }
        }
        Ok(())
    }

    fn process_complete(state: &mut ClientState, response: AmqpMessage) {
        let correlation_id = response
            .properties
            .as_ref()
            .and_then(|properties| properties.correlation_id.as_ref());
        let correlation_id = match correlation_id {
            Some(MessageId::String(id)) => id.clone(),
            _ => {
                tracing::debug!("response without a string correlation-id dropped");
                return;
            }
        };
        match state.slots.get(&correlation_id).cloned() {
            Some(slot) => {
                if slot.mark_completed(response) {
                    state.slots.remove(&correlation_id);
                    slot.resolve();
                }
                // otherwise the slot is already terminal and its Finish
                // item will clean up; the response is dropped
            }
            None => {
                tracing::debug!(%correlation_id, "response for an unknown request dropped");
            }
        }
    }

    async fn process_close(self: &Arc<Self>, state: &mut ClientState) -> Result<(), Error> {
        for (_, slot) in state.slots.drain() {
            slot.mark_cancelled();
            slot.resolve();
        }
        if let Some(trio) = state.links.take() {
            trio.teardown().await;
        }
        Ok(())
    }

    /// Re-attach policy: absent or partially torn down links are rebuilt as
    /// a whole. Returns `Ok(false)` when the client or the connection is
    /// closed, in which case the caller cancels rather than fails the slot.
    async fn ensure_links(self: &Arc<Self>, state: &mut ClientState) -> Result<bool, Error> {
        if self.closed.load(Ordering::Acquire) || self.connection.is_closed() {
            return Ok(false);
        }
        if let Some(trio) = &state.links {
            if trio.is_healthy() {
                return Ok(true);
            }
        }
        if let Some(trio) = state.links.take() {
            trio.teardown().await;
        }

        let mut session = self.connection.begin_session().await?;
        let sender = session
            .attach_sender(&format!("{}-request-sender", self.node_addr), &self.node_addr)
            .await?;
        let receiver = session
            .attach_receiver(
                &format!("{}-response-receiver", self.node_addr),
                &self.node_addr,
                &self.reply_to_addr,
                INITIAL_CREDIT,
            )
            .await?;
        let stop = CancellationToken::new();
        let pump = self.spawn_pump(receiver, stop.clone());
        state.links = Some(LinkTrio {
            session,
            sender,
            pump,
            stop,
        });
        tracing::debug!(node = %self.node_addr, "request/response links attached");
        Ok(true)
    }

    /// Receive loop. Runs on the stack's delivery path: accept immediately,
    /// then hand the response over to the serializer.
    fn spawn_pump(
        self: &Arc<Self>,
        mut receiver: Box<dyn ReceiverLink>,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        let inner = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let delivery = tokio::select! {
                    _ = stop.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(delivery) => delivery,
                        Err(_) => break,
                    },
                };
                if let Err(error) = receiver.accept(&delivery).await {
                    tracing::debug!(?error, "accepting a response delivery failed");
                }
                let Some(inner) = inner.upgrade() else { break };
                inner
                    .post(WorkItem::Complete {
                        response: delivery.into_message(),
                    })
                    .await;
            }
        })
    }
}
