//! Trait boundary to the underlying AMQP 1.0 stack.
//!
//! The crate does not implement framing, credit, delivery state or the
//! connection/session lifecycle. It consumes a pre-existing stack through
//! the traits below and only assumes the semantics the AMQP 1.0 spec
//! guarantees for them. Production code adapts its stack of choice; tests
//! drive the crate with in-memory doubles.

use async_trait::async_trait;
use fe2o3_amqp_types::{
    messaging::{Message, Outcome},
    performatives::Open,
    primitives::Value,
};

use crate::error::Error;

/// Message payload flowing across the boundary
pub type AmqpMessage = Message<Value>;

/// Handle to an opened AMQP connection
#[async_trait]
pub trait Connection: Send + Sync {
    /// Whether the connection has been closed. Once closed it never reopens;
    /// the CBS client drops its state with it.
    fn is_closed(&self) -> bool;

    /// Begin a new session on the connection
    async fn begin_session(&self) -> Result<Box<dyn Session>, Error>;
}

/// A session on which links can be attached
#[async_trait]
pub trait Session: Send + Sync {
    /// Attach a sender link with the given name and target address
    async fn attach_sender(&mut self, name: &str, target: &str)
        -> Result<Box<dyn SenderLink>, Error>;

    /// Attach a receiver link. `source` is the address messages come from,
    /// `target` the local address they are delivered to. `credit` is the
    /// initial credit granted to the peer; refill is owned by the stack.
    async fn attach_receiver(
        &mut self,
        name: &str,
        source: &str,
        target: &str,
        credit: u32,
    ) -> Result<Box<dyn ReceiverLink>, Error>;

    /// End the session without waiting for outstanding deliveries
    async fn end(&mut self) -> Result<(), Error>;
}

/// Sending half of a link pair
#[async_trait]
pub trait SenderLink: Send + Sync {
    /// Whether the link has been closed or detached
    fn is_closed(&self) -> bool;

    /// Send a message and wait for the delivery outcome
    async fn send(&mut self, message: AmqpMessage) -> Result<Outcome, Error>;

    /// Close the link
    async fn close(&mut self) -> Result<(), Error>;
}

/// Receiving half of a link pair
#[async_trait]
pub trait ReceiverLink: Send + Sync {
    /// Receive the next delivery. Returns an error once the link is closed.
    async fn recv(&mut self) -> Result<Delivery, Error>;

    /// Settle a delivery with the `Accepted` outcome
    async fn accept(&mut self, delivery: &Delivery) -> Result<(), Error>;
}

/// A received transfer
#[derive(Debug)]
pub struct Delivery {
    message: AmqpMessage,
}

impl Delivery {
    /// Wraps a received message
    pub fn new(message: AmqpMessage) -> Self {
        Self { message }
    }

    /// The transferred message
    pub fn message(&self) -> &AmqpMessage {
        &self.message
    }

    /// Consumes the delivery into the transferred message
    pub fn into_message(self) -> AmqpMessage {
        self.message
    }
}

/// Hook surface the stack invokes while exchanging `Open` performatives.
///
/// The stack must call [`on_local_open`](ConnectionObserver::on_local_open)
/// before the local `Open` is written and
/// [`on_remote_open`](ConnectionObserver::on_remote_open) when the peer's
/// `Open` arrives.
pub trait ConnectionObserver: Send + Sync {
    /// Chance to amend the local `Open` before it is sent
    fn on_local_open(&self, open: &mut Open);

    /// Observation of the peer's `Open`
    fn on_remote_open(&self, open: &Open);
}
