//! Error types shared across the crate

use fe2o3_amqp_types::{messaging::Outcome, primitives::Symbol};

use crate::constants::CBS_INVALID_RESPONSE;

/// Type-erased error returned by token providers
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error type for the CBS client, the request/response client and the
/// token renewal scheduler.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Operation on a client that has already been closed
    #[error("client is already disposed")]
    Disposed,

    /// A precondition of the operation is not met
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// The operation was cancelled locally, or the client went away while
    /// the operation was in flight
    #[error("operation was cancelled")]
    Cancelled,

    /// Failure signalled by the peer
    #[error("AMQP error {condition:?}: {description:?}")]
    Amqp {
        /// Error condition symbol
        condition: Symbol,
        /// Optional status description supplied by the peer
        description: Option<String>,
    },

    /// The peer settled the transfer with a non-accepted outcome
    #[error("request was not accepted: {0:?}")]
    NotAccepted(Box<Outcome>),

    /// Error propagated unchanged from the token provider
    #[error("token provider error: {0}")]
    Provider(BoxError),

    /// A link could not be attached at the stack boundary
    #[error("link attach error: {0}")]
    Attach(String),

    /// The stack failed to send a transfer
    #[error("send error: {0}")]
    Send(String),

    /// The stack failed to receive a transfer
    #[error("receive error: {0}")]
    Recv(String),
}

impl Error {
    /// A response that lacks the sections mandated by the CBS spec
    pub(crate) fn invalid_response(description: &str) -> Self {
        Self::Amqp {
            condition: Symbol::from(CBS_INVALID_RESPONSE),
            description: Some(description.to_string()),
        }
    }
}
