//! CBS protocol dispatch.
//!
//! The [`CbsClient`] hooks into the connection's `Open` negotiation. On
//! local open it advertises the `AMQP_CBS_V1_0` capability; on remote open
//! it selects, exactly once, the variant the peer supports: the link-based
//! `set-token` flow when the capability is offered back, or the classic
//! message-based `put-token` request/response exchange on the `$cbs` node
//! otherwise.

use std::sync::Arc;

use fe2o3_amqp_types::{
    messaging::Outcome,
    performatives::Open,
    primitives::{Array, Symbol, Timestamp, Value},
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::constants::{CBS_CAPABILITY, CBS_NODE_ADDR};
use crate::endpoint::{Connection, ConnectionObserver, SenderLink, Session};
use crate::error::Error;
use crate::request_response::RequestResponseClient;
use crate::token::CbsToken;

pub mod put_token;
pub mod set_token;

use put_token::{PutTokenRequest, PutTokenResponse};
use set_token::SetTokenRequest;

/// Client side of the CBS extension protocol.
///
/// Create one per connection and wire it into the stack's open negotiation
/// through [`ConnectionObserver`]. Until the remote open has been observed,
/// [`put_token`](CbsClient::put_token) fails with
/// [`Error::InvalidOperation`].
pub struct CbsClient {
    connection: Arc<dyn Connection>,
    variant: Mutex<Option<CbsVariant>>,
}

impl std::fmt::Debug for CbsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CbsClient")
            .field("variant", &*self.variant.lock())
            .finish()
    }
}

/// The negotiated protocol variant, selected once per connection
#[derive(Debug, Clone)]
enum CbsVariant {
    MessageBased(RequestResponseClient),
    LinkBased(SetTokenClient),
}

impl CbsClient {
    /// Creates a CBS client for the connection
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            connection,
            variant: Mutex::new(None),
        }
    }

    /// Whether the remote open has been observed and a variant selected
    pub fn is_open(&self) -> bool {
        self.variant.lock().is_some()
    }

    pub(crate) fn is_connection_closed(&self) -> bool {
        self.connection.is_closed()
    }

    /// Push `token` to the peer's CBS node for `audience`
    pub async fn put_token(
        &self,
        audience: &str,
        token: CbsToken,
        ct: &CancellationToken,
    ) -> Result<(), Error> {
        let variant = self.variant.lock().clone();
        let variant = variant.ok_or(Error::InvalidOperation(
            "the connection has not completed open negotiation",
        ))?;
        match variant {
            CbsVariant::MessageBased(client) => {
                let expiration_ms = (token.expires_at().unix_timestamp_nanos() / 1_000_000) as i64;
                let request = PutTokenRequest::new(
                    audience,
                    token.token(),
                    token.token_type(),
                    Timestamp::from_milliseconds(expiration_ms),
                );
                let response = client.send_request(request.into_message(), ct).await?;
                let _response = PutTokenResponse::from_message(response)?;
                Ok(())
            }
            CbsVariant::LinkBased(client) => client.set_token(&token, ct).await,
        }
    }

    /// Close the negotiated inner client, cancelling outstanding requests
    pub async fn close(&self) {
        let variant = self.variant.lock().clone();
        match variant {
            Some(CbsVariant::MessageBased(client)) => client.close().await,
            Some(CbsVariant::LinkBased(client)) => client.close().await,
            None => {}
        }
    }
}

impl ConnectionObserver for CbsClient {
    fn on_local_open(&self, open: &mut Open) {
        let capability = Symbol::from(CBS_CAPABILITY);
        let desired = open
            .desired_capabilities
            .get_or_insert_with(|| Array(Vec::new()));
        if !desired.0.contains(&capability) {
            desired.0.push(capability);
        }
    }

    fn on_remote_open(&self, open: &Open) {
        let mut variant = self.variant.lock();
        if variant.is_some() {
            return;
        }
        let offered = open
            .offered_capabilities
            .as_ref()
            .map(|capabilities| {
                capabilities
                    .0
                    .iter()
                    .any(|capability| capability.as_str() == CBS_CAPABILITY)
            })
            .unwrap_or(false);
        *variant = Some(if offered {
            let node_addr = cbs_node_addr(open);
            tracing::debug!(node = %node_addr, "peer offers CBS capability, using link-based set-token");
            CbsVariant::LinkBased(SetTokenClient::new(
                Arc::clone(&self.connection),
                node_addr,
            ))
        } else {
            tracing::debug!("peer does not offer CBS capability, using message-based put-token");
            CbsVariant::MessageBased(RequestResponseClient::new(
                Arc::clone(&self.connection),
                CBS_NODE_ADDR,
            ))
        });
    }
}

/// CBS node address from `Open.properties["$cbs"]`, falling back to `$cbs`
fn cbs_node_addr(open: &Open) -> String {
    open.properties
        .as_ref()
        .and_then(|fields| fields.get(&Symbol::from(CBS_NODE_ADDR)))
        .and_then(|value| match value {
            Value::String(addr) => Some(addr.clone()),
            Value::Symbol(addr) => Some(addr.as_str().to_string()),
            _ => None,
        })
        .unwrap_or_else(|| CBS_NODE_ADDR.to_string())
}

/// Link-based variant: one pre-attached sender to the CBS node, no
/// correlation. Success is inferred from the delivery outcome.
#[derive(Clone)]
pub struct SetTokenClient {
    inner: Arc<SetTokenInner>,
}

impl std::fmt::Debug for SetTokenClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetTokenClient")
            .field("node_addr", &self.inner.node_addr)
            .finish()
    }
}

struct SetTokenInner {
    connection: Arc<dyn Connection>,
    node_addr: String,
    link: tokio::sync::Mutex<Option<SetTokenLink>>,
}

struct SetTokenLink {
    session: Box<dyn Session>,
    sender: Box<dyn SenderLink>,
}

impl SetTokenClient {
    /// Creates a client for the CBS node at `node_addr`. The sender link is
    /// attached on first use and re-attached when it is found closed.
    pub fn new(connection: Arc<dyn Connection>, node_addr: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(SetTokenInner {
                connection,
                node_addr: node_addr.into(),
                link: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Send a `set-token` message and wait for the delivery outcome
    pub async fn set_token(&self, token: &CbsToken, ct: &CancellationToken) -> Result<(), Error> {
        let mut guard = self.inner.link.lock().await;
        if ct.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let needs_attach = guard
            .as_ref()
            .map(|link| link.sender.is_closed())
            .unwrap_or(true);
        if needs_attach {
            if let Some(mut stale) = guard.take() {
                if let Err(error) = stale.session.end().await {
                    tracing::debug!(?error, "ending the stale set-token session failed");
                }
            }
            if self.inner.connection.is_closed() {
                return Err(Error::InvalidOperation("the underlying connection is closed"));
            }
            let mut session = self.inner.connection.begin_session().await?;
            let sender = session
                .attach_sender(
                    &format!("{}-set-token-sender", self.inner.node_addr),
                    &self.inner.node_addr,
                )
                .await?;
            *guard = Some(SetTokenLink { session, sender });
        }
        let link = match guard.as_mut() {
            Some(link) => link,
            None => return Err(Error::InvalidOperation("set-token link is not attached")),
        };

        let message = SetTokenRequest::new(
            self.inner.node_addr.as_str(),
            token.token(),
            token.token_type(),
        )
        .into_message();
        let outcome = tokio::select! {
            _ = ct.cancelled() => return Err(Error::Cancelled),
            outcome = link.sender.send(message) => outcome,
        };
        match outcome {
            Ok(Outcome::Accepted(_)) => Ok(()),
            Ok(other) => Err(Error::NotAccepted(Box::new(other))),
            Err(error) => {
                // condemn the link so the next call re-attaches
                *guard = None;
                Err(error)
            }
        }
    }

    /// Detach the sender and end its session
    pub async fn close(&self) {
        if let Some(mut link) = self.inner.link.lock().await.take() {
            if let Err(error) = link.sender.close().await {
                tracing::debug!(?error, "closing the set-token sender failed");
            }
            if let Err(error) = link.session.end().await {
                tracing::debug!(?error, "ending the set-token session failed");
            }
        }
    }
}
