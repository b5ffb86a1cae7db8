#![deny(missing_docs, missing_debug_implementations)]

//! Claims-Based Security (CBS) for AMQP 1.0 connections.
//!
//! This crate layers token authentication on top of an existing AMQP 1.0
//! stack, consumed through the trait boundary in [`endpoint`]:
//!
//! - a [`CbsClient`] that negotiates the CBS variant during the connection's
//!   `Open` exchange and pushes tokens with either a message-based
//!   `put-token` request/response or a link-based one-way `set-token`,
//! - a generic [`RequestResponseClient`] correlating requests and responses
//!   over a pair of links, with serialized work processing, per-request
//!   cancellation and link re-attach across transient failures,
//! - a [`CbsAuthenticator`] that keeps any number of audiences authorized
//!   from a single renewal timer and reports background failures to
//!   subscribers,
//! - the [`sasl_profile`] serializer/parser for the `AMQPCBS` SASL
//!   mechanism.
//!
//! Because the CBS protocol is still in draft, the wire-facing surface is
//! expected to see breaking changes until the draft becomes stable.

pub mod authenticator;
pub mod cbs;
pub mod constants;
pub mod endpoint;
pub mod error;
pub mod request_response;
pub mod sasl_profile;
pub mod token;

mod util;

pub use authenticator::{CbsAuthenticator, RenewalFailure};
pub use cbs::CbsClient;
pub use error::Error;
pub use request_response::RequestResponseClient;
pub use token::{AsyncCbsTokenProvider, CbsToken};
