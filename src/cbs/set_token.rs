//! Shaping of the link-based `set-token` message

use std::borrow::Cow;

use fe2o3_amqp_types::{
    messaging::{ApplicationProperties, Message, Properties},
    primitives::Value,
};

use crate::constants::{SET_TOKEN, TOKEN_TYPE};
use crate::endpoint::AmqpMessage;

/// A one-way `set-token` message for the link-based CBS variant.
///
/// There is no correlation; the peer's delivery outcome is the only
/// acknowledgement.
pub struct SetTokenRequest<'a> {
    /// Address of the CBS node the message is sent to
    pub to: Cow<'a, str>,
    /// The token blob
    pub token: Cow<'a, str>,
    /// Token type
    pub token_type: Cow<'a, str>,
}

impl std::fmt::Debug for SetTokenRequest<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // token blob elided
        f.debug_struct("SetTokenRequest")
            .field("to", &self.to)
            .field("token_type", &self.token_type)
            .finish()
    }
}

impl<'a> SetTokenRequest<'a> {
    /// Creates a new request
    pub fn new(
        to: impl Into<Cow<'a, str>>,
        token: impl Into<Cow<'a, str>>,
        token_type: impl Into<Cow<'a, str>>,
    ) -> Self {
        Self {
            to: to.into(),
            token: token.into(),
            token_type: token_type.into(),
        }
    }

    /// Shapes the message: `properties.subject = "set-token"`, the token
    /// type as an application property and the token blob as the body.
    pub fn into_message(self) -> AmqpMessage {
        let properties = Properties::builder()
            .to(self.to.into_owned())
            .subject(SET_TOKEN.to_string())
            .build();
        let application_properties = ApplicationProperties::builder()
            .insert(TOKEN_TYPE, self.token_type.into_owned())
            .build();
        Message::builder()
            .properties(properties)
            .application_properties(application_properties)
            .body(Value::String(self.token.into_owned()))
            .build()
    }
}
