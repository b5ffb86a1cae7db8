//! Shaping and parsing of the message-based `put-token` exchange

use std::borrow::Cow;

use fe2o3_amqp_types::{
    messaging::{ApplicationProperties, Message, Properties},
    primitives::{SimpleValue, Symbol, Timestamp, Value},
};

use crate::constants::{
    ERROR_CONDITION, EXPIRATION, NAME, OPERATION, PUT_TOKEN, STATUS_CODE, STATUS_DESCRIPTION, TYPE,
};
use crate::endpoint::AmqpMessage;
use crate::error::Error;

/// A `put-token` request pushed through the request/response client
pub struct PutTokenRequest<'a> {
    /// Audience the token authorizes
    pub name: Cow<'a, str>,
    /// The token blob
    pub token: Cow<'a, str>,
    /// Token type
    pub r#type: Cow<'a, str>,
    /// Absolute expiration of the token
    pub expiration: Option<Timestamp>,
}

impl std::fmt::Debug for PutTokenRequest<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // token blob elided
        f.debug_struct("PutTokenRequest")
            .field("name", &self.name)
            .field("type", &self.r#type)
            .field("expiration", &self.expiration)
            .finish()
    }
}

impl<'a> PutTokenRequest<'a> {
    /// Creates a new request
    pub fn new(
        name: impl Into<Cow<'a, str>>,
        token: impl Into<Cow<'a, str>>,
        r#type: impl Into<Cow<'a, str>>,
        expiration: impl Into<Option<Timestamp>>,
    ) -> Self {
        Self {
            name: name.into(),
            token: token.into(),
            r#type: r#type.into(),
            expiration: expiration.into(),
        }
    }

    /// Shapes the request message. Message id and reply-to are left unset;
    /// the request/response client stamps them.
    pub fn into_message(self) -> AmqpMessage {
        let expiration = match self.expiration {
            Some(timestamp) => SimpleValue::Timestamp(timestamp),
            None => SimpleValue::Null,
        };
        let application_properties = ApplicationProperties::builder()
            .insert(OPERATION, PUT_TOKEN)
            .insert(NAME, self.name.to_string())
            .insert(TYPE, SimpleValue::String(self.r#type.into_owned()))
            .insert(EXPIRATION, expiration)
            .build();
        Message::builder()
            .properties(Properties::default())
            .application_properties(application_properties)
            .body(Value::String(self.token.into_owned()))
            .build()
    }
}

/// Successfully parsed `put-token` response
#[derive(Debug)]
pub struct PutTokenResponse {
    /// Status code reported by the CBS node, 200 or 202
    pub status_code: i32,
}

impl PutTokenResponse {
    /// Parses a response message.
    ///
    /// The message must carry both a `properties` and an
    /// `application-properties` section with an integral `status-code`.
    /// Codes other than 200 and 202 raise [`Error::Amqp`] carrying the
    /// `error-condition` symbol and the `status-description` string.
    pub fn from_message(mut message: AmqpMessage) -> Result<Self, Error> {
        if message.properties.is_none() {
            return Err(Error::invalid_response("response carries no properties"));
        }
        let application_properties = message
            .application_properties
            .as_mut()
            .ok_or_else(|| Error::invalid_response("response carries no application properties"))?;

        let status_code = application_properties
            .swap_remove(STATUS_CODE)
            .and_then(status_code_value)
            .ok_or_else(|| Error::invalid_response("response carries no status-code"))?;

        if status_code == 200 || status_code == 202 {
            return Ok(Self { status_code });
        }

        let condition = match application_properties.swap_remove(ERROR_CONDITION) {
            Some(SimpleValue::Symbol(symbol)) => symbol,
            Some(SimpleValue::String(string)) => Symbol::from(string),
            _ => Symbol::from("amqp:internal-error"),
        };
        let description = match application_properties.swap_remove(STATUS_DESCRIPTION) {
            Some(SimpleValue::String(description)) => Some(description),
            _ => None,
        };
        Err(Error::Amqp {
            condition,
            description,
        })
    }
}

fn status_code_value(value: SimpleValue) -> Option<i32> {
    match value {
        SimpleValue::Ushort(value) => Some(i32::from(value)),
        SimpleValue::Uint(value) => i32::try_from(value).ok(),
        SimpleValue::Ulong(value) => i32::try_from(value).ok(),
        SimpleValue::Short(value) => Some(i32::from(value)),
        SimpleValue::Int(value) => Some(value),
        SimpleValue::Long(value) => i32::try_from(value).ok(),
        _ => None,
    }
}
