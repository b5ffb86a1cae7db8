//! SASL profile for the `AMQPCBS` mechanism.
//!
//! The mechanism carries a batch of CBS tokens inside the SASL init's
//! initial response so a peer can authorize a connection before any link is
//! attached. The profile is a stateless serializer/parser: verification of
//! the tokens themselves is delegated to other components, and there is no
//! transport upgrade.
//!
//! Wire shape of the initial response: for each token the UTF-8 of
//! `<type> <token>` followed by a NUL byte, then one extra NUL terminating
//! the list.

use bytes::BufMut;
use fe2o3_amqp_types::{
    primitives::{Binary, Symbol},
    sasl::{SaslCode, SaslInit, SaslOutcome},
};

use crate::constants::SASL_MECH_AMQPCBS;

/// One token record carried by the mechanism: a type and an opaque blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaslCbsToken {
    /// The token type, eg. `"jwt"`
    pub token_type: String,
    /// The token blob
    pub token: String,
}

impl SaslCbsToken {
    /// Creates a new record
    pub fn new(token_type: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            token_type: token_type.into(),
            token: token.into(),
        }
    }
}

/// Client side of the `AMQPCBS` SASL mechanism
#[derive(Debug, Clone)]
pub struct SaslProfileCbs {
    /// Tokens sent in the initial response
    pub tokens: Vec<SaslCbsToken>,
}

impl SaslProfileCbs {
    /// Creates a profile carrying `tokens`
    pub fn new(tokens: Vec<SaslCbsToken>) -> Self {
        Self { tokens }
    }

    /// The mechanism symbol, `AMQPCBS`
    pub fn mechanism(&self) -> Symbol {
        Symbol::from(SASL_MECH_AMQPCBS)
    }

    /// Encodes the client-init initial response
    pub fn initial_response(&self) -> Binary {
        let mut buf = Vec::new();
        for record in &self.tokens {
            buf.put_slice(record.token_type.as_bytes());
            buf.put_u8(b' ');
            buf.put_slice(record.token.as_bytes());
            buf.put_u8(0);
        }
        buf.put_u8(0);
        Binary::from(buf)
    }

    /// The `SaslInit` frame this profile answers a mechanisms frame with
    pub fn sasl_init(&self, hostname: Option<&str>) -> SaslInit {
        SaslInit {
            mechanism: self.mechanism(),
            initial_response: Some(self.initial_response()),
            hostname: hostname.map(Into::into),
        }
    }
}

/// Error parsing an `AMQPCBS` initial response
#[derive(Debug, thiserror::Error)]
pub enum SaslCbsError {
    /// The response is not valid UTF-8
    #[error("initial response is not valid UTF-8")]
    NotUtf8,

    /// A record does not split into exactly `<type> <token>`
    #[error("malformed token record")]
    MalformedRecord,

    /// The response carries no token records
    #[error("initial response carries no tokens")]
    Empty,
}

/// Server-side parse of an initial response into token records.
///
/// Fields are split on NUL; each non-empty field must split on a single
/// space into type and token. Arity mismatches and an empty list are
/// authentication failures.
pub fn parse_initial_response(response: &[u8]) -> Result<Vec<SaslCbsToken>, SaslCbsError> {
    let response = std::str::from_utf8(response).map_err(|_| SaslCbsError::NotUtf8)?;
    let mut tokens = Vec::new();
    for field in response.split('\0') {
        if field.is_empty() {
            continue;
        }
        let mut parts = field.split(' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(token_type), Some(token), None)
                if !token_type.is_empty() && !token.is_empty() =>
            {
                tokens.push(SaslCbsToken::new(token_type, token));
            }
            _ => return Err(SaslCbsError::MalformedRecord),
        }
    }
    if tokens.is_empty() {
        return Err(SaslCbsError::Empty);
    }
    Ok(tokens)
}

/// Server-side evaluation of an initial response into a SASL outcome:
/// `Ok` for a non-empty valid token list, `Auth` otherwise
pub fn evaluate_initial_response(response: &[u8]) -> SaslOutcome {
    let code = match parse_initial_response(response) {
        Ok(_) => SaslCode::Ok,
        Err(_) => SaslCode::Auth,
    };
    SaslOutcome {
        code,
        additional_data: None,
    }
}
