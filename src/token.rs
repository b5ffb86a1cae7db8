//! CBS token and the token provider boundary

use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::error::BoxError;

/// A security token to be pushed to the CBS node of the peer.
///
/// Immutable once returned by a provider. The expiry is an absolute UTC
/// instant; the provider chooses how far in the future it lies.
#[derive(Debug, Clone)]
pub struct CbsToken {
    token: String,
    token_type: String,
    expires_at: OffsetDateTime,
}

impl CbsToken {
    /// Creates a new token
    pub fn new(
        token: impl Into<String>,
        token_type: impl Into<String>,
        expires_at: OffsetDateTime,
    ) -> Self {
        Self {
            token: token.into(),
            token_type: token_type.into(),
            expires_at,
        }
    }

    /// The opaque token blob
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The token type, eg. `"jwt"` or `"servicebus.windows.net:sastoken"`
    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    /// UTC instant at which the token expires
    pub fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }
}

/// Boundary to credential sources.
///
/// Implementations must be safe under concurrent invocation; the renewal
/// scheduler fans out one call per due audience.
#[async_trait]
pub trait AsyncCbsTokenProvider: Send + Sync {
    /// Get a token authorizing `claims` on `audience`, valid for roughly
    /// `duration` from now.
    async fn get_token(
        &self,
        audience: &str,
        claims: &[String],
        duration: Duration,
        ct: &CancellationToken,
    ) -> Result<CbsToken, BoxError>;
}
