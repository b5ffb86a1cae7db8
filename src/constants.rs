//! Constants of the CBS extension protocol

use std::time::Duration;

/// Address of the CBS node defined in the CBS spec
pub const CBS_NODE_ADDR: &str = "$cbs";

/// Capability symbol advertised on `Open.desired-capabilities` and looked up
/// in the peer's `Open.offered-capabilities`
pub const CBS_CAPABILITY: &str = "AMQP_CBS_V1_0";

/// Put token operation
pub const PUT_TOKEN: &str = "put-token";

/// Subject of a link-based set-token message
pub const SET_TOKEN: &str = "set-token";

/// Operation key in the request application properties
pub const OPERATION: &str = "operation";

/// Audience key in the request application properties
pub const NAME: &str = "name";

/// Token type key in a put-token request
pub const TYPE: &str = "type";

/// Token expiration key in a put-token request
pub const EXPIRATION: &str = "expiration";

/// Token type key in a set-token request
pub const TOKEN_TYPE: &str = "token-type";

/// Status code key in the response application properties
pub const STATUS_CODE: &str = "status-code";

/// Status description key in the response application properties
pub const STATUS_DESCRIPTION: &str = "status-description";

/// Error condition key in the response application properties
pub const ERROR_CONDITION: &str = "error-condition";

/// Condition raised when a put-token exchange yields no response
pub const CBS_NO_RESPONSE: &str = "amqp:cbs:no-response";

/// Condition raised when a put-token response lacks the mandatory sections
pub const CBS_INVALID_RESPONSE: &str = "amqp:cbs:invalid-response";

/// Name of the CBS SASL mechanism
pub const SASL_MECH_AMQPCBS: &str = "AMQPCBS";

/// Suffix appended to the node address to form the reply-to address
pub const REPLY_TO_SUFFIX: &str = ".reply-to";

/// Initial credit granted to the response receiver link. Refill is left to
/// the underlying AMQP stack.
pub(crate) const INITIAL_CREDIT: u32 = 50;

/// Requested token validity when the caller does not override it
pub(crate) const DEFAULT_TOKEN_DURATION: Duration = Duration::from_secs(20 * 60);

/// Upper bound on a whole renewal batch
pub(crate) const RENEW_TIMEOUT: Duration = Duration::from_secs(60);

/// Clamp applied when a renewal is already due at arm time
pub(crate) const MIN_RENEW_DELAY: Duration = Duration::from_secs(1);
