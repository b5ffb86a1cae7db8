//! In-memory AMQP stack double and scripted CBS node for scenario tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use amqp_cbs::endpoint::{
    AmqpMessage, Connection, ConnectionObserver, Delivery, ReceiverLink, Session, SenderLink,
};
use amqp_cbs::error::{BoxError, Error};
use amqp_cbs::token::{AsyncCbsTokenProvider, CbsToken};
use amqp_cbs::CbsClient;
use async_trait::async_trait;
use fe2o3_amqp_types::{
    messaging::{
        Accepted, ApplicationProperties, Message, MessageId, Outcome, Properties, Rejected,
    },
    performatives::{ChannelMax, MaxFrameSize, Open},
    primitives::{Array, SimpleValue, Symbol, Value},
};
use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One scripted put-token response: status code, error condition, description
pub type ResponseScript = (i32, Option<String>, Option<String>);

/// Scripted CBS node shared by every link the mock stack attaches
pub struct MockBroker {
    cbs_node: String,
    status_script: Mutex<VecDeque<ResponseScript>>,
    reply_routes: Mutex<HashMap<String, mpsc::UnboundedSender<AmqpMessage>>>,
    pub put_token_requests: Mutex<Vec<AmqpMessage>>,
    pub set_token_messages: Mutex<Vec<AmqpMessage>>,
    pub drop_responses: AtomicBool,
    pub reject_next_send: AtomicBool,
    pub malformed_response: AtomicBool,
    pub accepted_deliveries: AtomicUsize,
    pub sender_attaches: AtomicUsize,
    pub receiver_attaches: AtomicUsize,
    pub sessions_begun: AtomicUsize,
}

impl MockBroker {
    pub fn new(cbs_node: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            cbs_node: cbs_node.into(),
            status_script: Mutex::new(VecDeque::new()),
            reply_routes: Mutex::new(HashMap::new()),
            put_token_requests: Mutex::new(Vec::new()),
            set_token_messages: Mutex::new(Vec::new()),
            drop_responses: AtomicBool::new(false),
            reject_next_send: AtomicBool::new(false),
            malformed_response: AtomicBool::new(false),
            accepted_deliveries: AtomicUsize::new(0),
            sender_attaches: AtomicUsize::new(0),
            receiver_attaches: AtomicUsize::new(0),
            sessions_begun: AtomicUsize::new(0),
        })
    }

    /// Queue a response for the next put-token request; unscripted requests
    /// get a plain 200.
    pub fn script_response(
        &self,
        status: i32,
        condition: Option<&str>,
        description: Option<&str>,
    ) {
        self.status_script.lock().push_back((
            status,
            condition.map(str::to_string),
            description.map(str::to_string),
        ));
    }

    /// Deliver a response that correlates to no outstanding request
    pub fn inject_spurious_response(&self, reply_to: &str, correlation_id: &str) {
        let response = Message::builder()
            .properties(
                Properties::builder()
                    .correlation_id(MessageId::String(correlation_id.to_string()))
                    .build(),
            )
            .application_properties(
                ApplicationProperties::builder()
                    .insert("status-code", SimpleValue::Int(200))
                    .build(),
            )
            .body(Value::Null)
            .build();
        if let Some(route) = self.reply_routes.lock().get(reply_to) {
            let _ = route.send(response);
        }
    }

    fn handle_send(&self, target: &str, message: AmqpMessage) -> Result<Outcome, Error> {
        if self.reject_next_send.swap(false, Ordering::AcqRel) {
            return Ok(Outcome::Rejected(Rejected { error: None }));
        }
        if target != self.cbs_node {
            return Ok(Outcome::Accepted(Accepted {}));
        }

        let subject = message
            .properties
            .as_ref()
            .and_then(|properties| properties.subject.as_deref());
        if subject == Some("set-token") {
            self.set_token_messages.lock().push(message);
            return Ok(Outcome::Accepted(Accepted {}));
        }

        // message-based request/reply
        let properties = message
            .properties
            .as_ref()
            .ok_or(Error::Send("request without properties".to_string()))?;
        let message_id = properties
            .message_id
            .clone()
            .ok_or(Error::Send("request without message-id".to_string()))?;
        let reply_to = properties
            .reply_to
            .clone()
            .ok_or(Error::Send("request without reply-to".to_string()))?;
        self.put_token_requests.lock().push(message.clone());

        if self.drop_responses.load(Ordering::Acquire) {
            return Ok(Outcome::Accepted(Accepted {}));
        }
        let response = self.build_response(message_id, &message);
        if let Some(route) = self.reply_routes.lock().get(&reply_to) {
            let _ = route.send(response);
        }
        Ok(Outcome::Accepted(Accepted {}))
    }

    fn build_response(&self, correlation_id: MessageId, request: &AmqpMessage) -> AmqpMessage {
        if self.malformed_response.swap(false, Ordering::AcqRel) {
            return Message::builder()
                .properties(Properties::builder().correlation_id(correlation_id).build())
                .body(Value::Null)
                .build();
        }
        let (status, condition, description) = self
            .status_script
            .lock()
            .pop_front()
            .unwrap_or((200, None, None));
        let mut application_properties =
            ApplicationProperties::builder().insert("status-code", SimpleValue::Int(status));
        if let Some(condition) = condition {
            application_properties = application_properties
                .insert("error-condition", SimpleValue::Symbol(Symbol::from(condition)));
        }
        if let Some(description) = description {
            application_properties =
                application_properties.insert("status-description", description);
        }
        let body = match &request.body {
            Value::String(body) => Value::String(format!("echo:{body}")),
            _ => Value::Null,
        };
        Message::builder()
            .properties(Properties::builder().correlation_id(correlation_id).build())
            .application_properties(application_properties.build())
            .body(body)
            .build()
    }
}

/// Connection double over a [`MockBroker`]
pub struct MockConnection {
    closed: AtomicBool,
    broker: Arc<MockBroker>,
}

impl MockConnection {
    pub fn new(broker: Arc<MockBroker>) -> Arc<Self> {
        Arc::new(Self {
            closed: AtomicBool::new(false),
            broker,
        })
    }

    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn begin_session(&self) -> Result<Box<dyn Session>, Error> {
        if self.is_closed() {
            return Err(Error::InvalidOperation("connection is closed"));
        }
        self.broker.sessions_begun.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(MockSession {
            broker: Arc::clone(&self.broker),
        }))
    }
}

struct MockSession {
    broker: Arc<MockBroker>,
}

#[async_trait]
impl Session for MockSession {
    async fn attach_sender(
        &mut self,
        _name: &str,
        target: &str,
    ) -> Result<Box<dyn SenderLink>, Error> {
        self.broker.sender_attaches.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(MockSender {
            broker: Arc::clone(&self.broker),
            target: target.to_string(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn attach_receiver(
        &mut self,
        _name: &str,
        _source: &str,
        target: &str,
        _credit: u32,
    ) -> Result<Box<dyn ReceiverLink>, Error> {
        self.broker.receiver_attaches.fetch_add(1, Ordering::AcqRel);
        let (route, deliveries) = mpsc::unbounded_channel();
        self.broker
            .reply_routes
            .lock()
            .insert(target.to_string(), route);
        Ok(Box::new(MockReceiver {
            broker: Arc::clone(&self.broker),
            deliveries,
        }))
    }

    async fn end(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

struct MockSender {
    broker: Arc<MockBroker>,
    target: String,
    closed: AtomicBool,
}

#[async_trait]
impl SenderLink for MockSender {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn send(&mut self, message: AmqpMessage) -> Result<Outcome, Error> {
        if self.is_closed() {
            return Err(Error::Send("sender link is closed".to_string()));
        }
        self.broker.handle_send(&self.target, message)
    }

    async fn close(&mut self) -> Result<(), Error> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

struct MockReceiver {
    broker: Arc<MockBroker>,
    deliveries: mpsc::UnboundedReceiver<AmqpMessage>,
}

#[async_trait]
impl ReceiverLink for MockReceiver {
    async fn recv(&mut self) -> Result<Delivery, Error> {
        self.deliveries
            .recv()
            .await
            .map(Delivery::new)
            .ok_or(Error::Recv("receiver link is closed".to_string()))
    }

    async fn accept(&mut self, _delivery: &Delivery) -> Result<(), Error> {
        self.broker.accepted_deliveries.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Counting token provider with per-audience failure scripting
pub struct TestTokenProvider {
    pub calls: AtomicUsize,
    per_audience: Mutex<HashMap<String, usize>>,
    fail_on: Mutex<HashMap<String, usize>>,
    pub expire_immediately: AtomicBool,
    validity_override: Mutex<Option<Duration>>,
}

impl TestTokenProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            per_audience: Mutex::new(HashMap::new()),
            fail_on: Mutex::new(HashMap::new()),
            expire_immediately: AtomicBool::new(false),
            validity_override: Mutex::new(None),
        })
    }

    /// Fail the `nth` (1-based) call for `audience`
    pub fn fail_on(&self, audience: &str, nth: usize) {
        self.fail_on.lock().insert(audience.to_string(), nth);
    }

    /// Issue tokens valid for `validity` regardless of the requested duration
    pub fn set_validity(&self, validity: Duration) {
        *self.validity_override.lock() = Some(validity);
    }

    pub fn calls_for(&self, audience: &str) -> usize {
        self.per_audience.lock().get(audience).copied().unwrap_or(0)
    }
}

#[async_trait]
impl AsyncCbsTokenProvider for TestTokenProvider {
    async fn get_token(
        &self,
        audience: &str,
        _claims: &[String],
        duration: Duration,
        _ct: &CancellationToken,
    ) -> Result<CbsToken, BoxError> {
        self.calls.fetch_add(1, Ordering::AcqRel);
        let nth = {
            let mut per_audience = self.per_audience.lock();
            let count = per_audience.entry(audience.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if self.fail_on.lock().get(audience) == Some(&nth) {
            return Err("token provider unavailable".into());
        }
        let expires_at = if self.expire_immediately.load(Ordering::Acquire) {
            OffsetDateTime::now_utc() - Duration::from_secs(1)
        } else {
            let validity = (*self.validity_override.lock()).unwrap_or(duration);
            OffsetDateTime::now_utc() + validity
        };
        Ok(CbsToken::new(
            format!("token-{nth}-for-{audience}"),
            "servicebus.windows.net:sastoken",
            expires_at,
        ))
    }
}

/// Builds a peer `Open` with the given offered capabilities and properties
pub fn open_frame(offered: &[&str], properties: &[(&str, &str)]) -> Open {
    let offered_capabilities = if offered.is_empty() {
        None
    } else {
        Some(Array(offered.iter().map(|s| Symbol::from(*s)).collect()))
    };
    let fields = if properties.is_empty() {
        None
    } else {
        let mut fields = fe2o3_amqp_types::definitions::Fields::new();
        for (key, value) in properties {
            fields.insert(Symbol::from(*key), Value::String(value.to_string()));
        }
        Some(fields)
    };
    Open {
        container_id: "mock-peer".to_string(),
        hostname: None,
        max_frame_size: MaxFrameSize::default(),
        channel_max: ChannelMax::default(),
        idle_time_out: None,
        outgoing_locales: None,
        incoming_locales: None,
        offered_capabilities,
        desired_capabilities: None,
        properties: fields,
    }
}

/// A local `Open` before the CBS client amends it
pub fn local_open_frame() -> Open {
    open_frame(&[], &[])
}

/// Creates a CBS client over the connection and drives the open negotiation
/// with the given peer `Open`
pub fn negotiated_cbs_client(connection: Arc<MockConnection>, remote_open: &Open) -> Arc<CbsClient> {
    let client = Arc::new(CbsClient::new(connection));
    let mut local_open = local_open_frame();
    client.on_local_open(&mut local_open);
    client.on_remote_open(remote_open);
    client
}

/// Splits `Key=Value;...` connection strings used by the seed scenarios
pub fn parse_connection_string(connection_string: &str) -> HashMap<String, String> {
    connection_string
        .split(';')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            Some((parts.next()?.to_string(), parts.next()?.to_string()))
        })
        .collect()
}

/// Audience of the entity a connection string points at:
/// `Endpoint=sb://H/;...;EntityPath=Q` becomes `http://H/Q`
pub fn audience_from_connection_string(connection_string: &str) -> String {
    let parts = parse_connection_string(connection_string);
    let host = parts["Endpoint"]
        .trim_start_matches("sb://")
        .trim_matches('/');
    format!("http://{}/{}", host, parts["EntityPath"])
}
