use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{endpoint::AmqpMessage, error::Error};

const PENDING: u8 = 0;
const CANCELLED: u8 = 1;
const FAILED: u8 = 2;
const COMPLETED: u8 = 3;

/// Terminal outcome of a request slot
pub(crate) enum SlotOutcome {
    Cancelled,
    Failed(Error),
    Completed(Box<AmqpMessage>),
}

/// One outstanding request.
///
/// The state field is the arbiter: exactly one caller wins the CAS out of
/// `PENDING` and that winner is responsible for driving the terminal action
/// (map removal and sink resolution), either inline when it is already on
/// the serializer or through a `Finish` work item otherwise.
pub(crate) struct RequestSlot {
    message_id: String,
    state: AtomicU8,
    outcome: Mutex<Option<SlotOutcome>>,
    sink: Mutex<Option<oneshot::Sender<Result<AmqpMessage, Error>>>>,
    done: CancellationToken,
}

impl RequestSlot {
    pub(crate) fn new(
        message_id: String,
        sink: oneshot::Sender<Result<AmqpMessage, Error>>,
    ) -> Self {
        Self {
            message_id,
            state: AtomicU8::new(PENDING),
            outcome: Mutex::new(None),
            sink: Mutex::new(Some(sink)),
            done: CancellationToken::new(),
        }
    }

    pub(crate) fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Token cancelled on terminal resolution. The cancellation watcher
    /// waits on it so that its registration does not outlive the slot.
    pub(crate) fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }

    fn transition(&self, to: u8, outcome: SlotOutcome) -> bool {
        if self
            .state
            .compare_exchange(PENDING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            *self.outcome.lock() = Some(outcome);
            true
        } else {
            false
        }
    }

    pub(crate) fn mark_cancelled(&self) -> bool {
        self.transition(CANCELLED, SlotOutcome::Cancelled)
    }

    pub(crate) fn mark_failed(&self, error: Error) -> bool {
        self.transition(FAILED, SlotOutcome::Failed(error))
    }

    pub(crate) fn mark_completed(&self, response: AmqpMessage) -> bool {
        self.transition(COMPLETED, SlotOutcome::Completed(Box::new(response)))
    }

    /// Resolve the completion sink with the stored outcome. Idempotent.
    pub(crate) fn resolve(&self) {
        let sink = self.sink.lock().take();
        if let Some(sink) = sink {
            let outcome = self.outcome.lock().take().unwrap_or(SlotOutcome::Cancelled);
            let result = match outcome {
                SlotOutcome::Completed(response) => Ok(*response),
                SlotOutcome::Failed(error) => Err(error),
                SlotOutcome::Cancelled => Err(Error::Cancelled),
            };
            let _ = sink.send(result);
        }
        self.done.cancel();
    }
}
