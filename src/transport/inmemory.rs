use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;

use crate::{OutboxMessage, transport::Sender};

/// What the in-memory broker answers to a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Positive confirmation.
    Confirm,
    /// Negative confirmation.
    Reject,
    /// Transport failure before any confirmation.
    Fail,
}

/// In-memory transport for testing or local pipelines.
///
/// Every published message is recorded, whatever the outcome. Outcomes are
/// taken from a script first and fall back to a default once the script is
/// exhausted. Clones share the same state, so a test can keep a handle to
/// inspect what the scheduler sent.
#[derive(Clone)]
pub struct InMemory {
    state: Arc<Mutex<State>>,
}

struct State {
    sent: Vec<OutboxMessage>,
    script: VecDeque<Outcome>,
    default: Outcome,
}

impl InMemory {
    pub fn new(default: Outcome) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                sent: Vec::new(),
                script: VecDeque::new(),
                default,
            })),
        }
    }

    pub fn confirming() -> Self {
        Self::new(Outcome::Confirm)
    }

    pub fn rejecting() -> Self {
        Self::new(Outcome::Reject)
    }

    pub fn failing() -> Self {
        Self::new(Outcome::Fail)
    }

    /// Queue a one-off outcome for the next publish.
    pub fn then(&self, outcome: Outcome) -> &Self {
        self.state.lock().script.push_back(outcome);
        self
    }

    /// Change the outcome used once the script is exhausted.
    pub fn set_default(&self, outcome: Outcome) {
        self.state.lock().default = outcome;
    }

    /// Every message published so far, in call order.
    pub fn sent_messages(&self) -> Vec<OutboxMessage> {
        self.state.lock().sent.clone()
    }

    pub fn calls(&self) -> usize {
        self.state.lock().sent.len()
    }
}

impl Default for InMemory {
    /// A transport that confirms everything.
    fn default() -> Self {
        Self::confirming()
    }
}

#[async_trait::async_trait]
impl Sender for InMemory {
    type Error = std::io::Error;

    #[tracing::instrument(skip_all, fields(id = %message.id))]
    async fn send(&mut self, message: OutboxMessage) -> Result<bool, Self::Error> {
        let outcome = {
            let mut state = self.state.lock();
            state.sent.push(message);
            let default = state.default;
            state.script.pop_front().unwrap_or(default)
        };
        tracing::info!(?outcome, "Message sent to in-memory broker");

        match outcome {
            Outcome::Confirm => Ok(true),
            Outcome::Reject => Ok(false),
            Outcome::Fail => Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "in-memory broker unavailable",
            )),
        }
    }
}
