use std::collections::HashMap;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::state::NodeState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: NodeState,
    pub to: NodeState,
    pub term: u64,
}

/// Failures surfaced on the node's error channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeFailure {
    /// The term could not be made durable. The in-memory term is kept.
    Persist { term: u64, reason: String },
}

/// Subscriber lists per transition kind, plus one for failures. Receivers
/// that have been dropped are pruned on the next notification.
#[derive(Default)]
pub struct Subscribers {
    all: Vec<UnboundedSender<Transition>>,
    by_state: HashMap<NodeState, Vec<UnboundedSender<Transition>>>,
    failures: Vec<UnboundedSender<NodeFailure>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to transitions into `target`, or to every transition when
    /// `target` is `None`.
    pub fn on_transition(&mut self, target: Option<NodeState>) -> UnboundedReceiver<Transition> {
        let (tx, rx) = mpsc::unbounded_channel();
        match target {
            Some(state) => self.by_state.entry(state).or_default().push(tx),
            None => self.all.push(tx),
        }
        rx
    }

    pub fn on_failure(&mut self) -> UnboundedReceiver<NodeFailure> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.failures.push(tx);
        rx
    }

    pub fn notify(&mut self, transition: Transition) {
        self.all.retain(|tx| tx.send(transition).is_ok());
        if let Some(subs) = self.by_state.get_mut(&transition.to) {
            subs.retain(|tx| tx.send(transition).is_ok());
        }
    }

    pub fn fail(&mut self, failure: NodeFailure) {
        self.failures.retain(|tx| tx.send(failure.clone()).is_ok());
    }
}
