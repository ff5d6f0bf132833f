//! Provider-selection strategies.
//!
//! A strategy instance is built over one provider snapshot and rebuilt by
//! the orchestrator whenever the snapshot's `updated_at` changes.

use crate::discovery::ServiceEndpoint;

/// Policy choosing one provider among the matching candidates.
pub trait SelectionStrategy: Send {
    /// Pick the next provider, or `None` when the candidate list is empty.
    fn pick(&mut self) -> Option<ServiceEndpoint>;
}

/// Factory building a strategy over a candidate list.
pub type StrategyFactory = dyn Fn(Vec<ServiceEndpoint>) -> Box<dyn SelectionStrategy> + Send + Sync;

/// Cycles through the candidates in order.
pub struct RoundRobin {
    providers: Vec<ServiceEndpoint>,
    next: usize,
}

impl RoundRobin {
    pub fn new(providers: Vec<ServiceEndpoint>) -> Self {
        Self { providers, next: 0 }
    }
}

impl SelectionStrategy for RoundRobin {
    fn pick(&mut self) -> Option<ServiceEndpoint> {
        if self.providers.is_empty() {
            return None;
        }
        let picked = self.providers[self.next % self.providers.len()].clone();
        self.next = self.next.wrapping_add(1);
        Some(picked)
    }
}
