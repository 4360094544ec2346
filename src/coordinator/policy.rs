//! Policies that choose actions for a role

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::env::{Action, ActionSpace, Observation};

/// Chooses the next action from the latest observation
pub trait Policy: Send {
    /// `None` when the policy has nothing to offer for `space`
    fn act(&mut self, observation: &Observation, space: &ActionSpace) -> Option<Action>;

    fn name(&self) -> &str;
}

/// Samples uniformly from the action space
pub struct RandomPolicy {
    rng: StdRng,
}

impl RandomPolicy {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic sampling for reproducible runs
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl Policy for RandomPolicy {
    fn act(&mut self, _observation: &Observation, space: &ActionSpace) -> Option<Action> {
        space.sample(&mut self.rng)
    }

    fn name(&self) -> &str {
        "random"
    }
}

/// Always performs the same action
pub struct ConstantPolicy {
    action: Action,
}

impl ConstantPolicy {
    pub fn new(action: Action) -> Self {
        Self { action }
    }
}

impl Policy for ConstantPolicy {
    fn act(&mut self, _observation: &Observation, _space: &ActionSpace) -> Option<Action> {
        Some(self.action.clone())
    }

    fn name(&self) -> &str {
        "constant"
    }
}
