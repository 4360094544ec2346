//! Proxy bridge messages
//!
//! Each request and response is one bincode-encoded enum inside a frame.
//! A session opens with [`ProxyRequest::Create`]; every later request gets
//! exactly one response.

use serde::{Deserialize, Serialize};

use crate::env::{Action, ActionSpace, ImageShape, Observation, StepResult};

/// Requests from a proxy client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProxyRequest {
    /// Build this connection's environment from an opaque config string
    Create { config: String },
    Reset,
    Step(Action),
    Close,
    DescribeActionSpace,
}

/// Responses from the proxy server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProxyResponse {
    Created {
        /// `None` when the environment's space cannot be offered flat
        action_space: Option<ActionSpace>,
        observation_shape: ImageShape,
    },
    Observation(Observation),
    Step(StepResult),
    Closed,
    ActionSpace(ActionSpace),
    /// The environment reported an error; the connection stays usable
    Error(String),
}

impl ProxyRequest {
    pub fn encode(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn decode(payload: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(payload)
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyRequest::Create { .. } => "create",
            ProxyRequest::Reset => "reset",
            ProxyRequest::Step(_) => "step",
            ProxyRequest::Close => "close",
            ProxyRequest::DescribeActionSpace => "describe_action_space",
        }
    }
}

impl ProxyResponse {
    pub fn encode(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn decode(payload: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_step_request_carries_structured_action() {
        let mut choice = BTreeMap::new();
        choice.insert("forward".to_string(), 1);
        let request = ProxyRequest::Step(Action::Dict(choice));

        let decoded = ProxyRequest::decode(&request.encode().unwrap()).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.kind(), "step");
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(ProxyRequest::decode(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]).is_err());
        assert!(ProxyResponse::decode(&[]).is_err());
    }
}
