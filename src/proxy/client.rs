//! Proxy client
//!
//! A remote environment that looks like a local one: every call is one
//! request and one response over a framed connection.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;

use super::{ProxyError, ProxyResult};
use crate::env::{
    Action, ActionSpace, EnvError, EnvResult, Environment, ImageShape, Observation, StepResult,
};
use crate::network::Connection;
use crate::protocol::proxy::{ProxyRequest, ProxyResponse};

/// Client side of a proxied environment
pub struct ProxyClient {
    conn: Connection,
    /// Space reported when the environment was created
    action_space: ActionSpace,
    observation_shape: ImageShape,
}

impl ProxyClient {
    /// Connect and ask the server to build an environment from `config`
    pub async fn connect(addr: SocketAddr, config: &str, timeout: Duration) -> ProxyResult<Self> {
        let mut conn = Connection::connect(addr, timeout).await?;
        let request = ProxyRequest::Create {
            config: config.to_string(),
        };
        let reply = conn.request(&request.encode()?).await?;

        let (action_space, observation_shape) = match ProxyResponse::decode(&reply)? {
            ProxyResponse::Created {
                action_space: Some(action_space),
                observation_shape,
            } => (action_space, observation_shape),
            ProxyResponse::Created {
                action_space: None, ..
            } => {
                conn.shutdown().await;
                return Err(ProxyError::UnsupportedActionSpace);
            }
            ProxyResponse::Error(message) => return Err(ProxyError::Rejected(message)),
            other => return Err(ProxyError::UnexpectedResponse(format!("{:?}", other))),
        };

        tracing::info!("Proxy environment created at {} with {:?}", addr, action_space);
        Ok(Self {
            conn,
            action_space,
            observation_shape,
        })
    }

    pub fn connection_id(&self) -> u64 {
        self.conn.id()
    }

    /// Ask the server for the environment's current action space
    pub async fn describe_action_space(&mut self) -> EnvResult<ActionSpace> {
        match self.call(ProxyRequest::DescribeActionSpace).await? {
            ProxyResponse::ActionSpace(space) => Ok(space),
            other => self.unexpected(other).await,
        }
    }

    async fn call(&mut self, request: ProxyRequest) -> EnvResult<ProxyResponse> {
        let payload = request
            .encode()
            .map_err(|e| EnvError::InvalidAction(e.to_string()))?;
        let reply = self.conn.request(&payload).await?;
        match ProxyResponse::decode(&reply) {
            Ok(ProxyResponse::Error(message)) => Err(EnvError::Remote(message)),
            Ok(response) => Ok(response),
            Err(e) => {
                self.conn.shutdown().await;
                Err(EnvError::ProtocolViolation(e.to_string()))
            }
        }
    }

    async fn unexpected<T>(&mut self, response: ProxyResponse) -> EnvResult<T> {
        self.conn.shutdown().await;
        Err(EnvError::ProtocolViolation(format!(
            "unexpected proxy response {:?}",
            response
        )))
    }
}

#[async_trait]
impl Environment for ProxyClient {
    async fn reset(&mut self) -> EnvResult<Observation> {
        match self.call(ProxyRequest::Reset).await? {
            ProxyResponse::Observation(observation) => Ok(observation),
            other => self.unexpected(other).await,
        }
    }

    async fn step(&mut self, action: &Action) -> EnvResult<StepResult> {
        match self.call(ProxyRequest::Step(action.clone())).await? {
            ProxyResponse::Step(result) => Ok(result),
            other => self.unexpected(other).await,
        }
    }

    async fn close(&mut self) -> EnvResult<()> {
        if self.conn.is_active() {
            if let Err(e) = self.call(ProxyRequest::Close).await {
                tracing::debug!("Proxy close request failed: {}", e);
            }
        }
        self.conn.shutdown().await;
        Ok(())
    }

    fn action_space(&self) -> ActionSpace {
        self.action_space.clone()
    }

    fn observation_shape(&self) -> ImageShape {
        self.observation_shape
    }
}
