//! In-process environments for proxy tests

use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::TcpListener;

use super::{EnvFactory, ProxyServer};
use crate::env::{
    Action, ActionSpace, EnvError, EnvResult, Environment, ImageShape, Observation, StepResult,
};
use crate::session::testing::test_shape;
use crate::session::Shutdown;

/// Finishes after two steps; reward is the step count
pub struct CounterEnv {
    steps: u32,
    started: bool,
}

#[async_trait]
impl Environment for CounterEnv {
    async fn reset(&mut self) -> EnvResult<Observation> {
        self.steps = 0;
        self.started = true;
        Ok(Observation::zeros(test_shape()))
    }

    async fn step(&mut self, action: &Action) -> EnvResult<StepResult> {
        if !self.started {
            return Err(EnvError::InvalidSequence("step called before reset"));
        }
        if !self.action_space().contains(action) {
            return Err(EnvError::InvalidAction(format!("{:?}", action)));
        }
        self.steps += 1;
        Ok(StepResult {
            observation: Observation::zeros(test_shape()),
            reward: self.steps as f64,
            done: self.steps >= 2,
            info: Some(format!("{:?}", action)),
        })
    }

    async fn close(&mut self) -> EnvResult<()> {
        self.started = false;
        Ok(())
    }

    fn action_space(&self) -> ActionSpace {
        ActionSpace::Discrete(4)
    }

    fn observation_shape(&self) -> ImageShape {
        test_shape()
    }
}

/// Builds a [`CounterEnv`] per connection; config `"reject"` fails
pub struct CounterFactory;

#[async_trait]
impl EnvFactory for CounterFactory {
    async fn create(&self, config: &str) -> EnvResult<Box<dyn Environment>> {
        if config == "reject" {
            return Err(EnvError::InvalidAction("rejected config".into()));
        }
        Ok(Box::new(CounterEnv {
            steps: 0,
            started: false,
        }))
    }
}

/// Serve `factory` on a loopback port until the returned handle fires
pub async fn spawn_server<F: EnvFactory + 'static>(factory: F) -> (SocketAddr, Shutdown) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, signal) = Shutdown::new();
    let server = ProxyServer::new(factory);
    tokio::spawn(async move { server.serve(listener, signal).await });
    (addr, shutdown)
}
