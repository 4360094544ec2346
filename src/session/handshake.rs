//! Mission-start handshake
//!
//! Connects a role to its simulation, sends the mission payload, retries a
//! refused start a bounded number of times and then waits, without a cap,
//! for the episode to actually begin.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use super::mission::MissionSource;
use super::wait::{pause, ShutdownSignal};
use super::SessionDescriptor;
use crate::env::{EnvError, EnvResult};
use crate::network::{Connection, Endpoint};
use crate::protocol::command::{self, Command, InitReply, PeekReply};

/// Default number of mission start attempts
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Bounds on mission start retries and poll cadences
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Mission start attempts before giving up
    pub max_attempts: u32,
    /// Delay between failed start attempts
    pub backoff: Duration,
    /// Delay between "has the episode begun" checks
    pub poll_interval: Duration,
    /// Delay between integrated server lookups
    pub find_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Duration::from_secs(2),
            poll_interval: Duration::from_millis(100),
            find_interval: Duration::from_secs(1),
        }
    }
}

/// Connection timeouts for a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTimeouts {
    pub connect: Duration,
    /// `None` waits for replies indefinitely
    pub reply: Option<Duration>,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            reply: None,
        }
    }
}

/// Performs the mission-start exchange and one-shot service requests
#[derive(Clone)]
pub struct Handshake {
    mission: Arc<dyn MissionSource>,
    retry: RetryPolicy,
    timeouts: SessionTimeouts,
}

impl Handshake {
    pub fn new(mission: Arc<dyn MissionSource>, retry: RetryPolicy, timeouts: SessionTimeouts) -> Self {
        Self {
            mission,
            retry,
            timeouts,
        }
    }

    pub fn mission(&self) -> &Arc<dyn MissionSource> {
        &self.mission
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn timeouts(&self) -> &SessionTimeouts {
        &self.timeouts
    }

    /// Connect to a service and announce ourselves
    pub async fn open(&self, endpoint: &Endpoint) -> EnvResult<Connection> {
        let addr = self.resolve(endpoint).await?;
        let mut conn = Connection::connect(addr, self.timeouts.connect)
            .await?
            .with_reply_timeout(self.timeouts.reply);
        conn.send(&Command::Hello.encode()).await?;

        tracing::debug!("Opened connection {} to {}", conn.id(), addr);
        Ok(conn)
    }

    async fn resolve(&self, endpoint: &Endpoint) -> EnvResult<SocketAddr> {
        endpoint.resolve().await.map_err(|source| EnvError::ConnectFailed {
            addr: endpoint.to_string(),
            source,
        })
    }

    /// Start the mission, retrying refused or failed attempts. Returns the
    /// turn key the simulation handed out.
    ///
    /// `conn` is reused when present; a failed attempt drops it so the next
    /// attempt reconnects. Only the final failure reaches the caller.
    pub async fn start(
        &self,
        descriptor: &SessionDescriptor,
        conn: &mut Option<Connection>,
        shutdown: &mut ShutdownSignal,
    ) -> EnvResult<String> {
        let endpoint = descriptor.command_endpoint();
        let mut last_error = String::new();

        for attempt in 1..=self.retry.max_attempts {
            match self.attempt_start(descriptor, conn, shutdown).await {
                Ok(reply) if reply.started => {
                    tracing::info!(
                        role = descriptor.role,
                        episode = descriptor.episode,
                        "Mission started at {} on attempt {}",
                        endpoint,
                        attempt
                    );
                    return Ok(reply.turn_key);
                }
                Ok(_) => {
                    // A refusal leaves the connection usable for the next attempt.
                    tracing::warn!(
                        role = descriptor.role,
                        "Mission start attempt {}/{} refused by {}",
                        attempt,
                        self.retry.max_attempts,
                        endpoint
                    );
                    last_error = "simulation refused mission start".to_string();
                }
                Err(EnvError::Cancelled) => return Err(EnvError::Cancelled),
                Err(e) => {
                    tracing::warn!(
                        role = descriptor.role,
                        "Mission start attempt {}/{} at {} failed: {}",
                        attempt,
                        self.retry.max_attempts,
                        endpoint,
                        e
                    );
                    if let Some(mut broken) = conn.take() {
                        broken.shutdown().await;
                    }
                    last_error = e.to_string();
                }
            }

            if attempt < self.retry.max_attempts && !pause(self.retry.backoff, shutdown).await {
                return Err(EnvError::Cancelled);
            }
        }

        Err(EnvError::MissionStartFailed {
            role: descriptor.role,
            addr: endpoint.to_string(),
            attempts: self.retry.max_attempts,
            reason: last_error,
        })
    }

    /// One start attempt. A reply with `started == false` is a refusal.
    async fn attempt_start(
        &self,
        descriptor: &SessionDescriptor,
        conn: &mut Option<Connection>,
        shutdown: &mut ShutdownSignal,
    ) -> EnvResult<InitReply> {
        if shutdown.is_triggered() {
            return Err(EnvError::Cancelled);
        }

        let server_port = if descriptor.role != 0 {
            Some(self.find_server(descriptor, shutdown).await?)
        } else {
            None
        };

        if conn.as_ref().map_or(true, |c| !c.is_active()) {
            *conn = Some(self.open(descriptor.command_endpoint()).await?);
        }
        let Some(active) = conn.as_mut() else {
            return Err(EnvError::EndOfSession);
        };
        if shutdown.is_triggered() {
            return Err(EnvError::Cancelled);
        }

        let payload = self.mission.mission_init(descriptor, server_port);
        let token = descriptor.token().with_agent_count(self.mission.agent_count());

        let exchange = async {
            active.send(&payload).await?;
            let code = active.request(token.as_bytes()).await?;
            let turn_key = active.recv_reply().await?;
            Ok::<_, EnvError>(InitReply::decode(&code, &turn_key)?)
        };
        tokio::select! {
            reply = exchange => reply,
            _ = shutdown.triggered() => Err(EnvError::Cancelled),
        }
    }

    /// Ask the head node for the integrated server port, polling until the
    /// head role's mission is hosting one.
    pub async fn find_server(
        &self,
        descriptor: &SessionDescriptor,
        shutdown: &mut ShutdownSignal,
    ) -> EnvResult<u16> {
        let mut head = self.open(&descriptor.server).await?;
        let request = Command::Find(descriptor.token().to_string()).encode();

        let port = loop {
            let reply = tokio::select! {
                reply = head.request(&request) => reply?,
                _ = shutdown.triggered() => return Err(EnvError::Cancelled),
            };
            let port = command::decode_code("find", &reply)?;
            if port != 0 {
                break port;
            }
            if !pause(self.retry.find_interval, shutdown).await {
                return Err(EnvError::Cancelled);
            }
        };
        head.shutdown().await;

        let port = u16::try_from(port)
            .map_err(|_| EnvError::ProtocolViolation(format!("find returned port {}", port)))?;
        tracing::debug!(role = descriptor.role, "Found integrated server port {}", port);
        Ok(port)
    }

    /// Peek once at the running mission
    pub async fn peek(&self, conn: &mut Connection) -> EnvResult<PeekReply> {
        let observation = conn.request(&Command::Peek.encode()).await?;
        let done = conn.recv_reply().await?;
        Ok(PeekReply::decode(observation, &done)?)
    }

    /// Poll until the simulation reports the episode has begun (or already
    /// ended). No attempt cap; only `shutdown` interrupts it.
    pub async fn wait_for_begin(
        &self,
        conn: &mut Connection,
        shutdown: &mut ShutdownSignal,
    ) -> EnvResult<PeekReply> {
        let mut polls = 0u64;
        loop {
            if shutdown.is_triggered() {
                return Err(EnvError::Cancelled);
            }

            let reply = tokio::select! {
                reply = self.peek(conn) => reply?,
                _ = shutdown.triggered() => return Err(EnvError::Cancelled),
            };
            polls += 1;

            if reply.has_begun() || reply.done {
                tracing::debug!("Mission began after {} polls", polls);
                return Ok(reply);
            }
            if !pause(self.retry.poll_interval, shutdown).await {
                return Err(EnvError::Cancelled);
            }
        }
    }

    /// Send a one-shot request on a fresh connection and return the reply
    async fn one_shot(&self, endpoint: &Endpoint, request: Command) -> EnvResult<Vec<u8>> {
        let mut conn = self.open(endpoint).await?;
        let reply = conn.request(&request.encode()).await;
        conn.shutdown().await;
        Ok(reply?)
    }

    /// Service status text
    pub async fn status(&self, endpoint: &Endpoint) -> EnvResult<String> {
        let reply = self.one_shot(endpoint, Command::Status).await?;
        Ok(command::decode_text("status", &reply)?)
    }

    /// Ask the service to exit so its launcher restarts it
    pub async fn exit(&self, endpoint: &Endpoint, descriptor: &SessionDescriptor) -> EnvResult<bool> {
        let reply = self
            .one_shot(endpoint, Command::Exit(descriptor.token().to_string()))
            .await?;
        Ok(command::decode_code("exit", &reply)? != 0)
    }

    /// Release the token on the head node
    pub async fn close(&self, descriptor: &SessionDescriptor) -> EnvResult<bool> {
        let reply = self
            .one_shot(&descriptor.server, Command::Close(descriptor.token().to_string()))
            .await?;
        Ok(command::decode_code("close", &reply)? != 0)
    }

    /// Reset the head node's episode count for this experiment
    pub async fn reinit(&self, descriptor: &SessionDescriptor) -> EnvResult<bool> {
        let reply = self
            .one_shot(&descriptor.server, Command::Init(descriptor.token().to_string()))
            .await?;
        Ok(command::decode_code("init", &reply)? != 0)
    }
}
