//! Proxy server
//!
//! Accepts proxy clients and serves each one from its own task with its
//! own environment instance. Instances never share episode state.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

use super::{ProxyError, ProxyResult};
use crate::env::{translate_action_space, EnvError, EnvResult, Environment, ImageShape};
use crate::network::{is_listening, Connection, Endpoint};
use crate::protocol::proxy::{ProxyRequest, ProxyResponse};
use crate::session::{
    EpisodeDriver, Handshake, MissionTemplate, ResyncPolicy, RetryPolicy, SessionDescriptor,
    SessionTimeouts, ShutdownSignal,
};

/// Builds the environment served on one proxy connection
#[async_trait]
pub trait EnvFactory: Send + Sync {
    /// `config` is the opaque string the client sent with its create request
    async fn create(&self, config: &str) -> EnvResult<Box<dyn Environment>>;
}

/// Serves simulation sessions: each connection gets a role 0 driver on the
/// configured simulation, with the client's config used as mission text.
pub struct DriverFactory {
    server: Endpoint,
    default_mission: String,
    retry: RetryPolicy,
    timeouts: SessionTimeouts,
    resync: ResyncPolicy,
    shape: ImageShape,
    shutdown: ShutdownSignal,
}

impl DriverFactory {
    pub fn new(server: Endpoint, default_mission: impl Into<String>) -> Self {
        Self {
            server,
            default_mission: default_mission.into(),
            retry: RetryPolicy::default(),
            timeouts: SessionTimeouts::default(),
            resync: ResyncPolicy::default(),
            shape: ImageShape::default(),
            shutdown: ShutdownSignal::never(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeouts(mut self, timeouts: SessionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_resync(mut self, resync: ResyncPolicy) -> Self {
        self.resync = resync;
        self
    }

    pub fn with_shape(mut self, shape: ImageShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }
}

#[async_trait]
impl EnvFactory for DriverFactory {
    async fn create(&self, config: &str) -> EnvResult<Box<dyn Environment>> {
        let addr = self
            .server
            .resolve()
            .await
            .map_err(|source| EnvError::ConnectFailed {
                addr: self.server.to_string(),
                source,
            })?;
        if !is_listening(addr).await {
            return Err(EnvError::connect_failed(
                addr,
                std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "simulation is not listening"),
            ));
        }

        let mission = if config.trim().is_empty() {
            self.default_mission.clone()
        } else {
            config.to_string()
        };
        let handshake = Handshake::new(
            Arc::new(MissionTemplate::new(mission, 1)),
            self.retry.clone(),
            self.timeouts.clone(),
        );
        let descriptor = SessionDescriptor::new(0, self.server.clone(), Uuid::new_v4().to_string());

        Ok(Box::new(
            EpisodeDriver::new(descriptor, handshake, self.shape)
                .with_resync(self.resync.clone())
                .with_shutdown(self.shutdown.clone()),
        ))
    }
}

/// Proxy bridge server
pub struct ProxyServer {
    factory: Arc<dyn EnvFactory>,
}

impl ProxyServer {
    pub fn new<F: EnvFactory + 'static>(factory: F) -> Self {
        Self {
            factory: Arc::new(factory),
        }
    }

    /// Bind a listener for [`serve`](Self::serve)
    pub async fn bind(address: &str, port: u16) -> ProxyResult<TcpListener> {
        let bind_addr = format!("{}:{}", address, port);
        TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| ProxyError::BindFailed(format!("Failed to bind to {}: {}", bind_addr, e)))
    }

    /// Accept clients until `shutdown` fires
    pub async fn serve(&self, listener: TcpListener, mut shutdown: ShutdownSignal) -> ProxyResult<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!("Proxy server listening on {}", local_addr);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            tracing::info!("New proxy client from {}", addr);
                            let factory = self.factory.clone();

                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, addr, factory).await {
                                    tracing::error!("Proxy client {} error: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.triggered() => {
                    tracing::info!("Proxy server shutdown requested");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Serve one client: a create request, then requests until it disconnects
async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    factory: Arc<dyn EnvFactory>,
) -> ProxyResult<()> {
    let mut conn = Connection::new(stream, addr);

    let Some(opening) = conn.recv().await? else {
        return Ok(());
    };
    let config = match ProxyRequest::decode(&opening)? {
        ProxyRequest::Create { config } => config,
        other => return Err(ProxyError::UnexpectedRequest(other.kind())),
    };

    let mut env = match factory.create(&config).await {
        Ok(env) => env,
        Err(e) => {
            conn.send(&ProxyResponse::Error(e.to_string()).encode()?).await?;
            conn.shutdown().await;
            return Err(e.into());
        }
    };

    let created = ProxyResponse::Created {
        action_space: translate_action_space(&env.action_space()),
        observation_shape: env.observation_shape(),
    };
    conn.send(&created.encode()?).await?;

    let result = serve_requests(&mut conn, env.as_mut()).await;

    if let Err(e) = env.close().await {
        tracing::debug!("Closing environment for {}: {}", addr, e);
    }
    conn.shutdown().await;
    tracing::info!("Proxy client {} disconnected", addr);
    result
}

async fn serve_requests(conn: &mut Connection, env: &mut dyn Environment) -> ProxyResult<()> {
    while let Some(payload) = conn.recv().await? {
        let request = match ProxyRequest::decode(&payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Undecodable request from {}: {}", conn.remote_addr(), e);
                return Ok(());
            }
        };
        tracing::debug!("Proxy request from {}: {}", conn.remote_addr(), request.kind());

        let response = match request {
            ProxyRequest::Reset => env.reset().await.map(ProxyResponse::Observation),
            ProxyRequest::Step(action) => env.step(&action).await.map(ProxyResponse::Step),
            ProxyRequest::DescribeActionSpace => Ok(ProxyResponse::ActionSpace(env.action_space())),
            ProxyRequest::Close => {
                let response = match env.close().await {
                    Ok(()) => ProxyResponse::Closed,
                    Err(e) => ProxyResponse::Error(e.to_string()),
                };
                conn.send(&response.encode()?).await?;
                return Ok(());
            }
            ProxyRequest::Create { .. } => {
                return Err(ProxyError::UnexpectedRequest("create"));
            }
        }
        .unwrap_or_else(|e| ProxyResponse::Error(e.to_string()));

        conn.send(&response.encode()?).await?;
    }
    Ok(())
}
