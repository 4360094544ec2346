//! Coordinator module - Runs every role of a mission concurrently
//!
//! Each role gets its own session, driver and policy on its own task.
//! Roles share only read-only configuration; a failing role is reported
//! without disturbing its siblings.

mod policy;

pub use policy::*;

use std::sync::Arc;
use thiserror::Error;

use crate::env::{EnvError, EnvResult, Environment, ImageShape};
use crate::network::Endpoint;
use crate::protocol::command::StepOptions;
use crate::session::{
    EpisodeDriver, Handshake, MissionSource, ResyncPolicy, RetryPolicy, SessionDescriptor,
    SessionTimeouts, ShutdownSignal,
};

/// Coordinator errors, reported per role
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Env(#[from] EnvError),

    #[error("Command port for role {role} exceeds the port range")]
    PortOutOfRange { role: u32 },

    #[error("Role {role} task failed: {message}")]
    Panicked { role: u32, message: String },
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Settings shared by every role
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// The head node, role 0's command service
    pub server: Endpoint,
    /// Host of the other roles' services, defaults to the head's host
    pub secondary_address: Option<String>,
    /// Base command port for roles, defaults to the head's port
    pub secondary_port: Option<u16>,
    pub experiment_id: String,
    /// Episode count each role starts from
    pub start_episode: u64,
    /// Episodes each role runs
    pub episodes: u64,
    pub resync: ResyncPolicy,
    pub retry: RetryPolicy,
    pub timeouts: SessionTimeouts,
    pub shape: ImageShape,
    pub step_options: StepOptions,
}

impl CoordinatorConfig {
    pub fn new(server: Endpoint, experiment_id: impl Into<String>) -> Self {
        Self {
            server,
            secondary_address: None,
            secondary_port: None,
            experiment_id: experiment_id.into(),
            start_episode: 0,
            episodes: 1,
            resync: ResyncPolicy::default(),
            retry: RetryPolicy::default(),
            timeouts: SessionTimeouts::default(),
            shape: ImageShape::default(),
            step_options: StepOptions::default(),
        }
    }

    /// Session descriptor for `role`: its command service is at
    /// `base_port + role` on the secondary host.
    pub fn descriptor(&self, role: u32) -> CoordinatorResult<SessionDescriptor> {
        let base = self.secondary_port.unwrap_or(self.server.port);
        let port = u16::try_from(role)
            .ok()
            .and_then(|r| base.checked_add(r))
            .ok_or(CoordinatorError::PortOutOfRange { role })?;
        let host = self
            .secondary_address
            .clone()
            .unwrap_or_else(|| self.server.host.clone());
        let role_endpoint = Endpoint::new(host, port);

        let mut descriptor = SessionDescriptor::new(role, self.server.clone(), &self.experiment_id)
            .with_episode(self.start_episode)
            .with_resync(self.resync.period);
        if role_endpoint != self.server {
            descriptor = descriptor.with_secondary(role_endpoint);
        }
        Ok(descriptor)
    }
}

/// What one role accomplished
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoleSummary {
    pub episodes: u64,
    pub steps: u64,
    /// Sum of per-step rewards as reported
    pub total_reward: f64,
}

/// Outcome of one role
#[derive(Debug)]
pub struct RoleReport {
    pub role: u32,
    pub outcome: CoordinatorResult<RoleSummary>,
}

/// Runs one session per mission role
pub struct Coordinator {
    config: CoordinatorConfig,
    mission: Arc<dyn MissionSource>,
    shutdown: ShutdownSignal,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, mission: Arc<dyn MissionSource>) -> Self {
        Self {
            config,
            mission,
            shutdown: ShutdownSignal::never(),
        }
    }

    /// Let `signal` stop every role, including one blocked on a reply
    pub fn with_shutdown(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown = signal;
        self
    }

    pub fn role_count(&self) -> u32 {
        self.mission.agent_count() as u32
    }

    /// Run every role to completion. `make_policy` builds each role's policy.
    ///
    /// Reports are in role order; every role is joined before returning.
    pub async fn run<P, F>(&self, make_policy: F) -> Vec<RoleReport>
    where
        P: Policy + 'static,
        F: Fn(u32) -> P,
    {
        let roles = self.role_count();
        tracing::info!(
            experiment = %self.config.experiment_id,
            "Starting {} roles against {}",
            roles,
            self.config.server
        );

        let mut tasks = Vec::with_capacity(roles as usize);
        let mut reports = Vec::new();

        for role in 0..roles {
            let descriptor = match self.config.descriptor(role) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    reports.push(RoleReport {
                        role,
                        outcome: Err(e),
                    });
                    continue;
                }
            };

            let handshake = Handshake::new(
                self.mission.clone(),
                self.config.retry.clone(),
                self.config.timeouts.clone(),
            );
            let env = EpisodeDriver::new(descriptor, handshake, self.config.shape)
                .with_resync(self.config.resync.clone())
                .with_step_options(self.config.step_options)
                .with_shutdown(self.shutdown.clone());
            let policy = make_policy(role);
            let episodes = self.config.episodes;

            tasks.push((
                role,
                tokio::spawn(async move { run_role(env, policy, episodes).await }),
            ));
        }

        for (role, task) in tasks {
            let outcome = match task.await {
                Ok(Ok(summary)) => {
                    tracing::info!(
                        role,
                        "Role finished {} episodes, {} steps, reward {}",
                        summary.episodes,
                        summary.steps,
                        summary.total_reward
                    );
                    Ok(summary)
                }
                Ok(Err(e)) => {
                    tracing::error!(role, "Role failed: {}", e);
                    Err(CoordinatorError::Env(e))
                }
                Err(e) => {
                    tracing::error!(role, "Role task failed: {}", e);
                    Err(CoordinatorError::Panicked {
                        role,
                        message: e.to_string(),
                    })
                }
            };
            reports.push(RoleReport { role, outcome });
        }

        reports.sort_by_key(|report| report.role);
        reports
    }
}

/// Run `episodes` episodes on one role, closing the session at the end
async fn run_role<P: Policy>(
    mut env: EpisodeDriver,
    mut policy: P,
    episodes: u64,
) -> EnvResult<RoleSummary> {
    let space = env.action_space();
    let role = env.descriptor().role;
    let mut summary = RoleSummary::default();

    let result = async {
        for _ in 0..episodes {
            let mut observation = env.reset().await?;
            loop {
                if env.is_cancelled() {
                    return Err(EnvError::Cancelled);
                }
                let Some(action) = policy.act(&observation, &space) else {
                    return Err(EnvError::InvalidAction(format!(
                        "policy {} produced no action for {:?}",
                        policy.name(),
                        space
                    )));
                };
                let step = env.step(&action).await?;
                summary.steps += 1;
                summary.total_reward += step.reward;
                if step.done {
                    break;
                }
                observation = step.observation;
            }
            summary.episodes += 1;
        }
        Ok::<_, EnvError>(())
    }
    .await;

    if let Err(e) = env.close().await {
        tracing::debug!(role, "Close failed: {}", e);
    }
    tracing::debug!(role, "Policy {} done", policy.name());
    result.map(|()| summary)
}
