//! Episode driver
//!
//! Exposes one role's session as an [`Environment`]: reset starts (or
//! restarts) a mission and waits for it to begin, step sends one command
//! and decodes one reply, close releases the connection.

use async_trait::async_trait;

use super::handshake::Handshake;
use super::resync::ResyncPolicy;
use super::wait::{pause, ShutdownSignal};
use super::{EpisodeState, Phase, SessionDescriptor};
use crate::env::{
    Action, ActionSpace, EnvError, EnvResult, Environment, ImageShape, Observation, StepResult,
};
use crate::network::Connection;
use crate::protocol::command::{self, Command, StepOptions, StepReply};

/// Drives episodes for a single role
pub struct EpisodeDriver {
    descriptor: SessionDescriptor,
    handshake: Handshake,
    resync: ResyncPolicy,
    conn: Option<Connection>,
    state: EpisodeState,
    phase: Phase,
    /// Discrete action index -> simulation command
    commands: Vec<String>,
    shape: ImageShape,
    step_options: StepOptions,
    /// Handed out by the last mission start
    turn_key: String,
    /// A mission start succeeded and its token has not been released
    token_held: bool,
    shutdown: ShutdownSignal,
}

impl EpisodeDriver {
    pub fn new(descriptor: SessionDescriptor, handshake: Handshake, shape: ImageShape) -> Self {
        let commands = handshake.mission().commands(descriptor.role);
        let resync = ResyncPolicy::every(descriptor.resync);
        Self {
            descriptor,
            handshake,
            resync,
            conn: None,
            state: EpisodeState::idle(),
            phase: Phase::Idle,
            commands,
            shape,
            step_options: StepOptions::default(),
            turn_key: String::new(),
            token_held: false,
            shutdown: ShutdownSignal::never(),
        }
    }

    /// Replace the resync policy; its period becomes the session's threshold
    pub fn with_resync(mut self, policy: ResyncPolicy) -> Self {
        self.descriptor.resync = policy.period;
        self.resync = policy;
        self
    }

    pub fn with_step_options(mut self, options: StepOptions) -> Self {
        self.step_options = options;
        self
    }

    /// Let `signal` interrupt reset and any step awaiting its reply
    pub fn with_shutdown(mut self, signal: ShutdownSignal) -> Self {
        self.shutdown = signal;
        self
    }

    pub fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> &EpisodeState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    pub fn turn_key(&self) -> &str {
        &self.turn_key
    }

    /// Whether the shutdown signal has fired
    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Identity of the open connection, if any
    pub fn connection_id(&self) -> Option<u64> {
        self.conn.as_ref().map(|c| c.id())
    }

    /// Reset the head node's episode count for this experiment
    pub async fn reinit(&self) -> EnvResult<bool> {
        self.handshake.reinit(&self.descriptor).await
    }

    /// Status text of this role's command service
    pub async fn status(&self) -> EnvResult<String> {
        self.handshake.status(self.descriptor.command_endpoint()).await
    }

    async fn drop_connection(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.shutdown().await;
        }
    }

    /// Ask the simulation to end the running episode, polling until it agrees.
    /// A broken connection is dropped; the next start reconnects.
    async fn quit_episode(&mut self) -> EnvResult<()> {
        let request = Command::Quit.encode();
        let interval = self.handshake.retry().poll_interval;

        loop {
            let Some(conn) = self.conn.as_mut() else {
                return Ok(());
            };
            let reply = tokio::select! {
                reply = conn.request(&request) => reply,
                _ = self.shutdown.triggered() => return Err(EnvError::Cancelled),
            };

            let outcome = reply
                .map_err(EnvError::from)
                .and_then(|r| command::decode_code("quit", &r).map_err(EnvError::from));
            match outcome {
                Ok(0) => {}
                Ok(_) => {
                    tracing::debug!(role = self.descriptor.role, "Episode quit acknowledged");
                    self.state.finish();
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(role = self.descriptor.role, "Quit failed, dropping connection: {}", e);
                    self.drop_connection().await;
                    return Ok(());
                }
            }

            if !pause(interval, &mut self.shutdown).await {
                return Err(EnvError::Cancelled);
            }
        }
    }

    async fn begin_episode(&mut self) -> EnvResult<Observation> {
        self.phase = Phase::Connecting;
        self.turn_key = self
            .handshake
            .start(&self.descriptor, &mut self.conn, &mut self.shutdown)
            .await?;
        self.token_held = true;

        self.phase = Phase::WaitingToBegin;
        let Some(conn) = self.conn.as_mut() else {
            return Err(EnvError::EndOfSession);
        };
        let reply = self.handshake.wait_for_begin(conn, &mut self.shutdown).await?;

        self.state.begin();
        if reply.done {
            self.state.finish();
            self.phase = Phase::Done;
        } else {
            self.phase = Phase::Running;
        }

        let observation = Observation::from_bytes(reply.observation, self.shape);
        if !observation.is_well_formed() {
            tracing::warn!(
                role = self.descriptor.role,
                "Observation has {} bytes, expected {}",
                observation.data.len(),
                self.shape.len()
            );
        }
        Ok(observation)
    }

    fn command_for(&self, action: &Action) -> EnvResult<String> {
        match action {
            Action::Discrete(index) => self
                .commands
                .get(*index as usize)
                .cloned()
                .ok_or_else(|| {
                    EnvError::InvalidAction(format!(
                        "index {} outside {} commands",
                        index,
                        self.commands.len()
                    ))
                }),
            Action::Command(command) => Ok(command.clone()),
            other => Err(EnvError::InvalidAction(format!(
                "{:?} is not a discrete action",
                other
            ))),
        }
    }

    async fn exchange_step(&mut self, command: String) -> EnvResult<StepReply> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(EnvError::EndOfSession);
        };
        let request = Command::Step {
            options: self.step_options,
            command,
        }
        .encode();
        let reply = tokio::select! {
            reply = conn.request(&request) => reply?,
            _ = self.shutdown.triggered() => return Err(EnvError::Cancelled),
        };
        Ok(StepReply::decode(&reply, self.step_options)?)
    }
}

#[async_trait]
impl Environment for EpisodeDriver {
    async fn reset(&mut self) -> EnvResult<Observation> {
        if self.resync.is_due(self.descriptor.episode) {
            self.resync
                .rebuild(&self.handshake, &self.descriptor, &mut self.conn, &mut self.shutdown)
                .await?;
        } else if self.conn.is_some() && self.state.has_begun && !self.state.done {
            self.quit_episode().await?;
        }

        self.descriptor.episode += 1;
        self.state = EpisodeState::idle();
        tracing::info!(
            role = self.descriptor.role,
            episode = self.descriptor.episode,
            "Resetting episode"
        );

        match self.begin_episode().await {
            Ok(observation) => Ok(observation),
            Err(e) => {
                self.phase = Phase::Idle;
                if e.is_fatal_for_session() {
                    self.drop_connection().await;
                }
                Err(e)
            }
        }
    }

    async fn step(&mut self, action: &Action) -> EnvResult<StepResult> {
        if !self.state.has_begun {
            return Err(EnvError::InvalidSequence("step called before reset"));
        }
        if self.state.done {
            return Err(EnvError::InvalidSequence("step called after episode finished"));
        }
        if self.shutdown.is_triggered() {
            self.state.is_running = false;
            self.phase = Phase::Idle;
            self.drop_connection().await;
            return Err(EnvError::Cancelled);
        }

        let command = self.command_for(action)?;
        tracing::debug!(role = self.descriptor.role, "Step {}: {}", self.state.step_count + 1, command);

        let reply = match self.exchange_step(command).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(role = self.descriptor.role, "Step failed: {}", e);
                self.state.is_running = false;
                self.phase = Phase::Idle;
                self.drop_connection().await;
                return Err(e);
            }
        };

        if !reply.sent {
            tracing::debug!(role = self.descriptor.role, "Simulation did not accept the command");
        }
        self.state.step_count += 1;
        if reply.done {
            self.state.finish();
            self.phase = Phase::Done;
            tracing::info!(
                role = self.descriptor.role,
                episode = self.descriptor.episode,
                "Episode finished after {} steps",
                self.state.step_count
            );
        }

        Ok(StepResult {
            observation: Observation::from_bytes(reply.observation, self.shape),
            reward: reply.reward,
            done: self.state.done,
            info: reply.info,
        })
    }

    /// Release the token on the head node, then drop this role's connection.
    /// The release is bounded by the connect timeout.
    async fn close(&mut self) -> EnvResult<()> {
        if std::mem::take(&mut self.token_held) {
            let limit = self.handshake.timeouts().connect;
            match tokio::time::timeout(limit, self.handshake.close(&self.descriptor)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    tracing::debug!(role = self.descriptor.role, "Close request failed: {}", e)
                }
                Err(_) => tracing::debug!(role = self.descriptor.role, "Close request timed out"),
            }
        }
        self.drop_connection().await;
        self.state = EpisodeState::idle();
        self.phase = Phase::Idle;
        Ok(())
    }

    fn action_space(&self) -> ActionSpace {
        ActionSpace::Discrete(self.commands.len() as u32)
    }

    fn observation_shape(&self) -> ImageShape {
        self.shape
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{fast_retry, test_shape, FakeSimulation, SimScript};
    use crate::session::{MissionTemplate, SessionTimeouts, Shutdown};
    use std::sync::Arc;
    use std::time::Duration;

    fn driver(sim: &FakeSimulation, resync: u64) -> EpisodeDriver {
        let handshake = Handshake::new(
            Arc::new(MissionTemplate::new("<Mission/>", 1)),
            fast_retry(),
            SessionTimeouts::default(),
        );
        let descriptor = SessionDescriptor::new(0, sim.endpoint(), "exp").with_resync(resync);
        EpisodeDriver::new(descriptor, handshake, test_shape())
    }

    async fn run_to_done(env: &mut EpisodeDriver) -> u64 {
        let mut steps = 0;
        loop {
            steps += 1;
            if env.step(&Action::Discrete(0)).await.unwrap().done {
                return steps;
            }
        }
    }

    #[tokio::test]
    async fn test_step_before_reset_is_invalid() {
        let sim = FakeSimulation::spawn(SimScript::default()).await;
        let mut env = driver(&sim, 0);

        let result = env.step(&Action::Discrete(0)).await;
        assert!(matches!(result, Err(EnvError::InvalidSequence(_))));
        assert_eq!(sim.stats().connections(), 0);
    }

    #[tokio::test]
    async fn test_full_episode_then_step_after_done() {
        let sim = FakeSimulation::spawn(SimScript::default()).await;
        let mut env = driver(&sim, 0);

        let obs = env.reset().await.unwrap();
        assert!(obs.is_well_formed());
        assert_eq!(obs.pixel(1, 1, 2), Some(7));
        assert_eq!(env.phase(), Phase::Running);

        let first = env.step(&Action::Discrete(0)).await.unwrap();
        assert_eq!(first.reward, 1.5);
        assert!(!first.done);
        assert_eq!(first.info.as_deref(), Some("{\"step\":1}"));

        env.step(&Action::Discrete(1)).await.unwrap();
        let last = env.step(&Action::Command("jump 1".into())).await.unwrap();
        assert!(last.done);
        assert_eq!(env.state().step_count, 3);
        assert_eq!(env.phase(), Phase::Done);

        let result = env.step(&Action::Discrete(0)).await;
        assert!(matches!(result, Err(EnvError::InvalidSequence(_))));
        assert_eq!(sim.stats().commands(), vec!["move 1", "move -1", "jump 1"]);
    }

    #[tokio::test]
    async fn test_invalid_actions_keep_session() {
        let sim = FakeSimulation::spawn(SimScript::default()).await;
        let mut env = driver(&sim, 0);
        env.reset().await.unwrap();

        let out_of_range = env.step(&Action::Discrete(99)).await;
        assert!(matches!(out_of_range, Err(EnvError::InvalidAction(_))));
        let continuous = env.step(&Action::Continuous(vec![0.5])).await;
        assert!(matches!(continuous, Err(EnvError::InvalidAction(_))));

        assert!(env.connection_id().is_some());
        assert!(env.step(&Action::Discrete(2)).await.is_ok());
        assert_eq!(sim.stats().commands(), vec!["turn 1"]);
    }

    #[tokio::test]
    async fn test_resync_every_third_reset_rebuilds_connection() {
        let sim = FakeSimulation::spawn(SimScript::default()).await;
        let mut env = driver(&sim, 3);

        let mut ids = Vec::new();
        for _ in 0..6 {
            env.reset().await.unwrap();
            ids.push(env.connection_id().unwrap());
            run_to_done(&mut env).await;
        }

        assert_eq!(ids[0], ids[1]);
        assert_ne!(ids[1], ids[2]);
        assert_eq!(ids[2], ids[3]);
        assert_eq!(ids[3], ids[4]);
        assert_ne!(ids[4], ids[5]);
        assert_eq!(sim.stats().connections(), 3);
    }

    #[tokio::test]
    async fn test_without_resync_connection_is_reused() {
        let sim = FakeSimulation::spawn(SimScript::default()).await;
        let mut env = driver(&sim, 0);

        env.reset().await.unwrap();
        let id = env.connection_id();
        for _ in 0..4 {
            run_to_done(&mut env).await;
            env.reset().await.unwrap();
            assert_eq!(env.connection_id(), id);
        }
        assert_eq!(sim.stats().connections(), 1);
    }

    #[tokio::test]
    async fn test_reset_mid_episode_quits_and_advances_episode() {
        let sim = FakeSimulation::spawn(SimScript::default()).await;
        let handshake = Handshake::new(
            Arc::new(MissionTemplate::new("<Mission/>", 1)),
            fast_retry(),
            SessionTimeouts::default(),
        );
        let descriptor = SessionDescriptor::new(0, sim.endpoint(), "exp").with_episode(5);
        let mut env = EpisodeDriver::new(descriptor, handshake, test_shape());

        env.reset().await.unwrap();
        env.step(&Action::Discrete(0)).await.unwrap();
        env.reset().await.unwrap();

        assert_eq!(sim.stats().quits(), 1);
        assert_eq!(sim.stats().tokens(), vec!["exp:0:6:1", "exp:0:7:1"]);
        assert_eq!(env.descriptor().episode, 7);
        assert_eq!(env.state().step_count, 0);
    }

    #[tokio::test]
    async fn test_hang_up_mid_step_is_end_of_session() {
        let sim = FakeSimulation::spawn(SimScript {
            hang_up_on_step: Some(2),
            ..Default::default()
        })
        .await;
        let mut env = driver(&sim, 0);

        env.reset().await.unwrap();
        env.step(&Action::Discrete(0)).await.unwrap();
        let result = env.step(&Action::Discrete(0)).await;

        assert!(matches!(result, Err(EnvError::EndOfSession)));
        assert!(env.connection_id().is_none());
        assert!(env.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_sends_close_and_is_idempotent() {
        let sim = FakeSimulation::spawn(SimScript::default()).await;
        let mut env = driver(&sim, 0);

        env.reset().await.unwrap();
        env.close().await.unwrap();
        env.close().await.unwrap();

        assert_eq!(sim.stats().closes(), 1);
        assert_eq!(env.phase(), Phase::Idle);
        let result = env.step(&Action::Discrete(0)).await;
        assert!(matches!(result, Err(EnvError::InvalidSequence(_))));
    }

    #[tokio::test]
    async fn test_reset_cancelled_while_waiting_to_begin() {
        let sim = FakeSimulation::spawn(SimScript {
            peeks_before_begin: u64::MAX,
            ..Default::default()
        })
        .await;
        let (shutdown, signal) = Shutdown::new();
        let mut env = driver(&sim, 0).with_shutdown(signal);

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            shutdown.trigger();
        });

        let result = env.reset().await;
        assert!(matches!(result, Err(EnvError::Cancelled)));
        assert_eq!(env.phase(), Phase::Idle);
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_step_awaiting_reply() {
        let sim = FakeSimulation::spawn(SimScript {
            stall_on_step: Some(1),
            ..Default::default()
        })
        .await;
        let (shutdown, signal) = Shutdown::new();
        let mut env = driver(&sim, 0).with_shutdown(signal);
        env.reset().await.unwrap();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.trigger();
        });

        let result = tokio::time::timeout(Duration::from_secs(2), env.step(&Action::Discrete(0)))
            .await
            .expect("step still pending after shutdown");
        assert!(matches!(result, Err(EnvError::Cancelled)));
        assert!(env.connection_id().is_none());
        assert_eq!(env.phase(), Phase::Idle);

        // further steps fail fast without touching the wire
        let again = env.step(&Action::Discrete(0)).await;
        assert!(matches!(again, Err(EnvError::Cancelled)));
        assert_eq!(sim.stats().steps(), 1);
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_releases_token_on_head_node() {
        let head = FakeSimulation::spawn(SimScript::default()).await;
        let own = FakeSimulation::spawn(SimScript::default()).await;
        let handshake = Handshake::new(
            Arc::new(MissionTemplate::new("<Mission/>", 2)),
            fast_retry(),
            SessionTimeouts::default(),
        );
        let descriptor =
            SessionDescriptor::new(1, head.endpoint(), "exp").with_secondary(own.endpoint());
        let mut env = EpisodeDriver::new(descriptor, handshake, test_shape());

        env.reset().await.unwrap();
        env.close().await.unwrap();

        assert_eq!(head.stats().closes(), 1);
        assert_eq!(own.stats().closes(), 0);
        assert_eq!(own.stats().start_requests(), 1);
        assert!(env.connection_id().is_none());
    }

    #[tokio::test]
    async fn test_close_after_hang_up_still_releases_token() {
        let sim = FakeSimulation::spawn(SimScript {
            hang_up_on_step: Some(1),
            ..Default::default()
        })
        .await;
        let mut env = driver(&sim, 0);

        env.reset().await.unwrap();
        assert!(env.step(&Action::Discrete(0)).await.is_err());
        env.close().await.unwrap();

        assert_eq!(sim.stats().closes(), 1);
    }

    #[tokio::test]
    async fn test_close_before_reset_sends_nothing() {
        let sim = FakeSimulation::spawn(SimScript::default()).await;
        let mut env = driver(&sim, 0);

        env.close().await.unwrap();
        assert_eq!(sim.stats().connections(), 0);
    }

    #[tokio::test]
    async fn test_action_space_covers_commands() {
        let sim = FakeSimulation::spawn(SimScript::default()).await;
        let env = driver(&sim, 0);
        assert_eq!(env.action_space(), ActionSpace::Discrete(6));
        assert_eq!(env.observation_shape(), test_shape());
    }
}
