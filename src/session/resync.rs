//! Periodic session rebuild
//!
//! Long-lived simulations drift; every `period` episodes the session is
//! torn down and the next reset reconnects and reruns the handshake.

use std::time::Duration;

use super::handshake::Handshake;
use super::wait::{pause, ShutdownSignal};
use super::SessionDescriptor;
use crate::env::{EnvError, EnvResult};
use crate::network::{Connection, Endpoint};

/// When and how to rebuild a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncPolicy {
    /// Rebuild every this many episodes, 0 = never
    pub period: u64,
    /// Also ask the service to exit and wait for its replacement
    pub exit_service: bool,
    /// Pause after asking the service to exit
    pub settle: Duration,
    /// Status pings per endpoint before giving up on a restarted service
    pub status_attempts: u32,
    pub status_interval: Duration,
}

impl Default for ResyncPolicy {
    fn default() -> Self {
        Self {
            period: 0,
            exit_service: false,
            settle: Duration::from_secs(60),
            status_attempts: 30,
            status_interval: Duration::from_secs(10),
        }
    }
}

impl ResyncPolicy {
    pub fn every(period: u64) -> Self {
        Self {
            period,
            ..Default::default()
        }
    }

    /// Whether the reset that follows `completed` resets must rebuild
    pub fn is_due(&self, completed: u64) -> bool {
        self.period > 0 && (completed + 1) % self.period == 0
    }

    /// Tear the session down so the next start reconnects
    pub async fn rebuild(
        &self,
        handshake: &Handshake,
        descriptor: &SessionDescriptor,
        conn: &mut Option<Connection>,
        shutdown: &mut ShutdownSignal,
    ) -> EnvResult<()> {
        tracing::info!(
            role = descriptor.role,
            episode = descriptor.episode,
            "Resyncing session"
        );

        if let Some(mut old) = conn.take() {
            old.shutdown().await;
        }

        if !self.exit_service {
            return Ok(());
        }

        let endpoint = descriptor.command_endpoint();
        match handshake.exit(endpoint, descriptor).await {
            Ok(accepted) => tracing::info!(role = descriptor.role, "Service exit accepted: {}", accepted),
            Err(e) => tracing::warn!(role = descriptor.role, "Service exit request failed: {}", e),
        }

        if !pause(self.settle, shutdown).await {
            return Err(EnvError::Cancelled);
        }

        self.await_service(handshake, &descriptor.server, shutdown).await?;
        self.await_service(handshake, endpoint, shutdown).await
    }

    /// Ping `endpoint` until it answers a status request
    async fn await_service(
        &self,
        handshake: &Handshake,
        endpoint: &Endpoint,
        shutdown: &mut ShutdownSignal,
    ) -> EnvResult<()> {
        for attempt in 1..=self.status_attempts {
            match handshake.status(endpoint).await {
                Ok(status) => {
                    tracing::debug!("Service {} is back: {}", endpoint, status);
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(
                        "Status {}/{} for {} failed: {}",
                        attempt,
                        self.status_attempts,
                        endpoint,
                        e
                    );
                }
            }
            if attempt < self.status_attempts && !pause(self.status_interval, shutdown).await {
                return Err(EnvError::Cancelled);
            }
        }

        Err(EnvError::ConnectFailed {
            addr: endpoint.to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                format!("no status reply after {} attempts", self.status_attempts),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{fast_retry, FakeSimulation, SimScript};
    use crate::session::{MissionTemplate, SessionTimeouts};
    use std::sync::Arc;

    #[test]
    fn test_due_every_third_reset() {
        let policy = ResyncPolicy::every(3);
        let due: Vec<u64> = (0..9).filter(|&k| policy.is_due(k)).map(|k| k + 1).collect();
        assert_eq!(due, vec![3, 6, 9]);
    }

    #[test]
    fn test_disabled_never_due() {
        let policy = ResyncPolicy::default();
        assert!((0..100).all(|k| !policy.is_due(k)));
    }

    #[tokio::test]
    async fn test_rebuild_with_exit_waits_for_status() {
        let sim = FakeSimulation::spawn(SimScript::default()).await;
        let handshake = Handshake::new(
            Arc::new(MissionTemplate::new("<Mission/>", 1)),
            fast_retry(),
            SessionTimeouts::default(),
        );
        let descriptor = crate::session::SessionDescriptor::new(0, sim.endpoint(), "exp");
        let policy = ResyncPolicy {
            period: 2,
            exit_service: true,
            settle: Duration::from_millis(5),
            status_attempts: 3,
            status_interval: Duration::from_millis(5),
        };

        let mut conn = Some(handshake.open(&sim.endpoint()).await.unwrap());
        policy
            .rebuild(&handshake, &descriptor, &mut conn, &mut ShutdownSignal::never())
            .await
            .unwrap();

        assert!(conn.is_none());
        assert_eq!(sim.stats().exits(), 1);
    }

    #[tokio::test]
    async fn test_rebuild_reports_unreachable_service() {
        let sim = FakeSimulation::spawn(SimScript::default()).await;
        let vacant = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = Endpoint::new("127.0.0.1", vacant.local_addr().unwrap().port());
        drop(vacant);

        let handshake = Handshake::new(
            Arc::new(MissionTemplate::new("<Mission/>", 2)),
            fast_retry(),
            SessionTimeouts::default(),
        );
        let descriptor =
            crate::session::SessionDescriptor::new(1, sim.endpoint(), "exp").with_secondary(dead);
        let policy = ResyncPolicy {
            period: 1,
            exit_service: true,
            settle: Duration::from_millis(1),
            status_attempts: 2,
            status_interval: Duration::from_millis(1),
        };

        let mut conn = None;
        let result = policy
            .rebuild(&handshake, &descriptor, &mut conn, &mut ShutdownSignal::never())
            .await;
        assert!(matches!(result, Err(EnvError::ConnectFailed { .. })));
    }
}
