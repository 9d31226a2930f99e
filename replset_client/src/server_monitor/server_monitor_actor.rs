use tokio::{sync::mpsc, time::Instant};
use tracing::instrument;

use crate::{
    server_description::ServerDescription, server_probe::ServerProbe,
    topology::TopologyMessage,
};

use super::{ServerMonitorMessage, ServerMonitorSchedule};

/// Checks one server over and over and reports every result to the topology actor.
pub(crate) struct ServerMonitorActor {
    probe: ServerProbe,
    receiver: mpsc::Receiver<ServerMonitorMessage>,
    schedule: ServerMonitorSchedule,
    /// Internal sender of the topology actor.
    topology: mpsc::Sender<TopologyMessage>,
    /// What the last check found.
    last_description: ServerDescription,
}

impl ServerMonitorActor {
    pub(crate) fn new(
        receiver: mpsc::Receiver<ServerMonitorMessage>,
        probe: ServerProbe,
        schedule: ServerMonitorSchedule,
        topology: mpsc::Sender<TopologyMessage>,
    ) -> Self {
        let last_description = ServerDescription::new(probe.address().clone());
        Self {
            probe,
            receiver,
            schedule,
            topology,
            last_description,
        }
    }

    /// Probes the server. A server that was fine a moment ago and now fails with a network
    /// error gets one immediate retry before it is reported `Unknown`.
    #[instrument(level = "debug", name = "ServerMonitor Actor - Check", skip(self), fields(address = %self.probe.address()))]
    async fn check(&mut self) -> ServerDescription {
        let mut description = self
            .probe
            .check(self.last_description.round_trip_time())
            .await;

        let network_failure = description
            .error()
            .map(|e| e.is_network_error())
            .unwrap_or(false);
        if self.last_description.is_available() && network_failure {
            tracing::debug!("Check of a previously available server failed, retrying once.");
            description = self.probe.check(None).await;
        }

        if self.last_description.is_material_change(&description) {
            match description.error() {
                Some(e) => tracing::info!(
                    "{} is now {:?} (was {:?}). Caused by: {}",
                    description.address(),
                    description.role(),
                    self.last_description.role(),
                    e
                ),
                None => tracing::info!(
                    "{} is now {:?} (was {:?})",
                    description.address(),
                    description.role(),
                    self.last_description.role()
                ),
            }
        }

        self.last_description = description.clone();
        description
    }
}

#[instrument(level = "debug", name = "Running ServerMonitor Actor", skip(actor), fields(address = %actor.probe.address()))]
pub(crate) async fn run_server_monitor_actor(mut actor: ServerMonitorActor) {
    loop {
        let started = Instant::now();
        let description = actor.check().await;

        if actor
            .topology
            .send(TopologyMessage::ServerChecked(description))
            .await
            .is_err()
        {
            tracing::debug!("Topology actor is gone, stopping monitor.");
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep_until(started + actor.schedule.heartbeat_frequency) => {},
            opt_msg = actor.receiver.recv() => {
                match opt_msg {
                    Some(ServerMonitorMessage::CheckNow) => {
                        tokio::time::sleep_until(started + actor.schedule.min_heartbeat_frequency).await;
                    }
                    None => break,
                }
            },
        }
    }
    tracing::debug!("Server monitor stopped.");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use crate::{
        server_description::{ServerDescription, ServerRole},
        server_monitor::{ServerMonitor, ServerMonitorSchedule},
        server_probe::ProbeError,
        test_support::{addr, secondary_reply, ScriptedHealthCheck},
        topology::TopologyMessage,
    };

    fn schedule() -> ServerMonitorSchedule {
        ServerMonitorSchedule {
            heartbeat_frequency: Duration::from_secs(10),
            min_heartbeat_frequency: Duration::from_millis(500),
        }
    }

    async fn next_check(receiver: &mut mpsc::Receiver<TopologyMessage>) -> ServerDescription {
        match receiver.recv().await {
            Some(TopologyMessage::ServerChecked(description)) => description,
            other => panic!("expected a server check, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_reports_every_heartbeat() {
        // Arrange
        let address = addr("a:27017");
        let health_check = ScriptedHealthCheck::new();
        health_check.set_reply(&address, secondary_reply("rs", &["a:27017"]));
        let (sender, mut receiver) = mpsc::channel(8);
        let started = tokio::time::Instant::now();

        // Act
        let _monitor = ServerMonitor::new(
            address.clone(),
            Box::new(health_check.clone()),
            Duration::from_secs(1),
            0.2,
            schedule(),
            sender,
        );
        for _ in 0..3 {
            let description = next_check(&mut receiver).await;
            assert_eq!(description.role(), ServerRole::RsSecondary);
        }

        // Assert
        assert_eq!(started.elapsed(), Duration::from_secs(20));
        assert_eq!(health_check.calls(&address), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn check_requests_are_coalesced_and_rate_limited() {
        // Arrange
        let address = addr("a:27017");
        let health_check = ScriptedHealthCheck::new();
        health_check.set_reply(&address, secondary_reply("rs", &["a:27017"]));
        let (sender, mut receiver) = mpsc::channel(8);
        let monitor = ServerMonitor::new(
            address.clone(),
            Box::new(health_check.clone()),
            Duration::from_secs(1),
            0.2,
            schedule(),
            sender,
        );
        next_check(&mut receiver).await;
        let first_check = tokio::time::Instant::now();

        // Act
        monitor.request_check();
        monitor.request_check();
        monitor.request_check();
        next_check(&mut receiver).await;

        // Assert
        assert_eq!(first_check.elapsed(), Duration::from_millis(500));
        assert_eq!(health_check.calls(&address), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_after_success_is_retried_once() {
        // Arrange
        let address = addr("a:27017");
        let health_check = ScriptedHealthCheck::new();
        health_check.set_reply(&address, secondary_reply("rs", &["a:27017"]));
        let (sender, mut receiver) = mpsc::channel(8);
        let _monitor = ServerMonitor::new(
            address.clone(),
            Box::new(health_check.clone()),
            Duration::from_secs(1),
            0.2,
            schedule(),
            sender,
        );
        next_check(&mut receiver).await;

        // Act
        health_check.set_error(&address, ProbeError::Network("connection reset".to_string()));
        let failed = next_check(&mut receiver).await;
        let calls_after_first_failure = health_check.calls(&address);
        next_check(&mut receiver).await;

        // Assert
        assert_eq!(failed.role(), ServerRole::Unknown);
        assert_eq!(calls_after_first_failure, 3);
        // Already unknown, so no retry this time.
        assert_eq!(health_check.calls(&address), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_stops_when_handle_is_dropped() {
        // Arrange
        let address = addr("a:27017");
        let health_check = ScriptedHealthCheck::new();
        health_check.set_reply(&address, secondary_reply("rs", &["a:27017"]));
        let (sender, mut receiver) = mpsc::channel(8);
        let monitor = ServerMonitor::new(
            address.clone(),
            Box::new(health_check.clone()),
            Duration::from_secs(1),
            0.2,
            schedule(),
            sender,
        );
        next_check(&mut receiver).await;

        // Act
        drop(monitor);

        // Assert
        assert!(receiver.recv().await.is_none());
        assert_eq!(health_check.calls(&address), 1);
    }
}
