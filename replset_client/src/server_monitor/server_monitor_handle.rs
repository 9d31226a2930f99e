use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{
    server_address::ServerAddress,
    server_probe::{HealthCheck, ServerProbe},
    topology::TopologyMessage,
};

use super::{run_server_monitor_actor, ServerMonitorActor, ServerMonitorMessage, ServerMonitorSchedule};

/// Handle to the monitor task of one server. Dropping it stops the task.
#[derive(Debug)]
pub(crate) struct ServerMonitor {
    address: ServerAddress,
    sender: mpsc::Sender<ServerMonitorMessage>,
}

impl ServerMonitor {
    /// Spawns the monitor. The first check starts right away.
    pub(crate) fn new(
        address: ServerAddress,
        health_check: Box<dyn HealthCheck>,
        connect_timeout: Duration,
        rtt_smoothing_weight: f64,
        schedule: ServerMonitorSchedule,
        topology: mpsc::Sender<TopologyMessage>,
    ) -> Self {
        // Capacity of one: a pending CheckNow already covers any later request.
        let (sender, receiver) = mpsc::channel(1);
        let probe = ServerProbe::new(
            address.clone(),
            health_check,
            connect_timeout,
            rtt_smoothing_weight,
        );
        let actor = ServerMonitorActor::new(receiver, probe, schedule, topology);
        tokio::spawn(run_server_monitor_actor(actor));

        Self { address, sender }
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Asks for a check ahead of the regular heartbeat. Never waits.
    pub(crate) fn request_check(&self) {
        match self.sender.try_send(ServerMonitorMessage::CheckNow) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::trace!("Check of {} already pending", self.address);
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Monitor of {} has already stopped", self.address);
            }
        }
    }
}
