use tokio::sync::oneshot;

use crate::{
    server_description::ServerDescription, server_probe::HealthCheck,
    topology_conventions::TopologyConventions, topology_description::TopologyDescription,
};

#[derive(Debug)]
pub(crate) enum TopologyMessage {
    /// Result of one check, sent by a server monitor.
    ServerChecked(ServerDescription),
    /// Asks every monitor to check its server ahead of schedule.
    RequestImmediateCheck,
    /// Stops every monitor and the actor. Answered once everything is dropped.
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Everything the [`TopologyActor`](super::TopologyActor) starts from.
#[derive(Debug)]
pub(crate) struct TopologyInitialConfiguration {
    pub(crate) conventions: TopologyConventions,
    pub(crate) description: TopologyDescription,
    pub(crate) health_check: Box<dyn HealthCheck>,
}
