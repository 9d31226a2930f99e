use std::{collections::HashMap, sync::Arc};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{instrument, Span};
use uuid::Uuid;

use crate::{
    events::TopologyEvent,
    server_address::ServerAddress,
    server_description::ServerDescription,
    server_monitor::{ServerMonitor, ServerMonitorSchedule},
    server_probe::HealthCheck,
    topology_conventions::TopologyConventions,
    topology_description::{TopologyDescription, TopologyType, UpdateOutcome},
};

use super::{TopologyInitialConfiguration, TopologyMessage};

/// Sole owner and writer of the topology. Every published snapshot is immutable; an update
/// builds a new one and swaps it into the watch channel.
pub(crate) struct TopologyActor {
    conventions: TopologyConventions,
    description: Arc<TopologyDescription>,
    events: broadcast::Sender<TopologyEvent>,
    health_check: Box<dyn HealthCheck>,
    monitors: HashMap<ServerAddress, ServerMonitor>,
    publisher: watch::Sender<Arc<TopologyDescription>>,
    receiver: mpsc::Receiver<TopologyMessage>,
    /// Allows the actor to receive messages from itself and its monitors.
    receiver_internal: mpsc::Receiver<TopologyMessage>,
    /// Handed to every monitor so it can report back.
    sender_internal: mpsc::Sender<TopologyMessage>,
}

impl TopologyActor {
    pub(crate) fn new(
        receiver: mpsc::Receiver<TopologyMessage>,
        publisher: watch::Sender<Arc<TopologyDescription>>,
        events: broadcast::Sender<TopologyEvent>,
        initial_config: TopologyInitialConfiguration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(32);
        Self {
            conventions: initial_config.conventions,
            description: Arc::new(initial_config.description),
            events,
            health_check: initial_config.health_check,
            monitors: HashMap::default(),
            publisher,
            receiver,
            receiver_internal: rx,
            sender_internal: tx,
        }
    }

    /// Message handler for the TopologyActor
    #[instrument(
        level = "debug",
        name = "Topology Actor - Handle Message",
        skip(self),
        fields(correlation_id)
    )]
    async fn handle_message(&mut self, msg: TopologyMessage) {
        // Apply a correlation id to all child spans of this message handler
        Span::current().record("correlation_id", Uuid::new_v4().to_string());
        match msg {
            TopologyMessage::ServerChecked(server_description) => {
                self.server_checked(server_description);
            }
            TopologyMessage::RequestImmediateCheck => {
                tracing::debug!("Requesting an immediate check of {} servers", self.monitors.len());
                for monitor in self.monitors.values() {
                    monitor.request_check();
                }
            }
            TopologyMessage::Shutdown { respond_to } => {
                // Handled by the run loop, which has to drop the actor first.
                let _ = respond_to.send(());
            }
        }
    }

    fn server_checked(&mut self, server_description: ServerDescription) {
        let address = server_description.address().clone();
        let previous = self.description.server(&address).cloned();
        let (next, outcome) = self.description.with_update(server_description);

        match outcome {
            UpdateOutcome::NotAMember => {
                tracing::trace!("Ignoring check of {}, no longer part of the topology", address);
                return;
            }
            UpdateOutcome::StaleEpochIgnored => return,
            UpdateOutcome::SetNameMismatch { expected, actual } => {
                tracing::warn!(
                    "{} reports replica set {:?} but {} was expected. Removing it.",
                    address,
                    actual,
                    expected
                );
                self.emit(TopologyEvent::SetNameMismatch {
                    address: address.clone(),
                    expected,
                    actual,
                });
            }
            UpdateOutcome::Applied => {}
        }

        // Compare with what was stored, which may differ from the report itself.
        if let (Some(previous), Some(current)) = (previous, next.server(&address)) {
            if previous.is_material_change(current) {
                self.emit(TopologyEvent::ServerDescriptionChanged {
                    address: address.clone(),
                    previous_role: previous.role(),
                    new_role: current.role(),
                });
            }
        }

        self.publish(next);
    }

    /// Replaces the published snapshot and reports what changed between the two.
    fn publish(&mut self, next: TopologyDescription) {
        let previous = std::mem::replace(&mut self.description, Arc::new(next));

        let previous_type = previous.topology_type();
        let new_type = self.description.topology_type();
        if previous_type != new_type {
            tracing::info!("Topology type changed from {:?} to {:?}", previous_type, new_type);
            self.emit(TopologyEvent::TopologyTypeChanged {
                previous_type,
                new_type,
            });
            if previous_type == TopologyType::ReplicaSetWithPrimary {
                tracing::warn!("Replica set lost its primary");
                self.emit(TopologyEvent::PrimaryLost);
            }
        }

        let previous_addresses = previous.addresses();
        let addresses = self.description.addresses();
        for added in addresses.difference(&previous_addresses) {
            tracing::info!("Discovered {}", added);
            self.emit(TopologyEvent::ServerAdded(added.clone()));
        }
        for removed in previous_addresses.difference(&addresses) {
            tracing::info!("Removed {} from the topology", removed);
            self.emit(TopologyEvent::ServerRemoved(removed.clone()));
        }

        self.publisher.send_replace(self.description.clone());
        self.reconcile_monitors();
    }

    fn emit(&self, event: TopologyEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    /// Keeps exactly one monitor per address in the current snapshot.
    #[instrument(level = "trace", skip(self))]
    fn reconcile_monitors(&mut self) {
        let addresses = self.description.addresses();

        self.monitors.retain(|address, monitor| {
            let keep = addresses.contains(address);
            if !keep {
                tracing::debug!("Stopping monitor of {}", monitor.address());
            }
            keep
        });

        let schedule = ServerMonitorSchedule {
            heartbeat_frequency: self.conventions.heartbeat_frequency(),
            min_heartbeat_frequency: self.conventions.min_heartbeat_frequency(),
        };
        for address in addresses {
            if self.monitors.contains_key(&address) {
                continue;
            }
            tracing::debug!("Starting monitor of {}", address);
            let monitor = ServerMonitor::new(
                address.clone(),
                self.health_check.clone(),
                self.conventions.connect_timeout(),
                self.conventions.rtt_smoothing_weight(),
                schedule,
                self.sender_internal.clone(),
            );
            self.monitors.insert(address, monitor);
        }
    }
}

#[instrument(level = "debug", name = "Running Topology Actor", skip(actor))]
pub(crate) async fn run_topology_actor(mut actor: TopologyActor) {
    actor.reconcile_monitors();

    let mut shutdown_reply: Option<oneshot::Sender<()>> = None;
    loop {
        tokio::select! {
            opt_msg = actor.receiver.recv() => {
                match opt_msg {
                    Some(TopologyMessage::Shutdown { respond_to }) => {
                        shutdown_reply = Some(respond_to);
                        break;
                    }
                    Some(msg) => actor.handle_message(msg).await,
                    None => break,
                }
            },
            Some(msg) = actor.receiver_internal.recv() => {
                actor.handle_message(msg).await;
            }
        }
    }

    tracing::info!("Topology actor stopping, {} monitors will follow", actor.monitors.len());
    // Dropping the actor stops the monitors and closes the channels handles look at.
    drop(actor);
    if let Some(respond_to) = shutdown_reply {
        let _ = respond_to.send(());
    }
}
