use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{broadcast, mpsc, mpsc::error::TrySendError, oneshot, watch},
    time::Instant,
};
use tracing::instrument;

use crate::{
    events::TopologyEvent,
    read_preference::ReadPreference,
    server_address::ServerAddress,
    server_selector::{self, SelectionError},
    topology_conventions::TopologyConventions,
    topology_description::TopologyDescription,
};

use super::{
    run_topology_actor, TopologyActor, TopologyBuilder, TopologyInitialConfiguration,
    TopologyMessage,
};

/**
This a handle to the topology actor.

Only one topology should exist per cluster, since every one of them keeps its own monitor
per server. Cloning this handle is very cheap and will not instantiate a new actor in the
background. When the last handle goes out of scope and is dropped, the backing actor and its
monitors are dropped too.

```rust,no_run
# tokio_test::block_on(async {
use replset_client::{ReadPreference, Topology};

let topology = Topology::builder()
    .set_hosts(&["localhost:27017"])
    .build()
    .unwrap();
let primary = topology.select_server(&ReadPreference::primary(), None).await;
println!("{:?}", primary);
# })
```
*/
#[derive(Clone, Debug)]
pub struct Topology {
    conventions: TopologyConventions,
    description: watch::Receiver<Arc<TopologyDescription>>,
    events: broadcast::Sender<TopologyEvent>,
    sender: mpsc::Sender<TopologyMessage>,
}

impl Topology {
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::default()
    }

    // This is pub(crate) so only the builder can crank it out
    pub(crate) fn new(initial_config: TopologyInitialConfiguration) -> Self {
        let (sender, receiver) = mpsc::channel(8);
        let (publisher, description) =
            watch::channel(Arc::new(initial_config.description.clone()));
        let (events, _) = broadcast::channel(64);
        let conventions = initial_config.conventions.clone();

        let actor = TopologyActor::new(receiver, publisher, events.clone(), initial_config);
        tokio::spawn(run_topology_actor(actor));

        Self {
            conventions,
            description,
            events,
            sender,
        }
    }

    /// The latest published snapshot. Never waits.
    pub fn current_topology(&self) -> Arc<TopologyDescription> {
        self.description.borrow().clone()
    }

    /// A receiver that is notified every time a new snapshot is published.
    pub fn watch_topology(&self) -> watch::Receiver<Arc<TopologyDescription>> {
        self.description.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TopologyEvent> {
        self.events.subscribe()
    }

    /// Picks a server for `read_preference`, waiting up to `timeout` (or the configured
    /// server selection timeout) for one to become suitable.
    ///
    /// A read preference that can't work against this topology fails right away with
    /// [`SelectionError::Configuration`].
    #[instrument(level = "debug", name = "Topology Handle - Select Server", skip(self))]
    pub async fn select_server(
        &self,
        read_preference: &ReadPreference,
        timeout: Option<Duration>,
    ) -> Result<ServerAddress, SelectionError> {
        if self.sender.is_closed() {
            return Err(SelectionError::Shutdown);
        }

        let timeout = timeout.unwrap_or_else(|| self.conventions.server_selection_timeout());
        let deadline = Instant::now() + timeout;
        let mut watcher = self.description.clone();

        loop {
            let snapshot = watcher.borrow_and_update().clone();
            if let Some(server) =
                server_selector::select_server(&snapshot, read_preference, &self.conventions)?
            {
                tracing::debug!("Selected {}", server.address());
                return Ok(server.address().clone());
            }

            tracing::trace!("No suitable server in {}, waiting for a change", snapshot);
            self.request_immediate_check();

            match tokio::time::timeout_at(deadline, watcher.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(SelectionError::Shutdown),
                Err(_) => {
                    let topology = watcher.borrow().to_string();
                    tracing::debug!("Server selection timed out. Topology: {}", topology);
                    return Err(SelectionError::Timeout { timeout, topology });
                }
            }
        }
    }

    /// Asks every monitor to check its server ahead of the regular heartbeat. Advisory: a
    /// request already in flight covers this one.
    pub fn request_immediate_check(&self) {
        match self.sender.try_send(TopologyMessage::RequestImmediateCheck) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Closed(_)) => {
                tracing::trace!("Topology actor is gone, nothing to check");
            }
        }
    }

    /// Stops every monitor and the actor. Later selections on any clone of this handle fail
    /// with [`SelectionError::Shutdown`].
    #[instrument(level = "debug", name = "Topology Handle - Shutdown", skip(self))]
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(TopologyMessage::Shutdown { respond_to: tx })
            .await
            .is_err()
        {
            tracing::debug!("Topology was already shut down");
            return;
        }
        let _ = rx.await;
    }
}
