use std::{collections::BTreeSet, time::Duration};

use anyhow::Context;
use tracing::instrument;

use crate::{
    server_address::ServerAddress,
    server_probe::{HealthCheck, HttpHealthCheck},
    topology_conventions::TopologyConventions,
    topology_description::TopologyDescription,
};

use super::{Topology, TopologyError, TopologyInitialConfiguration};

#[derive(Debug, Default)]
pub struct TopologyBuilder {
    conventions: TopologyConventions,
    direct_connection: bool,
    health_check: Option<Box<dyn HealthCheck>>,
    hosts: Vec<String>,
    replica_set_name: Option<String>,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed list, as `host` or `host:port`.
    pub fn set_hosts<T>(mut self, hosts: &[T]) -> Self
    where
        T: AsRef<str>,
    {
        for h in hosts {
            self.hosts.push(h.as_ref().to_string());
        }
        self
    }

    pub fn set_replica_set_name(mut self, replica_set_name: &str) -> Self {
        self.replica_set_name = Some(replica_set_name.to_string());
        self
    }

    /// Talk to the single seed only, whatever it reports about other members.
    pub fn set_direct_connection(mut self, direct_connection: bool) -> Self {
        self.direct_connection = direct_connection;
        self
    }

    pub fn set_heartbeat_frequency(mut self, heartbeat_frequency: Duration) -> Self {
        self.conventions = self
            .conventions
            .with_heartbeat_frequency(heartbeat_frequency);
        self
    }

    pub fn set_local_threshold(mut self, local_threshold: Duration) -> Self {
        self.conventions = self.conventions.with_local_threshold(local_threshold);
        self
    }

    pub fn set_server_selection_timeout(mut self, timeout: Duration) -> Self {
        self.conventions = self.conventions.with_server_selection_timeout(timeout);
        self
    }

    /// Replaces every setting made so far through the individual timing setters.
    pub fn set_conventions(mut self, conventions: TopologyConventions) -> Self {
        self.conventions = conventions;
        self
    }

    /// Defaults to an [`HttpHealthCheck`].
    pub fn set_health_check(mut self, health_check: impl HealthCheck + 'static) -> Self {
        self.health_check = Some(Box::new(health_check));
        self
    }

    /// Spawns a new topology actor and returns a handle to it. Must be called from within a
    /// tokio runtime.
    ///
    /// Each call creates a new actor with its own monitors, so the builder can act as a
    /// template after being set up once.
    #[instrument(level = "debug", name = "Build TopologyBuilder", skip(self))]
    pub fn build(&self) -> Result<Topology, TopologyError> {
        if self.hosts.is_empty() {
            tracing::error!(
                "No hosts were supplied and a topology can't exist without at least one"
            );
            return Err(TopologyError::MissingHostsError);
        }

        let hosts = validate_hosts(self.hosts.as_slice())?;
        validate_conventions(&self.conventions)?;

        if self.direct_connection && hosts.len() != 1 {
            return Err(TopologyError::InvalidConfiguration(format!(
                "A direct connection needs exactly one host, got {}",
                hosts.len()
            )));
        }

        let health_check = match &self.health_check {
            Some(health_check) => health_check.clone(),
            None => {
                let client = reqwest::Client::builder()
                    .connect_timeout(self.conventions.connect_timeout())
                    .build()
                    .context("Unable to build the http client for health checks")?;
                Box::new(HttpHealthCheck::new(client))
            }
        };

        let description = TopologyDescription::new(
            hosts,
            self.replica_set_name.clone(),
            self.direct_connection,
        );

        let initial_config = TopologyInitialConfiguration {
            conventions: self.conventions.clone(),
            description,
            health_check,
        };

        tracing::trace!("Initial Configuration: {:?}", &initial_config);

        Ok(Topology::new(initial_config))
    }
}

/// Parses the seed list, dropping duplicates.
#[instrument(level = "debug", name = "Validate Hosts")]
fn validate_hosts<T>(hosts: &[T]) -> Result<BTreeSet<ServerAddress>, TopologyError>
where
    T: AsRef<str> + std::fmt::Debug,
{
    let mut clean_hosts = BTreeSet::new();
    for host in hosts {
        let address = ServerAddress::parse(host.as_ref()).map_err(|e| {
            tracing::error!("Invalid host `{}`. Caused by: {}", host.as_ref(), e);
            e
        })?;
        clean_hosts.insert(address);
    }
    Ok(clean_hosts)
}

fn validate_conventions(conventions: &TopologyConventions) -> Result<(), TopologyError> {
    if conventions.heartbeat_frequency() < conventions.min_heartbeat_frequency() {
        return Err(TopologyError::InvalidConfiguration(format!(
            "Heartbeat frequency {:?} is below the minimum of {:?}",
            conventions.heartbeat_frequency(),
            conventions.min_heartbeat_frequency()
        )));
    }

    let weight = conventions.rtt_smoothing_weight();
    if !(weight > 0.0 && weight <= 1.0) {
        return Err(TopologyError::InvalidConfiguration(format!(
            "Round trip time smoothing weight must be in (0, 1], got {}",
            weight
        )));
    }

    Ok(())
}
