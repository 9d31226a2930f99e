//! The cluster-wide view and the state machine that folds server descriptions into it.
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
};

use crate::{
    server_address::ServerAddress,
    server_description::{ElectionId, ServerDescription, ServerRole},
    server_probe::ProbeError,
};

#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash)]
pub enum TopologyType {
    Single,
    ReplicaSetNoPrimary,
    ReplicaSetWithPrimary,
    Sharded,
    #[default]
    Unknown,
}

impl TopologyType {
    pub fn is_replica_set(&self) -> bool {
        matches!(
            self,
            TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary
        )
    }
}

/// What applying one server description did to the topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// The address is not part of the topology (anymore).
    NotAMember,
    /// A primary reported an older `(setVersion, electionId)` than already seen. Nothing
    /// changed.
    StaleEpochIgnored,
    /// The server belongs to another replica set and was excluded.
    SetNameMismatch {
        expected: String,
        actual: Option<String>,
    },
}

/// Immutable snapshot of the cluster. Updates happen on a private copy that then replaces
/// the published one.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TopologyDescription {
    topology_type: TopologyType,
    set_name: Option<String>,
    max_set_version: Option<i32>,
    max_election_id: Option<ElectionId>,
    servers: HashMap<ServerAddress, ServerDescription>,
}

impl TopologyDescription {
    /// The starting point before any server was checked. Every seed starts out `Unknown`.
    pub fn new(
        hosts: impl IntoIterator<Item = ServerAddress>,
        set_name: Option<String>,
        direct_connection: bool,
    ) -> Self {
        let servers: HashMap<_, _> = hosts
            .into_iter()
            .map(|address| (address.clone(), ServerDescription::new(address)))
            .collect();

        let topology_type = if direct_connection {
            TopologyType::Single
        } else if set_name.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else {
            TopologyType::Unknown
        };

        Self {
            topology_type,
            set_name,
            max_set_version: None,
            max_election_id: None,
            servers,
        }
    }

    pub fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    pub fn set_name(&self) -> Option<&str> {
        self.set_name.as_deref()
    }

    pub fn max_set_version(&self) -> Option<i32> {
        self.max_set_version
    }

    pub fn max_election_id(&self) -> Option<ElectionId> {
        self.max_election_id
    }

    pub fn server(&self, address: &ServerAddress) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    pub fn servers(&self) -> impl Iterator<Item = &ServerDescription> {
        self.servers.values()
    }

    pub fn addresses(&self) -> BTreeSet<ServerAddress> {
        self.servers.keys().cloned().collect()
    }

    pub fn primary(&self) -> Option<&ServerDescription> {
        self.servers
            .values()
            .find(|server| server.role() == ServerRole::RsPrimary)
    }

    /// Returns a copy of this topology with `server_description` applied, leaving `self`
    /// untouched.
    pub fn with_update(&self, server_description: ServerDescription) -> (Self, UpdateOutcome) {
        let mut next = self.clone();
        let outcome = next.update(server_description);
        (next, outcome)
    }

    /// Applies one server description. Never blocks and never performs I/O.
    pub fn update(&mut self, server_description: ServerDescription) -> UpdateOutcome {
        if !self.servers.contains_key(server_description.address()) {
            return UpdateOutcome::NotAMember;
        }

        if server_description.role() == ServerRole::RsPrimary
            && self.has_matching_set_name(&server_description)
            && self.is_stale_primary(&server_description)
        {
            tracing::debug!(
                "Ignoring primary report from {} with stale epoch ({:?}, {:?})",
                server_description.address(),
                server_description.set_version(),
                server_description.election_id()
            );
            return UpdateOutcome::StaleEpochIgnored;
        }

        // Replace the old info about the server with the new info.
        let previous = self.servers.insert(
            server_description.address().clone(),
            server_description.clone(),
        );

        match self.topology_type {
            TopologyType::Single => self.update_single_topology(server_description, previous),
            TopologyType::Unknown => self.update_unknown_topology(server_description),
            TopologyType::Sharded => self.update_sharded_topology(server_description),
            TopologyType::ReplicaSetNoPrimary => {
                self.update_replica_set_no_primary_topology(server_description)
            }
            TopologyType::ReplicaSetWithPrimary => {
                self.update_replica_set_with_primary_topology(server_description)
            }
        }
    }

    fn update_single_topology(
        &mut self,
        server_description: ServerDescription,
        previous: Option<ServerDescription>,
    ) -> UpdateOutcome {
        let expected = match &self.set_name {
            Some(expected) => expected.clone(),
            None => return UpdateOutcome::Applied,
        };
        if !server_description.is_available()
            || server_description.set_name() == Some(expected.as_str())
        {
            return UpdateOutcome::Applied;
        }

        // A directly connected server from another replica set is kept, but as unusable.
        let actual = server_description.set_name().map(str::to_string);
        let address = server_description.address().clone();
        let error = ProbeError::Protocol(format!(
            "Replica set name {:?} does not match expected `{}`",
            actual, expected
        ));
        let already_reported = previous
            .as_ref()
            .and_then(|p| p.error())
            .map(|e| e == &error)
            .unwrap_or(false);
        self.servers
            .insert(address.clone(), ServerDescription::from_error(address, error));
        if already_reported {
            return UpdateOutcome::Applied;
        }
        UpdateOutcome::SetNameMismatch { expected, actual }
    }

    fn update_unknown_topology(&mut self, server_description: ServerDescription) -> UpdateOutcome {
        match server_description.role() {
            ServerRole::Unknown | ServerRole::RsGhost => UpdateOutcome::Applied,
            ServerRole::Standalone => {
                self.topology_type = TopologyType::Single;
                let address = server_description.address().clone();
                self.servers.retain(|other, _| other == &address);
                UpdateOutcome::Applied
            }
            ServerRole::Mongos => {
                self.topology_type = TopologyType::Sharded;
                UpdateOutcome::Applied
            }
            ServerRole::RsPrimary => self.update_rs_from_primary_server(server_description),
            ServerRole::RsSecondary | ServerRole::RsArbiter | ServerRole::RsOther => {
                self.topology_type = TopologyType::ReplicaSetNoPrimary;
                self.update_rs_without_primary_server(server_description)
            }
        }
    }

    fn update_sharded_topology(&mut self, server_description: ServerDescription) -> UpdateOutcome {
        match server_description.role() {
            ServerRole::Unknown | ServerRole::Mongos => {}
            _ => {
                self.servers.remove(server_description.address());
            }
        }
        UpdateOutcome::Applied
    }

    fn update_replica_set_no_primary_topology(
        &mut self,
        server_description: ServerDescription,
    ) -> UpdateOutcome {
        match server_description.role() {
            ServerRole::Unknown | ServerRole::RsGhost => UpdateOutcome::Applied,
            ServerRole::Standalone | ServerRole::Mongos => {
                self.servers.remove(server_description.address());
                UpdateOutcome::Applied
            }
            ServerRole::RsPrimary => self.update_rs_from_primary_server(server_description),
            ServerRole::RsSecondary | ServerRole::RsArbiter | ServerRole::RsOther => {
                self.update_rs_without_primary_server(server_description)
            }
        }
    }

    fn update_replica_set_with_primary_topology(
        &mut self,
        server_description: ServerDescription,
    ) -> UpdateOutcome {
        match server_description.role() {
            ServerRole::Unknown | ServerRole::RsGhost => {
                self.record_primary_state();
                UpdateOutcome::Applied
            }
            ServerRole::Standalone | ServerRole::Mongos => {
                self.servers.remove(server_description.address());
                self.record_primary_state();
                UpdateOutcome::Applied
            }
            ServerRole::RsPrimary => self.update_rs_from_primary_server(server_description),
            ServerRole::RsSecondary | ServerRole::RsArbiter | ServerRole::RsOther => {
                self.update_rs_with_primary_from_member(server_description)
            }
        }
    }

    /// Non-primary member report while no primary is known.
    fn update_rs_without_primary_server(
        &mut self,
        server_description: ServerDescription,
    ) -> UpdateOutcome {
        if self.set_name.is_none() {
            self.set_name = server_description.set_name().map(str::to_string);
        } else if let Some(outcome) = self.exclude_on_set_name_mismatch(&server_description) {
            return outcome;
        }

        self.add_new_servers(server_description.known_hosts());

        if server_description.invalid_me() {
            self.servers.remove(server_description.address());
        }

        UpdateOutcome::Applied
    }

    /// Non-primary member report while a primary is known.
    fn update_rs_with_primary_from_member(
        &mut self,
        server_description: ServerDescription,
    ) -> UpdateOutcome {
        if let Some(outcome) = self.exclude_on_set_name_mismatch(&server_description) {
            self.record_primary_state();
            return outcome;
        }

        if server_description.invalid_me() {
            self.servers.remove(server_description.address());
        }
        self.record_primary_state();

        UpdateOutcome::Applied
    }

    fn update_rs_from_primary_server(
        &mut self,
        server_description: ServerDescription,
    ) -> UpdateOutcome {
        if self.set_name.is_none() {
            self.set_name = server_description.set_name().map(str::to_string);
        } else if let Some(outcome) = self.exclude_on_set_name_mismatch(&server_description) {
            self.record_primary_state();
            return outcome;
        }

        if let (Some(_), Some(election_id)) = (
            server_description.set_version(),
            server_description.election_id(),
        ) {
            self.max_election_id = Some(election_id);
        }
        if let Some(set_version) = server_description.set_version() {
            if self
                .max_set_version
                .map(|max| set_version > max)
                .unwrap_or(true)
            {
                self.max_set_version = Some(set_version);
            }
        }

        // Any other server still marked primary is out of date. Reset it so its monitor's
        // next check decides what it is now.
        let stale_primaries: Vec<ServerAddress> = self
            .servers
            .values()
            .filter(|s| {
                s.role() == ServerRole::RsPrimary && s.address() != server_description.address()
            })
            .map(|s| s.address().clone())
            .collect();
        for address in stale_primaries {
            tracing::info!("Demoting previous primary {} to Unknown", address);
            self.servers
                .insert(address.clone(), ServerDescription::new(address));
        }

        let known_hosts: BTreeSet<&ServerAddress> =
            server_description.known_hosts().iter().collect();
        self.add_new_servers(server_description.known_hosts());
        self.servers
            .retain(|address, _| known_hosts.contains(address));

        self.record_primary_state();

        UpdateOutcome::Applied
    }

    /// Removes the server when it reports another replica set name than the recorded one.
    fn exclude_on_set_name_mismatch(
        &mut self,
        server_description: &ServerDescription,
    ) -> Option<UpdateOutcome> {
        if self.has_matching_set_name(server_description) {
            return None;
        }
        self.servers.remove(server_description.address());
        Some(UpdateOutcome::SetNameMismatch {
            expected: self.set_name.clone().unwrap_or_default(),
            actual: server_description.set_name().map(str::to_string),
        })
    }

    fn has_matching_set_name(&self, server_description: &ServerDescription) -> bool {
        match &self.set_name {
            Some(expected) => server_description.set_name() == Some(expected.as_str()),
            None => true,
        }
    }

    /// True when the primary's `(setVersion, electionId)` is strictly older than the
    /// largest one recorded.
    fn is_stale_primary(&self, server_description: &ServerDescription) -> bool {
        match (
            server_description.set_version(),
            server_description.election_id(),
            self.max_set_version,
            self.max_election_id,
        ) {
            (Some(set_version), Some(election_id), Some(max_set_version), Some(max_election_id)) => {
                (set_version, election_id) < (max_set_version, max_election_id)
            }
            _ => false,
        }
    }

    /// Re-derives the replica set type from whether any member is currently primary.
    fn record_primary_state(&mut self) {
        self.topology_type = if self
            .servers
            .values()
            .any(|server| server.role() == ServerRole::RsPrimary)
        {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    /// Adds an `Unknown` placeholder for every address not yet known.
    fn add_new_servers<'a>(&mut self, addresses: impl IntoIterator<Item = &'a ServerAddress>) {
        for address in addresses {
            self.servers
                .entry(address.clone())
                .or_insert_with(|| ServerDescription::new(address.clone()));
        }
    }
}

impl fmt::Display for TopologyDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ type: {:?}", self.topology_type)?;
        if let Some(set_name) = &self.set_name {
            write!(f, ", set name: {}", set_name)?;
        }
        write!(f, ", servers: [")?;
        let mut servers: Vec<&ServerDescription> = self.servers.values().collect();
        servers.sort_by(|a, b| a.address().cmp(b.address()));
        for (i, server) in servers.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} ({:?}", server.address(), server.role())?;
            if let Some(error) = server.error() {
                write!(f, ", error: {}", error)?;
            }
            write!(f, ")")?;
        }
        write!(f, "] }}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{addr, sd};

    fn replica_set(hosts: &[&str]) -> TopologyDescription {
        TopologyDescription::new(hosts.iter().map(|h| addr(h)), None, false)
    }

    const HOSTS: [&str; 3] = ["a:27017", "b:27017", "c:27017"];

    fn primary(address: &str, set_version: i32, election: u8) -> ServerDescription {
        sd(address, ServerRole::RsPrimary)
            .set_name("rs")
            .epoch(set_version, election)
            .hosts(&HOSTS)
            .build()
    }

    #[test]
    fn standalone_turns_unknown_topology_into_single() {
        // Arrange
        let topology = replica_set(&["a:27017", "b:27017"]);

        // Act
        let (next, outcome) = topology.with_update(sd("a:27017", ServerRole::Standalone).build());

        // Assert
        assert_eq!(outcome, UpdateOutcome::Applied);
        assert_eq!(next.topology_type(), TopologyType::Single);
        assert_eq!(next.addresses().len(), 1);
        assert_eq!(topology.topology_type(), TopologyType::Unknown);
    }

    #[test]
    fn primary_report_sets_type_name_and_adds_listed_hosts() {
        let topology = replica_set(&["a:27017"]);

        let (next, outcome) = topology.with_update(primary("a:27017", 1, 1));

        assert_eq!(outcome, UpdateOutcome::Applied);
        assert_eq!(next.topology_type(), TopologyType::ReplicaSetWithPrimary);
        assert_eq!(next.set_name(), Some("rs"));
        assert_eq!(next.max_set_version(), Some(1));
        assert_eq!(next.addresses().len(), 3);
        assert_eq!(
            next.server(&addr("b:27017")).map(|s| s.role()),
            Some(ServerRole::Unknown)
        );
    }

    #[test]
    fn stale_primary_report_is_ignored_entirely() {
        // Arrange
        let (topology, _) = replica_set(&HOSTS).with_update(primary("a:27017", 2, 5));
        let before_b = topology.server(&addr("b:27017")).cloned();

        // Act: b claims to be primary with an older epoch, both by version and election id
        let (after_version, outcome_version) = topology.with_update(primary("b:27017", 1, 9));
        let (after_election, outcome_election) = topology.with_update(primary("b:27017", 2, 4));

        // Assert
        assert_eq!(outcome_version, UpdateOutcome::StaleEpochIgnored);
        assert_eq!(outcome_election, UpdateOutcome::StaleEpochIgnored);
        for after in [after_version, after_election] {
            assert_eq!(after.primary().map(|p| p.address().clone()), Some(addr("a:27017")));
            assert_eq!(after.server(&addr("b:27017")).cloned(), before_b);
            assert_eq!(after, topology);
        }
    }

    #[test]
    fn newer_primary_demotes_previous_primary_to_unknown() {
        let (topology, _) = replica_set(&HOSTS).with_update(primary("a:27017", 1, 1));

        let (next, outcome) = topology.with_update(primary("b:27017", 1, 2));

        assert_eq!(outcome, UpdateOutcome::Applied);
        assert_eq!(next.primary().map(|p| p.address().clone()), Some(addr("b:27017")));
        assert_eq!(
            next.server(&addr("a:27017")).map(|s| s.role()),
            Some(ServerRole::Unknown)
        );
        assert_eq!(next.max_election_id(), Some(crate::test_support::election_id(2)));
        assert_eq!(
            next.servers()
                .filter(|s| s.role() == ServerRole::RsPrimary)
                .count(),
            1
        );
    }

    #[test]
    fn primary_from_another_set_is_excluded() {
        let (topology, _) = replica_set(&HOSTS).with_update(primary("a:27017", 1, 1));
        let imposter = sd("b:27017", ServerRole::RsPrimary)
            .set_name("other")
            .epoch(5, 5)
            .hosts(&HOSTS)
            .build();

        let (next, outcome) = topology.with_update(imposter);

        assert_eq!(
            outcome,
            UpdateOutcome::SetNameMismatch {
                expected: "rs".to_string(),
                actual: Some("other".to_string())
            }
        );
        assert!(next.server(&addr("b:27017")).is_none());
        assert_eq!(next.primary().map(|p| p.address().clone()), Some(addr("a:27017")));
        assert_eq!(next.topology_type(), TopologyType::ReplicaSetWithPrimary);
    }

    #[test]
    fn secondary_without_primary_gives_replica_set_no_primary() {
        let topology = replica_set(&["a:27017"]);
        let secondary = sd("a:27017", ServerRole::RsSecondary)
            .set_name("rs")
            .hosts(&HOSTS)
            .build();

        let (next, _) = topology.with_update(secondary);

        assert_eq!(next.topology_type(), TopologyType::ReplicaSetNoPrimary);
        assert_eq!(next.set_name(), Some("rs"));
        assert_eq!(next.addresses().len(), 3);
    }

    #[test]
    fn failed_primary_check_recomputes_type() {
        let (topology, _) = replica_set(&HOSTS).with_update(primary("a:27017", 1, 1));

        let (next, _) = topology.with_update(ServerDescription::from_error(
            addr("a:27017"),
            ProbeError::Network("connection reset".to_string()),
        ));

        assert_eq!(next.topology_type(), TopologyType::ReplicaSetNoPrimary);
        assert!(next.primary().is_none());
        assert_eq!(next.addresses().len(), 3);
    }

    #[test]
    fn primary_removes_hosts_it_does_not_list() {
        let topology = replica_set(&["a:27017", "d:27017"]);

        let (next, _) = topology.with_update(primary("a:27017", 1, 1));

        assert!(next.server(&addr("d:27017")).is_none());
        assert!(next.server(&addr("c:27017")).is_some());
    }

    #[test]
    fn mongos_makes_sharded_and_other_roles_are_dropped() {
        let topology = replica_set(&["a:27017", "b:27017"]);

        let (sharded, _) = topology.with_update(sd("a:27017", ServerRole::Mongos).build());
        let (next, _) = sharded.with_update(
            sd("b:27017", ServerRole::RsSecondary)
                .set_name("rs")
                .build(),
        );

        assert_eq!(sharded.topology_type(), TopologyType::Sharded);
        assert_eq!(next.topology_type(), TopologyType::Sharded);
        assert!(next.server(&addr("b:27017")).is_none());
    }

    #[test]
    fn updates_for_unknown_addresses_are_ignored() {
        let topology = replica_set(&["a:27017"]);

        let (next, outcome) = topology.with_update(primary("z:27017", 1, 1));

        assert_eq!(outcome, UpdateOutcome::NotAMember);
        assert_eq!(next, topology);
    }

    #[test]
    fn member_reporting_a_different_me_is_removed() {
        let topology = replica_set(&["a:27017", "b:27017"]);
        let secondary = sd("a:27017", ServerRole::RsSecondary)
            .set_name("rs")
            .hosts(&["b:27017", "e:27017"])
            .me("e:27017")
            .build();

        let (next, _) = topology.with_update(secondary);

        assert!(next.server(&addr("a:27017")).is_none());
        assert!(next.server(&addr("e:27017")).is_some());
    }

    #[test]
    fn direct_connection_to_wrong_set_marks_server_unusable() {
        let topology =
            TopologyDescription::new([addr("a:27017")], Some("rs".to_string()), true);

        let (next, outcome) = topology.with_update(
            sd("a:27017", ServerRole::RsSecondary)
                .set_name("other")
                .build(),
        );

        assert!(matches!(outcome, UpdateOutcome::SetNameMismatch { .. }));
        assert_eq!(next.topology_type(), TopologyType::Single);
        assert_eq!(
            next.server(&addr("a:27017")).map(|s| s.role()),
            Some(ServerRole::Unknown)
        );
    }

    #[test]
    fn repeated_mismatch_on_direct_connection_is_reported_once() {
        // Arrange
        let topology =
            TopologyDescription::new([addr("a:27017")], Some("rs".to_string()), true);
        let wrong_set = || {
            sd("a:27017", ServerRole::RsSecondary)
                .set_name("other")
                .build()
        };

        // Act
        let (first, first_outcome) = topology.with_update(wrong_set());
        let (second, second_outcome) = first.with_update(wrong_set());

        // Assert
        assert!(matches!(first_outcome, UpdateOutcome::SetNameMismatch { .. }));
        assert_eq!(second_outcome, UpdateOutcome::Applied);
        assert_eq!(
            second.server(&addr("a:27017")).map(|s| s.role()),
            Some(ServerRole::Unknown)
        );
    }

    #[test]
    fn standalone_or_mongos_in_set_with_primary_is_removed_and_type_recomputed() {
        // Arrange
        let (topology, _) = replica_set(&HOSTS).with_update(primary("a:27017", 1, 1));

        // Act
        let (without_b, _) = topology.with_update(sd("b:27017", ServerRole::Standalone).build());
        let (without_a, _) = without_b.with_update(sd("a:27017", ServerRole::Mongos).build());

        // Assert
        assert!(without_b.server(&addr("b:27017")).is_none());
        assert_eq!(without_b.topology_type(), TopologyType::ReplicaSetWithPrimary);
        assert!(without_a.server(&addr("a:27017")).is_none());
        assert_eq!(without_a.topology_type(), TopologyType::ReplicaSetNoPrimary);
        assert!(without_a.primary().is_none());
    }

    #[test]
    fn ghost_report_keeps_replica_set_type() {
        let ghost = || sd("b:27017", ServerRole::RsGhost).build();
        let (with_primary, _) = replica_set(&HOSTS).with_update(primary("a:27017", 1, 1));
        let (no_primary, _) = replica_set(&HOSTS).with_update(
            sd("a:27017", ServerRole::RsSecondary)
                .set_name("rs")
                .hosts(&HOSTS)
                .build(),
        );

        let (with_primary_after, _) = with_primary.with_update(ghost());
        let (no_primary_after, _) = no_primary.with_update(ghost());

        assert_eq!(
            with_primary_after.topology_type(),
            TopologyType::ReplicaSetWithPrimary
        );
        assert_eq!(
            no_primary_after.topology_type(),
            TopologyType::ReplicaSetNoPrimary
        );
        assert_eq!(
            with_primary_after.server(&addr("b:27017")).map(|s| s.role()),
            Some(ServerRole::RsGhost)
        );
    }

    #[test]
    fn primary_with_equal_epoch_is_accepted() {
        let (topology, _) = replica_set(&HOSTS).with_update(primary("a:27017", 2, 3));

        let (next, outcome) = topology.with_update(primary("b:27017", 2, 3));

        assert_eq!(outcome, UpdateOutcome::Applied);
        assert_eq!(next.primary().map(|p| p.address().clone()), Some(addr("b:27017")));
        assert_eq!(
            next.server(&addr("a:27017")).map(|s| s.role()),
            Some(ServerRole::Unknown)
        );
    }
}
