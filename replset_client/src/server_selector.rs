//! Picks the servers a read preference allows, out of one topology snapshot.
//!
//! Selection is a pure function of the snapshot, so callers waiting for a suitable server
//! simply run it again on every new snapshot.
use std::time::{Duration, SystemTime};

use rand::seq::SliceRandom;

use crate::{
    error_chain_fmt,
    read_preference::{MaxStaleness, ReadMode, ReadPreference, ReadPreferenceError, TagSet},
    server_description::{ServerDescription, ServerRole},
    topology_conventions::TopologyConventions,
    topology_description::{TopologyDescription, TopologyType},
};

/// Oldest wire version that reports the last write date needed for staleness estimates.
pub const MIN_WIRE_VERSION_FOR_MAX_STALENESS: i32 = 5;

#[derive(thiserror::Error)]
pub enum SelectionError {
    #[error("Read preference can't be used against this topology")]
    Configuration(#[from] ReadPreferenceError),
    #[error("No suitable server found within {timeout:?}. Current topology: {topology}")]
    Timeout { timeout: Duration, topology: String },
    #[error("The topology has been shut down")]
    Shutdown,
}
impl std::fmt::Debug for SelectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

/// Checks the read preference against the topology it is about to be used with.
pub fn validate_read_preference(
    topology: &TopologyDescription,
    read_preference: &ReadPreference,
    conventions: &TopologyConventions,
) -> Result<(), ReadPreferenceError> {
    read_preference.validate()?;

    let bound = match read_preference.max_staleness().as_duration() {
        Some(bound) => bound,
        None => return Ok(()),
    };
    // Routers and single servers don't get filtered by staleness here.
    if !topology.topology_type().is_replica_set() {
        return Ok(());
    }

    let minimum = conventions.minimum_max_staleness();
    if bound < minimum {
        return Err(ReadPreferenceError::MaxStalenessTooSmall {
            configured_seconds: bound.as_secs(),
            minimum_seconds: minimum.as_secs(),
        });
    }

    if let Some(server) = topology.servers().find(|s| {
        s.is_available()
            && s.max_wire_version()
                .map(|v| v < MIN_WIRE_VERSION_FOR_MAX_STALENESS)
                .unwrap_or(true)
    }) {
        return Err(ReadPreferenceError::MaxStalenessUnsupported {
            address: server.address().to_string(),
            wire_version: server.max_wire_version(),
        });
    }

    Ok(())
}

/// Every server the read preference accepts, before latency windowing.
pub fn suitable_servers<'a>(
    topology: &'a TopologyDescription,
    read_preference: &ReadPreference,
    conventions: &TopologyConventions,
) -> Result<Vec<&'a ServerDescription>, SelectionError> {
    validate_read_preference(topology, read_preference, conventions)?;

    let servers = match topology.topology_type() {
        TopologyType::Unknown => Vec::new(),
        TopologyType::Single => topology.servers().filter(|s| s.is_available()).collect(),
        TopologyType::Sharded => filter_by_tags(
            topology
                .servers()
                .filter(|s| s.role() == ServerRole::Mongos)
                .collect(),
            read_preference.tag_sets(),
        ),
        TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary => {
            replica_set_servers(topology, read_preference, conventions.heartbeat_frequency())
        }
    };

    Ok(servers)
}

/// Runs the full selection and picks one server at random from the latency window.
/// `Ok(None)` means nothing is suitable right now.
pub fn select_server<'a>(
    topology: &'a TopologyDescription,
    read_preference: &ReadPreference,
    conventions: &TopologyConventions,
) -> Result<Option<&'a ServerDescription>, SelectionError> {
    let suitable = suitable_servers(topology, read_preference, conventions)?;
    let window = in_latency_window(suitable, conventions.local_threshold());
    Ok(window.choose(&mut rand::thread_rng()).copied())
}

fn replica_set_servers<'a>(
    topology: &'a TopologyDescription,
    read_preference: &ReadPreference,
    heartbeat_frequency: Duration,
) -> Vec<&'a ServerDescription> {
    let primary = topology.primary();

    match read_preference.mode() {
        ReadMode::Primary => primary.into_iter().collect(),
        ReadMode::PrimaryPreferred => match primary {
            Some(primary) => vec![primary],
            None => eligible_members(topology, read_preference, heartbeat_frequency, false),
        },
        ReadMode::Secondary => {
            eligible_members(topology, read_preference, heartbeat_frequency, false)
        }
        ReadMode::SecondaryPreferred => {
            let secondaries =
                eligible_members(topology, read_preference, heartbeat_frequency, false);
            if secondaries.is_empty() {
                primary.into_iter().collect()
            } else {
                secondaries
            }
        }
        ReadMode::Nearest => {
            eligible_members(topology, read_preference, heartbeat_frequency, true)
        }
    }
}

/// Secondaries (and the primary when `include_primary`) that pass the staleness and tag
/// filters.
fn eligible_members<'a>(
    topology: &'a TopologyDescription,
    read_preference: &ReadPreference,
    heartbeat_frequency: Duration,
    include_primary: bool,
) -> Vec<&'a ServerDescription> {
    let members = topology
        .servers()
        .filter(|s| match s.role() {
            ServerRole::RsSecondary => true,
            ServerRole::RsPrimary => include_primary,
            _ => false,
        })
        .collect();
    let fresh = filter_by_max_staleness(
        topology,
        members,
        read_preference.max_staleness(),
        heartbeat_frequency,
    );
    filter_by_tags(fresh, read_preference.tag_sets())
}

/// Drops secondaries whose estimated staleness exceeds the bound. The primary is always
/// kept, and a disabled bound keeps everything.
pub fn filter_by_max_staleness<'a>(
    topology: &TopologyDescription,
    candidates: Vec<&'a ServerDescription>,
    max_staleness: MaxStaleness,
    heartbeat_frequency: Duration,
) -> Vec<&'a ServerDescription> {
    let bound = match max_staleness.as_duration() {
        Some(bound) => bound,
        None => return candidates,
    };

    candidates
        .into_iter()
        .filter(|server| {
            if server.role() == ServerRole::RsPrimary {
                return true;
            }
            match estimate_staleness(topology, server, heartbeat_frequency) {
                Some(staleness) => {
                    tracing::trace!("{} is estimated {:?} stale", server.address(), staleness);
                    staleness <= bound
                }
                None => false,
            }
        })
        .collect()
}

/// How far `secondary` is estimated to lag behind the newest write in the set.
///
/// With a primary: `(S.lastUpdate - S.lastWrite) - (P.lastUpdate - P.lastWrite) + heartbeat`.
/// Without one: `(SMax.lastWrite - S.lastWrite) + heartbeat`, where `SMax` is the secondary
/// with the newest write. `None` when the secondary has never reported a write.
pub fn estimate_staleness(
    topology: &TopologyDescription,
    secondary: &ServerDescription,
    heartbeat_frequency: Duration,
) -> Option<Duration> {
    let secondary_write = epoch_nanos(secondary.last_write_date()?);
    let heartbeat = heartbeat_frequency.as_nanos() as i128;

    let primary = topology
        .primary()
        .and_then(|p| p.last_write_date().map(|write| (p, write)));

    let staleness = match primary {
        Some((primary, primary_write)) => {
            let secondary_lag = epoch_nanos(secondary.last_update_time()) - secondary_write;
            let primary_lag = epoch_nanos(primary.last_update_time()) - epoch_nanos(primary_write);
            secondary_lag - primary_lag + heartbeat
        }
        None => {
            let newest_write = topology
                .servers()
                .filter(|s| s.role() == ServerRole::RsSecondary)
                .filter_map(|s| s.last_write_date())
                .map(epoch_nanos)
                .max()
                .unwrap_or(secondary_write);
            newest_write - secondary_write + heartbeat
        }
    };

    Some(Duration::from_nanos(staleness.max(0) as u64))
}

/// Keeps the candidates matching the first tag set that matches any of them. An empty tag
/// set list keeps everything; no matching tag set keeps nothing.
pub fn filter_by_tags<'a>(
    candidates: Vec<&'a ServerDescription>,
    tag_sets: &[TagSet],
) -> Vec<&'a ServerDescription> {
    if tag_sets.is_empty() {
        return candidates;
    }

    for tag_set in tag_sets {
        let matched: Vec<&ServerDescription> = candidates
            .iter()
            .filter(|server| tag_set.matches(server))
            .copied()
            .collect();
        if !matched.is_empty() {
            return matched;
        }
    }

    Vec::new()
}

/// Keeps the candidates whose round trip time is within `local_threshold` of the fastest.
pub fn in_latency_window(
    candidates: Vec<&ServerDescription>,
    local_threshold: Duration,
) -> Vec<&ServerDescription> {
    let fastest = match candidates.iter().filter_map(|s| s.round_trip_time()).min() {
        Some(fastest) => fastest,
        None => return Vec::new(),
    };
    let limit = fastest.saturating_add(local_threshold);

    candidates
        .into_iter()
        .filter(|s| s.round_trip_time().map(|rtt| rtt <= limit).unwrap_or(false))
        .collect()
}

fn epoch_nanos(time: SystemTime) -> i128 {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(after) => after.as_nanos() as i128,
        Err(before) => -(before.duration().as_nanos() as i128),
    }
}
