use std::{
    collections::BTreeMap,
    fmt,
    str::FromStr,
    time::{Duration, SystemTime},
};

use serde::Deserialize;

use crate::{server_address::ServerAddress, server_probe::ProbeError};

/// The role a server plays in the cluster, as classified from its last health reply.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ServerRole {
    /// Not checked yet, or the last check failed.
    #[default]
    Unknown,
    Standalone,
    RsPrimary,
    RsSecondary,
    RsArbiter,
    /// Hidden, starting up, recovering, etc.
    RsOther,
    /// A replica set member that has not been initialized yet.
    RsGhost,
    /// A sharded cluster router.
    Mongos,
}

impl ServerRole {
    pub fn is_available(&self) -> bool {
        !matches!(self, ServerRole::Unknown)
    }
}

/// Replica set election identifier. Orders bytewise, like the server does.
#[derive(Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ElectionId([u8; 12]);

impl ElectionId {
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> [u8; 12] {
        self.0
    }
}

impl FromStr for ElectionId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 24 || !s.is_ascii() {
            return Err(format!("election id `{}` is not 24 hex characters", s));
        }
        let mut bytes = [0u8; 12];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| format!("election id `{}` is not valid hex", s))?;
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for ElectionId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for ElectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ElectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ElectionId({})", self)
    }
}

impl<'de> Deserialize<'de> for ElectionId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// The raw reply of one health exchange with a server.
#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct HelloReply {
    pub ok: Option<f64>,
    pub is_writable_primary: bool,
    pub secondary: bool,
    pub arbiter_only: bool,
    pub hidden: bool,
    #[serde(rename = "isreplicaset")]
    pub is_replica_set: bool,
    pub msg: Option<String>,
    pub set_name: Option<String>,
    pub set_version: Option<i32>,
    pub election_id: Option<ElectionId>,
    pub hosts: Vec<String>,
    pub passives: Vec<String>,
    pub arbiters: Vec<String>,
    pub me: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub max_wire_version: Option<i32>,
    pub last_write: Option<LastWrite>,
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LastWrite {
    /// Milliseconds since the Unix epoch.
    pub last_write_date: Option<i64>,
}

impl HelloReply {
    /// Whether the server answered the exchange successfully. A missing `ok` counts as
    /// success.
    pub fn is_ok(&self) -> bool {
        self.ok.map(|ok| ok == 1.0).unwrap_or(true)
    }

    /// Classifies the server from this reply.
    pub fn server_role(&self) -> ServerRole {
        if !self.is_ok() {
            ServerRole::Unknown
        } else if self.is_replica_set {
            ServerRole::RsGhost
        } else if self.msg.as_deref() == Some("isdbgrid") {
            ServerRole::Mongos
        } else if self.set_name.is_some() {
            if self.hidden {
                ServerRole::RsOther
            } else if self.is_writable_primary {
                ServerRole::RsPrimary
            } else if self.secondary {
                ServerRole::RsSecondary
            } else if self.arbiter_only {
                ServerRole::RsArbiter
            } else {
                ServerRole::RsOther
            }
        } else {
            ServerRole::Standalone
        }
    }
}

/// A point-in-time description of one server.
///
/// Descriptions are never edited once built. Each check produces a fresh one that
/// replaces the previous one wholesale.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDescription {
    pub(crate) address: ServerAddress,
    pub(crate) role: ServerRole,
    pub(crate) round_trip_time: Option<Duration>,
    pub(crate) last_write_date: Option<SystemTime>,
    pub(crate) last_update_time: SystemTime,
    pub(crate) max_wire_version: Option<i32>,
    pub(crate) set_name: Option<String>,
    pub(crate) set_version: Option<i32>,
    pub(crate) election_id: Option<ElectionId>,
    pub(crate) tags: BTreeMap<String, String>,
    pub(crate) known_hosts: Vec<ServerAddress>,
    pub(crate) me: Option<ServerAddress>,
    pub(crate) error: Option<ProbeError>,
}

impl ServerDescription {
    /// Placeholder for an address that has not been checked yet.
    pub fn new(address: ServerAddress) -> Self {
        Self {
            address,
            role: ServerRole::Unknown,
            round_trip_time: None,
            last_write_date: None,
            last_update_time: SystemTime::now(),
            max_wire_version: None,
            set_name: None,
            set_version: None,
            election_id: None,
            tags: BTreeMap::new(),
            known_hosts: Vec::new(),
            me: None,
            error: None,
        }
    }

    /// Builds the description of a failed check. The role is always `Unknown`.
    pub fn from_error(address: ServerAddress, error: ProbeError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(address)
        }
    }

    /// Builds the description of a successful check.
    pub fn from_reply(address: ServerAddress, reply: HelloReply, round_trip_time: Duration) -> Self {
        if !reply.is_ok() {
            return Self::from_error(
                address,
                ProbeError::CommandFailed(
                    reply
                        .msg
                        .unwrap_or_else(|| "server replied with ok: 0".to_string()),
                ),
            );
        }

        let role = reply.server_role();
        let known_hosts = reply
            .hosts
            .iter()
            .chain(reply.passives.iter())
            .chain(reply.arbiters.iter())
            .filter_map(|host| match ServerAddress::parse(host) {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    tracing::warn!("Ignoring host `{}` reported by {}: {}", host, address, e);
                    None
                }
            })
            .collect();
        let me = reply.me.as_deref().and_then(|me| ServerAddress::parse(me).ok());
        let last_write_date = reply
            .last_write
            .as_ref()
            .and_then(|lw| lw.last_write_date)
            .and_then(|millis| u64::try_from(millis).ok())
            .map(|millis| SystemTime::UNIX_EPOCH + Duration::from_millis(millis));

        Self {
            address,
            role,
            round_trip_time: Some(round_trip_time),
            last_write_date,
            last_update_time: SystemTime::now(),
            max_wire_version: reply.max_wire_version,
            set_name: reply.set_name,
            set_version: reply.set_version,
            election_id: reply.election_id,
            tags: reply.tags,
            known_hosts,
            me,
            error: None,
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn role(&self) -> ServerRole {
        self.role
    }

    pub fn round_trip_time(&self) -> Option<Duration> {
        self.round_trip_time
    }

    pub fn last_write_date(&self) -> Option<SystemTime> {
        self.last_write_date
    }

    pub fn last_update_time(&self) -> SystemTime {
        self.last_update_time
    }

    pub fn max_wire_version(&self) -> Option<i32> {
        self.max_wire_version
    }

    pub fn set_name(&self) -> Option<&str> {
        self.set_name.as_deref()
    }

    pub fn set_version(&self) -> Option<i32> {
        self.set_version
    }

    pub fn election_id(&self) -> Option<ElectionId> {
        self.election_id
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn known_hosts(&self) -> &[ServerAddress] {
        &self.known_hosts
    }

    pub fn error(&self) -> Option<&ProbeError> {
        self.error.as_ref()
    }

    pub fn is_available(&self) -> bool {
        self.role.is_available()
    }

    /// True when the server reports itself under a different address than the one it was
    /// reached at.
    pub fn invalid_me(&self) -> bool {
        self.me.as_ref().map(|me| me != &self.address).unwrap_or(false)
    }

    /// True when `other` differs in something that changes how the topology is built:
    /// role, replica set identity, epoch, membership, tags or reachability.
    pub fn is_material_change(&self, other: &ServerDescription) -> bool {
        self.role != other.role
            || self.set_name != other.set_name
            || self.set_version != other.set_version
            || self.election_id != other.election_id
            || self.known_hosts != other.known_hosts
            || self.tags != other.tags
            || self.error.is_some() != other.error.is_some()
    }
}
