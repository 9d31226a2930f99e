//! Read preferences: which servers an operation is willing to read from.
use std::{collections::BTreeMap, time::Duration};

use crate::{error_chain_fmt, server_description::ServerDescription};

/// Which roles a read may be served by.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ReadMode {
    #[default]
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

/// Upper bound on how far behind a secondary may be, in whole seconds.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash)]
pub enum MaxStaleness {
    #[default]
    Disabled,
    Seconds(u64),
}

impl MaxStaleness {
    /// Sentinel used by configuration sources to mean "no bound".
    pub const DISABLED_SENTINEL: i64 = -1;

    /// Converts a raw configuration value. `-1` disables the bound, any other value must be
    /// a positive number of seconds.
    pub fn from_seconds(seconds: i64) -> Result<Self, ReadPreferenceError> {
        match seconds {
            Self::DISABLED_SENTINEL => Ok(MaxStaleness::Disabled),
            s if s > 0 => Ok(MaxStaleness::Seconds(s as u64)),
            s => Err(ReadPreferenceError::NonPositiveMaxStaleness(s)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, MaxStaleness::Seconds(_))
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            MaxStaleness::Disabled => None,
            MaxStaleness::Seconds(s) => Some(Duration::from_secs(*s)),
        }
    }

    /// The value as configuration sources spell it, `-1` when disabled.
    pub fn as_seconds(&self) -> i64 {
        match self {
            MaxStaleness::Disabled => Self::DISABLED_SENTINEL,
            MaxStaleness::Seconds(s) => i64::try_from(*s).unwrap_or(i64::MAX),
        }
    }
}

/// One tag-set alternative. A server matches when it carries every pair in the set, so
/// the empty set matches every server.
#[derive(Debug, Default, Clone, Eq, PartialEq, Hash)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, server: &ServerDescription) -> bool {
        self.0
            .iter()
            .all(|(key, value)| server.tags().get(key) == Some(value))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TagSet {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// An immutable, validated read preference.
#[derive(Debug, Default, Clone, Eq, PartialEq, Hash)]
pub struct ReadPreference {
    mode: ReadMode,
    max_staleness: MaxStaleness,
    tag_sets: Vec<TagSet>,
}

impl ReadPreference {
    pub fn new(
        mode: ReadMode,
        max_staleness: MaxStaleness,
        tag_sets: Vec<TagSet>,
    ) -> Result<Self, ReadPreferenceError> {
        let read_preference = Self {
            mode,
            max_staleness,
            tag_sets,
        };
        read_preference.validate()?;
        Ok(read_preference)
    }

    pub fn primary() -> Self {
        Self::default()
    }

    /// A preference for `mode` with no staleness bound and no tags. Only `Primary` can't
    /// fail validation here, so this never does either.
    pub fn with_mode(mode: ReadMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    pub fn max_staleness(&self) -> MaxStaleness {
        self.max_staleness
    }

    pub fn tag_sets(&self) -> &[TagSet] {
        &self.tag_sets
    }

    /// Checks the combination of mode, staleness and tags. Selection runs this again before
    /// every attempt.
    pub fn validate(&self) -> Result<(), ReadPreferenceError> {
        if let MaxStaleness::Seconds(0) = self.max_staleness {
            return Err(ReadPreferenceError::NonPositiveMaxStaleness(0));
        }
        if self.mode == ReadMode::Primary {
            if self.max_staleness.is_enabled() {
                return Err(ReadPreferenceError::PrimaryWithMaxStaleness);
            }
            if self.tag_sets.iter().any(|t| !t.is_empty()) {
                return Err(ReadPreferenceError::PrimaryWithTagSets);
            }
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Clone, PartialEq, Eq)]
pub enum ReadPreferenceError {
    #[error("Read preference mode `primary` can't be combined with a max staleness")]
    PrimaryWithMaxStaleness,
    #[error("Read preference mode `primary` can't be combined with tag sets")]
    PrimaryWithTagSets,
    #[error("Max staleness must be a positive integer, got `{0}`")]
    NonPositiveMaxStaleness(i64),
    #[error("Max staleness must be at least {minimum_seconds} seconds, got {configured_seconds}")]
    MaxStalenessTooSmall {
        configured_seconds: u64,
        minimum_seconds: u64,
    },
    #[error("Server `{address}` has max wire version {wire_version:?}, which doesn't support max staleness")]
    MaxStalenessUnsupported {
        address: String,
        wire_version: Option<i32>,
    },
}
impl std::fmt::Debug for ReadPreferenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
