//! Test doubles shared by the unit tests.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;

use crate::{
    server_address::ServerAddress,
    server_description::{ElectionId, HelloReply, LastWrite, ServerDescription, ServerRole},
    server_probe::{HealthCheck, ProbeError},
};

pub(crate) fn addr(address: &str) -> ServerAddress {
    ServerAddress::parse(address).unwrap()
}

pub(crate) fn at_secs(seconds: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(seconds)
}

pub(crate) fn election_id(n: u8) -> ElectionId {
    let mut bytes = [0u8; 12];
    bytes[11] = n;
    ElectionId::from_bytes(bytes)
}

pub(crate) fn primary_reply(set_name: &str, hosts: &[&str]) -> HelloReply {
    HelloReply {
        ok: Some(1.0),
        is_writable_primary: true,
        set_name: Some(set_name.to_string()),
        hosts: hosts.iter().map(|h| h.to_string()).collect(),
        max_wire_version: Some(17),
        ..Default::default()
    }
}

pub(crate) fn secondary_reply(set_name: &str, hosts: &[&str]) -> HelloReply {
    HelloReply {
        ok: Some(1.0),
        secondary: true,
        set_name: Some(set_name.to_string()),
        hosts: hosts.iter().map(|h| h.to_string()).collect(),
        max_wire_version: Some(17),
        ..Default::default()
    }
}

pub(crate) fn with_last_write(mut reply: HelloReply, millis: i64) -> HelloReply {
    reply.last_write = Some(LastWrite {
        last_write_date: Some(millis),
    });
    reply
}

/// Builds descriptions directly, bypassing the probe, so timestamps can be pinned.
pub(crate) struct DescriptionBuilder(ServerDescription);

pub(crate) fn sd(address: &str, role: ServerRole) -> DescriptionBuilder {
    let mut description = ServerDescription::new(addr(address));
    description.role = role;
    if role.is_available() {
        description.round_trip_time = Some(Duration::from_millis(10));
        description.max_wire_version = Some(17);
        description.last_update_time = at_secs(0);
    }
    DescriptionBuilder(description)
}

impl DescriptionBuilder {
    pub(crate) fn set_name(mut self, set_name: &str) -> Self {
        self.0.set_name = Some(set_name.to_string());
        self
    }

    pub(crate) fn epoch(mut self, set_version: i32, election: u8) -> Self {
        self.0.set_version = Some(set_version);
        self.0.election_id = Some(election_id(election));
        self
    }

    pub(crate) fn hosts(mut self, hosts: &[&str]) -> Self {
        self.0.known_hosts = hosts.iter().map(|h| addr(h)).collect();
        self
    }

    pub(crate) fn me(mut self, me: &str) -> Self {
        self.0.me = Some(addr(me));
        self
    }

    pub(crate) fn rtt_ms(mut self, millis: u64) -> Self {
        self.0.round_trip_time = Some(Duration::from_millis(millis));
        self
    }

    pub(crate) fn last_write_secs(mut self, seconds: u64) -> Self {
        self.0.last_write_date = Some(at_secs(seconds));
        self
    }

    pub(crate) fn no_last_write(mut self) -> Self {
        self.0.last_write_date = None;
        self
    }

    pub(crate) fn last_update_secs(mut self, seconds: u64) -> Self {
        self.0.last_update_time = at_secs(seconds);
        self
    }

    pub(crate) fn tag(mut self, key: &str, value: &str) -> Self {
        self.0.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub(crate) fn wire_version(mut self, version: i32) -> Self {
        self.0.max_wire_version = Some(version);
        self
    }

    pub(crate) fn build(self) -> ServerDescription {
        self.0
    }
}

#[derive(Debug, Default)]
struct Script {
    replies: HashMap<ServerAddress, Result<HelloReply, ProbeError>>,
    calls: HashMap<ServerAddress, usize>,
    delay: Duration,
}

/// A [`HealthCheck`] answering from a script that tests edit while monitors run.
#[derive(Clone, Debug, Default)]
pub(crate) struct ScriptedHealthCheck {
    script: Arc<Mutex<Script>>,
}

impl ScriptedHealthCheck {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_reply(&self, address: &ServerAddress, reply: HelloReply) {
        self.script
            .lock()
            .unwrap()
            .replies
            .insert(address.clone(), Ok(reply));
    }

    pub(crate) fn set_error(&self, address: &ServerAddress, error: ProbeError) {
        self.script
            .lock()
            .unwrap()
            .replies
            .insert(address.clone(), Err(error));
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        self.script.lock().unwrap().delay = delay;
    }

    pub(crate) fn calls(&self, address: &ServerAddress) -> usize {
        self.script
            .lock()
            .unwrap()
            .calls
            .get(address)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl HealthCheck for ScriptedHealthCheck {
    async fn check(
        &self,
        address: &ServerAddress,
        _deadline: Duration,
    ) -> Result<HelloReply, ProbeError> {
        let (result, delay) = {
            let mut script = self.script.lock().unwrap();
            *script.calls.entry(address.clone()).or_insert(0) += 1;
            let result = script.replies.get(address).cloned().unwrap_or_else(|| {
                Err(ProbeError::Network(format!("no scripted reply for {}", address)))
            });
            (result, script.delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        result
    }
}

