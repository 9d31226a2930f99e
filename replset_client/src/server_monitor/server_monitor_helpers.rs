use std::time::Duration;

#[derive(Debug)]
pub(crate) enum ServerMonitorMessage {
    /// Probe again as soon as the minimum heartbeat allows.
    CheckNow,
}

/// Timing a monitor needs, copied out of the topology conventions at spawn time.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ServerMonitorSchedule {
    pub(crate) heartbeat_frequency: Duration,
    pub(crate) min_heartbeat_frequency: Duration,
}
