use std::time::Duration;

/// Timing and policy settings shared by the monitors and the selector.
#[derive(Clone, Debug, PartialEq)]
pub struct TopologyConventions {
    heartbeat_frequency: Duration,
    min_heartbeat_frequency: Duration,
    local_threshold: Duration,
    server_selection_timeout: Duration,
    connect_timeout: Duration,
    idle_write_period: Duration,
    smallest_max_staleness: Duration,
    rtt_smoothing_weight: f64,
}

impl Default for TopologyConventions {
    fn default() -> Self {
        Self {
            heartbeat_frequency: Duration::from_secs(10),
            min_heartbeat_frequency: Duration::from_millis(500),
            local_threshold: Duration::from_millis(15),
            server_selection_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            idle_write_period: Duration::from_secs(10),
            smallest_max_staleness: Duration::from_secs(90),
            rtt_smoothing_weight: 0.2,
        }
    }
}

// Mutators
impl TopologyConventions {
    pub fn with_heartbeat_frequency(mut self, heartbeat_frequency: Duration) -> Self {
        self.heartbeat_frequency = heartbeat_frequency;
        self
    }

    pub fn with_min_heartbeat_frequency(mut self, min_heartbeat_frequency: Duration) -> Self {
        self.min_heartbeat_frequency = min_heartbeat_frequency;
        self
    }

    pub fn with_local_threshold(mut self, local_threshold: Duration) -> Self {
        self.local_threshold = local_threshold;
        self
    }

    pub fn with_server_selection_timeout(mut self, timeout: Duration) -> Self {
        self.server_selection_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// How often an idle primary writes a no-op, which bounds how precise a staleness
    /// estimate can be.
    pub fn with_idle_write_period(mut self, idle_write_period: Duration) -> Self {
        self.idle_write_period = idle_write_period;
        self
    }

    pub fn with_smallest_max_staleness(mut self, smallest_max_staleness: Duration) -> Self {
        self.smallest_max_staleness = smallest_max_staleness;
        self
    }

    pub fn with_rtt_smoothing_weight(mut self, weight: f64) -> Self {
        self.rtt_smoothing_weight = weight;
        self
    }
}

// Getters
impl TopologyConventions {
    pub fn heartbeat_frequency(&self) -> Duration {
        self.heartbeat_frequency
    }

    pub fn min_heartbeat_frequency(&self) -> Duration {
        self.min_heartbeat_frequency
    }

    pub fn local_threshold(&self) -> Duration {
        self.local_threshold
    }

    pub fn server_selection_timeout(&self) -> Duration {
        self.server_selection_timeout
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn idle_write_period(&self) -> Duration {
        self.idle_write_period
    }

    pub fn smallest_max_staleness(&self) -> Duration {
        self.smallest_max_staleness
    }

    pub fn rtt_smoothing_weight(&self) -> f64 {
        self.rtt_smoothing_weight
    }

    /// The smallest max staleness bound that a selection will accept:
    /// `max(smallest_max_staleness, heartbeat_frequency + idle_write_period)`.
    pub fn minimum_max_staleness(&self) -> Duration {
        std::cmp::max(
            self.smallest_max_staleness,
            self.heartbeat_frequency
                .checked_add(self.idle_write_period)
                .unwrap_or(Duration::MAX),
        )
    }
}
