//! One health check against one server.
//!
//! The exchange itself goes through a [`HealthCheck`], which knows the wire protocol. The
//! [`ServerProbe`] wraps it with a deadline, times it, and turns the outcome into a
//! [`ServerDescription`].
use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;
use dyn_clone::DynClone;
use url::Url;
use tokio::time::Instant;
use tracing::instrument;

use crate::{
    error_chain_fmt,
    server_address::ServerAddress,
    server_description::{HelloReply, ServerDescription},
};

/// Performs the raw health exchange with one server.
#[async_trait]
pub trait HealthCheck: Debug + DynClone + Send + Sync {
    async fn check(
        &self,
        address: &ServerAddress,
        deadline: Duration,
    ) -> Result<HelloReply, ProbeError>;
}

dyn_clone::clone_trait_object!(HealthCheck);

/// Failure of one health exchange. Never surfaced to selection callers; it only marks the
/// server `Unknown`.
#[derive(thiserror::Error, Clone, PartialEq)]
pub enum ProbeError {
    #[error("Health check did not complete within {0:?}")]
    Timeout(Duration),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Server rejected the health check: {0}")]
    CommandFailed(String),
}
impl std::fmt::Debug for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

impl ProbeError {
    /// Errors worth one immediate retry when the server was healthy a moment ago.
    pub fn is_network_error(&self) -> bool {
        matches!(self, ProbeError::Network(_) | ProbeError::Timeout(_))
    }
}

/// Health check that fetches the hello reply as JSON over HTTP, from
/// `{scheme}://{host}:{port}/hello`.
#[derive(Clone, Debug)]
pub struct HttpHealthCheck {
    client: reqwest::Client,
    scheme: String,
    path: String,
}

impl Default for HttpHealthCheck {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl HttpHealthCheck {
    /// Reqwest keeps its own connection pool, so hand in a client that lives as long as the
    /// topology.
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            scheme: "http".to_string(),
            path: "hello".to_string(),
        }
    }

    pub fn use_https(mut self) -> Self {
        self.scheme = "https".to_string();
        self
    }

    pub fn set_path(mut self, path: &str) -> Self {
        self.path = path.trim_start_matches('/').to_string();
        self
    }

    fn hello_url(&self, address: &ServerAddress) -> Result<Url, ProbeError> {
        Url::parse(&format!("{}://{}/", self.scheme, address))
            .and_then(|base| base.join(&self.path))
            .map_err(|e| ProbeError::Protocol(format!("Invalid health check url. Caused by: {}", e)))
    }
}

#[async_trait]
impl HealthCheck for HttpHealthCheck {
    #[instrument(level = "trace", skip(self))]
    async fn check(
        &self,
        address: &ServerAddress,
        deadline: Duration,
    ) -> Result<HelloReply, ProbeError> {
        let url = self.hello_url(address)?;
        let response = self
            .client
            .get(url)
            .timeout(deadline)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, deadline))?;

        if !response.status().is_success() {
            return Err(ProbeError::Protocol(format!(
                "Health check returned HTTP status {}",
                response.status()
            )));
        }

        response.json::<HelloReply>().await.map_err(|e| {
            ProbeError::Protocol(format!("Unable to deserialize hello reply. Caused by: {}", e))
        })
    }
}

fn map_reqwest_error(e: reqwest::Error, deadline: Duration) -> ProbeError {
    if e.is_timeout() {
        ProbeError::Timeout(deadline)
    } else if e.is_connect() || e.is_request() {
        ProbeError::Network(e.to_string())
    } else {
        ProbeError::Protocol(e.to_string())
    }
}

/// Combines a new round trip sample with the previous average:
/// `weight * sample + (1 - weight) * previous`. The first sample is taken as is.
pub fn smooth_round_trip_time(
    previous: Option<Duration>,
    sample: Duration,
    weight: f64,
) -> Duration {
    match previous {
        None => sample,
        Some(previous) => {
            let nanos = weight * sample.as_nanos() as f64
                + (1.0 - weight) * previous.as_nanos() as f64;
            Duration::from_nanos(nanos.round() as u64)
        }
    }
}

/// Runs a [`HealthCheck`] for one address under a deadline.
#[derive(Clone, Debug)]
pub struct ServerProbe {
    address: ServerAddress,
    health_check: Box<dyn HealthCheck>,
    deadline: Duration,
    rtt_smoothing_weight: f64,
}

impl ServerProbe {
    pub fn new(
        address: ServerAddress,
        health_check: Box<dyn HealthCheck>,
        deadline: Duration,
        rtt_smoothing_weight: f64,
    ) -> Self {
        Self {
            address,
            health_check,
            deadline,
            rtt_smoothing_weight,
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Performs one check. Failures come back as an `Unknown` description carrying the
    /// error, never as an `Err`.
    #[instrument(level = "debug", skip(self), fields(address = %self.address))]
    pub async fn check(&self, previous_round_trip_time: Option<Duration>) -> ServerDescription {
        let started = Instant::now();
        let result = tokio::time::timeout(
            self.deadline,
            self.health_check.check(&self.address, self.deadline),
        )
        .await;
        let sample = started.elapsed();

        match result {
            Ok(Ok(reply)) => {
                let rtt = smooth_round_trip_time(
                    previous_round_trip_time,
                    sample,
                    self.rtt_smoothing_weight,
                );
                tracing::trace!("Health check succeeded in {:?}, smoothed to {:?}", sample, rtt);
                ServerDescription::from_reply(self.address.clone(), reply, rtt)
            }
            Ok(Err(e)) => {
                tracing::debug!("Health check failed. Caused by: {}", e);
                ServerDescription::from_error(self.address.clone(), e)
            }
            Err(_) => {
                tracing::debug!("Health check timed out after {:?}", self.deadline);
                ServerDescription::from_error(
                    self.address.clone(),
                    ProbeError::Timeout(self.deadline),
                )
            }
        }
    }
}
