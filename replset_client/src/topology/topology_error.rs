use crate::{error_chain_fmt, server_address::ServerAddressError};

#[derive(thiserror::Error)]
pub enum TopologyError {
    #[error("No hosts were supplied and a topology can't exist without at least one")]
    MissingHostsError,
    #[error("One of the supplied hosts is not a valid server address")]
    InvalidAddress(#[from] ServerAddressError),
    #[error("Invalid topology configuration: {0}")]
    InvalidConfiguration(String),
    #[error(transparent)]
    UnexpectedError(#[from] anyhow::Error),
}
impl std::fmt::Debug for TopologyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
