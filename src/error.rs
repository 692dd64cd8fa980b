//! Main Crate Error

use crate::{
    common::InvalidAddr,
    directory::{BatchError, PublishError},
    identity::IdentityError,
    network::NetworkError,
    node::NodeStatus,
    store::StoreError,
};

#[derive(thiserror::Error, Debug)]
/// FreedomNames crate error enum.
pub enum Error {
    #[error(transparent)]
    Startup(#[from] StartupError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(thiserror::Error, Debug)]
/// Fatal errors while starting a node, it can't proceed partially
/// initialized.
pub enum StartupError {
    #[error("Failed to load or create the node identity: {0}")]
    Identity(#[from] IdentityError),

    #[error("Invalid listen address: {0}")]
    ListenAddr(#[from] InvalidAddr),

    #[error("Failed to create the network host: {0}")]
    Host(NetworkError),

    #[error("Failed to start local discovery: {0}")]
    Discovery(NetworkError),

    #[error("Failed to create the distributed store: {0}")]
    Store(StoreError),

    #[error("Failed to bootstrap the distributed store: {0}")]
    Bootstrap(StoreError),

    #[error("Node can't be started from the {0:?} state")]
    InvalidState(NodeStatus),

    #[error("Node was shut down while starting")]
    Aborted,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
