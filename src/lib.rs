#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

mod cache;
mod cancel;
mod common;
mod config;
mod directory;
mod discovery;
mod error;
mod identity;
mod node;
mod validator;

// Public modules
#[cfg(feature = "api")]
pub mod api;
pub mod backend;
pub mod network;
pub mod store;
pub mod testnet;

pub use crate::cache::{LocalCache, DEFAULT_CACHE_CAPACITY};
pub use crate::cancel::{CancelReason, CancelToken};
pub use crate::common::{peer_infos, Id, InvalidAddr, InvalidId, Multiaddr, PeerInfo, ID_SIZE};
pub use crate::config::*;
pub use crate::directory::{store_key, BatchError, NameDirectory, PublishError, Record};
pub use crate::discovery::{DiscoveryNotifee, DiscoveryService, PeerFoundHandler};
pub use crate::identity::{IdentityError, NodeIdentity};
pub use crate::node::{Node, NodeBuilder, NodeStatus, StatsSnapshot};
pub use crate::validator::{
    split_key, NameValidator, NamespacedValidator, Rejected, Validator, NAMESPACE,
};
pub use backend::Backend;
pub use bytes::Bytes;

pub use ed25519_dalek::SigningKey;

pub mod errors {
    //! Exported errors
    pub use super::error::{Error, Result, StartupError};
    pub use super::identity::IdentityError;
    pub use super::network::NetworkError;
    pub use super::store::StoreError;
    pub use super::validator::Rejected;
    pub use super::directory::{BatchError, PublishError};
}

pub use errors::{Error, StartupError};
