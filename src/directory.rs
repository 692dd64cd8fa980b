//! Name records, resolved through the local cache first and the distributed
//! store second.
//!
//! Writes go to the cache and then to the store. A failed store write keeps
//! the cache entry, so a node may briefly serve a value the rest of the
//! network never received.

use std::{fmt::Debug, time::Duration};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::{
    cache::LocalCache,
    cancel::CancelToken,
    node::Node,
    store::StoreError,
    validator::{NameValidator, Rejected, Validator},
};

#[derive(Debug, Clone, PartialEq, Eq)]
/// A name and the single address record it resolves to.
pub struct Record {
    pub name: String,
    pub value: Bytes,
}

impl Record {
    pub fn new(name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// The distributed store key of `name` under `namespace`, e.g. `/fn/alice.fn`.
pub fn store_key(namespace: &str, name: &str) -> String {
    format!("/{namespace}/{name}")
}

/// Publishes and resolves names on behalf of a [Node].
///
/// Owns the [LocalCache]; borrows the node's distributed store for each call,
/// so it fails with [StoreError::NotInitialized] while the node isn't
/// running.
pub struct NameDirectory {
    node: Node,
    cache: LocalCache,
    validator: NameValidator,
    request_timeout: Duration,
}

impl NameDirectory {
    /// Cache capacity, namespace and request timeout are taken from the
    /// node's configuration.
    pub fn new(node: Node) -> Self {
        let config = node.config();

        Self {
            cache: LocalCache::new(config.cache_capacity),
            validator: NameValidator::new(config.namespace.clone()),
            request_timeout: config.request_timeout,
            node,
        }
    }

    // === Getters ===

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    /// The distributed store key `name` is published under.
    pub fn store_key(&self, name: &str) -> String {
        store_key(self.validator.namespace(), name)
    }

    // === Public Methods ===

    /// The value `name` resolves to, `None` if nobody published it.
    ///
    /// A cache hit never reaches the network. On a miss the store read is
    /// bounded by the request timeout and by `cancel`, and non empty values
    /// are cached.
    pub fn resolve(&self, name: &str, cancel: &CancelToken) -> Result<Option<Bytes>, StoreError> {
        if let Some(value) = self.cache.get(name) {
            debug!(?name, "Resolved from the local cache");
            return Ok(Some(value));
        }

        let store = self.node.store()?;
        let key = self.store_key(name);
        let cancel = cancel.child_with_timeout(self.request_timeout);

        debug!(?key, "Resolving from the distributed store");

        match store.get(key.as_bytes(), &cancel)? {
            Some(value) if !value.is_empty() => {
                self.cache.set(name, value.clone());
                Ok(Some(value))
            }
            _ => Ok(None),
        }
    }

    /// Validate the record, cache it, then write it to the distributed store.
    ///
    /// The cache entry is kept if the store write fails.
    pub fn publish(
        &self,
        name: &str,
        value: impl Into<Bytes>,
        cancel: &CancelToken,
    ) -> Result<(), PublishError> {
        let value = value.into();
        let key = self.store_key(name);

        self.validator.validate(key.as_bytes(), &value)?;

        let store = self.node.store()?;

        self.cache.set(name, value.clone());

        debug!(?key, size = value.len(), "Publishing to the distributed store");

        let cancel = cancel.child_with_timeout(self.request_timeout);

        if let Err(error) = store.put(key.as_bytes(), value, &cancel) {
            warn!(?key, ?error, "Failed to publish to the distributed store");
            return Err(error.into());
        }

        Ok(())
    }

    /// Publish records in order, stopping at the first failure.
    ///
    /// Records published before the failure stay published. Returns the
    /// number of records published.
    pub fn publish_batch(
        &self,
        records: impl IntoIterator<Item = Record>,
        cancel: &CancelToken,
    ) -> Result<usize, BatchError> {
        let mut applied = 0;

        for Record { name, value } in records {
            if let Err(source) = self.publish(&name, value, cancel) {
                return Err(BatchError {
                    applied,
                    name,
                    source,
                });
            }

            applied += 1;
        }

        Ok(applied)
    }
}

impl Debug for NameDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameDirectory")
            .field("namespace", &self.validator.namespace())
            .field("cached", &self.cache.len())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Errors publishing a single record.
pub enum PublishError {
    #[error("Invalid record: {0}")]
    /// The record was rejected before reaching the cache or the store.
    Validation(#[from] Rejected),

    #[error(transparent)]
    /// The store is not running, or the write failed. Callers may retry.
    Store(#[from] StoreError),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to publish {name:?} after {applied} records: {source}")]
/// A batch publish stopped at `name`, after `applied` records took effect.
pub struct BatchError {
    pub applied: usize,
    pub name: String,
    pub source: PublishError,
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, thread};

    use tempfile::TempDir;

    use super::*;
    use crate::{
        store::DistributedStore,
        testnet::{MemoryStore, Testnet},
    };

    fn start_node(testnet: &Testnet, dir: &TempDir, key: &str) -> Node {
        let node = Node::builder()
            .bootstrap_node()
            .key_path(dir.path().join(key))
            .build(Arc::new(testnet.clone()));

        node.start().unwrap();

        node
    }

    fn store_of(testnet: &Testnet, node: &Node) -> Arc<MemoryStore> {
        testnet.store(&node.peer_id().unwrap()).unwrap()
    }

    #[test]
    fn resolve_published_name_from_cache() {
        let testnet = Testnet::new();
        let dir = TempDir::new().unwrap();
        let node = start_node(&testnet, &dir, "a.key");
        let directory = NameDirectory::new(node.clone());
        let cancel = CancelToken::new();

        directory.publish("alice.fn", "10.0.0.5", &cancel).unwrap();

        let store = store_of(&testnet, &node);
        assert_eq!(store.put_calls(), 1);
        assert_eq!(
            store.local_record(b"/fn/alice.fn"),
            Some(Bytes::from_static(b"10.0.0.5"))
        );

        assert_eq!(
            directory.resolve("alice.fn", &cancel).unwrap(),
            Some(Bytes::from_static(b"10.0.0.5"))
        );
        assert_eq!(store.get_calls(), 0);

        node.shutdown();
    }

    #[test]
    fn unknown_name_is_not_found() {
        let testnet = Testnet::new();
        let dir = TempDir::new().unwrap();
        let node = start_node(&testnet, &dir, "a.key");
        let directory = NameDirectory::new(node.clone());

        assert_eq!(
            directory.resolve("unknown.fn", &CancelToken::new()),
            Ok(None)
        );
        assert_eq!(store_of(&testnet, &node).get_calls(), 1);
        assert!(directory.cache().is_empty());

        node.shutdown();
    }

    #[test]
    fn empty_store_value_is_not_found_and_not_cached() {
        let testnet = Testnet::new();
        let dir = TempDir::new().unwrap();
        let node = start_node(&testnet, &dir, "a.key");
        let directory = NameDirectory::new(node.clone());
        let cancel = CancelToken::new();

        store_of(&testnet, &node)
            .put(b"/fn/empty.fn", Bytes::new(), &cancel)
            .unwrap();

        assert_eq!(directory.resolve("empty.fn", &cancel), Ok(None));
        assert_eq!(directory.cache().get("empty.fn"), None);

        node.shutdown();
    }

    #[test]
    fn store_hit_is_cached() {
        let testnet = Testnet::new();
        let dir = TempDir::new().unwrap();
        let node = start_node(&testnet, &dir, "a.key");
        let directory = NameDirectory::new(node.clone());
        let cancel = CancelToken::new();

        let store = store_of(&testnet, &node);
        store
            .put(b"/fn/bob.fn", Bytes::from_static(b"10.0.0.6"), &cancel)
            .unwrap();

        assert_eq!(
            directory.resolve("bob.fn", &cancel).unwrap(),
            Some(Bytes::from_static(b"10.0.0.6"))
        );
        assert_eq!(
            directory.cache().get("bob.fn"),
            Some(Bytes::from_static(b"10.0.0.6"))
        );

        directory.resolve("bob.fn", &cancel).unwrap();
        assert_eq!(store.get_calls(), 1);

        node.shutdown();
    }

    #[test]
    fn invalid_names_are_rejected_before_caching() {
        let testnet = Testnet::new();
        let dir = TempDir::new().unwrap();
        let node = start_node(&testnet, &dir, "a.key");
        let directory = NameDirectory::new(node.clone());

        assert_eq!(
            directory.publish("", "10.0.0.5", &CancelToken::new()),
            Err(PublishError::Validation(Rejected::InvalidKey))
        );
        assert!(directory.cache().is_empty());
        assert_eq!(store_of(&testnet, &node).put_calls(), 0);

        node.shutdown();
    }

    #[test]
    fn not_running_node_is_unavailable() {
        let testnet = Testnet::new();
        let dir = TempDir::new().unwrap();
        let node = Node::builder()
            .key_path(dir.path().join("a.key"))
            .build(Arc::new(testnet));
        let directory = NameDirectory::new(node);
        let cancel = CancelToken::new();

        assert_eq!(
            directory.publish("alice.fn", "10.0.0.5", &cancel),
            Err(PublishError::Store(StoreError::NotInitialized))
        );
        assert_eq!(
            directory.resolve("alice.fn", &cancel),
            Err(StoreError::NotInitialized)
        );
        assert!(directory.cache().is_empty());
    }

    #[test]
    fn failed_store_write_keeps_cache_entry() {
        let testnet = Testnet::new();
        let dir = TempDir::new().unwrap();
        let node = start_node(&testnet, &dir, "a.key");
        let directory = NameDirectory::new(node.clone());
        let cancel = CancelToken::new();

        store_of(&testnet, &node).set_unavailable(true);

        assert!(matches!(
            directory.publish("alice.fn", "10.0.0.5", &cancel),
            Err(PublishError::Store(StoreError::Unavailable(_)))
        ));
        assert_eq!(
            directory.resolve("alice.fn", &cancel).unwrap(),
            Some(Bytes::from_static(b"10.0.0.5"))
        );

        node.shutdown();
    }

    #[test]
    fn cancelled_publish() {
        let testnet = Testnet::new();
        let dir = TempDir::new().unwrap();
        let node = start_node(&testnet, &dir, "a.key");
        let directory = NameDirectory::new(node.clone());

        let cancel = CancelToken::new();
        cancel.cancel();

        assert_eq!(
            directory.publish("alice.fn", "10.0.0.5", &cancel),
            Err(PublishError::Store(StoreError::Cancelled))
        );

        node.shutdown();
    }

    #[test]
    fn batch_stops_at_first_failure() {
        let testnet = Testnet::new();
        let dir = TempDir::new().unwrap();
        let node = start_node(&testnet, &dir, "a.key");
        let directory = NameDirectory::new(node.clone());
        let cancel = CancelToken::new();

        let error = directory
            .publish_batch(
                [
                    Record::new("alice.fn", "10.0.0.5"),
                    Record::new("", "10.0.0.6"),
                    Record::new("carol.fn", "10.0.0.7"),
                ],
                &cancel,
            )
            .unwrap_err();

        assert_eq!(
            error,
            BatchError {
                applied: 1,
                name: String::new(),
                source: PublishError::Validation(Rejected::InvalidKey),
            }
        );
        assert_eq!(
            directory.resolve("alice.fn", &cancel).unwrap(),
            Some(Bytes::from_static(b"10.0.0.5"))
        );
        assert_eq!(directory.cache().get("carol.fn"), None);

        assert_eq!(
            directory.publish_batch([Record::new("dave.fn", "10.0.0.8")], &cancel),
            Ok(1)
        );

        node.shutdown();
    }

    #[test]
    fn concurrent_resolves() {
        let testnet = Testnet::new();
        let dir = TempDir::new().unwrap();
        let node = start_node(&testnet, &dir, "a.key");
        let directory = NameDirectory::new(node.clone());
        let cancel = CancelToken::new();

        store_of(&testnet, &node)
            .put(b"/fn/alice.fn", Bytes::from_static(b"10.0.0.5"), &cancel)
            .unwrap();

        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    assert_eq!(
                        directory.resolve("alice.fn", &cancel).unwrap(),
                        Some(Bytes::from_static(b"10.0.0.5"))
                    );
                });
            }
        });

        let gets = store_of(&testnet, &node).get_calls();
        assert!((1..=8).contains(&gets));

        node.shutdown();
    }

    #[test]
    fn store_keys() {
        assert_eq!(store_key("fn", "alice.fn"), "/fn/alice.fn");
    }
}
