//! Admission rules for records written into the shared namespace.

use std::{collections::HashMap, fmt::Debug, sync::Arc};

use bytes::Bytes;

/// The namespace tag reserved for name records.
pub const NAMESPACE: &str = "fn";

/// Decides whether a record may be admitted into the distributed store and
/// which of several conflicting values for the same key wins.
pub trait Validator: Debug + Send + Sync {
    /// Returns `Ok(())` if the record is admissible.
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<(), Rejected>;

    /// Index of the winning value among `values`.
    ///
    /// Callers never pass an empty list.
    fn select(&self, key: &[u8], values: &[Bytes]) -> usize;
}

/// Split a `/<namespace>/<local name>` key into its two parts.
pub fn split_key(key: &[u8]) -> Result<(&[u8], &[u8]), Rejected> {
    let rest = key.strip_prefix(b"/").ok_or(Rejected::MalformedKey)?;

    match rest.iter().position(|byte| *byte == b'/') {
        Some(i) if i > 0 => Ok((&rest[..i], &rest[i + 1..])),
        _ => Err(Rejected::MalformedKey),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Validator for name records.
pub struct NameValidator {
    namespace: String,
}

impl NameValidator {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl Default for NameValidator {
    fn default() -> Self {
        Self::new(NAMESPACE)
    }
}

impl Validator for NameValidator {
    /// The value is not inspected: any byte string is accepted as an address.
    fn validate(&self, key: &[u8], _value: &[u8]) -> Result<(), Rejected> {
        let (namespace, name) = split_key(key)?;

        if namespace != self.namespace.as_bytes() {
            return Err(Rejected::WrongNamespace(
                String::from_utf8_lossy(namespace).into_owned(),
            ));
        }

        match std::str::from_utf8(name) {
            Ok(name) if !name.is_empty() => Ok(()),
            _ => Err(Rejected::InvalidKey),
        }
    }

    /// First value wins, there is no recency or quorum logic.
    fn select(&self, _key: &[u8], _values: &[Bytes]) -> usize {
        0
    }
}

/// Dispatches to a [Validator] per key namespace, rejecting namespaces
/// nobody registered.
#[derive(Debug, Clone, Default)]
pub struct NamespacedValidator {
    validators: HashMap<String, Arc<dyn Validator>>,
}

impl NamespacedValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, namespace: impl Into<String>, validator: Arc<dyn Validator>) -> Self {
        self.validators.insert(namespace.into(), validator);
        self
    }

    fn validator_for(&self, key: &[u8]) -> Result<&Arc<dyn Validator>, Rejected> {
        let (namespace, _) = split_key(key)?;
        let namespace = String::from_utf8_lossy(namespace);

        self.validators
            .get(namespace.as_ref())
            .ok_or_else(|| Rejected::WrongNamespace(namespace.into_owned()))
    }
}

impl Validator for NamespacedValidator {
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<(), Rejected> {
        self.validator_for(key)?.validate(key, value)
    }

    fn select(&self, key: &[u8], values: &[Bytes]) -> usize {
        self.validator_for(key)
            .map(|validator| validator.select(key, values))
            .unwrap_or(0)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Reasons a record is refused admission.
pub enum Rejected {
    #[error("Key is not of the form /<namespace>/<name>")]
    MalformedKey,

    #[error("Record namespace {0:?} is not accepted")]
    WrongNamespace(String),

    #[error("Record name is empty or not valid UTF-8")]
    InvalidKey,
}
