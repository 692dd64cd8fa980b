//! Transport agnostic request handlers for an HTTP façade.
//!
//! Each handler maps one endpoint (`/add`, `/lookup`, `/peers`, `/info`) to
//! an [ApiResponse]; the HTTP server in front of them only moves bytes.

use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::{
    cancel::CancelToken,
    common::Multiaddr,
    directory::{BatchError, NameDirectory, PublishError, Record},
    network::PeerId,
    node::Node,
};

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_TEXT: &str = "text/plain; charset=utf-8";

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_NOT_FOUND: u16 = 404;
pub const STATUS_METHOD_NOT_ALLOWED: u16 = 405;
pub const STATUS_INTERNAL_SERVER_ERROR: u16 = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Status, content type and body of a handler's answer.
pub struct ApiResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl ApiResponse {
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: CONTENT_TYPE_TEXT,
            body: body.into(),
        }
    }

    pub fn json<T: Serialize>(value: &T) -> Self {
        match serde_json::to_string(value) {
            Ok(body) => Self {
                status: STATUS_OK,
                content_type: CONTENT_TYPE_JSON,
                body,
            },
            Err(error) => Self::text(
                STATUS_INTERNAL_SERVER_ERROR,
                format!("Failed to encode response: {error}"),
            ),
        }
    }

    fn not_initialized() -> Self {
        Self::text(STATUS_INTERNAL_SERVER_ERROR, "DHT not initialized")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// Body of `/peers`.
pub struct PeersResponse {
    /// Routing table peers.
    pub peers: Vec<PeerId>,
    /// Connected hosts.
    pub hosts: Vec<PeerId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
/// Body of `/info`.
pub struct InfoResponse {
    pub mode: String,
    #[serde(rename = "peerID")]
    pub peer_id: String,
    pub listen_addresses: Vec<Multiaddr>,
    pub peers: Vec<PeerId>,
    pub hosts_connected: usize,
    pub network_size: usize,
    pub protocols: Vec<String>,
}

/// The request handlers, sharing one [NameDirectory].
#[derive(Debug)]
pub struct Api {
    directory: NameDirectory,
}

impl Api {
    pub fn new(node: Node) -> Self {
        Self {
            directory: NameDirectory::new(node),
        }
    }

    pub fn directory(&self) -> &NameDirectory {
        &self.directory
    }

    /// `POST /add` with a body of `{"<name>": {"<record type>": "<value>"}}`.
    ///
    /// Only the first record of each name is kept. Names are published in
    /// document order and processing stops at the first failure; names
    /// published before it stay published.
    pub fn add(&self, method: &str, body: &[u8], cancel: &CancelToken) -> ApiResponse {
        if !self.is_initialized() {
            return ApiResponse::not_initialized();
        }

        if !method.eq_ignore_ascii_case("POST") {
            return ApiResponse::text(STATUS_METHOD_NOT_ALLOWED, "Only POST allowed");
        }

        let records = match parse_records(body) {
            Some(records) => records,
            None => return ApiResponse::text(STATUS_BAD_REQUEST, "Invalid request body"),
        };

        match self.directory.publish_batch(records, cancel) {
            Ok(applied) => {
                debug!(applied, "Added records");
                ApiResponse::text(STATUS_OK, "Key/Value added successfully")
            }
            Err(BatchError {
                applied,
                name,
                source,
            }) => {
                let (status, reason) = match source {
                    PublishError::Validation(rejected) => {
                        (STATUS_BAD_REQUEST, format!("Invalid record {name:?}: {rejected}"))
                    }
                    PublishError::Store(error) => (
                        STATUS_INTERNAL_SERVER_ERROR,
                        format!("Failed to store value in DHT: {error}"),
                    ),
                };

                ApiResponse::text(
                    status,
                    format!("{reason} ({applied} records added before the failure)"),
                )
            }
        }
    }

    /// `GET /lookup?key=<name>`, answering `{"<name>": "<value>"}`.
    pub fn lookup(&self, key: Option<&str>, cancel: &CancelToken) -> ApiResponse {
        if !self.is_initialized() {
            return ApiResponse::not_initialized();
        }

        let key = match key {
            Some(key) if !key.is_empty() => key,
            _ => return ApiResponse::text(STATUS_BAD_REQUEST, "Missing key parameter"),
        };

        debug!(?key, "Lookup");

        match self.directory.resolve(key, cancel) {
            Ok(Some(value)) => {
                let mut body = Map::new();
                body.insert(key.to_string(), Value::String(value_string(&value)));

                ApiResponse::json(&body)
            }
            Ok(None) => ApiResponse::text(STATUS_NOT_FOUND, "Key not found"),
            Err(error) => ApiResponse::text(
                STATUS_INTERNAL_SERVER_ERROR,
                format!("Failed to retrieve value from DHT: {error}"),
            ),
        }
    }

    /// `GET /peers`: routing table peers and connected hosts.
    pub fn peers(&self) -> ApiResponse {
        if !self.is_initialized() {
            return ApiResponse::not_initialized();
        }

        let node = self.directory.node();

        ApiResponse::json(&PeersResponse {
            peers: node.routing_peers(),
            hosts: node.connected_peers(),
        })
    }

    /// `GET /info`: a summary of the node and what it knows of the network.
    pub fn info(&self) -> ApiResponse {
        if !self.is_initialized() {
            return ApiResponse::not_initialized();
        }

        let node = self.directory.node();

        let network_size = node.network_size().unwrap_or_else(|error| {
            debug!(?error, "Network size estimate unavailable");
            0
        });

        ApiResponse::json(&InfoResponse {
            mode: node.mode().map(|mode| mode.to_string()).unwrap_or_default(),
            peer_id: node.peer_id().map(|id| id.to_string()).unwrap_or_default(),
            listen_addresses: node.listen_addresses(),
            peers: node.routing_table().into_iter().map(|peer| peer.id).collect(),
            hosts_connected: node.connected_peers().len(),
            network_size,
            protocols: node.supported_protocols(),
        })
    }

    fn is_initialized(&self) -> bool {
        self.directory.node().is_initialized()
    }
}

/// The first record of every name, in document order.
///
/// `None` unless the body is an object of objects of strings.
fn parse_records(body: &[u8]) -> Option<Vec<Record>> {
    let names: Map<String, Value> = serde_json::from_slice(body).ok()?;

    let mut records = Vec::with_capacity(names.len());

    for (name, types) in names {
        let types = types.as_object()?;

        let mut values = types.values().map(Value::as_str);
        let first = match values.next() {
            Some(value) => value?,
            None => continue,
        };
        if values.any(|value| value.is_none()) {
            return None;
        }

        records.push(Record::new(name, first.to_string()));
    }

    Some(records)
}

fn value_string(value: &Bytes) -> String {
    String::from_utf8_lossy(value).into_owned()
}
