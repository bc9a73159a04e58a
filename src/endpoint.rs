use crate::Error;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Immutable descriptive facts about the target endpoint.
///
/// Obtained once through an [`EndpointMetadata`] adapter before any trial
/// runs and treated as read-only for the session. These fields parameterize
/// both the trial fingerprint and the rendered load-test script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// Hardware / instance type the endpoint runs on (e.g. `nvidia-l4`).
    pub hw_type: String,
    /// Cloud vendor hosting the endpoint.
    pub vendor: String,
    /// Serving engine name (e.g. `torch`, `onnx`).
    pub engine: String,
    /// Engine batch size.
    pub batch_size: u32,
    /// Base URL trials are issued against.
    pub base_url: String,
    /// Container image the endpoint runs, if pinned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Source of read-only endpoint snapshots.
///
/// How the snapshot is obtained (remote hosting API, local config file) is
/// up to the implementation; the only contract is that it is stable for the
/// duration of a session.
pub trait EndpointMetadata {
    /// Look up the descriptor for `name`, optionally scoped to a namespace.
    fn describe(&self, name: &str, namespace: Option<&str>) -> Result<EndpointDescriptor, Error>;
}

/// An [`EndpointMetadata`] adapter backed by a preloaded map.
///
/// Useful for config-file-driven sessions and for tests. The namespace is
/// folded into the lookup key as `namespace/name` when given.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata {
    endpoints: HashMap<String, EndpointDescriptor>,
}

impl StaticMetadata {
    /// Create an empty adapter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor under `name`.
    pub fn insert(&mut self, name: impl Into<String>, descriptor: EndpointDescriptor) {
        self.endpoints.insert(name.into(), descriptor);
    }
}

impl EndpointMetadata for StaticMetadata {
    fn describe(&self, name: &str, namespace: Option<&str>) -> Result<EndpointDescriptor, Error> {
        let key = match namespace {
            Some(ns) => format!("{}/{}", ns, name),
            None => name.to_owned(),
        };
        self.endpoints
            .get(&key)
            .cloned()
            .ok_or(Error::UnknownEndpoint(key))
    }
}

#[cfg(test)]
fn descriptor() -> EndpointDescriptor {
    EndpointDescriptor {
        hw_type: "nvidia-l4".to_owned(),
        vendor: "aws".to_owned(),
        engine: "torch".to_owned(),
        batch_size: 32,
        base_url: "https://example.test".to_owned(),
        image: None,
    }
}

#[test]
fn static_lookup() {
    let mut adapter = StaticMetadata::new();
    adapter.insert("encoder-analysis", descriptor());
    let snapshot = adapter.describe("encoder-analysis", None).unwrap();
    assert_eq!(snapshot, descriptor());
}

#[test]
fn namespaced_lookup() {
    let mut adapter = StaticMetadata::new();
    adapter.insert("team/encoder-analysis", descriptor());
    assert!(adapter.describe("encoder-analysis", Some("team")).is_ok());
    let err = adapter.describe("encoder-analysis", None).unwrap_err();
    assert!(matches!(err, Error::UnknownEndpoint(name) if name == "encoder-analysis"));
}
