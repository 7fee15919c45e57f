//! Profiling targets

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Label carrying the pid a discovery target applies to
pub const LABEL_PID: &str = "__process_pid__";
/// Label carrying the container id a discovery target applies to
pub const LABEL_CONTAINER_ID: &str = "__container_id__";
pub const LABEL_SERVICE_NAME: &str = "service_name";
/// Service name used when a target does not provide one
pub const UNSPECIFIED_SERVICE: &str = "unspecified";

/// Label set describing one workload, as supplied by service discovery
pub type DiscoveryTarget = BTreeMap<String, String>;

/// Identity of a monitored workload
///
/// Reserved labels (prefixed with `__`) select processes and are not part of
/// the target's identity. Two targets with the same public labels are equal.
#[derive(Debug, Clone, Serialize)]
pub struct Target {
    id: String,
    labels: BTreeMap<String, String>,
}

impl Target {
    #[must_use]
    pub fn new(discovery: &DiscoveryTarget) -> Self {
        let mut labels: BTreeMap<String, String> = discovery
            .iter()
            .filter(|(name, _)| !name.starts_with("__"))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        labels
            .entry(LABEL_SERVICE_NAME.to_string())
            .or_insert_with(|| UNSPECIFIED_SERVICE.to_string());

        let id = render(&labels);
        Self { id, labels }
    }

    /// Stable identifier derived from the public labels
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        self.labels.get(LABEL_SERVICE_NAME).map_or(UNSPECIFIED_SERVICE, String::as_str)
    }
}

fn render(labels: &BTreeMap<String, String>) -> String {
    let body: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v:?}")).collect();
    format!("{{{}}}", body.join(", "))
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Target {}

impl Hash for Target {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}
