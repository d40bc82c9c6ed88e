use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::Arch;

/// An immutable base image. Presence on a host is a boolean predicate; the
/// control plane never downloads images itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Image {
    /// Human-readable id used in create requests, e.g. `ubuntu-20.04`.
    pub id: String,
    pub name: String,
    pub arch: Arch,
    pub sha256: String,
    /// Host id -> local path of the image file.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub paths: BTreeMap<String, String>,
}

impl Image {
    pub fn path_on(&self, host: &str) -> Option<&str> {
        self.paths.get(host).map(String::as_str)
    }
}
