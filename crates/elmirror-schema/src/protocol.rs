//! JSON documents of the upstream registry protocol.

use crate::types::{ContentHash, PackageId};
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// The unordered full index: package name → every published version.
pub type AllPackages = BTreeMap<String, Vec<String>>;

/// `endpoint.json`: where the archive of a release lives and its SHA-1.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub hash: ContentHash,
}

/// `hash.json` as kept next to a mirrored archive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HashDocument {
    pub hash: ContentHash,
}

/// Flatten the full index into distinct identifiers, sorted.
pub fn flatten_index(index: &AllPackages) -> Result<Vec<PackageId>, SchemaError> {
    let mut ids = BTreeSet::new();
    for (package, versions) in index {
        for version in versions {
            ids.insert(PackageId::from_parts(package, version)?);
        }
    }
    Ok(ids.into_iter().collect())
}
