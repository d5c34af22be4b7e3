use crate::types::{PackageId, PackageName};
use crate::SchemaError;
use std::collections::BTreeSet;
use std::path::Path;

/// One line of a package list: a whole package or a single release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterEntry {
    /// `author/name`: every version is accepted.
    Package(PackageName),
    /// `author/name@version`: only this release is accepted.
    Release(PackageId),
}

impl FilterEntry {
    pub fn parse(input: &str) -> Result<Self, SchemaError> {
        let input = input.trim();
        if input.contains('@') {
            Ok(Self::Release(input.parse()?))
        } else {
            Ok(Self::Package(PackageName::parse(input)?))
        }
    }
}

/// Operator-supplied allowlist restricting which discovered releases are fetched.
///
/// The file format is a JSON array of strings, e.g.
/// `["elm/core", "elm/json@1.1.3"]`. No filter at all means "accept everything";
/// that case is modelled as `Option<SelectionFilter>::None` by callers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionFilter {
    packages: BTreeSet<PackageName>,
    releases: BTreeSet<PackageId>,
}

impl SelectionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<I, S>(entries: I) -> Result<Self, SchemaError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut filter = Self::new();
        for entry in entries {
            filter.insert(FilterEntry::parse(entry.as_ref())?);
        }
        Ok(filter)
    }

    pub fn from_json(data: &[u8]) -> Result<Self, SchemaError> {
        let entries: Vec<String> = serde_json::from_slice(data)?;
        Self::from_entries(entries)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let data = std::fs::read(path)?;
        Self::from_json(&data)
    }

    pub fn insert(&mut self, entry: FilterEntry) {
        match entry {
            FilterEntry::Package(name) => {
                self.packages.insert(name);
            }
            FilterEntry::Release(id) => {
                self.releases.insert(id);
            }
        }
    }

    pub fn accepts(&self, id: &PackageId) -> bool {
        self.releases.contains(id) || self.packages.contains(&id.package_name())
    }

    pub fn len(&self) -> usize {
        self.packages.len() + self.releases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `None` accepts everything.
pub fn accepts(filter: Option<&SelectionFilter>, id: &PackageId) -> bool {
    filter.is_none_or(|f| f.accepts(id))
}
