//! Package identifiers and newtype wrappers for string values.
//!
//! All types serialize/deserialize as plain strings so the on-disk and
//! upstream JSON documents stay in the registry's native text form.

use crate::SchemaError;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Return the inner string as a slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }
    };
}

string_newtype!(
    /// Lowercase hex SHA-1 digest of a package archive, as published upstream.
    ContentHash
);

string_newtype!(
    /// A package name without a version, `author/name`.
    PackageName
);

impl ContentHash {
    /// Wrap a digest string, normalizing it to lowercase.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into().to_ascii_lowercase())
    }
}

impl PackageName {
    /// Parse `author/name`, rejecting anything that is not two safe path segments.
    pub fn parse(input: &str) -> Result<Self, SchemaError> {
        let (author, name) = input
            .split_once('/')
            .ok_or_else(|| SchemaError::InvalidName(input.to_owned()))?;
        if !valid_segment(author) || !valid_segment(name) {
            return Err(SchemaError::InvalidName(input.to_owned()));
        }
        Ok(Self(input.to_owned()))
    }
}

/// Segments end up as directory names under `packages/`, so they must be a
/// single non-hidden path component.
fn valid_segment(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 128
        && !s.starts_with('.')
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

/// A package release, `author/name@version`.
///
/// Ordering is author, then name, then semantic-version order, so
/// `a/x@1.10.0` sorts after `a/x@1.9.0`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageId {
    author: String,
    name: String,
    version: Version,
}

impl PackageId {
    pub fn new(author: &str, name: &str, version: Version) -> Result<Self, SchemaError> {
        if !valid_segment(author) || !valid_segment(name) {
            return Err(SchemaError::InvalidName(format!("{author}/{name}")));
        }
        Ok(Self {
            author: author.to_owned(),
            name: name.to_owned(),
            version,
        })
    }

    /// Build an identifier from a package name and a version string, as found
    /// in the upstream `all-packages` index.
    pub fn from_parts(package: &str, version: &str) -> Result<Self, SchemaError> {
        let name = PackageName::parse(package)?;
        let (author, name) = name
            .split_once('/')
            .ok_or_else(|| SchemaError::InvalidName(package.to_owned()))?;
        let version = Version::parse(version).map_err(|source| SchemaError::InvalidVersion {
            input: format!("{package}@{version}"),
            version: version.to_owned(),
            source,
        })?;
        Self::new(author, name, version)
    }

    #[inline]
    pub fn author(&self) -> &str {
        &self.author
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn package_name(&self) -> PackageName {
        PackageName(format!("{}/{}", self.author, self.name))
    }
}

impl FromStr for PackageId {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (package, version) = s
            .split_once('@')
            .ok_or_else(|| SchemaError::InvalidId(s.to_owned()))?;
        if !package.contains('/') {
            return Err(SchemaError::InvalidId(s.to_owned()));
        }
        Self::from_parts(package, version)
    }
}

impl TryFrom<String> for PackageId {
    type Error = SchemaError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PackageId> for String {
    fn from(id: PackageId) -> Self {
        id.to_string()
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.author, self.name, self.version)
    }
}
