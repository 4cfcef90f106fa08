//! Package - the resolved installation target handed in by the driver

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PackageError {
    #[error("Package name cannot be empty")]
    EmptyName,

    #[error("Package version cannot be empty")]
    EmptyVersion,

    #[error("Install prefix must be absolute: {0}")]
    RelativePrefix(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub version: String,
    pub prefix: PathBuf,
}

impl Package {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        prefix: impl Into<PathBuf>,
    ) -> Result<Self, PackageError> {
        let package = Self {
            name: name.into(),
            version: version.into(),
            prefix: prefix.into(),
        };
        package.check()?;
        Ok(package)
    }

    /// Re-check invariants, e.g. after deserializing from a payload.
    pub fn check(&self) -> Result<(), PackageError> {
        if self.name.trim().is_empty() {
            return Err(PackageError::EmptyName);
        }
        if self.version.trim().is_empty() {
            return Err(PackageError::EmptyVersion);
        }
        if !self.prefix.is_absolute() {
            return Err(PackageError::RelativePrefix(self.prefix.clone()));
        }
        Ok(())
    }

    /// `{prefix}/source`, the checkout workspace.
    pub fn source_dir(&self) -> PathBuf {
        self.prefix.join("source")
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_prefix_rejected() {
        let err = Package::new("interval_check", "dev", "sw/x").unwrap_err();
        assert_eq!(err, PackageError::RelativePrefix(PathBuf::from("sw/x")));
    }

    #[test]
    fn test_empty_fields_rejected() {
        assert_eq!(Package::new("", "dev", "/sw").unwrap_err(), PackageError::EmptyName);
        assert_eq!(Package::new("ic", " ", "/sw").unwrap_err(), PackageError::EmptyVersion);
    }

    #[test]
    fn test_source_dir() {
        let pkg = Package::new("interval_check", "dev", "/sw/x/interval_check/dev").unwrap();
        assert_eq!(pkg.source_dir(), PathBuf::from("/sw/x/interval_check/dev/source"));
    }
}
