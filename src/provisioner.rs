//! Values describing the temporary provisioner and the credentials around it.

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Name of a provisioner on the CA.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProvisionerName(String);

impl ProvisionerName {
    pub fn new<S: Into<String>>(name: S) -> Result<Self, ConfigError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ConfigError::invalid("provisioner_name", "must not be empty"));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProvisionerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Admin identity that authorizes add and remove on the CA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCredential {
    pub provisioner: String,
    pub subject: String,
}

impl AdminCredential {
    pub fn new<P: Into<String>, S: Into<String>>(provisioner: P, subject: S) -> Self {
        Self {
            provisioner: provisioner.into(),
            subject: subject.into(),
        }
    }
}

/// Public key plus the still-encrypted private key of the JWK provisioner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub public_key: PathBuf,
    pub private_key: PathBuf,
}

impl KeyMaterial {
    /// Resolve both key paths against `base`. Absolute paths are kept as given.
    pub fn resolve(base: &Path, public_key: &Path, private_key: &Path) -> Self {
        Self {
            public_key: base.join(public_key),
            private_key: base.join(private_key),
        }
    }

    pub fn public_key_present(&self) -> bool {
        self.public_key.is_file()
    }
}

#[derive(Deserialize)]
struct ListedProvisioner {
    name: String,
}

/// Whether a `step ca provisioner list` listing contains `name`.
///
/// The listing is a JSON array of provisioner objects and is matched on the
/// exact `name` field. Output in any other shape falls back to a substring test.
pub fn listing_contains(listing: &str, name: &ProvisionerName) -> bool {
    match serde_json::from_str::<Vec<ListedProvisioner>>(listing) {
        Ok(provisioners) => provisioners.iter().any(|p| p.name == name.as_str()),
        Err(_) => listing.contains(name.as_str()),
    }
}
