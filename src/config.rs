//! Manager configuration.
//!
//! A [`ManagerConfig`] can be built in code or loaded from YAML:
//!
//! ```yaml
//! scheme: edef8ba9-79d6-4ace-a3c8-27dcd51d21ed
//! origin: https://media.example
//! security_level: L3
//! server_certificate: CAUSxwUKwQIIAxIQ...
//! provision_unprovisioned_origins: true
//! ```
use std::fmt;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Deserializer};
use uuid::Uuid;

use crate::cdm::WIDEVINE_UUID;
use crate::error::{Error, Result};

/// Engine security level requested at open.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "String")]
pub enum SecurityLevel {
    L1,
    L3,
    /// Any other engine-specific level, passed through verbatim.
    Other(String),
}

impl SecurityLevel {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            SecurityLevel::L1 => "L1",
            SecurityLevel::L3 => "L3",
            SecurityLevel::Other(level) => level,
        }
    }
}

impl From<String> for SecurityLevel {
    fn from(value: String) -> Self {
        match value.as_str() {
            "L1" | "l1" => SecurityLevel::L1,
            "L3" | "l3" => SecurityLevel::L3,
            _ => SecurityLevel::Other(value),
        }
    }
}

impl From<&str> for SecurityLevel {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_scheme() -> Uuid {
    WIDEVINE_UUID
}

fn default_true() -> bool {
    true
}

fn deserialize_certificate<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<u8>>, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded: Option<String> = Option::deserialize(deserializer)?;
    encoded
        .map(|value| {
            BASE64_STANDARD
                .decode(value.trim())
                .map_err(serde::de::Error::custom)
        })
        .transpose()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ManagerConfig {
    /// Crypto scheme the engine must support.
    #[serde(default = "default_scheme")]
    pub scheme: Uuid,
    /// Security origin namespacing engine and store state. Empty means none.
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub security_level: Option<SecurityLevel>,
    /// Service certificate (base64 in YAML).
    #[serde(default, deserialize_with = "deserialize_certificate")]
    pub server_certificate: Option<Vec<u8>>,
    /// Start provisioning at open when the store says the origin was never
    /// provisioned.
    #[serde(default = "default_true")]
    pub provision_unprovisioned_origins: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            scheme: WIDEVINE_UUID,
            origin: String::new(),
            security_level: None,
            server_certificate: None,
            provision_unprovisioned_origins: true,
        }
    }
}

impl ManagerConfig {
    #[must_use]
    pub fn new(scheme: Uuid) -> Self {
        Self {
            scheme,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    #[must_use]
    pub fn with_security_level(mut self, level: impl Into<SecurityLevel>) -> Self {
        self.security_level = Some(level.into());
        self
    }

    #[must_use]
    pub fn with_server_certificate(mut self, certificate: impl Into<Vec<u8>>) -> Self {
        self.server_certificate = Some(certificate.into());
        self
    }

    #[must_use]
    pub fn with_provision_unprovisioned_origins(mut self, enabled: bool) -> Self {
        self.provision_unprovisioned_origins = enabled;
        self
    }

    #[must_use]
    pub fn is_widevine(&self) -> bool {
        self.scheme == WIDEVINE_UUID
    }

    #[must_use]
    pub fn has_origin(&self) -> bool {
        !self.origin.is_empty()
    }

    /// Reject settings that can never work.
    pub fn validate(&self) -> Result<()> {
        if self.scheme.is_nil() {
            return Err(Error::InvalidConfig("scheme must not be nil".to_string()));
        }
        if self.origin.trim() != self.origin {
            return Err(Error::InvalidConfig(format!(
                "origin '{}' has surrounding whitespace",
                self.origin
            )));
        }
        if let Some(SecurityLevel::Other(level)) = &self.security_level {
            if level.is_empty() {
                return Err(Error::InvalidConfig(
                    "security_level must not be empty".to_string(),
                ));
            }
        }
        if self.server_certificate.as_ref().is_some_and(Vec::is_empty) {
            return Err(Error::InvalidConfig(
                "server_certificate must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }
}
