//! Instance configuration

use crate::{GlideError, Result};
use serde::{Deserialize, Serialize};

/// Sentinel instance name that selects the scripted in-process transport
/// when no credentials are configured.
pub const DEV_INSTANCE: &str = "dev";

fn default_read_concurrency() -> usize {
    40
}

fn default_write_concurrency() -> usize {
    80
}

/// Connection configuration for one remote instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Tenant subdomain, e.g. "acme" for acme.service-now.com.
    pub instance: String,
    #[serde(default)]
    pub username: Option<String>,
    /// Password for HTTP Basic auth (should be encrypted in storage).
    #[serde(default)]
    pub password: Option<String>,
    /// Blocks every write-direction request.
    #[serde(default)]
    pub read_only: bool,
    /// Enables request-level tracing.
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_read_concurrency")]
    pub read_concurrency: usize,
    #[serde(default = "default_write_concurrency")]
    pub write_concurrency: usize,
}

impl InstanceConfig {
    /// Create a configuration with default concurrency limits.
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            username: None,
            password: None,
            read_only: false,
            debug: false,
            read_concurrency: default_read_concurrency(),
            write_concurrency: default_write_concurrency(),
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_read_concurrency(mut self, limit: usize) -> Self {
        self.read_concurrency = limit;
        self
    }

    pub fn with_write_concurrency(mut self, limit: usize) -> Self {
        self.write_concurrency = limit;
        self
    }

    /// Fake mode: the dev sentinel instance with no credentials runs
    /// against the scripted transport instead of the network.
    pub fn is_fake(&self) -> bool {
        self.instance == DEV_INSTANCE && self.username.is_none() && self.password.is_none()
    }

    /// Check the configuration is complete enough to build a client.
    pub fn validate(&self) -> Result<()> {
        if self.instance.is_empty() {
            return Err(GlideError::Configuration("instance is required".into()));
        }
        if !self.is_fake() && (self.username.is_none() || self.password.is_none()) {
            return Err(GlideError::Configuration(format!(
                "credentials are required for instance {}",
                self.instance
            )));
        }
        if self.read_concurrency == 0 || self.write_concurrency == 0 {
            return Err(GlideError::Configuration(
                "concurrency limits must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_requires_credentials() {
        let config = InstanceConfig::new("acme");
        assert!(config.validate().is_err());

        let config = InstanceConfig::new("acme").with_credentials("admin", "secret");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fake_mode() {
        assert!(InstanceConfig::new(DEV_INSTANCE).is_fake());
        assert!(InstanceConfig::new(DEV_INSTANCE).validate().is_ok());
        assert!(
            !InstanceConfig::new(DEV_INSTANCE)
                .with_credentials("admin", "secret")
                .is_fake()
        );
        assert!(!InstanceConfig::new("acme").is_fake());
    }

    #[test]
    fn test_defaults() {
        let config = InstanceConfig::new("acme");
        assert_eq!(config.read_concurrency, 40);
        assert_eq!(config.write_concurrency, 80);
        assert!(!config.read_only);
    }
}
