//! Server configuration.
//!
//! Layered loading: hardcoded defaults, then an optional config file, then
//! `FERRODIR_`-prefixed environment variables. Example override:
//! `FERRODIR_LIMITS__SIZELIMIT=5000`.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::dn;

/// Root configuration for the directory core.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub limits: LimitsSection,

    #[serde(default)]
    pub dse: DseSection,

    #[serde(default)]
    pub password: PasswordSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Administrative identity that bypasses access control. Stored
    /// normalized once the configuration validates.
    pub rootdn: String,
    /// Whether the whole server refuses write operations.
    pub readonly: bool,
    /// Interval of the housekeeping tick that refreshes sampled time.
    pub housekeeping_interval_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            rootdn: "cn=directory manager".into(),
            readonly: false,
            housekeeping_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsSection {
    /// Maximum entries returned from one search.
    pub sizelimit: i64,
    /// Maximum seconds one search may run.
    pub timelimit: i64,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            sizelimit: 2000,
            timelimit: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DseSection {
    /// Directory holding `dse.ldif` and its working copies.
    pub config_dir: String,
    /// Whether the file writer emits operational attributes.
    pub write_operational_attrs: bool,
}

impl Default for DseSection {
    fn default() -> Self {
        Self {
            config_dir: "./config".into(),
            write_operational_attrs: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordSection {
    /// Whether passwords expire at all.
    pub exp: bool,
    /// Maximum password age in seconds.
    pub max_age_secs: i64,
    /// How long before expiry warnings start, in seconds.
    pub warning_secs: i64,
    /// Grace logins allowed after expiry.
    pub grace_limit: u32,
    /// Whether failed binds lock accounts.
    pub lockout: bool,
    /// Failed binds tolerated before lockout.
    pub retry_limit: u32,
}

impl Default for PasswordSection {
    fn default() -> Self {
        Self {
            exp: false,
            max_age_secs: 8_640_000,
            warning_secs: 86_400,
            grace_limit: 0,
            lockout: false,
            retry_limit: 3,
        }
    }
}

impl ServerConfig {
    /// Loads configuration with precedence: environment variables, then the
    /// file named by `FERRODIR_CONFIG` (if any), then `./config/ferrodir`,
    /// then the built-in defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        builder = Self::set_defaults(builder)?;

        if let Ok(path) = std::env::var("FERRODIR_CONFIG") {
            builder = builder.add_source(File::with_name(&path).required(false));
        }
        builder = builder.add_source(File::with_name("./config/ferrodir").required(false));
        builder = builder.add_source(
            Environment::with_prefix("FERRODIR")
                .separator("__")
                .try_parsing(true),
        );

        let config: ServerConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn set_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        builder
            .set_default("server.rootdn", "cn=directory manager")?
            .set_default("server.readonly", false)?
            .set_default("server.housekeeping_interval_secs", 30_i64)?
            .set_default("limits.sizelimit", 2000_i64)?
            .set_default("limits.timelimit", 3600_i64)?
            .set_default("dse.config_dir", "./config")?
            .set_default("dse.write_operational_attrs", true)?
            .set_default("password.exp", false)?
            .set_default("password.max_age_secs", 8_640_000_i64)?
            .set_default("password.warning_secs", 86_400_i64)?
            .set_default("password.grace_limit", 0_i64)?
            .set_default("password.lockout", false)?
            .set_default("password.retry_limit", 3_i64)
    }

    /// Validates field values and normalizes the rootdn.
    pub fn validate(&self) -> Result<(), ConfigError> {
        dn::normalize(&self.server.rootdn)
            .map_err(|e| ConfigError::Message(format!("server.rootdn: {e}")))?;
        if self.limits.sizelimit < 0 || self.limits.timelimit < 0 {
            return Err(ConfigError::Message(
                "limits must not be negative".into(),
            ));
        }
        Ok(())
    }

    /// The normalized rootdn used for identity comparison.
    #[must_use]
    pub fn rootdn_ndn(&self) -> String {
        dn::normalize(&self.server.rootdn).unwrap_or_default()
    }

    /// Byte-equality rootdn test against a normalized DN.
    #[must_use]
    pub fn is_rootdn(&self, ndn: &str) -> bool {
        !ndn.is_empty() && self.rootdn_ndn() == ndn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = ServerConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.rootdn_ndn(), "cn=directory manager");
        assert_eq!(cfg.limits.sizelimit, 2000);
    }

    #[test]
    fn rootdn_identity_is_normalized_byte_equality() {
        let mut cfg = ServerConfig::default();
        cfg.server.rootdn = "CN=Directory Manager".into();
        assert!(cfg.is_rootdn("cn=directory manager"));
        assert!(!cfg.is_rootdn("cn=somebody else"));
        assert!(!cfg.is_rootdn(""));
    }

    #[test]
    fn bad_rootdn_fails_validation() {
        let mut cfg = ServerConfig::default();
        cfg.server.rootdn = "not a dn".into();
        assert!(cfg.validate().is_err());
    }
}
