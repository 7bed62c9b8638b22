// Configuration management with layered configuration (file, env)

use crate::connection::{BuilderConfig, ReclaimerConfig, RegistryConfig};
use crate::models::{ConnectionProfile, Topology};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub registry: RegistrySettings,
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    /// Profiles seeding the in-memory profile provider
    #[serde(default)]
    pub profiles: Vec<ConnectionProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub idle_threshold_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub liveness_probe_timeout_ms: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            idle_threshold_seconds: 3600,
            sweep_interval_seconds: 60,
            liveness_probe_timeout_ms: 1000,
        }
    }
}

impl RegistrySettings {
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            liveness_probe_timeout: Duration::from_millis(self.liveness_probe_timeout_ms),
        }
    }

    pub fn reclaimer_config(&self) -> ReclaimerConfig {
        ReclaimerConfig {
            sweep_interval: Duration::from_secs(self.sweep_interval_seconds),
            idle_threshold: Duration::from_secs(self.idle_threshold_seconds),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub default_connect_timeout_ms: u64,
    pub client_name_prefix: String,
    /// Connect every configured profile at startup
    pub warm_up: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            default_connect_timeout_ms: 30_000,
            client_name_prefix: "redis-conn".to_string(),
            warm_up: false,
        }
    }
}

impl ConnectionSettings {
    pub fn builder_config(&self) -> BuilderConfig {
        BuilderConfig {
            default_connect_timeout: Duration::from_millis(self.default_connect_timeout_ms),
            client_name_prefix: self.client_name_prefix.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: Option<u16>,
    pub tracing_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_port: None,
            tracing_endpoint: None,
        }
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Local overrides, not committed
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.registry.idle_threshold_seconds == 0 {
            return Err("Registry idle_threshold_seconds must be greater than 0".to_string());
        }
        if self.registry.sweep_interval_seconds == 0 {
            return Err("Registry sweep_interval_seconds must be greater than 0".to_string());
        }
        if self.registry.liveness_probe_timeout_ms == 0 {
            return Err("Registry liveness_probe_timeout_ms must be greater than 0".to_string());
        }

        if self.connection.default_connect_timeout_ms == 0 {
            return Err("Connection default_connect_timeout_ms must be greater than 0".to_string());
        }
        if self.observability.metrics_port == Some(0) {
            return Err("Metrics port must be greater than 0".to_string());
        }

        let mut seen = HashSet::new();
        for profile in &self.profiles {
            if profile.id.trim().is_empty() {
                return Err("Profile id cannot be empty".to_string());
            }
            if !seen.insert(profile.id.as_str()) {
                return Err(format!("Duplicate profile id '{}'", profile.id));
            }
            if profile.host.trim().is_empty() {
                return Err(format!("Profile '{}' host cannot be empty", profile.id));
            }
            if profile.port == 0 {
                return Err(format!("Profile '{}' port must be greater than 0", profile.id));
            }
            if let Some(node) = profile
                .nodes
                .iter()
                .find(|node| node.host.trim().is_empty() || node.port == 0)
            {
                return Err(format!(
                    "Profile '{}' has an invalid node '{}'",
                    profile.id, node
                ));
            }
            if profile.topology == Topology::Sentinel
                && profile
                    .sentinel_master
                    .as_ref()
                    .map_or(true, |master| master.name.trim().is_empty())
            {
                return Err(format!(
                    "Profile '{}' uses sentinel but has no sentinel master name",
                    profile.id
                ));
            }
            if let Some(ssh) = profile.ssh.as_ref() {
                if ssh.host.trim().is_empty() || ssh.port == 0 {
                    return Err(format!("Profile '{}' has an invalid SSH endpoint", profile.id));
                }
                if ssh.username.trim().is_empty() {
                    return Err(format!("Profile '{}' SSH username cannot be empty", profile.id));
                }
                if matches!(profile.topology, Topology::Cluster | Topology::Sentinel) {
                    return Err(format!(
                        "Profile '{}' cannot use SSH with a {} topology",
                        profile.id, profile.topology
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SshSettings;
    use std::fs;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.registry.idle_threshold_seconds, 3600);
        assert_eq!(settings.registry.sweep_interval_seconds, 60);
        assert_eq!(settings.connection.default_connect_timeout_ms, 30_000);
    }

    #[test]
    fn test_validation_catches_zero_intervals() {
        let mut settings = Settings::default();
        settings.registry.sweep_interval_seconds = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.connection.default_connect_timeout_ms = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_duplicate_profiles() {
        let mut settings = Settings::default();
        settings.profiles = vec![
            ConnectionProfile::new("db-1", "localhost", 6379),
            ConnectionProfile::new("db-1", "localhost", 6380),
        ];
        let err = settings.validate().unwrap_err();
        assert!(err.contains("Duplicate"));
    }

    #[test]
    fn test_validation_catches_bad_endpoints() {
        let mut settings = Settings::default();
        settings.profiles = vec![ConnectionProfile::new("db-1", "", 6379)];
        assert!(settings.validate().is_err());

        settings.profiles = vec![ConnectionProfile::new("db-1", "localhost", 0)];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_sentinel_without_master() {
        let mut profile = ConnectionProfile::new("db-1", "localhost", 26379);
        profile.topology = Topology::Sentinel;

        let mut settings = Settings::default();
        settings.profiles = vec![profile];
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_bad_ssh() {
        let ssh = SshSettings {
            host: "bastion".to_string(),
            port: 22,
            username: "tunnel".to_string(),
            password: Some("secret".to_string()),
            private_key: None,
            passphrase: None,
        };
        let mut profile = ConnectionProfile::new("db-1", "10.0.0.5", 6379);
        profile.ssh = Some(ssh.clone());

        let mut settings = Settings::default();
        settings.profiles = vec![profile.clone()];
        assert!(settings.validate().is_ok());

        settings.profiles[0].ssh = Some(SshSettings {
            username: " ".to_string(),
            ..ssh.clone()
        });
        assert!(settings.validate().unwrap_err().contains("SSH username"));

        settings.profiles[0].ssh = Some(SshSettings { port: 0, ..ssh });
        assert!(settings.validate().unwrap_err().contains("SSH endpoint"));

        profile.topology = Topology::Cluster;
        settings.profiles = vec![profile];
        assert!(settings.validate().unwrap_err().contains("cannot use SSH"));
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("default.toml"),
            r#"
[registry]
idle_threshold_seconds = 120

[connection]
client_name_prefix = "ops"

[[profiles]]
id = "cache"
host = "10.0.0.5"
port = 6379
topology = "standalone"
"#,
        )
        .unwrap();

        let settings = Settings::load_from_path(dir.path()).unwrap();
        assert_eq!(settings.registry.idle_threshold_seconds, 120);
        assert_eq!(settings.registry.sweep_interval_seconds, 60);
        assert_eq!(settings.connection.client_name_prefix, "ops");
        assert_eq!(settings.profiles.len(), 1);
        assert_eq!(settings.profiles[0].topology, Topology::Standalone);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_conversions() {
        let settings = Settings::default();
        assert_eq!(
            settings.registry.reclaimer_config().idle_threshold,
            Duration::from_secs(3600)
        );
        assert_eq!(
            settings.registry.registry_config().liveness_probe_timeout,
            Duration::from_millis(1000)
        );
        assert_eq!(
            settings.connection.builder_config().default_connect_timeout,
            Duration::from_secs(30)
        );
    }
}
