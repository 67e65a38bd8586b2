//! Master configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// How a test's server is reached from the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingType {
    /// The worker binds a dedicated ephemeral port.
    Port,
    /// Clients share the master's port; a header value routes to the test.
    Header,
}

impl fmt::Display for BindingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingType::Port => f.write_str("port"),
            BindingType::Header => f.write_str("header"),
        }
    }
}

/// Master configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Bind host for the control API and all relayed traffic
    pub host: String,

    /// Bind port
    pub port: u16,

    /// Path prefix for the control endpoints
    pub endpoints_prefix: String,

    /// Binding types clients are allowed to request
    pub allowed_binding_types: Vec<BindingType>,

    /// Header carrying the test id on header-bound connections
    pub binding_header_name: String,

    /// Directory for per-test log files
    pub log_directory: PathBuf,

    /// Maximum number of concurrently active tests
    pub test_concurrency_limit: usize,

    /// Seconds a test may run before its worker is killed
    pub test_duration_timeout: u64,

    /// Worker process configuration
    pub worker: WorkerConfig,

    /// Scenario id -> module the worker loads to declare it
    pub scenarios: HashMap<String, String>,
}

/// Worker process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Path to the worker binary
    pub binary_path: PathBuf,

    /// Extra arguments passed to every worker
    pub args: Vec<String>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            endpoints_prefix: "/stagehand".to_string(),
            allowed_binding_types: vec![BindingType::Port, BindingType::Header],
            binding_header_name: "x-test-id".to_string(),
            log_directory: PathBuf::from("logs"),
            test_concurrency_limit: 8,
            test_duration_timeout: 60,
            worker: WorkerConfig::default(),
            scenarios: HashMap::new(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("stagehand-worker"),
            args: Vec::new(),
        }
    }
}

impl MasterConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.normalize();
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Header names compare case-insensitively on the wire and the prefix
    /// must route as a path segment, so both get one canonical form.
    pub fn normalize(&mut self) {
        if !self.endpoints_prefix.starts_with('/') {
            self.endpoints_prefix.insert(0, '/');
        }
        while self.endpoints_prefix.len() > 1 && self.endpoints_prefix.ends_with('/') {
            self.endpoints_prefix.pop();
        }
        self.binding_header_name = self.binding_header_name.to_ascii_lowercase();
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn allows_binding(&self, binding: BindingType) -> bool {
        self.allowed_binding_types.contains(&binding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_allow_both_bindings() {
        let config = MasterConfig::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.endpoints_prefix, "/stagehand");
        assert_eq!(config.test_concurrency_limit, 8);
        assert_eq!(config.test_duration_timeout, 60);
        assert!(config.allows_binding(BindingType::Port));
        assert!(config.allows_binding(BindingType::Header));
    }

    #[test]
    fn normalize_canonicalizes_prefix_and_header() {
        let mut config = MasterConfig {
            endpoints_prefix: "control/".to_string(),
            binding_header_name: "X-Test-Id".to_string(),
            ..MasterConfig::default()
        };
        config.normalize();
        assert_eq!(config.endpoints_prefix, "/control");
        assert_eq!(config.binding_header_name, "x-test-id");
    }

    #[test]
    fn round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stagehand.toml");

        let mut config = MasterConfig::default();
        config
            .scenarios
            .insert("login:successful".to_string(), "login.scenario".to_string());
        config.save(&path).unwrap();

        let loaded = MasterConfig::load(&path).unwrap();
        assert_eq!(loaded.scenarios["login:successful"], "login.scenario");
        assert_eq!(loaded.allowed_binding_types, config.allowed_binding_types);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let loaded = MasterConfig::load(std::path::Path::new("/nonexistent/stagehand.toml")).unwrap();
        assert_eq!(loaded.host, "127.0.0.1");
    }
}
