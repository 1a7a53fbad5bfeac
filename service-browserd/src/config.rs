use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::LOCAL_DOMAIN;
use shared::types::{normalize_domain, ServiceInstance};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub register: Vec<RegisterConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrowserConfig {
    /// Pin mDNS traffic to one interface
    pub interface: Option<String>,
    #[serde(default = "default_domain")]
    pub domain: String,
    /// Reg types kept under a standing subscription, e.g. "_http._tcp"
    ///
    /// A watch whose browse fails keeps reporting the failure until the
    /// daemon is restarted; it is not resubscribed.
    #[serde(default)]
    pub watch: Vec<String>,
    #[serde(default = "default_lookup_settle")]
    pub lookup_settle_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// A service advertised at startup
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterConfig {
    pub name: String,
    pub reg_type: String,
    pub port: u16,
    #[serde(default)]
    pub txt: HashMap<String, String>,
}

fn default_domain() -> String {
    LOCAL_DOMAIN.to_string()
}

fn default_lookup_settle() -> u64 {
    1500
}

fn default_listen() -> String {
    "[::]:8053".to_string()
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            interface: None,
            domain: default_domain(),
            watch: Vec::new(),
            lookup_settle_ms: default_lookup_settle(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl BrowserConfig {
    pub fn lookup_settle(&self) -> Duration {
        Duration::from_millis(self.lookup_settle_ms)
    }
}

impl RegisterConfig {
    pub fn to_instance(&self, domain: &str) -> ServiceInstance {
        let reg_type = format!("{}.", self.reg_type.trim_end_matches('.'));
        let mut instance = ServiceInstance::new(&self.name, reg_type, normalize_domain(domain));
        instance.port = self.port;
        instance.txt = self.txt.clone();
        instance
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(contents)?;
        config.browser.domain = normalize_domain(&config.browser.domain);
        Ok(config)
    }
}
