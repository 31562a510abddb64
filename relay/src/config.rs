use rly_cdc::{BadRecordPolicy, ConsumerConfig};
use rly_core::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Masters of the local (consumer) cluster
    pub local_master_addrs: Vec<String>,
    pub metrics_addr: SocketAddr,
    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default)]
    pub registry: RegistrySettings,
    #[serde(default)]
    pub consumer: ConsumerSettings,
    #[serde(default)]
    pub leadership: LeadershipSettings,
    #[serde(default)]
    pub demo: DemoSettings,
}

fn default_log_format() -> String {
    "text".into()
}

/// Where the consumer registry comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// TOML or JSON `ConsumerRegistry`; re-read whenever it is modified
    pub path: Option<PathBuf>,
    pub reload_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    pub trigger_interval_ms: u64,
    pub poll_delay_ms: u64,
    pub rpc_timeout_secs: u64,
    pub worker_threads: usize,
    pub max_records_per_fetch: usize,
    pub bad_record_policy: BadRecordPolicy,
    pub shutdown_timeout_ms: u64,
}

/// Consumer tablets this node leads. Empty means every tablet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LeadershipSettings {
    pub tablets: Vec<String>,
}

/// Synthetic writes appended to every mapped producer tablet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoSettings {
    pub enabled: bool,
    pub interval_ms: u64,
    pub records_per_tick: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_master_addrs: vec!["127.0.0.1:7100".into()],
            metrics_addr: "0.0.0.0:9090"
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 9090))),
            log_format: default_log_format(),
            registry: RegistrySettings::default(),
            consumer: ConsumerSettings::default(),
            leadership: LeadershipSettings::default(),
            demo: DemoSettings::default(),
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            path: None,
            reload_interval_ms: 1_000,
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            trigger_interval_ms: rly_core::DEFAULT_TRIGGER_INTERVAL_MS,
            poll_delay_ms: rly_core::DEFAULT_POLL_DELAY_MS,
            rpc_timeout_secs: rly_core::DEFAULT_RPC_TIMEOUT_SECS,
            worker_threads: 4,
            max_records_per_fetch: 1024,
            bad_record_policy: BadRecordPolicy::Skip,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 1_000,
            records_per_tick: 10,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        match ext {
            "toml" => toml::from_str(&content)
                .map_err(|e| RelayError::Config(format!("TOML parse error: {}", e))),
            "json" => serde_json::from_str(&content)
                .map_err(|e| RelayError::Config(format!("JSON parse error: {}", e))),
            _ => Err(RelayError::Config(format!(
                "Unknown config file extension: {}",
                ext
            ))),
        }
    }

    pub fn from_args(args: &super::Args) -> Self {
        let mut config = Self::default();
        config.apply_args(args);
        config
    }

    /// Command line values win over the file.
    pub fn apply_args(&mut self, args: &super::Args) {
        if let Some(metrics) = args.metrics {
            self.metrics_addr = metrics;
        }
        if !args.local_masters.is_empty() {
            self.local_master_addrs = args.local_masters.clone();
        }
        if let Some(path) = &args.registry {
            self.registry.path = Some(path.clone());
        }
        if let Some(format) = &args.log_format {
            self.log_format = format.clone();
        }
        if args.demo {
            self.demo.enabled = true;
        }
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        let c = &self.consumer;
        ConsumerConfig::new()
            .with_trigger_interval(Duration::from_millis(c.trigger_interval_ms))
            .with_poll_delay(Duration::from_millis(c.poll_delay_ms))
            .with_rpc_timeout(Duration::from_secs(c.rpc_timeout_secs))
            .with_worker_threads(c.worker_threads)
            .with_max_records_per_fetch(c.max_records_per_fetch)
            .with_bad_record_policy(c.bad_record_policy)
            .with_shutdown_timeout(Duration::from_millis(c.shutdown_timeout_ms))
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_millis(self.registry.reload_interval_ms.max(10))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.metrics_addr.port(), 9090);
        assert_eq!(config.log_format, "text");
        assert!(config.registry.path.is_none());
        assert!(config.leadership.tablets.is_empty());
        assert!(!config.demo.enabled);
    }

    #[test]
    fn test_consumer_config_conversion() {
        let mut config = Config::default();
        config.consumer.poll_delay_ms = 250;
        config.consumer.bad_record_policy = BadRecordPolicy::Halt;

        let consumer = config.consumer_config();
        assert_eq!(consumer.poll_delay, Duration::from_millis(250));
        assert_eq!(consumer.trigger_interval, Duration::from_secs(1));
        assert_eq!(consumer.bad_record_policy, BadRecordPolicy::Halt);
    }

    #[test]
    fn test_config_from_toml_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("relay.toml");

        let toml_content = r#"
local_master_addrs = ["10.0.0.1:7100", "10.0.0.2:7100"]
metrics_addr = "127.0.0.1:9191"

[registry]
path = "/etc/relay/registry.toml"
reload_interval_ms = 500

[consumer]
poll_delay_ms = 100
bad_record_policy = "halt"

[leadership]
tablets = ["ct1", "ct2"]
"#;
        std::fs::write(&config_path, toml_content).unwrap();

        let config = Config::from_file(&config_path).unwrap();
        assert_eq!(config.local_master_addrs.len(), 2);
        assert_eq!(config.metrics_addr.port(), 9191);
        assert_eq!(config.registry.reload_interval_ms, 500);
        assert_eq!(config.consumer.poll_delay_ms, 100);
        assert_eq!(config.consumer.trigger_interval_ms, 1_000);
        assert_eq!(config.consumer.bad_record_policy, BadRecordPolicy::Halt);
        assert_eq!(config.leadership.tablets, vec!["ct1", "ct2"]);
    }

    #[test]
    fn test_config_from_json_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("relay.json");
        let json = r#"{
            "local_master_addrs": ["127.0.0.1:7100"],
            "metrics_addr": "127.0.0.1:9092",
            "log_format": "json",
            "demo": { "enabled": true, "records_per_tick": 3 }
        }"#;
        std::fs::write(&config_path, json).unwrap();

        let config = Config::from_file(&config_path).unwrap();
        assert_eq!(config.log_format, "json");
        assert!(config.demo.enabled);
        assert_eq!(config.demo.records_per_tick, 3);
        assert_eq!(config.demo.interval_ms, 1_000);
    }

    #[test]
    fn test_unknown_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relay.yaml");
        std::fs::write(&path, "x: 1").unwrap();

        let err = Config::from_file(&path).unwrap_err();
        assert!(err.to_string().contains("Unknown config file extension"));
    }
}
