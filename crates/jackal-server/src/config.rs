//! YAML configuration of the `jackal` binary.
//!
//! Every section has defaults, so a file declaring `router.hosts` is enough
//! to start a single node.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{File, FileFormat};
use jackal_xmpp::xep::xep0160::OverflowPolicy;
use jackal_xmpp::{C2sConfig, ClusterConfig, ComponentConfig, ModulesConfig, RouterConfig, S2sConfig};
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/jackal/jackal.yml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pid_path: Option<PathBuf>,
    pub debug: DebugConfig,
    pub logger: LoggerConfig,
    pub storage: StorageConfig,
    /// Clustering is enabled when this section is present.
    pub cluster: Option<ClusterConfig>,
    pub router: RouterConfig,
    pub modules: ModulesConfig,
    pub components: Vec<ComponentConfig>,
    pub c2s: Vec<C2sConfig>,
    /// Federation is enabled when this section is present.
    pub s2s: Option<S2sConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Port of the diagnostic HTTP listener; disabled when unset.
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub level: String,
    /// Log file; stdout when unset or empty.
    pub log_path: Option<PathBuf>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub kind: StorageKind,
    /// Per-user offline message quota; overrides `modules.offline.queue_size`.
    pub offline_quota: Option<usize>,
    /// Overrides `modules.offline.overflow`.
    pub offline_overflow: Option<OverflowPolicy>,
}

impl Config {
    /// Load and normalize the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = config::Config::builder()
            .add_source(File::from(path).format(FileFormat::Yaml))
            .build()
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;
        let config: Config = raw
            .try_deserialize()
            .with_context(|| format!("invalid configuration file {}", path.display()))?;
        Ok(config.normalized())
    }

    fn normalized(mut self) -> Self {
        if let Some(quota) = self.storage.offline_quota {
            self.modules.offline.queue_size = quota;
        }
        if let Some(overflow) = self.storage.offline_overflow {
            self.modules.offline.overflow = overflow;
        }
        if self.c2s.is_empty() {
            self.c2s.push(C2sConfig::default());
        }
        if self
            .logger
            .log_path
            .as_ref()
            .is_some_and(|p| p.as_os_str().is_empty())
        {
            self.logger.log_path = None;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    use jackal_xmpp::{ResourceConflict, SaslMechanism, TransportType};

    fn load(yaml: &str) -> Config {
        let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        Config::load(file.path()).unwrap()
    }

    #[test]
    fn test_minimal_config() {
        let config = load("router:\n  hosts:\n    - name: jackal.im\n");
        assert_eq!(config.router.hosts.len(), 1);
        assert_eq!(config.router.hosts[0].name, "jackal.im");
        assert!(config.router.hosts[0].tls.is_none());
        assert_eq!(config.logger.level, "info");
        assert!(config.cluster.is_none());
        assert!(config.s2s.is_none());
        assert_eq!(config.c2s.len(), 1);
        assert_eq!(config.c2s[0].port, 5222);
        assert!(config.modules.is_enabled("roster"));
    }

    #[test]
    fn test_full_config() {
        let config = load(
            r#"
pid_path: /tmp/jackal.pid
debug: { port: 6060 }
logger: { level: debug, log_path: "" }
storage: { type: memory, offline_quota: 10, offline_overflow: drop-oldest }
cluster: { name: node1, port: 5010, hosts: ["10.0.0.2:5010"], in_timeout: 3s }
router:
  hosts:
    - name: jackal.im
      tls: { privkey_path: key.pem, cert_path: cert.pem }
modules:
  enabled: [roster, ping]
  roster: { versioning: false }
  ping: { send: true, send_interval: 2m }
c2s:
  - { id: default, type: socket, port: 5222, connect_timeout: 5s, resource_conflict: reject, sasl: [plain, scram_sha_1] }
  - { id: ws, type: websocket, port: 5280, url_path: /xmpp-websocket }
s2s: { port: 5269, dial_timeout: 15s, dialback_secret: s3cr3t }
"#,
        );
        assert_eq!(config.pid_path, Some(PathBuf::from("/tmp/jackal.pid")));
        assert_eq!(config.debug.port, Some(6060));
        assert_eq!(config.logger.level, "debug");
        assert_eq!(config.logger.log_path, None);
        assert_eq!(config.modules.offline.queue_size, 10);
        assert_eq!(config.modules.offline.overflow, OverflowPolicy::DropOldest);

        let cluster = config.cluster.unwrap();
        assert_eq!(cluster.name, "node1");
        assert_eq!(cluster.in_timeout, Duration::from_secs(3));
        assert_eq!(cluster.hosts, vec!["10.0.0.2:5010".to_string()]);

        assert_eq!(config.router.hosts[0].tls.as_ref().unwrap().cert_path, "cert.pem");
        assert!(!config.modules.is_enabled("offline"));
        assert!(!config.modules.roster.versioning);
        assert!(config.modules.ping.send);
        assert_eq!(config.modules.ping.send_interval, Duration::from_secs(120));

        assert_eq!(config.c2s.len(), 2);
        assert_eq!(config.c2s[0].resource_conflict, ResourceConflict::Reject);
        assert_eq!(config.c2s[0].sasl, vec![SaslMechanism::Plain, SaslMechanism::ScramSha1]);
        assert_eq!(config.c2s[1].transport, TransportType::WebSocket);
        assert_eq!(config.c2s[1].url_path, "/xmpp-websocket");

        let s2s = config.s2s.unwrap();
        assert_eq!(s2s.dialback_secret, "s3cr3t");
        assert_eq!(s2s.dial_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_missing_file_fails() {
        assert!(Config::load(Path::new("/nonexistent/jackal.yml")).is_err());
    }
}
