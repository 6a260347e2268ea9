//! 守护进程配置模块
//!
//! 配置文件为 TOML,包含四部分:
//! - `[server]`: API 绑定地址、端口、数据目录、日志级别
//! - `[arbitration]`: 对端、仲裁服务地址、密钥
//! - `[[tokens]]`: API 令牌(只保存 SHA-256 摘要)及其权限
//! - `[clusters.<name>]`: 每个集群的监控与故障转移参数
//!
//! 命令行参数覆盖文件中的值。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use repman_common::{ArbitrationConfig, ClusterConfig};

use crate::auth::TokenConfig;
use crate::ServerError;

/// 守护进程主配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub arbitration: ArbitrationConfig,

    #[serde(default)]
    pub tokens: Vec<TokenConfig>,

    #[serde(default)]
    pub clusters: BTreeMap<String, ClusterConfig>,
}

/// `[server]` 段
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerSection {
    /// 绑定地址 (默认: 0.0.0.0)
    #[serde(default = "default_bind")]
    pub bind: String,

    /// API 端口 (默认: 10005)
    #[serde(default = "default_port")]
    pub port: u16,

    /// 集群状态文件目录 (默认: ./data)
    #[serde(default = "default_datadir")]
    pub datadir: PathBuf,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_bind() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 10005 }
fn default_datadir() -> PathBuf { PathBuf::from("./data") }
fn default_log_level() -> String { "info".to_string() }

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            datadir: default_datadir(),
            log_level: default_log_level(),
        }
    }
}

impl DaemonConfig {
    /// # Brief
    /// 从 TOML 文件加载配置
    ///
    /// # Arguments
    /// * `path` - 配置文件路径
    pub fn from_file(path: &Path) -> Result<Self, ServerError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("Failed to read config: {}", e)))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ServerError> {
        toml::from_str(content).map_err(|e| ServerError::Config(format!("Failed to parse config: {}", e)))
    }

    /// 启动前校验全部集群与仲裁配置
    pub fn validate(&self) -> Result<(), ServerError> {
        for (name, cluster) in &self.clusters {
            cluster
                .validate()
                .map_err(|e| ServerError::Config(format!("cluster '{}': {}", name, e)))?;
        }
        if self.arbitration.enabled && self.arbitration.arbitrator_url.is_none() {
            return Err(ServerError::Config(
                "arbitration enabled but arbitrator-url not set".to_string(),
            ));
        }
        for token in &self.tokens {
            if token.user.is_empty() || token.token_sha256.is_empty() {
                return Err(ServerError::Config("token entries need user and token-sha256".to_string()));
            }
        }
        Ok(())
    }

    /// 命令行覆盖
    pub fn apply_overrides(&mut self, datadir: Option<PathBuf>, log_level: Option<String>) {
        if let Some(datadir) = datadir {
            self.server.datadir = datadir;
        }
        if let Some(level) = log_level {
            self.server.log_level = level;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Permission;
    use repman_common::FailoverMode;

    const SAMPLE: &str = r#"
[server]
port = 10001
datadir = "/var/lib/repman"

[arbitration]
enabled = true
peers = ["repman2:10001"]
arbitrator-url = "http://arbitrator:10002"
secret = "s3cret"

[[tokens]]
user = "admin"
token-sha256 = "n4bQgYhMfWWaL+qgxVrQFaO/TxsrC4Is0V1sFbDwCgg="
clusters = ["*"]
permissions = ["read", "write"]

[clusters.c1]
db-servers-hosts = ["db1:3306", "db2:3306"]
failover-mode = "automatic"
"#;

    #[test]
    fn test_parse_sample() {
        let config = DaemonConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.server.port, 10001);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.arbitration.peers, vec!["repman2:10001"]);
        assert_eq!(config.tokens[0].permissions, vec![Permission::Read, Permission::Write]);
        assert_eq!(config.clusters["c1"].failover_mode, FailoverMode::Automatic);
        assert_eq!(config.clusters["c1"].monitoring_ticker, 2);
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_config() {
        let config = DaemonConfig::from_toml("").unwrap();
        assert!(config.clusters.is_empty());
        assert_eq!(config.server.log_level, "info");
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_cluster_rejected() {
        let config = DaemonConfig::from_toml(
            r#"
[clusters.c1]
db-servers-hosts = ["db1:3306", "db1:3306"]
"#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ServerError::Config(_))));
    }

    #[test]
    fn test_overrides() {
        let mut config = DaemonConfig::default();
        config.apply_overrides(Some(PathBuf::from("/tmp/repman")), Some("debug".to_string()));
        assert_eq!(config.server.datadir, PathBuf::from("/tmp/repman"));
        assert_eq!(config.server.log_level, "debug");
    }
}
