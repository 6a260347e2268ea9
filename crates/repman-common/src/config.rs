//! 集群配置模块
//!
//! 每个被监控集群一份 ClusterConfig,键名沿用 kebab-case 命令行风格
//! (`monitoring-ticker`、`failover-limit` ...),缺省值由 `default_*` 函数给出。

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use crate::error::{RepmanError, RepmanResult};
use crate::types::HostPort;

/// 自动/手动故障转移
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailoverMode {
    #[default]
    Manual,
    Automatic,
}

/// 代理驱动类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    /// 通过 HTTP 回调通知外部代理
    External,
    Haproxy,
    Proxysql,
    Maxscale,
    Spider,
    Shardproxy,
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProxyKind::External => "external",
            ProxyKind::Haproxy => "haproxy",
            ProxyKind::Proxysql => "proxysql",
            ProxyKind::Maxscale => "maxscale",
            ProxyKind::Spider => "spider",
            ProxyKind::Shardproxy => "shardproxy",
        };
        f.write_str(name)
    }
}

/// 代理配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    pub name: String,
    /// 外部代理的回调地址
    #[serde(default)]
    pub url: Option<String>,
}

/// 配置中的一台数据库
///
/// 写法为 `[name=]host[:port]`,未写名字时以 `host:port` 作为名字。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSpec {
    pub name: String,
    pub addr: HostPort,
}

impl ServerSpec {
    pub fn parse(s: &str) -> RepmanResult<Self> {
        let (name, addr) = match s.split_once('=') {
            Some((name, addr)) => (Some(name.trim()), addr),
            None => (None, s),
        };
        let addr = HostPort::parse(addr)?;
        let name = match name {
            Some(n) if !n.is_empty() => n.to_string(),
            Some(_) => return Err(RepmanError::Config(format!("empty server name in '{}'", s))),
            None => addr.url(),
        };
        Ok(Self { name, addr })
    }
}

/// 单个集群的配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterConfig {
    /// 数据库列表
    #[serde(default)]
    pub db_servers_hosts: Vec<String>,
    /// 监控账号 `user:password`
    #[serde(default = "default_credential")]
    pub db_servers_credential: String,
    /// 复制账号 `user:password`,为空时沿用监控账号
    #[serde(default)]
    pub replication_credential: String,
    #[serde(default)]
    pub db_servers_prefered_master: Vec<String>,
    #[serde(default)]
    pub db_servers_ignored_hosts: Vec<String>,
    #[serde(default = "default_connect_timeout")]
    pub db_servers_connect_timeout: u64,
    /// 空闲连接关闭时间(秒)
    #[serde(default = "default_idle_timeout")]
    pub db_servers_idle_timeout: u64,

    /// 监控周期(秒)
    #[serde(default = "default_ticker")]
    pub monitoring_ticker: u64,

    #[serde(default)]
    pub failover_mode: FailoverMode,
    #[serde(default = "default_ping_counter")]
    pub failover_falsepositive_ping_counter: u32,
    #[serde(default = "default_true")]
    pub failover_falsepositive_heartbeat: bool,
    /// 0 表示不限制
    #[serde(default = "default_failover_limit")]
    pub failover_limit: u32,
    /// 两次故障转移的最短间隔(秒),0 表示不限制
    #[serde(default, alias = "failover-time-not-reach")]
    pub failover_time_limit: u64,
    #[serde(default = "default_max_slave_delay")]
    pub failover_max_slave_delay: u64,
    #[serde(default)]
    pub failover_at_sync: bool,
    #[serde(default = "default_true")]
    pub failover_readonly_state: bool,
    /// 故障转移时等待 relay log 回放的时间(秒)
    #[serde(default = "default_relay_wait")]
    pub failover_relay_wait: u64,

    #[serde(default = "default_wait_trx")]
    pub switchover_wait_trx: u64,
    #[serde(default = "default_wait_write_query")]
    pub switchover_wait_write_query: u64,
    #[serde(default)]
    pub switchover_at_sync: bool,

    #[serde(default = "default_true")]
    pub check_replication_filters: bool,
    #[serde(default = "default_true")]
    pub check_replication_state: bool,

    #[serde(default)]
    pub replication_multi_master: bool,
    #[serde(default)]
    pub replication_multi_tier_slave: bool,
    #[serde(default)]
    pub replication_multi_master_ring: bool,
    #[serde(default)]
    pub replication_multi_master_wsrep: bool,
    #[serde(default = "default_connect_retry")]
    pub replication_master_connect_retry: u64,

    #[serde(default)]
    pub proxy_servers_read_on_master: bool,
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,

    /// 故障转移每个子步骤的超时(秒)
    #[serde(default = "default_step_timeout")]
    pub step_timeout: u64,
}

fn default_credential() -> String { "root:".to_string() }
fn default_connect_timeout() -> u64 { 5 }
fn default_idle_timeout() -> u64 { 60 }
fn default_ticker() -> u64 { 2 }
fn default_ping_counter() -> u32 { 5 }
fn default_true() -> bool { true }
fn default_failover_limit() -> u32 { 5 }
fn default_max_slave_delay() -> u64 { 30 }
fn default_relay_wait() -> u64 { 30 }
fn default_wait_trx() -> u64 { 10 }
fn default_wait_write_query() -> u64 { 10 }
fn default_connect_retry() -> u64 { 10 }
fn default_step_timeout() -> u64 { 10 }

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            db_servers_hosts: Vec::new(),
            db_servers_credential: default_credential(),
            replication_credential: String::new(),
            db_servers_prefered_master: Vec::new(),
            db_servers_ignored_hosts: Vec::new(),
            db_servers_connect_timeout: default_connect_timeout(),
            db_servers_idle_timeout: default_idle_timeout(),
            monitoring_ticker: default_ticker(),
            failover_mode: FailoverMode::Manual,
            failover_falsepositive_ping_counter: default_ping_counter(),
            failover_falsepositive_heartbeat: true,
            failover_limit: default_failover_limit(),
            failover_time_limit: 0,
            failover_max_slave_delay: default_max_slave_delay(),
            failover_at_sync: false,
            failover_readonly_state: true,
            failover_relay_wait: default_relay_wait(),
            switchover_wait_trx: default_wait_trx(),
            switchover_wait_write_query: default_wait_write_query(),
            switchover_at_sync: false,
            check_replication_filters: true,
            check_replication_state: true,
            replication_multi_master: false,
            replication_multi_tier_slave: false,
            replication_multi_master_ring: false,
            replication_multi_master_wsrep: false,
            replication_master_connect_retry: default_connect_retry(),
            proxy_servers_read_on_master: false,
            proxies: Vec::new(),
            step_timeout: default_step_timeout(),
        }
    }
}

impl ClusterConfig {
    /// 解析并校验数据库列表
    pub fn servers(&self) -> RepmanResult<Vec<ServerSpec>> {
        let mut names = HashSet::new();
        let mut urls = HashSet::new();
        let mut specs = Vec::with_capacity(self.db_servers_hosts.len());
        for raw in &self.db_servers_hosts {
            let spec = ServerSpec::parse(raw)?;
            if !names.insert(spec.name.clone()) || !urls.insert(spec.addr.url()) {
                return Err(RepmanError::Config(format!("duplicate server '{}'", raw)));
            }
            specs.push(spec);
        }
        Ok(specs)
    }

    /// 启动前校验
    pub fn validate(&self) -> RepmanResult<()> {
        if self.monitoring_ticker == 0 {
            return Err(RepmanError::Config("monitoring-ticker must be > 0".to_string()));
        }
        if self.failover_falsepositive_ping_counter == 0 {
            return Err(RepmanError::Config(
                "failover-falsepositive-ping-counter must be > 0".to_string(),
            ));
        }
        self.servers()?;
        for host in self
            .db_servers_prefered_master
            .iter()
            .chain(self.db_servers_ignored_hosts.iter())
        {
            HostPort::parse(host)?;
        }
        Ok(())
    }

    pub fn ticker(&self) -> Duration {
        Duration::from_secs(self.monitoring_ticker)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.db_servers_connect_timeout)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout)
    }

    /// 监控账号
    pub fn credentials(&self) -> (String, String) {
        split_credential(&self.db_servers_credential)
    }

    /// 复制账号,未配置时使用监控账号
    pub fn replication_credentials(&self) -> (String, String) {
        if self.replication_credential.is_empty() {
            self.credentials()
        } else {
            split_credential(&self.replication_credential)
        }
    }

    pub fn is_preferred(&self, url: &str) -> bool {
        contains_host(&self.db_servers_prefered_master, url)
    }

    pub fn is_ignored(&self, url: &str) -> bool {
        contains_host(&self.db_servers_ignored_hosts, url)
    }

    /// 是否为多主类拓扑
    pub fn is_multi_master(&self) -> bool {
        self.replication_multi_master
            || self.replication_multi_master_ring
            || self.replication_multi_master_wsrep
    }
}

/// 多监控进程仲裁配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ArbitrationConfig {
    #[serde(default)]
    pub enabled: bool,
    /// 对端监控进程 `host:port`
    #[serde(default)]
    pub peers: Vec<String>,
    /// 外部仲裁服务地址
    #[serde(default)]
    pub arbitrator_url: Option<String>,
    #[serde(default)]
    pub secret: String,
    /// 本进程在仲裁中的编号
    #[serde(default)]
    pub uid: u64,
    /// 心跳周期(秒),对端超过 4 个周期无应答视为宕机
    #[serde(default = "default_ticker")]
    pub heartbeat_ticker: u64,
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            peers: Vec::new(),
            arbitrator_url: None,
            secret: String::new(),
            uid: 0,
            heartbeat_ticker: default_ticker(),
        }
    }
}

impl ArbitrationConfig {
    pub fn ticker(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ticker.max(1))
    }

    /// 对端被视为宕机前的静默时间
    pub fn down_after(&self) -> Duration {
        self.ticker() * 4
    }
}

fn split_credential(raw: &str) -> (String, String) {
    match raw.split_once(':') {
        Some((user, pass)) => (user.to_string(), pass.to_string()),
        None => (raw.to_string(), String::new()),
    }
}

fn contains_host(list: &[String], url: &str) -> bool {
    list.iter().any(|h| {
        HostPort::parse(h)
            .map(|hp| hp.url() == url)
            .unwrap_or(false)
    })
}
