//! 内存模拟集群
//!
//! 实现 [`ServerDriver`],用来在没有真实数据库的情况下驱动监控循环与故障转移,
//! 支持注入故障: 宕机、延迟、过滤规则不一致、重指向失败等。
//! 所有节点只使用 GTID 域 0。

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use repman_common::{GtidSet, HostPort, ReplicationPosition};

use crate::driver::{
    DbFlavor, IoThreadState, ReplicationFilters, ReplicationStatus, ServerDriver, ServerSnapshot,
    SourceSpec,
};
use crate::error::ProbeError;

/// 一台模拟数据库
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimServer {
    pub up: bool,
    /// TCP 端口是否可连(默认跟随 up)
    pub tcp_up: Option<bool>,
    pub auth_denied: bool,
    pub server_id: u32,
    pub read_only: bool,
    pub frozen: bool,
    pub source: Option<HostPort>,
    pub io_running: bool,
    pub sql_running: bool,
    pub lag: u64,
    /// 已执行(并写入 binlog)的序号
    pub executed_seq: u64,
    /// 已接收的序号
    pub retrieved_seq: u64,
    pub semisync: bool,
    pub filters: ReplicationFilters,
    pub fail_change_source: bool,
    pub long_writes: u32,
}

impl SimServer {
    /// 可写主库
    pub fn primary(server_id: u32, seq: u64) -> Self {
        Self {
            up: true,
            tcp_up: None,
            auth_denied: false,
            server_id,
            read_only: false,
            frozen: false,
            source: None,
            io_running: false,
            sql_running: false,
            lag: 0,
            executed_seq: seq,
            retrieved_seq: seq,
            semisync: false,
            filters: ReplicationFilters::default(),
            fail_change_source: false,
            long_writes: 0,
        }
    }

    /// 只读从库
    pub fn replica_of(server_id: u32, source: &str, seq: u64) -> Self {
        Self {
            read_only: true,
            source: HostPort::parse(source).ok(),
            io_running: true,
            sql_running: true,
            ..Self::primary(server_id, seq)
        }
    }

    fn gtid(&self, seq: u64) -> GtidSet {
        let mut set = GtidSet::new();
        if seq > 0 {
            set.insert("0".to_string(), Some(1), seq);
        }
        set
    }
}

/// 模拟集群
#[derive(Debug, Default)]
pub struct SimFleet {
    servers: Mutex<BTreeMap<String, SimServer>>,
    /// 别名地址 -> 节点地址,例如同一台机器的 IP 形式
    aliases: Mutex<BTreeMap<String, String>>,
    calls: Mutex<Vec<String>>,
    /// 设置后每次探测都要先拿到一个许可
    probe_permits: Mutex<Option<Arc<Semaphore>>>,
}

impl SimFleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, url: &str, server: SimServer) {
        self.servers.lock().insert(url.to_string(), server);
    }

    /// 让 `alias` 指向已存在的节点 `url`
    pub fn add_alias(&self, alias: &str, url: &str) {
        self.aliases.lock().insert(alias.to_string(), url.to_string());
    }

    /// 暂停探测,直到对返回的信号量 `add_permits`
    pub fn pause_probes(&self) -> Arc<Semaphore> {
        let permits = Arc::new(Semaphore::new(0));
        *self.probe_permits.lock() = Some(permits.clone());
        permits
    }

    /// 修改一台节点
    pub fn with<F: FnOnce(&mut SimServer)>(&self, url: &str, f: F) {
        if let Some(s) = self.servers.lock().get_mut(url) {
            f(s);
        }
    }

    pub fn get(&self, url: &str) -> Option<SimServer> {
        self.servers.lock().get(url).cloned()
    }

    pub fn kill(&self, url: &str) {
        self.with(url, |s| s.up = false);
    }

    /// 在主库上写入 n 个事务,未延迟的从库立即跟上
    pub fn write(&self, url: &str, n: u64) {
        self.with(url, |s| {
            s.executed_seq += n;
            s.retrieved_seq = s.executed_seq;
        });
        self.replicate();
    }

    /// 已执行的驱动调用,形如 `stop_replication db2:3306`
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: &str, addr: &HostPort) {
        self.calls.lock().push(format!("{} {}", call, addr.url()));
    }

    /// 推进所有复制线程
    fn replicate(&self) {
        let aliases = self.aliases.lock().clone();
        let mut servers = self.servers.lock();
        let positions: BTreeMap<String, (bool, u64)> = servers
            .iter()
            .map(|(url, s)| (url.clone(), (s.up, s.executed_seq)))
            .collect();
        for s in servers.values_mut() {
            let Some(source) = &s.source else { continue };
            let url = source.url();
            let url = aliases.get(&url).unwrap_or(&url);
            let Some((source_up, source_seq)) = positions.get(url) else { continue };
            if s.up && s.io_running && *source_up {
                s.retrieved_seq = s.retrieved_seq.max(*source_seq);
            }
            if s.up && s.sql_running && s.lag == 0 {
                s.executed_seq = s.executed_seq.max(s.retrieved_seq);
            }
        }
    }

    fn alive(&self, addr: &HostPort) -> Result<(), ProbeError> {
        match self.servers.lock().get(&addr.url()) {
            Some(s) if s.up && !s.auth_denied => Ok(()),
            Some(s) if s.up => Err(ProbeError::AuthFailure(format!("access denied on {}", addr))),
            _ => Err(ProbeError::Unreachable(format!("connection refused by {}", addr))),
        }
    }

    fn mutate<F: FnOnce(&mut SimServer) -> Result<(), ProbeError>>(
        &self,
        addr: &HostPort,
        f: F,
    ) -> Result<(), ProbeError> {
        self.alive(addr)?;
        let result = match self.servers.lock().get_mut(&addr.url()) {
            Some(s) => f(s),
            None => Err(ProbeError::Unreachable(addr.url())),
        };
        self.replicate();
        result
    }
}

#[async_trait]
impl ServerDriver for SimFleet {
    async fn probe(&self, addr: &HostPort, _timeout: Duration) -> Result<ServerSnapshot, ProbeError> {
        let permits = self.probe_permits.lock().clone();
        if let Some(permits) = permits {
            if let Ok(permit) = permits.acquire().await {
                permit.forget();
            }
        }
        self.alive(addr)?;
        self.replicate();
        let aliases = self.aliases.lock().clone();
        let servers = self.servers.lock();
        let me = servers
            .get(&addr.url())
            .ok_or_else(|| ProbeError::Unreachable(addr.url()))?;
        let url = addr.url();
        let connected_replicas = servers
            .values()
            .filter(|s| {
                s.up && s.io_running
                    && s.source.as_ref().map(|h| {
                        let source = h.url();
                        aliases.get(&source).unwrap_or(&source) == &url
                    }).unwrap_or(false)
            })
            .count() as u32;

        let replication = me.source.as_ref().map(|source| {
            let source_url = source.url();
            let source_state = servers.get(aliases.get(&source_url).unwrap_or(&source_url));
            let source_up = source_state.map(|s| s.up).unwrap_or(false);
            let io_state = match (me.io_running, source_up) {
                (true, true) => IoThreadState::Yes,
                (true, false) => IoThreadState::Connecting,
                (false, _) => IoThreadState::No,
            };
            ReplicationStatus {
                source: source.clone(),
                source_server_id: source_state.map(|s| s.server_id),
                io_state,
                sql_running: me.sql_running,
                seconds_behind: if me.sql_running { Some(me.lag) } else { None },
                using_gtid: true,
                retrieved_gtid: me.gtid(me.retrieved_seq),
                executed_gtid: me.gtid(me.executed_seq),
                read_coords: None,
                exec_coords: None,
                last_io_error: if io_state == IoThreadState::Connecting {
                    format!("error reconnecting to master '{}'", source)
                } else {
                    String::new()
                },
                last_sql_error: String::new(),
            }
        });

        Ok(ServerSnapshot {
            server_id: me.server_id,
            version: "10.11.6-MariaDB-log".to_string(),
            flavor: DbFlavor::MariaDb,
            read_only: me.read_only,
            log_bin: true,
            semisync_primary_enabled: me.semisync,
            semisync_primary_active: me.semisync && me.source.is_none(),
            semisync_replica_active: me.semisync && me.source.is_some(),
            binlog_gtid: me.gtid(me.executed_seq),
            binlog_coords: None,
            connected_replicas,
            replication,
            filters: me.filters.clone(),
            wsrep: None,
            is_binlog_server: false,
        })
    }

    async fn tcp_ping(&self, addr: &HostPort, _timeout: Duration) -> bool {
        self.servers
            .lock()
            .get(&addr.url())
            .map(|s| s.tcp_up.unwrap_or(s.up))
            .unwrap_or(false)
    }

    async fn stop_replication(&self, addr: &HostPort) -> Result<(), ProbeError> {
        self.record("stop_replication", addr);
        self.mutate(addr, |s| {
            s.io_running = false;
            s.sql_running = false;
            Ok(())
        })
    }

    async fn start_replication(&self, addr: &HostPort) -> Result<(), ProbeError> {
        self.record("start_replication", addr);
        self.mutate(addr, |s| {
            if s.source.is_some() {
                s.io_running = true;
                s.sql_running = true;
            }
            Ok(())
        })
    }

    async fn reset_replication(&self, addr: &HostPort) -> Result<(), ProbeError> {
        self.record("reset_replication", addr);
        self.mutate(addr, |s| {
            s.source = None;
            s.io_running = false;
            s.sql_running = false;
            s.lag = 0;
            Ok(())
        })
    }

    async fn set_read_only(&self, addr: &HostPort, read_only: bool) -> Result<(), ProbeError> {
        self.record(if read_only { "set_read_only" } else { "set_writable" }, addr);
        self.mutate(addr, |s| {
            s.read_only = read_only;
            Ok(())
        })
    }

    async fn freeze(&self, addr: &HostPort, _timeout: Duration) -> Result<(), ProbeError> {
        self.record("freeze", addr);
        self.mutate(addr, |s| {
            s.frozen = true;
            Ok(())
        })
    }

    async fn unfreeze(&self, addr: &HostPort) -> Result<(), ProbeError> {
        self.record("unfreeze", addr);
        self.mutate(addr, |s| {
            s.frozen = false;
            Ok(())
        })
    }

    async fn change_source(&self, addr: &HostPort, spec: &SourceSpec) -> Result<(), ProbeError> {
        self.record("change_source", addr);
        self.mutate(addr, |s| {
            if s.fail_change_source {
                return Err(ProbeError::ProtocolError(format!(
                    "CHANGE MASTER to {} failed on {}",
                    spec.source, addr
                )));
            }
            s.source = Some(spec.source.clone());
            s.io_running = false;
            s.sql_running = false;
            s.lag = 0;
            Ok(())
        })
    }

    async fn wait_for_position(
        &self,
        addr: &HostPort,
        target: &ReplicationPosition,
        _timeout: Duration,
    ) -> Result<bool, ProbeError> {
        self.record("wait_for_position", addr);
        self.alive(addr)?;
        self.replicate();
        let wanted = target.gtid.seq("0").unwrap_or(0);
        let mut servers = self.servers.lock();
        let s = servers
            .get_mut(&addr.url())
            .ok_or_else(|| ProbeError::Unreachable(addr.url()))?;
        // 等待期间回放已接收的 relay log
        if s.retrieved_seq >= wanted {
            s.executed_seq = s.executed_seq.max(s.retrieved_seq);
        }
        Ok(s.executed_seq >= wanted)
    }

    async fn long_running_writes(&self, addr: &HostPort, _threshold: u64) -> Result<u32, ProbeError> {
        self.alive(addr)?;
        Ok(self
            .servers
            .lock()
            .get(&addr.url())
            .map(|s| s.long_writes)
            .unwrap_or(0))
    }
}
