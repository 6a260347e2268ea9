//! MySQL / MariaDB 驱动
//!
//! 基于 mysql_async,每台数据库一个连接池,空闲连接按配置时间回收。
//! 探测只执行固定的监控语句,拓扑变更只执行复制相关语句。

use async_trait::async_trait;
use dashmap::DashMap;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Pool, PoolConstraints, PoolOpts, Row};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use repman_common::{BinlogCoords, ClusterConfig, GtidSet, HostPort, ReplicationPosition};

use crate::driver::{
    DbFlavor, IoThreadState, ReplicationFilters, ReplicationStatus, ServerDriver, ServerSnapshot,
    SourceSpec, WsrepStatus,
};
use crate::error::ProbeError;

/// 数据库驱动
pub struct MysqlDriver {
    pools: DashMap<String, Pool>,
    /// FLUSH TABLES WITH READ LOCK 必须留在同一个会话上
    frozen: DashMap<String, Conn>,
    /// 最近一次探测到的发行版与语法
    dialects: DashMap<String, Dialect>,
    user: String,
    password: String,
    connect_timeout: Duration,
    idle_timeout: Duration,
}

impl MysqlDriver {
    pub fn new(config: &ClusterConfig) -> Self {
        let (user, password) = config.credentials();
        Self {
            pools: DashMap::new(),
            frozen: DashMap::new(),
            dialects: DashMap::new(),
            user,
            password,
            connect_timeout: config.connect_timeout(),
            idle_timeout: Duration::from_secs(config.db_servers_idle_timeout),
        }
    }

    fn pool(&self, addr: &HostPort) -> Pool {
        let url = addr.url();
        if let Some(pool) = self.pools.get(&url) {
            return pool.clone();
        }
        let constraints = PoolConstraints::new(0, 4).unwrap_or_default();
        let pool_opts = PoolOpts::default()
            .with_constraints(constraints)
            .with_inactive_connection_ttl(self.idle_timeout);
        let opts = OptsBuilder::default()
            .ip_or_hostname(addr.host.clone())
            .tcp_port(addr.port)
            .user(Some(self.user.clone()))
            .pass(Some(self.password.clone()))
            .pool_opts(pool_opts);
        let pool = Pool::new(Opts::from(opts));
        self.pools.entry(url).or_insert(pool).clone()
    }

    async fn conn(&self, addr: &HostPort) -> Result<Conn, ProbeError> {
        let pool = self.pool(addr);
        match tokio::time::timeout(self.connect_timeout, pool.get_conn()).await {
            Ok(result) => result.map_err(map_error),
            Err(_) => Err(ProbeError::Timeout(self.connect_timeout.as_secs())),
        }
    }

    fn dialect(&self, addr: &HostPort) -> Dialect {
        self.dialects
            .get(&addr.url())
            .map(|d| *d)
            .unwrap_or_default()
    }

    async fn exec(&self, addr: &HostPort, sql: &str) -> Result<(), ProbeError> {
        debug!(server = %addr, "{}", redact(sql));
        let mut conn = self.conn(addr).await?;
        conn.query_drop(sql).await.map_err(map_error)
    }

    async fn collect(&self, addr: &HostPort) -> Result<ServerSnapshot, ProbeError> {
        let mut conn = self.conn(addr).await?;

        let (server_id, version, read_only, log_bin): (u32, String, i64, i64) = conn
            .query_first("SELECT @@server_id, @@version, @@read_only, @@log_bin")
            .await
            .map_err(map_error)?
            .ok_or_else(|| ProbeError::ProtocolError("empty identity row".to_string()))?;
        let dialect = Dialect::detect(&version);
        let flavor = dialect.flavor;
        self.dialects.insert(addr.url(), dialect);

        let status_sql = dialect.replica_sql("SHOW {} STATUS");
        let status: Option<Row> = conn.query_first(status_sql.as_str()).await.map_err(map_error)?;

        let (binlog_gtid, executed_gtid) = match flavor {
            DbFlavor::MariaDb => {
                let row: Option<(Option<String>, Option<String>)> = conn
                    .query_first("SELECT @@gtid_binlog_pos, @@gtid_slave_pos")
                    .await
                    .map_err(map_error)?;
                let (binlog, slave) = row.unwrap_or_default();
                (parse_gtid(binlog), parse_gtid(slave))
            }
            DbFlavor::MySql => {
                let executed: Option<Option<String>> = conn
                    .query_first("SELECT @@GLOBAL.gtid_executed")
                    .await
                    .map_err(map_error)?;
                let set = parse_gtid(executed.flatten());
                (set.clone(), set)
            }
        };

        let binlog_coords = if log_bin != 0 {
            let row: Option<Row> = conn.query_first("SHOW MASTER STATUS").await.map_err(map_error)?;
            row.and_then(|r| {
                let file = text(&r, &["File"])?;
                let pos = text(&r, &["Position"])?.parse().ok()?;
                Some(BinlogCoords::new(file, pos))
            })
        } else {
            None
        };

        let semisync: Vec<(String, String)> = conn
            .query("SHOW GLOBAL STATUS LIKE 'Rpl_semi_sync%status'")
            .await
            .map_err(map_error)?;
        let semisync_on = |names: &[&str]| {
            semisync
                .iter()
                .any(|(k, v)| names.iter().any(|n| k.eq_ignore_ascii_case(n)) && v == "ON")
        };
        let semisync_primary_active =
            semisync_on(&["Rpl_semi_sync_master_status", "Rpl_semi_sync_source_status"]);
        let semisync_replica_active =
            semisync_on(&["Rpl_semi_sync_slave_status", "Rpl_semi_sync_replica_status"]);
        let semisync_enabled: Vec<(String, String)> = conn
            .query("SHOW GLOBAL VARIABLES LIKE 'rpl_semi_sync_%_enabled'")
            .await
            .map_err(map_error)?;
        let semisync_primary_enabled = semisync_enabled.iter().any(|(k, v)| {
            (k.contains("master") || k.contains("source")) && v == "ON"
        });

        let connected_replicas: Option<i64> = conn
            .query_first(
                "SELECT COUNT(*) FROM information_schema.PROCESSLIST \
                 WHERE COMMAND IN ('Binlog Dump', 'Binlog Dump GTID')",
            )
            .await
            .map_err(map_error)?;

        let wsrep_rows: Vec<(String, String)> = conn
            .query("SHOW GLOBAL STATUS WHERE Variable_name IN ('wsrep_cluster_size', 'wsrep_local_state_comment')")
            .await
            .map_err(map_error)?;
        let wsrep = if wsrep_rows.is_empty() {
            None
        } else {
            let size = wsrep_rows
                .iter()
                .find(|(k, _)| k == "wsrep_cluster_size")
                .and_then(|(_, v)| v.parse().ok())
                .unwrap_or(0);
            let synced = wsrep_rows
                .iter()
                .any(|(k, v)| k == "wsrep_local_state_comment" && v == "Synced");
            (size > 0).then_some(WsrepStatus { cluster_size: size, synced })
        };

        let (replication, filters) = match status {
            Some(row) => {
                let (status, filters) = parse_replica_status(&row, flavor, executed_gtid);
                (Some(status), filters)
            }
            None => (None, ReplicationFilters::default()),
        };

        Ok(ServerSnapshot {
            server_id,
            is_binlog_server: version.to_ascii_lowercase().contains("maxscale"),
            version,
            flavor,
            read_only: read_only != 0,
            log_bin: log_bin != 0,
            semisync_primary_enabled,
            semisync_primary_active,
            semisync_replica_active,
            binlog_gtid,
            binlog_coords,
            connected_replicas: connected_replicas.unwrap_or(0).max(0) as u32,
            replication,
            filters,
            wsrep,
        })
    }
}

#[async_trait]
impl ServerDriver for MysqlDriver {
    async fn probe(&self, addr: &HostPort, timeout: Duration) -> Result<ServerSnapshot, ProbeError> {
        match tokio::time::timeout(timeout, self.collect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout(timeout.as_secs())),
        }
    }

    async fn tcp_ping(&self, addr: &HostPort, timeout: Duration) -> bool {
        let target = (addr.host.as_str(), addr.port);
        matches!(
            tokio::time::timeout(timeout, TcpStream::connect(target)).await,
            Ok(Ok(_))
        )
    }

    async fn stop_replication(&self, addr: &HostPort) -> Result<(), ProbeError> {
        let sql = self.dialect(addr).replica_sql("STOP {}");
        self.exec(addr, &sql).await
    }

    async fn start_replication(&self, addr: &HostPort) -> Result<(), ProbeError> {
        let sql = self.dialect(addr).replica_sql("START {}");
        self.exec(addr, &sql).await
    }

    async fn reset_replication(&self, addr: &HostPort) -> Result<(), ProbeError> {
        let sql = self.dialect(addr).replica_sql("RESET {} ALL");
        self.exec(addr, &sql).await
    }

    async fn set_read_only(&self, addr: &HostPort, read_only: bool) -> Result<(), ProbeError> {
        let sql = if read_only {
            "SET GLOBAL read_only = 1"
        } else {
            "SET GLOBAL read_only = 0"
        };
        self.exec(addr, sql).await
    }

    async fn freeze(&self, addr: &HostPort, timeout: Duration) -> Result<(), ProbeError> {
        let mut conn = self.conn(addr).await?;
        let flush = async {
            conn.query_drop("FLUSH NO_WRITE_TO_BINLOG TABLES").await?;
            conn.query_drop("FLUSH TABLES WITH READ LOCK").await
        };
        match tokio::time::timeout(timeout, flush).await {
            Ok(Ok(())) => {
                self.frozen.insert(addr.url(), conn);
                Ok(())
            }
            Ok(Err(e)) => Err(map_error(e)),
            Err(_) => Err(ProbeError::Timeout(timeout.as_secs())),
        }
    }

    async fn unfreeze(&self, addr: &HostPort) -> Result<(), ProbeError> {
        match self.frozen.remove(&addr.url()) {
            Some((_, mut conn)) => conn.query_drop("UNLOCK TABLES").await.map_err(map_error),
            None => Ok(()),
        }
    }

    async fn change_source(&self, addr: &HostPort, spec: &SourceSpec) -> Result<(), ProbeError> {
        let sql = change_source_sql(self.dialect(addr), spec);
        self.exec(addr, &sql).await
    }

    async fn wait_for_position(
        &self,
        addr: &HostPort,
        target: &ReplicationPosition,
        timeout: Duration,
    ) -> Result<bool, ProbeError> {
        let mut conn = self.conn(addr).await?;
        let secs = timeout.as_secs().max(1);
        let reached = if !target.gtid.is_empty() {
            match self.dialect(addr).flavor {
                DbFlavor::MariaDb => {
                    let r: Option<Option<i64>> = conn
                        .exec_first("SELECT MASTER_GTID_WAIT(?, ?)", (target.gtid.to_string(), secs))
                        .await
                        .map_err(map_error)?;
                    r.flatten() == Some(0)
                }
                DbFlavor::MySql => {
                    let r: Option<Option<i64>> = conn
                        .exec_first(
                            "SELECT WAIT_FOR_EXECUTED_GTID_SET(?, ?)",
                            (target.gtid.to_string(), secs),
                        )
                        .await
                        .map_err(map_error)?;
                    r.flatten() == Some(0)
                }
            }
        } else if let Some(coords) = &target.coords {
            let r: Option<Option<i64>> = conn
                .exec_first(
                    "SELECT MASTER_POS_WAIT(?, ?, ?)",
                    (coords.file.clone(), coords.pos, secs),
                )
                .await
                .map_err(map_error)?;
            matches!(r.flatten(), Some(n) if n >= 0)
        } else {
            true
        };
        Ok(reached)
    }

    async fn long_running_writes(&self, addr: &HostPort, threshold: u64) -> Result<u32, ProbeError> {
        let mut conn = self.conn(addr).await?;
        let count: Option<Option<i64>> = conn
            .exec_first(
                "SELECT SUM(ct) FROM ( \
                   SELECT COUNT(*) AS ct FROM information_schema.PROCESSLIST \
                   WHERE COMMAND = 'Query' AND TIME >= ? AND INFO NOT LIKE 'select%' \
                   UNION ALL \
                   SELECT COUNT(*) AS ct FROM information_schema.INNODB_TRX \
                   WHERE trx_started < CURRENT_TIMESTAMP - INTERVAL ? SECOND \
                 ) w",
                (threshold, threshold),
            )
            .await
            .map_err(map_error)?;
        Ok(count.flatten().unwrap_or(0).max(0) as u32)
    }

    async fn disconnect(&self, addr: &HostPort) {
        self.frozen.remove(&addr.url());
        if let Some((_, pool)) = self.pools.remove(&addr.url()) {
            if let Err(e) = pool.disconnect().await {
                warn!(server = %addr, "Error closing connection pool: {}", e);
            }
        }
    }
}

fn map_error(e: mysql_async::Error) -> ProbeError {
    match &e {
        mysql_async::Error::Server(server) => match server.code {
            1045 => ProbeError::AuthFailure(server.message.clone()),
            1142 | 1227 => ProbeError::PermissionDenied(server.message.clone()),
            _ => ProbeError::ProtocolError(e.to_string()),
        },
        mysql_async::Error::Io(_) => ProbeError::Unreachable(e.to_string()),
        _ => ProbeError::ProtocolError(e.to_string()),
    }
}

/// 按候选列名读取文本列,兼容 Master_/Source_ 两套命名
fn text(row: &Row, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        row.get_opt::<Option<String>, _>(*name)
            .and_then(Result::ok)
            .flatten()
    })
}

fn parse_gtid(raw: Option<String>) -> GtidSet {
    raw.and_then(|s| GtidSet::parse(&s).ok()).unwrap_or_default()
}

fn coords(row: &Row, file: &[&str], pos: &[&str]) -> Option<BinlogCoords> {
    let file = text(row, file).filter(|f| !f.is_empty())?;
    let pos = text(row, pos)?.parse().ok()?;
    Some(BinlogCoords::new(file, pos))
}

fn parse_replica_status(
    row: &Row,
    flavor: DbFlavor,
    executed_gtid: GtidSet,
) -> (ReplicationStatus, ReplicationFilters) {
    let host = text(row, &["Master_Host", "Source_Host"]).unwrap_or_default();
    let port = text(row, &["Master_Port", "Source_Port"])
        .and_then(|p| p.parse().ok())
        .unwrap_or(repman_common::DEFAULT_PORT);
    let (using_gtid, retrieved_gtid) = match flavor {
        DbFlavor::MariaDb => (
            text(row, &["Using_Gtid"]).map(|v| v != "No").unwrap_or(false),
            parse_gtid(text(row, &["Gtid_IO_Pos"])),
        ),
        DbFlavor::MySql => (
            text(row, &["Auto_Position"]).map(|v| v == "1").unwrap_or(false),
            parse_gtid(text(row, &["Retrieved_Gtid_Set"])),
        ),
    };
    let executed_gtid = match flavor {
        DbFlavor::MariaDb => executed_gtid,
        DbFlavor::MySql => parse_gtid(text(row, &["Executed_Gtid_Set"])),
    };

    let status = ReplicationStatus {
        source: HostPort::new(host, port),
        source_server_id: text(row, &["Master_Server_Id", "Source_Server_Id"]).and_then(|v| v.parse().ok()),
        io_state: IoThreadState::parse(
            &text(row, &["Slave_IO_Running", "Replica_IO_Running"]).unwrap_or_default(),
        ),
        sql_running: text(row, &["Slave_SQL_Running", "Replica_SQL_Running"]).as_deref() == Some("Yes"),
        seconds_behind: text(row, &["Seconds_Behind_Master", "Seconds_Behind_Source"])
            .and_then(|v| v.parse().ok()),
        using_gtid,
        retrieved_gtid,
        executed_gtid,
        read_coords: coords(
            row,
            &["Master_Log_File", "Source_Log_File"],
            &["Read_Master_Log_Pos", "Read_Source_Log_Pos"],
        ),
        exec_coords: coords(
            row,
            &["Relay_Master_Log_File", "Relay_Source_Log_File"],
            &["Exec_Master_Log_Pos", "Exec_Source_Log_Pos"],
        ),
        last_io_error: text(row, &["Last_IO_Error"]).unwrap_or_default(),
        last_sql_error: text(row, &["Last_SQL_Error"]).unwrap_or_default(),
    };
    let filters = ReplicationFilters {
        do_db: text(row, &["Replicate_Do_DB"]).unwrap_or_default(),
        ignore_db: text(row, &["Replicate_Ignore_DB"]).unwrap_or_default(),
        do_table: text(row, &["Replicate_Do_Table"]).unwrap_or_default(),
        ignore_table: text(row, &["Replicate_Ignore_Table"]).unwrap_or_default(),
        wild_do_table: text(row, &["Replicate_Wild_Do_Table"]).unwrap_or_default(),
        wild_ignore_table: text(row, &["Replicate_Wild_Ignore_Table"]).unwrap_or_default(),
    };
    (status, filters)
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// 复制语句的方言: 发行版加上版本决定的关键字
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Dialect {
    flavor: DbFlavor,
    /// `SHOW/START/STOP REPLICA`,MySQL 8.0.22 起
    replica_keyword: bool,
    /// `CHANGE REPLICATION SOURCE TO`,MySQL 8.0.23 起
    source_keyword: bool,
}

impl Dialect {
    fn detect(version: &str) -> Self {
        let flavor = DbFlavor::from_version(version);
        let v = parse_version(version);
        match flavor {
            // MariaDB 所有版本都接受 SLAVE 写法
            DbFlavor::MariaDb => Self { flavor, ..Self::default() },
            DbFlavor::MySql => Self {
                flavor,
                replica_keyword: v >= (8, 0, 22),
                source_keyword: v >= (8, 0, 23),
            },
        }
    }

    /// 把模板中的 `{}` 换成 REPLICA 或 SLAVE
    fn replica_sql(&self, template: &str) -> String {
        template.replace("{}", if self.replica_keyword { "REPLICA" } else { "SLAVE" })
    }
}

/// "8.0.21-log" -> (8, 0, 21),无法解析的部分记为 0
fn parse_version(version: &str) -> (u32, u32, u32) {
    let mut parts = version
        .split(|c: char| !c.is_ascii_digit())
        .take(3)
        .map(|p| p.parse().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

/// 生成 CHANGE MASTER / CHANGE REPLICATION SOURCE 语句
fn change_source_sql(dialect: Dialect, spec: &SourceSpec) -> String {
    match dialect.flavor {
        DbFlavor::MySql if !dialect.source_keyword => {
            let mut sql = format!(
                "CHANGE MASTER TO MASTER_HOST={}, MASTER_PORT={}, MASTER_USER={}, MASTER_PASSWORD={}, MASTER_CONNECT_RETRY={}",
                quote(&spec.source.host),
                spec.source.port,
                quote(&spec.user),
                quote(&spec.password),
                spec.connect_retry
            );
            match (&spec.coords, spec.use_gtid) {
                (_, true) => sql.push_str(", MASTER_AUTO_POSITION=1"),
                (Some(c), false) => sql.push_str(&format!(
                    ", MASTER_LOG_FILE={}, MASTER_LOG_POS={}",
                    quote(&c.file),
                    c.pos
                )),
                (None, false) => {}
            }
            sql
        }
        DbFlavor::MariaDb => {
            let mut sql = format!(
                "CHANGE MASTER TO MASTER_HOST={}, MASTER_PORT={}, MASTER_USER={}, MASTER_PASSWORD={}, MASTER_CONNECT_RETRY={}",
                quote(&spec.source.host),
                spec.source.port,
                quote(&spec.user),
                quote(&spec.password),
                spec.connect_retry
            );
            match (&spec.coords, spec.use_gtid) {
                (_, true) => sql.push_str(", MASTER_USE_GTID=slave_pos"),
                (Some(c), false) => sql.push_str(&format!(
                    ", MASTER_LOG_FILE={}, MASTER_LOG_POS={}",
                    quote(&c.file),
                    c.pos
                )),
                (None, false) => {}
            }
            sql
        }
        DbFlavor::MySql => {
            let mut sql = format!(
                "CHANGE REPLICATION SOURCE TO SOURCE_HOST={}, SOURCE_PORT={}, SOURCE_USER={}, SOURCE_PASSWORD={}, SOURCE_CONNECT_RETRY={}",
                quote(&spec.source.host),
                spec.source.port,
                quote(&spec.user),
                quote(&spec.password),
                spec.connect_retry
            );
            match (&spec.coords, spec.use_gtid) {
                (_, true) => sql.push_str(", SOURCE_AUTO_POSITION=1"),
                (Some(c), false) => sql.push_str(&format!(
                    ", SOURCE_LOG_FILE={}, SOURCE_LOG_POS={}",
                    quote(&c.file),
                    c.pos
                )),
                (None, false) => {}
            }
            sql
        }
    }
}

/// 日志中隐藏密码
fn redact(sql: &str) -> String {
    for key in ["MASTER_PASSWORD=", "SOURCE_PASSWORD="] {
        if let Some(start) = sql.find(key) {
            let rest = &sql[start + key.len()..];
            let end = rest.find(", ").unwrap_or(rest.len());
            return format!("{}{}'****'{}", &sql[..start], key, &rest[end..]);
        }
    }
    sql.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(use_gtid: bool) -> SourceSpec {
        SourceSpec {
            source: HostPort::new("db2", 3306),
            user: "repl".to_string(),
            password: "pa'ss".to_string(),
            use_gtid,
            connect_retry: 10,
            coords: Some(BinlogCoords::new("mysql-bin.000003", 1234)),
        }
    }

    #[test]
    fn test_change_source_mariadb_gtid() {
        let sql = change_source_sql(Dialect::detect("10.11.6-MariaDB-log"), &spec(true));
        assert_eq!(
            sql,
            "CHANGE MASTER TO MASTER_HOST='db2', MASTER_PORT=3306, MASTER_USER='repl', MASTER_PASSWORD='pa\\'ss', MASTER_CONNECT_RETRY=10, MASTER_USE_GTID=slave_pos"
        );
    }

    #[test]
    fn test_change_source_mysql_file_pos() {
        let sql = change_source_sql(Dialect::detect("8.0.36"), &spec(false));
        assert!(sql.starts_with("CHANGE REPLICATION SOURCE TO SOURCE_HOST='db2'"));
        assert!(sql.ends_with("SOURCE_LOG_FILE='mysql-bin.000003', SOURCE_LOG_POS=1234"));
    }

    #[test]
    fn test_old_mysql_uses_slave_syntax() {
        let old = Dialect::detect("8.0.21-log");
        assert_eq!(old.flavor, DbFlavor::MySql);
        assert_eq!(old.replica_sql("SHOW {} STATUS"), "SHOW SLAVE STATUS");
        let sql = change_source_sql(old, &spec(true));
        assert!(sql.starts_with("CHANGE MASTER TO MASTER_HOST='db2'"));
        assert!(sql.ends_with(", MASTER_AUTO_POSITION=1"));

        let mid = Dialect::detect("8.0.22");
        assert_eq!(mid.replica_sql("STOP {}"), "STOP REPLICA");
        assert!(change_source_sql(mid, &spec(true)).starts_with("CHANGE MASTER TO"));

        assert_eq!(Dialect::detect("5.7.44-log").replica_sql("START {}"), "START SLAVE");
        assert_eq!(Dialect::detect("10.11.6-MariaDB").replica_sql("RESET {} ALL"), "RESET SLAVE ALL");
        assert_eq!(Dialect::detect("8.4.0").replica_sql("RESET {} ALL"), "RESET REPLICA ALL");
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("8.0.36-0ubuntu0.22.04.1"), (8, 0, 36));
        assert_eq!(parse_version("10.5"), (10, 5, 0));
        assert_eq!(parse_version("garbage"), (0, 0, 0));
    }

    #[test]
    fn test_redact_password() {
        let sql = change_source_sql(Dialect::detect("10.11.6-MariaDB-log"), &spec(true));
        let redacted = redact(&sql);
        assert!(redacted.contains("MASTER_PASSWORD='****', MASTER_CONNECT_RETRY=10"));
        assert!(!redacted.contains("pa\\'ss"));
    }

    #[test]
    fn test_map_error_kinds() {
        let denied = mysql_async::Error::Server(mysql_async::ServerError {
            code: 1045,
            message: "Access denied for user 'repman'".to_string(),
            state: "28000".to_string(),
        });
        assert!(matches!(map_error(denied), ProbeError::AuthFailure(_)));
        let perm = mysql_async::Error::Server(mysql_async::ServerError {
            code: 1227,
            message: "Access denied; you need the SUPER privilege".to_string(),
            state: "42000".to_string(),
        });
        assert!(matches!(map_error(perm), ProbeError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_tcp_ping_closed_port() {
        let driver = MysqlDriver::new(&ClusterConfig::default());
        // 先绑定再释放,拿到一个当前无人监听的端口
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!driver.tcp_ping(&HostPort::new("127.0.0.1", port), Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn test_tcp_ping_open_port() {
        let driver = MysqlDriver::new(&ClusterConfig::default());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(driver.tcp_ping(&HostPort::new("127.0.0.1", port), Duration::from_secs(1)).await);
    }
}
