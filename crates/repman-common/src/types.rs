//! 公共类型定义模块
//!
//! 定义复制拓扑使用的核心类型:
//! - HostPort: 数据库地址(默认端口 3306)
//! - GtidSet: MariaDB (`domain-server-seq`) 与 MySQL (`uuid:1-100`) 两种写法的 GTID 集合
//! - BinlogCoords: binlog 文件名 + 位置
//! - ReplicationPosition: 候选者排序使用的复制进度

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{RepmanError, RepmanResult};

/// MySQL/MariaDB 默认端口
pub const DEFAULT_PORT: u16 = 3306;

/// 数据库地址
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// 解析地址
    ///
    /// 支持 `host`、`host:port` 与 `[v6addr]:port` 三种写法,缺省端口为 3306。
    pub fn parse(s: &str) -> RepmanResult<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(RepmanError::InvalidAddress("empty address".to_string()));
        }

        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| RepmanError::InvalidAddress(s.to_string()))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => parse_port(p, s)?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(RepmanError::InvalidAddress(s.to_string())),
            };
            return Ok(Self::new(host, port));
        }

        match s.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                if host.is_empty() {
                    return Err(RepmanError::InvalidAddress(s.to_string()));
                }
                Ok(Self::new(host, parse_port(port, s)?))
            }
            _ => Ok(Self::new(s, DEFAULT_PORT)),
        }
    }

    /// 用于 URL 与条件键的形式 `host:port`
    pub fn url(&self) -> String {
        self.to_string()
    }
}

fn parse_port(p: &str, whole: &str) -> RepmanResult<u16> {
    p.parse::<u16>()
        .map_err(|_| RepmanError::InvalidAddress(format!("bad port in {}", whole)))
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for HostPort {
    type Err = RepmanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// GTID 集合中的单个域
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidEntry {
    /// MariaDB 写入该事务的 server_id;MySQL 写法为 None
    pub server_id: Option<u64>,
    /// 该域内最大序号
    pub seq: u64,
}

/// GTID 集合
///
/// 每个域(MariaDB domain id 或 MySQL source uuid)只保留最大序号,
/// 足以比较两个位点谁更靠前。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidSet {
    domains: BTreeMap<String, GtidEntry>,
}

impl GtidSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 解析 GTID 字符串
    ///
    /// # Arguments
    /// * `s` - `0-1-100,1-2-5` 或 `3E11FA47-...:1-100:120-130,...`
    pub fn parse(s: &str) -> RepmanResult<Self> {
        let mut set = Self::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if let Some((uuid, intervals)) = part.split_once(':') {
                let seq = intervals
                    .split(':')
                    .filter_map(|iv| iv.rsplit('-').next())
                    .filter_map(|end| end.trim().parse::<u64>().ok())
                    .max()
                    .ok_or_else(|| RepmanError::InvalidGtid(part.to_string()))?;
                set.insert(uuid.trim().to_ascii_lowercase(), None, seq);
            } else {
                let fields: Vec<&str> = part.split('-').collect();
                if fields.len() != 3 {
                    return Err(RepmanError::InvalidGtid(part.to_string()));
                }
                let parse = |f: &str| {
                    f.parse::<u64>()
                        .map_err(|_| RepmanError::InvalidGtid(part.to_string()))
                };
                let domain = parse(fields[0])?;
                let server_id = parse(fields[1])?;
                let seq = parse(fields[2])?;
                set.insert(domain.to_string(), Some(server_id), seq);
            }
        }
        Ok(set)
    }

    /// 记录一个域的序号,保留较大者
    pub fn insert(&mut self, domain: String, server_id: Option<u64>, seq: u64) {
        match self.domains.get(&domain) {
            Some(existing) if existing.seq >= seq => {}
            _ => {
                self.domains.insert(domain, GtidEntry { server_id, seq });
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn seq(&self, domain: &str) -> Option<u64> {
        self.domains.get(domain).map(|e| e.seq)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &GtidEntry)> {
        self.domains.iter()
    }

    /// 所有域序号之和
    pub fn aggregate(&self) -> u64 {
        self.domains.values().map(|e| e.seq).sum()
    }

    /// 判断 self 是否包含 other 的全部事务
    pub fn is_superset_of(&self, other: &GtidSet) -> bool {
        other.domains.iter().all(|(domain, entry)| {
            self.domains
                .get(domain)
                .map(|mine| mine.seq >= entry.seq)
                .unwrap_or(false)
        })
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (domain, entry) in &self.domains {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            match entry.server_id {
                Some(server_id) => write!(f, "{}-{}-{}", domain, server_id, entry.seq)?,
                None => write!(f, "{}:1-{}", domain, entry.seq)?,
            }
        }
        Ok(())
    }
}

/// binlog 坐标
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogCoords {
    pub file: String,
    pub pos: u64,
}

impl BinlogCoords {
    pub fn new(file: impl Into<String>, pos: u64) -> Self {
        Self {
            file: file.into(),
            pos,
        }
    }

    /// 文件名后缀序号,如 `mysql-bin.000042` -> 42
    pub fn file_index(&self) -> u64 {
        self.file
            .rsplit('.')
            .next()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0)
    }
}

impl PartialOrd for BinlogCoords {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BinlogCoords {
    fn cmp(&self, other: &Self) -> Ordering {
        self.file_index()
            .cmp(&other.file_index())
            .then_with(|| self.file.cmp(&other.file))
            .then_with(|| self.pos.cmp(&other.pos))
    }
}

impl fmt::Display for BinlogCoords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.pos)
    }
}

/// 复制进度
///
/// 有 GTID 时按 GTID 比较(严格超集优先,否则比较序号总和),
/// 否则按 binlog 坐标比较。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationPosition {
    pub gtid: GtidSet,
    pub coords: Option<BinlogCoords>,
}

impl ReplicationPosition {
    pub fn new(gtid: GtidSet, coords: Option<BinlogCoords>) -> Self {
        Self { gtid, coords }
    }

    /// 比较两个位点的先后,Greater 表示 self 更靠前
    pub fn compare_advance(&self, other: &Self) -> Ordering {
        if !self.gtid.is_empty() || !other.gtid.is_empty() {
            let ahead = self.gtid.is_superset_of(&other.gtid);
            let behind = other.gtid.is_superset_of(&self.gtid);
            let by_gtid = match (ahead, behind) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => self.gtid.aggregate().cmp(&other.gtid.aggregate()),
            };
            if by_gtid != Ordering::Equal {
                return by_gtid;
            }
        }
        self.coords.cmp(&other.coords)
    }

    /// self 是否已经追上 target
    pub fn has_reached(&self, target: &Self) -> bool {
        if !target.gtid.is_empty() {
            return self.gtid.is_superset_of(&target.gtid);
        }
        match (&self.coords, &target.coords) {
            (Some(mine), Some(theirs)) => mine >= theirs,
            (_, None) => true,
            (None, Some(_)) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_host_port_parse() {
        assert_eq!(HostPort::parse("db1").unwrap(), HostPort::new("db1", 3306));
        assert_eq!(
            HostPort::parse("10.0.0.2:3307").unwrap(),
            HostPort::new("10.0.0.2", 3307)
        );
        assert_eq!(
            HostPort::parse("[::1]:3310").unwrap(),
            HostPort::new("::1", 3310)
        );
        assert_eq!(HostPort::new("::1", 3310).url(), "[::1]:3310");
        assert!(HostPort::parse("db1:notaport").is_err());
        assert!(HostPort::parse("").is_err());
    }

    #[test]
    fn test_gtid_parse_mariadb() {
        let set = GtidSet::parse("0-1-100, 1-2-7").unwrap();
        assert_eq!(set.seq("0"), Some(100));
        assert_eq!(set.seq("1"), Some(7));
        assert_eq!(set.aggregate(), 107);
        assert_eq!(set.to_string(), "0-1-100,1-2-7");
    }

    #[test]
    fn test_gtid_parse_mysql() {
        let set = GtidSet::parse(
            "3E11FA47-71CA-11E1-9E33-C80AA9429562:1-5:11-18,\n4a6b7d9e-0000-0000-0000-000000000001:1-3",
        )
        .unwrap();
        assert_eq!(set.seq("3e11fa47-71ca-11e1-9e33-c80aa9429562"), Some(18));
        assert_eq!(set.seq("4a6b7d9e-0000-0000-0000-000000000001"), Some(3));
    }

    #[test]
    fn test_gtid_parse_invalid() {
        assert!(GtidSet::parse("0-1").is_err());
        assert!(GtidSet::parse("a-b-c").is_err());
        assert!(GtidSet::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_gtid_superset() {
        let a = GtidSet::parse("0-1-100,1-1-5").unwrap();
        let b = GtidSet::parse("0-1-90").unwrap();
        assert!(a.is_superset_of(&b));
        assert!(!b.is_superset_of(&a));
        assert!(a.is_superset_of(&GtidSet::new()));
    }

    #[test]
    fn test_binlog_coords_ordering() {
        let a = BinlogCoords::new("mysql-bin.000009", 900);
        let b = BinlogCoords::new("mysql-bin.000010", 4);
        assert!(b > a);
        assert!(BinlogCoords::new("mysql-bin.000010", 5) > b);
    }

    #[test]
    fn test_position_compare() {
        let ahead = ReplicationPosition::new(GtidSet::parse("0-1-100").unwrap(), None);
        let behind = ReplicationPosition::new(GtidSet::parse("0-1-40").unwrap(), None);
        assert_eq!(ahead.compare_advance(&behind), Ordering::Greater);
        assert!(ahead.has_reached(&behind));
        assert!(!behind.has_reached(&ahead));

        let file_a = ReplicationPosition::new(GtidSet::new(), Some(BinlogCoords::new("b.000002", 10)));
        let file_b = ReplicationPosition::new(GtidSet::new(), Some(BinlogCoords::new("b.000001", 99)));
        assert_eq!(file_a.compare_advance(&file_b), Ordering::Greater);
    }

    proptest! {
        #[test]
        fn test_superset_never_sorts_behind(base in 0u64..1000, extra in 0u64..1000, other in 0u64..50) {
            let small = GtidSet::parse(&format!("0-1-{}", base)).unwrap();
            let big = GtidSet::parse(&format!("0-1-{},1-1-{}", base + extra, other + 1)).unwrap();
            let a = ReplicationPosition::new(big, None);
            let b = ReplicationPosition::new(small, None);
            prop_assert_eq!(a.compare_advance(&b), Ordering::Greater);
        }
    }
}
