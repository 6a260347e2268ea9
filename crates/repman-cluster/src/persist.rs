//! 集群状态持久化
//!
//! 每个集群一个 `<datadir>/<cluster>.json`,先写 `.tmp` 再 rename,保证文件总是完整的。
//! 启动时文件缺失则从零开始,文件损坏则拒绝启动。

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{ClusterError, ClusterResult};
use crate::state::{ConditionMap, Sla};

/// 一次故障转移留下的记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Crash {
    pub old_primary_url: String,
    /// 旧主库最后已知的 GTID
    pub old_primary_gtid: String,
    /// 旧主库最后已知的 binlog 坐标
    pub old_primary_coords: Option<String>,
    pub elected_primary_url: String,
    pub unixtime: i64,
}

/// 持久化内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub sla: Sla,
    pub failover_ctr: u32,
    pub last_failover: Option<i64>,
    pub last_promotion: Option<i64>,
    /// 上一次 tick 结束时打开的条件
    pub conditions: ConditionMap,
    #[serde(default)]
    pub crashes: Vec<Crash>,
}

/// 状态文件
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(datadir: impl AsRef<Path>, cluster: &str) -> Self {
        Self {
            path: datadir.as_ref().join(format!("{}.json", cluster)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取状态,文件不存在时返回 None
    pub fn load(&self) -> ClusterResult<Option<PersistedState>> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No state file at {:?}, starting fresh", self.path);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let state = serde_json::from_slice(&raw)
            .map_err(|e| ClusterError::State(format!("{:?}: {}", self.path, e)))?;
        info!("Loaded cluster state from {:?}", self.path);
        Ok(Some(state))
    }

    /// 原子写入
    pub fn save(&self, state: &PersistedState) -> ClusterResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let encoded = serde_json::to_vec_pretty(state)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!("State saved to {:?}", self.path);
        Ok(())
    }

    pub fn remove(&self) -> ClusterResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
