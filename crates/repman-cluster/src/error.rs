//! 集群错误类型定义
//!
//! - ClusterError: 监控/注册等一般错误
//! - ProbeError: 单台数据库探测失败的种类
//! - GateRejection: 动作闸门拒绝原因
//! - ArbitrationError: 对端心跳与仲裁请求失败
//! - FailoverError: 携带阶段信息的故障转移错误

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use repman_common::RepmanError;

/// 集群操作错误
#[derive(Error, Debug)]
pub enum ClusterError {
    /// 集群已存在
    #[error("Cluster already exists: {0}")]
    AlreadyExists(String),

    /// 集群不存在
    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),

    /// 数据库不存在
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 持久化状态错误
    #[error("State file error: {0}")]
    State(String),

    /// 网络错误
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    /// 仲裁错误
    #[error("Arbitration error: {0}")]
    Arbitration(String),

    /// 代理驱动错误
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// 动作被闸门拒绝
    #[error("Action rejected: {0}")]
    Rejected(#[from] GateRejection),

    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// 内部错误
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<RepmanError> for ClusterError {
    fn from(e: RepmanError) -> Self {
        ClusterError::Config(e.to_string())
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(e: serde_json::Error) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}

/// 集群操作结果类型
pub type ClusterResult<T> = Result<T, ClusterError>;

/// 探测失败种类
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message")]
pub enum ProbeError {
    /// 无法连接
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// 认证失败
    #[error("access denied: {0}")]
    AuthFailure(String),

    /// 监控账号权限不足
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// 协议或查询错误
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// 超时
    #[error("timeout after {0}s")]
    Timeout(u64),
}

impl ProbeError {
    /// 是否计入故障阈值
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, ProbeError::AuthFailure(_))
    }
}

/// 动作闸门拒绝原因
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateRejection {
    #[error("cluster is in maintenance")]
    InMaintenance,

    #[error("a failover is in progress")]
    InFailover,

    #[error("split brain detected")]
    SplitBrain,

    #[error("not permitted: {0}")]
    NotPermitted(String),
}

/// 仲裁通信错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArbitrationError {
    /// 请求未送达或超时
    #[error("request to {0} failed: {1}")]
    Transport(String, String),

    /// 对端返回非 2xx
    #[error("{0} answered HTTP {1}")]
    Status(String, u16),

    /// 应答无法解析
    #[error("invalid answer from {0}: {1}")]
    Decode(String, String),

    /// 未配置仲裁服务
    #[error("no arbitrator configured")]
    NotConfigured,
}

/// 故障转移阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailoverStage {
    Gate,
    LimitCheck,
    ReplicationCheck,
    Arbitration,
    Election,
    SyncWait,
    Promote,
    Repoint,
    OldPrimary,
    Record,
}

impl FailoverStage {
    /// 阶段序号 1..=10
    pub fn number(&self) -> u8 {
        match self {
            FailoverStage::Gate => 1,
            FailoverStage::LimitCheck => 2,
            FailoverStage::ReplicationCheck => 3,
            FailoverStage::Arbitration | FailoverStage::Election => 4,
            FailoverStage::SyncWait => 5,
            FailoverStage::Promote => 6,
            FailoverStage::Repoint => 7,
            FailoverStage::OldPrimary => 8,
            FailoverStage::Record => 9,
        }
    }
}

impl fmt::Display for FailoverStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailoverStage::Gate => "gate",
            FailoverStage::LimitCheck => "limit-check",
            FailoverStage::ReplicationCheck => "replication-check",
            FailoverStage::Arbitration => "arbitration",
            FailoverStage::Election => "election",
            FailoverStage::SyncWait => "sync-wait",
            FailoverStage::Promote => "promote",
            FailoverStage::Repoint => "repoint",
            FailoverStage::OldPrimary => "old-primary",
            FailoverStage::Record => "record",
        };
        f.write_str(name)
    }
}

/// 故障转移失败种类
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum FailoverErrorKind {
    #[error("a failover is already in progress")]
    AlreadyInProgress,

    #[error("cluster is in maintenance")]
    InMaintenance,

    #[error("split brain: {0}")]
    SplitBrain(String),

    #[error("not permitted: {0}")]
    NotPermitted(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("no primary to act on")]
    NoPrimary,

    #[error("primary {0} is not healthy")]
    PrimaryNotHealthy(String),

    #[error("primary {0} is not failed")]
    PrimaryNotFailed(String),

    #[error("replication filters differ: {0}")]
    ReplicationFilterMismatch(String),

    #[error("replication not running on {0}")]
    ReplicationStopped(String),

    #[error("no candidate found in replica list")]
    NoCandidate,

    #[error("server {0} is not electable")]
    CandidateNotElectable(String),

    #[error("long running write on primary: {0}")]
    WriteDrainTimeout(String),

    #[error("candidate did not catch up: {0}")]
    CandidateUnsynced(String),

    #[error("step failed: {0}")]
    StepFailed(String),
}

/// 故障转移错误,携带失败所在阶段
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("failover aborted at stage {stage}: {kind}")]
pub struct FailoverError {
    pub stage: FailoverStage,
    pub kind: FailoverErrorKind,
}

impl FailoverError {
    pub fn new(stage: FailoverStage, kind: FailoverErrorKind) -> Self {
        Self { stage, kind }
    }

    /// 前置条件失败(调用方可修正),其余为执行期失败
    pub fn is_precondition(&self) -> bool {
        !matches!(
            self.kind,
            FailoverErrorKind::StepFailed(_)
                | FailoverErrorKind::CandidateUnsynced(_)
                | FailoverErrorKind::WriteDrainTimeout(_)
        )
    }
}

impl From<GateRejection> for FailoverErrorKind {
    fn from(r: GateRejection) -> Self {
        match r {
            GateRejection::InMaintenance => FailoverErrorKind::InMaintenance,
            GateRejection::InFailover => FailoverErrorKind::AlreadyInProgress,
            GateRejection::SplitBrain => {
                FailoverErrorKind::SplitBrain("peer supervisors unreachable".to_string())
            }
            GateRejection::NotPermitted(reason) => FailoverErrorKind::NotPermitted(reason),
        }
    }
}

/// 故障转移结果类型
pub type FailoverResult<T> = Result<T, FailoverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_numbers() {
        assert_eq!(FailoverStage::Gate.number(), 1);
        assert_eq!(FailoverStage::Promote.number(), 6);
        assert_eq!(FailoverStage::Record.number(), 9);
    }

    #[test]
    fn test_error_display_carries_stage() {
        let err = FailoverError::new(FailoverStage::LimitCheck, FailoverErrorKind::RateLimited("2/2".into()));
        assert_eq!(err.to_string(), "failover aborted at stage limit-check: rate limited: 2/2");
        assert!(err.is_precondition());
        let err = FailoverError::new(FailoverStage::Promote, FailoverErrorKind::StepFailed("x".into()));
        assert!(!err.is_precondition());
    }

    #[test]
    fn test_auth_failure_not_counted() {
        assert!(!ProbeError::AuthFailure("x".into()).counts_as_failure());
        assert!(ProbeError::Unreachable("x".into()).counts_as_failure());
    }
}
