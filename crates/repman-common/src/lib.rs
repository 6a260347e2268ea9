//! 复制管理器公共模块
//!
//! 提供各 crate 共享的基础设施:
//! - **错误类型**: 统一的 RepmanError 和 Result 别名
//! - **复制位点**: host:port 地址、GTID 集合、binlog 坐标
//! - **集群配置**: 每个集群的监控、故障转移与仲裁参数

pub mod config;
pub mod error;
pub mod types;

pub use config::{ArbitrationConfig, ClusterConfig, FailoverMode, ProxyConfig, ProxyKind, ServerSpec};
pub use error::{RepmanError, RepmanResult};
pub use types::*;
