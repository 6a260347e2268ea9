//! MySQL/MariaDB 复制集群监控模块
//!
//! 本模块实现复制集群的监控与主库切换:
//! - **监控循环**: 每个集群一个 tick 任务,并发探测所有节点
//! - **拓扑识别**: 主从、多级从库、多主、环形、Galera 等拓扑推导
//! - **故障检测**: 连续失败阈值、TCP ping 交叉验证、切换后冷却
//! - **故障转移**: 分阶段的 switchover/failover 流程,带回滚与部分成功语义
//! - **状态机与 SLA**: OPENED/RESOLV 条件差异,三项可用时间累计
//! - **仲裁**: 对端心跳与外部仲裁,避免多个监控进程同时切换
//!
//! # 驱动
//!
//! - `MysqlDriver`: 基于 mysql_async 的真实数据库驱动
//! - `SimFleet`: 内存模拟集群,用于测试与演练

pub mod arbitrator;
pub mod cluster;
pub mod detector;
pub mod driver;
pub mod error;
pub mod failover;
pub mod gate;
pub mod monitor;
pub mod mysql;
pub mod persist;
pub mod proxy;
pub mod server;
pub mod sim;
pub mod state;
pub mod supervisor;
pub mod topology;

pub use arbitrator::{
    Arbitrator, ArbitrationRequest, ArbitrationResponse, HeartbeatRecord, HttpArbitrator, SupervisorStatus,
};
pub use cluster::{Alerts, AlertView, Cluster, ClusterStatus, ClusterView, SlaView};
pub use driver::{ServerDriver, ServerSnapshot};
pub use error::{
    ArbitrationError, ClusterError, ClusterResult, FailoverError, FailoverErrorKind, FailoverResult,
    FailoverStage, GateRejection, ProbeError,
};
pub use failover::{FailoverReport, PromotionKind};
pub use gate::{Action, ActionGate};
pub use mysql::MysqlDriver;
pub use persist::Crash;
pub use server::{ServerRole, ServerState, ServerView};
pub use supervisor::{DriverFactory, Supervisor, SupervisorContext};
pub use topology::TopologyKind;
