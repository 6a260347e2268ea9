//! 复制管理守护进程
//!
//! - **api**: HTTP/JSON 接口,令牌鉴权后转发到集群操作
//! - **arbitrator**: 内存仲裁服务,供多个监控进程申请选举
//! - **config**: TOML 配置加载与校验
//! - **server**: 进程生命周期与优雅退出

pub mod api;
pub mod arbitrator;
pub mod auth;
pub mod config;
pub mod network;
pub mod server;

pub use auth::{hash_token, Permission, TokenRegistry};
pub use config::DaemonConfig;

use repman_cluster::ClusterError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Cannot bind: {0}")]
    Bind(String),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ServerResult<T> = Result<T, ServerError>;

pub fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true))
        .with(filter)
        .init();
}
