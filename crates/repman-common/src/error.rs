//! 错误类型定义模块
//!
//! 定义公共层的统一错误类型 RepmanError 和 Result 别名。

use thiserror::Error;

/// 公共层错误类型
#[derive(Error, Debug)]
pub enum RepmanError {
    /// I/O 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 地址格式错误
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// GTID 格式错误
    #[error("Invalid GTID: {0}")]
    InvalidGtid(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// 公共层 Result 类型别名
pub type RepmanResult<T> = Result<T, RepmanError>;
