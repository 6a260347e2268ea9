//! API 令牌认证模块
//!
//! 本模块实现基于 Bearer 令牌的访问控制:
//! - 配置中只保存令牌的 SHA-256 摘要(Base64 编码)
//! - 每个令牌绑定用户名、可访问的集群列表和权限集合
//! - 权限分为 read / write / arbitration 三类

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// 权限
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Arbitration,
}

/// `[[tokens]]` 配置项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TokenConfig {
    pub user: String,
    /// 令牌的 SHA-256 摘要 (Base64)
    pub token_sha256: String,
    /// 可访问的集群,`*` 表示全部
    #[serde(default)]
    pub clusters: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

/// 已认证的调用方
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user: String,
    clusters: Vec<String>,
    permissions: Vec<Permission>,
}

impl Caller {
    /// 是否可对指定集群执行某类操作
    pub fn allows(&self, cluster: Option<&str>, permission: Permission) -> bool {
        if !self.permissions.contains(&permission) {
            return false;
        }
        match cluster {
            None => true,
            Some(name) => self.clusters.iter().any(|c| c == "*" || c == name),
        }
    }
}

/// 令牌注册表
#[derive(Debug, Default)]
pub struct TokenRegistry {
    /// 摘要 -> 调用方
    by_hash: HashMap<String, Caller>,
}

impl TokenRegistry {
    pub fn new(tokens: &[TokenConfig]) -> Self {
        let by_hash = tokens
            .iter()
            .map(|t| {
                (
                    t.token_sha256.clone(),
                    Caller {
                        user: t.user.clone(),
                        clusters: t.clusters.clone(),
                        permissions: t.permissions.clone(),
                    },
                )
            })
            .collect();
        Self { by_hash }
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    /// 用明文令牌查找调用方
    pub fn authenticate(&self, token: &str) -> Option<&Caller> {
        self.by_hash.get(&hash_token(token))
    }

    /// 解析 `Authorization: Bearer <token>` 头
    pub fn from_header(&self, header: Option<&str>) -> Option<&Caller> {
        let token = header?.strip_prefix("Bearer ")?.trim();
        if token.is_empty() {
            return None;
        }
        self.authenticate(token)
    }
}

/// # Brief
/// 计算令牌摘要
///
/// SHA-256 后以 Base64 编码,与配置文件中的 `token-sha256` 对应。
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    BASE64.encode(hasher.finalize())
}
