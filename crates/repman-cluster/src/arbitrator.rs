//! 仲裁客户端
//!
//! 多个监控进程同时看护同一批集群时,通过两种手段避免同时执行故障转移:
//! - **对端心跳**: 定期拉取对端的心跳记录,决定本进程是 Active 还是 Standby
//! - **外部仲裁**: 所有对端都失联时,向仲裁服务申请授权,未获授权即进入 split-brain

use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use repman_common::ArbitrationConfig;

use crate::error::ArbitrationError;

/// 心跳请求携带密钥的头
pub const SECRET_HEADER: &str = "X-Arbitration-Secret";

/// 监控进程状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorStatus {
    #[default]
    Active,
    Standby,
}

/// 心跳记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HeartbeatRecord {
    pub uuid: String,
    pub uid: u64,
    pub secret: String,
    pub status: SupervisorStatus,
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub primary_url: Option<String>,
    #[serde(default)]
    pub healthy: u32,
    #[serde(default)]
    pub failed: u32,
}

/// 选举请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbitrationRequest {
    pub uuid: String,
    pub cluster: String,
    pub secret: String,
    pub proposed_action: String,
}

/// 选举应答
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbitrationResponse {
    pub grant: bool,
    #[serde(default)]
    pub reason: String,
}

/// 仲裁通信接口
#[async_trait]
pub trait Arbitrator: Send + Sync {
    /// 拉取对端心跳
    async fn fetch_peer(&self, peer: &str) -> Result<HeartbeatRecord, ArbitrationError>;

    /// 向仲裁服务上报心跳
    async fn report(&self, heartbeat: &HeartbeatRecord) -> Result<(), ArbitrationError>;

    /// 申请选举授权
    async fn request_election(
        &self,
        request: &ArbitrationRequest,
    ) -> Result<ArbitrationResponse, ArbitrationError>;
}

/// 基于 HTTP 的仲裁客户端
pub struct HttpArbitrator {
    client: Client,
    arbitrator_url: Option<String>,
    secret: String,
    timeout: Duration,
}

impl HttpArbitrator {
    pub fn new(config: &ArbitrationConfig) -> Self {
        Self {
            client: Client::new(),
            arbitrator_url: config
                .arbitrator_url
                .as_ref()
                .map(|u| u.trim_end_matches('/').to_string()),
            secret: config.secret.clone(),
            timeout: config.ticker(),
        }
    }

    fn arbitrator(&self) -> Result<&str, ArbitrationError> {
        self.arbitrator_url
            .as_deref()
            .ok_or(ArbitrationError::NotConfigured)
    }

    async fn decode<T: DeserializeOwned>(
        url: &str,
        response: reqwest::Response,
    ) -> Result<T, ArbitrationError> {
        let status = response.status();
        if !status.is_success() {
            return Err(ArbitrationError::Status(url.to_string(), status.as_u16()));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ArbitrationError::Decode(url.to_string(), e.to_string()))
    }
}

#[async_trait]
impl Arbitrator for HttpArbitrator {
    async fn fetch_peer(&self, peer: &str) -> Result<HeartbeatRecord, ArbitrationError> {
        let url = if peer.starts_with("http") {
            format!("{}/api/heartbeat", peer.trim_end_matches('/'))
        } else {
            format!("http://{}/api/heartbeat", peer)
        };
        debug!("GET {}", url);
        let response = self
            .client
            .get(&url)
            .header(SECRET_HEADER, &self.secret)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ArbitrationError::Transport(url.clone(), e.to_string()))?;
        Self::decode(&url, response).await
    }

    async fn report(&self, heartbeat: &HeartbeatRecord) -> Result<(), ArbitrationError> {
        let url = format!("{}/heartbeat", self.arbitrator()?);
        let response = self
            .client
            .post(&url)
            .json(heartbeat)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ArbitrationError::Transport(url.clone(), e.to_string()))?;
        if !response.status().is_success() {
            return Err(ArbitrationError::Status(url, response.status().as_u16()));
        }
        Ok(())
    }

    async fn request_election(
        &self,
        request: &ArbitrationRequest,
    ) -> Result<ArbitrationResponse, ArbitrationError> {
        let url = format!("{}/arbitrator", self.arbitrator()?);
        let response = self
            .client
            .post(&url)
            .json(request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ArbitrationError::Transport(url.clone(), e.to_string()))?;
        Self::decode(&url, response).await
    }
}

/// 对端存活跟踪
#[derive(Debug, Default)]
pub struct PeerTracker {
    /// 对端 -> (最近一次应答时间, 应答内容)
    seen: HashMap<String, (i64, HeartbeatRecord)>,
}

impl PeerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, peer: &str, record: HeartbeatRecord, now: i64) {
        self.seen.insert(peer.to_string(), (now, record));
    }

    /// 在 `down_after` 秒内有应答的对端
    pub fn live<'a>(&'a self, peers: &'a [String], now: i64, down_after: i64) -> Vec<&'a HeartbeatRecord> {
        peers
            .iter()
            .filter_map(|p| self.seen.get(p))
            .filter(|(at, _)| now - *at < down_after)
            .map(|(_, r)| r)
            .collect()
    }
}

/// 根据存活对端决定本进程状态
///
/// 对端 Standby 时本进程保持 Active;对端也是 Active 时 UUID 较小的一方保持 Active。
pub fn resolve_status(our_uuid: &str, live_peers: &[&HeartbeatRecord]) -> SupervisorStatus {
    let outranked = live_peers
        .iter()
        .any(|p| p.status == SupervisorStatus::Active && p.uuid.as_str() < our_uuid);
    if outranked {
        SupervisorStatus::Standby
    } else {
        SupervisorStatus::Active
    }
}
