//! 代理协作方接口
//!
//! 故障转移完成后通知前端代理改写流量。调用只是建议性的:
//! 每个调用都有超时,失败只记录日志,不影响故障转移结果。

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use repman_common::{HostPort, ProxyConfig, ProxyKind};

use crate::error::{ClusterError, ClusterResult};

/// 拓扑变更通知内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyChange {
    pub cluster: String,
    pub kind: String,
    pub primary: Option<String>,
    pub replicas: Vec<String>,
}

/// 代理驱动
#[async_trait]
pub trait ProxyDriver: Send + Sync {
    fn kind(&self) -> ProxyKind;

    fn name(&self) -> &str;

    async fn set_primary(&self, host: &str, port: u16) -> ClusterResult<()>;

    async fn set_ready(&self, server: &str, pool: &str) -> ClusterResult<()>;

    async fn set_maintenance(&self, server: &str, pool: &str) -> ClusterResult<()>;

    async fn set_drain(&self, server: &str, pool: &str) -> ClusterResult<()>;

    async fn notify_topology_change(&self, change: &TopologyChange) -> ClusterResult<()>;
}

/// 通过 HTTP 回调通知外部代理
pub struct HttpProxy {
    name: String,
    url: String,
    client: Client,
}

/// 回调事件
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ProxyEvent<'a> {
    SetPrimary { host: &'a str, port: u16 },
    SetReady { server: &'a str, pool: &'a str },
    SetMaintenance { server: &'a str, pool: &'a str },
    SetDrain { server: &'a str, pool: &'a str },
    TopologyChange { topology: &'a TopologyChange },
}

impl HttpProxy {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    async fn post(&self, event: &ProxyEvent<'_>) -> ClusterResult<()> {
        let endpoint = format!("{}/events", self.url);
        debug!(proxy = %self.name, "POST {}", endpoint);
        let response = self
            .client
            .post(&endpoint)
            .json(event)
            .send()
            .await
            .map_err(|e| ClusterError::Proxy(format!("{}: {}", self.name, e)))?;
        if !response.status().is_success() {
            return Err(ClusterError::Proxy(format!(
                "{}: callback returned {}",
                self.name,
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ProxyDriver for HttpProxy {
    fn kind(&self) -> ProxyKind {
        ProxyKind::External
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn set_primary(&self, host: &str, port: u16) -> ClusterResult<()> {
        self.post(&ProxyEvent::SetPrimary { host, port }).await
    }

    async fn set_ready(&self, server: &str, pool: &str) -> ClusterResult<()> {
        self.post(&ProxyEvent::SetReady { server, pool }).await
    }

    async fn set_maintenance(&self, server: &str, pool: &str) -> ClusterResult<()> {
        self.post(&ProxyEvent::SetMaintenance { server, pool }).await
    }

    async fn set_drain(&self, server: &str, pool: &str) -> ClusterResult<()> {
        self.post(&ProxyEvent::SetDrain { server, pool }).await
    }

    async fn notify_topology_change(&self, change: &TopologyChange) -> ClusterResult<()> {
        self.post(&ProxyEvent::TopologyChange { topology: change }).await
    }
}

/// 根据配置创建代理驱动
pub fn build_proxy(config: &ProxyConfig) -> ClusterResult<Arc<dyn ProxyDriver>> {
    match config.kind {
        ProxyKind::External => {
            let url = config.url.as_deref().ok_or_else(|| {
                ClusterError::Config(format!("proxy {} requires an url", config.name))
            })?;
            Ok(Arc::new(HttpProxy::new(config.name.clone(), url)))
        }
        kind => Err(ClusterError::Config(format!(
            "proxy driver {} is not built in, use an external proxy callback",
            kind
        ))),
    }
}

/// 一个集群的全部代理
#[derive(Clone, Default)]
pub struct ProxySet {
    proxies: Vec<Arc<dyn ProxyDriver>>,
}

impl ProxySet {
    pub fn new(proxies: Vec<Arc<dyn ProxyDriver>>) -> Self {
        Self { proxies }
    }

    pub fn from_configs(configs: &[ProxyConfig]) -> ClusterResult<Self> {
        let proxies = configs.iter().map(build_proxy).collect::<ClusterResult<Vec<_>>>()?;
        Ok(Self { proxies })
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub async fn set_primary(&self, primary: &HostPort, timeout: Duration) {
        for proxy in &self.proxies {
            let call = proxy.set_primary(&primary.host, primary.port);
            report(proxy.name(), "set_primary", tokio::time::timeout(timeout, call).await);
        }
    }

    pub async fn set_maintenance(&self, server: &str, pool: &str, on: bool, timeout: Duration) {
        for proxy in &self.proxies {
            let (op, result) = if on {
                ("set_maintenance", tokio::time::timeout(timeout, proxy.set_maintenance(server, pool)).await)
            } else {
                ("set_ready", tokio::time::timeout(timeout, proxy.set_ready(server, pool)).await)
            };
            report(proxy.name(), op, result);
        }
    }

    pub async fn set_drain(&self, server: &str, pool: &str, timeout: Duration) {
        for proxy in &self.proxies {
            let result = tokio::time::timeout(timeout, proxy.set_drain(server, pool)).await;
            report(proxy.name(), "set_drain", result);
        }
    }

    pub async fn notify(&self, change: &TopologyChange, timeout: Duration) {
        for proxy in &self.proxies {
            let result = tokio::time::timeout(timeout, proxy.notify_topology_change(change)).await;
            report(proxy.name(), "notify_topology_change", result);
        }
    }
}

fn report(proxy: &str, op: &str, result: Result<ClusterResult<()>, tokio::time::error::Elapsed>) {
    match result {
        Ok(Ok(())) => debug!(proxy = %proxy, "{} done", op),
        Ok(Err(e)) => warn!(proxy = %proxy, "{} failed: {}", op, e),
        Err(_) => warn!(proxy = %proxy, "{} timed out", op),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recording {
        calls: Mutex<Vec<String>>,
        stall: bool,
    }

    #[async_trait]
    impl ProxyDriver for Recording {
        fn kind(&self) -> ProxyKind {
            ProxyKind::External
        }

        fn name(&self) -> &str {
            "rec"
        }

        async fn set_primary(&self, host: &str, port: u16) -> ClusterResult<()> {
            if self.stall {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            self.calls.lock().push(format!("primary {}:{}", host, port));
            Ok(())
        }

        async fn set_ready(&self, server: &str, _pool: &str) -> ClusterResult<()> {
            self.calls.lock().push(format!("ready {}", server));
            Ok(())
        }

        async fn set_maintenance(&self, server: &str, _pool: &str) -> ClusterResult<()> {
            self.calls.lock().push(format!("maintenance {}", server));
            Ok(())
        }

        async fn set_drain(&self, server: &str, _pool: &str) -> ClusterResult<()> {
            self.calls.lock().push(format!("drain {}", server));
            Ok(())
        }

        async fn notify_topology_change(&self, change: &TopologyChange) -> ClusterResult<()> {
            Err(ClusterError::Proxy(format!("rejected {}", change.cluster)))
        }
    }

    #[test]
    fn test_build_proxy() {
        let external = ProxyConfig {
            kind: ProxyKind::External,
            name: "lb".to_string(),
            url: Some("http://127.0.0.1:9000/".to_string()),
        };
        let proxy = build_proxy(&external).unwrap();
        assert_eq!(proxy.kind(), ProxyKind::External);
        assert_eq!(proxy.name(), "lb");

        let missing = ProxyConfig { url: None, ..external };
        assert!(build_proxy(&missing).is_err());

        let haproxy = ProxyConfig {
            kind: ProxyKind::Haproxy,
            name: "hap".to_string(),
            url: None,
        };
        assert!(matches!(build_proxy(&haproxy), Err(ClusterError::Config(_))));
    }

    #[tokio::test]
    async fn test_failures_and_timeouts_are_advisory() {
        let rec = Arc::new(Recording { calls: Mutex::new(Vec::new()), stall: false });
        let stalled = Arc::new(Recording { calls: Mutex::new(Vec::new()), stall: true });
        let set = ProxySet::new(vec![stalled.clone(), rec.clone()]);

        set.set_primary(&HostPort::new("db2", 3306), Duration::from_millis(20)).await;
        set.set_maintenance("db3:3306", "c1", true, Duration::from_millis(20)).await;
        set.notify(
            &TopologyChange {
                cluster: "c1".to_string(),
                kind: "master-slave".to_string(),
                primary: Some("db2:3306".to_string()),
                replicas: vec![],
            },
            Duration::from_millis(20),
        )
        .await;

        assert_eq!(
            rec.calls.lock().clone(),
            vec!["primary db2:3306".to_string(), "maintenance db3:3306".to_string()]
        );
        assert_eq!(stalled.calls.lock().len(), 1);
    }

    #[test]
    fn test_event_encoding() {
        let json = serde_json::to_value(ProxyEvent::SetPrimary { host: "db2", port: 3306 }).unwrap();
        assert_eq!(json["event"], "set_primary");
        assert_eq!(json["port"], 3306);
    }
}
