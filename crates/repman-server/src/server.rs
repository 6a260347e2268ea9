use crate::api::{self, ApiState};
use crate::arbitrator::{self, ArbitratorService};
use crate::auth::TokenRegistry;
use crate::config::DaemonConfig;
use crate::network::bind_listener;
use crate::{ServerError, ServerResult};
use repman_cluster::{Arbitrator, HttpArbitrator, Supervisor, SupervisorContext};
use std::sync::Arc;
use tracing::{info, warn};

/// 监控守护进程: 集群监控 + HTTP 接口 + 心跳
pub struct Server {
    config: DaemonConfig,
    supervisor: Arc<Supervisor>,
    tokens: Arc<TokenRegistry>,
    start_time: std::time::Instant,
}

impl Server {
    pub fn new(config: DaemonConfig) -> ServerResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.server.datadir)?;

        let arbitration = config.arbitration.clone();
        let arbitrator: Option<Arc<dyn Arbitrator>> =
            if arbitration.enabled || !arbitration.peers.is_empty() {
                Some(Arc::new(HttpArbitrator::new(&arbitration)))
            } else {
                None
            };
        let ctx = Arc::new(SupervisorContext::new(
            arbitration,
            arbitrator,
            Some(config.server.datadir.clone()),
        ));
        info!(uuid = %ctx.uuid, datadir = ?config.server.datadir, "Supervisor context created");

        let tokens = Arc::new(TokenRegistry::new(&config.tokens));
        if tokens.is_empty() {
            warn!("No API tokens configured, only public endpoints will answer");
        }

        let supervisor = Supervisor::with_mysql(ctx, config.clusters.clone());
        Ok(Self {
            config,
            supervisor,
            tokens,
            start_time: std::time::Instant::now(),
        })
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// 启动监控并服务 API,直到收到 ctrl-c
    pub async fn run(self: Arc<Self>) -> ServerResult<()> {
        self.supervisor.start()?;
        info!(clusters = ?self.supervisor.cluster_names(), "Cluster monitors started");

        let heartbeat = tokio::spawn(self.supervisor.clone().run_heartbeat_loop());

        let listener = bind_listener(&self.config.server.bind, self.config.server.port)?;
        info!("Replication manager API listening on {}:{}", self.config.server.bind, self.config.server.port);

        let app = api::router(ApiState::new(self.supervisor.clone(), self.tokens.clone()));
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        self.shutdown().await;
        heartbeat.abort();
        served.map_err(|e| ServerError::Internal(format!("API server: {}", e)))
    }

    pub async fn shutdown(&self) {
        info!(uptime_secs = self.start_time.elapsed().as_secs(), "Shutting down supervisor...");
        self.supervisor.shutdown().await;
    }
}

/// # Brief
/// 运行独立的仲裁服务
///
/// # Arguments
/// * `bind` - 绑定地址
/// * `port` - 监听端口
pub async fn run_arbitrator(bind: &str, port: u16) -> ServerResult<()> {
    let listener = bind_listener(bind, port)?;
    info!("Arbitrator listening on {}:{}", bind, port);
    let app = arbitrator::router(Arc::new(ArbitratorService::new()));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ServerError::Internal(format!("arbitrator: {}", e)))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}

#[cfg(test)]
mod tests {
    use super::*;
    use repman_common::ClusterConfig;

    #[tokio::test]
    async fn test_new_creates_datadir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DaemonConfig::default();
        config.server.datadir = dir.path().join("state");
        config.clusters.insert(
            "c1".to_string(),
            ClusterConfig {
                db_servers_hosts: vec!["127.0.0.1:1".to_string()],
                ..Default::default()
            },
        );
        let server = Server::new(config).unwrap();
        assert!(dir.path().join("state").is_dir());
        assert!(server.supervisor().cluster_names().is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = DaemonConfig::default();
        config.arbitration.enabled = true;
        assert!(matches!(Server::new(config), Err(ServerError::Config(_))));
    }
}
