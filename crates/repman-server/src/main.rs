use clap::{Parser, Subcommand};
use repman_server::server::{run_arbitrator, Server};
use repman_server::DaemonConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "repman-server")]
#[command(version)]
#[command(about = "Replication manager for MySQL/MariaDB primary/replica clusters")]
struct Args {
    #[arg(short, long, env = "REPMAN_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long)]
    log_level: Option<String>,

    #[arg(short, long)]
    datadir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 监控集群并提供 HTTP 接口
    Monitor,
    /// 运行仲裁服务
    Arbitrator {
        #[arg(short, long, default_value = "0.0.0.0")]
        bind: String,

        #[arg(short, long, default_value_t = 10001)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => DaemonConfig::from_file(path)?,
        None => DaemonConfig::default(),
    };
    config.apply_overrides(args.datadir.clone(), args.log_level.clone());

    repman_server::init_logging(&config.server.log_level);
    if let Some(path) = &args.config {
        info!("Loaded config from {:?}", path);
    }

    match args.command {
        Command::Monitor => {
            info!("Starting replication manager on {}:{}", config.server.bind, config.server.port);
            let server = Arc::new(Server::new(config)?);
            if let Err(e) = server.run().await {
                error!("Server error: {}", e);
                return Err(anyhow::anyhow!("{}", e));
            }
        }
        Command::Arbitrator { bind, port } => {
            run_arbitrator(&bind, port).await?;
        }
    }

    info!("Replication manager stopped");
    Ok(())
}
