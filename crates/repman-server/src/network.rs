//! 网络监听模块
//!
//! 使用 socket2 创建 API 监听 socket:
//! - SO_REUSEADDR,重启时不必等待 TIME_WAIT
//! - SO_KEEPALIVE
//! - backlog 1024

use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::debug;

use crate::{ServerError, ServerResult};

/// # Brief
/// 绑定并监听
///
/// # Arguments
/// * `bind` - 绑定地址,如 "0.0.0.0"
/// * `port` - 端口,0 表示由系统分配
pub fn bind_listener(bind: &str, port: u16) -> ServerResult<TcpListener> {
    let addr: SocketAddr = format!("{}:{}", bind, port)
        .parse()
        .map_err(|e| ServerError::Bind(format!("{}:{}: {}", bind, port, e)))?;

    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_keepalive(true)?;
    socket
        .bind(&addr.into())
        .map_err(|e| ServerError::Bind(format!("{}: {}", addr, e)))?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;

    let std_listener: std::net::TcpListener = socket.into();
    let listener = TcpListener::from_std(std_listener)?;
    debug!("Listening socket ready on {}", addr);
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral() {
        let listener = bind_listener("127.0.0.1", 0).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_bad_address() {
        assert!(matches!(bind_listener("not-an-ip", 80), Err(ServerError::Bind(_))));
    }
}
