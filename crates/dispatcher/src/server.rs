use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use workerd_core::{SchedulerError, SchedulerResult};
use workerd_rpc::NoMethods;

use crate::worker_manager::WorkerManager;

/// 接受Worker连接的TCP监听器
///
/// 每个连接分配一个递增的令牌，完成握手后注册到 [`WorkerManager`]，
/// 连接关闭时以该令牌通知管理器。
pub struct WorkerListener {
    listener: TcpListener,
    manager: WorkerManager,
    next_token: AtomicU64,
}

impl WorkerListener {
    pub async fn bind(addr: &str, manager: WorkerManager) -> SchedulerResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SchedulerError::Network(format!("监听 {addr} 失败: {e}")))?;
        info!("Worker监听器已启动: {}", addr);
        Ok(Self {
            listener,
            manager,
            next_token: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> SchedulerResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| SchedulerError::Network(e.to_string()))
    }

    /// 接受连接直到收到关闭信号
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> SchedulerResult<()> {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Worker监听器收到关闭信号");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                        debug!(token, "接受来自 {} 的连接", addr);
                        let manager = self.manager.clone();
                        tokio::spawn(async move {
                            serve_connection(manager, token, stream, addr).await;
                        });
                    }
                    Err(e) => {
                        error!("接受连接失败: {}", e);
                    }
                },
            }
        }
        Ok(())
    }
}

async fn serve_connection(manager: WorkerManager, token: u64, stream: TcpStream, addr: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(token, "设置TCP_NODELAY失败: {}", e);
    }

    let (peer, greeting) =
        match workerd_rpc::accept(stream, Arc::new(NoMethods), manager.handshake_timeout()).await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(token, "与 {} 握手失败: {}", addr, e);
                return;
            }
        };

    if let Err(e) = manager.register_worker(token, peer.clone(), greeting).await {
        warn!(token, "Worker {} 注册失败: {}", addr, e);
        return;
    }

    peer.closed().await;
    manager.connection_lost(token);
}
