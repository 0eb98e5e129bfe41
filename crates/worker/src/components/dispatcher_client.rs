use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use workerd_core::{SchedulerError, SchedulerResult};
use workerd_rpc::{RpcHandler, RpcPeer};

/// 与调度器之间的连接
///
/// 断开后按固定间隔重连，直到收到关闭信号。
pub struct DispatcherClient {
    dispatcher_address: String,
    greeting: Value,
    handler: Arc<dyn RpcHandler>,
    reconnect_interval: Duration,
    handshake_timeout: Duration,
}

impl DispatcherClient {
    pub fn new(
        dispatcher_address: String,
        greeting: Value,
        handler: Arc<dyn RpcHandler>,
        reconnect_interval: Duration,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            dispatcher_address,
            greeting,
            handler,
            reconnect_interval,
            handshake_timeout,
        }
    }

    /// 建立一次连接并完成握手
    pub async fn connect(&self) -> SchedulerResult<RpcPeer> {
        let stream = TcpStream::connect(&self.dispatcher_address)
            .await
            .map_err(|e| {
                SchedulerError::Network(format!("连接调度器 {} 失败: {e}", self.dispatcher_address))
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("设置TCP_NODELAY失败: {}", e);
        }

        workerd_rpc::connect(
            stream,
            self.greeting.clone(),
            Arc::clone(&self.handler),
            self.handshake_timeout,
        )
        .await
        .map_err(|e| SchedulerError::Network(format!("与调度器握手失败: {e}")))
    }

    /// 保持与调度器的连接，直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> SchedulerResult<()> {
        loop {
            let connected = tokio::select! {
                _ = shutdown_rx.recv() => return Ok(()),
                connected = self.connect() => connected,
            };

            match connected {
                Ok(peer) => {
                    info!("已连接到调度器: {}", self.dispatcher_address);
                    tokio::select! {
                        _ = shutdown_rx.recv() => {
                            info!("断开与调度器的连接");
                            peer.close();
                            return Ok(());
                        }
                        _ = peer.closed() => {
                            warn!("与调度器的连接已断开");
                        }
                    }
                }
                Err(e) => warn!("{}", e),
            }

            debug!("{:?} 后重新连接调度器", self.reconnect_interval);
            tokio::select! {
                _ = shutdown_rx.recv() => return Ok(()),
                _ = tokio::time::sleep(self.reconnect_interval) => {}
            }
        }
    }
}
