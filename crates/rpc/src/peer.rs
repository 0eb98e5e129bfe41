use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{RpcError, RpcResult};
use crate::frame::{write_frame, ErrorKind, Frame};
use crate::handler::RpcHandler;

type PendingReply = oneshot::Sender<RpcResult<Value>>;

struct PeerShared {
    outgoing: mpsc::UnboundedSender<Frame>,
    pending: Mutex<HashMap<u64, PendingReply>>,
    next_id: AtomicU64,
    /// 请求关闭或检测到断开时触发
    closing: CancellationToken,
    /// 所有未完成调用都已失败后触发
    terminated: CancellationToken,
}

impl PeerShared {
    fn register(&self) -> RpcResult<(u64, oneshot::Receiver<RpcResult<Value>>)> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| RpcError::Protocol("pending表锁已中毒".to_string()))?;
        if self.closing.is_cancelled() {
            return Err(RpcError::ConnectionLost);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        pending.insert(id, tx);
        Ok((id, rx))
    }

    fn take(&self, id: u64) -> Option<PendingReply> {
        self.pending.lock().ok().and_then(|mut p| p.remove(&id))
    }

    fn resolve(&self, id: u64, result: RpcResult<Value>) {
        match self.take(id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!(call_id = id, "收到无主的响应，调用可能已超时"),
        }
    }

    /// 标记连接断开，让所有未完成的调用以 ConnectionLost 失败
    fn shutdown(&self) {
        self.closing.cancel();
        let drained: Vec<PendingReply> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().map(|(_, tx)| tx).collect(),
            Err(_) => Vec::new(),
        };
        if !drained.is_empty() {
            debug!("连接断开，{} 个未完成的调用失败", drained.len());
        }
        for tx in drained {
            let _ = tx.send(Err(RpcError::ConnectionLost));
        }
        self.terminated.cancel();
    }
}

/// 一条已完成握手的双向RPC连接
///
/// 克隆得到的句柄共享同一条连接。同一连接上可以同时有多个调用在进行，
/// 响应按调用ID匹配，与到达顺序无关。
#[derive(Clone)]
pub struct RpcPeer {
    shared: Arc<PeerShared>,
}

impl std::fmt::Debug for RpcPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcPeer")
            .field("connected", &self.is_connected())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

impl RpcPeer {
    fn spawn<R, W>(lines: Lines<BufReader<R>>, writer: W, handler: Arc<dyn RpcHandler>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(PeerShared {
            outgoing,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closing: CancellationToken::new(),
            terminated: CancellationToken::new(),
        });

        tokio::spawn(write_loop(writer, outgoing_rx, shared.closing.clone()));
        tokio::spawn(read_loop(lines, Arc::clone(&shared), handler));

        Self { shared }
    }

    /// 调用对端方法，不设超时
    pub async fn call(&self, method: &str, args: Vec<Value>) -> RpcResult<Value> {
        self.invoke(method, args, None).await
    }

    /// 调用对端方法，超过 `timeout` 仍未响应则放弃该调用
    pub async fn call_with_timeout(
        &self,
        method: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> RpcResult<Value> {
        self.invoke(method, args, Some(timeout)).await
    }

    async fn invoke(
        &self,
        method: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> RpcResult<Value> {
        let (id, rx) = self.shared.register()?;
        let frame = Frame::Call {
            id,
            method: method.to_string(),
            args,
        };
        if self.shared.outgoing.send(frame).is_err() {
            self.shared.take(id);
            return Err(RpcError::ConnectionLost);
        }
        debug!(call_id = id, method, "发出RPC调用");

        match timeout {
            None => rx.await.unwrap_or(Err(RpcError::ConnectionLost)),
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(result) => result.unwrap_or(Err(RpcError::ConnectionLost)),
                Err(_) => {
                    self.shared.take(id);
                    Err(RpcError::Timeout {
                        method: method.to_string(),
                        timeout,
                    })
                }
            },
        }
    }

    /// 主动断开连接，可重复调用
    pub fn close(&self) {
        self.shared.closing.cancel();
    }

    pub fn is_connected(&self) -> bool {
        !self.shared.closing.is_cancelled()
    }

    /// 等待连接断开，并且所有未完成调用都已失败
    pub async fn closed(&self) {
        self.shared.terminated.cancelled().await;
    }

    pub fn pending_calls(&self) -> usize {
        self.shared.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut outgoing: mpsc::UnboundedReceiver<Frame>,
    closing: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            _ = closing.cancelled() => break,
            frame = outgoing.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        debug!("写入帧失败: {}", e);
                        break;
                    }
                }
                None => break,
            },
        }
    }
    closing.cancel();
    let _ = writer.shutdown().await;
}

async fn read_loop<R>(
    mut lines: Lines<BufReader<R>>,
    shared: Arc<PeerShared>,
    handler: Arc<dyn RpcHandler>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    loop {
        let line = tokio::select! {
            _ = shared.closing.cancelled() => break,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("对端关闭了连接");
                break;
            }
            Err(e) => {
                debug!("读取连接失败: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match Frame::decode(&line) {
            Ok(frame) => handle_incoming(frame, &shared, &handler),
            Err(e) => {
                warn!("收到无效数据，断开连接: {}", e);
                break;
            }
        }
    }

    shared.shutdown();
}

fn handle_incoming(frame: Frame, shared: &Arc<PeerShared>, handler: &Arc<dyn RpcHandler>) {
    match frame {
        Frame::Call { id, method, args } => {
            let handler = Arc::clone(handler);
            let outgoing = shared.outgoing.clone();
            let closing = shared.closing.clone();
            tokio::spawn(async move {
                let result = tokio::select! {
                    _ = closing.cancelled() => return,
                    result = handler.handle(&method, args) => result,
                };
                let reply = match result {
                    Ok(result) => Frame::Reply { id, result },
                    Err(RpcError::UnknownMethod(method)) => Frame::Failure {
                        id,
                        kind: ErrorKind::UnknownMethod,
                        message: method,
                    },
                    Err(RpcError::Remote(message)) => Frame::Failure {
                        id,
                        kind: ErrorKind::Remote,
                        message,
                    },
                    Err(e) => Frame::Failure {
                        id,
                        kind: ErrorKind::Remote,
                        message: e.to_string(),
                    },
                };
                let _ = outgoing.send(reply);
            });
        }
        Frame::Reply { id, result } => shared.resolve(id, Ok(result)),
        Frame::Failure { id, kind, message } => {
            let err = match kind {
                ErrorKind::Remote => RpcError::Remote(message),
                ErrorKind::UnknownMethod => RpcError::UnknownMethod(message),
            };
            shared.resolve(id, Err(err));
        }
        other => warn!("握手完成后收到意外的 {} 帧，已忽略", other.kind()),
    }
}

/// 接受一条连接：等待对端的hello，回复hello_ack
///
/// 返回连接句柄和对端的握手数据。
pub async fn accept<S>(
    stream: S,
    handler: Arc<dyn RpcHandler>,
    handshake_timeout: Duration,
) -> RpcResult<(RpcPeer, Value)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();

    let greeting = match read_handshake_frame(&mut lines, handshake_timeout, "hello").await? {
        Frame::Hello { data } => data,
        other => {
            return Err(RpcError::Handshake(format!(
                "期望hello，收到 {}",
                other.kind()
            )))
        }
    };

    write_frame(&mut write_half, &Frame::HelloAck).await?;
    Ok((RpcPeer::spawn(lines, write_half, handler), greeting))
}

/// 主动发起的一端：发送hello，等待hello_ack
pub async fn connect<S>(
    stream: S,
    greeting: Value,
    handler: Arc<dyn RpcHandler>,
    handshake_timeout: Duration,
) -> RpcResult<RpcPeer>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();

    write_frame(&mut write_half, &Frame::Hello { data: greeting }).await?;

    match read_handshake_frame(&mut lines, handshake_timeout, "hello_ack").await? {
        Frame::HelloAck => Ok(RpcPeer::spawn(lines, write_half, handler)),
        other => Err(RpcError::Handshake(format!(
            "期望hello_ack，收到 {}",
            other.kind()
        ))),
    }
}

async fn read_handshake_frame<R>(
    lines: &mut Lines<BufReader<R>>,
    timeout: Duration,
    expected: &str,
) -> RpcResult<Frame>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(timeout, lines.next_line()).await {
        Err(_) => Err(RpcError::Handshake(format!("等待{expected}超时"))),
        Ok(Err(e)) => Err(RpcError::Handshake(format!("读取{expected}失败: {e}"))),
        Ok(Ok(None)) => Err(RpcError::Handshake("连接在握手完成前关闭".to_string())),
        Ok(Ok(Some(line))) => {
            Frame::decode(&line).map_err(|e| RpcError::Handshake(e.to_string()))
        }
    }
}
