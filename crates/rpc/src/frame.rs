use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{RpcError, RpcResult};

/// 错误响应的类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Remote,
    UnknownMethod,
}

/// 线路上的一帧，每帧占一行JSON
///
/// ```text
/// {"type":"hello","data":{"name":"w1","concurrency":2}}
/// {"type":"hello_ack"}
/// {"type":"call","id":1,"method":"run","args":[{"task_id":"t1"}]}
/// {"type":"result","id":1,"result":{"task_id":"t1","foo":"bar"}}
/// {"type":"error","id":1,"kind":"remote","message":"..."}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Hello {
        data: Value,
    },
    HelloAck,
    Call {
        id: u64,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    #[serde(rename = "result")]
    Reply {
        id: u64,
        result: Value,
    },
    #[serde(rename = "error")]
    Failure {
        id: u64,
        kind: ErrorKind,
        message: String,
    },
}

impl Frame {
    pub fn encode(&self) -> RpcResult<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn decode(line: &str) -> RpcResult<Self> {
        serde_json::from_str(line.trim()).map_err(|e| {
            RpcError::Protocol(format!("无法解析的帧: {e}"))
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::HelloAck => "hello_ack",
            Frame::Call { .. } => "call",
            Frame::Reply { .. } => "result",
            Frame::Failure { .. } => "error",
        }
    }
}

pub(crate) async fn write_frame<W>(writer: &mut W, frame: &Frame) -> RpcResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame.encode()?.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
