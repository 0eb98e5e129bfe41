use async_trait::async_trait;
use serde_json::Value;

use crate::error::{RpcError, RpcResult};

/// 处理对端发来的方法调用
///
/// 返回 `RpcError::UnknownMethod` 会以 `unknown_method` 错误回复，
/// 其他错误都作为远程错误回复给调用方。
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle(&self, method: &str, args: Vec<Value>) -> RpcResult<Value>;
}

/// 不提供任何方法的处理器，调度端使用
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMethods;

#[async_trait]
impl RpcHandler for NoMethods {
    async fn handle(&self, method: &str, _args: Vec<Value>) -> RpcResult<Value> {
        Err(RpcError::UnknownMethod(method.to_string()))
    }
}
