//! Worker与调度器之间的双向RPC协议
//!
//! 每条连接先完成一次握手（发起方发送 `hello` 携带自身信息，接受方回复
//! `hello_ack`），之后双方都可以发起调用。帧为换行分隔的JSON，调用与响应
//! 通过ID关联，因此同一连接上可以有多个调用并发进行。连接断开时，所有
//! 未完成的调用都会以 [`RpcError::ConnectionLost`] 失败。

pub mod error;
pub mod frame;
pub mod handler;
pub mod peer;

pub use error::{RpcError, RpcResult};
pub use frame::{ErrorKind, Frame};
pub use handler::{NoMethods, RpcHandler};
pub use peer::{accept, connect, RpcPeer};
