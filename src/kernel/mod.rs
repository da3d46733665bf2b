//! Connection to the kernel: wire types, transports and the RPC client.

pub mod client;
#[cfg(any(test, feature = "test-support"))]
pub mod in_process;
pub mod intake;
pub mod protocol;
pub mod transport;

pub use client::KernelClient;
pub use intake::forward_task_requests;
pub use protocol::{KernelEvent, KernelStatus, RpcErrorBody, RpcRequest, RpcResponse};
#[cfg(any(test, feature = "test-support"))]
pub use in_process::{InProcessTransport, PushHandle};
pub use transport::{Connection, HttpWsTransport, Transport};
