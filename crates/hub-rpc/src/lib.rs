//! RPC registry for the automation hub
//!
//! Every endpoint is a named async handler taking a JSON parameter object.
//! [`RpcRegistry::call`] never fails: errors are folded into an
//! [`RpcResponse`] carrying the stable code from [`hub_core::ErrorCode`].
//!
//! ```text
//! {"code": 0, "data": {...}}
//! {"code": 2, "message": "not found: rule r9"}
//! ```

mod error;
pub mod params;
mod registry;
mod response;
mod session;

pub use error::{RpcError, RpcResult};
pub use registry::{RpcFuture, RpcHandler, RpcRegistry};
pub use response::{RpcRequest, RpcResponse};
pub use session::{SessionValidator, StaticTokenValidator};
