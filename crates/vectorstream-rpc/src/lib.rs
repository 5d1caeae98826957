//! RPC surface between the data coordinator and the data nodes.
//!
//! Every RPC is unary request/response. This crate carries the message
//! types, the status vocabulary, and the two service traits; the wire
//! transport behind them is an external concern; in-process wiring and a
//! network binding implement the same traits.

pub mod messages;
pub mod service;
pub mod status;

pub use messages::*;
pub use service::{DataCoordService, DataNodeService};
pub use status::{ErrorCode, Status, reason};
