//! Model Context Protocol (MCP) plumbing
//!
//! The JSON-RPC message model, the client side spoken to the upstream peer and
//! the per-session server side spoken to downstream clients.

pub mod capabilities;
pub mod client;
pub mod message;
pub mod rpc;
pub mod server;
