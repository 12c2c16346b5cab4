//! HTTP front end
//!
//! Serves the SSE session stream, the message submission route and the
//! liveness endpoints.

pub mod handlers;
pub mod session;

pub use session::{EndpointFactory, ProxyServer, SessionHook, SessionManager, SseServerOptions};
