//! `mcp-gateway` — a JSON-RPC reverse proxy and capture engine for the
//! Model Context Protocol.
//!
//! The crate is organized leaf-first, mirroring the specification's
//! component order: the registry store and capture store own durable
//! state; the session table and event bus own process-local state; the
//! proxy engine and code-mode dispatcher borrow all four; the management
//! surface and HTTP router sit on top and wire everything together.

pub mod capture;
pub mod codemode;
pub mod config;
pub mod error;
pub mod events;
pub mod jsonrpc;
pub mod management;
pub mod observability;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod session;
pub mod sse;

pub use config::GatewayConfig;
pub use error::{GatewayError, GatewayResult};
pub use router::{build_router, GatewayState};
