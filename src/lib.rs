//! # apigate-mcp
//!
//! MCP (Model Context Protocol) server that wraps a third-party web API
//! behind a quota-aware dispatch layer. The bundled adapter targets
//! Instagram, which exposes two surfaces with different credentials:
//!
//! - the Graph API, authenticated with a bearer access token
//! - the Private API, authenticated with a browser session cookie
//!
//! ## Layers
//!
//! - [`auth::CredentialStore`]: holds one credential set per scheme and
//!   renders request headers for it
//! - [`quota::QuotaTracker`]: per-category buckets refreshed lazily when
//!   their window elapses, resynced from upstream quota headers
//! - [`dispatch::Dispatcher`]: runs one upstream call (quota check, headers,
//!   transport, response classification, accounting)
//! - [`instagram::InstagramClient`]: routes each operation to a scheme and
//!   maps upstream payloads into stable records
//! - [`tools::ToolRegistry`]: the MCP tool catalog, returning every failure
//!   as a `{"success":false,"error":{...}}` payload
//!
//! ## Usage with an MCP client
//!
//! ```json
//! {
//!   "servers": {
//!     "instagram": {
//!       "command": "apigate-mcp",
//!       "args": [],
//!       "env": {
//!         "INSTAGRAM_ACCESS_TOKEN": "...",
//!         "INSTAGRAM_ACCOUNT_ID": "..."
//!       }
//!     }
//!   }
//! }
//! ```
//!
//! Logs go to stderr; stdout carries only protocol messages.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod instagram;
pub mod poll;
pub mod protocol;
pub mod quota;
pub mod schema;
pub mod server;
pub mod tools;

pub use auth::{CredentialStore, Scheme};
pub use config::Config;
pub use dispatch::{Dispatcher, OperationResult, Transport};
pub use error::{Error, ErrorCode, ErrorInfo, Result};
pub use instagram::InstagramClient;
pub use protocol::{JsonRpcRequest, JsonRpcResponse, McpMessage};
pub use quota::{Category, QuotaTracker};
pub use server::McpServer;
pub use tools::{Tool, ToolRegistry};
