//! lexgate daemon: serves the legal-data tools over MCP (JSON-RPC 2.0 on
//! HTTP), with every upstream call going through the shared protected
//! pipeline.

pub mod dispatch;
pub mod server;
