//! Admin-managed MCP (Model Context Protocol) server registry: connecting
//! to configured MCP servers and listing the tools they expose.

pub mod client;
pub mod registry;
pub mod types;
