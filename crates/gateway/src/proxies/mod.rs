//! Request proxying to worker containers: streaming MCP sessions and
//! ordinary web pages.

pub mod mcp;
pub mod web;
