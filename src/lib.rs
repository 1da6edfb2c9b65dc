//! sandbox-executor library
//!
//! This crate provides the pieces of the executor:
//! - Persistent shell supervision with sentinel-delimited commands
//! - A priority-ordered pool of isolate sandboxes
//! - Resource limit and metadata translation for isolate
//! - The compile-and-run judge and its MCP server

pub mod backend;
pub mod config;
pub mod error;
pub mod judge;
pub mod limits;
pub mod mcp;
pub mod metadata;
pub mod pool;
pub mod shell;
