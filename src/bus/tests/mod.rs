//! # MCP Bus Tests
//!
//! Registry, routing, and breaker behavior against live stub agents.

pub mod unit_tests;
