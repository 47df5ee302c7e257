//! # Orchestrator Tests
//!
//! Reclaimer, dead-letter and leadership scenarios over the in-memory
//! store and stream implementations.
