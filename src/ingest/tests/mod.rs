//! # Ingestion Pipeline Tests
//!
//! Full pipeline runs over canned pages: dedupe, quality flags and
//! best-effort embeddings.

pub mod unit_tests;
