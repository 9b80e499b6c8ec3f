//! # berth-compose
//!
//! Deployment documents for Berth.
//!
//! Handles:
//! - **Parser**: interpolation, YAML deserialization, and validation of documents.
//! - **Model**: the immutable, strongly typed [`model::Deployment`].
//! - **Graph**: dependency graph construction and cycle detection.
//! - **Resolver**: deterministic startup and teardown ordering.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod graph;
pub mod model;
pub mod parser;
pub mod resolver;
