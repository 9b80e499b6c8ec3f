//! # berth-runtime
//!
//! Runs deployments against a container runtime.
//!
//! Handles:
//! - **Backend**: the [`backend::ContainerRuntime`] trait with a Docker CLI
//!   adapter and an in-memory simulator.
//! - **Reconciler**: idempotent network and volume convergence.
//! - **Lifecycle**: per-service state machines, health probes, and restart
//!   policies.
//! - **Engine**: `up`, `down`, `stop`, `ps`, `logs`, and `attach` over a
//!   whole deployment.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod backend;
pub mod engine;
pub mod health;
pub mod lifecycle;
pub mod logs;
pub mod reconciler;
pub mod report;
pub mod restart;
pub mod state;
