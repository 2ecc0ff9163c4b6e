//! Integration test suite for warden.
//!
//! These tests drive real worker processes (small `sh` scripts) through the
//! orchestrator and check the notifications, plan files and profile swaps
//! that result.
//!
//! # Test Categories
//!
//! - `lifecycle`: task state transitions, persistence and stop handling
//! - `failover`: provider failure classification and profile swapping
//! - `spec_creation`: spec number allocation and spec worker launch

mod fixtures;

mod failover;
mod lifecycle;
mod spec_creation;
