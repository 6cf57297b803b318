//! Integration Testing Framework for the ChordKV ring
//!
//! This module provides a testing environment that runs many production
//! nodes against an in-memory network. It includes:
//!
//! - A deterministic network simulator implementing `NetworkClient`
//! - A harness that drives every node's event handling to quiescence
//! - Ring invariant validation
//! - Reusable end-to-end scenarios

pub mod invariants;
pub mod scenarios;

pub use invariants::{InvariantViolation, NetworkInvariants};
pub use network_simulator::{Delivery, NetworkSimulator, SimulatedNetworkClient};
pub use scenarios::{keys_in, TestScenarios};
pub use test_harness::{node_address, TestHarness};
