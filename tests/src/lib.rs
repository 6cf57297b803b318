//! Integration tests for the ChordKV node network
//!
//! This module demonstrates how to use the integration testing framework
//! to test real-world scenarios with multiple nodes.

pub mod integration;

use integration::{NetworkInvariants, TestHarness, TestScenarios};

#[tokio::test]
async fn test_single_node_operations() {
    TestScenarios::single_node_operations()
        .await
        .expect("A lone node should serve every request itself");
}

#[tokio::test]
async fn test_two_node_ring() {
    TestScenarios::two_node_ring()
        .await
        .expect("Two nodes should split the ring");
}

#[tokio::test]
async fn test_data_survives_joins() {
    TestScenarios::data_survives_joins()
        .await
        .expect("Records should follow their arcs as nodes join");
}

#[tokio::test]
async fn test_routing_hop_bound() {
    TestScenarios::routing_hop_bound(8, 7)
        .await
        .expect("Lookups should reach their owner within the hop bound");
}

#[tokio::test]
#[ignore] // Long-running test
async fn test_routing_hop_bound_large_ring() {
    TestScenarios::routing_hop_bound(40, 11)
        .await
        .expect("Lookups should reach their owner within the hop bound");
}

#[tokio::test]
async fn test_predecessor_failure_takeover() {
    TestScenarios::predecessor_failure_takeover()
        .await
        .expect("The successor should take over a failed node's arc");
}

#[tokio::test]
async fn test_restart_recovers_compacted_store() {
    TestScenarios::restart_recovers_compacted_store()
        .await
        .expect("A restarted node should recover its records and rejoin");
}

#[tokio::test]
async fn test_identity_collision() {
    TestScenarios::identity_collision()
        .await
        .expect("A duplicate identity should be refused");
}

#[tokio::test]
async fn test_remove_is_replicated() {
    TestScenarios::remove_is_replicated()
        .await
        .expect("Removal should reach the replica");
}

#[tokio::test]
async fn test_invariants_on_three_node_ring() {
    let mut harness = TestHarness::new();
    harness.build_ring(&[10, 20000, 40000]).await.unwrap();

    // Test individual invariants
    let ring_violations = NetworkInvariants::check_ring_connectivity(&harness);
    assert!(ring_violations.is_empty(), "Ring should be connected: {:?}", ring_violations);

    let succ_violations = NetworkInvariants::check_successor_consistency(&harness);
    assert!(succ_violations.is_empty(), "Successors should be consistent: {:?}", succ_violations);

    let pred_violations = NetworkInvariants::check_predecessor_consistency(&harness);
    assert!(pred_violations.is_empty(), "Predecessors should be consistent: {:?}", pred_violations);

    let pointer_violations = NetworkInvariants::check_pointer_counts(&harness);
    assert!(pointer_violations.is_empty(), "Pointer counts should match: {:?}", pointer_violations);

    // Test all invariants
    let all_violations = NetworkInvariants::check_all(&harness);
    assert!(all_violations.is_empty(), "All invariants should hold: {:?}", all_violations);
}
