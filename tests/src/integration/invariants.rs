use crate::integration::TestHarness;
use chordkv_lib::dht_messages::NodeId;
use chordkv_lib::{key_position, RING_SIZE};
use std::collections::{HashMap, HashSet};

/// Network invariants that should always hold in a quiescent ring
/// These represent the core correctness properties of the Chord protocol
pub struct NetworkInvariants;

#[derive(Debug)]
pub struct InvariantViolation {
    pub name: String,
    pub description: String,
    pub affected_nodes: Vec<NodeId>,
}

impl InvariantViolation {
    fn new(name: &str, description: String, affected_nodes: Vec<NodeId>) -> Self {
        Self {
            name: name.to_string(),
            description,
            affected_nodes,
        }
    }
}

/// Positions sampled by the responsibility check.
const SAMPLE_STEP: usize = 61;

impl NetworkInvariants {
    /// Check all invariants and return any violations
    pub fn check_all(harness: &TestHarness) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();

        violations.extend(Self::check_ring_connectivity(harness));
        violations.extend(Self::check_successor_consistency(harness));
        violations.extend(Self::check_predecessor_consistency(harness));
        violations.extend(Self::check_unique_responsibility(harness));
        violations.extend(Self::check_replica_placement(harness));
        violations.extend(Self::check_pointer_counts(harness));

        violations
    }

    fn successors(harness: &TestHarness) -> HashMap<NodeId, Option<NodeId>> {
        harness
            .nodes()
            .map(|n| (n.info.id, n.successor.as_ref().map(|s| s.node_id)))
            .collect()
    }

    /// Invariant 1: Ring Connectivity
    /// Following successors from any node visits every node exactly once.
    pub fn check_ring_connectivity(harness: &TestHarness) -> Vec<InvariantViolation> {
        let successors = Self::successors(harness);
        let mut violations = Vec::new();
        if successors.len() < 2 {
            return violations;
        }

        for start in successors.keys() {
            let mut visited = HashSet::new();
            let mut current = *start;
            while visited.insert(current) {
                match successors.get(&current).copied().flatten() {
                    Some(next) => current = next,
                    None => {
                        violations.push(InvariantViolation::new(
                            "Ring Connectivity",
                            format!("Node {} has no successor", current),
                            vec![current],
                        ));
                        break;
                    }
                }
            }
            if visited.len() != successors.len() || current != *start {
                violations.push(InvariantViolation::new(
                    "Ring Connectivity",
                    format!(
                        "Walking successors from {} visited {} of {} nodes",
                        start,
                        visited.len(),
                        successors.len()
                    ),
                    vec![*start],
                ));
            }
        }

        violations
    }

    /// Invariant 2: Successor Consistency
    /// For each node n, successor(n).predecessor is n.
    pub fn check_successor_consistency(harness: &TestHarness) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();
        for node in harness.nodes() {
            let Some(successor) = &node.successor else {
                continue;
            };
            let Some(successor_node) = harness.node_by_id(successor.node_id) else {
                violations.push(InvariantViolation::new(
                    "Successor Consistency",
                    format!("Node {} points at missing successor {}", node.info.id, successor.node_id),
                    vec![node.info.id],
                ));
                continue;
            };
            let back = successor_node.predecessor.as_ref().map(|p| p.node_id);
            if back != Some(node.info.id) {
                violations.push(InvariantViolation::new(
                    "Successor Consistency",
                    format!(
                        "Node {}'s successor {} has predecessor {:?}",
                        node.info.id, successor.node_id, back
                    ),
                    vec![node.info.id, successor.node_id],
                ));
            }
        }
        violations
    }

    /// Invariant 3: Predecessor Consistency
    /// For each node n, predecessor(n).successor is n.
    pub fn check_predecessor_consistency(harness: &TestHarness) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();
        let successors = Self::successors(harness);
        for node in harness.nodes() {
            let Some(predecessor) = &node.predecessor else {
                if successors.len() > 1 {
                    violations.push(InvariantViolation::new(
                        "Predecessor Consistency",
                        format!("Node {} has no predecessor", node.info.id),
                        vec![node.info.id],
                    ));
                }
                continue;
            };
            let forward = successors.get(&predecessor.node_id).copied().flatten();
            if forward != Some(node.info.id) {
                violations.push(InvariantViolation::new(
                    "Predecessor Consistency",
                    format!(
                        "Node {}'s predecessor {} has successor {:?}",
                        node.info.id, predecessor.node_id, forward
                    ),
                    vec![node.info.id, predecessor.node_id],
                ));
            }
        }
        violations
    }

    /// Invariant 4: Unique Responsibility
    /// Every sampled position is claimed by exactly one node.
    pub fn check_unique_responsibility(harness: &TestHarness) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();
        let node_ids: Vec<NodeId> = harness.nodes().map(|n| n.info.id).collect();
        let samples = (0..RING_SIZE as NodeId)
            .step_by(SAMPLE_STEP)
            .chain(node_ids.iter().copied());

        for position in samples {
            let claimants: Vec<NodeId> = harness
                .nodes()
                .filter(|n| n.is_responsible(position))
                .map(|n| n.info.id)
                .collect();
            if claimants.len() != 1 {
                violations.push(InvariantViolation::new(
                    "Unique Responsibility",
                    format!("Position {} is claimed by {:?}", position, claimants),
                    claimants,
                ));
            }
        }
        violations
    }

    /// Invariant 5: Replica Placement
    /// Every primary record is also stored on the owner's successor.
    pub fn check_replica_placement(harness: &TestHarness) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();
        for node in harness.nodes() {
            let Some(successor) = node
                .successor
                .as_ref()
                .filter(|s| s.node_id != node.info.id)
            else {
                continue;
            };
            let Some(successor_node) = harness.node_by_id(successor.node_id) else {
                continue;
            };
            for (key, value) in node.store.iter() {
                if !node.is_responsible(key_position(*key)) {
                    continue;
                }
                if successor_node.store.get(*key) != Some(value) {
                    violations.push(InvariantViolation::new(
                        "Replica Placement",
                        format!(
                            "Key {} owned by {} is not replicated on {}",
                            key, node.info.id, successor.node_id
                        ),
                        vec![node.info.id, successor.node_id],
                    ));
                }
            }
        }
        violations
    }

    /// Invariant 6: Pointer Counts
    /// `a.pointed_table[b]` equals the number of b's finger slots owned by a,
    /// and no node lists itself.
    pub fn check_pointer_counts(harness: &TestHarness) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();
        for pointed in harness.nodes() {
            if pointed.pointed_table.get(pointed.info.id).is_some() {
                violations.push(InvariantViolation::new(
                    "Pointer Counts",
                    format!("Node {} lists itself in its pointed table", pointed.info.id),
                    vec![pointed.info.id],
                ));
            }
            for pointer in harness.nodes() {
                if pointer.info.id == pointed.info.id {
                    continue;
                }
                let slots = pointer.finger_table.slots_owned_by(pointed.info.id).len();
                let counted = pointed
                    .pointed_table
                    .get(pointer.info.id)
                    .map_or(0, |entry| entry.count as usize);
                if slots != counted {
                    violations.push(InvariantViolation::new(
                        "Pointer Counts",
                        format!(
                            "{} has {} slots on {} but {} counts {}",
                            pointer.info.id, slots, pointed.info.id, pointed.info.id, counted
                        ),
                        vec![pointer.info.id, pointed.info.id],
                    ));
                }
            }
        }
        violations
    }
}
