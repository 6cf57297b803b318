use crate::integration::{NetworkInvariants, TestHarness};
use chordkv_lib::dht_messages::{NodeId, Request, Response};
use chordkv_lib::{is_between, key_position, RING_BITS};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::collections::BTreeSet;

type ScenarioResult = Result<(), Box<dyn std::error::Error>>;

/// First `count` keys whose ring position lies in `(start, end]`.
pub fn keys_in(start: NodeId, end: NodeId, count: usize) -> Vec<u64> {
    (0..1_000_000u64)
        .filter(|k| is_between(&key_position(*k), &start, &end))
        .take(count)
        .collect()
}

fn expect(response: &Response, expected: &Response, context: &str) -> ScenarioResult {
    if response != expected {
        return Err(format!("{}: expected {:?}, got {:?}", context, expected, response).into());
    }
    Ok(())
}

fn check_invariants(harness: &TestHarness) -> ScenarioResult {
    let violations = NetworkInvariants::check_all(harness);
    if !violations.is_empty() {
        return Err(format!("Invariant violations: {:?}", violations).into());
    }
    Ok(())
}

/// Common test scenarios for ring integration testing
pub struct TestScenarios;

impl TestScenarios {
    /// insert 5 "a", lookup 5, lookup 6, remove 5, lookup 5 on a lone node.
    pub async fn single_node_operations() -> ScenarioResult {
        let mut harness = TestHarness::new();
        let node = harness.build_ring(&[10]).await?.remove(0);

        let ok = harness.insert(&node, 5, json!("a")).await?;
        expect(&ok, &Response::success(), "insert 5")?;
        let found = harness.lookup(&node, 5).await?;
        expect(&found, &Response::with_value(json!("a")), "lookup 5")?;
        let missing = harness.lookup(&node, 6).await?;
        expect(&missing, &Response::failure("Key not found"), "lookup 6")?;
        let removed = harness.remove(&node, 5).await?;
        expect(&removed, &Response::success(), "remove 5")?;
        let gone = harness.lookup(&node, 5).await?;
        if gone.is_success() {
            return Err("lookup after remove should fail".into());
        }
        check_invariants(&harness)
    }

    /// Ring {10, 200}: position 50 belongs to 200 and 10's fingers over
    /// (10, 200] reference 200.
    pub async fn two_node_ring() -> ScenarioResult {
        let mut harness = TestHarness::new();
        let addresses = harness.build_ring(&[10, 200]).await?;
        check_invariants(&harness)?;

        let n1 = harness.node_by_id(10).ok_or("node 10 missing")?;
        let n2 = harness.node_by_id(200).ok_or("node 200 missing")?;
        if !n2.is_responsible(50) || n1.is_responsible(50) {
            return Err("position 50 must belong to node 200".into());
        }
        for entry in n1.finger_table.entries() {
            let expected = if is_between(&entry.target_id, &10, &200) { 200 } else { 10 };
            if entry.owner.node_id != expected {
                return Err(format!(
                    "slot for {} is owned by {}, expected {}",
                    entry.target_id, entry.owner.node_id, expected
                )
                .into());
            }
        }
        if n1.pointed_table.get(10).is_some() || n2.pointed_table.get(200).is_some() {
            return Err("a node lists itself in its pointed table".into());
        }

        // Resolved through node 10 but answered by 200.
        let owner = harness
            .client_request(
                &addresses[0],
                Request::EstablishChord {
                    target_id: 50,
                    message_id: None,
                },
            )
            .await?;
        if owner.node_id != Some(200) {
            return Err(format!("position 50 resolved to {:?}", owner.node_id).into());
        }
        Ok(())
    }

    /// Keys inserted before more nodes join stay reachable from every node.
    pub async fn data_survives_joins() -> ScenarioResult {
        let mut harness = TestHarness::new();
        let first = harness.build_ring(&[10]).await?.remove(0);

        for key in 0..40u64 {
            let response = harness.insert(&first, key, json!(key * 10)).await?;
            expect(&response, &Response::success(), "insert")?;
        }

        for node_id in [20000, 40000, 50000] {
            let address = harness.add_node(node_id)?;
            harness.join_network(&address, &first).await?;
            check_invariants(&harness)?;
        }

        for address in harness.get_all_node_addresses() {
            for key in 0..40u64 {
                let response = harness.lookup(&address, key).await?;
                expect(&response, &Response::with_value(json!(key * 10)), "lookup")?;
            }
        }

        // One primary and one replica per key.
        for key in 0..40u64 {
            let holders = harness.nodes().filter(|n| n.store.get(key).is_some()).count();
            if holders != 2 {
                return Err(format!("key {} is stored on {} nodes", key, holders).into());
            }
        }
        Ok(())
    }

    /// Any lookup reaches the responsible node within `RING_BITS` forwards.
    pub async fn routing_hop_bound(node_count: usize, seed: u64) -> ScenarioResult {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut ids = BTreeSet::new();
        while ids.len() < node_count {
            ids.insert(rng.gen_range(0..1u32 << RING_BITS));
        }
        let ids: Vec<NodeId> = ids.into_iter().collect();

        let mut harness = TestHarness::new();
        let addresses = harness.build_ring(&ids).await?;
        check_invariants(&harness)?;

        for key in 0..30u64 {
            let entry = &addresses[rng.gen_range(0..addresses.len())];
            let response = harness.insert(entry, key, json!(key)).await?;
            expect(&response, &Response::success(), "insert")?;
        }

        for key in 0..30u64 {
            let entry = addresses[rng.gen_range(0..addresses.len())].clone();
            harness.network().clear_trace();
            let response = harness.lookup(&entry, key).await?;
            expect(&response, &Response::with_value(json!(key)), "lookup")?;
            let hops = harness.forwarded_hops();
            if hops > RING_BITS as usize {
                return Err(format!("lookup of {} took {} hops", key, hops).into());
            }
        }
        check_invariants(&harness)
    }

    /// Ring {10, 20000, 40000}: 40000 crashes, 10 takes over its arc and
    /// the replicated keys stay readable.
    pub async fn predecessor_failure_takeover() -> ScenarioResult {
        let mut harness = TestHarness::new();
        let addresses = harness.build_ring(&[10, 20000, 40000]).await?;
        check_invariants(&harness)?;

        let lost_arc = keys_in(20000, 40000, 5);
        let other_keys = keys_in(10, 20000, 5);
        for key in lost_arc.iter().chain(other_keys.iter()) {
            let response = harness.insert(&addresses[1], *key, json!(format!("v{}", key))).await?;
            expect(&response, &Response::success(), "insert")?;
        }

        harness.fail_node(&addresses[2]).await?;

        let survivor = harness.node_by_id(10).ok_or("node 10 missing")?;
        if lost_arc
            .iter()
            .any(|key| !survivor.is_responsible(key_position(*key)))
        {
            return Err("node 10 did not take over the failed arc".into());
        }
        check_invariants(&harness)?;

        for address in [&addresses[0], &addresses[1]] {
            for key in lost_arc.iter().chain(other_keys.iter()) {
                let response = harness.lookup(address, *key).await?;
                expect(
                    &response,
                    &Response::with_value(json!(format!("v{}", key))),
                    "lookup after takeover",
                )?;
            }
        }
        Ok(())
    }

    /// Ring {10, 20000, 40000} with small logs: 20000 compacts, crashes,
    /// restarts from its files and rejoins without losing a key.
    pub async fn restart_recovers_compacted_store() -> ScenarioResult {
        let mut harness = TestHarness::with_log_max_size(4);
        let addresses = harness.build_ring(&[10, 20000, 40000]).await?;
        let keys = keys_in(10, 20000, 10);
        for key in &keys {
            let response = harness.insert(&addresses[0], *key, json!(key * 3)).await?;
            expect(&response, &Response::success(), "insert")?;
        }

        let owner = harness.node_by_id(20000).ok_or("node 20000 missing")?;
        if owner.store.log_size() >= keys.len() {
            return Err(format!("log of 20000 never compacted ({} records)", owner.store.log_size()).into());
        }

        harness.fail_node(&addresses[1]).await?;
        let restarted = harness.restart_node(20000)?;
        let recovered = harness.node(&restarted).ok_or("restarted node missing")?;
        if let Some(key) = keys.iter().find(|k| recovered.store.get(**k) != Some(&json!(**k * 3))) {
            return Err(format!("key {} not recovered from disk", key).into());
        }

        harness.join_network(&restarted, &addresses[0]).await?;
        check_invariants(&harness)?;

        for address in harness.get_all_node_addresses() {
            for key in &keys {
                let response = harness.lookup(&address, *key).await?;
                expect(&response, &Response::with_value(json!(key * 3)), "lookup after restart")?;
            }
        }
        let replica = harness.node_by_id(40000).ok_or("node 40000 missing")?;
        if keys.iter().any(|k| replica.store.get(*k).is_none()) {
            return Err("successor lost a replica across the restart".into());
        }
        Ok(())
    }

    /// A second node with the same identity is turned away.
    pub async fn identity_collision() -> ScenarioResult {
        let mut harness = TestHarness::new();
        let first = harness.build_ring(&[10]).await?.remove(0);
        let impostor = harness.add_node(10).map(|_| ()).err();
        if impostor.is_none() {
            return Err("the harness accepted a duplicate address".into());
        }

        // Same identity under another address: routed to node 10, which refuses it.
        let response = harness
            .client_request(
                &first,
                Request::Join {
                    node_id: 10,
                    address: "elsewhere:7000".to_string(),
                    message_id: Some("99_1".to_string()),
                },
            )
            .await?;
        expect(
            &response,
            &Response::failure("Node identity collision").with_message_id(Some("99_1".to_string())),
            "join collision",
        )
    }

    /// Removal is mirrored to the replica.
    pub async fn remove_is_replicated() -> ScenarioResult {
        let mut harness = TestHarness::new();
        let addresses = harness.build_ring(&[10, 30000]).await?;
        let key = keys_in(10, 30000, 1)
            .first()
            .copied()
            .ok_or("no key in arc")?;

        harness.insert(&addresses[0], key, json!("x")).await?;
        let replica_holder = harness.node_by_id(10).ok_or("node 10 missing")?;
        if replica_holder.store.get(key).is_none() {
            return Err("replica missing on successor".into());
        }

        let response = harness.remove(&addresses[0], key).await?;
        expect(&response, &Response::success(), "remove")?;
        if harness.nodes().any(|n| n.store.get(key).is_some()) {
            return Err("removed key still stored somewhere".into());
        }
        let response = harness.remove(&addresses[1], key).await?;
        expect(&response, &Response::failure("Key not found"), "second remove")
    }
}
