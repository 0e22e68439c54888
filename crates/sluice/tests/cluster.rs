//! Distributed execution over the loopback cluster: repartitioned
//! group-by, collect, routing agreement, and the cluster admin surface.

mod common;

use common::{load_cluster, wait_finished};
use engine::{ExecMode, PlanBuilder};
use pretty_assertions::assert_eq;
use record::Record;
use std::collections::BTreeMap;
use test_support::MemCluster;

/// Place `key -> value` on the shard owning the key.
fn place(cluster: &MemCluster, key: &str, value: &str) {
    let owner = cluster.owner_of(key.as_bytes());
    cluster.host(owner).execute(&["set", key, value]);
}

#[test]
fn group_by_with_repartition_counts_values() {
    let cluster = MemCluster::new(3);
    let modules = load_cluster(&cluster);
    let engine = modules[0].engine();

    for (key, value) in [
        ("k1", "x"),
        ("k2", "y"),
        ("k3", "x"),
        ("k4", "y"),
        ("k5", "x"),
    ] {
        place(&cluster, key, value);
    }

    let plan = PlanBuilder::new("KeysReader")
        .group_by("value_extractor", None, "count_reducer", None)
        .build(engine)
        .unwrap();
    let ep = engine
        .run_plan(&plan, ExecMode::Async, None, Vec::new())
        .unwrap();
    wait_finished(&ep);

    let outcome = ep.outcome().unwrap();
    assert!(outcome.errors.is_empty(), "errors: {:?}", outcome.errors);

    // Order across shards is not promised; compare as a map.
    let mut counts = BTreeMap::new();
    for record in &outcome.results {
        let Record::Key(kr) = record else {
            panic!("expected key records, got {record:?}");
        };
        let Some(Record::Long(count)) = kr.value.as_deref() else {
            panic!("expected long counts");
        };
        counts.insert(kr.key_str().into_owned(), *count);
    }
    assert_eq!(
        counts,
        BTreeMap::from([("x".to_string(), 3), ("y".to_string(), 2)])
    );
}

#[test]
fn collect_gathers_every_shards_records_at_the_initiator() {
    let cluster = MemCluster::new(3);
    let modules = load_cluster(&cluster);
    let engine = modules[1].engine();

    for i in 0..6 {
        let key = format!("key:{i}");
        place(&cluster, &key, "v");
    }

    let plan = PlanBuilder::new("KeysReader")
        .map("value_mapper", None)
        .collect()
        .accumulate("count_accumulator", None)
        .build(engine)
        .unwrap();
    let ep = engine
        .run_plan(&plan, ExecMode::Async, None, Vec::new())
        .unwrap();
    wait_finished(&ep);

    let outcome = ep.outcome().unwrap();
    assert!(outcome.errors.is_empty());
    // All six records were gathered before the accumulator ran.
    assert_eq!(outcome.results, vec![Record::Long(6)]);
}

#[test]
fn shard_id_reader_fans_out_one_record_per_shard() {
    let cluster = MemCluster::new(3);
    let modules = load_cluster(&cluster);
    let engine = modules[0].engine();

    let plan = PlanBuilder::new("ShardIDReader")
        .collect()
        .build(engine)
        .unwrap();
    let ep = engine
        .run_plan(&plan, ExecMode::Async, None, Vec::new())
        .unwrap();
    wait_finished(&ep);

    let outcome = ep.outcome().unwrap();
    let mut ids: Vec<String> = outcome
        .results
        .iter()
        .map(|r| match r {
            Record::String(s) => String::from_utf8_lossy(s).into_owned(),
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    ids.sort();
    let mut expected: Vec<String> = cluster
        .hosts()
        .iter()
        .map(|h| h.id().to_string())
        .collect();
    expected.sort();
    assert_eq!(ids, expected);
}

#[test]
fn async_local_mode_never_leaves_the_initiator() {
    let cluster = MemCluster::new(3);
    let modules = load_cluster(&cluster);
    let engine = modules[0].engine();

    place(&cluster, "k1", "x");
    let plan = PlanBuilder::new("KeysReader")
        .accumulate("count_accumulator", None)
        .build(engine)
        .unwrap();
    let ep = engine
        .run_plan(&plan, ExecMode::AsyncLocal, None, Vec::new())
        .unwrap();
    wait_finished(&ep);

    // No mirror was ever constructed on the peers.
    assert_eq!(modules[1].engine().execution_count(), 0);
    assert_eq!(modules[2].engine().execution_count(), 0);
}

#[test]
fn every_shard_agrees_on_key_ownership() {
    let cluster = MemCluster::new(3);
    let modules = load_cluster(&cluster);

    for key in ["user:1", "user:2", "{tag}a", "{tag}b", "k5"] {
        let owners: Vec<String> = modules
            .iter()
            .map(|m| m.engine().cluster().shard_for_key(key.as_bytes()).to_string())
            .collect();
        assert_eq!(owners[0], owners[1], "key {key}");
        assert_eq!(owners[1], owners[2], "key {key}");
    }
}

#[test]
fn info_cluster_reports_topology() {
    let cluster = MemCluster::new(3);
    let _modules = load_cluster(&cluster);

    let reply = cluster.host(0).execute(&["sluice.infocluster"]);
    let info = reply.as_array().unwrap();
    assert_eq!(info[0].as_str().unwrap(), cluster.host(0).id().as_str());
    assert_eq!(info[1], host::Reply::Integer(3));
    assert_eq!(info[2].as_array().unwrap().len(), 3);
}
