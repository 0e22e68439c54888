//! The configuration surface and the replicated configuration store.

mod common;

use common::load_module;
use bytes::Bytes;
use host::Reply;
use pretty_assertions::assert_eq;
use test_support::MemHost;

#[test]
fn configget_and_configset_round_trip() {
    let host = MemHost::standalone();
    let _module = load_module(&host);

    assert_eq!(
        host.execute(&["sluice.configset", "MaxExecutions", "42"]),
        Reply::ok()
    );
    let reply = host.execute(&["sluice.configget", "MaxExecutions", "ExecutionMaxIdleTime"]);
    assert_eq!(
        reply,
        Reply::Array(vec![Reply::bulk_str("42"), Reply::bulk_str("5000")])
    );

    // Unknown keys produce an error entry, not a crash.
    let reply = host.execute(&["sluice.configget", "NoSuchOption"]);
    let entries = reply.as_array().unwrap();
    assert!(entries[0].is_error());

    // Load-time-only options refuse runtime writes.
    let reply = host.execute(&["sluice.configset", "ExecutionThreads", "16"]);
    assert!(reply.is_error());
}

#[test]
fn load_time_arguments_shape_the_engine() {
    let host = MemHost::standalone();
    let module =
        common::load_module_with_args(&host, &["ExecutionThreads", "5", "MaxExecutions", "7"]);
    assert_eq!(module.config().execution_threads(), 5);
    assert_eq!(module.config().max_executions(), 7);
}

#[test]
fn config_store_takes_key_then_value_and_replicates() {
    let host = MemHost::standalone();
    let module = load_module(&host);

    assert_eq!(
        host.execute(&["sluice.innersetconfigstore", "requirements", "payload-blob"]),
        Reply::ok()
    );
    // The command takes <key> <value> in that order.
    let entry = module.config_store().get("requirements").expect("stored");
    assert_eq!(entry.value, Bytes::from_static(b"payload-blob"));
    assert!(module.config_store().get("payload-blob").is_none());

    // The write propagated to replicas via the internal command.
    let replicated = host.replicated_commands();
    assert_eq!(replicated.len(), 1);
    assert_eq!(replicated[0].0, "sluice.innersetconfigstore");

    // Deleting takes the bare key.
    assert_eq!(
        host.execute(&["sluice.innersetconfigstore", "requirements"]),
        Reply::ok()
    );
    assert!(module.config_store().get("requirements").is_none());
}

#[test]
fn config_store_rides_the_rdb_aux_payload() {
    let host = MemHost::standalone();
    let module = load_module(&host);
    host.execute(&["sluice.innersetconfigstore", "a", "1"]);
    host.execute(&["sluice.innersetconfigstore", "b", "2"]);

    let rdb = host.save_rdb(sluice::ENCODING_VERSION);

    let restarted = MemHost::standalone();
    let module2 = load_module(&restarted);
    restarted.load_rdb(&rdb).unwrap();
    assert_eq!(
        module2.config_store().get("a").unwrap().value,
        Bytes::from_static(b"1")
    );
    assert_eq!(
        module2.config_store().get("b").unwrap().value,
        Bytes::from_static(b"2")
    );
}

#[test]
fn hello_reports_identity_and_plugins() {
    let host = MemHost::standalone();
    let module = load_module(&host);
    module.plugins().register("lua", 2);

    let reply = host.execute(&["sluice.hello"]);
    let fields = reply.as_array().unwrap();
    assert_eq!(fields[0].as_str().unwrap(), "sluice");
    assert_eq!(fields[1], Reply::Integer(sluice::ENCODING_VERSION as i64));
    let plugins = fields[3].as_array().unwrap();
    assert_eq!(plugins.len(), 1);
}
