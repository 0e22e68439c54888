//! Command triggers and command hooks: rewrite matching, prefix
//! filtering, recursion and replication guards, and the memory guard.

mod common;

use common::load_module;
use bytes::Bytes;
use engine::{ExecMode, PlanBuilder};
use hooks::NoFilterGuard;
use host::Reply;
use pretty_assertions::assert_eq;
use readers::CommandTriggerArgs;
use record::Record;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_support::{wait_until, MemHost, TestClient};

type Log = Arc<Mutex<Vec<(String, String)>>>;

/// Register a for-each that appends `(key, value)` of a hooked SET
/// call to an in-memory log.
fn register_logger(module: &sluice::Module, log: &Log) {
    let log = log.clone();
    module.engine().mgmt().foreachs.add(
        "append_to_log",
        Arc::new(move |_, record, _| {
            let Record::List(args) = &*record else {
                anyhow::bail!("expected the command argv");
            };
            let arg = |i: usize| match args.get(i) {
                Some(Record::String(s)) => String::from_utf8_lossy(s).into_owned(),
                _ => String::new(),
            };
            log.lock().unwrap().push((arg(1), arg(2)));
            Ok(())
        }),
        None,
    );
}

fn register_set_hook(module: &sluice::Module, log: &Log) -> Arc<engine::Registration> {
    register_logger(module, log);
    let plan = PlanBuilder::new("CommandReader")
        .for_each("append_to_log", None)
        .build(module.engine())
        .unwrap();
    module
        .register_plan(
            plan,
            ExecMode::AsyncLocal,
            Arc::new(CommandTriggerArgs::hook(
                "set",
                Some(Bytes::from_static(b"foo")),
            )),
            false,
        )
        .unwrap()
}

#[test]
fn hooked_set_reaches_the_plan_and_others_pass_through() {
    let host = MemHost::standalone();
    let module = load_module(&host);
    let log: Log = Arc::default();
    register_set_hook(&module, &log);

    host.execute(&["set", "foo", "1"]);
    assert!(wait_until(Duration::from_secs(5), || {
        log.lock().unwrap().len() == 1
    }));
    assert_eq!(
        log.lock().unwrap()[0],
        ("foo".to_string(), "1".to_string())
    );

    // A non-matching key is untouched by the hook.
    assert_eq!(host.execute(&["set", "bar", "1"]), Reply::ok());
    assert_eq!(
        host.execute(&["get", "bar"]),
        Reply::Bulk(Bytes::from_static(b"1"))
    );
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[test]
fn hooked_client_blocks_until_the_execution_finishes() {
    let host = MemHost::standalone();
    let module = load_module(&host);
    let log: Log = Arc::default();
    register_set_hook(&module, &log);

    let client = TestClient::new();
    let argv = ["set", "foo", "7"]
        .iter()
        .map(|a| Bytes::copy_from_slice(a.as_bytes()))
        .collect();
    host.execute_with_client(argv, Some(client.port()));

    let reply = client.wait_reply(Duration::from_secs(5)).expect("unblocked");
    assert!(!reply.is_error(), "got {reply:?}");
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[test]
fn replicated_traffic_bypasses_the_hook() {
    let host = MemHost::standalone();
    let module = load_module(&host);
    let log: Log = Arc::default();
    register_set_hook(&module, &log);

    assert_eq!(host.execute_from_replica(&["set", "foo", "1"]), Reply::ok());
    std::thread::sleep(Duration::from_millis(20));
    assert!(log.lock().unwrap().is_empty());
    assert_eq!(
        host.execute(&["get", "foo"]),
        Reply::Bulk(Bytes::from_static(b"1"))
    );
}

#[test]
fn replicated_rewritten_commands_forward_via_direct_invocation() {
    let host = MemHost::standalone();
    let module = load_module(&host);
    let log: Log = Arc::default();
    register_set_hook(&module, &log);

    // A master rewrote the command before propagating it; the replica
    // replays the rewritten form through the dispatcher. The handler
    // must forward the original command instead of running the
    // callback.
    let mut argv: Vec<Bytes> = ["set", "foo", "9"]
        .iter()
        .map(|a| Bytes::copy_from_slice(a.as_bytes()))
        .collect();
    module.hooks().filter(&mut argv);
    assert_eq!(
        argv[0],
        Bytes::copy_from_slice(hooks::INNER_HOOK_COMMAND.as_bytes()),
        "the filter should have rewritten the call"
    );

    assert_eq!(host.execute_replicated(argv), Reply::ok());
    assert_eq!(
        host.execute(&["get", "foo"]),
        Reply::Bulk(Bytes::from_static(b"9"))
    );
    std::thread::sleep(Duration::from_millis(20));
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn hooked_commands_during_load_forward_via_direct_invocation() {
    let host = MemHost::standalone();
    let module = load_module(&host);
    let log: Log = Arc::default();
    register_set_hook(&module, &log);

    // While the store is loading, the filter still rewrites but the
    // handler forwards the original command untouched.
    host.set_loading(true);
    assert_eq!(host.execute(&["set", "foo", "3"]), Reply::ok());
    host.set_loading(false);

    assert_eq!(
        host.execute(&["get", "foo"]),
        Reply::Bulk(Bytes::from_static(b"3"))
    );
    std::thread::sleep(Duration::from_millis(20));
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn hook_callbacks_do_not_reenter_the_filter() {
    let host = MemHost::standalone();
    let module = load_module(&host);
    let log: Log = Arc::default();
    register_set_hook(&module, &log);

    // Inside a callback the per-thread guard suppresses rewriting.
    let _guard = NoFilterGuard::new();
    let mut argv: Vec<Bytes> = ["set", "foo", "1"]
        .iter()
        .map(|a| Bytes::copy_from_slice(a.as_bytes()))
        .collect();
    module.hooks().filter(&mut argv);
    assert_eq!(argv[0], Bytes::from_static(b"set"));
    drop(_guard);

    // Without the guard the same argv is rewritten.
    module.hooks().filter(&mut argv);
    assert_eq!(argv[0], Bytes::copy_from_slice(hooks::INNER_HOOK_COMMAND.as_bytes()));
}

#[test]
fn denyoom_commands_are_refused_over_the_memory_limit() {
    let host = MemHost::standalone();
    let module = load_module(&host);
    let log: Log = Arc::default();
    register_set_hook(&module, &log);

    host.set_memory_ratio(1.2);
    let reply = host.execute(&["set", "foo", "1"]);
    assert!(reply.is_error());
    assert!(reply.as_str().unwrap().contains("OOM"));
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn hook_registration_validates_the_target_command() {
    let host = MemHost::standalone();
    let module = load_module(&host);
    let log: Log = Arc::default();
    register_logger(&module, &log);

    let plan = |module: &sluice::Module| {
        PlanBuilder::new("CommandReader")
            .for_each("append_to_log", None)
            .build(module.engine())
            .unwrap()
    };

    // noscript commands cannot be hooked.
    let err = module
        .register_plan(
            plan(&module),
            ExecMode::AsyncLocal,
            Arc::new(CommandTriggerArgs::hook("subscribe", None)),
            false,
        )
        .unwrap_err();
    assert!(err.to_string().contains("noscript"));

    // Prefix hooks require a static key spec.
    let err = module
        .register_plan(
            plan(&module),
            ExecMode::AsyncLocal,
            Arc::new(CommandTriggerArgs::hook(
                "georadius",
                Some(Bytes::from_static(b"foo")),
            )),
            false,
        )
        .unwrap_err();
    assert!(err.to_string().contains("movable"));
}

#[test]
fn triggers_run_on_demand_and_reply_with_results() {
    let host = MemHost::standalone();
    let module = load_module(&host);
    let engine = module.engine();

    engine.mgmt().maps.add(
        "arg_count",
        Arc::new(|_, record, _| match record {
            Record::List(items) => Ok(Record::Long(items.len() as i64)),
            other => anyhow::bail!("expected argv list, got {}", other.type_name()),
        }),
        None,
    );

    let plan = PlanBuilder::new("CommandReader")
        .map("arg_count", None)
        .build(engine)
        .unwrap();
    module
        .register_plan(
            plan,
            ExecMode::AsyncLocal,
            Arc::new(CommandTriggerArgs::trigger("count_args")),
            false,
        )
        .unwrap();

    let client = TestClient::new();
    let argv = ["sluice.trigger", "count_args", "a", "b"]
        .iter()
        .map(|a| Bytes::copy_from_slice(a.as_bytes()))
        .collect();
    host.execute_with_client(argv, Some(client.port()));

    let reply = client.wait_reply(Duration::from_secs(5)).expect("unblocked");
    // argv delivered to the reader: ["count_args", "a", "b"].
    assert_eq!(reply, Reply::Array(vec![Reply::Integer(3)]));

    // Pausing registrations suspends trigger dispatch.
    assert_eq!(host.execute(&["sluice.pauseregistrations"]), Reply::ok());
    let reply = host.execute(&["sluice.trigger", "count_args", "x"]);
    assert!(reply.is_error());
    assert_eq!(host.execute(&["sluice.unpauseregistrations"]), Reply::ok());
}
