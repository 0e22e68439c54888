//! Stream-reader registrations: batching, failure policies, acking,
//! trimming, and persistence across restart.

mod common;

use common::load_module;
use bytes::Bytes;
use engine::{ExecMode, PlanBuilder};
use readers::{FailurePolicy, StreamTriggerArgs, CONSUMER_GROUP};
use record::Record;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use test_support::{wait_until, MemHost};

fn entry(v: &str) -> Vec<(Bytes, Bytes)> {
    vec![(Bytes::from_static(b"v"), Bytes::copy_from_slice(v.as_bytes()))]
}

/// A map callback dividing each entry's value by the value at key "d".
fn register_divider(module: &sluice::Module) {
    module.engine().mgmt().maps.add(
        "divide_by_d",
        Arc::new(|ctx, record, _| {
            let Record::HashSet(top) = &record else {
                anyhow::bail!("expected a stream entry record");
            };
            let Some(Record::HashSet(fields)) = top.get("value") else {
                anyhow::bail!("stream entry without value");
            };
            let Some(Record::String(v)) = fields.get("v") else {
                anyhow::bail!("stream entry without field v");
            };
            let v: i64 = std::str::from_utf8(v)?.parse()?;

            let host = ctx.engine().host().clone();
            let d = host
                .open_key(b"d")
                .and_then(|k| k.0.value())
                .and_then(|v| match v {
                    host::KeyValue::String(s) => {
                        String::from_utf8_lossy(&s).parse::<i64>().ok()
                    }
                    _ => None,
                })
                .unwrap_or(1);
            if d == 0 {
                anyhow::bail!("division by zero");
            }
            Ok(Record::Long(v / d))
        }),
        None,
    );
}

fn register_stream_plan(
    module: &sluice::Module,
    args: StreamTriggerArgs,
) -> Arc<engine::Registration> {
    let plan = PlanBuilder::new("StreamReader")
        .map("divide_by_d", None)
        .build(module.engine())
        .unwrap();
    module
        .register_plan(plan, ExecMode::AsyncLocal, Arc::new(args), false)
        .unwrap()
}

#[test]
fn batches_ack_and_record_failures_with_continue_policy() {
    let host = MemHost::standalone();
    let module = load_module(&host);
    register_divider(&module);

    let mut args = StreamTriggerArgs::new("s*", 2);
    args.duration_ms = 100;
    args.policy = FailurePolicy::Continue;
    let registration = register_stream_plan(&module, args);

    host.execute(&["set", "d", "1"]);
    host.xadd(b"s1", entry("1"));
    host.xadd(b"s1", entry("2"));

    // Two arrivals reach the batch size and fire immediately.
    assert!(wait_until(Duration::from_secs(5), || {
        registration.stats.success.load(Ordering::SeqCst) == 1
    }));

    // Third message divides by zero; fourth completes the batch.
    host.execute(&["set", "d", "0"]);
    host.xadd(b"s1", entry("3"));
    host.xadd(b"s1", entry("4"));

    assert!(wait_until(Duration::from_secs(5), || {
        registration.stats.failures.load(Ordering::SeqCst) == 1
    }));
    assert!(registration
        .stats
        .last_error
        .lock()
        .clone()
        .unwrap()
        .contains("division by zero"));
    assert_eq!(registration.stats.triggered.load(Ordering::SeqCst), 2);

    // Continue policy acks every message in both batches.
    assert!(wait_until(Duration::from_secs(5), || {
        host.stream_pending(b"s1", CONSUMER_GROUP).is_empty()
    }));
    assert_eq!(host.stream_length(b"s1"), 4);
}

#[test]
fn abort_policy_stops_further_batches() {
    let host = MemHost::standalone();
    let module = load_module(&host);
    register_divider(&module);

    let mut args = StreamTriggerArgs::new("s*", 1);
    args.policy = FailurePolicy::Abort;
    let registration = register_stream_plan(&module, args);

    host.execute(&["set", "d", "0"]);
    host.xadd(b"s1", entry("1"));
    assert!(wait_until(Duration::from_secs(5), || {
        registration.stats.failures.load(Ordering::SeqCst) == 1
    }));

    // Further arrivals no longer trigger.
    host.xadd(b"s1", entry("2"));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(registration.stats.triggered.load(Ordering::SeqCst), 1);
}

#[test]
fn retry_policy_rearms_after_the_interval() {
    let host = MemHost::standalone();
    let module = load_module(&host);
    register_divider(&module);

    let mut args = StreamTriggerArgs::new("s*", 1);
    args.policy = FailurePolicy::Retry;
    args.retry_interval_s = 3;
    let registration = register_stream_plan(&module, args);

    host.execute(&["set", "d", "0"]);
    host.xadd(b"s1", entry("1"));
    assert!(wait_until(Duration::from_secs(5), || {
        registration.stats.failures.load(Ordering::SeqCst) >= 1
    }));
    let failures = registration.stats.failures.load(Ordering::SeqCst);

    // Heal the divisor, then let the retry timer re-arm scanning.
    host.execute(&["set", "d", "1"]);
    host.advance(Duration::from_secs(4));
    assert!(wait_until(Duration::from_secs(5), || {
        registration.stats.success.load(Ordering::SeqCst) >= 1
    }));
    assert_eq!(registration.stats.failures.load(Ordering::SeqCst), failures);
}

#[test]
fn trim_flag_shrinks_the_stream_by_the_acked_count() {
    let host = MemHost::standalone();
    let module = load_module(&host);
    register_divider(&module);

    let mut args = StreamTriggerArgs::new("s*", 2);
    args.trim_stream = true;
    let registration = register_stream_plan(&module, args);

    host.execute(&["set", "d", "1"]);
    host.xadd(b"s1", entry("1"));
    host.xadd(b"s1", entry("2"));

    assert!(wait_until(Duration::from_secs(5), || {
        registration.stats.success.load(Ordering::SeqCst) == 1
    }));
    // The stream shrank by exactly the acked count.
    assert!(wait_until(Duration::from_secs(5), || {
        host.stream_length(b"s1") == 0
    }));
}

#[test]
fn registrations_survive_restart_and_groups_continue() {
    let id = host::ShardId::of("restarting");
    let host = MemHost::new(id);
    let module = load_module(&host);
    register_divider(&module);

    let registration = register_stream_plan(&module, StreamTriggerArgs::new("s*", 1));

    host.execute(&["set", "d", "1"]);
    host.xadd(b"s1", entry("1"));
    assert!(wait_until(Duration::from_secs(5), || {
        registration.stats.success.load(Ordering::SeqCst) >= 1
    }));

    // Snapshot, then bring up a fresh host from it.
    let rdb = host.save_rdb(sluice::ENCODING_VERSION);
    module.shutdown();

    let restarted = MemHost::new(id);
    let module2 = load_module(&restarted);
    register_divider(&module2);
    restarted.load_rdb(&rdb).unwrap();

    // The same (id, mode, args) triple came back.
    let regs = module2.engine().registrations();
    assert_eq!(regs.len(), 1);
    assert_eq!(regs[0].id, registration.id);
    assert_eq!(regs[0].mode, registration.mode);
    assert_eq!(regs[0].args.describe(), registration.args.describe());

    // The consumer group resumes past everything already acked: only
    // the new entry triggers work.
    restarted.xadd(b"s1", entry("5"));
    assert!(wait_until(Duration::from_secs(5), || {
        regs[0].stats.success.load(Ordering::SeqCst) >= 1
    }));
    assert_eq!(regs[0].stats.triggered.load(Ordering::SeqCst), 1);
    let done = regs[0].done_executions();
    let outcome = done[0].outcome().unwrap();
    assert_eq!(outcome.results, vec![Record::Long(5)]);
}
