use crate::{
    ArgValue, Engine, EngineId, Error, ExecMode, FlatPlan, PlanBuilder, ReaderInstance,
    ReaderNext, ReaderPlugin, StepCtx, StepKind, ENCODING_VERSION,
};
use config::Config;
use pretty_assertions::assert_eq;
use record::Record;
use std::sync::Arc;
use std::time::Duration;
use test_support::{wait_until, MemHost};

/// A reader yielding a fixed record sequence; registered as "VecReader".
struct VecReader {
    records: Vec<Record>,
}

impl ReaderInstance for VecReader {
    fn next(&mut self, _ctx: &mut StepCtx<'_>) -> ReaderNext {
        match self.records.is_empty() {
            true => ReaderNext::Exhausted,
            false => ReaderNext::Rec(self.records.remove(0)),
        }
    }

    fn serialize_args(&self, engine: &Engine, w: &mut wire::BufferWriter<'_>) -> Result<(), Error> {
        w.write_varu64(self.records.len() as u64);
        for record in &self.records {
            record.serialize(engine.types(), w)?;
        }
        Ok(())
    }
}

struct VecReaderPlugin;

impl ReaderPlugin for VecReaderPlugin {
    fn name(&self) -> &'static str {
        "VecReader"
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn instantiate(&self, engine: &Engine, args: &[u8]) -> Result<Box<dyn ReaderInstance>, Error> {
        let mut r = wire::BufferReader::new(args);
        let count = r.read_varu64()? as usize;
        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            records.push(Record::deserialize(&mut r, engine.types())?);
        }
        Ok(Box::new(VecReader { records }))
    }
}

fn test_engine() -> Engine {
    let engine = Engine::new(MemHost::standalone().arc(), Arc::new(Config::new()));
    engine
        .mgmt()
        .readers
        .add("VecReader", Arc::new(VecReaderPlugin), None);
    engine
}

fn run_records(
    engine: &Engine,
    plan: &Arc<FlatPlan>,
    records: Vec<Record>,
) -> Arc<crate::Execution> {
    let ep = engine
        .run_plan_with_reader(plan, ExecMode::Async, Box::new(VecReader { records }), Vec::new())
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || ep.is_finished()));
    ep
}

#[test]
fn ids_round_trip_through_strings() {
    let id = EngineId {
        node: host::ShardId::of("node-x"),
        seq: 17,
    };
    let parsed: EngineId = id.to_string().parse().unwrap();
    assert_eq!(parsed, id);
    assert!("garbage".parse::<EngineId>().is_err());
}

#[test]
fn builder_rejects_unknown_callbacks() {
    let engine = test_engine();
    let err = PlanBuilder::new("VecReader")
        .map("no_such_map", None)
        .build(&engine)
        .unwrap_err();
    assert!(matches!(err, Error::UnknownCallback { .. }));

    let err = PlanBuilder::new("NoSuchReader").build(&engine).unwrap_err();
    assert!(matches!(err, Error::UnknownReader(_)));
}

#[test]
fn group_by_expands_to_four_steps() {
    let engine = test_engine();
    let plan = PlanBuilder::new("VecReader")
        .group_by("key_extractor", None, "count_reducer", None)
        .build(&engine)
        .unwrap();
    let kinds: Vec<StepKind> = plan.steps.iter().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        vec![
            StepKind::ExtractKey,
            StepKind::Repartition,
            StepKind::Group,
            StepKind::Reduce
        ]
    );
}

#[test]
fn plans_serialize_and_deserialize_structurally() {
    let engine = test_engine();
    let plan = PlanBuilder::new("VecReader")
        .desc("roundtrip")
        .map("value_mapper", Some(ArgValue::Str("arg".into())))
        .limit(1, 2)
        .max_idle(Duration::from_millis(1234))
        .plugin("py", 3)
        .build(&engine)
        .unwrap();

    let bytes = plan.to_bytes().unwrap();
    let restored = FlatPlan::from_bytes(&bytes, ENCODING_VERSION).unwrap();
    assert_eq!(restored.id, plan.id);
    assert_eq!(restored.desc.as_deref(), Some("roundtrip"));
    assert_eq!(restored.reader, "VecReader");
    assert_eq!(restored.steps.len(), 2);
    assert_eq!(restored.steps[0].kind, StepKind::Map);
    assert_eq!(restored.steps[0].arg, Some(ArgValue::Str("arg".into())));
    assert_eq!(restored.steps[1].kind, StepKind::Limit);
    assert_eq!(restored.max_idle, Some(Duration::from_millis(1234)));
    assert_eq!(restored.plugin.as_ref().unwrap().name, "py");

    // Future encodings refuse to load.
    assert!(matches!(
        FlatPlan::from_bytes(&bytes, ENCODING_VERSION + 1),
        Err(Error::UnsupportedEncVer(_))
    ));
}

#[test]
fn limit_takes_a_window_of_the_stream() {
    let engine = test_engine();
    let plan = PlanBuilder::new("VecReader").limit(1, 2).build(&engine).unwrap();
    let ep = run_records(
        &engine,
        &plan,
        (0..5).map(Record::Long).collect(),
    );
    assert_eq!(
        ep.outcome().unwrap().results,
        vec![Record::Long(1), Record::Long(2)]
    );
}

#[test]
fn flat_map_emits_one_element_per_pull() {
    let engine = test_engine();
    engine.mgmt().maps.add(
        "explode",
        Arc::new(|_, record, _| match record {
            Record::Long(n) => Ok(Record::List((0..n).map(Record::Long).collect())),
            other => Ok(other),
        }),
        None,
    );
    let plan = PlanBuilder::new("VecReader")
        .flat_map("explode", None)
        .build(&engine)
        .unwrap();
    let ep = run_records(&engine, &plan, vec![Record::Long(2), Record::Long(1)]);
    assert_eq!(
        ep.outcome().unwrap().results,
        vec![Record::Long(0), Record::Long(1), Record::Long(0)]
    );
}

#[test]
fn group_by_without_a_cluster_groups_locally() {
    let engine = test_engine();
    let plan = PlanBuilder::new("VecReader")
        .group_by("key_extractor", None, "count_reducer", None)
        .build(&engine)
        .unwrap();
    let records = vec![
        Record::key("x", Some(Record::Long(1))),
        Record::key("y", Some(Record::Long(2))),
        Record::key("x", Some(Record::Long(3))),
    ];
    let ep = run_records(&engine, &plan, records);
    let outcome = ep.outcome().unwrap();
    assert!(outcome.errors.is_empty());

    let mut counts: Vec<(String, i64)> = outcome
        .results
        .iter()
        .map(|r| match r {
            Record::Key(kr) => match kr.value.as_deref() {
                Some(Record::Long(n)) => (kr.key_str().into_owned(), *n),
                other => panic!("unexpected value {other:?}"),
            },
            other => panic!("unexpected record {other:?}"),
        })
        .collect();
    counts.sort();
    assert_eq!(counts, vec![("x".to_string(), 2), ("y".to_string(), 1)]);
}

#[test]
fn accumulate_by_key_keeps_running_state_per_key() {
    let engine = test_engine();
    let plan = PlanBuilder::new("VecReader")
        .local_accumulate_by_key("key_extractor", None, "count_by_key", None)
        .build(&engine)
        .unwrap();
    let records = vec![
        Record::key("a", Some(Record::Long(0))),
        Record::key("a", Some(Record::Long(0))),
        Record::key("b", Some(Record::Long(0))),
    ];
    let ep = run_records(&engine, &plan, records);
    let mut counts: Vec<(String, i64)> = ep
        .outcome()
        .unwrap()
        .results
        .iter()
        .map(|r| match r {
            Record::Key(kr) => match kr.value.as_deref() {
                Some(Record::Long(n)) => (kr.key_str().into_owned(), *n),
                other => panic!("unexpected value {other:?}"),
            },
            other => panic!("unexpected record {other:?}"),
        })
        .collect();
    counts.sort();
    assert_eq!(counts, vec![("a".to_string(), 2), ("b".to_string(), 1)]);
}

#[test]
fn deep_copy_takes_a_fresh_identity() {
    let engine = test_engine();
    let plan = PlanBuilder::new("VecReader").build(&engine).unwrap();
    plan.mark_registered();
    let copy = plan.deep_copy(&engine);
    assert_ne!(copy.id, plan.id);
    assert!(!copy.is_registered());
    assert_eq!(copy.reader, plan.reader);
}
