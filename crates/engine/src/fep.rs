//! Flat execution plans: immutable operator templates.
//!
//! A plan is built once, validated against the management registries,
//! and then shared by executions and registrations through `Arc`
//! handles. Plans serialize for cross-shard mirroring and registration
//! persistence; a plan that is already registered and is registered
//! again with different arguments is deep-copied instead of mutated.

use crate::args::ArgValue;
use crate::{Engine, Error, PlanId, ENCODING_VERSION};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wire::{BufferReader, BufferWriter};

/// The terminal list of step kinds.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum StepKind {
    Map,
    FlatMap,
    Filter,
    ExtractKey,
    Repartition,
    Group,
    Reduce,
    Collect,
    ForEach,
    Limit,
    Accumulate,
    AccumulateByKey,
    Reader,
}

impl StepKind {
    fn code(self) -> u64 {
        match self {
            StepKind::Map => 0,
            StepKind::FlatMap => 1,
            StepKind::Filter => 2,
            StepKind::ExtractKey => 3,
            StepKind::Repartition => 4,
            StepKind::Group => 5,
            StepKind::Reduce => 6,
            StepKind::Collect => 7,
            StepKind::ForEach => 8,
            StepKind::Limit => 9,
            StepKind::Accumulate => 10,
            StepKind::AccumulateByKey => 11,
            StepKind::Reader => 12,
        }
    }

    fn from_code(code: u64) -> Result<StepKind, Error> {
        Ok(match code {
            0 => StepKind::Map,
            1 => StepKind::FlatMap,
            2 => StepKind::Filter,
            3 => StepKind::ExtractKey,
            4 => StepKind::Repartition,
            5 => StepKind::Group,
            6 => StepKind::Reduce,
            7 => StepKind::Collect,
            8 => StepKind::ForEach,
            9 => StepKind::Limit,
            10 => StepKind::Accumulate,
            11 => StepKind::AccumulateByKey,
            12 => StepKind::Reader,
            other => return Err(Error::Malformed(format!("unknown step kind {other}"))),
        })
    }
}

/// One flat step: kind, callback name, and the opaque argument with
/// the name of the arg type interpreting it.
#[derive(Debug, Clone)]
pub struct FlatStep {
    pub kind: StepKind,
    pub name: String,
    pub arg: Option<ArgValue>,
    pub arg_type: Option<String>,
}

impl FlatStep {
    fn serialize(&self, w: &mut BufferWriter<'_>) {
        w.write_varu64(self.kind.code());
        w.write_str(&self.name);
        match &self.arg {
            Some(arg) => {
                w.write_varu64(1);
                arg.serialize(w);
            }
            None => w.write_varu64(0),
        }
        w.write_str(self.arg_type.as_deref().unwrap_or(""));
    }

    fn deserialize(r: &mut BufferReader<'_>) -> Result<FlatStep, Error> {
        let kind = StepKind::from_code(r.read_varu64()?)?;
        let name = r.read_str()?.to_string();
        let arg = match r.read_varu64()? {
            0 => None,
            _ => Some(ArgValue::deserialize(r)?),
        };
        let arg_type = match r.read_str()? {
            "" => None,
            t => Some(t.to_string()),
        };
        Ok(FlatStep {
            kind,
            name,
            arg,
            arg_type,
        })
    }
}

/// A lifecycle hook on a plan (on-start, on-unpaused, on-registered,
/// on-unregistered).
#[derive(Debug, Clone)]
pub struct HookStep {
    pub name: String,
    pub arg: Option<ArgValue>,
}

/// Plugin provenance of a plan. Registrations persisted to RDB refuse
/// to load when the plugin is absent or older than required.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginRef {
    pub name: String,
    pub version: u32,
}

/// The immutable operator template.
#[derive(Debug)]
pub struct FlatPlan {
    pub id: PlanId,
    pub id_str: String,
    pub desc: Option<String>,
    pub reader: String,
    /// Serialized reader arguments used when running the plan without
    /// an explicit reader instance (registrations, mirrors).
    pub reader_args: Option<Bytes>,
    /// Operator steps in input order; the reader is not among them.
    pub steps: Vec<FlatStep>,
    pub on_start: Option<HookStep>,
    pub on_unpaused: Option<HookStep>,
    pub on_registered: Option<HookStep>,
    pub on_unregistered: Option<HookStep>,
    pub private_data: Option<(String, ArgValue)>,
    /// Overrides `ExecutionMaxIdleTime` when set.
    pub max_idle: Option<Duration>,
    pub pool: String,
    pub plugin: Option<PluginRef>,
    registered: AtomicBool,
}

impl FlatPlan {
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn mark_registered(&self) {
        self.registered.store(true, Ordering::SeqCst);
    }

    /// Copy into a fresh plan with its own id. Used when a registered
    /// plan is registered again with different arguments.
    pub fn deep_copy(&self, engine: &Engine) -> Arc<FlatPlan> {
        let id = engine.next_id();
        Arc::new(FlatPlan {
            id,
            id_str: id.to_string(),
            desc: self.desc.clone(),
            reader: self.reader.clone(),
            reader_args: self.reader_args.clone(),
            steps: self.steps.clone(),
            on_start: self.on_start.clone(),
            on_unpaused: self.on_unpaused.clone(),
            on_registered: self.on_registered.clone(),
            on_unregistered: self.on_unregistered.clone(),
            private_data: self.private_data.clone(),
            max_idle: self.max_idle,
            pool: self.pool.clone(),
            plugin: self.plugin.clone(),
            registered: AtomicBool::new(false),
        })
    }

    pub fn serialize(&self, w: &mut BufferWriter<'_>) -> Result<(), Error> {
        self.id.serialize(w);
        w.write_str(self.desc.as_deref().unwrap_or(""));
        w.write_str(&self.reader);
        match &self.reader_args {
            Some(args) => {
                w.write_varu64(1);
                w.write_bytes(args);
            }
            None => w.write_varu64(0),
        }
        w.write_varu64(self.steps.len() as u64);
        for step in &self.steps {
            step.serialize(w);
        }
        for hook in [
            &self.on_start,
            &self.on_unpaused,
            &self.on_registered,
            &self.on_unregistered,
        ] {
            match hook {
                Some(hook) => {
                    w.write_varu64(1);
                    w.write_str(&hook.name);
                    match &hook.arg {
                        Some(arg) => {
                            w.write_varu64(1);
                            arg.serialize(w);
                        }
                        None => w.write_varu64(0),
                    }
                }
                None => w.write_varu64(0),
            }
        }
        match &self.private_data {
            Some((type_name, arg)) => {
                w.write_varu64(1);
                w.write_str(type_name);
                arg.serialize(w);
            }
            None => w.write_varu64(0),
        }
        w.write_varu64(self.max_idle.map_or(0, |d| d.as_millis() as u64));
        w.write_str(&self.pool);
        match &self.plugin {
            Some(p) => {
                w.write_varu64(1);
                w.write_str(&p.name);
                w.write_varu64(p.version as u64);
            }
            None => w.write_varu64(0),
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut buf = wire::Buffer::new();
        self.serialize(&mut buf.writer())?;
        Ok(buf.into_bytes())
    }

    pub fn deserialize(r: &mut BufferReader<'_>, encver: u32) -> Result<FlatPlan, Error> {
        if encver > ENCODING_VERSION {
            return Err(Error::UnsupportedEncVer(encver));
        }
        let id = PlanId::deserialize(r)?;
        let desc = match r.read_str()? {
            "" => None,
            d => Some(d.to_string()),
        };
        let reader = r.read_str()?.to_string();
        let reader_args = match r.read_varu64()? {
            0 => None,
            _ => Some(Bytes::copy_from_slice(r.read_bytes()?)),
        };
        let step_count = r.read_varu64()? as usize;
        let mut steps = Vec::with_capacity(step_count.min(256));
        for _ in 0..step_count {
            steps.push(FlatStep::deserialize(r)?);
        }
        let mut hooks: Vec<Option<HookStep>> = Vec::with_capacity(4);
        for _ in 0..4 {
            hooks.push(match r.read_varu64()? {
                0 => None,
                _ => {
                    let name = r.read_str()?.to_string();
                    let arg = match r.read_varu64()? {
                        0 => None,
                        _ => Some(ArgValue::deserialize(r)?),
                    };
                    Some(HookStep { name, arg })
                }
            });
        }
        let private_data = match r.read_varu64()? {
            0 => None,
            _ => Some((r.read_str()?.to_string(), ArgValue::deserialize(r)?)),
        };
        let max_idle = match r.read_varu64()? {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        let pool = r.read_str()?.to_string();
        let plugin = match r.read_varu64()? {
            0 => None,
            _ => Some(PluginRef {
                name: r.read_str()?.to_string(),
                version: r.read_varu64()? as u32,
            }),
        };
        let mut hooks = hooks.into_iter();
        Ok(FlatPlan {
            id,
            id_str: id.to_string(),
            desc,
            reader,
            reader_args,
            steps,
            on_start: hooks.next().flatten(),
            on_unpaused: hooks.next().flatten(),
            on_registered: hooks.next().flatten(),
            on_unregistered: hooks.next().flatten(),
            private_data,
            max_idle,
            pool,
            plugin,
            registered: AtomicBool::new(false),
        })
    }

    pub fn from_bytes(bytes: &[u8], encver: u32) -> Result<FlatPlan, Error> {
        FlatPlan::deserialize(&mut BufferReader::new(bytes), encver)
    }
}

/// Builder over the flat-plan grammar. Composite operations expand the
/// way clients expect: `group_by` becomes extract-key, repartition,
/// group, reduce; `accumulate_by_key` repartitions unless the local
/// variant is asked for.
pub struct PlanBuilder {
    desc: Option<String>,
    reader: String,
    reader_args: Option<Bytes>,
    steps: Vec<FlatStep>,
    on_start: Option<HookStep>,
    on_unpaused: Option<HookStep>,
    on_registered: Option<HookStep>,
    on_unregistered: Option<HookStep>,
    private_data: Option<(String, ArgValue)>,
    max_idle: Option<Duration>,
    pool: String,
    plugin: Option<PluginRef>,
}

impl PlanBuilder {
    pub fn new(reader: &str) -> PlanBuilder {
        PlanBuilder {
            desc: None,
            reader: reader.to_string(),
            reader_args: None,
            steps: Vec::new(),
            on_start: None,
            on_unpaused: None,
            on_registered: None,
            on_unregistered: None,
            private_data: None,
            max_idle: None,
            pool: crate::DEFAULT_POOL.to_string(),
            plugin: None,
        }
    }

    pub fn desc(mut self, desc: &str) -> Self {
        self.desc = Some(desc.to_string());
        self
    }

    pub fn reader_args(mut self, args: Bytes) -> Self {
        self.reader_args = Some(args);
        self
    }

    pub fn pool(mut self, pool: &str) -> Self {
        self.pool = pool.to_string();
        self
    }

    pub fn max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = Some(max_idle);
        self
    }

    pub fn private_data(mut self, type_name: &str, arg: ArgValue) -> Self {
        self.private_data = Some((type_name.to_string(), arg));
        self
    }

    pub fn plugin(mut self, name: &str, version: u32) -> Self {
        self.plugin = Some(PluginRef {
            name: name.to_string(),
            version,
        });
        self
    }

    pub fn on_start(mut self, name: &str, arg: Option<ArgValue>) -> Self {
        self.on_start = Some(HookStep { name: name.to_string(), arg });
        self
    }

    pub fn on_unpaused(mut self, name: &str, arg: Option<ArgValue>) -> Self {
        self.on_unpaused = Some(HookStep { name: name.to_string(), arg });
        self
    }

    pub fn on_registered(mut self, name: &str, arg: Option<ArgValue>) -> Self {
        self.on_registered = Some(HookStep { name: name.to_string(), arg });
        self
    }

    pub fn on_unregistered(mut self, name: &str, arg: Option<ArgValue>) -> Self {
        self.on_unregistered = Some(HookStep { name: name.to_string(), arg });
        self
    }

    fn push(&mut self, kind: StepKind, name: &str, arg: Option<ArgValue>) {
        self.steps.push(FlatStep {
            kind,
            name: name.to_string(),
            arg,
            arg_type: None,
        });
    }

    pub fn map(mut self, name: &str, arg: Option<ArgValue>) -> Self {
        self.push(StepKind::Map, name, arg);
        self
    }

    pub fn flat_map(mut self, name: &str, arg: Option<ArgValue>) -> Self {
        self.push(StepKind::FlatMap, name, arg);
        self
    }

    pub fn filter(mut self, name: &str, arg: Option<ArgValue>) -> Self {
        self.push(StepKind::Filter, name, arg);
        self
    }

    pub fn for_each(mut self, name: &str, arg: Option<ArgValue>) -> Self {
        self.push(StepKind::ForEach, name, arg);
        self
    }

    pub fn limit(mut self, offset: u64, len: u64) -> Self {
        self.push(
            StepKind::Limit,
            "limit",
            Some(ArgValue::Pair(offset as i64, len as i64)),
        );
        self
    }

    pub fn accumulate(mut self, name: &str, arg: Option<ArgValue>) -> Self {
        self.push(StepKind::Accumulate, name, arg);
        self
    }

    pub fn collect(mut self) -> Self {
        self.push(StepKind::Collect, "", None);
        self
    }

    pub fn repartition(mut self, extractor: &str, arg: Option<ArgValue>) -> Self {
        self.push(StepKind::ExtractKey, extractor, arg);
        self.push(StepKind::Repartition, "", None);
        self
    }

    pub fn group_by(
        mut self,
        extractor: &str,
        extractor_arg: Option<ArgValue>,
        reducer: &str,
        reducer_arg: Option<ArgValue>,
    ) -> Self {
        self.push(StepKind::ExtractKey, extractor, extractor_arg);
        self.push(StepKind::Repartition, "", None);
        self.push(StepKind::Group, "", None);
        self.push(StepKind::Reduce, reducer, reducer_arg);
        self
    }

    pub fn accumulate_by_key(
        mut self,
        extractor: &str,
        extractor_arg: Option<ArgValue>,
        accumulator: &str,
        accumulator_arg: Option<ArgValue>,
    ) -> Self {
        self.push(StepKind::ExtractKey, extractor, extractor_arg);
        self.push(StepKind::Repartition, "", None);
        self.push(StepKind::AccumulateByKey, accumulator, accumulator_arg);
        self
    }

    pub fn local_accumulate_by_key(
        mut self,
        extractor: &str,
        extractor_arg: Option<ArgValue>,
        accumulator: &str,
        accumulator_arg: Option<ArgValue>,
    ) -> Self {
        self.push(StepKind::ExtractKey, extractor, extractor_arg);
        self.push(StepKind::AccumulateByKey, accumulator, accumulator_arg);
        self
    }

    /// Validate every named callback against the registries and seal
    /// the plan.
    pub fn build(self, engine: &Engine) -> Result<Arc<FlatPlan>, Error> {
        let mgmt = engine.mgmt();
        mgmt.reader(&self.reader)?;
        for step in &self.steps {
            match step.kind {
                StepKind::Map | StepKind::FlatMap => {
                    mgmt.maps.require(&step.name)?;
                }
                StepKind::Filter => {
                    mgmt.filters.require(&step.name)?;
                }
                StepKind::ExtractKey => {
                    mgmt.extractors.require(&step.name)?;
                }
                StepKind::Reduce => {
                    mgmt.reducers.require(&step.name)?;
                }
                StepKind::Accumulate => {
                    mgmt.accumulators.require(&step.name)?;
                }
                StepKind::AccumulateByKey => {
                    mgmt.accumulators_by_key.require(&step.name)?;
                }
                StepKind::ForEach => {
                    mgmt.foreachs.require(&step.name)?;
                }
                StepKind::Repartition
                | StepKind::Group
                | StepKind::Collect
                | StepKind::Limit
                | StepKind::Reader => {}
            }
        }
        if let Some(hook) = &self.on_start {
            mgmt.on_starts.require(&hook.name)?;
        }
        if let Some(hook) = &self.on_unpaused {
            mgmt.on_unpauseds.require(&hook.name)?;
        }
        if let Some(hook) = &self.on_registered {
            mgmt.on_registereds.require(&hook.name)?;
        }
        if let Some(hook) = &self.on_unregistered {
            mgmt.on_unregistereds.require(&hook.name)?;
        }
        engine.pool(&self.pool)?;

        let id = engine.next_id();
        Ok(Arc::new(FlatPlan {
            id,
            id_str: id.to_string(),
            desc: self.desc,
            reader: self.reader,
            reader_args: self.reader_args,
            steps: self.steps,
            on_start: self.on_start,
            on_unpaused: self.on_unpaused,
            on_registered: self.on_registered,
            on_unregistered: self.on_unregistered,
            private_data: self.private_data,
            max_idle: self.max_idle,
            pool: self.pool,
            plugin: self.plugin,
            registered: AtomicBool::new(false),
        }))
    }
}
