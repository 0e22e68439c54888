//! The client command surface.

use crate::{persist, Module};
use cluster::ClusterView;
use engine::{Execution, INNER_MSG_COMMAND};
use host::{CallContext, Reply, ShardId, SlotRange};
use record::Record;
use std::sync::Arc;

pub const INNER_REGISTER_COMMAND: &str = "sluice.innerregister";
pub const INNER_UNREGISTER_COMMAND: &str = "sluice.innerunregister";

pub(crate) fn dispatch(module: &Module, ctx: &mut CallContext) -> Reply {
    let Some(name) = ctx.arg_str(0).map(str::to_ascii_lowercase) else {
        return Reply::error("malformed command name");
    };
    match name.as_str() {
        "sluice.refreshcluster" => {
            module.engine().refresh_cluster();
            Reply::ok()
        }
        "sluice.clusterset" | "sluice.clustersetfromshard" => cluster_set(module, ctx),
        "sluice.infocluster" => info_cluster(module),
        "sluice.hello" => hello(module),
        INNER_MSG_COMMAND => module.engine().handle_inner_msg(&ctx.args),
        "sluice.innerregister" => inner_register(module, ctx),
        "sluice.innerunregister" => inner_unregister(module, ctx),
        "sluice.dumpexecutions" => Reply::Array(
            module
                .engine()
                .executions()
                .iter()
                .map(|ep| Reply::bulk_str(ep.describe().to_string()))
                .collect(),
        ),
        "sluice.dumpregistrations" => Reply::Array(
            module
                .engine()
                .registrations()
                .iter()
                .map(|reg| Reply::bulk_str(reg.describe().to_string()))
                .collect(),
        ),
        "sluice.getexecution" => with_execution(module, ctx, |_, ep| {
            Reply::bulk_str(ep.describe().to_string())
        }),
        "sluice.getresults" => with_execution(module, ctx, |_, ep| results_reply(ep)),
        "sluice.getresultsblocking" => with_execution(module, ctx, |ctx, ep| {
            if ep.is_finished() {
                return results_reply(ep);
            }
            match ctx.block_client() {
                Some(client) => {
                    ep.add_on_done(
                        module.engine(),
                        Box::new(move |_engine, ep| client.unblock(results_reply(ep))),
                    );
                    Reply::Null // answered on unblock
                }
                None => Reply::error(format!("execution {} is not done yet", ep.id_str())),
            }
        }),
        "sluice.dropexecution" => with_execution(module, ctx, |_, ep| {
            if !ep.is_finished() {
                return Reply::error(format!("execution {} is still running", ep.id_str()));
            }
            ep.drop_execution(module.engine());
            Reply::ok()
        }),
        "sluice.abortexecution" => with_execution(module, ctx, |_, ep| {
            match ep.abort(module.engine()) {
                Ok(()) => Reply::ok(),
                Err(err) => Reply::error(err.to_string()),
            }
        }),
        "sluice.unregister" => {
            let Some(id) = ctx.arg_str(1).map(str::to_string) else {
                return Reply::wrong_arity("sluice.unregister");
            };
            let abort_pending = ctx
                .arg_str(2)
                .is_some_and(|flag| flag.eq_ignore_ascii_case("abortpending"));
            match module.unregister(&id, abort_pending, true) {
                Ok(()) => Reply::ok(),
                Err(err) => Reply::error(err.to_string()),
            }
        }
        "sluice.pauseregistrations" => {
            module.engine().set_triggers_paused(true);
            Reply::ok()
        }
        "sluice.unpauseregistrations" => {
            module.engine().set_triggers_paused(false);
            Reply::ok()
        }
        "sluice.trigger" => {
            if ctx.args.len() < 2 {
                return Reply::wrong_arity("sluice.trigger");
            }
            let plugin = match module.engine().mgmt().reader(readers::COMMAND_READER) {
                Ok(plugin) => plugin,
                Err(err) => return Reply::error(err.to_string()),
            };
            match plugin
                .as_any()
                .downcast_ref::<readers::CommandReaderPlugin>()
            {
                Some(plugin) => plugin.trigger(module.engine(), ctx),
                None => Reply::error("command reader is unavailable"),
            }
        }
        "sluice.clearregistrationsstats" => {
            for registration in module.engine().registrations() {
                registration.stats.clear();
            }
            Reply::ok()
        }
        "sluice.configget" => {
            if ctx.args.len() < 2 {
                return Reply::wrong_arity("sluice.configget");
            }
            Reply::Array(
                (1..ctx.args.len())
                    .map(|i| match ctx.arg_str(i) {
                        Some(key) => match module.config().get(key) {
                            Ok(value) => Reply::bulk_str(value.to_string()),
                            Err(err) => Reply::error(err.to_string()),
                        },
                        None => Reply::error("malformed config key"),
                    })
                    .collect(),
            )
        }
        "sluice.configset" => {
            if ctx.args.len() < 3 || ctx.args.len() % 2 == 0 {
                return Reply::wrong_arity("sluice.configset");
            }
            for pair in (1..ctx.args.len()).step_by(2) {
                let (Some(key), Some(value)) = (ctx.arg_str(pair), ctx.arg_str(pair + 1)) else {
                    return Reply::error("malformed config pair");
                };
                if let Err(err) = module.config().set(key, value) {
                    return Reply::error(err.to_string());
                }
            }
            Reply::ok()
        }
        // The replicated configuration-store command takes
        // `<key> <value>` in that order; a missing value deletes.
        config::INNER_CONFIG_SET_COMMAND => {
            let Some(key) = ctx.arg_str(1).map(str::to_string) else {
                return Reply::wrong_arity(config::INNER_CONFIG_SET_COMMAND);
            };
            let value = ctx.args.get(2).cloned();
            module
                .config_store()
                .set(module.engine().host().as_ref(), &key, value);
            Reply::ok()
        }
        hooks::INNER_HOOK_COMMAND => module.hooks().handle_inner_hook(module.engine(), ctx),
        other => Reply::error(format!("unknown command '{other}'")),
    }
}

fn with_execution(
    module: &Module,
    ctx: &mut CallContext,
    f: impl FnOnce(&mut CallContext, &Arc<Execution>) -> Reply,
) -> Reply {
    let Some(id) = ctx.arg_str(1).map(str::to_string) else {
        return Reply::error("malformed execution id");
    };
    match module.engine().find_execution_str(&id) {
        Some(ep) => f(ctx, &ep),
        None => Reply::error(format!("execution {id} not found")),
    }
}

/// `{results-array, errors-array}` of a finished execution.
fn results_reply(ep: &Arc<Execution>) -> Reply {
    let Some(outcome) = ep.outcome() else {
        return Reply::error(format!("execution {} is not done yet", ep.id_str()));
    };
    Reply::Array(vec![
        Reply::Array(outcome.results.iter().map(Record::reply).collect()),
        Reply::Array(outcome.errors.iter().map(Record::reply).collect()),
    ])
}

fn info_cluster(module: &Module) -> Reply {
    let view = module.engine().cluster();
    Reply::Array(vec![
        Reply::bulk_str(view.my_id().as_str()),
        Reply::Integer(view.size() as i64),
        Reply::Array(
            view.shards()
                .iter()
                .map(|shard| Reply::bulk_str(shard.as_str()))
                .collect(),
        ),
    ])
}

fn hello(module: &Module) -> Reply {
    Reply::Array(vec![
        Reply::bulk_str("sluice"),
        Reply::Integer(crate::ENCODING_VERSION as i64),
        Reply::bulk_str(module.engine().my_id().as_str()),
        Reply::Array(
            module
                .plugins()
                .all()
                .into_iter()
                .map(|(name, version)| {
                    Reply::Array(vec![Reply::bulk_str(name), Reply::Integer(version as i64)])
                })
                .collect(),
        ),
    ])
}

/// `clusterset <my-id> (<shard-id> <first-slot> <last-slot>)...`
fn cluster_set(module: &Module, ctx: &mut CallContext) -> Reply {
    if ctx.args.len() < 5 || (ctx.args.len() - 2) % 3 != 0 {
        return Reply::wrong_arity("sluice.clusterset");
    }
    let Some(my_id) = ctx.arg_str(1).and_then(|s| s.parse::<ShardId>().ok()) else {
        return Reply::error("malformed shard id");
    };
    let mut shards: Vec<ShardId> = Vec::new();
    let mut ranges: Vec<SlotRange> = Vec::new();
    for triple in (2..ctx.args.len()).step_by(3) {
        let (Some(shard), Some(start), Some(end)) = (
            ctx.arg_str(triple).and_then(|s| s.parse::<ShardId>().ok()),
            ctx.arg_str(triple + 1).and_then(|s| s.parse::<u16>().ok()),
            ctx.arg_str(triple + 2).and_then(|s| s.parse::<u16>().ok()),
        ) else {
            return Reply::error("malformed slot range");
        };
        if !shards.contains(&shard) {
            shards.push(shard);
        }
        ranges.push(SlotRange {
            start,
            end,
            shard,
        });
    }
    match ClusterView::from_parts(my_id, shards, &ranges) {
        Ok(view) => {
            module.engine().set_cluster(view);
            Reply::ok()
        }
        Err(err) => Reply::error(err.to_string()),
    }
}

fn inner_register(module: &Module, ctx: &mut CallContext) -> Reply {
    let Some(payload) = ctx.args.get(1).cloned() else {
        return Reply::wrong_arity(INNER_REGISTER_COMMAND);
    };
    match persist::load_registration(
        module,
        &mut wire::BufferReader::new(&payload),
        crate::ENCODING_VERSION,
    ) {
        Ok(registration) => {
            tracing::debug!(registration = %registration.id, "adopted fanned-out registration");
            Reply::ok()
        }
        Err(err) => Reply::error(err.to_string()),
    }
}

fn inner_unregister(module: &Module, ctx: &mut CallContext) -> Reply {
    let Some(id) = ctx.arg_str(1).map(str::to_string) else {
        return Reply::wrong_arity(INNER_UNREGISTER_COMMAND);
    };
    let abort_pending = ctx.arg_str(2) == Some("1");
    match module.unregister(&id, abort_pending, false) {
        Ok(()) => Reply::ok(),
        Err(err) => Reply::error(err.to_string()),
    }
}
