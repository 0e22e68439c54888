//! Shared fixtures: module loading over the in-memory host and small
//! assertion helpers.
#![allow(dead_code)] // each test binary uses a subset

use host::Reply;
use sluice::Module;
use std::sync::Arc;
use std::time::Duration;
use test_support::{MemCluster, MemHost};

/// Load the module into a host and wire its dispatcher and aux hooks,
/// the way an embedding would at startup.
pub fn load_module(host: &MemHost) -> Module {
    load_module_with_args(host, &[])
}

pub fn load_module_with_args(host: &MemHost, args: &[&str]) -> Module {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    let module = Module::load(host.arc(), &args).expect("module loads");
    let dispatch = module.clone();
    host.set_dispatcher(Arc::new(move |ctx| dispatch.dispatch(ctx)));
    host.set_aux_provider(Arc::new(module.clone()));
    module
}

/// Load one module per shard of a cluster.
pub fn load_cluster(cluster: &MemCluster) -> Vec<Module> {
    cluster.hosts().iter().map(load_module).collect()
}

pub fn wait_finished(ep: &Arc<engine::Execution>) {
    assert!(
        test_support::wait_until(Duration::from_secs(5), || ep.is_finished()),
        "execution {} did not finish (status {})",
        ep.id_str(),
        ep.status()
    );
}

/// Unwrap a `{results, errors}` reply pair.
pub fn results_and_errors(reply: &Reply) -> (&[Reply], &[Reply]) {
    let pair = reply.as_array().expect("results reply is an array");
    (
        pair[0].as_array().expect("results array"),
        pair[1].as_array().expect("errors array"),
    )
}
