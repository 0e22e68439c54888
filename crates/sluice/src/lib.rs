//! Module assembly: wires the engine, the command-hook layer, the
//! readers, configuration, persistence, and the client command surface
//! into the embedding host.
//!
//! The embedding loads the module exactly once per process
//! ([`Module::load`]), routes every `sluice.*` command into
//! [`Module::dispatch`], registers the module as the aux-save/-load
//! provider, and calls [`Module::shutdown`] on the host's shutdown
//! event.

use config::{Config, ConfigStore};
use engine::{Engine, Error, ExecMode, Registration, TriggerArgs};
use hooks::HookRegistry;
use host::{Host, Reply};
use std::sync::Arc;

mod commands;
mod persist;
mod plugins;

pub use plugins::PluginRegistry;

/// Monotonic encoding version of the module's persisted payloads.
pub use engine::ENCODING_VERSION;

struct ModuleInner {
    engine: Engine,
    hooks: Arc<HookRegistry>,
    config: Arc<Config>,
    store: Arc<ConfigStore>,
    plugins: PluginRegistry,
}

/// The loaded module. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Module {
    inner: Arc<ModuleInner>,
}

impl Module {
    /// Initialize every subsystem. Any failure here means the host
    /// must refuse to load the module.
    pub fn load(host: Arc<dyn Host>, load_args: &[String]) -> anyhow::Result<Module> {
        let config = Arc::new(Config::new());
        config
            .apply_load_args(load_args)
            .map_err(|err| anyhow::anyhow!("bad module arguments: {err}"))?;

        let engine = Engine::new(host.clone(), config.clone());
        let hooks = HookRegistry::new();
        hooks.install(&host);
        readers::register_all(&engine, &hooks);

        let module = Module {
            inner: Arc::new(ModuleInner {
                engine,
                hooks,
                config,
                store: Arc::new(ConfigStore::new()),
                plugins: PluginRegistry::new(),
            }),
        };
        tracing::info!(shard = %module.inner.engine.my_id(), "module loaded");
        Ok(module)
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.inner.hooks
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.inner.config
    }

    pub fn config_store(&self) -> &Arc<ConfigStore> {
        &self.inner.store
    }

    pub fn plugins(&self) -> &PluginRegistry {
        &self.inner.plugins
    }

    /// Entry point of every `sluice.*` command.
    pub fn dispatch(&self, ctx: &mut host::CallContext) -> Reply {
        let _guard = self.inner.engine.lock().acquire();
        commands::dispatch(self, ctx)
    }

    /// Create a registration of `fep` and wire its trigger source.
    /// With `distribute`, fan the registration out to every peer.
    pub fn register_plan(
        &self,
        fep: Arc<engine::FlatPlan>,
        mode: ExecMode,
        trigger_args: Arc<dyn TriggerArgs>,
        distribute: bool,
    ) -> Result<Arc<Registration>, Error> {
        let engine = &self.inner.engine;
        let plugin = engine.mgmt().reader(&fep.reader)?;

        // A plan registered again keeps its first registration
        // untouched; the new binding deep-copies.
        let fep = if fep.is_registered() {
            fep.deep_copy(engine)
        } else {
            fep
        };

        let registration = Registration::new(engine, fep.clone(), mode, trigger_args);
        engine.add_registration(registration.clone());
        if let Err(err) = plugin.register(engine, &registration) {
            engine.remove_registration(&registration.id);
            return Err(err);
        }
        if let Some(hook) = &fep.on_registered {
            if let Some(entry) = engine.mgmt().on_registereds.get(&hook.name) {
                (entry.callback)(engine, hook.arg.as_ref());
            }
        }

        if distribute && engine.cluster().is_cluster_mode() {
            match persist::registration_bytes(engine, &registration) {
                Ok(payload) => {
                    let view = engine.cluster();
                    for peer in view.peers() {
                        if let Err(err) = engine.host().send_to_shard(
                            peer,
                            commands::INNER_REGISTER_COMMAND,
                            &[payload.clone()],
                        ) {
                            tracing::warn!(%peer, %err, "failed to fan out registration");
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, "registration is local-only: serialization failed")
                }
            }
        }
        Ok(registration)
    }

    /// Tear down a registration; optionally abort in-flight executions
    /// and fan the unregister out to peers.
    pub fn unregister(
        &self,
        id: &str,
        abort_pending: bool,
        distribute: bool,
    ) -> Result<(), Error> {
        let engine = &self.inner.engine;
        let registration = engine
            .remove_registration(id)
            .ok_or_else(|| Error::RegistrationNotFound(id.to_string()))?;
        if let Ok(plugin) = engine.mgmt().reader(&registration.fep.reader) {
            plugin.unregister(engine, &registration);
        }
        if let Some(hook) = &registration.fep.on_unregistered {
            if let Some(entry) = engine.mgmt().on_unregistereds.get(&hook.name) {
                (entry.callback)(engine, hook.arg.as_ref());
            }
        }
        if abort_pending {
            registration.abort_pending(engine);
        }
        if distribute && engine.cluster().is_cluster_mode() {
            let view = engine.cluster();
            let args = [
                bytes::Bytes::copy_from_slice(id.as_bytes()),
                bytes::Bytes::from_static(if abort_pending { b"1" } else { b"0" }),
            ];
            for peer in view.peers() {
                if let Err(err) = engine.host().send_to_shard(
                    peer,
                    commands::INNER_UNREGISTER_COMMAND,
                    &args,
                ) {
                    tracing::warn!(%peer, %err, "failed to fan out unregister");
                }
            }
        }
        tracing::info!(registration = %id, abort_pending, "unregistered");
        Ok(())
    }

    /// Shutdown-event teardown. Registrations were persisted; live
    /// executions do not survive.
    pub fn shutdown(&self) {
        self.inner.engine.shutdown();
    }
}
