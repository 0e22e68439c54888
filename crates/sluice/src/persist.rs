//! Aux-save/-load persistence.
//!
//! Before-keys: the plugin table is written and, on load, the live
//! registration set is cleared. After-keys: the configuration store
//! and, for every reader kind that persists, its registrations as
//! `(reader, mode, FEP-bytes, trigger-args-bytes)` tuples. Every
//! deserialize routine gates on the stored encoding version.

use crate::Module;
use bytes::Bytes;
use engine::{Engine, Error, ExecMode, Registration, ENCODING_VERSION};
use host::{AuxProvider, HostError, RdbPhase};
use std::sync::Arc;
use wire::{Buffer, BufferReader, BufferWriter};

/// One registration as a self-contained byte string; also the payload
/// of the `innerregister` fan-out.
pub(crate) fn registration_bytes(
    engine: &Engine,
    registration: &Arc<Registration>,
) -> Result<Bytes, Error> {
    let mut buf = Buffer::new();
    let mut w = buf.writer();
    serialize_registration(engine, registration, &mut w)?;
    Ok(buf.into_bytes())
}

fn serialize_registration(
    _engine: &Engine,
    registration: &Arc<Registration>,
    w: &mut BufferWriter<'_>,
) -> Result<(), Error> {
    w.write_str(&registration.fep.reader);
    w.write_varu64(registration.mode.code());

    let mut fep = Buffer::new();
    registration.fep.serialize(&mut fep.writer())?;
    w.write_bytes(fep.as_slice());

    let mut args = Buffer::new();
    registration.args.serialize(&mut args.writer())?;
    w.write_bytes(args.as_slice());
    Ok(())
}

/// Reconstruct and re-register one persisted registration.
pub(crate) fn load_registration(
    module: &Module,
    r: &mut BufferReader<'_>,
    encver: u32,
) -> Result<Arc<Registration>, Error> {
    let engine = module.engine();
    let reader_name = r.read_str()?.to_string();
    let mode = ExecMode::from_code(r.read_varu64()?)?;
    let fep_bytes = r.read_bytes()?;
    let args_bytes = r.read_bytes()?;

    let plugin = engine.mgmt().reader(&reader_name)?;
    let fep = Arc::new(engine::FlatPlan::from_bytes(fep_bytes, encver)?);

    // Plans carried by a plugin refuse to load when that plugin is
    // absent or older than required.
    if let Some(required) = &fep.plugin {
        if !module.plugins().satisfies(&required.name, required.version) {
            return Err(Error::PluginMissing {
                name: required.name.clone(),
                required: required.version,
            });
        }
    }

    let trigger_args = plugin.deserialize_trigger_args(&mut BufferReader::new(args_bytes), encver)?;
    module.register_plan(fep, mode, trigger_args, false)
}

impl AuxProvider for Module {
    fn aux_save(&self, phase: RdbPhase, buf: &mut Buffer) {
        let mut w = buf.writer();
        match phase {
            RdbPhase::BeforeKeys => {
                let plugins = self.plugins().all();
                w.write_varu64(plugins.len() as u64);
                for (name, version) in plugins {
                    w.write_str(&name);
                    w.write_varu64(version as u64);
                }
            }
            RdbPhase::AfterKeys => {
                self.config_store().save(&mut w);

                let engine = self.engine();
                let registrations: Vec<Arc<Registration>> = engine
                    .registrations()
                    .into_iter()
                    .filter(|reg| {
                        engine
                            .mgmt()
                            .reader(&reg.fep.reader)
                            .map(|p| p.supports_rdb())
                            .unwrap_or(false)
                    })
                    .collect();
                w.write_varu64(registrations.len() as u64);
                for registration in &registrations {
                    match registration_bytes(engine, registration) {
                        Ok(payload) => w.write_bytes(&payload),
                        Err(err) => {
                            // A registration that cannot serialize is
                            // dropped from the snapshot, not fatal.
                            tracing::warn!(registration = %registration.id, %err,
                                "skipping unserializable registration");
                            w.write_bytes(&[]);
                        }
                    }
                }
            }
        }
    }

    fn aux_load(
        &self,
        phase: RdbPhase,
        r: &mut BufferReader<'_>,
        encver: u32,
    ) -> Result<(), HostError> {
        if encver > ENCODING_VERSION {
            return Err(HostError::Command(format!(
                "unsupported encoding version {encver}"
            )));
        }
        match phase {
            RdbPhase::BeforeKeys => {
                // A fresh image replaces whatever was registered.
                self.engine().clear_registrations();

                let count = r
                    .read_varu64()
                    .map_err(|err| HostError::Command(err.to_string()))?;
                for _ in 0..count {
                    let name = r
                        .read_str()
                        .map_err(|err| HostError::Command(err.to_string()))?
                        .to_string();
                    let version = r
                        .read_varu64()
                        .map_err(|err| HostError::Command(err.to_string()))?
                        as u32;
                    if !self.plugins().satisfies(&name, version) {
                        return Err(HostError::Command(format!(
                            "plugin '{name}' v{version} is required by this image"
                        )));
                    }
                }
                Ok(())
            }
            RdbPhase::AfterKeys => {
                self.config_store()
                    .load(r)
                    .map_err(|err| HostError::Command(err.to_string()))?;

                let count = r
                    .read_varu64()
                    .map_err(|err| HostError::Command(err.to_string()))?;
                for _ in 0..count {
                    let payload = r
                        .read_bytes()
                        .map_err(|err| HostError::Command(err.to_string()))?;
                    if payload.is_empty() {
                        continue;
                    }
                    load_registration(self, &mut BufferReader::new(payload), encver)
                        .map_err(|err| HostError::Command(err.to_string()))?;
                }
                Ok(())
            }
        }
    }
}
