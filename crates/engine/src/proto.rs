//! The cross-shard protocol: message kinds, their wire codec, and the
//! receive handlers that advance executions.
//!
//! Messages are point-to-point over the host's cluster bus, carried by
//! the internal `innermsgcommand`. Every message names an execution id
//! and shards route by it; handlers acquire the host lock before
//! touching any execution state.

use crate::execution::{deserialize_records, Status};
use crate::fep::FlatPlan;
use crate::step::StepState;
use crate::{Engine, Error, ExecMode, ExecutionId, ENCODING_VERSION, INNER_MSG_COMMAND};
use bytes::Bytes;
use host::{Reply, ShardId};
use std::sync::Arc;
use wire::{Buffer, BufferReader, BufferWriter};

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Initiator -> all: construct a mirror execution and acknowledge.
    ExecutionCreated {
        id: ExecutionId,
        fep: Bytes,
        reader_args: Bytes,
        run_flags: u32,
        mode: ExecMode,
        pool: String,
    },
    /// All -> initiator: the mirror exists.
    Received { id: ExecutionId },
    /// Initiator -> all: every shard is ready; start producing.
    StartRun { id: ExecutionId },
    /// Any -> any: a record re-routed to the shard owning its key.
    RepartitionRecord {
        id: ExecutionId,
        step: u32,
        record: Bytes,
    },
    /// Sender's upstream for this shuffle step is exhausted.
    StepDone { id: ExecutionId, step: u32 },
    /// All -> initiator: one record gathered toward the initiator.
    CollectRecord { id: ExecutionId, record: Bytes },
    /// All -> initiator: this shard's final results and errors.
    ExecutionDone {
        id: ExecutionId,
        results: Bytes,
        errors: Bytes,
    },
    /// Initiator -> all: tear the mirror down.
    DropExecution { id: ExecutionId },
}

const CODE_EXECUTION_CREATED: u64 = 1;
const CODE_RECEIVED: u64 = 2;
const CODE_START_RUN: u64 = 3;
const CODE_REPARTITION_RECORD: u64 = 4;
const CODE_STEP_DONE: u64 = 5;
const CODE_COLLECT_RECORD: u64 = 6;
const CODE_EXECUTION_DONE: u64 = 7;
const CODE_DROP_EXECUTION: u64 = 8;

impl Message {
    pub fn id(&self) -> ExecutionId {
        match self {
            Message::ExecutionCreated { id, .. }
            | Message::Received { id }
            | Message::StartRun { id }
            | Message::RepartitionRecord { id, .. }
            | Message::StepDone { id, .. }
            | Message::CollectRecord { id, .. }
            | Message::ExecutionDone { id, .. }
            | Message::DropExecution { id } => *id,
        }
    }

    pub fn serialize(&self, w: &mut BufferWriter<'_>) {
        w.write_varu64(ENCODING_VERSION as u64);
        match self {
            Message::ExecutionCreated {
                id,
                fep,
                reader_args,
                run_flags,
                mode,
                pool,
            } => {
                w.write_varu64(CODE_EXECUTION_CREATED);
                id.serialize(w);
                w.write_bytes(fep);
                w.write_bytes(reader_args);
                w.write_varu64(*run_flags as u64);
                w.write_varu64(mode.code());
                w.write_str(pool);
            }
            Message::Received { id } => {
                w.write_varu64(CODE_RECEIVED);
                id.serialize(w);
            }
            Message::StartRun { id } => {
                w.write_varu64(CODE_START_RUN);
                id.serialize(w);
            }
            Message::RepartitionRecord { id, step, record } => {
                w.write_varu64(CODE_REPARTITION_RECORD);
                id.serialize(w);
                w.write_varu64(*step as u64);
                w.write_bytes(record);
            }
            Message::StepDone { id, step } => {
                w.write_varu64(CODE_STEP_DONE);
                id.serialize(w);
                w.write_varu64(*step as u64);
            }
            Message::CollectRecord { id, record } => {
                w.write_varu64(CODE_COLLECT_RECORD);
                id.serialize(w);
                w.write_bytes(record);
            }
            Message::ExecutionDone {
                id,
                results,
                errors,
            } => {
                w.write_varu64(CODE_EXECUTION_DONE);
                id.serialize(w);
                w.write_bytes(results);
                w.write_bytes(errors);
            }
            Message::DropExecution { id } => {
                w.write_varu64(CODE_DROP_EXECUTION);
                id.serialize(w);
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = Buffer::new();
        self.serialize(&mut buf.writer());
        buf.into_bytes()
    }

    pub fn deserialize(r: &mut BufferReader<'_>) -> Result<Message, Error> {
        let encver = r.read_varu64()? as u32;
        if encver > ENCODING_VERSION {
            return Err(Error::UnsupportedEncVer(encver));
        }
        let code = r.read_varu64()?;
        Ok(match code {
            CODE_EXECUTION_CREATED => Message::ExecutionCreated {
                id: ExecutionId::deserialize(r)?,
                fep: Bytes::copy_from_slice(r.read_bytes()?),
                reader_args: Bytes::copy_from_slice(r.read_bytes()?),
                run_flags: r.read_varu64()? as u32,
                mode: ExecMode::from_code(r.read_varu64()?)?,
                pool: r.read_str()?.to_string(),
            },
            CODE_RECEIVED => Message::Received {
                id: ExecutionId::deserialize(r)?,
            },
            CODE_START_RUN => Message::StartRun {
                id: ExecutionId::deserialize(r)?,
            },
            CODE_REPARTITION_RECORD => Message::RepartitionRecord {
                id: ExecutionId::deserialize(r)?,
                step: r.read_varu64()? as u32,
                record: Bytes::copy_from_slice(r.read_bytes()?),
            },
            CODE_STEP_DONE => Message::StepDone {
                id: ExecutionId::deserialize(r)?,
                step: r.read_varu64()? as u32,
            },
            CODE_COLLECT_RECORD => Message::CollectRecord {
                id: ExecutionId::deserialize(r)?,
                record: Bytes::copy_from_slice(r.read_bytes()?),
            },
            CODE_EXECUTION_DONE => Message::ExecutionDone {
                id: ExecutionId::deserialize(r)?,
                results: Bytes::copy_from_slice(r.read_bytes()?),
                errors: Bytes::copy_from_slice(r.read_bytes()?),
            },
            CODE_DROP_EXECUTION => Message::DropExecution {
                id: ExecutionId::deserialize(r)?,
            },
            other => return Err(Error::Malformed(format!("unknown message code {other}"))),
        })
    }
}

impl Engine {
    /// Send to one peer, or broadcast to every peer when `target` is
    /// `None`. Delivery is retried `SendMsgRetries` times; persistent
    /// failure is logged and surfaced by the idle timer, never by
    /// blocking.
    pub fn send_message(&self, target: Option<&ShardId>, msg: &Message) {
        let payload = msg.to_bytes();
        let my_id = self.my_id();
        let view = self.cluster();
        let targets: Vec<ShardId> = match target {
            Some(t) => vec![*t],
            None => view.peers().copied().collect(),
        };
        let retries = self.config().send_msg_retries().max(1);
        for shard in targets {
            let args = [
                Bytes::copy_from_slice(my_id.as_bytes()),
                payload.clone(),
            ];
            let mut delivered = false;
            for attempt in 1..=retries {
                match self.host().send_to_shard(&shard, INNER_MSG_COMMAND, &args) {
                    Ok(()) => {
                        delivered = true;
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(%shard, attempt, %err, "failed to send cluster message");
                    }
                }
            }
            if !delivered {
                tracing::warn!(%shard, id = %msg.id(), "giving up on cluster message");
            }
        }
    }

    /// `innermsgcommand` entry: `args` are the raw command argv.
    pub fn handle_inner_msg(&self, args: &[Bytes]) -> Reply {
        if args.len() != 3 {
            return Reply::wrong_arity(INNER_MSG_COMMAND);
        }
        let Some(from) = ShardId::from_bytes(&args[1]) else {
            return Reply::error("malformed sender id");
        };
        let msg = match Message::deserialize(&mut BufferReader::new(&args[2])) {
            Ok(msg) => msg,
            Err(err) => return Reply::error(format!("malformed cluster message: {err}")),
        };
        self.handle_message(from, msg);
        Reply::ok()
    }

    /// Dispatch one received message. Mutations happen under the host
    /// lock.
    pub fn handle_message(&self, from: ShardId, msg: Message) {
        let _guard = self.lock().acquire();
        let id = msg.id();
        tracing::trace!(%from, %id, "cluster message");
        match msg {
            Message::ExecutionCreated {
                id,
                fep,
                reader_args,
                run_flags,
                mode,
                pool: _,
            } => {
                if self.find_execution(&id).is_none() {
                    match self.adopt_execution(id, &fep, &reader_args, run_flags, mode) {
                        Ok(()) => {}
                        Err(err) => {
                            tracing::warn!(%id, %err, "failed to construct mirror execution");
                            return;
                        }
                    }
                }
                self.send_message(Some(&from), &Message::Received { id });
            }
            Message::Received { id } => {
                if let Some(ep) = self.find_execution(&id) {
                    ep.state.lock().shards_received += 1;
                    ep.schedule(self);
                }
            }
            Message::StartRun { id } => {
                if let Some(ep) = self.find_execution(&id) {
                    ep.state.lock().start_run_received = true;
                    ep.schedule(self);
                }
            }
            Message::RepartitionRecord { id, step, record } => {
                let Some(ep) = self.find_execution(&id) else { return };
                match record::Record::deserialize(
                    &mut BufferReader::new(&record),
                    self.types(),
                ) {
                    Ok(rec) => {
                        let mut state = ep.state.lock();
                        match state.steps.get_mut(step as usize).map(|s| &mut s.state) {
                            Some(StepState::Repartition(shuffle)) => {
                                shuffle.inbox.push_back(rec)
                            }
                            _ => {
                                tracing::warn!(%id, step, "repartition record for a non-shuffle step");
                                return;
                            }
                        }
                        drop(state);
                        ep.schedule(self);
                    }
                    Err(err) => {
                        tracing::warn!(%id, %err, "dropping undecodable repartition record");
                        ep.state
                            .lock()
                            .errors
                            .push(record::Record::error_from(format!(
                                "repartition decode failure: {err}"
                            )));
                        ep.schedule(self);
                    }
                }
            }
            Message::StepDone { id, step } => {
                let Some(ep) = self.find_execution(&id) else { return };
                {
                    let mut state = ep.state.lock();
                    match state.steps.get_mut(step as usize).map(|s| &mut s.state) {
                        Some(StepState::Repartition(shuffle))
                        | Some(StepState::Collect(shuffle)) => shuffle.peers_done += 1,
                        _ => {
                            tracing::warn!(%id, step, "step-done for a non-shuffle step");
                            return;
                        }
                    }
                }
                ep.schedule(self);
            }
            Message::CollectRecord { id, record } => {
                let Some(ep) = self.find_execution(&id) else { return };
                match record::Record::deserialize(
                    &mut BufferReader::new(&record),
                    self.types(),
                ) {
                    Ok(rec) => {
                        let mut state = ep.state.lock();
                        // Collects complete upstream-first; deliver to
                        // the deepest one still gathering.
                        let slot = state.steps.iter_mut().rev().find_map(|s| {
                            match &mut s.state {
                                StepState::Collect(shuffle) => Some(shuffle),
                                _ => None,
                            }
                        });
                        match slot {
                            Some(shuffle) => shuffle.inbox.push_back(rec),
                            None => {
                                tracing::warn!(%id, "collect record but no collect step");
                                return;
                            }
                        }
                        drop(state);
                        ep.schedule(self);
                    }
                    Err(err) => {
                        tracing::warn!(%id, %err, "dropping undecodable collect record");
                        ep.state
                            .lock()
                            .errors
                            .push(record::Record::error_from(format!(
                                "collect decode failure: {err}"
                            )));
                        ep.schedule(self);
                    }
                }
            }
            Message::ExecutionDone {
                id,
                results,
                errors,
            } => {
                let Some(ep) = self.find_execution(&id) else { return };
                let results = deserialize_records(self, &results);
                let errors = deserialize_records(self, &errors);
                {
                    let mut state = ep.state.lock();
                    match results {
                        Ok(records) => state.results.extend(records),
                        Err(err) => state.errors.push(record::Record::error_from(format!(
                            "peer results decode failure: {err}"
                        ))),
                    }
                    match errors {
                        Ok(records) => state.errors.extend(records),
                        Err(err) => state.errors.push(record::Record::error_from(format!(
                            "peer errors decode failure: {err}"
                        ))),
                    }
                    state.shards_completed += 1;
                }
                ep.schedule(self);
            }
            Message::DropExecution { id } => {
                if let Some(ep) = self.find_execution(&id) {
                    ep.drop_execution(self);
                }
            }
        }
    }

    /// Construct the mirror of a remotely initiated execution.
    fn adopt_execution(
        &self,
        id: ExecutionId,
        fep_bytes: &[u8],
        reader_args: &[u8],
        run_flags: u32,
        mode: ExecMode,
    ) -> Result<(), Error> {
        let fep = Arc::new(FlatPlan::from_bytes(fep_bytes, ENCODING_VERSION)?);
        let plugin = self.mgmt().reader(&fep.reader)?;
        let reader = plugin.instantiate(self, reader_args)?;
        let ep = crate::execution::Execution::new(
            self,
            id,
            fep,
            mode,
            run_flags,
            reader,
            Status::WaitingForRunNotification,
            Vec::new(),
        )?;
        self.track_execution(ep);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use host::ShardId;

    #[test]
    fn messages_round_trip() {
        let id = ExecutionId {
            node: ShardId::of("shard-a"),
            seq: 42,
        };
        let messages = [
            Message::ExecutionCreated {
                id,
                fep: Bytes::from_static(b"fep"),
                reader_args: Bytes::from_static(b""),
                run_flags: 3,
                mode: ExecMode::Async,
                pool: "default".into(),
            },
            Message::Received { id },
            Message::StartRun { id },
            Message::RepartitionRecord {
                id,
                step: 2,
                record: Bytes::from_static(b"rec"),
            },
            Message::StepDone { id, step: 2 },
            Message::CollectRecord {
                id,
                record: Bytes::from_static(b"rec"),
            },
            Message::ExecutionDone {
                id,
                results: Bytes::from_static(b"r"),
                errors: Bytes::from_static(b"e"),
            },
            Message::DropExecution { id },
        ];
        for msg in &messages {
            let bytes = msg.to_bytes();
            let decoded = Message::deserialize(&mut BufferReader::new(&bytes)).unwrap();
            assert_eq!(&decoded, msg);
        }
    }

    #[test]
    fn future_encoding_versions_are_rejected() {
        let mut buf = Buffer::new();
        buf.writer().write_varu64(ENCODING_VERSION as u64 + 1);
        buf.writer().write_varu64(CODE_START_RUN);
        match Message::deserialize(&mut buf.reader()) {
            Err(Error::UnsupportedEncVer(_)) => {}
            other => panic!("expected UnsupportedEncVer, got {other:?}"),
        }
    }
}
