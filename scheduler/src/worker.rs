// Copyright © Serval Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{
    broker::BrokerRef,
    counters,
    execution::{make_execution, Execution},
    messages::{
        worker_channel, BrokerRedirect, Envelope, Message, RemoteReadResult, SERVER_CHANNEL,
    },
    txn_holder::TxnHolderRef,
};
use crossbeam_channel::{select, Receiver, Sender};
use serval_config::{ConfigurationRef, LockManagerKind, RemasterProtocol};
use serval_storage::{Storage, StorageRef};
use serval_types::{
    transaction::{Metadata, Program, TxnStatus},
    PartitionId, RunId, TxnId,
};
use std::collections::HashMap;
use tracing::{debug, error};

/// What the scheduler hands a worker: a shared handle on the holder plus
/// the flag distinguishing a deadlock-resolved re-run from the first run.
pub(crate) struct DispatchedTxn {
    pub holder: TxnHolderRef,
    pub deadlocked: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    ReadLocalStorage,
    WaitRemoteRead,
    Execute,
    Finish,
}

struct TransactionState {
    holder: TxnHolderRef,
    remote_reads_waiting_on: u32,
    phase: Phase,
    redirect_registered: bool,
}

/// Executes and commits dispatched transactions. Each message either
/// initializes the state of a new run or advances an existing run through
/// its phases as far as it can go:
///
/// READ_LOCAL_STORAGE -> (maybe) WAIT_REMOTE_READ -> EXECUTE -> FINISH
pub struct Worker {
    worker_id: usize,
    config: ConfigurationRef,
    storage: StorageRef,
    broker: BrokerRef,
    execution: Box<dyn Execution>,
    dispatch_rx: Receiver<DispatchedTxn>,
    rx: Receiver<Envelope>,
    done_tx: Sender<TxnId>,
    txn_states: HashMap<RunId, TransactionState>,
}

impl Worker {
    pub(crate) fn new(
        worker_id: usize,
        config: ConfigurationRef,
        storage: StorageRef,
        broker: BrokerRef,
        dispatch_rx: Receiver<DispatchedTxn>,
        done_tx: Sender<TxnId>,
    ) -> Self {
        let rx = broker.register(config.local_machine_id(), worker_channel(worker_id));
        let execution = make_execution(config.execution(), config.clone(), storage.clone());
        Self {
            worker_id,
            config,
            storage,
            broker,
            execution,
            dispatch_rx,
            rx,
            done_tx,
            txn_states: HashMap::new(),
        }
    }

    pub(crate) fn run(mut self, shutdown: Receiver<()>) {
        let poll_timeout = self.config.poll_timeout();
        loop {
            select! {
                recv(self.dispatch_rx) -> msg => match msg {
                    Ok(dispatched) => self.on_dispatch(dispatched),
                    Err(_) => break,
                },
                recv(self.rx) -> env => match env {
                    Ok(env) => self.on_envelope(env),
                    Err(_) => break,
                },
                recv(shutdown) -> _ => break,
                default(poll_timeout) => {}
            }
        }
    }

    fn on_dispatch(&mut self, dispatched: DispatchedTxn) {
        let run_id = {
            let holder = dispatched.holder.lock();
            RunId::new(holder.txn.id, dispatched.deadlocked)
        };
        let previous = self.txn_states.insert(run_id, TransactionState {
            holder: dispatched.holder,
            remote_reads_waiting_on: 0,
            phase: Phase::ReadLocalStorage,
            redirect_registered: false,
        });
        assert!(
            previous.is_none(),
            "transaction {} has already been dispatched to this worker",
            run_id
        );
        debug!(%run_id, "initialized state for txn");
        self.advance_transaction(run_id);
    }

    fn on_envelope(&mut self, env: Envelope) {
        match env.message {
            Message::RemoteReadResult(result) => self.on_remote_read_result(result),
            other => error!(msg = other.name(), "invalid message for worker"),
        }
    }

    /// Applies a peer partition's reads to a run in WAIT_REMOTE_READ and
    /// moves it to EXECUTE once the last one arrives.
    fn on_remote_read_result(&mut self, result: RemoteReadResult) {
        let run_id = RunId::new(result.txn_id, result.deadlocked);
        let state = match self.txn_states.get_mut(&run_id) {
            Some(state) => state,
            None => {
                error!(%run_id, "transaction does not exist for remote read result");
                return;
            }
        };
        debug!(%run_id, partition = result.partition, "got remote read result");

        {
            let mut holder = state.holder.lock();
            let txn = &mut holder.txn;
            if !txn.is_aborted() {
                if result.will_abort {
                    txn.set_aborted(result.abort_reason);
                } else {
                    for read in result.reads {
                        match txn.keys.iter().position(|e| e.key == read.key) {
                            Some(i) => {
                                if txn.keys[i].value.is_none() {
                                    txn.keys[i].value = read.value;
                                }
                            }
                            None => txn.keys.push(read),
                        }
                    }
                }
            }
        }

        state.remote_reads_waiting_on -= 1;
        if state.remote_reads_waiting_on == 0 {
            match state.phase {
                Phase::WaitRemoteRead => {
                    state.phase = Phase::Execute;
                    debug!(%run_id, "execute txn after receiving all remote read results");
                }
                phase => panic!("invalid phase {:?} for run {}", phase, run_id),
            }
        }
        self.advance_transaction(run_id);
    }

    fn advance_transaction(&mut self, run_id: RunId) {
        loop {
            let phase = self
                .txn_states
                .get(&run_id)
                .expect("advanced txn must have state")
                .phase;
            match phase {
                Phase::ReadLocalStorage => self.read_local_storage(run_id),
                // The only way out of this phase is a remote message.
                Phase::WaitRemoteRead => return,
                Phase::Execute => self.execute(run_id),
                Phase::Finish => {
                    self.finish(run_id);
                    return;
                }
            }
        }
    }

    /// Validates mastership metadata against storage and copies the local
    /// values into the transaction, then broadcasts them to the peer
    /// partitions that wait on this one.
    fn read_local_storage(&mut self, run_id: RunId) {
        let holder = self.txn_states[&run_id].holder.clone();
        let (waiting_partitions, num_involved);
        {
            let mut holder = holder.lock();
            let txn = &mut holder.txn;
            if !txn.is_aborted() {
                let check_counters =
                    self.config.remaster_protocol() == RemasterProtocol::Simple;
                let is_remaster = txn.is_remaster();
                let mut abort_reason = None;
                // Out-of-partition keys were pruned upstream, so every
                // entry here is ours to read.
                for entry in txn.keys.iter_mut() {
                    match self.storage.read(&entry.key) {
                        Some(record) => {
                            if check_counters {
                                if record.metadata.counter > entry.metadata.counter {
                                    abort_reason = Some("outdated counter".to_string());
                                    break;
                                }
                                if record.metadata.counter < entry.metadata.counter {
                                    panic!(
                                        "transaction {} was sent to a worker with a high counter",
                                        run_id
                                    );
                                }
                            }
                            if entry.metadata.master != record.metadata.master {
                                abort_reason = Some("outdated master".to_string());
                                break;
                            }
                            entry.value = Some(record.value);
                        }
                        None => {
                            if is_remaster {
                                abort_reason =
                                    Some(format!("remaster non-existent key {}", entry.key));
                                break;
                            }
                        }
                    }
                }
                if let Some(reason) = abort_reason {
                    txn.set_aborted(reason);
                }
            }
            waiting_partitions = self.waiting_partitions(txn);
            num_involved = txn.involved_partitions.len() as u32;

            debug!(%run_id, "broadcasting local reads to other partitions");
            self.broadcast_reads(run_id, txn, &waiting_partitions);
        }

        let local_partition = self.config.local_partition();
        let state = self.txn_states.get_mut(&run_id).unwrap();
        // Only partitions that wait need the full set of remote reads.
        state.remote_reads_waiting_on = if waiting_partitions.contains(&local_partition) {
            num_involved - 1
        } else {
            0
        };
        if state.remote_reads_waiting_on == 0 {
            debug!(%run_id, "execute txn without remote reads");
            state.phase = Phase::Execute;
        } else {
            // Claim the run tag so the broker can deliver remote reads for
            // this run, and only this run, to this worker.
            state.redirect_registered = true;
            state.phase = Phase::WaitRemoteRead;
            self.broker.handle_redirect(
                self.config.local_machine_id(),
                BrokerRedirect {
                    tag: run_id.tag(),
                    channel: worker_channel(self.worker_id),
                    stop: false,
                },
            );
            debug!(%run_id, "deferring execution until enough remote reads arrive");
        }
    }

    /// Under DDR every involved partition waits for every other one; the
    /// resolver needs all partitions to agree on each run's fate. Without
    /// it only the partitions that execute code wait.
    fn waiting_partitions(
        &self,
        txn: &serval_types::transaction::Transaction,
    ) -> Vec<PartitionId> {
        if self.config.lock_manager() == LockManagerKind::Ddr {
            txn.involved_partitions.clone()
        } else {
            txn.active_partitions.clone()
        }
    }

    fn broadcast_reads(
        &self,
        run_id: RunId,
        txn: &serval_types::transaction::Transaction,
        waiting_partitions: &[PartitionId],
    ) {
        if waiting_partitions.is_empty() {
            return;
        }
        let local_partition = self.config.local_partition();
        let local_region = self.config.local_region();
        let aborted = txn.is_aborted();

        let result = RemoteReadResult {
            txn_id: run_id.txn_id,
            deadlocked: run_id.deadlocked,
            partition: local_partition,
            will_abort: aborted,
            abort_reason: txn.abort_reason.clone(),
            reads: if aborted { vec![] } else { txn.keys.clone() },
        };
        for partition in waiting_partitions {
            if *partition == local_partition {
                continue;
            }
            let destination = self.config.make_machine_id(local_region, *partition);
            self.broker.send_tagged(
                destination,
                run_id.tag(),
                Envelope {
                    from: self.config.local_machine_id(),
                    message: Message::RemoteReadResult(result.clone()),
                },
            );
        }
    }

    fn execute(&mut self, run_id: RunId) {
        let holder = self.txn_states[&run_id].holder.clone();
        {
            let mut holder = holder.lock();
            if !holder.txn.is_aborted() {
                match holder.txn.program {
                    Program::Commands(_) => {
                        self.execution.execute(&mut holder.txn);
                        if holder.txn.is_aborted() {
                            debug!(%run_id, reason = %holder.txn.abort_reason, "txn aborted");
                        } else {
                            debug!(%run_id, "committed txn");
                        }
                    }
                    Program::Remaster { new_master } => {
                        let txn = &mut holder.txn;
                        txn.status = TxnStatus::Committed;
                        let entry = txn.keys.first().expect("remaster txn carries its key");
                        let key = entry.key.clone();
                        let new_counter = entry.metadata.counter + 1;
                        // Existence was verified in READ_LOCAL_STORAGE.
                        let mut record = self
                            .storage
                            .read(&key)
                            .expect("remaster key must exist in storage");
                        record.metadata = Metadata::new(new_master, new_counter);
                        self.storage.write(&key, record);
                        holder.remaster_result = Some((key, new_counter));
                    }
                }
            }
        }
        self.txn_states.get_mut(&run_id).unwrap().phase = Phase::Finish;
    }

    /// Returns the finished transaction to the coordinating server, tells
    /// the scheduler to release its locks and drops the run state.
    fn finish(&mut self, run_id: RunId) {
        let state = self
            .txn_states
            .remove(&run_id)
            .expect("finished txn must have state");

        {
            let holder = state.holder.lock();
            let txn = &holder.txn;
            match txn.status {
                TxnStatus::Aborted => counters::TXN_ABORTED.inc(),
                _ => counters::TXN_COMMITTED.inc(),
            }

            // The reply must go out before the done message below; after
            // the done message the scheduler is free to drop the holder
            // from its registry.
            let coordinator = txn.coordinating_server;
            let (coordinator_region, _) = self.config.unpack_machine_id(coordinator);
            if coordinator_region == self.config.local_region() {
                let mut txn_out = txn.clone();
                if self.config.return_dummy_txn() {
                    txn_out.keys.clear();
                    txn_out.program = Program::Commands(vec![]);
                }
                self.broker.send(
                    coordinator,
                    SERVER_CHANNEL,
                    Envelope {
                        from: self.config.local_machine_id(),
                        message: Message::CompletedSubTxn {
                            partition: self.config.local_partition(),
                            txn: Box::new(txn_out),
                        },
                    },
                );
            }
        }

        let _ = self.done_tx.send(run_id.txn_id);

        if state.redirect_registered {
            self.broker.handle_redirect(
                self.config.local_machine_id(),
                BrokerRedirect {
                    tag: run_id.tag(),
                    channel: worker_channel(self.worker_id),
                    stop: true,
                },
            );
        }
        debug!(%run_id, "finished with txn");
    }
}
