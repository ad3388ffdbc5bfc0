// Copyright © Serval Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{
    broker::BrokerRef,
    counters,
    deadlock_resolver::DeadlockResolver,
    lock_manager::{make_lock_manager, AcquireLocksResult, LockManager},
    messages::{Envelope, Message, StatsRequest, StatsResponse, SCHEDULER_CHANNEL, SERVER_CHANNEL},
    remaster_manager::{RemasterOccurredResult, SimpleRemasterManager, VerifyMasterResult},
    txn_holder::{ActiveTxn, TxnHolderRef},
    worker::{DispatchedTxn, Worker},
};
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use serde_json::json;
use serval_config::{ConfigurationRef, LockManagerKind, RemasterProtocol};
use serval_storage::StorageRef;
use serval_types::{
    transaction::{Transaction, TxnType},
    RegionId, TxnId,
};
use std::{collections::HashMap, thread};
use tracing::{debug, error, warn};

/// Handle on a running partition scheduler: the scheduler thread, its
/// workers and, under DDR, the deadlock resolver. Dropping the handle's
/// shutdown side stops every thread.
pub struct SchedulerHandle {
    shutdown: Option<Sender<()>>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn shutdown(mut self) {
        self.shutdown.take();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Per-partition orchestrator. Consumes `ForwardTxn` envelopes from the
/// sequencing layer, assembles fragments in the active-txn registry, runs
/// them through the remaster manager (when configured) and the lock
/// manager, and hands dispatchable transactions to the worker pool.
pub struct Scheduler {
    config: ConfigurationRef,
    broker: BrokerRef,
    lock_manager: std::sync::Arc<dyn LockManager>,
    remaster_manager: Option<SimpleRemasterManager>,
    active_txns: HashMap<TxnId, ActiveTxn>,
    rx: Receiver<Envelope>,
    done_rx: Receiver<TxnId>,
    dispatch_tx: Sender<DispatchedTxn>,
    /// Pre-dispatch aborts are disabled under the DDR lock manager; DDR
    /// handles every abort after dispatch.
    pre_dispatch_abort_enabled: bool,
}

impl Scheduler {
    /// Spawns the scheduler, its workers and (under DDR with a non-zero
    /// interval) the deadlock resolver, each on its own named thread.
    pub fn start(
        config: ConfigurationRef,
        storage: StorageRef,
        broker: BrokerRef,
    ) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let rx = broker.register(config.local_machine_id(), SCHEDULER_CHANNEL);
        let (dispatch_tx, dispatch_rx) = unbounded();
        let (done_tx, done_rx) = unbounded();

        let (lock_manager, ddr_lock_manager) = make_lock_manager(config.lock_manager());

        let mut threads = vec![];
        if let Some(ddr_lock_manager) = ddr_lock_manager {
            if !config.ddr_interval().is_zero() {
                let resolver = DeadlockResolver::new(
                    ddr_lock_manager,
                    config.clone(),
                    broker.clone(),
                    SCHEDULER_CHANNEL,
                );
                let shutdown = shutdown_rx.clone();
                threads.push(
                    thread::Builder::new()
                        .name("deadlock_resolver".to_string())
                        .spawn(move || resolver.run(shutdown))
                        .expect("failed to spawn deadlock resolver thread"),
                );
            }
        }

        for worker_id in 0..config.num_workers() {
            let worker = Worker::new(
                worker_id,
                config.clone(),
                storage.clone(),
                broker.clone(),
                dispatch_rx.clone(),
                done_tx.clone(),
            );
            let shutdown = shutdown_rx.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("worker-{}", worker_id))
                    .spawn(move || worker.run(shutdown))
                    .expect("failed to spawn worker thread"),
            );
        }

        let remaster_manager = match config.remaster_protocol() {
            RemasterProtocol::Simple => Some(SimpleRemasterManager::new(storage)),
            RemasterProtocol::Counterless => None,
        };
        let scheduler = Scheduler {
            pre_dispatch_abort_enabled: config.lock_manager() != LockManagerKind::Ddr,
            config,
            broker,
            lock_manager,
            remaster_manager,
            active_txns: HashMap::new(),
            rx,
            done_rx,
            dispatch_tx,
        };
        threads.push(
            thread::Builder::new()
                .name("scheduler".to_string())
                .spawn(move || scheduler.run(shutdown_rx))
                .expect("failed to spawn scheduler thread"),
        );

        SchedulerHandle {
            shutdown: Some(shutdown_tx),
            threads,
        }
    }

    fn run(mut self, shutdown: Receiver<()>) {
        let poll_timeout = self.config.poll_timeout();
        loop {
            select! {
                recv(self.rx) -> env => match env {
                    Ok(env) => self.handle_envelope(env),
                    Err(_) => break,
                },
                recv(self.done_rx) -> msg => match msg {
                    Ok(txn_id) => self.on_worker_done(txn_id),
                    Err(_) => break,
                },
                recv(shutdown) -> _ => break,
                default(poll_timeout) => {}
            }
        }
    }

    fn handle_envelope(&mut self, env: Envelope) {
        match env.message {
            Message::ForwardTxn(txn) => self.process_transaction(*txn),
            Message::Signal => {
                // Everything the resolver makes ready went through a
                // rewired component, so these runs carry the deadlocked
                // flag.
                for txn_id in self.lock_manager.get_ready_txns() {
                    self.dispatch(txn_id, true);
                }
            }
            Message::Stats(request) => self.process_stats_request(request),
            other => error!(
                msg = other.name(),
                "unexpected message on scheduler channel"
            ),
        }
    }

    /*
     * Transaction processing
     */

    fn process_transaction(&mut self, txn: Transaction) {
        let txn_id = txn.id;
        let txn_type = txn.txn_type;
        let lock_only_home = txn.home;
        if !self.accept_transaction(txn) {
            return;
        }
        counters::ACTIVE_TXNS.set(self.active_txns.len() as i64);
        if self.active_txns.len() > self.config.scheduler_max_txns() {
            warn!(
                active_txns = self.active_txns.len(),
                "active txn table exceeds its soft cap"
            );
        }

        match txn_type {
            TxnType::SingleHome => {
                debug!(txn_id, "accepted single-home transaction");
                if self.maybe_continue_pre_dispatch_abort(txn_id) {
                    return;
                }
                if self.remaster_manager.is_some() {
                    self.send_to_remaster_manager(txn_id, None);
                } else {
                    self.send_to_lock_manager(txn_id, None);
                }
            }
            TxnType::LockOnly => {
                debug!(txn_id, home = lock_only_home, "accepted lock-only transaction");
                if self.maybe_continue_pre_dispatch_abort_lock_only(txn_id) {
                    return;
                }
                if self.remaster_manager.is_some() {
                    self.send_to_remaster_manager(txn_id, Some(lock_only_home));
                } else {
                    self.send_to_lock_manager(txn_id, Some(lock_only_home));
                }
            }
            TxnType::MultiHome => {
                debug!(txn_id, "accepted multi-home transaction");
                if self.maybe_continue_pre_dispatch_abort(txn_id) {
                    return;
                }
                if self.maybe_abort_remaster_transaction(txn_id) {
                    return;
                }
                self.send_to_lock_manager(txn_id, None);
            }
        }
    }

    /// Registers a fragment in the active-txn registry. Duplicates are
    /// logged and dropped, leaving the existing state untouched.
    fn accept_transaction(&mut self, txn: Transaction) -> bool {
        let txn_id = txn.id;
        let num_regions = self.config.num_regions();
        assert!(
            !txn.keys.is_empty(),
            "txn {} has no keys in this partition",
            txn_id
        );
        match txn.txn_type {
            TxnType::SingleHome => {
                if self.active_txns.contains_key(&txn_id) {
                    error!(txn_id, "already received single-home txn");
                    return false;
                }
                let mut active_txn = ActiveTxn::new(&txn, num_regions);
                active_txn.set_header(txn);
                self.active_txns.insert(txn_id, active_txn);
                true
            }
            TxnType::MultiHome => {
                let active_txn = self
                    .active_txns
                    .entry(txn_id)
                    .or_insert_with(|| ActiveTxn::new(&txn, num_regions));
                if !active_txn.set_header(txn) {
                    error!(txn_id, "already received multi-home txn");
                    return false;
                }
                true
            }
            TxnType::LockOnly => {
                let home = txn.home;
                let active_txn = self
                    .active_txns
                    .entry(txn_id)
                    .or_insert_with(|| ActiveTxn::new(&txn, num_regions));
                if !active_txn.add_lock_only(txn) {
                    error!(txn_id, home, "already received lock-only txn");
                    return false;
                }
                true
            }
        }
    }

    /// Aborts a remaster that would move the key to the region already
    /// mastering it. Only effective where pre-dispatch aborts are; under
    /// DDR the remaster proceeds and re-masters the key in place.
    fn maybe_abort_remaster_transaction(&mut self, txn_id: TxnId) -> bool {
        if !self.pre_dispatch_abort_enabled {
            return false;
        }
        let holder = match self.active_txns.get(&txn_id).and_then(|a| a.holder()) {
            Some(holder) => holder.clone(),
            None => return false,
        };
        let same_master = {
            let guard = holder.lock();
            match guard.txn.remaster_new_master() {
                Some(new_master) => guard
                    .txn
                    .keys
                    .first()
                    .is_some_and(|entry| entry.metadata.master == new_master),
                None => false,
            }
        };
        if same_master {
            self.trigger_pre_dispatch_abort(txn_id, "remaster to the same master");
        }
        same_master
    }

    /*
     * Remaster management
     */

    fn send_to_remaster_manager(&mut self, txn_id: TxnId, lock_only_home: Option<RegionId>) {
        let remaster_manager = self
            .remaster_manager
            .as_mut()
            .expect("remaster manager must be configured");
        let result = match lock_only_home {
            Some(home) => {
                let fragment = self
                    .active_txns
                    .get(&txn_id)
                    .and_then(|a| a.lock_only(home))
                    .expect("accepted lock-only fragment must be registered");
                remaster_manager.verify_master(fragment)
            }
            None => {
                let holder = self
                    .active_txns
                    .get(&txn_id)
                    .and_then(|a| a.holder())
                    .expect("accepted txn must have a holder")
                    .clone();
                let guard = holder.lock();
                remaster_manager.verify_master(&guard.txn)
            }
        };
        match result {
            VerifyMasterResult::Valid => self.send_to_lock_manager(txn_id, lock_only_home),
            VerifyMasterResult::Abort => {
                self.trigger_pre_dispatch_abort(txn_id, "outdated counter");
            }
            VerifyMasterResult::Waiting => {
                debug!(txn_id, "txn waiting on remaster");
            }
        }
    }

    fn process_remaster_result(&mut self, result: RemasterOccurredResult) {
        for parked in result.unblocked {
            self.send_to_lock_manager(parked.txn_id, parked.lock_only_home);
        }
        // Two fragments of one txn can both come back stale; the abort is
        // triggered once.
        let mut aborting_txn_ids: Vec<TxnId> =
            result.should_abort.iter().map(|p| p.txn_id).collect();
        aborting_txn_ids.sort_unstable();
        aborting_txn_ids.dedup();
        for txn_id in aborting_txn_ids {
            self.trigger_pre_dispatch_abort(txn_id, "outdated counter");
        }
    }

    /*
     * Lock management
     */

    fn send_to_lock_manager(&mut self, txn_id: TxnId, lock_only_home: Option<RegionId>) {
        let active_txn = self
            .active_txns
            .get(&txn_id)
            .expect("txn sent to the lock manager must be registered");
        match lock_only_home {
            Some(home) => {
                let fragment = active_txn
                    .lock_only(home)
                    .expect("accepted lock-only fragment must be registered");
                let result = self.lock_manager.acquire_locks(fragment);
                self.process_acquire_result(txn_id, result);
            }
            None => {
                let holder = active_txn
                    .holder()
                    .expect("accepted txn must have a holder")
                    .clone();
                let guard = holder.lock();
                match guard.txn.txn_type {
                    TxnType::SingleHome => {
                        self.lock_manager.accept_transaction(&guard.txn);
                        let result = self.lock_manager.acquire_locks(&guard.txn);
                        drop(guard);
                        self.process_acquire_result(txn_id, result);
                    }
                    TxnType::MultiHome => {
                        let ready = self.lock_manager.accept_transaction(&guard.txn);
                        drop(guard);
                        if ready {
                            self.dispatch(txn_id, false);
                        }
                    }
                    TxnType::LockOnly => unreachable!("lock-only fragments carry their home"),
                }
            }
        }
    }

    fn process_acquire_result(&mut self, txn_id: TxnId, result: AcquireLocksResult) {
        match result {
            AcquireLocksResult::Acquired => self.dispatch(txn_id, false),
            AcquireLocksResult::Abort => {
                self.trigger_pre_dispatch_abort(txn_id, "lock acquisition aborted");
            }
            AcquireLocksResult::Waiting => {
                debug!(txn_id, "txn cannot be dispatched yet");
            }
        }
    }

    /*
     * Pre-dispatch abort processing
     */

    fn trigger_pre_dispatch_abort(&mut self, txn_id: TxnId, reason: &str) {
        if !self.pre_dispatch_abort_enabled {
            return;
        }
        let active_txn = self
            .active_txns
            .get_mut(&txn_id)
            .expect("abort triggered for unknown txn");
        assert!(
            !active_txn.aborting,
            "abort was triggered twice: {}",
            txn_id
        );
        debug!(txn_id, reason, "triggering pre-dispatch abort");
        active_txn.aborting = true;
        active_txn.pending_abort_reason = Some(reason.to_string());
        self.maybe_continue_pre_dispatch_abort(txn_id);
    }

    /// Once the main transaction of an abort has arrived, pulls it out of
    /// the remaster and lock managers and dispatches it so a worker can
    /// notify the peer partitions and the coordinating server.
    fn maybe_continue_pre_dispatch_abort(&mut self, txn_id: TxnId) -> bool {
        let (holder, reason) = match self.active_txns.get(&txn_id) {
            Some(active_txn) if active_txn.aborting => match active_txn.holder() {
                Some(holder) => (
                    holder.clone(),
                    active_txn.pending_abort_reason.clone().unwrap_or_default(),
                ),
                None => return false,
            },
            _ => return false,
        };
        debug!(txn_id, "main txn of abort arrived");

        // The abort may have been triggered by a remote partition while the
        // txn still sits in one of the managers; this also releases any
        // lock-only fragments.
        if let Some(remaster_manager) = self.remaster_manager.as_mut() {
            let result = remaster_manager.release_transaction(txn_id);
            self.process_remaster_result(result);
        }
        let unblocked = self.lock_manager.release_locks(txn_id);
        for (unblocked_txn_id, deadlocked) in unblocked {
            self.dispatch(unblocked_txn_id, deadlocked);
        }

        {
            let mut guard = holder.lock();
            if !guard.txn.is_aborted() {
                guard.txn.set_aborted(reason);
            }
        }
        self.dispatch(txn_id, false);
        true
    }

    /// A lock-only fragment arriving for an already-aborting txn only needs
    /// registering; erase the whole entry once everything is accounted for.
    fn maybe_continue_pre_dispatch_abort_lock_only(&mut self, txn_id: TxnId) -> bool {
        match self.active_txns.get(&txn_id) {
            Some(active_txn) if active_txn.aborting => {
                if active_txn.is_ready_for_gc() {
                    self.active_txns.remove(&txn_id);
                    counters::ACTIVE_TXNS.set(self.active_txns.len() as i64);
                }
                true
            }
            _ => false,
        }
    }

    /*
     * Dispatch & completion
     */

    fn dispatch(&mut self, txn_id: TxnId, deadlocked: bool) {
        let active_txn = match self.active_txns.get(&txn_id) {
            Some(active_txn) => active_txn,
            None => {
                warn!(txn_id, "dispatch of unknown txn");
                return;
            }
        };
        let holder: TxnHolderRef = match active_txn.holder() {
            Some(holder) => holder.clone(),
            None => {
                // All lock-only fragments were granted before the header
                // arrived; the header's accept call dispatches.
                debug!(txn_id, "locks acquired; waiting for the multi-home header");
                return;
            }
        };
        counters::TXN_DISPATCHED.inc();
        let _ = self.dispatch_tx.send(DispatchedTxn { holder, deadlocked });
        debug!(txn_id, deadlocked, "dispatched txn");
    }

    fn on_worker_done(&mut self, txn_id: TxnId) {
        // Release locks held by this txn and dispatch whatever became ready
        // thanks to the release.
        let unblocked = self.lock_manager.release_locks(txn_id);
        for (unblocked_txn_id, deadlocked) in unblocked {
            self.dispatch(unblocked_txn_id, deadlocked);
        }
        debug!(txn_id, "released locks");

        if self.remaster_manager.is_some() {
            let remaster_result = self
                .active_txns
                .get(&txn_id)
                .and_then(|a| a.holder())
                .and_then(|holder| {
                    let guard = holder.lock();
                    match guard.txn.status {
                        serval_types::transaction::TxnStatus::Committed => {
                            guard.remaster_result.clone()
                        }
                        _ => None,
                    }
                });
            if let Some((key, new_counter)) = remaster_result {
                let result = self
                    .remaster_manager
                    .as_mut()
                    .expect("remaster manager must be configured")
                    .remaster_occurred(&key, new_counter);
                self.process_remaster_result(result);
            }
        }

        let active_txn = self
            .active_txns
            .get_mut(&txn_id)
            .expect("worker done for unknown txn");
        active_txn.done = true;
        if active_txn.is_ready_for_gc() {
            self.active_txns.remove(&txn_id);
        }
        counters::ACTIVE_TXNS.set(self.active_txns.len() as i64);
    }

    /*
     * Stats
     */

    fn process_stats_request(&mut self, request: StatsRequest) {
        let mut stats = json!({
            "num_all_txns": self.active_txns.len(),
        });
        if request.level >= 1 {
            stats["all_txns"] = json!(self.active_txns.keys().collect::<Vec<_>>());
        }
        let lock_manager_stats = self.lock_manager.get_stats(request.level);
        if let Some(fields) = lock_manager_stats.as_object() {
            for (key, value) in fields {
                stats[key.as_str()] = value.clone();
            }
        }
        let local_machine_id = self.config.local_machine_id();
        self.broker.send(
            local_machine_id,
            SERVER_CHANNEL,
            Envelope {
                from: local_machine_id,
                message: Message::StatsResponse(StatsResponse {
                    id: request.id,
                    stats,
                }),
            },
        );
    }
}
