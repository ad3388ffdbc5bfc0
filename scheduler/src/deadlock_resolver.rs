// Copyright © Serval Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{
    broker::BrokerRef,
    counters,
    ddr_lock_manager::{DdrLockManager, TxnInfo},
    messages::{Channel, Envelope, GraphNode, Message, DEADLOCK_RESOLVER_CHANNEL},
};
use crossbeam_channel::{never, select, tick, Receiver};
use serval_config::ConfigurationRef;
use serval_types::{TxnId, SENTINEL_TXN_ID};
use std::{
    collections::{HashMap, VecDeque},
    sync::{atomic::Ordering, Arc},
};
use tracing::{debug, error, warn};

struct Node {
    num_partitions: i32,
    /// Whether the vertex was in a deadlock resolved previously.
    deadlocked: bool,
    is_stable: bool,
    is_visited: bool,
    edges: Vec<TxnId>,
    redges: Vec<TxnId>,
}

impl Node {
    fn new(num_partitions: i32, deadlocked: bool, is_stable: bool) -> Self {
        Self {
            num_partitions,
            deadlocked,
            is_stable,
            is_visited: false,
            edges: vec![],
            redges: vec![],
        }
    }
}

type Graph = HashMap<TxnId, Node>;

/// Periodically snapshots the lock manager's wait-for graph, gossips the
/// stable part to the other partitions in the local region, merges the
/// partition graphs, and deterministically rewires stable strongly-connected
/// components to break deadlocks.
///
/// The live graph keeps growing while a run is in progress, so the run only
/// ever touches state that cannot change under it: for every txn in a stable
/// component, the waiting-for counter will not move on its own and the
/// waited-by list only grows. Counter updates are merged back as signed
/// deltas and the waited-by list as a prefix overwrite, which composes with
/// concurrent acquires and releases.
pub struct DeadlockResolver {
    lock_manager: Arc<DdrLockManager>,
    config: ConfigurationRef,
    broker: BrokerRef,
    rx: Receiver<Envelope>,
    signal_channel: Channel,

    /// Snapshot of the lock manager's txn info table. During resolution the
    /// `num_waiting_for` fields hold deltas, not absolute values.
    snapshot: HashMap<TxnId, TxnInfo>,
    partitioned_graph: Vec<Graph>,
    total_graph: Graph,
    scc_order: Vec<TxnId>,
}

impl DeadlockResolver {
    pub fn new(
        lock_manager: Arc<DdrLockManager>,
        config: ConfigurationRef,
        broker: BrokerRef,
        signal_channel: Channel,
    ) -> Self {
        let rx = broker.register(config.local_machine_id(), DEADLOCK_RESOLVER_CHANNEL);
        let num_partitions = config.num_partitions() as usize;
        let mut partitioned_graph = Vec::with_capacity(num_partitions);
        partitioned_graph.resize_with(num_partitions, Graph::new);
        Self {
            lock_manager,
            config,
            broker,
            rx,
            signal_channel,
            snapshot: HashMap::new(),
            partitioned_graph,
            total_graph: Graph::new(),
            scc_order: vec![],
        }
    }

    pub fn run(mut self, shutdown: Receiver<()>) {
        let interval = self.config.ddr_interval();
        let ticker = if interval.is_zero() {
            never()
        } else {
            tick(interval)
        };
        loop {
            select! {
                recv(self.rx) -> env => match env {
                    Ok(env) => self.handle_envelope(env),
                    Err(_) => break,
                },
                recv(ticker) -> _ => self.run_once(),
                recv(shutdown) -> _ => break,
            }
        }
    }

    fn handle_envelope(&mut self, env: Envelope) {
        match env.message {
            Message::Graph(nodes) => self.store_remote_graph(env.from, nodes),
            other => error!(
                msg = other.name(),
                "unexpected message on deadlock resolver channel"
            ),
        }
    }

    fn store_remote_graph(&mut self, from: serval_types::MachineId, nodes: Vec<GraphNode>) {
        let (_, partition) = self.config.unpack_machine_id(from);
        let remote_graph = &mut self.partitioned_graph[partition as usize];
        remote_graph.clear();
        for node in nodes {
            let entry = remote_graph
                .entry(node.vertex)
                .or_insert_with(|| Node::new(node.num_partitions, node.deadlocked, true));
            entry.edges.extend(node.edges);
        }
    }

    /// One full resolution pass. Also driven directly by tests.
    pub fn run_once(&mut self) {
        self.build_local_graph();
        self.broadcast_local_graph();
        self.build_total_graph();
        self.find_scc_order();
        self.check_and_resolve_deadlocks();
    }

    /// Drains pending graph gossip without waiting for the timer.
    pub fn receive_pending_graphs(&mut self) {
        while let Ok(env) = self.rx.try_recv() {
            self.handle_envelope(env);
        }
    }

    fn build_local_graph(&mut self) {
        self.snapshot = self.lock_manager.txn_info.lock().clone();

        let local_partition = self.config.local_partition() as usize;
        let local_graph = &mut self.partitioned_graph[local_partition];
        local_graph.clear();

        let mut unstables = VecDeque::new();
        for (vertex, info) in &self.snapshot {
            let mut node = Node::new(info.num_partitions, info.deadlocked, info.is_stable());
            node.edges = info
                .waited_by
                .iter()
                .copied()
                .filter(|v| *v != SENTINEL_TXN_ID)
                .collect();
            if !info.is_stable() {
                unstables.push_back(*vertex);
            }
            local_graph.insert(*vertex, node);
        }

        // Unstability spreads to everything reachable from an unstable
        // vertex.
        while let Some(vertex) = unstables.pop_front() {
            let edges = match local_graph.get(&vertex) {
                Some(node) => node.edges.clone(),
                None => continue,
            };
            for next in edges {
                match local_graph.get_mut(&next) {
                    Some(node) if node.is_stable => {
                        node.is_stable = false;
                        unstables.push_back(next);
                    }
                    Some(_) => {}
                    None => warn!(vertex = next, "dangling edge in local graph"),
                }
            }
        }

        // Dangling edges may remain after this; later passes check for them.
        local_graph.retain(|_, node| node.is_stable);
    }

    fn broadcast_local_graph(&mut self) {
        let local_partition = self.config.local_partition();
        let local_graph = &self.partitioned_graph[local_partition as usize];
        if local_graph.is_empty() {
            return;
        }
        let nodes: Vec<GraphNode> = local_graph
            .iter()
            .map(|(vertex, node)| GraphNode {
                vertex: *vertex,
                num_partitions: node.num_partitions,
                deadlocked: node.deadlocked,
                edges: node.edges.clone(),
            })
            .collect();
        let destinations: Vec<_> = (0..self.config.num_partitions())
            .filter(|p| *p != local_partition)
            .map(|p| self.config.make_machine_id(self.config.local_region(), p))
            .collect();
        self.broker.send_to_all(
            &destinations,
            DEADLOCK_RESOLVER_CHANNEL,
            Envelope {
                from: self.config.local_machine_id(),
                message: Message::Graph(nodes),
            },
        );
    }

    fn build_total_graph(&mut self) {
        struct MergedVertex {
            expected_partitions: i32,
            actual_partitions: i32,
            deadlocked: bool,
        }

        let mut vertices: HashMap<TxnId, MergedVertex> = HashMap::new();
        for graph in &self.partitioned_graph {
            for (vertex, node) in graph {
                let merged = vertices.entry(*vertex).or_insert(MergedVertex {
                    expected_partitions: node.num_partitions,
                    actual_partitions: 0,
                    deadlocked: false,
                });
                merged.actual_partitions += 1;
                merged.deadlocked |= node.deadlocked;
            }
        }

        // A merged vertex is stable only when every partition it involves
        // has contributed its view.
        self.total_graph.clear();
        for (vertex, merged) in vertices {
            let is_stable = merged.expected_partitions == merged.actual_partitions;
            let mut node = Node::new(merged.expected_partitions, merged.deadlocked, is_stable);
            for graph in &self.partitioned_graph {
                if let Some(partition_node) = graph.get(&vertex) {
                    node.edges.extend(partition_node.edges.iter().copied());
                }
            }
            node.edges.sort_unstable();
            node.edges.dedup();
            self.total_graph.insert(vertex, node);
        }

        // Build the transpose and seed the prune queue with vertices that
        // were already resolved in an earlier run.
        let edge_lists: Vec<(TxnId, Vec<TxnId>)> = self
            .total_graph
            .iter()
            .map(|(vertex, node)| (*vertex, node.edges.clone()))
            .collect();
        for (vertex, edges) in edge_lists {
            for other in edges {
                if let Some(node) = self.total_graph.get_mut(&other) {
                    node.redges.push(vertex);
                }
            }
        }
        let mut queue = VecDeque::new();
        for (vertex, node) in self.total_graph.iter_mut() {
            node.is_visited = node.deadlocked;
            if node.deadlocked {
                queue.push_back(*vertex);
            }
        }

        // Trim non-deadlocked vertices with a path into a deadlocked
        // component: some partition already confirmed them stable and
        // non-deadlocked, and counting them in the stability check below
        // would wrongly flag them unstable. The traversal runs on the
        // transpose.
        while let Some(vertex) = queue.pop_front() {
            let (redges, deadlocked) = {
                let node = self
                    .total_graph
                    .get(&vertex)
                    .expect("queued vertex must exist in the total graph");
                (node.redges.clone(), node.deadlocked)
            };
            for next in redges {
                if let Some(node) = self.total_graph.get_mut(&next) {
                    if !node.is_visited && !node.deadlocked {
                        node.is_visited = true;
                        queue.push_back(next);
                    }
                }
            }
            if !deadlocked {
                self.total_graph.remove(&vertex);
            }
        }

        // Propagate unstability over what is left. Vertices known to be
        // deadlocked are never considered unstable.
        let mut unstables: VecDeque<TxnId> = self
            .total_graph
            .iter()
            .filter(|(_, node)| !node.is_stable && !node.deadlocked)
            .map(|(vertex, _)| *vertex)
            .collect();
        while let Some(vertex) = unstables.pop_front() {
            let edges = match self.total_graph.get(&vertex) {
                Some(node) => node.edges.clone(),
                None => continue,
            };
            for next in edges {
                // Dangling edges are possible here.
                if let Some(node) = self.total_graph.get_mut(&next) {
                    if node.is_stable {
                        node.is_stable = false;
                        unstables.push_back(next);
                    }
                }
            }
        }

        self.total_graph
            .retain(|_, node| node.is_stable || node.deadlocked);
        for node in self.total_graph.values_mut() {
            node.is_visited = false;
        }
    }

    /// Iterative DFS computing a reverse-finish order for the SCC pass.
    /// Recursion is avoided so a long wait chain cannot blow the stack.
    fn find_scc_order(&mut self) {
        self.scc_order.clear();
        let starts: Vec<TxnId> = self.total_graph.keys().copied().collect();
        for first_vertex in starts {
            if self.total_graph[&first_vertex].is_visited {
                continue;
            }
            let mut stack = vec![(first_vertex, false)];
            while let Some((vertex, done)) = stack.pop() {
                if done {
                    self.scc_order.push(vertex);
                    continue;
                }
                let node = self
                    .total_graph
                    .get_mut(&vertex)
                    .expect("dfs only follows edges into the total graph");
                if node.is_visited {
                    continue;
                }
                node.is_visited = true;
                stack.push((vertex, true));
                let edges = node.edges.clone();
                for next in edges {
                    if let Some(next_node) = self.total_graph.get(&next) {
                        if !next_node.is_visited {
                            stack.push((next, false));
                        }
                    }
                }
            }
        }
        self.scc_order.reverse();
    }

    fn check_and_resolve_deadlocks(&mut self) {
        // From here on the snapshot's num_waiting_for fields hold the delta
        // that resolving produces, to be added to the live counters at the
        // end. Absolute writes would lose concurrent acquires and releases.
        for info in self.snapshot.values_mut() {
            info.num_waiting_for = 0;
        }
        for node in self.total_graph.values_mut() {
            node.is_visited = false;
        }

        let mut deadlocks_resolved = 0u64;
        let order = std::mem::take(&mut self.scc_order);
        for vertex in &order {
            let visited = self
                .total_graph
                .get(vertex)
                .expect("scc order contains unknown vertex")
                .is_visited;
            if visited {
                continue;
            }
            let scc = self.form_scc(*vertex);
            if scc.len() > 1 {
                self.resolve_deadlock(scc);
                deadlocks_resolved += 1;
            }
        }
        self.scc_order = order;

        // Collect the txns that were detected to be in a deadlock for the
        // first time.
        let mut to_be_updated = vec![];
        for (txn_id, info) in self.snapshot.iter_mut() {
            if !info.deadlocked {
                if let Some(node) = self.total_graph.get(txn_id) {
                    if node.deadlocked {
                        info.deadlocked = true;
                        to_be_updated.push(*txn_id);
                    }
                }
            }
        }

        let mut ready_txns = vec![];
        if !to_be_updated.is_empty() {
            let mut live = self.lock_manager.txn_info.lock();
            for txn_id in &to_be_updated {
                let new_info = match self.snapshot.get(txn_id) {
                    Some(info) => info,
                    None => continue,
                };
                let info = live
                    .get_mut(txn_id)
                    .expect("a deadlocked txn cannot leave the lock manager mid-run");
                info.deadlocked = true;
                // The live waited_by list may have grown since the snapshot;
                // only the snapshotted prefix is overwritten.
                info.waited_by[..new_info.waited_by.len()].copy_from_slice(&new_info.waited_by);
                info.num_waiting_for += new_info.num_waiting_for;
                // Readiness must be checked inside this critical region, on
                // the merged state. Checking it on either side's own view
                // alone would race with the other side.
                if info.is_ready() {
                    ready_txns.push(*txn_id);
                }
            }
        }

        if !ready_txns.is_empty() {
            self.lock_manager
                .ready_txns
                .lock()
                .extend(ready_txns.iter().copied());
            let local_machine_id = self.config.local_machine_id();
            self.broker.send(
                local_machine_id,
                self.signal_channel,
                Envelope {
                    from: local_machine_id,
                    message: Message::Signal,
                },
            );
        }

        if deadlocks_resolved > 0 {
            counters::DEADLOCKS_RESOLVED.inc_by(deadlocks_resolved);
            debug!(
                deadlocks_resolved,
                new_ready_txns = ready_txns.len(),
                "deadlock group(s) found and resolved"
            );
        }
    }

    /// Collects the strongly-connected component of `start` by walking the
    /// transpose, and marks every member of a non-trivial component
    /// deadlocked.
    fn form_scc(&mut self, start: TxnId) -> Vec<TxnId> {
        let mut scc = vec![];
        let mut stack = vec![start];
        self.total_graph
            .get_mut(&start)
            .expect("scc start vertex must exist")
            .is_visited = true;
        while let Some(vertex) = stack.pop() {
            scc.push(vertex);
            let redges = self.total_graph[&vertex].redges.clone();
            for next in redges {
                if let Some(node) = self.total_graph.get_mut(&next) {
                    if !node.is_visited {
                        node.is_visited = true;
                        stack.push(next);
                    }
                }
            }
        }
        if scc.len() > 1 {
            for vertex in &scc {
                self.total_graph.get_mut(vertex).unwrap().deadlocked = true;
            }
        }
        scc
    }

    /// Rewires one component: every intra-component edge among members
    /// present on this partition is blanked, then the members are linked
    /// into a single chain in ascending txn id order. Sorting makes the
    /// rewiring identical on every partition that sees the same component.
    fn resolve_deadlock(&mut self, mut scc: Vec<TxnId>) {
        debug_assert!(scc.len() >= 2);
        scc.sort_unstable();

        let mut prev_local = scc.len() as isize - 1;
        while prev_local >= 0 && !self.snapshot.contains_key(&scc[prev_local as usize]) {
            prev_local -= 1;
        }
        if prev_local <= 0 {
            return;
        }

        for i in (0..=prev_local as usize).rev() {
            if !self.snapshot.contains_key(&scc[i]) {
                continue;
            }
            let this_vertex = scc[i];

            let removals: Vec<(usize, TxnId)> = {
                let info = &self.snapshot[&this_vertex];
                assert!(
                    info.is_stable(),
                    "scc contains unstable txn: {}",
                    this_vertex
                );
                info.waited_by
                    .iter()
                    .copied()
                    .enumerate()
                    .filter(|(_, other)| scc.binary_search(other).is_ok())
                    .collect()
            };
            for (slot, other_vertex) in removals {
                // Blanking the slot removes the edge without shrinking the
                // list.
                self.snapshot
                    .get_mut(&this_vertex)
                    .unwrap()
                    .waited_by[slot] = SENTINEL_TXN_ID;
                self.snapshot
                    .get_mut(&other_vertex)
                    .expect("edge within this partition points at a local txn")
                    .num_waiting_for -= 1;
            }

            if i != prev_local as usize {
                let other_vertex = scc[prev_local as usize];
                // A sentinel slot always exists: one is seeded at txn info
                // creation and removals above only add more.
                let slot = self.snapshot[&this_vertex]
                    .waited_by
                    .iter()
                    .position(|v| *v == SENTINEL_TXN_ID)
                    .expect("cannot find slot to add new edge");
                self.snapshot.get_mut(&this_vertex).unwrap().waited_by[slot] = other_vertex;
                self.snapshot
                    .get_mut(&other_vertex)
                    .unwrap()
                    .num_waiting_for += 1;
            }

            prev_local = i as isize;
        }

        self.lock_manager
            .num_deadlocks_resolved
            .fetch_add(1, Ordering::Relaxed);
    }
}
