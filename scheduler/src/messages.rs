// Copyright © Serval Contributors
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use serval_types::{
    transaction::{KeyEntry, Transaction},
    MachineId, PartitionId, TxnId,
};

/// Logical channel number a module listens on. The numbering leaves room
/// for the outer modules (forwarder, sequencer, orderer) that sit outside
/// this crate; worker channels start above `MAX_CHANNEL`.
pub type Channel = u32;

pub const SERVER_CHANNEL: Channel = 1;
pub const SCHEDULER_CHANNEL: Channel = 9;
pub const WORKER_CHANNEL: Channel = 12;
pub const DEADLOCK_RESOLVER_CHANNEL: Channel = 13;
pub const MAX_CHANNEL: Channel = 17;

pub fn worker_channel(worker: usize) -> Channel {
    MAX_CHANNEL + worker as Channel
}

/// A typed message plus the machine it came from, so the recipient can
/// unpack `(region, partition)` of the sender.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub from: MachineId,
    pub message: Message,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    /// A totally-ordered transaction fragment from the sequencing layer.
    ForwardTxn(Box<Transaction>),
    /// Partial reads of one run of a transaction from a peer partition.
    RemoteReadResult(RemoteReadResult),
    /// One-shot notification from the deadlock resolver that its ready set
    /// is non-empty.
    Signal,
    /// Wait-for graph gossip between deadlock resolvers.
    Graph(Vec<GraphNode>),
    /// Register or remove a per-run redirect tag at the broker.
    BrokerRedirect(BrokerRedirect),
    /// Request for a JSON snapshot of scheduler internals.
    Stats(StatsRequest),
    StatsResponse(StatsResponse),
    /// A finished sub-transaction on its way back to the coordinating
    /// server.
    CompletedSubTxn {
        partition: PartitionId,
        txn: Box<Transaction>,
    },
}

impl Message {
    /// Short name used in log lines about unexpected messages.
    pub fn name(&self) -> &'static str {
        match self {
            Message::ForwardTxn(_) => "ForwardTxn",
            Message::RemoteReadResult(_) => "RemoteReadResult",
            Message::Signal => "Signal",
            Message::Graph(_) => "Graph",
            Message::BrokerRedirect(_) => "BrokerRedirect",
            Message::Stats(_) => "Stats",
            Message::StatsResponse(_) => "StatsResponse",
            Message::CompletedSubTxn { .. } => "CompletedSubTxn",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteReadResult {
    pub txn_id: TxnId,
    pub deadlocked: bool,
    pub partition: PartitionId,
    pub will_abort: bool,
    pub abort_reason: String,
    pub reads: Vec<KeyEntry>,
}

/// One vertex of a partition's stable wait-for graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphNode {
    pub vertex: TxnId,
    pub num_partitions: i32,
    pub deadlocked: bool,
    pub edges: Vec<TxnId>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BrokerRedirect {
    pub tag: u64,
    pub channel: Channel,
    pub stop: bool,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct StatsRequest {
    pub id: u32,
    pub level: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub id: u32,
    pub stats: serde_json::Value,
}
