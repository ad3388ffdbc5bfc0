// Copyright © Serval Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::messages::{BrokerRedirect, Channel, Envelope};
use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use serval_types::MachineId;
use std::sync::Arc;
use tracing::{debug, error};

/// In-process message substrate backing the named-channel contract. Every
/// module registers a `(machine, channel)` endpoint at startup; messages to
/// unknown endpoints are dropped with an error log.
///
/// Remote read results are demultiplexed by run tag instead of channel: a
/// worker registers a redirect for the run it is waiting on and removes it
/// when the run finishes. Tagged messages that arrive before the redirect
/// exists are buffered until a worker claims the tag.
pub struct Broker {
    channels: DashMap<(MachineId, Channel), Sender<Envelope>>,
    redirects: DashMap<(MachineId, u64), Redirect>,
}

enum Redirect {
    Channel(Channel),
    Pending(Vec<Envelope>),
}

pub type BrokerRef = Arc<Broker>;

impl Broker {
    pub fn new() -> BrokerRef {
        Arc::new(Self {
            channels: DashMap::new(),
            redirects: DashMap::new(),
        })
    }

    /// Creates the inbound queue for a `(machine, channel)` endpoint.
    /// Queues are unbounded; admission control happens upstream.
    pub fn register(&self, machine: MachineId, channel: Channel) -> Receiver<Envelope> {
        let (tx, rx) = unbounded();
        if self.channels.insert((machine, channel), tx).is_some() {
            error!(machine, channel, "channel registered twice");
        }
        rx
    }

    pub fn send(&self, to: MachineId, channel: Channel, env: Envelope) {
        match self.channels.get(&(to, channel)) {
            Some(tx) => {
                // A send only fails when the receiving module is gone, which
                // happens during shutdown.
                let _ = tx.send(env);
            }
            None => {
                error!(to, channel, msg = env.message.name(), "no such channel");
            }
        }
    }

    pub fn send_to_all(&self, to: &[MachineId], channel: Channel, env: Envelope) {
        for machine in to {
            self.send(*machine, channel, env.clone());
        }
    }

    /// Delivers a tagged message through the redirect table, buffering it if
    /// no worker has claimed the tag yet.
    pub fn send_tagged(&self, to: MachineId, tag: u64, env: Envelope) {
        let mut entry = self
            .redirects
            .entry((to, tag))
            .or_insert_with(|| Redirect::Pending(vec![]));
        match entry.value_mut() {
            Redirect::Channel(channel) => {
                let channel = *channel;
                drop(entry);
                self.send(to, channel, env);
            }
            Redirect::Pending(buffer) => buffer.push(env),
        }
    }

    /// Installs or removes a redirect tag. Installing flushes any messages
    /// buffered under the tag.
    pub fn handle_redirect(&self, machine: MachineId, redirect: BrokerRedirect) {
        if redirect.stop {
            self.redirects.remove(&(machine, redirect.tag));
            return;
        }
        let buffered = match self
            .redirects
            .insert((machine, redirect.tag), Redirect::Channel(redirect.channel))
        {
            Some(Redirect::Pending(buffer)) => buffer,
            Some(Redirect::Channel(old)) => {
                error!(
                    machine,
                    tag = redirect.tag,
                    old,
                    new = redirect.channel,
                    "redirect tag claimed twice"
                );
                vec![]
            }
            None => vec![],
        };
        if !buffered.is_empty() {
            debug!(
                machine,
                tag = redirect.tag,
                count = buffered.len(),
                "flushing buffered messages to redirect"
            );
        }
        for env in buffered {
            self.send(machine, redirect.channel, env);
        }
    }
}
