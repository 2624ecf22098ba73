//! Sharded set of independent capsules, one per agent.
//!
//! Capsules share nothing, so each shard is locked on its own and agents in
//! different shards can be stepped from different threads.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use belief_capsule_core::codec::Fnv1a;
use belief_capsule_core::{CapsuleCfg, EmissionChannel, Envelope, EvidenceBatch, Snapshot, StepDigest, Tick};

use crate::error::{SupervisorError, SupervisorResult};

/// Per-agent snapshots, sorted by agent id.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub agents: Vec<(String, Snapshot)>,
}

#[derive(Default, Debug)]
struct Shard {
    channels: HashMap<String, EmissionChannel>,
}

fn shard_index(agent_id: &str, shard_count: usize) -> usize {
    if shard_count <= 1 {
        return 0;
    }
    let mut h = Fnv1a::new();
    h.write(agent_id.as_bytes());
    (h.finish() % shard_count as u64) as usize
}

/// One `EmissionChannel` per agent id, created on first use with the
/// fleet's config.
#[derive(Debug)]
pub struct CapsuleFleet {
    cfg: CapsuleCfg,
    shards: Vec<Mutex<Shard>>,
}

impl CapsuleFleet {
    /// `shards == 1` behaves like a single map behind one lock.
    pub fn new(shards: usize, cfg: CapsuleCfg) -> SupervisorResult<Self> {
        cfg.validate()?;
        let shards = (0..shards.max(1)).map(|_| Mutex::new(Shard::default())).collect();
        Ok(Self { cfg, shards })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn ingest_and_tick(&self, agent_id: &str, batch: &EvidenceBatch) -> SupervisorResult<StepDigest> {
        let mut shard = self.shard_for(agent_id)?;
        if !shard.channels.contains_key(agent_id) {
            let channel = EmissionChannel::new(self.cfg.clone())?;
            debug!(agent = agent_id, tick = batch.tick, "capsule opened");
            shard.channels.insert(agent_id.to_string(), channel);
        }
        let channel = shard
            .channels
            .get_mut(agent_id)
            .ok_or_else(|| SupervisorError::UnknownAgent(agent_id.to_string()))?;
        channel.ingest_and_tick(batch)?;
        Ok(channel.last_step())
    }

    pub fn advance(&self, agent_id: &str, tick: Tick) -> SupervisorResult<StepDigest> {
        self.with_channel(agent_id, |ch| {
            ch.advance(tick)?;
            Ok(ch.last_step())
        })
    }

    pub fn build_envelope(&self, agent_id: &str, sequence: u64) -> SupervisorResult<Envelope> {
        self.with_channel(agent_id, |ch| Ok(ch.build_envelope(sequence)?))
    }

    pub fn size(&self, agent_id: &str) -> SupervisorResult<usize> {
        self.with_channel(agent_id, |ch| Ok(ch.capsule().size()))
    }

    /// Drop an agent's capsule. Returns whether it existed.
    pub fn close(&self, agent_id: &str) -> SupervisorResult<bool> {
        let mut shard = self.shard_for(agent_id)?;
        let existed = shard.channels.remove(agent_id).is_some();
        if existed {
            debug!(agent = agent_id, "capsule closed");
        }
        Ok(existed)
    }

    /// Current snapshot of every agent, sorted by agent id.
    pub fn snapshot(&self) -> SupervisorResult<FleetSnapshot> {
        let mut agents = Vec::new();
        // Lock shards in a stable order.
        for shard in &self.shards {
            let guard = shard.lock().map_err(|_| SupervisorError::Poisoned)?;
            for (id, ch) in &guard.channels {
                agents.push((id.clone(), ch.capsule().snapshot()));
            }
        }
        agents.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(FleetSnapshot { agents })
    }

    pub fn agent_ids(&self) -> SupervisorResult<Vec<String>> {
        let mut ids = Vec::new();
        for shard in &self.shards {
            let guard = shard.lock().map_err(|_| SupervisorError::Poisoned)?;
            ids.extend(guard.channels.keys().cloned());
        }
        ids.sort();
        Ok(ids)
    }

    fn shard_for(&self, agent_id: &str) -> SupervisorResult<MutexGuard<'_, Shard>> {
        self.shards[shard_index(agent_id, self.shards.len())]
            .lock()
            .map_err(|_| SupervisorError::Poisoned)
    }

    fn with_channel<T>(
        &self,
        agent_id: &str,
        f: impl FnOnce(&mut EmissionChannel) -> SupervisorResult<T>,
    ) -> SupervisorResult<T> {
        let mut shard = self.shard_for(agent_id)?;
        let channel = shard
            .channels
            .get_mut(agent_id)
            .ok_or_else(|| SupervisorError::UnknownAgent(agent_id.to_string()))?;
        f(channel)
    }
}
