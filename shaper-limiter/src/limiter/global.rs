use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use shaper_common::constants::{MAX_RATE, MIN_RATE};

use super::{Admission, QueueFull, RateLimiter};
use crate::{
    config::ShaperOptions,
    stats::ShaperState,
    unit::{OutboundUnit, SendError},
    PeerId,
};

/// The node-wide limiter plus the per-peer sub-limiters layered on top of
/// it. Entry point for every outbound unit.
///
/// Owned exclusively by the driver task; the map is never touched from
/// anywhere else, which is what makes the whole hierarchy lock-free.
#[derive(Debug)]
pub(crate) struct GlobalLimiter {
    core: RateLimiter,
    peers: FxHashMap<PeerId, RateLimiter>,
    state: Arc<ShaperState>,
    min_capacity: u64,
    peer_depth: u64,
    backlog: usize,
}

impl GlobalLimiter {
    pub(crate) fn new(options: &ShaperOptions, state: Arc<ShaperState>, now: Instant) -> Self {
        let core = RateLimiter::new(
            options.effective_upload_rate(),
            options.max_datagram_size,
            options.queue_backlog,
            now,
        );

        Self {
            core,
            peers: FxHashMap::default(),
            state,
            min_capacity: options.max_datagram_size,
            peer_depth: options.peer_bucket_depth,
            backlog: options.queue_backlog,
        }
    }

    /// Routes a unit through the destination's sub-limiter when one exists,
    /// else straight into the global core. Returns the units that cleared
    /// every stage and are ready for the transport.
    pub(crate) fn dispatch(&mut self, unit: OutboundUnit, now: Instant) -> Vec<OutboundUnit> {
        let mut ready = Vec::new();

        if let Some(limiter) = self.peers.get_mut(&unit.peer()) {
            match limiter.submit(unit, now) {
                Ok(Admission::Admitted(unit)) => {
                    Self::submit_core(&mut self.core, &self.state, unit, now, &mut ready);
                }
                Ok(Admission::Queued) => self.state.stats.increment_queued(),
                Err(QueueFull(unit)) => Self::reject(&self.state, unit),
            }
        } else {
            Self::submit_core(&mut self.core, &self.state, unit, now, &mut ready);
        }

        ready
    }

    /// Fires every limiter whose deadline has passed. Units admitted by a
    /// per-peer limiter cascade into the global core (two-stage admission).
    pub(crate) fn on_timeout(&mut self, now: Instant) -> Vec<OutboundUnit> {
        let mut ready = Vec::new();

        let Self { core, peers, state, .. } = self;
        for limiter in peers.values_mut() {
            if !limiter.is_due(now) {
                continue;
            }
            for unit in limiter.on_timeout(now) {
                Self::submit_core(core, state, unit, now, &mut ready);
            }
        }

        if core.is_due(now) {
            ready.extend(core.on_timeout(now));
        }

        ready
    }

    /// Handles an `Allocate` control message from `peer`: creates the
    /// sub-limiter on first contact, else forwards the new rate (which the
    /// limiter defers if its timeout is pending).
    pub(crate) fn on_allocation(&mut self, peer: PeerId, rate: u64, now: Instant) {
        let rate = rate.clamp(MIN_RATE, MAX_RATE);

        if let Some(limiter) = self.peers.get_mut(&peer) {
            limiter.set_rate(rate, now);
        } else {
            debug!(%peer, rate, "peer allocation, creating sub-limiter");
            self.peers.insert(
                peer,
                RateLimiter::for_peer(rate, self.min_capacity, self.peer_depth, self.backlog, now),
            );
        }
    }

    /// Local upload-ceiling change.
    pub(crate) fn set_rate(&mut self, fill_rate: u64, now: Instant) {
        self.core.set_rate(fill_rate, now);
    }

    /// Drops the peer's sub-limiter, failing everything it still held.
    pub(crate) fn evict(&mut self, peer: PeerId) {
        if let Some(mut limiter) = self.peers.remove(&peer) {
            let queued = limiter.drain_queued();
            if !queued.is_empty() {
                debug!(%peer, units = queued.len(), "evicting peer with queued units");
            }
            for unit in queued {
                unit.complete(Err(SendError::Closed));
            }
        }
    }

    /// The earliest pending timeout across the whole hierarchy.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let peers = self.peers.values().filter_map(RateLimiter::next_deadline).min();
        match (self.core.next_deadline(), peers) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (deadline, None) | (None, deadline) => deadline,
        }
    }

    fn submit_core(
        core: &mut RateLimiter,
        state: &Arc<ShaperState>,
        unit: OutboundUnit,
        now: Instant,
        ready: &mut Vec<OutboundUnit>,
    ) {
        match core.submit(unit, now) {
            Ok(Admission::Admitted(unit)) => ready.push(unit),
            Ok(Admission::Queued) => state.stats.increment_queued(),
            Err(QueueFull(unit)) => Self::reject(state, unit),
        }
    }

    fn reject(state: &Arc<ShaperState>, unit: OutboundUnit) {
        warn!(peer = %unit.peer(), size = unit.size(), "pending queue full, rejecting unit");
        state.stats.increment_rejected();
        unit.complete(Err(SendError::QueueFull));
    }

    #[cfg(test)]
    pub(crate) fn peer_count(&self) -> usize {
        self.peers.len()
    }
}
