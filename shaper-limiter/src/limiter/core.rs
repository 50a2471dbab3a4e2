use tokio::time::Instant;

use super::{
    bucket::TokenBucket,
    queue::{PendingQueue, QueueFull},
};
use crate::unit::OutboundUnit;

/// Outcome of submitting a unit to a limiter.
#[derive(Debug)]
pub(crate) enum Admission {
    /// Tokens were deducted; the unit is ready to be forwarded.
    Admitted(OutboundUnit),
    /// The unit is waiting for tokens; a timeout has been armed if one can
    /// ever fire.
    Queued,
}

/// Token-bucket admission plus a bounded pending queue and at most one
/// pending timeout. Both limiter roles are this one value type; they differ
/// only in what the owner does with admitted units (cascade into the global
/// core vs. hand to the transport) and in whether queued units are flagged
/// as needing more bandwidth.
///
/// Time is injected, never read; the owning driver task is the only clock.
#[derive(Debug)]
pub(crate) struct RateLimiter {
    bucket: TokenBucket,
    queue: PendingQueue,
    /// Deadline of the single pending timeout, if armed. Re-arming replaces
    /// the previous descriptor.
    deadline: Option<Instant>,
    /// Fill-rate change deferred until the current drain cycle completes.
    pending_rate: Option<u64>,
    /// Per-peer role: queued units piggyback a bandwidth request.
    flag_on_queue: bool,
}

impl RateLimiter {
    /// The node-wide role: capacity follows the fill rate, uncapped.
    pub(crate) fn new(fill_rate: u64, min_capacity: u64, backlog: usize, now: Instant) -> Self {
        Self {
            bucket: TokenBucket::new(fill_rate, min_capacity, now),
            queue: PendingQueue::new(backlog),
            deadline: None,
            pending_rate: None,
            flag_on_queue: false,
        }
    }

    /// The per-peer role: bucket depth capped, queued units flagged.
    pub(crate) fn for_peer(
        fill_rate: u64,
        min_capacity: u64,
        depth: u64,
        backlog: usize,
        now: Instant,
    ) -> Self {
        Self {
            bucket: TokenBucket::bounded(fill_rate, min_capacity, depth, now),
            queue: PendingQueue::new(backlog),
            deadline: None,
            pending_rate: None,
            flag_on_queue: true,
        }
    }

    /// Admits the unit immediately when possible, otherwise queues it.
    ///
    /// With an empty queue, admission is a straight token check. With a
    /// non-empty queue, only a unit of strictly higher priority than the
    /// lowest queued priority may re-check tokens and jump; everything else
    /// lines up. A full queue hands the unit back in the error.
    pub(crate) fn submit(
        &mut self,
        mut unit: OutboundUnit,
        now: Instant,
    ) -> Result<Admission, QueueFull> {
        let may_jump = match self.queue.min_priority() {
            None => true,
            Some(lowest) => unit.priority() > lowest,
        };

        if may_jump && self.bucket.try_admit(unit.size(), now) {
            if !self.queue.is_empty() {
                // The jump consumed tokens; the queued head moved out.
                self.rearm(now);
            }
            return Ok(Admission::Admitted(unit));
        }

        if self.flag_on_queue {
            unit.mark_needs_bandwidth();
        }
        self.queue.push(unit)?;
        self.rearm(now);
        Ok(Admission::Queued)
    }

    /// Drains the head of the queue while tokens suffice, then re-arms the
    /// next timeout and applies any deferred fill-rate change. Errors the
    /// owner hits while forwarding the returned units must not come back
    /// here; limiter state is already consistent.
    pub(crate) fn on_timeout(&mut self, now: Instant) -> Vec<OutboundUnit> {
        let mut admitted = Vec::new();

        while let Some(head) = self.queue.head() {
            if !self.bucket.try_admit(head.size(), now) {
                break;
            }
            admitted.push(self.queue.pop().expect("non-empty queue has a head"));
        }

        self.deadline = None;
        if let Some(rate) = self.pending_rate.take() {
            self.bucket.set_rate(rate, now);
        }
        self.rearm(now);

        admitted
    }

    /// Applies a new fill rate, or defers it until the pending drain cycle
    /// completes when a timeout is armed. Covers both the local
    /// configuration path and allocation control messages.
    pub(crate) fn set_rate(&mut self, fill_rate: u64, now: Instant) {
        if self.deadline.is_some() {
            self.pending_rate = Some(fill_rate);
            return;
        }

        self.bucket.set_rate(fill_rate, now);
        self.rearm(now);
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub(crate) fn is_due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Empties the pending queue for eviction. The caller owns delivering
    /// the failure to each unit.
    pub(crate) fn drain_queued(&mut self) -> Vec<OutboundUnit> {
        self.deadline = None;
        self.queue.drain()
    }

    fn rearm(&mut self, now: Instant) {
        self.deadline =
            self.queue.head().and_then(|head| self.bucket.deadline_for(head.size(), now));
        debug_assert!(
            self.deadline.is_none() || !self.queue.is_empty(),
            "timeout armed with empty queue"
        );
    }

    #[cfg(test)]
    pub(crate) fn bucket(&mut self) -> &mut TokenBucket {
        &mut self.bucket
    }
}
