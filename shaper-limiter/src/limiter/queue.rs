use std::collections::VecDeque;

use crate::{unit::OutboundUnit, Priority};

/// Returned when the pending queue is at capacity. Hands the unit back so
/// the caller can deliver the failure; nothing is ever dropped silently.
#[derive(Debug)]
pub(crate) struct QueueFull(pub(crate) OutboundUnit);

/// Bounded, priority-ordered queue of units awaiting tokens: two FIFO lanes,
/// high before low. The bound covers both lanes together.
#[derive(Debug)]
pub(crate) struct PendingQueue {
    high: VecDeque<OutboundUnit>,
    low: VecDeque<OutboundUnit>,
    backlog: usize,
}

impl PendingQueue {
    pub(crate) fn new(backlog: usize) -> Self {
        debug_assert!(backlog > 0, "zero-size pending queue");
        Self { high: VecDeque::new(), low: VecDeque::new(), backlog }
    }

    pub(crate) fn len(&self) -> usize {
        self.high.len() + self.low.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.high.is_empty() && self.low.is_empty()
    }

    pub(crate) fn push(&mut self, unit: OutboundUnit) -> Result<(), QueueFull> {
        if self.len() >= self.backlog {
            return Err(QueueFull(unit));
        }

        match unit.priority() {
            Priority::High => self.high.push_back(unit),
            Priority::Low => self.low.push_back(unit),
        }
        Ok(())
    }

    pub(crate) fn head(&self) -> Option<&OutboundUnit> {
        self.high.front().or_else(|| self.low.front())
    }

    pub(crate) fn pop(&mut self) -> Option<OutboundUnit> {
        self.high.pop_front().or_else(|| self.low.pop_front())
    }

    /// The lowest priority currently queued. A submission strictly above
    /// this may attempt to jump the queue.
    pub(crate) fn min_priority(&self) -> Option<Priority> {
        if !self.low.is_empty() {
            Some(Priority::Low)
        } else if !self.high.is_empty() {
            Some(Priority::High)
        } else {
            None
        }
    }

    /// Empties the queue, head order preserved.
    pub(crate) fn drain(&mut self) -> Vec<OutboundUnit> {
        self.high.drain(..).chain(self.low.drain(..)).collect()
    }
}
