use std::sync::atomic::{AtomicUsize, Ordering};

/// Statistics for a shaper, shared between the driver task and the socket
/// front-end.
#[derive(Debug, Default)]
pub struct ShaperStats {
    /// Total payload bytes handed to the transport.
    bytes_tx: AtomicUsize,
    /// Total payload bytes received from the transport.
    bytes_rx: AtomicUsize,
    /// Units admitted and handed to the transport.
    units_admitted: AtomicUsize,
    /// Units that had to wait in a pending queue at least once.
    units_queued: AtomicUsize,
    /// Units rejected with a full pending queue.
    units_rejected: AtomicUsize,
    /// Control messages emitted by the bandwidth monitor.
    control_tx: AtomicUsize,
}

impl ShaperStats {
    #[inline]
    pub(crate) fn increment_tx(&self, bytes: usize) {
        self.bytes_tx.fetch_add(bytes, Ordering::Relaxed);
        self.units_admitted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_rx(&self, bytes: usize) {
        self.bytes_rx.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_queued(&self) {
        self.units_queued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_rejected(&self) {
        self.units_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_control_tx(&self) {
        self.control_tx.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn bytes_tx(&self) -> usize {
        self.bytes_tx.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bytes_rx(&self) -> usize {
        self.bytes_rx.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn units_admitted(&self) -> usize {
        self.units_admitted.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn units_queued(&self) -> usize {
        self.units_queued.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn units_rejected(&self) -> usize {
        self.units_rejected.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn control_tx(&self) -> usize {
        self.control_tx.load(Ordering::Relaxed)
    }
}

/// The shaper state shared between the driver task and the socket front-end.
#[derive(Debug, Default)]
pub(crate) struct ShaperState {
    pub(crate) stats: ShaperStats,
}
