use std::time::Duration;

use shaper_common::constants::{CHUNK_SIZE, KiB, MAX_DATAGRAM_SIZE, MAX_RATE};

/// Options for a [`Shaper`](crate::Shaper).
///
/// The reduction and grant constants of the bandwidth monitor are policy, not
/// protocol: the defaults match the negotiation the daemon has always run,
/// but deployments may tune them.
#[derive(Debug, Clone)]
pub struct ShaperOptions {
    /// Node-wide upload ceiling in bytes/sec. `0` means unlimited.
    pub(crate) max_upload_rate: u64,
    /// Node-wide download ceiling in bytes/sec, used to clamp the watermark
    /// pair. `0` means unlimited.
    pub(crate) max_download_rate: u64,
    /// Maximum number of units waiting for tokens, per limiter instance.
    pub(crate) queue_backlog: usize,
    /// Low watermark on aggregate receive bandwidth, in protocol chunks.
    pub(crate) low_watermark_chunks: u64,
    /// High watermark on aggregate receive bandwidth, in protocol chunks.
    pub(crate) high_watermark_chunks: u64,
    /// Bandwidth monitor recomputation interval.
    pub(crate) tick_interval: Duration,
    /// EWMA smoothing factor for per-peer rate estimates.
    pub(crate) smoothing: f64,
    /// Proportional-reduction penalty factor, > 1.
    pub(crate) penalty_factor: f64,
    /// Peers below this receive rate (bytes/sec) are ignored by the
    /// aggregate.
    pub(crate) noise_floor: f64,
    /// Allocation handed to paused peers on every tick; also the floor of any
    /// proportional reduction. Never zero.
    pub(crate) min_allocation: u64,
    /// How long a `RequestBandwidth` must persist before it is granted.
    pub(crate) request_debounce: Duration,
    /// Bucket-depth cap for per-peer limiters, in bytes.
    pub(crate) peer_bucket_depth: u64,
    /// Largest datagram the daemon sends. The global bucket capacity and
    /// fill rate are never allowed below this.
    pub(crate) max_datagram_size: u64,
}

impl Default for ShaperOptions {
    fn default() -> Self {
        Self {
            max_upload_rate: 0,
            max_download_rate: 0,
            queue_backlog: 1024,
            low_watermark_chunks: 25,
            high_watermark_chunks: 40,
            tick_interval: Duration::from_secs(1),
            smoothing: 0.88,
            penalty_factor: 1.5,
            noise_floor: 1024.0,
            min_allocation: 16 * KiB,
            request_debounce: Duration::from_secs(10),
            peer_bucket_depth: 256 * KiB,
            max_datagram_size: MAX_DATAGRAM_SIZE,
        }
    }
}

impl ShaperOptions {
    /// Sets the upload ceiling in bytes/sec. `0` means unlimited.
    pub fn max_upload_rate(mut self, rate: u64) -> Self {
        self.max_upload_rate = rate;
        self
    }

    /// Sets the download ceiling in bytes/sec. `0` means unlimited.
    pub fn max_download_rate(mut self, rate: u64) -> Self {
        self.max_download_rate = rate;
        self
    }

    /// Sets the per-limiter pending queue backlog.
    pub fn queue_backlog(mut self, backlog: usize) -> Self {
        self.queue_backlog = backlog;
        self
    }

    /// Sets the watermark pair, in protocol chunks.
    pub fn watermark_chunks(mut self, low: u64, high: u64) -> Self {
        self.low_watermark_chunks = low;
        self.high_watermark_chunks = high;
        self
    }

    /// Sets the bandwidth monitor tick interval.
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Sets the EWMA smoothing factor, in `0.0..1.0`.
    pub fn smoothing(mut self, smoothing: f64) -> Self {
        self.smoothing = smoothing;
        self
    }

    /// Sets the proportional-reduction penalty factor.
    pub fn penalty_factor(mut self, penalty: f64) -> Self {
        self.penalty_factor = penalty;
        self
    }

    /// Sets the receive-rate noise floor in bytes/sec.
    pub fn noise_floor(mut self, floor: f64) -> Self {
        self.noise_floor = floor;
        self
    }

    /// Sets the minimum (and paused-peer) allocation in bytes/sec.
    pub fn min_allocation(mut self, allocation: u64) -> Self {
        self.min_allocation = allocation.max(1);
        self
    }

    /// Sets the request debounce delay.
    pub fn request_debounce(mut self, debounce: Duration) -> Self {
        self.request_debounce = debounce;
        self
    }

    /// Sets the per-peer bucket depth cap in bytes.
    pub fn peer_bucket_depth(mut self, depth: u64) -> Self {
        self.peer_bucket_depth = depth;
        self
    }

    /// Sets the largest datagram size the daemon sends.
    pub fn max_datagram_size(mut self, size: u64) -> Self {
        self.max_datagram_size = size;
        self
    }

    /// The fill rate the global limiter actually runs at: the configured
    /// ceiling clamped to the protocol minimum, with `0` meaning unlimited.
    pub(crate) fn clamp_upload_rate(&self, rate: u64) -> u64 {
        if rate == 0 {
            MAX_RATE
        } else {
            rate.max(self.max_datagram_size)
        }
    }

    pub(crate) fn effective_upload_rate(&self) -> u64 {
        self.clamp_upload_rate(self.max_upload_rate)
    }

    /// Watermark pair in bytes/sec, clamped to the download ceiling. Keeps
    /// `low < high` whatever the configuration says.
    pub(crate) fn watermarks(&self, max_download_rate: u64) -> (u64, u64) {
        let ceiling = if max_download_rate == 0 { MAX_RATE } else { max_download_rate };

        let high = (self.high_watermark_chunks * CHUNK_SIZE).min(ceiling).max(2 * CHUNK_SIZE);
        let mut low = (self.low_watermark_chunks * CHUNK_SIZE).min(ceiling).max(CHUNK_SIZE);
        if low >= high {
            low = high / 2;
        }

        (low, high)
    }
}
