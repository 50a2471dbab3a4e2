//! Receive-side bandwidth monitor.
//!
//! Tracks the incoming byte rate per peer, recomputes allocations on a fixed
//! tick, and answers piggybacked bandwidth requests. All of its output is a
//! list of control messages for the driver to send best-effort; a lost
//! message self-heals on the next tick.

use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use shaper_wire::control::ControlMessage;

use crate::{config::ShaperOptions, PeerId};

/// Receive-side record for one peer. Created lazily on first inbound
/// traffic, removed when the device leaves the active-peer set.
#[derive(Debug, Default)]
struct PeerRecvInfo {
    /// Rolling rate estimate in bytes/sec.
    rate: f64,
    /// Bytes received since the last tick.
    bytes_since_tick: u64,
    /// Paused peers always get the minimum allocation and stay out of the
    /// aggregate.
    paused: bool,
    /// When the current run of unanswered bandwidth requests began.
    request_since: Option<Instant>,
    /// Last allocation we sent this peer.
    last_allocated: u64,
}

/// Computes per-peer receive allocations and emits the control messages
/// that carry them. Owned by the driver task, like the limiter maps.
#[derive(Debug)]
pub(crate) struct BandwidthMonitor {
    peers: FxHashMap<PeerId, PeerRecvInfo>,
    options: ShaperOptions,
    low_watermark: u64,
    high_watermark: u64,
}

impl BandwidthMonitor {
    pub(crate) fn new(options: ShaperOptions) -> Self {
        let (low_watermark, high_watermark) = options.watermarks(options.max_download_rate);
        Self { peers: FxHashMap::default(), options, low_watermark, high_watermark }
    }

    /// Counts an inbound unit and handles its control header. Returns a
    /// grant to send back, if the peer's request has earned one.
    pub(crate) fn on_inbound(
        &mut self,
        peer: PeerId,
        len: u64,
        control: ControlMessage,
        now: Instant,
    ) -> Option<ControlMessage> {
        let total = self.active_total();
        let info = self.peers.entry(peer).or_default();
        info.bytes_since_tick += len;

        match control {
            ControlMessage::RequestBandwidth => {
                let since = *info.request_since.get_or_insert(now);
                // Debounce: the request must persist before we react.
                if now.duration_since(since) < self.options.request_debounce {
                    return None;
                }
                if total >= self.low_watermark as f64 {
                    trace!(%peer, total, "bandwidth request denied, above low watermark");
                    return None;
                }

                let grant = if info.paused {
                    self.options.min_allocation
                } else {
                    info.rate as u64 + (self.low_watermark - total as u64)
                };
                info.request_since = None;
                info.last_allocated = grant;
                debug!(%peer, grant, "granting bandwidth request");
                Some(ControlMessage::Allocate(grant))
            }
            // Any non-request header breaks the run of requests.
            ControlMessage::Noop | ControlMessage::Allocate(_) => {
                info.request_since = None;
                None
            }
        }
    }

    /// Periodic recomputation. Updates every rolling estimate, re-floors
    /// paused peers, and when the aggregate exceeds the high watermark,
    /// reduces allocations until it is back under the low one.
    pub(crate) fn tick(&mut self) -> Vec<(PeerId, ControlMessage)> {
        let interval = self.options.tick_interval.as_secs_f64();
        let alpha = self.options.smoothing;

        for info in self.peers.values_mut() {
            let sample = info.bytes_since_tick as f64 / interval;
            info.rate = alpha * info.rate + (1.0 - alpha) * sample;
            info.bytes_since_tick = 0;
        }

        let mut out = Vec::new();

        // Paused peers keep a small fixed allocation so they can still ask
        // for more later; they never contribute to the aggregate.
        for (id, info) in &mut self.peers {
            if info.paused {
                info.last_allocated = self.options.min_allocation;
                out.push((*id, ControlMessage::Allocate(self.options.min_allocation)));
            }
        }

        let mut active: Vec<(PeerId, f64)> = self
            .peers
            .iter()
            .filter(|(_, info)| !info.paused && info.rate > self.options.noise_floor)
            .map(|(id, info)| (*id, info.rate))
            .collect();
        let total: f64 = active.iter().map(|(_, rate)| rate).sum();

        if total > self.high_watermark as f64 {
            let excess = total - self.low_watermark as f64;
            debug!(total, excess, "aggregate above high watermark, reducing allocations");

            // Slowest peers first; ties broken by peer identifier.
            active.sort_by(|a, b| {
                a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0))
            });

            let mut reduced = 0.0;
            for (id, rate) in active {
                if reduced >= excess {
                    break;
                }

                let new_alloc = if rate >= 2.0 * self.low_watermark as f64 {
                    self.low_watermark as f64
                } else {
                    let cut = rate / total * excess * self.options.penalty_factor;
                    (rate - cut).max(self.options.min_allocation as f64)
                };
                if new_alloc >= rate {
                    continue;
                }

                reduced += rate - new_alloc;
                let grant = new_alloc as u64;
                if let Some(info) = self.peers.get_mut(&id) {
                    info.last_allocated = grant;
                }
                out.push((id, ControlMessage::Allocate(grant)));
            }
        }

        out
    }

    /// Local download-ceiling change: recompute the watermark pair.
    pub(crate) fn set_download_limit(&mut self, rate: u64) {
        let (low, high) = self.options.watermarks(rate);
        self.low_watermark = low;
        self.high_watermark = high;
        debug!(low, high, "watermarks recomputed");
    }

    pub(crate) fn set_peer_paused(&mut self, peer: PeerId, paused: bool) {
        self.peers.entry(peer).or_default().paused = paused;
    }

    /// Device evicted from the active-peer set.
    pub(crate) fn evict(&mut self, peer: PeerId) {
        self.peers.remove(&peer);
    }

    /// Aggregate rate of active peers above the noise floor.
    fn active_total(&self) -> f64 {
        self.peers
            .values()
            .filter(|info| !info.paused && info.rate > self.options.noise_floor)
            .map(|info| info.rate)
            .sum()
    }

    #[cfg(test)]
    fn seed_rate(&mut self, peer: PeerId, rate: f64) {
        self.peers.entry(peer).or_default().rate = rate;
    }
}
