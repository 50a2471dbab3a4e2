//! Traffic shaping for a peer-to-peer file synchronization daemon.
//!
//! Every outbound unit of traffic flows through a node-wide token-bucket
//! limiter, optionally preceded by a per-peer sub-limiter created when the
//! remote side hands us a bandwidth allocation. The receive side runs a
//! bandwidth monitor that estimates per-peer rates and negotiates
//! allocations over the in-band control header defined in `shaper-wire`.
//!
//! All limiter and monitor state is owned by a single driver task; callers
//! submitting a unit suspend on a oneshot until the unit reaches a terminal
//! state.

use std::fmt;

use thiserror::Error;

mod config;
mod driver;
mod limiter;
mod monitor;
mod socket;
mod stats;
mod transport;
mod unit;

pub use config::ShaperOptions;
pub use socket::{Inbound, Shaper};
pub use stats::ShaperStats;
pub use transport::Transport;
pub use unit::{OutboundUnit, SendError, SendHandle, UnitKind};

/// Buffer size of the channels between the socket front-end and the driver.
const DEFAULT_QUEUE_SIZE: usize = 1024;

/// Identifies a remote device in the node's active-peer set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(u64);

impl PeerId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Identifies one outbound stream to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(u32);

impl StreamId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn id(&self) -> u32 {
        self.0
    }

    pub(crate) fn increment(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }
}

/// Admission priority of an outbound unit. High-priority units may jump
/// ahead of queued low-priority traffic when tokens allow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    High,
}

#[derive(Debug, Error)]
pub enum ShaperError {
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),
    #[error("Wire protocol error: {0:?}")]
    Wire(#[from] shaper_wire::control::Error),
    #[error("Shaper closed")]
    Closed,
    #[error("Transport error: {0:?}")]
    Transport(Box<dyn std::error::Error + Send + Sync>),
}
