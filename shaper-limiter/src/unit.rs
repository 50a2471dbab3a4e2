use bytes::Bytes;
use thiserror::Error;
use tokio::sync::oneshot;

use shaper_wire::control::ControlMessage;

use crate::{PeerId, Priority, StreamId};

/// Terminal failure of an outbound unit, delivered back to the submitting
/// caller through its [`SendHandle`].
#[derive(Debug, Error)]
pub enum SendError {
    /// The pending queue was at capacity when the unit was submitted.
    #[error("pending queue is full")]
    QueueFull,
    /// The shaper (or the destination peer) went away before the unit was
    /// handed to the transport.
    #[error("shaper closed")]
    Closed,
    /// The transport rejected the unit after admission.
    #[error("transport error: {0}")]
    Transport(Box<dyn std::error::Error + Send + Sync>),
}

/// What kind of traffic a unit carries. Datagrams are admitted at high
/// priority, stream traffic at low priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Datagram,
    StreamBegin { stream: StreamId },
    StreamChunk { stream: StreamId, seq: u64 },
    StreamEnd { stream: StreamId },
}

impl UnitKind {
    pub const fn default_priority(&self) -> Priority {
        match self {
            Self::Datagram => Priority::High,
            _ => Priority::Low,
        }
    }
}

/// A datagram or one stream chunk submitted for shaping.
///
/// Consumed exactly once: submitted, admitted (possibly after queueing in up
/// to two limiters), then handed to the transport. The terminal state is
/// delivered over the completion channel; the submitting caller suspends on
/// the matching [`SendHandle`], never on the driver task.
#[derive(Debug)]
pub struct OutboundUnit {
    kind: UnitKind,
    peer: PeerId,
    payload: Bytes,
    priority: Priority,
    /// Set when the unit had to queue in a per-peer limiter. Propagated as a
    /// `RequestBandwidth` control header instead of a direct call.
    needs_more_bandwidth: bool,
    completion: Option<oneshot::Sender<Result<(), SendError>>>,
}

impl OutboundUnit {
    /// Creates a unit with the default priority for its kind.
    pub fn new(kind: UnitKind, peer: PeerId, payload: Bytes) -> (Self, SendHandle) {
        let priority = kind.default_priority();
        Self::with_priority(kind, peer, payload, priority)
    }

    pub fn with_priority(
        kind: UnitKind,
        peer: PeerId,
        payload: Bytes,
        priority: Priority,
    ) -> (Self, SendHandle) {
        let (tx, rx) = oneshot::channel();
        let unit = Self {
            kind,
            peer,
            payload,
            priority,
            needs_more_bandwidth: false,
            completion: Some(tx),
        };
        (unit, SendHandle { rx })
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Size counted against the token bucket, in bytes.
    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }

    pub fn needs_more_bandwidth(&self) -> bool {
        self.needs_more_bandwidth
    }

    pub(crate) fn mark_needs_bandwidth(&mut self) {
        self.needs_more_bandwidth = true;
    }

    /// The control header to prefix when this unit goes on the wire.
    pub fn control(&self) -> ControlMessage {
        if self.needs_more_bandwidth {
            ControlMessage::RequestBandwidth
        } else {
            ControlMessage::Noop
        }
    }

    /// Moves the unit to its terminal state, resuming the suspended caller.
    /// A dropped handle is fine; the caller stopped caring.
    pub(crate) fn complete(mut self, result: Result<(), SendError>) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(result);
        }
    }
}

/// The suspended caller's half of an outbound unit.
#[derive(Debug)]
pub struct SendHandle {
    rx: oneshot::Receiver<Result<(), SendError>>,
}

impl SendHandle {
    /// Waits for the unit to reach a terminal state. Resolves with the
    /// captured failure if admission or the transport rejected it, or with
    /// `Closed` if the driver went away first.
    pub async fn wait(self) -> Result<(), SendError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(SendError::Closed),
        }
    }
}
