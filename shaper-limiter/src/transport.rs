use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};

use crate::{PeerId, UnitKind};

/// The physical send/receive surface the shaper sits on top of.
///
/// The trait is poll-shaped like a [`Sink`](futures::Sink)/[`Stream`](futures::Stream)
/// pair so the driver can run it from its own poll loop. The shaper exposes
/// the same shape upward, so it slots transparently between application code
/// and the transport.
///
/// Frames passed in both directions carry the control header already encoded
/// (outbound) or not yet decoded (inbound); the shaper owns the codec.
pub trait Transport: Send + Unpin + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Polls readiness to accept one outbound frame.
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>>;

    /// Hands one admitted, encoded frame to the transport. Only called after
    /// `poll_ready` returned `Ready(Ok)`.
    fn start_send(&mut self, peer: PeerId, kind: UnitKind, frame: Bytes)
        -> Result<(), Self::Error>;

    /// Flushes buffered outbound frames.
    fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>>;

    /// Polls for the next inbound frame. `None` means the transport closed.
    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<(PeerId, BytesMut)>>;
}
