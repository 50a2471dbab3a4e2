//! In-memory transport for driving the shaper end to end.

use std::{
    io,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};

use shaper_limiter::{PeerId, Transport, UnitKind};
use shaper_wire::control::{Codec, ControlMessage, Frame};

/// One frame the shaper handed to the transport.
#[derive(Debug, Clone)]
pub struct SentFrame {
    pub peer: PeerId,
    pub kind: UnitKind,
    pub frame: Bytes,
}

impl SentFrame {
    pub fn decode(&self) -> Frame {
        let mut buf = BytesMut::from(self.frame.as_ref());
        Codec::new().decode(&mut buf).unwrap().expect("complete frame")
    }
}

pub struct MockTransport {
    sent: Arc<Mutex<Vec<SentFrame>>>,
    inbound: mpsc::UnboundedReceiver<(PeerId, BytesMut)>,
    fail_sends: bool,
}

/// Handle to inspect and feed a [`MockTransport`] after the shaper took it.
#[derive(Clone)]
pub struct MockHandle {
    sent: Arc<Mutex<Vec<SentFrame>>>,
    inbound: mpsc::UnboundedSender<(PeerId, BytesMut)>,
}

pub fn transport() -> (MockTransport, MockHandle) {
    transport_with(false)
}

pub fn failing_transport() -> (MockTransport, MockHandle) {
    transport_with(true)
}

fn transport_with(fail_sends: bool) -> (MockTransport, MockHandle) {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    (
        MockTransport { sent: Arc::clone(&sent), inbound: inbound_rx, fail_sends },
        MockHandle { sent, inbound: inbound_tx },
    )
}

impl MockHandle {
    pub fn sent(&self) -> Vec<SentFrame> {
        self.sent.lock().unwrap().clone()
    }

    /// Feeds the shaper one inbound wire frame from `peer`.
    pub fn push_inbound(&self, peer: PeerId, control: ControlMessage, payload: Bytes) {
        let mut buf = BytesMut::new();
        Codec::new().encode(Frame::new(control, payload), &mut buf).unwrap();
        self.inbound.send((peer, buf)).unwrap();
    }
}

impl Transport for MockTransport {
    type Error = io::Error;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(
        &mut self,
        peer: PeerId,
        kind: UnitKind,
        frame: Bytes,
    ) -> Result<(), Self::Error> {
        if self.fail_sends {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"));
        }
        self.sent.lock().unwrap().push(SentFrame { peer, kind, frame });
        Ok(())
    }

    fn poll_flush(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<(PeerId, BytesMut)>> {
        self.inbound.poll_recv(cx)
    }
}
