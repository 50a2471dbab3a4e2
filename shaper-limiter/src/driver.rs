use std::{
    collections::VecDeque,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use futures::{Future, FutureExt};
use tokio::{
    sync::mpsc,
    time::{Instant, Interval, Sleep},
};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, error, trace, warn};

use shaper_wire::control::{Codec, ControlMessage, Frame};

use crate::{
    config::ShaperOptions,
    limiter::GlobalLimiter,
    monitor::BandwidthMonitor,
    socket::Inbound,
    stats::ShaperState,
    transport::Transport,
    unit::{OutboundUnit, SendError},
    PeerId, ShaperError, UnitKind,
};

/// Runtime commands from the socket front-end to the driver.
#[derive(Debug)]
pub(crate) enum Command {
    Submit(OutboundUnit),
    SetUploadLimit(u64),
    SetDownloadLimit(u64),
    SetPeerPaused(PeerId, bool),
    EvictPeer(PeerId),
}

/// The single task that owns every limiter and the bandwidth monitor.
///
/// All admission decisions, map mutations and timeouts run on this task;
/// there is no locking anywhere in the hierarchy because nothing else can
/// touch the state. Suspended callers are resumed from here through their
/// units' completion channels.
pub(crate) struct ShaperDriver<T: Transport> {
    pub(crate) transport: T,
    pub(crate) options: Arc<ShaperOptions>,
    pub(crate) state: Arc<ShaperState>,
    /// Commands from the socket front-end.
    pub(crate) from_socket: mpsc::Receiver<Command>,
    /// Inbound payloads to the socket front-end.
    pub(crate) to_socket: mpsc::Sender<Inbound>,
    pub(crate) limiter: GlobalLimiter,
    pub(crate) monitor: BandwidthMonitor,
    /// Admitted units awaiting the transport.
    pub(crate) egress: VecDeque<OutboundUnit>,
    /// Monitor output, sent best-effort behind the data units.
    pub(crate) control_egress: VecDeque<(PeerId, ControlMessage)>,
    /// The single pending-timeout timer, armed to the earliest deadline
    /// across the limiter hierarchy.
    pub(crate) timeout: Option<Pin<Box<Sleep>>>,
    pub(crate) timeout_deadline: Option<Instant>,
    /// Bandwidth monitor tick.
    pub(crate) tick: Interval,
    pub(crate) should_flush: bool,
}

impl<T: Transport> Future for ShaperDriver<T> {
    type Output = Result<(), ShaperError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        loop {
            // Flush any frames already handed to the transport.
            if this.should_flush {
                match this.transport.poll_flush(cx) {
                    Poll::Ready(Ok(())) => this.should_flush = false,
                    Poll::Ready(Err(e)) => {
                        return Poll::Ready(Err(ShaperError::Transport(Box::new(e))))
                    }
                    Poll::Pending => {}
                }
            }

            // Drain admitted units and control messages into the transport.
            if !this.egress.is_empty() || !this.control_egress.is_empty() {
                match this.transport.poll_ready(cx) {
                    Poll::Ready(Ok(())) => {
                        if let Some(unit) = this.egress.pop_front() {
                            this.send_unit(unit);
                            continue;
                        }
                        if let Some((peer, control)) = this.control_egress.pop_front() {
                            this.send_control(peer, control);
                            continue;
                        }
                    }
                    Poll::Ready(Err(e)) => {
                        return Poll::Ready(Err(ShaperError::Transport(Box::new(e))))
                    }
                    Poll::Pending => {}
                }
            }

            // Pending timeout: drain whichever limiters are due.
            if let Some(ref mut timeout) = this.timeout {
                if timeout.poll_unpin(cx).is_ready() {
                    let now = Instant::now();
                    let ready = this.limiter.on_timeout(now);
                    trace!(units = ready.len(), "pending timeout fired");
                    this.egress.extend(ready);
                    this.timeout = None;
                    this.timeout_deadline = None;
                    this.rearm_timeout();
                    continue;
                }
            }

            // Bandwidth monitor tick.
            if this.tick.poll_tick(cx).is_ready() {
                let messages = this.monitor.tick();
                this.control_egress.extend(messages);
                continue;
            }

            // Commands from the socket front-end.
            match this.from_socket.poll_recv(cx) {
                Poll::Ready(Some(command)) => {
                    this.on_command(command);
                    continue;
                }
                // Front-end dropped: shut down. Queued units are dropped,
                // which resumes their callers with `Closed`.
                Poll::Ready(None) => {
                    debug!("socket front-end dropped, driver shutting down");
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => {}
            }

            // Inbound frames from the transport.
            match this.transport.poll_recv(cx) {
                Poll::Ready(Some((peer, frame))) => {
                    this.on_inbound(peer, frame);
                    continue;
                }
                Poll::Ready(None) => {
                    warn!("transport closed");
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => {}
            }

            return Poll::Pending;
        }
    }
}

impl<T: Transport> ShaperDriver<T> {
    fn on_command(&mut self, command: Command) {
        let now = Instant::now();

        match command {
            Command::Submit(unit) => {
                trace!(peer = %unit.peer(), size = unit.size(), "unit submitted");
                let ready = self.limiter.dispatch(unit, now);
                self.egress.extend(ready);
            }
            Command::SetUploadLimit(rate) => {
                let rate = self.options.clamp_upload_rate(rate);
                debug!(rate, "upload ceiling changed");
                self.limiter.set_rate(rate, now);
            }
            Command::SetDownloadLimit(rate) => {
                debug!(rate, "download ceiling changed");
                self.monitor.set_download_limit(rate);
            }
            Command::SetPeerPaused(peer, paused) => {
                debug!(%peer, paused, "peer pause state changed");
                self.monitor.set_peer_paused(peer, paused);
            }
            Command::EvictPeer(peer) => {
                debug!(%peer, "peer evicted");
                self.limiter.evict(peer);
                self.monitor.evict(peer);
            }
        }

        self.rearm_timeout();
    }

    /// Encodes and hands one admitted unit to the transport, resuming its
    /// caller with the outcome. Transport errors are captured per unit; they
    /// never poison the limiter state or the rest of the egress queue.
    fn send_unit(&mut self, unit: OutboundUnit) {
        let frame = Frame::new(unit.control(), unit.payload().clone());
        let encoded = match encode(frame) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!(peer = %unit.peer(), ?e, "failed to encode unit");
                unit.complete(Err(SendError::Transport(Box::new(e))));
                return;
            }
        };

        let payload_len = unit.payload().len();
        match self.transport.start_send(unit.peer(), unit.kind(), encoded) {
            Ok(()) => {
                self.state.stats.increment_tx(payload_len);
                self.should_flush = true;
                unit.complete(Ok(()));
            }
            Err(e) => {
                error!(peer = %unit.peer(), ?e, "transport rejected unit");
                unit.complete(Err(SendError::Transport(Box::new(e))));
            }
        }
    }

    /// Control messages ride an empty-payload datagram and are best-effort:
    /// a failed send is logged and forgotten, the next recompute tick or
    /// request retry heals it.
    fn send_control(&mut self, peer: PeerId, control: ControlMessage) {
        let encoded = match encode(Frame::new(control, Bytes::new())) {
            Ok(encoded) => encoded,
            Err(e) => {
                error!(%peer, ?e, "failed to encode control message");
                return;
            }
        };

        match self.transport.start_send(peer, UnitKind::Datagram, encoded) {
            Ok(()) => {
                self.state.stats.increment_control_tx();
                self.should_flush = true;
            }
            Err(e) => {
                error!(%peer, ?e, "control send failed, dropping");
            }
        }
    }

    fn on_inbound(&mut self, peer: PeerId, mut raw: BytesMut) {
        let now = Instant::now();

        let frame = match Codec::new().decode(&mut raw) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                warn!(%peer, "truncated inbound frame, dropping");
                return;
            }
            Err(e) => {
                warn!(%peer, ?e, "bad control header, dropping frame");
                return;
            }
        };

        let control = frame.control();
        let payload = frame.into_payload();
        self.state.stats.increment_rx(payload.len());

        if let Some(grant) = self.monitor.on_inbound(peer, payload.len() as u64, control, now) {
            self.control_egress.push_back((peer, grant));
        }

        if let ControlMessage::Allocate(rate) = control {
            self.limiter.on_allocation(peer, rate, now);
            self.rearm_timeout();
        }

        if !payload.is_empty() {
            if let Err(e) = self.to_socket.try_send(Inbound { peer, payload }) {
                warn!(%peer, ?e, "socket receive buffer full, dropping payload");
            }
        }
    }

    /// Re-arms the single timer to the earliest deadline in the hierarchy.
    /// Arming a new timeout replaces the previous descriptor.
    fn rearm_timeout(&mut self) {
        let deadline = self.limiter.next_deadline();
        if deadline != self.timeout_deadline {
            self.timeout_deadline = deadline;
            self.timeout = deadline.map(|deadline| Box::pin(tokio::time::sleep_until(deadline)));
        }
    }
}

fn encode(frame: Frame) -> Result<Bytes, shaper_wire::control::Error> {
    let mut buf = BytesMut::with_capacity(frame.size());
    Codec::new().encode(frame, &mut buf)?;
    Ok(buf.freeze())
}
