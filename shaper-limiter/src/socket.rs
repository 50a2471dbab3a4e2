use std::{
    collections::VecDeque,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::Stream;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::debug;

use crate::{
    config::ShaperOptions,
    driver::{Command, ShaperDriver},
    limiter::GlobalLimiter,
    monitor::BandwidthMonitor,
    stats::{ShaperState, ShaperStats},
    transport::Transport,
    unit::{OutboundUnit, SendError, UnitKind},
    PeerId, ShaperError, StreamId, DEFAULT_QUEUE_SIZE,
};

/// A payload received from a peer, with the control header already stripped.
#[derive(Debug)]
pub struct Inbound {
    pub(crate) peer: PeerId,
    pub(crate) payload: Bytes,
}

impl Inbound {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

/// The traffic-shaping layer, inserted between application code and the
/// transport. Exposes the transport's own send/receive shape, so callers
/// need not know it is there.
///
/// Sends suspend the calling task until the unit clears admission and is
/// handed to the transport; the driver task itself never blocks. This socket
/// implements [`Stream`] and yields incoming [`Inbound`] payloads.
pub struct Shaper<T: Transport> {
    /// Options shared with the driver.
    options: Arc<ShaperOptions>,
    /// Shaper state, shared with the driver.
    state: Arc<ShaperState>,
    /// The transport. Temporary; moved into the driver on `attach`.
    transport: Option<T>,
    /// Sender to the driver task.
    to_driver: Option<mpsc::Sender<Command>>,
    /// Receiver of inbound payloads from the driver task.
    from_driver: Option<mpsc::Receiver<Inbound>>,
    /// Next outbound stream id.
    next_stream: StreamId,

    /// Internal task running the [`ShaperDriver`].
    _driver_task: Option<JoinHandle<Result<(), ShaperError>>>,
}

impl<T: Transport> Shaper<T> {
    /// Creates a shaper over the given transport with default options.
    pub fn new(transport: T) -> Self {
        Self::with_options(transport, ShaperOptions::default())
    }

    pub fn with_options(transport: T, options: ShaperOptions) -> Self {
        Self {
            options: Arc::new(options),
            state: Arc::new(ShaperState::default()),
            transport: Some(transport),
            to_driver: None,
            from_driver: None,
            next_stream: StreamId::new(0),
            _driver_task: None,
        }
    }

    /// Spawns the driver task, taking ownership of the transport. Must be
    /// called before any traffic is submitted.
    pub fn attach(&mut self) -> Result<(), ShaperError> {
        let transport = self.transport.take().ok_or(ShaperError::Closed)?;

        let (to_driver, from_socket) = mpsc::channel(DEFAULT_QUEUE_SIZE);
        let (to_socket, from_driver) = mpsc::channel(DEFAULT_QUEUE_SIZE);

        let now = Instant::now();
        let mut tick = tokio::time::interval(self.options.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let driver = ShaperDriver {
            transport,
            options: Arc::clone(&self.options),
            state: Arc::clone(&self.state),
            from_socket,
            to_socket,
            limiter: GlobalLimiter::new(&self.options, Arc::clone(&self.state), now),
            monitor: BandwidthMonitor::new(self.options.as_ref().clone()),
            egress: VecDeque::with_capacity(128),
            control_egress: VecDeque::with_capacity(128),
            timeout: None,
            timeout_deadline: None,
            tick,
            should_flush: false,
        };

        debug!("shaper attached");
        self._driver_task = Some(tokio::spawn(driver));
        self.to_driver = Some(to_driver);
        self.from_driver = Some(from_driver);

        Ok(())
    }

    /// Sends one datagram to `peer`, suspending until it clears admission
    /// and reaches the transport.
    pub async fn send_datagram(&self, peer: PeerId, payload: Bytes) -> Result<(), SendError> {
        self.submit(UnitKind::Datagram, peer, payload).await
    }

    /// Opens a new outbound stream to `peer` and returns its id.
    pub async fn begin_stream(&mut self, peer: PeerId) -> Result<StreamId, SendError> {
        let stream = self.next_stream;
        self.next_stream.increment();

        self.submit(UnitKind::StreamBegin { stream }, peer, Bytes::new()).await?;
        Ok(stream)
    }

    /// Sends one stream chunk, suspending until it clears admission.
    pub async fn send_chunk(
        &self,
        peer: PeerId,
        stream: StreamId,
        seq: u64,
        payload: Bytes,
    ) -> Result<(), SendError> {
        self.submit(UnitKind::StreamChunk { stream, seq }, peer, payload).await
    }

    /// Closes an outbound stream.
    pub async fn end_stream(&self, peer: PeerId, stream: StreamId) -> Result<(), SendError> {
        self.submit(UnitKind::StreamEnd { stream }, peer, Bytes::new()).await
    }

    /// Changes the node-wide upload ceiling. `0` means unlimited.
    pub async fn set_upload_limit(&self, rate: u64) -> Result<(), ShaperError> {
        self.command(Command::SetUploadLimit(rate)).await
    }

    /// Changes the download ceiling the watermarks derive from. `0` means
    /// unlimited.
    pub async fn set_download_limit(&self, rate: u64) -> Result<(), ShaperError> {
        self.command(Command::SetDownloadLimit(rate)).await
    }

    /// Marks a peer paused or resumed for the bandwidth monitor.
    pub async fn set_peer_paused(&self, peer: PeerId, paused: bool) -> Result<(), ShaperError> {
        self.command(Command::SetPeerPaused(peer, paused)).await
    }

    /// Removes a device from the active-peer set, failing anything it still
    /// had queued.
    pub async fn evict_peer(&self, peer: PeerId) -> Result<(), ShaperError> {
        self.command(Command::EvictPeer(peer)).await
    }

    /// Returns the statistics for this shaper.
    pub fn stats(&self) -> &ShaperStats {
        &self.state.stats
    }

    async fn submit(
        &self,
        kind: UnitKind,
        peer: PeerId,
        payload: Bytes,
    ) -> Result<(), SendError> {
        let to_driver = self.to_driver.as_ref().ok_or(SendError::Closed)?;

        let (unit, handle) = OutboundUnit::new(kind, peer, payload);
        to_driver.send(Command::Submit(unit)).await.map_err(|_| SendError::Closed)?;

        handle.wait().await
    }

    async fn command(&self, command: Command) -> Result<(), ShaperError> {
        let to_driver = self.to_driver.as_ref().ok_or(ShaperError::Closed)?;
        to_driver.send(command).await.map_err(|_| ShaperError::Closed)
    }
}

impl<T: Transport> Stream for Shaper<T> {
    type Item = Inbound;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut().from_driver.as_mut() {
            Some(from_driver) => from_driver.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }
}

impl<T: Transport> std::fmt::Debug for Shaper<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shaper")
            .field("attached", &self.to_driver.is_some())
            .field("next_stream", &self.next_stream)
            .finish()
    }
}
