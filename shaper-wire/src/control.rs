use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Wire id for [`ControlMessage::Allocate`].
pub const TYPE_ALLOCATE: u8 = 0;
/// Wire id for [`ControlMessage::RequestBandwidth`].
pub const TYPE_REQUEST_BW: u8 = 1;
/// Wire id for [`ControlMessage::Noop`].
pub const TYPE_NOOP: u8 = 2;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),
    #[error("Invalid control message type: {0}")]
    InvalidControlType(u8),
}

/// Bandwidth negotiation message carried in front of every wire unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Grants the receiving peer a send rate in bytes/sec.
    Allocate(u64),
    /// Asks the receiving peer for a bigger allocation.
    RequestBandwidth,
    /// Nothing to negotiate.
    Noop,
}

impl ControlMessage {
    /// Returns the wire id of this message.
    pub const fn wire_type(&self) -> u8 {
        match self {
            Self::Allocate(_) => TYPE_ALLOCATE,
            Self::RequestBandwidth => TYPE_REQUEST_BW,
            Self::Noop => TYPE_NOOP,
        }
    }

    /// Returns the encoded header length for this message in bytes.
    pub const fn header_len(&self) -> usize {
        match self {
            // type + bandwidth + payload size
            Self::Allocate(_) => 1 + 8 + 4,
            // type + payload size
            Self::RequestBandwidth | Self::Noop => 1 + 4,
        }
    }
}

/// A control header plus the payload it is prefixed to. The payload may be
/// empty (a pure control frame, e.g. an allocation emitted by the bandwidth
/// monitor).
#[derive(Debug, Clone)]
pub struct Frame {
    control: ControlMessage,
    payload: Bytes,
}

impl Frame {
    pub fn new(control: ControlMessage, payload: Bytes) -> Self {
        Self { control, payload }
    }

    pub fn control(&self) -> ControlMessage {
        self.control
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Returns the total encoded size of this frame in bytes.
    pub fn size(&self) -> usize {
        self.control.header_len() + self.payload.len()
    }
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Type,
    Bandwidth,
    Length(ControlMessage),
    Payload(ControlMessage, u32),
}

/// Codec for [`Frame`]s.
///
/// Layout: `type: u8`, then `bandwidth: u64` iff type is ALLOCATE, then
/// `size: u32`, then `size` payload bytes. All integers big-endian.
#[derive(Debug, Default)]
pub struct Codec {
    state: State,
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for Codec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut bytes::BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                State::Type => {
                    if src.is_empty() {
                        return Ok(None);
                    }

                    match src.get_u8() {
                        TYPE_ALLOCATE => self.state = State::Bandwidth,
                        TYPE_REQUEST_BW => {
                            self.state = State::Length(ControlMessage::RequestBandwidth)
                        }
                        TYPE_NOOP => self.state = State::Length(ControlMessage::Noop),
                        other => return Err(Error::InvalidControlType(other)),
                    }
                }
                State::Bandwidth => {
                    if src.len() < 8 {
                        return Ok(None);
                    }

                    let bandwidth = src.get_u64();
                    self.state = State::Length(ControlMessage::Allocate(bandwidth));
                }
                State::Length(control) => {
                    if src.len() < 4 {
                        return Ok(None);
                    }

                    let size = src.get_u32();
                    self.state = State::Payload(control, size);
                }
                State::Payload(control, size) => {
                    if src.len() < size as usize {
                        return Ok(None);
                    }

                    let payload = src.split_to(size as usize);
                    self.state = State::Type;
                    return Ok(Some(Frame { control, payload: payload.freeze() }));
                }
            }
        }
    }
}

impl Encoder<Frame> for Codec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut bytes::BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.size());

        dst.put_u8(item.control.wire_type());
        if let ControlMessage::Allocate(bandwidth) = item.control {
            dst.put_u64(bandwidth);
        }
        dst.put_u32(item.payload.len() as u32);
        dst.put(item.payload);

        Ok(())
    }
}
