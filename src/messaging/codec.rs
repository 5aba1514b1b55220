use std::collections::hash_map::Entry;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::messaging::frame::{Frame, RoutedMessage};
use crate::messaging::message::{MessageKind, VoltMessage, FIRST_APPLICATION_TAG, TAG_FAILURE_SITE_UPDATE};
use crate::messaging::site_id::{MailboxId, SiteId};
use crate::util::buf::BufExt;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

pub const LEN_PREFIX_SIZE: usize = 4;

/// upper bound for the length field; a frame's size is otherwise limited only by memory
pub const MAX_FRAME_LEN: u32 = i32::MAX as u32;

/// Handshake frames are small, and they arrive before the peer is authenticated by its fingerprint
pub const MAX_HANDSHAKE_FRAME_LEN: u32 = 1024*1024;

const MIN_READ_CAPACITY: usize = 8*1024;

/// the destination count of a routed frame is a `u16` on the wire
pub const MAX_ROUTED_DESTINATIONS: usize = u16::MAX as usize;

/// Decoding errors are fatal for the connection they occur on: the byte stream can not be
///  realigned after any of them.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown message type tag {0} - protocol desync")]
    UnknownTag(u8),
    #[error("malformed frame length {0}")]
    MalformedLength(u64),
    #[error("malformed frame with tag {tag}: {detail}")]
    Malformed { tag: u8, detail: String },
    #[error("message type tag {0} is already registered")]
    DuplicateTag(u8),
    #[error("message type tag {0} is reserved for built-in messages")]
    ReservedTag(u8),
    #[error("{0} destinations exceed the limit of one routed frame")]
    TooManyDestinations(usize),
}

impl CodecError {
    fn malformed(tag: u8, e: anyhow::Error) -> CodecError {
        CodecError::Malformed {
            tag,
            detail: e.to_string(),
        }
    }
}

pub type MessageDecoder = fn(u8, &mut Bytes) -> anyhow::Result<VoltMessage>;

/// Dispatch table from a message's one-byte tag to its decoder. The registry is built at startup
///  and handed to the [WireCodec], so independent messengers (e.g. in tests) can use different
///  sets of application message types.
#[derive(Clone)]
pub struct MessageRegistry {
    decoders: FxHashMap<u8, (MessageKind, MessageDecoder)>,
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageRegistry {
    /// creates a registry containing the built-in message types
    pub fn new() -> MessageRegistry {
        let mut decoders: FxHashMap<u8, (MessageKind, MessageDecoder)> = FxHashMap::default();
        decoders.insert(TAG_FAILURE_SITE_UPDATE, (MessageKind::FailureSiteUpdate, VoltMessage::deser_failure_site_update));

        MessageRegistry {
            decoders,
        }
    }

    /// registers an application message tag; its messages travel as [VoltMessage::Payload]
    pub fn register_payload(&mut self, tag: u8) -> Result<(), CodecError> {
        if tag < FIRST_APPLICATION_TAG {
            return Err(CodecError::ReservedTag(tag));
        }

        match self.decoders.entry(tag) {
            Entry::Occupied(_) => Err(CodecError::DuplicateTag(tag)),
            Entry::Vacant(e) => {
                e.insert((MessageKind::Payload, VoltMessage::deser_payload));
                Ok(())
            }
        }
    }

    pub fn is_registered(&self, tag: u8) -> bool {
        self.decoders.contains_key(&tag)
    }

    /// `true` if the message's tag is registered for the message's variant, i.e. the receiving
    ///  side decodes it into the same kind of message
    pub fn is_encodable(&self, message: &VoltMessage) -> bool {
        self.decoders.get(&message.tag())
            .is_some_and(|(kind, _)| *kind == message.kind())
    }

    pub fn decoder(&self, tag: u8) -> Option<MessageDecoder> {
        self.decoders.get(&tag).map(|(_, decoder)| *decoder)
    }
}

/// A message body that was serialized once, so that it can be framed for several hosts
///  without serializing it again.
#[derive(Clone, Debug)]
pub struct EncodedMessage {
    pub tag: u8,
    pub body: Bytes,
}

/// Turns [Frame]s into length-prefixed byte frames and back:
///
/// ```ascii
/// [u32 len][u8 tag][payload]
/// ```
///
/// `len` is little-endian like all other integers on the wire, and it covers tag and payload.
pub struct WireCodec {
    registry: MessageRegistry,
}

impl WireCodec {
    pub fn new(registry: MessageRegistry) -> WireCodec {
        WireCodec {
            registry,
        }
    }

    pub fn registry(&self) -> &MessageRegistry {
        &self.registry
    }

    pub fn encode(&self, frame: &Frame) -> Result<Bytes, CodecError> {
        match frame {
            Frame::Routed(routed) => {
                let encoded = self.encode_message(&routed.message)?;
                Self::routed_frame(routed.mailbox_id, &routed.destinations, &encoded)
            }
            control => build_frame(control.tag(), |buf| control.ser_control(buf)),
        }
    }

    /// Messages with unregistered tags are refused here: the receiving side would treat them as a
    ///  protocol desync and drop the connection.
    pub fn encode_message(&self, message: &VoltMessage) -> Result<EncodedMessage, CodecError> {
        let tag = message.tag();
        if !self.registry.is_encodable(message) {
            return Err(CodecError::UnknownTag(tag));
        }

        let mut body = BytesMut::new();
        message.ser(&mut body);
        Ok(EncodedMessage {
            tag,
            body: body.freeze(),
        })
    }

    pub fn routed_frame(mailbox_id: MailboxId, destinations: &[SiteId], encoded: &EncodedMessage) -> Result<Bytes, CodecError> {
        if destinations.len() > MAX_ROUTED_DESTINATIONS {
            return Err(CodecError::TooManyDestinations(destinations.len()));
        }

        let capacity = LEN_PREFIX_SIZE + 1 + 6 + 4*destinations.len() + encoded.body.len();
        let mut buf = BytesMut::with_capacity(capacity);
        start_frame(&mut buf, encoded.tag);
        RoutedMessage::ser_header(mailbox_id, destinations, &mut buf);
        buf.put_slice(&encoded.body);
        finish_frame(buf)
    }

    /// decodes a frame that was stripped of its length prefix, e.g. by a [FrameAssembler]
    pub fn decode(&self, mut frame: Bytes) -> Result<Frame, CodecError> {
        let tag = frame.checked_u8()
            .map_err(|_| CodecError::MalformedLength(0))?;

        if Frame::is_control_tag(tag) {
            return Frame::deser_control(tag, &mut frame)
                .map_err(|e| CodecError::malformed(tag, e));
        }

        let decoder = self.registry.decoder(tag)
            .ok_or(CodecError::UnknownTag(tag))?;

        let (mailbox_id, destinations) = RoutedMessage::deser_header(&mut frame)
            .map_err(|e| CodecError::malformed(tag, e))?;
        let message = decoder(tag, &mut frame)
            .map_err(|e| CodecError::malformed(tag, e))?;

        trace!("decoded message with tag {} for {:?}", tag, destinations);
        Ok(Frame::Routed(RoutedMessage {
            mailbox_id,
            destinations,
            message,
        }))
    }
}

/// builds a complete frame including its length prefix, with `f` writing the payload
pub fn build_frame(tag: u8, f: impl FnOnce(&mut BytesMut)) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    start_frame(&mut buf, tag);
    f(&mut buf);
    finish_frame(buf)
}

fn start_frame(buf: &mut BytesMut, tag: u8) {
    buf.put_u32_le(0); // patched in finish_frame
    buf.put_u8(tag);
}

fn finish_frame(mut buf: BytesMut) -> Result<Bytes, CodecError> {
    let len = buf.len() - LEN_PREFIX_SIZE;
    let max_len: usize = MAX_FRAME_LEN.safe_cast();
    if len > max_len {
        return Err(CodecError::MalformedLength(len as u64));
    }
    let len: u32 = len.prechecked_cast();
    buf[..LEN_PREFIX_SIZE].copy_from_slice(&len.to_le_bytes());
    Ok(buf.freeze())
}

/// Reassembles frames from a byte stream: a frame may arrive spread over several reads, and a
///  single read may contain several frames. The buffer grows to whatever size the frame at its
///  head announces.
pub struct FrameAssembler {
    buf: BytesMut,
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAssembler {
    pub fn new() -> FrameAssembler {
        FrameAssembler {
            buf: BytesMut::with_capacity(64*1024),
        }
    }

    /// the buffer to read into, with room for at least a reasonably sized read
    pub fn read_buf(&mut self) -> &mut BytesMut {
        self.buf.reserve(MIN_READ_CAPACITY);
        &mut self.buf
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete frame (tag and payload), or `None` if more data is needed. An
    ///  invalid length prefix is fatal.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, CodecError> {
        if self.buf.len() < LEN_PREFIX_SIZE {
            return Ok(None);
        }

        let len = (&self.buf[..LEN_PREFIX_SIZE]).get_u32_le();
        if len == 0 || len > MAX_FRAME_LEN {
            return Err(CodecError::MalformedLength(len.into()));
        }

        let len: usize = len.safe_cast();
        let frame_size = LEN_PREFIX_SIZE + len;
        if self.buf.len() < frame_size {
            self.buf.reserve(frame_size - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(LEN_PREFIX_SIZE);
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

/// Reads a single frame (tag and payload) during a handshake, before a connection's reader
///  task takes over the stream.
pub async fn read_handshake_frame<R: AsyncRead + Unpin>(stream: &mut R) -> anyhow::Result<Bytes> {
    let len = stream.read_u32_le().await?;
    if len == 0 || len > MAX_HANDSHAKE_FRAME_LEN {
        return Err(CodecError::MalformedLength(len.into()).into());
    }

    let mut buf = BytesMut::zeroed(len.safe_cast());
    stream.read_exact(&mut buf).await?;
    Ok(buf.freeze())
}

pub async fn write_handshake_frame<W: AsyncWrite + Unpin>(stream: &mut W, frame: &[u8]) -> anyhow::Result<()> {
    stream.write_all(frame).await?;
    stream.flush().await?;
    Ok(())
}
