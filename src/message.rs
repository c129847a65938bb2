use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use anyhow::bail;
use bytes::BufMut;
use crate::buffers::buffer_pool::BufferPool;
use crate::buffers::pooled_buf::PooledBuf;
use crate::control_messages::OrderedEnvelopeHeader;
use crate::packet_header::{PacketHeader, PacketKind};
use crate::sequence::SequenceNumber;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum DeliveryClass {
    /// may be lost, duplicated or reordered
    UnorderedUnreliable,
    /// may be lost, but is never delivered after a newer message of the same class
    OrderedUnreliable,
    /// delivered exactly once, in any order
    UnorderedReliable,
    /// delivered exactly once, in the order messages were sent
    OrderedReliable,
}

impl DeliveryClass {
    pub fn is_reliable(&self) -> bool {
        matches!(self, DeliveryClass::UnorderedReliable | DeliveryClass::OrderedReliable)
    }
}

/// A message with its payload in a pooled buffer. Messages are shared as `Arc<Message>` once they
///  are handed to the transport, e.g. between the send queues of all connections for a broadcast,
///  and the buffer returns to its pool when the last reference is dropped.
pub struct Message {
    kind: PacketKind,
    payload: Option<PooledBuf>,
    delivery: DeliveryClass,
}

impl Message {
    /// Creates an application message with a payload of `size` bytes. The payload's initial
    ///  content is undefined and is expected to be overwritten through [Message::payload_mut].
    pub fn new(buffers: &Arc<BufferPool>, message_type: i32, size: usize, delivery: DeliveryClass) -> anyhow::Result<Message> {
        if message_type < 0 {
            bail!("negative message types are reserved for the protocol: {}", message_type);
        }
        Self::with_kind(buffers, PacketKind::Application(message_type), size, delivery)
    }

    pub(crate) fn with_kind(buffers: &Arc<BufferPool>, kind: PacketKind, size: usize, delivery: DeliveryClass) -> anyhow::Result<Message> {
        let payload = if size == 0 {
            None
        }
        else {
            Some(buffers.acquire(size)?)
        };
        Ok(Message { kind, payload, delivery })
    }

    /// a protocol message whose payload is written by `f`, sent unordered and unreliably
    pub(crate) fn control(buffers: &Arc<BufferPool>, kind: PacketKind, size: usize, f: impl FnOnce(&mut PooledBuf)) -> anyhow::Result<Message> {
        let mut msg = Self::with_kind(buffers, kind, size, DeliveryClass::UnorderedUnreliable)?;
        if let Some(buf) = msg.payload.as_mut() {
            buf.clear();
            f(buf);
        }
        Ok(msg)
    }

    pub(crate) fn from_parts(kind: PacketKind, payload: Option<PooledBuf>, delivery: DeliveryClass) -> Message {
        Message { kind, payload, delivery }
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    /// the raw type as it is sent on the wire
    pub fn message_type(&self) -> i32 {
        self.kind.to_raw()
    }

    pub fn delivery(&self) -> DeliveryClass {
        self.delivery
    }

    pub fn payload(&self) -> &[u8] {
        match &self.payload {
            Some(buf) => buf.as_ref(),
            None => &[],
        }
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        match &mut self.payload {
            Some(buf) => buf.as_mut(),
            None => &mut [],
        }
    }

    pub fn len(&self) -> usize {
        self.payload.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// the size of this message as a plain datagram, i.e. without an ordered envelope
    pub fn datagram_len(&self) -> usize {
        PacketHeader::datagram_len(self.len())
    }

    /// the size on the wire, including the envelope for ordered unreliable messages
    pub fn wire_len(&self) -> usize {
        match self.delivery {
            DeliveryClass::OrderedUnreliable => PacketHeader::datagram_len(OrderedEnvelopeHeader::SERIALIZED_LEN + self.datagram_len()),
            _ => self.datagram_len(),
        }
    }

    /// write header and payload
    pub fn encode(&self, buf: &mut impl BufMut) {
        PacketHeader::new(self.kind, self.len()).ser(buf);
        buf.put_slice(self.payload());
    }

    /// write the message as the inner datagram of an ordered envelope
    pub fn encode_enveloped(&self, sequence: SequenceNumber, buf: &mut impl BufMut) {
        PacketHeader::new(PacketKind::OrderedEnvelope, OrderedEnvelopeHeader::SERIALIZED_LEN + self.datagram_len()).ser(buf);
        OrderedEnvelopeHeader { sequence }.ser(buf);
        self.encode(buf);
    }
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("delivery", &self.delivery)
            .field("len", &self.len())
            .finish()
    }
}
