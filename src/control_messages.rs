use anyhow::bail;
use bytes::{Buf, BufMut};
use crate::packet_header::PacketHeader;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::sequence::{SendId, SequenceNumber};

/// Payload of both ping and pong: the sender's send time in microseconds since its end point
///  was started. The pong echoes the ping's payload unchanged.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HeartbeatTimestamp {
    pub micros: u64,
}

impl HeartbeatTimestamp {
    pub const SERIALIZED_LEN: usize = 8;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.micros);
    }

    pub fn deser(mut buf: &[u8]) -> anyhow::Result<HeartbeatTimestamp> {
        if buf.len() != Self::SERIALIZED_LEN {
            bail!("heartbeat payload has {} bytes, expected {}", buf.len(), Self::SERIALIZED_LEN);
        }
        Ok(HeartbeatTimestamp { micros: buf.get_u64() })
    }
}

/// Prefix of a reliable message fragment, followed by the chunk's data:
///
/// ```ascii
/// 0: send id (i32 BE) - positive for unordered, negative for ordered reliable messages
/// 4: part id (i32 BE)
/// 8: total message length (i32 BE), excluding the 4 byte message type
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FragmentHeader {
    pub send_id: SendId,
    pub part_id: usize,
    pub total_len: usize,
}

impl FragmentHeader {
    pub const SERIALIZED_LEN: usize = 12;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_i32(self.send_id.to_wire());
        let part_id: i32 = self.part_id.prechecked_cast();
        buf.put_i32(part_id);
        let total_len: i32 = self.total_len.prechecked_cast();
        buf.put_i32(total_len);
    }

    /// returns the header and the chunk data following it
    pub fn deser(mut buf: &[u8]) -> anyhow::Result<(FragmentHeader, &[u8])> {
        if buf.len() < Self::SERIALIZED_LEN {
            bail!("fragment of {} bytes is shorter than its header", buf.len());
        }

        let raw_send_id = buf.get_i32();
        let Some(send_id) = SendId::from_wire(raw_send_id) else {
            bail!("invalid send id {}", raw_send_id);
        };
        let Ok(part_id) = u32::try_from(buf.get_i32()) else {
            bail!("negative part id");
        };
        let Ok(total_len) = u32::try_from(buf.get_i32()) else {
            bail!("negative message length");
        };

        Ok((FragmentHeader {
            send_id,
            part_id: part_id.safe_cast(),
            total_len: total_len.safe_cast(),
        }, buf))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReliableAck {
    pub send_id: SendId,
    pub part_id: usize,
}

impl ReliableAck {
    pub const SERIALIZED_LEN: usize = 8;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_i32(self.send_id.to_wire());
        let part_id: i32 = self.part_id.prechecked_cast();
        buf.put_i32(part_id);
    }

    pub fn deser(mut buf: &[u8]) -> anyhow::Result<ReliableAck> {
        if buf.len() != Self::SERIALIZED_LEN {
            bail!("ACK has {} bytes, expected {}", buf.len(), Self::SERIALIZED_LEN);
        }

        let raw_send_id = buf.get_i32();
        let Some(send_id) = SendId::from_wire(raw_send_id) else {
            bail!("invalid send id {}", raw_send_id);
        };
        let Ok(part_id) = u32::try_from(buf.get_i32()) else {
            bail!("negative part id");
        };
        Ok(ReliableAck { send_id, part_id: part_id.safe_cast() })
    }
}

/// An ordered-unreliable envelope is a sequence number (i32 BE) followed by a complete inner
///  datagram, header included.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OrderedEnvelopeHeader {
    pub sequence: SequenceNumber,
}

impl OrderedEnvelopeHeader {
    pub const SERIALIZED_LEN: usize = 4;

    pub fn ser(&self, buf: &mut impl BufMut) {
        let raw: i32 = self.sequence.to_raw().prechecked_cast();
        buf.put_i32(raw);
    }

    /// returns the header and the inner datagram
    pub fn deser(mut buf: &[u8]) -> anyhow::Result<(OrderedEnvelopeHeader, &[u8])> {
        if buf.len() < Self::SERIALIZED_LEN + PacketHeader::SERIALIZED_LEN {
            bail!("ordered envelope of {} bytes is too short", buf.len());
        }

        let raw = buf.get_i32();
        let sequence = u32::try_from(raw).ok()
            .and_then(SequenceNumber::from_raw)
            .filter(|s| *s != SequenceNumber::ZERO);
        let Some(sequence) = sequence else {
            bail!("invalid ordered sequence number {}", raw);
        };
        Ok((OrderedEnvelopeHeader { sequence }, buf))
    }
}
