use anyhow::bail;
use bytes::{Buf, BufMut};
use crate::safe_converter::{PrecheckedCast, SafeCast};

/// The kind of a datagram, encoded as a signed 32 bit type on the wire. Negative types are
///  reserved for the protocol, non-negative types are application message types.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PacketKind {
    Ping,
    Pong,
    OrderedEnvelope,
    ReliableFragment,
    ReliableAck,
    Application(i32),
}

impl PacketKind {
    pub const RAW_PING: i32 = -1;
    pub const RAW_PONG: i32 = -2;
    pub const RAW_ORDERED_ENVELOPE: i32 = -3;
    pub const RAW_RELIABLE_FRAGMENT: i32 = -4;
    pub const RAW_RELIABLE_ACK: i32 = -5;

    /// returns `None` for negative types that have no meaning in the protocol
    pub fn from_raw(raw: i32) -> Option<PacketKind> {
        match raw {
            Self::RAW_PING => Some(PacketKind::Ping),
            Self::RAW_PONG => Some(PacketKind::Pong),
            Self::RAW_ORDERED_ENVELOPE => Some(PacketKind::OrderedEnvelope),
            Self::RAW_RELIABLE_FRAGMENT => Some(PacketKind::ReliableFragment),
            Self::RAW_RELIABLE_ACK => Some(PacketKind::ReliableAck),
            t if t >= 0 => Some(PacketKind::Application(t)),
            _ => None,
        }
    }

    pub fn to_raw(&self) -> i32 {
        match *self {
            PacketKind::Ping => Self::RAW_PING,
            PacketKind::Pong => Self::RAW_PONG,
            PacketKind::OrderedEnvelope => Self::RAW_ORDERED_ENVELOPE,
            PacketKind::ReliableFragment => Self::RAW_RELIABLE_FRAGMENT,
            PacketKind::ReliableAck => Self::RAW_RELIABLE_ACK,
            PacketKind::Application(t) => t,
        }
    }

    pub fn is_application(&self) -> bool {
        matches!(self, PacketKind::Application(_))
    }
}

/// Every datagram starts with this header, followed by the payload:
///
/// ```ascii
/// 0: magic "DARK"
/// 4: type (i32 BE)
/// 8: payload length (i32 BE)
/// ```
///
/// Bytes after the declared payload are ignored.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PacketHeader {
    pub kind: PacketKind,
    pub payload_len: usize,
}

impl PacketHeader {
    pub const MAGIC: [u8; 4] = *b"DARK";
    pub const SERIALIZED_LEN: usize = 12;

    pub fn new(kind: PacketKind, payload_len: usize) -> PacketHeader {
        PacketHeader { kind, payload_len }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_slice(&Self::MAGIC);
        buf.put_i32(self.kind.to_raw());
        let payload_len: i32 = self.payload_len.prechecked_cast();
        buf.put_i32(payload_len);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("datagram of {} bytes is shorter than the header", buf.remaining());
        }

        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != Self::MAGIC {
            bail!("invalid magic {:?}", magic);
        }

        let raw_kind = buf.get_i32();
        let Some(kind) = PacketKind::from_raw(raw_kind) else {
            bail!("unsupported reserved type {}", raw_kind);
        };

        let raw_len = buf.get_i32();
        let Ok(payload_len) = u32::try_from(raw_len) else {
            bail!("negative payload length {}", raw_len);
        };

        Ok(PacketHeader {
            kind,
            payload_len: payload_len.safe_cast(),
        })
    }

    /// Split a datagram into its header and its payload, checking that the declared payload is
    ///  actually present.
    pub fn parse_datagram(datagram: &[u8]) -> anyhow::Result<(PacketHeader, &[u8])> {
        let mut buf = datagram;
        let header = Self::deser(&mut buf)?;
        let payload_len = header.payload_len;
        if payload_len > buf.len() {
            bail!("declared payload length {} exceeds the received {} bytes", payload_len, buf.len());
        }
        Ok((header, &buf[..payload_len]))
    }

    pub fn datagram_len(payload_len: usize) -> usize {
        Self::SERIALIZED_LEN + payload_len
    }
}
