use std::sync::Arc;
use anyhow::bail;
use bit_set::BitSet;
use crate::buffers::buffer_pool::BufferPool;
use crate::buffers::pooled_buf::PooledBuf;
use crate::buffers::recycler::Recyclable;
use crate::message::{DeliveryClass, Message};
use crate::packet_header::PacketKind;
use crate::send_tracking::{chunk_count, chunk_range};

/// Reassembly state of a single incoming reliable message.
///
/// A record starts out as a placeholder (when a later message's fragment arrives first), and is
///  set up with the message's length from its first fragment.
#[derive(Default)]
pub struct ReceiveTracking {
    is_set_up: bool,
    chunk_size: usize,
    total_len: usize,
    message_type: [u8; 4],
    payload: Option<PooledBuf>,
    received: BitSet,
    num_chunks: usize,
    remaining: usize,
}

impl Recyclable for ReceiveTracking {
    fn reset(&mut self) {
        self.is_set_up = false;
        self.total_len = 0;
        self.message_type = [0; 4];
        self.payload = None;
        self.received.clear();
        self.num_chunks = 0;
        self.remaining = 0;
    }
}

impl ReceiveTracking {
    pub fn is_set_up(&self) -> bool {
        self.is_set_up
    }

    pub fn setup(&mut self, total_len: usize, chunk_size: usize, buffers: &Arc<BufferPool>) -> anyhow::Result<()> {
        self.payload = if total_len == 0 {
            None
        }
        else {
            Some(buffers.acquire(total_len)?)
        };

        self.is_set_up = true;
        self.chunk_size = chunk_size;
        self.total_len = total_len;
        self.num_chunks = chunk_count(total_len, chunk_size);
        self.remaining = self.num_chunks;
        self.received.clear();
        Ok(())
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_complete(&self) -> bool {
        self.is_set_up && self.remaining == 0
    }

    /// Copy a chunk into the reassembly buffer. Returns `false` for a chunk that was received
    ///  before, and an error for a chunk that does not fit the message.
    pub fn absorb(&mut self, part_id: usize, total_len: usize, chunk: &[u8]) -> anyhow::Result<bool> {
        if !self.is_set_up {
            bail!("this is a bug: receive tracking was not set up");
        }
        if total_len != self.total_len {
            bail!("fragment has message length {}, but the message was set up with {}", total_len, self.total_len);
        }
        if part_id >= self.num_chunks {
            bail!("part id {} is beyond the message's {} chunks", part_id, self.num_chunks);
        }

        let range = chunk_range(part_id, self.total_len, self.chunk_size);
        if chunk.len() != range.len() {
            bail!("chunk {} has {} bytes, expected {}", part_id, chunk.len(), range.len());
        }

        if !self.received.insert(part_id) {
            return Ok(false);
        }

        // the first four bytes of the stream are the message type
        let mut chunk = chunk;
        if range.start < 4 {
            let type_len = range.end.min(4) - range.start;
            self.message_type[range.start..range.start + type_len].copy_from_slice(&chunk[..type_len]);
            chunk = &chunk[type_len..];
        }
        if let Some(payload) = self.payload.as_mut() {
            let payload_start = range.start.max(4) - 4;
            payload.as_mut()[payload_start..payload_start + chunk.len()].copy_from_slice(chunk);
        }

        self.remaining -= 1;
        Ok(true)
    }

    /// Move the reassembled message out of this record
    pub fn take_message(&mut self, delivery: DeliveryClass) -> anyhow::Result<Message> {
        if !self.is_complete() {
            bail!("this is a bug: message is not complete");
        }

        let raw_type = i32::from_be_bytes(self.message_type);
        let kind = match PacketKind::from_raw(raw_type) {
            Some(kind) if kind.is_application() => kind,
            _ => bail!("reliable message has the reserved type {}", raw_type),
        };
        Ok(Message::from_parts(kind, self.payload.take(), delivery))
    }
}
