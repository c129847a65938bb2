use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};
use bytes::BufMut;
use crate::buffers::recycler::Recyclable;
use crate::message::Message;

/// Reliable messages are sent as the byte stream `message type (i32 BE) ++ payload`, split into
///  chunks of `chunk_size` bytes with only the last chunk being shorter.
pub fn chunk_count(payload_len: usize, chunk_size: usize) -> usize {
    (payload_len + 4).div_ceil(chunk_size)
}

/// the range of a chunk in the stream `message type ++ payload`
pub fn chunk_range(part_id: usize, payload_len: usize, chunk_size: usize) -> Range<usize> {
    let stream_len = payload_len + 4;
    let start = part_id * chunk_size;
    start..stream_len.min(start + chunk_size)
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChunkSlot {
    NeverSent,
    SentAt(Instant),
    Acknowledged,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChunkToSend {
    pub part_id: usize,
    pub range: Range<usize>,
    /// the chunk was sent before and was not acknowledged in time
    pub is_retransmit: bool,
}

/// Sending state of a single reliable message: the message and one slot per chunk.
#[derive(Default)]
pub struct SendTracking {
    message: Option<Arc<Message>>,
    chunk_size: usize,
    slots: Vec<ChunkSlot>,
    remaining: usize,
    cursor: usize,
    finished: bool,
}

impl Recyclable for SendTracking {
    fn reset(&mut self) {
        self.message = None;
        self.slots.clear();
        self.remaining = 0;
        self.cursor = 0;
        self.finished = false;
    }
}

impl SendTracking {
    pub fn setup(&mut self, message: Arc<Message>, chunk_size: usize) {
        let num_chunks = chunk_count(message.len(), chunk_size);

        self.slots.clear();
        self.slots.resize(num_chunks, ChunkSlot::NeverSent);
        self.message = Some(message);
        self.chunk_size = chunk_size;
        self.remaining = num_chunks;
        self.cursor = 0;
        self.finished = false;
    }

    pub fn num_chunks(&self) -> usize {
        self.slots.len()
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn message(&self) -> Option<&Arc<Message>> {
        self.message.as_ref()
    }

    pub fn slot(&self, part_id: usize) -> Option<ChunkSlot> {
        self.slots.get(part_id).copied()
    }

    /// Find the next chunk that is due for sending, starting the search where the previous call
    ///  left off. A chunk is due if it was never sent, or if it was sent `resend_after` or longer
    ///  ago without being acknowledged. The returned chunk is marked as sent at `now`.
    pub fn next_chunk(&mut self, now: Instant, resend_after: Duration) -> Option<ChunkToSend> {
        if self.finished || self.slots.is_empty() {
            return None;
        }

        let num_chunks = self.slots.len();
        for _ in 0..num_chunks {
            let part_id = self.cursor;
            self.cursor = (self.cursor + 1) % num_chunks;

            let is_retransmit = match self.slots[part_id] {
                ChunkSlot::NeverSent => false,
                ChunkSlot::SentAt(t) if now.saturating_duration_since(t) >= resend_after => true,
                _ => continue,
            };

            self.slots[part_id] = ChunkSlot::SentAt(now);
            let payload_len = self.message.as_ref().map(|m| m.len()).unwrap_or(0);
            return Some(ChunkToSend {
                part_id,
                range: chunk_range(part_id, payload_len, self.chunk_size),
                is_retransmit,
            });
        }
        None
    }

    /// Write a chunk's data, i.e. its part of `message type ++ payload`
    pub fn write_chunk(&self, range: &Range<usize>, buf: &mut impl BufMut) {
        let Some(message) = &self.message else {
            return;
        };

        if range.start < 4 {
            let type_bytes = message.message_type().to_be_bytes();
            buf.put_slice(&type_bytes[range.start..range.end.min(4)]);
        }
        if range.end > 4 {
            let payload_start = range.start.max(4) - 4;
            buf.put_slice(&message.payload()[payload_start..range.end - 4]);
        }
    }

    /// Returns `true` if the chunk was newly acknowledged. Repeated ACKs and ACKs for part ids
    ///  beyond the message's chunks are ignored.
    pub fn on_ack(&mut self, part_id: usize) -> bool {
        match self.slots.get_mut(part_id) {
            None | Some(ChunkSlot::Acknowledged) => false,
            Some(slot) => {
                *slot = ChunkSlot::Acknowledged;
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.finished = true;
                }
                true
            }
        }
    }
}
