use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::trace;
use crate::buffers::pooled_buf::PooledBuf;
use crate::connection::ConnectionId;
use crate::message::{DeliveryClass, Message};
use crate::sequence::SequenceNumber;

/// This is an abstraction for sending a buffer on a UDP socket, introduced to facilitate mocking
///  the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> std::io::Result<()>;

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) -> std::io::Result<()> {
        trace!("UDP socket: sending packet to {:?}", to);
        let num_sent = self.send_to(packet_buf, to).await?;
        if num_sent != packet_buf.len() {
            return Err(std::io::Error::other(format!("sent {} of {} bytes", num_sent, packet_buf.len())));
        }
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref().local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

/// Encodes messages into a single reusable datagram buffer and puts them on the socket. This is
///  owned by the send loop.
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
    buf: PooledBuf,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>, buf: PooledBuf) -> SendPipeline {
        SendPipeline { socket, buf }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// Send a message as a single datagram, wrapped in an ordered envelope if `ordered_sequence`
    ///  is present. Returns the number of bytes put on the wire.
    pub async fn send_message(&mut self, to: SocketAddr, message: &Message, ordered_sequence: Option<SequenceNumber>) -> std::io::Result<usize> {
        let wire_len = match ordered_sequence {
            Some(_) => message.wire_len(),
            None => message.datagram_len(),
        };
        if wire_len > self.buf.capacity() {
            return Err(std::io::Error::other(format!("datagram of {} bytes exceeds the send buffer", wire_len)));
        }

        self.buf.clear();
        match ordered_sequence {
            Some(sequence) => message.encode_enveloped(sequence, &mut self.buf),
            None => message.encode(&mut self.buf),
        }
        self.socket.do_send_packet(to, self.buf.as_ref()).await?;
        Ok(self.buf.len())
    }
}

pub struct OutboxEntry {
    pub connection: ConnectionId,
    pub to: SocketAddr,
    pub message: Message,
}

/// The high priority queue for protocol datagrams (pings, pongs, ACKs). It is drained fully at
///  the start of every send loop iteration, bypassing the connections' queues and token buckets.
#[derive(Default)]
pub struct Outbox {
    items: Mutex<VecDeque<OutboxEntry>>,
    wake: Notify,
}

impl Outbox {
    pub fn push(&self, connection: ConnectionId, to: SocketAddr, message: Message) {
        debug_assert_eq!(message.delivery(), DeliveryClass::UnorderedUnreliable);
        self.items.lock().unwrap()
            .push_back(OutboxEntry { connection, to, message });
        self.wake.notify_one();
    }

    pub fn drain(&self) -> VecDeque<OutboxEntry> {
        std::mem::take(&mut *self.items.lock().unwrap())
    }

    /// discard pending datagrams for a connection that was dropped
    pub fn purge(&self, connection: ConnectionId) {
        let removed = {
            let mut items = self.items.lock().unwrap();
            let (keep, removed): (VecDeque<_>, VecDeque<_>) = items.drain(..)
                .partition(|e| e.connection != connection);
            *items = keep;
            removed
        };
        // buffers are returned to their pool outside the lock
        drop(removed);
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// wake up the send loop
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub async fn wait(&self) {
        self.wake.notified().await
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;
    use crate::buffers::buffer_pool::BufferPool;
    use crate::packet_header::PacketKind;
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn message(pool: &Arc<BufferPool>, payload: &[u8], delivery: DeliveryClass) -> Message {
        let mut msg = Message::new(pool, 7, payload.len(), delivery).unwrap();
        msg.payload_mut().copy_from_slice(payload);
        msg
    }

    #[tokio::test]
    async fn test_send_message() {
        let pool = BufferPool::new(&[64]);
        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet()
            .withf(|to, buf| *to == addr(1) && buf == b"DARK\0\0\0\x07\0\0\0\x02\x05\x06")
            .once()
            .returning(|_, _| Ok(()));

        let mut pipeline = SendPipeline::new(Arc::new(socket), pool.acquire(64).unwrap());
        let msg = message(&pool, &[5, 6], DeliveryClass::UnorderedUnreliable);
        assert_eq!(pipeline.send_message(addr(1), &msg, None).await.unwrap(), 14);
    }

    #[tokio::test]
    async fn test_send_enveloped() {
        let pool = BufferPool::new(&[64]);
        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet()
            .withf(|to, buf| *to == addr(1) && buf.len() == 30 && buf[..16] == *b"DARK\xff\xff\xff\xfd\0\0\0\x12\0\0\0\x02")
            .once()
            .returning(|_, _| Ok(()));

        let mut pipeline = SendPipeline::new(Arc::new(socket), pool.acquire(64).unwrap());
        let msg = message(&pool, &[5, 6], DeliveryClass::OrderedUnreliable);
        let sequence = SequenceNumber::FIRST.next();
        assert_eq!(pipeline.send_message(addr(1), &msg, Some(sequence)).await.unwrap(), 30);
    }

    #[tokio::test]
    async fn test_send_error_is_returned() {
        let pool = BufferPool::new(&[64]);
        let mut socket = MockSendSocket::new();
        socket.expect_do_send_packet()
            .returning(|_, _| Err(std::io::Error::other("unreachable")));

        let mut pipeline = SendPipeline::new(Arc::new(socket), pool.acquire(64).unwrap());
        let msg = message(&pool, &[1], DeliveryClass::UnorderedUnreliable);
        assert!(pipeline.send_message(addr(1), &msg, None).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_message_is_not_sent() {
        let pool = BufferPool::new(&[16, 64]);
        let socket = MockSendSocket::new();

        let mut pipeline = SendPipeline::new(Arc::new(socket), pool.acquire(16).unwrap());
        let msg = message(&pool, &[0; 10], DeliveryClass::UnorderedUnreliable);
        assert!(pipeline.send_message(addr(1), &msg, None).await.is_err());
    }

    #[test]
    fn test_outbox_purge() {
        let pool = BufferPool::new(&[64]);
        let outbox = Outbox::default();
        let ping = || Message::control(&pool, PacketKind::Ping, 8, |b| b.put_u64(1)).unwrap();

        let a = ConnectionId::for_addr(addr(1));
        let b = ConnectionId::for_addr(addr(2));
        outbox.push(a, addr(1), ping());
        outbox.push(b, addr(2), ping());
        outbox.push(a, addr(1), ping());
        assert_eq!(pool.in_use_count(64), 3);

        outbox.purge(a);
        assert_eq!(outbox.len(), 1);
        assert_eq!(pool.in_use_count(64), 1);

        let drained = outbox.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].connection, b);
        assert!(outbox.is_empty());
    }
}
