use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use anyhow::bail;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};
use crate::buffers::Pools;
use crate::config::TransportConfig;
use crate::control_messages::{FragmentHeader, ReliableAck};
use crate::message::{DeliveryClass, Message};
use crate::packet_header::PacketKind;
use crate::receive_tracking::ReceiveTracking;
use crate::send_tracking::SendTracking;
use crate::sequence::{SendId, SequenceNumber};

#[derive(Default)]
struct SendTable {
    records: FxHashMap<SendId, SendTracking>,
    /// send ids in the order their messages were queued
    order: VecDeque<SendId>,
    last_unordered: SequenceNumber,
    last_ordered: SequenceNumber,
    /// set by teardown, no new records are created afterwards
    closed: bool,
}

struct ReceiveTable {
    records: FxHashMap<SendId, ReceiveTracking>,
    /// the highest send id per class for which a record was created
    unordered_cursor: SequenceNumber,
    ordered_cursor: SequenceNumber,
    /// the next ordered message to be delivered
    next_ordered_delivery: SequenceNumber,
    /// Completed ordered messages waiting for their predecessors. `None` marks a message that
    ///  completed but can not be delivered, so it does not block its successors.
    out_of_order: FxHashMap<SequenceNumber, Option<Message>>,
    closed: bool,
}

impl Default for ReceiveTable {
    fn default() -> Self {
        ReceiveTable {
            records: FxHashMap::default(),
            unordered_cursor: SequenceNumber::ZERO,
            ordered_cursor: SequenceNumber::ZERO,
            next_ordered_delivery: SequenceNumber::FIRST,
            out_of_order: FxHashMap::default(),
            closed: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct ServiceOutcome {
    /// fragment datagrams to be queued on the connection
    pub fragments: Vec<Message>,
    /// bytes of chunk data that were sent before and not acknowledged in time
    pub retransmitted_bytes: usize,
}

#[derive(Debug)]
pub struct FragmentOutcome {
    /// to be sent back to the peer, regardless of whether the fragment was new
    pub ack: ReliableAck,
    /// messages that became deliverable through this fragment, in delivery order
    pub delivered: Vec<Message>,
}

/// Reliable delivery for a single connection: splits outgoing reliable messages into chunks and
///  re-sends them until they are acknowledged, and reassembles incoming ones, restoring send order
///  for ordered reliable messages.
///
/// The send table and the receive table have separate locks, and all operations except
///  `teardown()` take only one of them.
pub struct ReliableMessageHandler {
    pools: Arc<Pools>,
    chunk_size: usize,
    receive_window: u32,
    send: Mutex<SendTable>,
    receive: Mutex<ReceiveTable>,
}

impl ReliableMessageHandler {
    pub fn new(pools: Arc<Pools>, config: &TransportConfig) -> ReliableMessageHandler {
        ReliableMessageHandler {
            pools,
            chunk_size: config.chunk_size,
            receive_window: config.reliable_receive_window,
            send: Default::default(),
            receive: Default::default(),
        }
    }

    /// Register a reliable message for sending, assigning it the next send id of its class.
    pub fn queue(&self, message: Arc<Message>) -> anyhow::Result<SendId> {
        let delivery = message.delivery();
        if !delivery.is_reliable() {
            bail!("this is a bug: {:?} message passed to reliable message handler", delivery);
        }

        let mut table = self.send.lock().unwrap();
        if table.closed {
            bail!("reliable message handler was torn down");
        }

        let mut record = self.pools.send_tracking.acquire();
        record.setup(message, self.chunk_size);

        let send_id = if delivery == DeliveryClass::OrderedReliable {
            table.last_ordered = table.last_ordered.next();
            SendId::Ordered(table.last_ordered)
        }
        else {
            table.last_unordered = table.last_unordered.next();
            SendId::Unordered(table.last_unordered)
        };

        trace!("queueing reliable message {} with {} chunks", send_id, record.num_chunks());
        table.records.insert(send_id, record);
        table.order.push_back(send_id);
        Ok(send_id)
    }

    /// Produce fragments for chunks that are due, oldest message first, until fragments of at
    ///  least `budget` bytes are produced or nothing is due. Messages that were fully acknowledged
    ///  are removed first.
    pub fn service(&self, now: Instant, resend_after: Duration, budget: usize) -> anyhow::Result<ServiceOutcome> {
        let mut outcome = ServiceOutcome::default();

        let mut guard = self.send.lock().unwrap();
        let table = &mut *guard;

        let records = &mut table.records;
        let pools = &self.pools;
        table.order.retain(|send_id| {
            let is_finished = match records.get(send_id) {
                Some(r) => r.is_finished(),
                None => return false,
            };
            if is_finished {
                trace!("reliable message {} was fully acknowledged", send_id);
                if let Some(r) = records.remove(send_id) {
                    pools.send_tracking.release(r);
                }
            }
            !is_finished
        });

        let mut produced = 0;
        'records: for send_id in &table.order {
            let Some(record) = table.records.get_mut(send_id) else {
                continue;
            };
            let total_len = record.message().map(|m| m.len()).unwrap_or(0);

            while produced < budget {
                let Some(chunk) = record.next_chunk(now, resend_after) else {
                    continue 'records;
                };

                let header = FragmentHeader {
                    send_id: *send_id,
                    part_id: chunk.part_id,
                    total_len,
                };
                let fragment = Message::control(
                    &self.pools.buffers,
                    PacketKind::ReliableFragment,
                    FragmentHeader::SERIALIZED_LEN + chunk.range.len(),
                    |buf| {
                        header.ser(buf);
                        record.write_chunk(&chunk.range, buf);
                    })?;

                if chunk.is_retransmit {
                    outcome.retransmitted_bytes += chunk.range.len();
                }
                produced += fragment.datagram_len();
                outcome.fragments.push(fragment);
            }
            break;
        }

        Ok(outcome)
    }

    /// Returns `true` if the ACK was for a chunk that was not acknowledged before
    pub fn handle_ack(&self, ack: &ReliableAck) -> bool {
        let mut table = self.send.lock().unwrap();
        match table.records.get_mut(&ack.send_id) {
            Some(record) => record.on_ack(ack.part_id),
            None => false,
        }
    }

    /// Process an incoming fragment, returning the ACK to send back and the messages that can now
    ///  be delivered. Every fragment with a valid header is acknowledged, including duplicates and
    ///  fragments that are dropped, so the sender stops retransmitting them. Returns `None` only
    ///  if the header can not be parsed.
    pub fn handle_fragment(&self, payload: &[u8]) -> Option<FragmentOutcome> {
        let (header, chunk) = match FragmentHeader::deser(payload) {
            Ok(x) => x,
            Err(e) => {
                trace!("dropping malformed fragment: {}", e);
                return None;
            }
        };

        Some(FragmentOutcome {
            ack: ReliableAck {
                send_id: header.send_id,
                part_id: header.part_id,
            },
            delivered: self.absorb_fragment(&header, chunk),
        })
    }

    fn absorb_fragment(&self, header: &FragmentHeader, chunk: &[u8]) -> Vec<Message> {
        let send_id = header.send_id;

        let mut guard = self.receive.lock().unwrap();
        let table = &mut *guard;
        if table.closed {
            trace!("fragment for reliable message {} after teardown - dropping", send_id);
            return Vec::new();
        }

        if !table.records.contains_key(&send_id) {
            let cursor = if send_id.is_ordered() {
                &mut table.ordered_cursor
            }
            else {
                &mut table.unordered_cursor
            };

            let distance = send_id.sequence().distance(*cursor);
            if distance <= 0 {
                trace!("fragment for reliable message {} that was already completed", send_id);
                return Vec::new();
            }
            if distance > self.receive_window as i64 {
                debug!("fragment for reliable message {} is {} messages ahead - dropping", send_id, distance);
                return Vec::new();
            }

            // messages between the cursor and this one are still in flight
            while *cursor != send_id.sequence() {
                *cursor = cursor.next();
                table.records.insert(send_id.with_sequence(*cursor), self.pools.receive_tracking.acquire());
            }
        }

        let Some(record) = table.records.get_mut(&send_id) else {
            return Vec::new();
        };

        if !record.is_set_up() {
            if let Err(e) = record.setup(header.total_len, self.chunk_size, &self.pools.buffers) {
                warn!("discarding reliable message {}: {}", send_id, e);
                return self.complete(table, send_id, None);
            }
        }

        match record.absorb(header.part_id, header.total_len, chunk) {
            Ok(true) => {}
            Ok(false) => {
                trace!("duplicate fragment {} of reliable message {}", header.part_id, send_id);
                return Vec::new();
            }
            Err(e) => {
                warn!("dropping fragment of reliable message {}: {}", send_id, e);
                return Vec::new();
            }
        }

        if !record.is_complete() {
            return Vec::new();
        }

        let delivery = if send_id.is_ordered() {
            DeliveryClass::OrderedReliable
        }
        else {
            DeliveryClass::UnorderedReliable
        };
        let message = match record.take_message(delivery) {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!("discarding reliable message {}: {}", send_id, e);
                None
            }
        };
        self.complete(table, send_id, message)
    }

    /// Remove a record that is done with, and return what can be delivered as a consequence
    fn complete(&self, table: &mut ReceiveTable, send_id: SendId, message: Option<Message>) -> Vec<Message> {
        if let Some(record) = table.records.remove(&send_id) {
            self.pools.receive_tracking.release(record);
        }

        if !send_id.is_ordered() {
            return message.into_iter().collect();
        }

        table.out_of_order.insert(send_id.sequence(), message);
        let mut delivered = Vec::new();
        while let Some(entry) = table.out_of_order.remove(&table.next_ordered_delivery) {
            delivered.extend(entry);
            table.next_ordered_delivery = table.next_ordered_delivery.next();
        }
        delivered
    }

    /// Release all pending state when the connection is dropped. Afterwards fragments are still
    ///  acknowledged, but nothing new is tracked.
    pub fn teardown(&self) {
        let mut send = self.send.lock().unwrap();
        let mut receive = self.receive.lock().unwrap();

        let num_send = send.records.len();
        let num_receive = receive.records.len();

        for (_, record) in send.records.drain() {
            self.pools.send_tracking.release(record);
        }
        *send = SendTable {
            closed: true,
            ..Default::default()
        };

        for (_, record) in receive.records.drain() {
            self.pools.receive_tracking.release(record);
        }
        *receive = ReceiveTable {
            closed: true,
            ..Default::default()
        };

        debug!("reliable message handler torn down, discarding {} outgoing and {} incoming messages", num_send, num_receive);
    }

    /// number of outgoing messages that were not yet removed after being fully acknowledged
    pub fn pending_sends(&self) -> usize {
        self.send.lock().unwrap().records.len()
    }

    /// number of incoming messages that are incomplete, including placeholders
    pub fn pending_receives(&self) -> usize {
        self.receive.lock().unwrap().records.len()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    const RESEND_AFTER: Duration = Duration::from_millis(15);

    fn setup() -> (Arc<Pools>, ReliableMessageHandler, ReliableMessageHandler) {
        let config = TransportConfig::default();
        let pools = Pools::new(&config);
        let sender = ReliableMessageHandler::new(pools.clone(), &config);
        let receiver = ReliableMessageHandler::new(pools.clone(), &config);
        (pools, sender, receiver)
    }

    fn message(pools: &Pools, message_type: i32, len: usize, delivery: DeliveryClass) -> Arc<Message> {
        let mut msg = Message::new(&pools.buffers, message_type, len, delivery).unwrap();
        for (i, b) in msg.payload_mut().iter_mut().enumerate() {
            *b = (i % 253) as u8;
        }
        Arc::new(msg)
    }

    fn fragment_header(fragment: &Message) -> FragmentHeader {
        FragmentHeader::deser(fragment.payload()).unwrap().0
    }

    fn fragment_ack(fragment: &Message) -> ReliableAck {
        let header = fragment_header(fragment);
        ReliableAck { send_id: header.send_id, part_id: header.part_id }
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(499)]
    #[case(500)]
    #[case(501)]
    #[case(5_242_868)]
    fn test_transfer(#[case] len: usize) {
        let (pools, sender, receiver) = setup();
        let now = Instant::now();

        let send_id = sender.queue(message(&pools, 9, len, DeliveryClass::UnorderedReliable)).unwrap();
        assert_eq!(send_id, SendId::Unordered(SequenceNumber::FIRST));

        let outcome = sender.service(now, RESEND_AFTER, usize::MAX).unwrap();
        assert_eq!(outcome.fragments.len(), (len + 4).div_ceil(500));
        assert_eq!(outcome.retransmitted_bytes, 0);

        let mut delivered = Vec::new();
        for fragment in &outcome.fragments {
            assert_eq!(fragment.kind(), PacketKind::ReliableFragment);
            let result = receiver.handle_fragment(fragment.payload()).unwrap();
            assert!(sender.handle_ack(&result.ack));
            delivered.extend(result.delivered);
        }

        assert_eq!(delivered.len(), 1);
        let msg = &delivered[0];
        assert_eq!(msg.message_type(), 9);
        assert_eq!(msg.delivery(), DeliveryClass::UnorderedReliable);
        assert_eq!(msg.len(), len);
        assert!(msg.payload().iter().enumerate().all(|(i, &b)| b == (i % 253) as u8));
        assert_eq!(receiver.pending_receives(), 0);

        // the finished record is removed on the next pass
        assert_eq!(sender.pending_sends(), 1);
        let outcome = sender.service(now + Duration::from_secs(1), RESEND_AFTER, usize::MAX).unwrap();
        assert!(outcome.fragments.is_empty());
        assert_eq!(sender.pending_sends(), 0);
    }

    #[test]
    fn test_ordered_delivery() {
        let (pools, sender, receiver) = setup();
        for message_type in 1..=3 {
            sender.queue(message(&pools, message_type, 10, DeliveryClass::OrderedReliable)).unwrap();
        }
        let fragments = sender.service(Instant::now(), RESEND_AFTER, usize::MAX).unwrap().fragments;
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragment_header(&fragments[1]).send_id, SendId::Ordered(SequenceNumber::FIRST.next()));

        let delivered_types = |idx: usize| {
            receiver.handle_fragment(fragments[idx].payload()).unwrap()
                .delivered.iter()
                .map(|m| m.message_type())
                .collect::<Vec<_>>()
        };

        assert_eq!(delivered_types(1), Vec::<i32>::new());
        assert_eq!(delivered_types(0), vec![1, 2]);
        assert_eq!(delivered_types(2), vec![3]);
    }

    #[test]
    fn test_send_ids_across_wrap() {
        let (pools, sender, receiver) = setup();
        let before_max = SequenceNumber::from_raw(i32::MAX as u32 - 1).unwrap();
        {
            let mut send = sender.send.lock().unwrap();
            send.last_ordered = before_max;
            send.last_unordered = before_max;
        }
        {
            let mut receive = receiver.receive.lock().unwrap();
            receive.ordered_cursor = before_max;
            receive.unordered_cursor = before_max;
            receive.next_ordered_delivery = SequenceNumber::MAX;
        }

        for message_type in 1..=3 {
            sender.queue(message(&pools, message_type, 10, DeliveryClass::OrderedReliable)).unwrap();
        }
        for message_type in 4..=6 {
            sender.queue(message(&pools, message_type, 10, DeliveryClass::UnorderedReliable)).unwrap();
        }
        let fragments = sender.service(Instant::now(), RESEND_AFTER, usize::MAX).unwrap().fragments;
        let send_ids = fragments.iter()
            .map(|f| fragment_header(f).send_id)
            .collect::<Vec<_>>();
        let one = SequenceNumber::FIRST;
        assert_eq!(send_ids, vec![
            SendId::Ordered(SequenceNumber::MAX), SendId::Ordered(one), SendId::Ordered(one.next()),
            SendId::Unordered(SequenceNumber::MAX), SendId::Unordered(one), SendId::Unordered(one.next()),
        ]);

        let mut delivered = Vec::new();
        for idx in [2, 0, 1, 5, 3, 4] {
            let outcome = receiver.handle_fragment(fragments[idx].payload()).unwrap();
            assert_eq!(outcome.ack.send_id, send_ids[idx]);
            delivered.extend(outcome.delivered.iter().map(|m| m.message_type()));
        }
        assert_eq!(delivered, vec![1, 2, 3, 6, 4, 5]);
        assert_eq!(receiver.pending_receives(), 0);
    }

    #[test]
    fn test_unordered_delivered_immediately() {
        let (pools, sender, receiver) = setup();
        for message_type in 1..=2 {
            sender.queue(message(&pools, message_type, 10, DeliveryClass::UnorderedReliable)).unwrap();
        }
        let fragments = sender.service(Instant::now(), RESEND_AFTER, usize::MAX).unwrap().fragments;

        let second = receiver.handle_fragment(fragments[1].payload()).unwrap();
        assert_eq!(second.delivered.len(), 1);
        assert_eq!(second.delivered[0].message_type(), 2);
        // a placeholder for the first message
        assert_eq!(receiver.pending_receives(), 1);

        let first = receiver.handle_fragment(fragments[0].payload()).unwrap();
        assert_eq!(first.delivered[0].message_type(), 1);
        assert_eq!(receiver.pending_receives(), 0);
    }

    #[test]
    fn test_duplicates() {
        let (pools, sender, receiver) = setup();
        sender.queue(message(&pools, 1, 700, DeliveryClass::UnorderedReliable)).unwrap();
        let fragments = sender.service(Instant::now(), RESEND_AFTER, usize::MAX).unwrap().fragments;
        assert_eq!(fragments.len(), 2);

        let first = receiver.handle_fragment(fragments[0].payload()).unwrap();
        let dup = receiver.handle_fragment(fragments[0].payload()).unwrap();
        assert_eq!(first.ack, dup.ack);
        assert!(dup.delivered.is_empty());

        assert!(sender.handle_ack(&first.ack));
        assert!(!sender.handle_ack(&dup.ack));

        let last = receiver.handle_fragment(fragments[1].payload()).unwrap();
        assert_eq!(last.delivered.len(), 1);
        assert!(sender.handle_ack(&last.ack));

        // a duplicate after completion is ACKed, but neither delivered nor tracked
        let late = receiver.handle_fragment(fragments[1].payload()).unwrap();
        assert!(late.delivered.is_empty());
        assert_eq!(receiver.pending_receives(), 0);
    }

    #[test]
    fn test_part_beyond_max_is_dropped() {
        let (pools, sender, receiver) = setup();
        sender.queue(message(&pools, 1, 10, DeliveryClass::UnorderedReliable)).unwrap();
        let fragments = sender.service(Instant::now(), RESEND_AFTER, usize::MAX).unwrap().fragments;

        let mut bogus = Vec::new();
        FragmentHeader { send_id: SendId::Unordered(SequenceNumber::FIRST), part_id: 5, total_len: 10 }.ser(&mut bogus);
        bogus.extend_from_slice(&[0; 14]);

        let outcome = receiver.handle_fragment(&bogus).unwrap();
        assert_eq!(outcome.ack.part_id, 5);
        assert!(outcome.delivered.is_empty());

        let outcome = receiver.handle_fragment(fragments[0].payload()).unwrap();
        assert_eq!(outcome.delivered.len(), 1);
    }

    #[test]
    fn test_malformed_header_is_not_acked() {
        let (_, _, receiver) = setup();
        assert!(receiver.handle_fragment(&[0, 0, 0, 1, 0, 0]).is_none());
        assert!(receiver.handle_fragment(&[0; 12]).is_none());
    }

    #[test]
    fn test_outside_window_is_dropped() {
        let (_, _, receiver) = setup();
        let mut fragment = Vec::new();
        let far = SequenceNumber::from_raw(70_000).unwrap();
        FragmentHeader { send_id: SendId::Unordered(far), part_id: 0, total_len: 0 }.ser(&mut fragment);
        fragment.extend_from_slice(&[0, 0, 0, 1]);

        let outcome = receiver.handle_fragment(&fragment).unwrap();
        assert_eq!(outcome.ack.send_id, SendId::Unordered(far));
        assert!(outcome.delivered.is_empty());
        assert_eq!(receiver.pending_receives(), 0);
    }

    #[test]
    fn test_retransmission() {
        let (pools, sender, _) = setup();
        let now = Instant::now();
        sender.queue(message(&pools, 1, 996, DeliveryClass::UnorderedReliable)).unwrap();

        assert_eq!(sender.service(now, RESEND_AFTER, usize::MAX).unwrap().fragments.len(), 2);
        assert!(sender.service(now + Duration::from_millis(5), RESEND_AFTER, usize::MAX).unwrap().fragments.is_empty());

        sender.handle_ack(&ReliableAck { send_id: SendId::Unordered(SequenceNumber::FIRST), part_id: 0 });
        let outcome = sender.service(now + RESEND_AFTER, RESEND_AFTER, usize::MAX).unwrap();
        assert_eq!(outcome.fragments.len(), 1);
        assert_eq!(fragment_header(&outcome.fragments[0]).part_id, 1);
        assert_eq!(outcome.retransmitted_bytes, 500);
    }

    #[test]
    fn test_budget() {
        let (pools, sender, _) = setup();
        sender.queue(message(&pools, 1, 5000, DeliveryClass::UnorderedReliable)).unwrap();

        // fragments are 12 + 12 + 500 bytes on the wire
        let outcome = sender.service(Instant::now(), RESEND_AFTER, 1000).unwrap();
        assert_eq!(outcome.fragments.len(), 2);
        let outcome = sender.service(Instant::now(), RESEND_AFTER, 0).unwrap();
        assert!(outcome.fragments.is_empty());
    }

    #[test]
    fn test_teardown_releases_everything() {
        let (pools, sender, receiver) = setup();
        let free_before = pools.buffers.free_count(2048);

        sender.queue(message(&pools, 1, 100_000, DeliveryClass::OrderedReliable)).unwrap();
        sender.queue(message(&pools, 2, 10, DeliveryClass::UnorderedReliable)).unwrap();
        let fragments = sender.service(Instant::now(), RESEND_AFTER, usize::MAX).unwrap().fragments;
        // partial transfer of the first message
        for fragment in fragments.iter().skip(1).take(10) {
            receiver.handle_fragment(fragment.payload()).unwrap();
        }
        drop(fragments);
        assert_eq!(receiver.pending_receives(), 1);

        sender.teardown();
        receiver.teardown();

        assert_eq!((sender.pending_sends(), receiver.pending_receives()), (0, 0));
        for class in pools.buffers.size_classes() {
            assert_eq!(pools.buffers.in_use_count(class), 0, "size class {}", class);
        }
        assert!(pools.buffers.free_count(2048) >= free_before);
        assert_eq!(pools.send_tracking.in_use_count(), 0);
        assert_eq!(pools.receive_tracking.in_use_count(), 0);

    }

    #[test]
    fn test_nothing_is_tracked_after_teardown() {
        let (pools, sender, receiver) = setup();
        let other = ReliableMessageHandler::new(pools.clone(), &TransportConfig::default());
        other.queue(message(&pools, 1, 1000, DeliveryClass::OrderedReliable)).unwrap();
        let fragments = other.service(Instant::now(), RESEND_AFTER, usize::MAX).unwrap().fragments;
        other.teardown();

        sender.teardown();
        receiver.teardown();

        assert!(sender.queue(message(&pools, 1, 10, DeliveryClass::OrderedReliable)).is_err());
        assert_eq!(sender.pending_sends(), 0);

        // a late fragment is still acknowledged
        let outcome = receiver.handle_fragment(fragments[1].payload()).unwrap();
        assert_eq!(outcome.ack, fragment_ack(&fragments[1]));
        assert!(outcome.delivered.is_empty());
        assert_eq!(receiver.pending_receives(), 0);

        drop(fragments);
        assert_eq!(pools.send_tracking.in_use_count(), 0);
        assert_eq!(pools.receive_tracking.in_use_count(), 0);
        for class in pools.buffers.size_classes() {
            assert_eq!(pools.buffers.in_use_count(class), 0, "size class {}", class);
        }
    }

    #[test]
    fn test_rejects_unreliable() {
        let (pools, sender, _) = setup();
        assert!(sender.queue(message(&pools, 1, 10, DeliveryClass::OrderedUnreliable)).is_err());
    }
}
