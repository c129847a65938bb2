use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use crate::buffers::Pools;
use crate::config::TransportConfig;
use crate::message::Message;
use crate::rate_control::RateController;
use crate::reliable_handler::ReliableMessageHandler;
use crate::rolling_data::RollingLatency;
use crate::sequence::SequenceNumber;

/// Identifies a peer by its address: the IPv6 address (IPv4 addresses as v4-mapped IPv6) with the
///  port folded into the first two bytes. For IPv4 peers this is unique, since those two bytes are
///  zero in a v4-mapped address.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Debug)]
pub struct ConnectionId(u128);

impl ConnectionId {
    pub fn for_addr(addr: SocketAddr) -> ConnectionId {
        let ip = match addr.ip() {
            IpAddr::V4(ip) => ip.to_ipv6_mapped(),
            IpAddr::V6(ip) => ip,
        };
        let mut octets = ip.octets();
        let port = addr.port().to_be_bytes();
        octets[0] ^= port[0];
        octets[1] ^= port[1];
        ConnectionId(u128::from_be_bytes(octets))
    }

    pub fn to_raw(&self) -> u128 {
        self.0
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// a client's connection to a server that did not send anything yet
    Connecting,
    Active,
    Disconnected,
}

struct Liveness {
    state: ConnectionState,
    last_receive: Instant,
    last_ping: Option<Instant>,
    /// the time of the first send error since the last datagram was received
    error_since: Option<Instant>,
    /// set once the peer was heard from, i.e. the application knows about this connection
    was_active: bool,
}

#[derive(Default)]
struct SendQueue {
    items: VecDeque<Arc<Message>>,
    bytes: usize,
}

/// State of the communication with a single peer. `S` is application state that is created by
///  the connect callback.
pub struct Connection<S> {
    id: ConnectionId,
    remote_addr: SocketAddr,
    config: Arc<TransportConfig>,
    user_state: OnceLock<S>,

    liveness: Mutex<Liveness>,
    queue: Mutex<SendQueue>,
    rate: Mutex<RateController>,
    latency: Mutex<RollingLatency<60>>,
    last_ordered_sent: Mutex<SequenceNumber>,
    last_ordered_received: Mutex<SequenceNumber>,
    reliable: ReliableMessageHandler,
}

impl<S: Send + Sync + 'static> Connection<S> {
    pub(crate) fn new(remote_addr: SocketAddr, state: ConnectionState, config: Arc<TransportConfig>, pools: Arc<Pools>, now: Instant) -> Connection<S> {
        Connection {
            id: ConnectionId::for_addr(remote_addr),
            remote_addr,
            user_state: OnceLock::new(),
            liveness: Mutex::new(Liveness {
                state,
                last_receive: now,
                last_ping: None,
                error_since: None,
                was_active: false,
            }),
            queue: Default::default(),
            rate: Mutex::new(RateController::new(&config, now)),
            latency: Default::default(),
            last_ordered_sent: Mutex::new(SequenceNumber::ZERO),
            last_ordered_received: Mutex::new(SequenceNumber::ZERO),
            reliable: ReliableMessageHandler::new(pools, &config),
            config,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.liveness.lock().unwrap().state
    }

    /// the state returned by the connect callback, once that was called
    pub fn user_state(&self) -> Option<&S> {
        self.user_state.get()
    }

    /// the most recent round trip time
    pub fn latency(&self) -> Duration {
        self.latency.lock().unwrap().latest()
    }

    pub fn average_latency(&self) -> Duration {
        self.latency.lock().unwrap().mean()
    }

    /// current send speed in bytes per second
    pub fn speed(&self) -> u64 {
        self.rate.lock().unwrap().speed()
    }

    /// bytes waiting in this connection's send queue
    pub fn queued_bytes(&self) -> usize {
        self.queue.lock().unwrap().bytes
    }

    pub fn reliable(&self) -> &ReliableMessageHandler {
        &self.reliable
    }

    /// Called after the connect callback, with the application state it returned. Returns `false`
    ///  if the connection was dropped in the meantime.
    pub(crate) fn on_connected(&self, user_state: S) -> bool {
        let _ = self.user_state.set(user_state);
        self.state() != ConnectionState::Disconnected
    }

    /// Returns `true` if this is the first datagram received from the peer
    pub(crate) fn on_receive(&self, now: Instant) -> bool {
        let mut liveness = self.liveness.lock().unwrap();
        liveness.last_receive = now;
        liveness.error_since = None;
        if liveness.state == ConnectionState::Connecting {
            debug!("connection to {:?} is active", self.remote_addr);
            liveness.state = ConnectionState::Active;
            liveness.was_active = true;
            return true;
        }
        false
    }

    pub(crate) fn on_send_error(&self, now: Instant) {
        let mut liveness = self.liveness.lock().unwrap();
        if liveness.error_since.is_none() {
            debug!("send error on connection to {:?}: dropping it unless the peer responds", self.remote_addr);
            liveness.error_since = Some(now);
        }
    }

    pub(crate) fn is_timed_out(&self, now: Instant) -> bool {
        let liveness = self.liveness.lock().unwrap();
        if now.saturating_duration_since(liveness.last_receive) > self.config.connection_timeout {
            return true;
        }
        match liveness.error_since {
            Some(t) => now.saturating_duration_since(t) >= self.config.error_timeout,
            None => false,
        }
    }

    /// Returns `true` if a ping should be sent now, and if so, records it as sent
    pub(crate) fn ping_due(&self, now: Instant) -> bool {
        let mut liveness = self.liveness.lock().unwrap();
        let due = match liveness.last_ping {
            None => true,
            Some(t) => now.saturating_duration_since(t) > self.config.heartbeat_interval,
        };
        if due {
            liveness.last_ping = Some(now);
        }
        due
    }

    /// Move the connection to `Disconnected`. Returns `true` if the application must be notified,
    ///  i.e. if the connection was not disconnected before and the peer was heard from.
    pub(crate) fn disconnect(&self) -> bool {
        let mut liveness = self.liveness.lock().unwrap();
        if liveness.state == ConnectionState::Disconnected {
            return false;
        }
        liveness.state = ConnectionState::Disconnected;
        liveness.was_active
    }

    pub(crate) fn record_latency(&self, sample: Duration) {
        trace!("latency to {:?}: {:?}", self.remote_addr, sample);
        self.latency.lock().unwrap().add_sample(sample);
    }

    fn latency_floor(&self, latency: Duration) -> Duration {
        latency.max(self.config.min_latency)
    }

    /// how long an unacknowledged chunk waits before it is sent again
    pub(crate) fn resend_after(&self) -> Duration {
        self.latency_floor(self.average_latency())
            .mul_f64(self.config.resend_latency_factor)
    }

    pub(crate) fn enqueue(&self, message: Arc<Message>) {
        let mut queue = self.queue.lock().unwrap();
        queue.bytes += message.wire_len();
        queue.items.push_back(message);
    }

    /// Take the next message from the send queue if it may be sent now. Unreliable messages need
    ///  tokens for their wire size, and if there are not enough the queue pauses (returning
    ///  `None`) to preserve order.
    pub(crate) fn next_to_send(&self, now: Instant) -> Option<Arc<Message>> {
        let mut queue = self.queue.lock().unwrap();
        let front = queue.items.front()?;

        if !front.delivery().is_reliable() {
            let mut rate = self.rate.lock().unwrap();
            if !rate.try_consume(front.wire_len(), now) {
                return None;
            }
        }

        let message = queue.items.pop_front()?;
        queue.bytes = queue.bytes.saturating_sub(message.wire_len());
        Some(message)
    }

    pub(crate) fn on_sent(&self, bytes: usize) {
        self.rate.lock().unwrap().on_sent(bytes);
    }

    /// Next sequence number for an ordered unreliable message
    pub(crate) fn next_ordered_sequence(&self) -> SequenceNumber {
        let mut last = self.last_ordered_sent.lock().unwrap();
        *last = last.next();
        *last
    }

    /// Returns `true` if an ordered unreliable message with this sequence number is newer than
    ///  the last one that was accepted, and if so, records it as the last accepted
    pub(crate) fn accept_ordered(&self, sequence: SequenceNumber) -> bool {
        let mut last = self.last_ordered_received.lock().unwrap();
        if sequence.is_newer_than(*last) {
            *last = sequence;
            true
        }
        else {
            false
        }
    }

    /// Per-tick maintenance of the sending side: adjust the speed, and produce fragments of
    ///  reliable messages while the send queue is below its limit.
    pub(crate) fn service(&self, now: Instant) -> anyhow::Result<()> {
        let interval = self.latency_floor(self.latency());
        self.rate.lock().unwrap().update(now, interval);

        let budget = self.config.reliable_queue_limit.saturating_sub(self.queued_bytes());
        if budget == 0 {
            return Ok(());
        }

        let outcome = self.reliable.service(now, self.resend_after(), budget)?;
        if outcome.retransmitted_bytes > 0 {
            self.rate.lock().unwrap().on_retransmit(outcome.retransmitted_bytes);
        }

        if !outcome.fragments.is_empty() {
            let mut queue = self.queue.lock().unwrap();
            for fragment in outcome.fragments {
                queue.bytes += fragment.wire_len();
                queue.items.push_back(Arc::new(fragment));
            }
        }
        Ok(())
    }

    /// Release everything this connection holds
    pub(crate) fn teardown(&self) {
        self.reliable.teardown();

        let dropped = std::mem::take(&mut *self.queue.lock().unwrap());
        debug!("connection to {:?} torn down, discarding {} queued messages", self.remote_addr, dropped.items.len());
        drop(dropped);

        self.latency.lock().unwrap().clear();
        *self.last_ordered_sent.lock().unwrap() = SequenceNumber::ZERO;
        *self.last_ordered_received.lock().unwrap() = SequenceNumber::ZERO;
    }
}
